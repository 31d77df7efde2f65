use sea_orm::{
    ActiveValue, Database, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, Schema,
    TransactionTrait,
};

use dproxy_core::record::InteractionRecord;

use crate::entities;

#[derive(Clone)]
pub struct InteractionStore {
    db: DatabaseConnection,
}

impl InteractionStore {
    pub async fn connect(dsn: &str) -> Result<Self, DbErr> {
        let db = Database::connect(dsn).await?;
        Ok(Self { db })
    }

    /// Entity-first schema sync; creates the `interactions` table on first
    /// start.
    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Interactions)
            .sync(&self.db)
            .await
    }

    pub async fn insert_batch(&self, records: Vec<InteractionRecord>) -> Result<(), DbErr> {
        if records.is_empty() {
            return Ok(());
        }
        let models: Vec<entities::interactions::ActiveModel> =
            records.into_iter().map(active_model_from).collect();

        let result = self
            .db
            .transaction(move |txn| {
                Box::pin(async move {
                    entities::Interactions::insert_many(models).exec(txn).await?;
                    Ok(())
                })
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(sea_orm::TransactionError::Connection(err)) => Err(err),
            Err(sea_orm::TransactionError::Transaction(err)) => Err(err),
        }
    }

    pub async fn count(&self) -> Result<u64, DbErr> {
        entities::Interactions::find().count(&self.db).await
    }
}

fn active_model_from(record: InteractionRecord) -> entities::interactions::ActiveModel {
    entities::interactions::ActiveModel {
        id: ActiveValue::NotSet,
        created_at: ActiveValue::Set(record.created_at),
        model: ActiveValue::Set(record.model),
        source_provider: ActiveValue::Set(record.source_provider),
        auth_scheme: ActiveValue::Set(record.request_auth_scheme.as_str().to_string()),
        conversations: ActiveValue::Set(
            serde_json::to_string(&record.conversations).unwrap_or_else(|_| "[]".to_string()),
        ),
        tools: ActiveValue::Set(record.tools.to_string()),
        tool_calls: ActiveValue::Set(
            serde_json::to_string(&record.tool_calls).unwrap_or_else(|_| "[]".to_string()),
        ),
        raw_request: ActiveValue::Set(record.raw_request.to_string()),
        raw_response: ActiveValue::Set(record.raw_response.to_string()),
        truncated: ActiveValue::Set(record.truncated),
    }
}
