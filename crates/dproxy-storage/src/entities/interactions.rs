use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One archived exchange. JSON columns are stored as serialized text; this
/// process only ever writes, external curation tools read.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "interactions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: OffsetDateTime,
    pub model: String,
    pub source_provider: String,
    pub auth_scheme: String,
    pub conversations: String,
    pub tools: String,
    pub tool_calls: String,
    pub raw_request: String,
    pub raw_response: String,
    pub truncated: bool,
}

impl ActiveModelBehavior for ActiveModel {}
