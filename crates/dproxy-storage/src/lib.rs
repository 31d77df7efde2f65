pub mod entities;
pub mod store;
pub mod writer;

pub use store::InteractionStore;
pub use writer::{WriterConfig, dropped_batches, flush_remaining, spawn_writer};
