pub mod batcher;
pub mod queue;
pub mod store;

pub use batcher::PersistenceBatcher;
pub use queue::{Enqueued, RecordQueue};
pub use store::{BatchStorage, JsonlStore};
