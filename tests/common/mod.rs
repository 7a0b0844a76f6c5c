mod fixtures;
mod mocks;
pub use fixtures::*;
pub use mocks::*;

// Re-export commonly used types from sitebook for tests
pub use sitebook::core::db::{
    QueueDb, ReceiptQueueEntry, ReceiptQueueRepository, ResourceType, ServerDeleteRecord,
    ServerDeleteRepository, UploadQueueEntry, UploadQueueRepository,
};
pub use sitebook::core::store::{Row, Store, StoreId, TableKind};
pub use sitebook::core::{ActiveEntityRegistry, ProjectInfo, StoreCache};
pub use sitebook::queue::{DrainReport, PassOutcome, SkipReason};
