//! Durable background queues and the schedule that drains them.

pub mod receipt;
pub mod scheduled;
pub mod server_delete;
pub mod upload;

pub use receipt::{ReceiptReplicationJob, replicate_to_target};
pub use scheduled::{DrainJob, DrainReport, PassOutcome, ScheduleHandle, ScheduledDrain, SkipReason};
pub use server_delete::ServerDeleteJob;
pub use upload::UploadRecoveryJob;
