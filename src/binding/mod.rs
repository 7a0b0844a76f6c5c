//! Bindings that tie an in-memory store to storage outside the process.

pub mod persister;
pub mod remote;
pub mod ws;

pub use persister::{LocalPersister, PersistFlush};
pub use remote::{Backoff, RemoteSynchronizer, SyncChannel, SyncStatus, SyncTransport};
pub use ws::WsSyncTransport;
