pub mod aggregate;
pub mod cache;
pub mod db;
pub mod directory;
pub mod lifecycle;
pub mod registry;
pub mod store;

pub use cache::StoreCache;
pub use directory::{ProjectDirectory, ProjectInfo, TemplateItem};
pub use lifecycle::{LifecycleHandle, LifecycleSettings, ReconcileReport, StoreLifecycleController};
pub use registry::ActiveEntityRegistry;
