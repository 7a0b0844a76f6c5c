pub mod app;
pub mod binding;
pub mod config;
pub mod core;
pub mod error;
pub mod intake;
pub mod queue;
pub mod remote;
pub mod telemetry;

pub use app::App;
pub use config::AppConfig;
pub use error::{OpResult, OpStatus, TransportError};
