pub mod accounting;
pub mod connectivity;
pub mod media;

pub use accounting::{AccountingClient, DisabledAccounting};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use media::{GeoPoint, HttpMediaClient, MediaClient, MediaTarget, UploadRequest, UploadResponse};
