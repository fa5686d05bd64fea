pub mod certs;
pub mod network;
pub mod reconciler;
pub mod service;

pub use network::NetworkInspector;
pub use reconciler::{HandleKind, Reconciler};
pub use service::SyncService;
