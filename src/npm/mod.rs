pub mod client;
pub mod models;
pub mod urls;

pub use client::{NpmClient, NpmError, NpmResult};
pub use models::{Meta, MetaValue, ResourceKind};
pub use urls::normalize_url;
