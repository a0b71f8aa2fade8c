pub mod client;
pub mod error;
pub mod proxy;
pub mod types;

pub use client::PlatformClient;
pub use error::{PlatformError, PlatformOutcome, RefreshOutcome};
pub use proxy::ProxySpec;
