pub mod config;
pub mod context;
pub mod error;
pub mod naming;

pub use config::MetricsConfig;
pub use context::{CallContext, CallMetadata};
pub use error::{MetricsError, Result};
