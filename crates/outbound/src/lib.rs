pub mod config;
pub mod dispatch;
pub mod logging;
pub mod metrics;
pub mod queue;

pub use crate::config::{ConfigError, DispatchConfig, MxAuthConfig, QueueConfig, RetryConfig, Tls};
pub use crate::dispatch::{CollectingSink, DomainGroup, StatusSink};
pub use crate::metrics::DispatchMetrics;
pub use crate::queue::QueueController;
