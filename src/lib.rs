pub mod core;
pub mod crawler;
pub mod harvester;
pub mod parser;
pub mod proxy;
pub mod storage;
pub mod validator;

// --- Primary exports ---
pub use crate::core::config::{Config, Selector, SourceConfig, Target, ValidatorConfig};
pub use crate::core::error::{ErrorCode, MultiError, ProbeError};
pub use crawler::Crawler;
pub use harvester::Harvester;
pub use parser::Parser;
pub use proxy::{Proxy, ProxyMetrics, RequestMetrics};
pub use storage::Storage;
pub use validator::Validator;
