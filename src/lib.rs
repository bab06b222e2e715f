pub mod chart;
pub mod config;
pub mod error;
pub mod server;
pub mod sim;
pub mod token_bucket;

pub use config::{BucketConfig, ServiceConfig};
pub use error::{Error, Result};
pub use token_bucket::{State, TokenBucket};
