use quarry_core::error::{ChainError, StoreError};
use thiserror::Error;

/// Failures while bringing a node up or down.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("config: {0}")] Config(#[from] config::ConfigError),
    #[error("logging: {0}")] Logging(String),
    #[error("io: {0}")] Io(#[from] std::io::Error),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Chain(#[from] ChainError),
}
