//! # quarry-node
//! Node composition: configuration, logging and RocksDB storage.
//!
//! Wraps the chain engine from `quarry-chain` into a runnable node:
//! - [`config::NodeConfig`]: settings from defaults, a config file and `QUARRY_*` variables
//! - [`logging::init_logging`]: tracing subscriber setup (text or JSON)
//! - [`storage::RocksBlockStore`]: persistent block payloads and header log
//! - [`node::Node`]: single-writer handle over the chain with an async idle loop

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod storage;

pub use config::NodeConfig;
pub use error::NodeError;
pub use logging::init_logging;
pub use node::Node;
pub use storage::RocksBlockStore;
