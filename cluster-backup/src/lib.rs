//! Cluster Backup Library
//!
//! Consistent, incremental snapshots of git repository storage spread
//! across the nodes of a clustered appliance.

pub mod config;
pub mod executor;
pub mod negotiate;
pub mod quiesce;
pub mod shutdown;
pub mod snapshot;
pub mod topology;
pub mod transfer;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupExecutor, BackupReport};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
