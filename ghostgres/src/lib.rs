//! Disposable PostgreSQL clusters for tests.
//!
//! A [`PostgresCluster`] wraps `initdb` and `postgres`; a [`TemplateStore`]
//! keeps frozen, initialized clusters around so each test can start from a
//! copy in milliseconds instead of re-running `initdb`.

pub mod cluster;
pub mod config;
pub mod copy;
pub mod error;
pub mod observer;
pub mod process;
pub mod template;
pub mod version;

// Re-export commonly used types
pub use cluster::{ClusterState, DEFAULT_PORT, OnDestroy, PostgresCluster};
pub use config::{
    ConfigOpt, logging_config, render_config, test_config, test_config_with_logging,
};
pub use error::{GhostgresError, Result, StateError};
pub use observer::FailureObserver;
pub use process::{ExitOutcome, ServerProcess, ShutdownMode};
pub use template::{TemplateId, TemplateStore};
pub use version::{parse_version, server_version};
