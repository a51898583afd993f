//! cadence - Multi-tenant send scheduler and throttled dispatch engine
//!
//! Plans when queued email jobs are allowed to go out and pushes them
//! through a rate-limited transport.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and types
//! - [`window`] - Send-window and quiet-hour calculations
//! - [`throttle`] - Trailing-minute rate and concurrency admission control
//! - [`store`] - Durable job and schedule state (SQLite, in-memory)
//! - [`dispatch`] - The tick loop, delivery and retry logic
//! - [`control`] - Schedule lifecycle operations
//! - [`telemetry`] - Queue aggregates, throughput and ETA
//! - [`api`] - REST control surface
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cadence::config::Config;
//! use cadence::dispatch::{transport::LoggingTransport, Dispatcher};
//! use cadence::store::{open_database, SqliteJobStore, SqliteScheduleStore};
//! use cadence::throttle::GovernorRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let conn = open_database(&config.database.sqlite_path)?;
//!     let dispatcher = Dispatcher::new(
//!         Arc::new(SqliteScheduleStore::new(conn.clone())),
//!         Arc::new(SqliteJobStore::new(conn)),
//!         Arc::new(LoggingTransport),
//!         Arc::new(GovernorRegistry::new()),
//!         config.dispatcher_config(),
//!     );
//!     dispatcher.tick().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod models;
pub mod store;
pub mod telemetry;
pub mod throttle;
pub mod window;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::control::ControlService;
    pub use crate::dispatch::{Dispatcher, DispatcherConfig};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{Job, JobStatus, Schedule, ScheduleStatus, TimeWindow};
    pub use crate::store::{JobStore, ScheduleStore};
    pub use crate::telemetry::TelemetryService;
    pub use crate::throttle::{Admission, GovernorRegistry, ThrottleGovernor};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{Job, JobStatus, Schedule, ScheduleStatus, TimeWindow};
