//! Infrastructure layer: job queue, result storage, journal generation, Postgres adapters.

pub mod config;
pub mod jobs;
pub mod journals;

pub use config::{ConfigError, JobQueueConfig};

/// Schema for the Postgres stores (`jobs`, journal and lookup tables).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
