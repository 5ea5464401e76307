//! Shared error types for the services crate.

use thiserror::Error;

use kioku_core::ValidationError;
use kioku_core::model::UnitError;
use kioku_core::scheduler::SchedulerError;
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted by study sessions and the `StudyService` facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("nothing to study right now")]
    Empty,
    #[error("daily limit of {limit} lesson batches reached")]
    DailyLimitReached { limit: u32 },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Unit(#[from] UnitError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping the study service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BootstrapError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
