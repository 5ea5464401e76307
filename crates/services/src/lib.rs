#![forbid(unsafe_code)]

pub mod background;
pub mod config;
pub mod discovery;
pub mod error;
pub mod items;
pub mod review;
pub mod study;

pub use kioku_core::Clock;

pub use background::{BackgroundTasks, LevelUnlock, LevelUnlockTask, TaskReport, TaskStatus};
pub use config::{ConfigError, StudySettings};
pub use discovery::{DiscoveryController, DiscoveryPhase};
pub use error::{BootstrapError, SessionError};
pub use items::ItemBuilder;
pub use review::{AnswerFeedback, PendingFlush, ReviewQueueController};
pub use study::{AnswerResponse, ReviewFilters, StartedBatch, StartedSession, StudyService};
