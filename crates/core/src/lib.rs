#![forbid(unsafe_code)]

pub mod error;
pub mod model;
pub mod scheduler;
pub mod time;
pub mod validation;

pub use error::ValidationError;
pub use scheduler::{EngineConfig, ScheduledReview, SchedulingEngine};
pub use time::Clock;
