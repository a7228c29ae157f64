//! `cronkeep-core`: configuration, shared errors and the clock abstraction.

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CronkeepConfig;
pub use error::{CoreError, Result};
