//! Background scheduling: the fixed-delay trigger and the job scan it fires.

pub mod scan;
pub mod trigger;

pub use self::scan::JobScan;
pub use self::trigger::{PeriodicTask, PeriodicTrigger, TriggerConfig, TriggerHandle, TriggerStats};
