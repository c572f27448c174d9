//! Request scheduling for continuous batching.

pub mod batch;

pub use batch::{Scheduler, SchedulerOutput};
