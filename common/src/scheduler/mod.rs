// Scheduler module: tick loop that advances enrollments through their sequences

pub mod engine;

pub use engine::{Scheduler, SchedulerConfig, SchedulerDeps, SequenceScheduler, TickReport};
