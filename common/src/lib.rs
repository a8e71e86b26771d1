// Common library for the outreach sequence scheduler

pub mod config;
pub mod content;
pub mod db;
pub mod dispatch;
pub mod enrollment;
pub mod errors;
pub mod generation;
pub mod lock;
pub mod models;
pub mod scheduler;
pub mod sequence;
pub mod storage;
pub mod store;
pub mod substitution;
pub mod telemetry;
