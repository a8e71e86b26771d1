// Sequence definitions: catalog lookup and due-step resolution

pub mod catalog;
pub mod due;

pub use catalog::SequenceCatalog;
pub use due::{due_step, is_due, DueStep};
