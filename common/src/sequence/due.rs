// Due-step resolution: pure function of enrollment, steps and time

use crate::models::{Enrollment, StepDefinition};
use chrono::{DateTime, Duration, Utc};

/// What the scheduler should do with an enrollment right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueStep {
    /// Every step has been sent; the enrollment must be removed
    Complete,
    /// The next step becomes due at `due_at`
    NotYet { index: usize, due_at: DateTime<Utc> },
    /// The step at `index` is due now
    Due { index: usize },
}

/// Decide whether the enrollment's next step is due at `now`
///
/// Due time is `started_at + steps[next_step_index].delay_minutes`. A step is due
/// when `now >= due_time`. An empty sequence is complete immediately.
pub fn due_step(enrollment: &Enrollment, steps: &[StepDefinition], now: DateTime<Utc>) -> DueStep {
    let index = enrollment.next_step_index as usize;

    let Some(step) = steps.get(index) else {
        return DueStep::Complete;
    };

    let due_at = enrollment.started_at + Duration::minutes(i64::from(step.delay_minutes));
    if now >= due_at {
        DueStep::Due { index }
    } else {
        DueStep::NotYet { index, due_at }
    }
}

/// Index of the due step, if any
pub fn is_due(enrollment: &Enrollment, steps: &[StepDefinition], now: DateTime<Utc>) -> Option<usize> {
    match due_step(enrollment, steps, now) {
        DueStep::Due { index } => Some(index),
        DueStep::Complete | DueStep::NotYet { .. } => None,
    }
}
