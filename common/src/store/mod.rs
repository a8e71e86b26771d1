// Enrollment store: the durable state the scheduler reads and advances

pub mod memory;
pub mod postgres;

pub use memory::InMemoryEnrollmentStore;
pub use postgres::PgEnrollmentStore;

use crate::errors::StorageError;
use crate::models::{AdvanceOutcome, Enrollment, Subject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence contract consumed by the scheduler
///
/// `compare_and_advance` must be atomic per (subject, trigger); it is what makes
/// recorded progress at-most-once when ticks overlap or several nodes run.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Snapshot of every subject with at least one active enrollment, including its
    /// enrollments and cached artifacts. May be up to one tick stale.
    async fn list_subjects_with_active_enrollments(&self) -> Result<Vec<Subject>, StorageError>;

    /// Current state of one enrollment, read fresh from the store
    async fn find_enrollment(
        &self,
        subject_id: Uuid,
        trigger: &str,
    ) -> Result<Option<Enrollment>, StorageError>;

    /// Move `next_step_index` from `expected` to `new` if it still equals `expected`.
    ///
    /// Rejects `new < expected` with `StorageError::InvalidTransition`.
    async fn compare_and_advance(
        &self,
        subject_id: Uuid,
        trigger: &str,
        expected: u32,
        new: u32,
    ) -> Result<AdvanceOutcome, StorageError>;

    /// Remove a terminal (or abandoned) enrollment. Removing a missing one is not an error.
    async fn remove_enrollment(&self, subject_id: Uuid, trigger: &str) -> Result<(), StorageError>;

    /// Cached artifact reference, if one was generated before
    async fn find_artifact(
        &self,
        subject_id: Uuid,
        content_key: &str,
    ) -> Result<Option<String>, StorageError>;

    /// Persist an artifact reference unless one exists; returns the stored reference
    async fn save_artifact(
        &self,
        subject_id: Uuid,
        content_key: &str,
        reference: &str,
    ) -> Result<String, StorageError>;

    /// Create or refresh a subject's identity, address and fields
    async fn upsert_subject(&self, subject: &Subject) -> Result<(), StorageError>;

    /// Enroll a subject in a trigger's sequence at index 0.
    ///
    /// Returns `false` if the subject is already enrolled in that trigger; progress of
    /// the existing enrollment is left untouched.
    async fn enroll(
        &self,
        subject_id: Uuid,
        trigger: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

/// Shared guard for the monotonic index invariant
pub(crate) fn check_transition(expected: u32, new: u32) -> Result<(), StorageError> {
    if new < expected {
        return Err(StorageError::InvalidTransition(format!(
            "next_step_index cannot move backwards ({} -> {})",
            expected, new
        )));
    }
    Ok(())
}
