// In-memory enrollment store

use super::{check_transition, EnrollmentStore};
use crate::errors::StorageError;
use crate::models::{AdvanceOutcome, Enrollment, Subject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Enrollment store held in process memory
///
/// Every mutation runs under one write lock, which gives the same per-enrollment
/// atomicity the Postgres store gets from its conditional UPDATE. Suitable for a
/// single node and for tests; state is lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryEnrollmentStore {
    subjects: Arc<RwLock<HashMap<Uuid, Subject>>>,
}

impl InMemoryEnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a subject, if known
    pub async fn subject(&self, id: Uuid) -> Option<Subject> {
        self.subjects.read().await.get(&id).cloned()
    }

    /// Current enrollment of a subject in a trigger, if active
    pub async fn enrollment(&self, id: Uuid, trigger: &str) -> Option<Enrollment> {
        self.subjects
            .read()
            .await
            .get(&id)
            .and_then(|s| s.enrollment(trigger).cloned())
    }

    /// Number of active enrollments across all subjects
    pub async fn active_enrollment_count(&self) -> usize {
        self.subjects
            .read()
            .await
            .values()
            .map(|s| s.enrollments.len())
            .sum()
    }
}

#[async_trait]
impl EnrollmentStore for InMemoryEnrollmentStore {
    async fn list_subjects_with_active_enrollments(&self) -> Result<Vec<Subject>, StorageError> {
        let subjects = self.subjects.read().await;
        let mut active: Vec<Subject> = subjects
            .values()
            .filter(|s| !s.enrollments.is_empty())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.id);
        Ok(active)
    }

    async fn find_enrollment(
        &self,
        subject_id: Uuid,
        trigger: &str,
    ) -> Result<Option<Enrollment>, StorageError> {
        Ok(self.enrollment(subject_id, trigger).await)
    }

    #[instrument(skip(self))]
    async fn compare_and_advance(
        &self,
        subject_id: Uuid,
        trigger: &str,
        expected: u32,
        new: u32,
    ) -> Result<AdvanceOutcome, StorageError> {
        check_transition(expected, new)?;

        let mut subjects = self.subjects.write().await;
        let enrollment = subjects
            .get_mut(&subject_id)
            .and_then(|s| s.enrollments.iter_mut().find(|e| e.trigger == trigger));

        match enrollment {
            Some(enrollment) if enrollment.next_step_index == expected => {
                enrollment.next_step_index = new;
                Ok(AdvanceOutcome::Advanced)
            }
            Some(enrollment) => {
                debug!(
                    stored = enrollment.next_step_index,
                    expected, "Advance conflict"
                );
                Ok(AdvanceOutcome::Conflict)
            }
            // Already removed by a concurrent pass
            None => Ok(AdvanceOutcome::Conflict),
        }
    }

    #[instrument(skip(self))]
    async fn remove_enrollment(&self, subject_id: Uuid, trigger: &str) -> Result<(), StorageError> {
        let mut subjects = self.subjects.write().await;
        if let Some(subject) = subjects.get_mut(&subject_id) {
            subject.enrollments.retain(|e| e.trigger != trigger);
        }
        Ok(())
    }

    async fn find_artifact(
        &self,
        subject_id: Uuid,
        content_key: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .subjects
            .read()
            .await
            .get(&subject_id)
            .and_then(|s| s.generated_artifacts.get(content_key).cloned()))
    }

    async fn save_artifact(
        &self,
        subject_id: Uuid,
        content_key: &str,
        reference: &str,
    ) -> Result<String, StorageError> {
        let mut subjects = self.subjects.write().await;
        let subject = subjects
            .get_mut(&subject_id)
            .ok_or_else(|| StorageError::NotFound(format!("Subject {}", subject_id)))?;

        let stored = subject
            .generated_artifacts
            .entry(content_key.to_string())
            .or_insert_with(|| reference.to_string());
        Ok(stored.clone())
    }

    async fn upsert_subject(&self, subject: &Subject) -> Result<(), StorageError> {
        let mut subjects = self.subjects.write().await;
        match subjects.get_mut(&subject.id) {
            Some(existing) => {
                existing.channel_address = subject.channel_address.clone();
                existing.fields = subject.fields.clone();
            }
            None => {
                subjects.insert(subject.id, subject.clone());
            }
        }
        Ok(())
    }

    async fn enroll(
        &self,
        subject_id: Uuid,
        trigger: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut subjects = self.subjects.write().await;
        let subject = subjects
            .get_mut(&subject_id)
            .ok_or_else(|| StorageError::NotFound(format!("Subject {}", subject_id)))?;

        if subject.enrollment(trigger).is_some() {
            return Ok(false);
        }

        subject
            .enrollments
            .push(Enrollment::new(trigger, started_at));
        Ok(true)
    }
}
