// PostgreSQL enrollment store built on the repositories

use super::{check_transition, EnrollmentStore};
use crate::db::repositories::{ArtifactRepository, EnrollmentRepository, SubjectRepository};
use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::{AdvanceOutcome, Enrollment, Subject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Enrollment store backed by PostgreSQL
pub struct PgEnrollmentStore {
    subjects: SubjectRepository,
    enrollments: EnrollmentRepository,
    artifacts: ArtifactRepository,
}

impl PgEnrollmentStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            subjects: SubjectRepository::new(pool.clone()),
            enrollments: EnrollmentRepository::new(pool.clone()),
            artifacts: ArtifactRepository::new(pool),
        }
    }

    /// Count active enrollments (for the gauge)
    pub async fn count_active(&self) -> Result<i64, StorageError> {
        Ok(self.enrollments.count_active().await?)
    }
}

#[async_trait]
impl EnrollmentStore for PgEnrollmentStore {
    #[instrument(skip(self))]
    async fn list_subjects_with_active_enrollments(&self) -> Result<Vec<Subject>, StorageError> {
        let mut subjects = self.subjects.find_with_active_enrollments().await?;
        if subjects.is_empty() {
            return Ok(subjects);
        }

        let ids: Vec<Uuid> = subjects.iter().map(|s| s.id).collect();
        let mut enrollments = self.enrollments.find_by_subjects(&ids).await?;
        let mut artifacts = self.artifacts.find_by_subjects(&ids).await?;

        for subject in &mut subjects {
            subject.enrollments = enrollments.remove(&subject.id).unwrap_or_default();
            subject.generated_artifacts = artifacts.remove(&subject.id).unwrap_or_default();
        }

        // An enrollment may have been removed between the two reads
        subjects.retain(|s| !s.enrollments.is_empty());

        debug!(count = subjects.len(), "Loaded subject snapshot");
        Ok(subjects)
    }

    async fn find_enrollment(
        &self,
        subject_id: Uuid,
        trigger: &str,
    ) -> Result<Option<Enrollment>, StorageError> {
        Ok(self.enrollments.find(subject_id, trigger).await?)
    }

    async fn compare_and_advance(
        &self,
        subject_id: Uuid,
        trigger: &str,
        expected: u32,
        new: u32,
    ) -> Result<AdvanceOutcome, StorageError> {
        check_transition(expected, new)?;
        Ok(self
            .enrollments
            .compare_and_advance(subject_id, trigger, expected, new)
            .await?)
    }

    async fn remove_enrollment(&self, subject_id: Uuid, trigger: &str) -> Result<(), StorageError> {
        self.enrollments.delete(subject_id, trigger).await?;
        Ok(())
    }

    async fn find_artifact(
        &self,
        subject_id: Uuid,
        content_key: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self.artifacts.find(subject_id, content_key).await?)
    }

    async fn save_artifact(
        &self,
        subject_id: Uuid,
        content_key: &str,
        reference: &str,
    ) -> Result<String, StorageError> {
        Ok(self
            .artifacts
            .insert_if_absent(subject_id, content_key, reference)
            .await?)
    }

    async fn upsert_subject(&self, subject: &Subject) -> Result<(), StorageError> {
        self.subjects.upsert(subject).await?;
        Ok(())
    }

    async fn enroll(
        &self,
        subject_id: Uuid,
        trigger: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        if !self.subjects.exists(subject_id).await? {
            return Err(StorageError::NotFound(format!("Subject {}", subject_id)));
        }
        Ok(self
            .enrollments
            .create_if_absent(subject_id, trigger, started_at)
            .await?)
    }
}
