// Generated artifact repository implementation

use crate::db::DbPool;
use crate::errors::DatabaseError;
use sqlx::Row;
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

/// Repository for the generate-once artifact cache
pub struct ArtifactRepository {
    pool: DbPool,
}

impl ArtifactRepository {
    /// Create a new ArtifactRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Load cached artifact references of the given subjects, grouped by subject
    #[instrument(skip(self, subject_ids), fields(subject_count = subject_ids.len()))]
    pub async fn find_by_subjects(
        &self,
        subject_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, HashMap<String, String>>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT subject_id, content_key, reference
            FROM generated_artifacts
            WHERE subject_id = ANY($1)
            "#,
        )
        .bind(subject_ids)
        .fetch_all(self.pool.pool())
        .await?;

        let mut grouped: HashMap<Uuid, HashMap<String, String>> = HashMap::new();
        for row in rows {
            let subject_id: Uuid = row.try_get("subject_id")?;
            grouped
                .entry(subject_id)
                .or_default()
                .insert(row.try_get("content_key")?, row.try_get("reference")?);
        }

        Ok(grouped)
    }

    /// Find a single cached reference
    #[instrument(skip(self))]
    pub async fn find(
        &self,
        subject_id: Uuid,
        content_key: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT reference
            FROM generated_artifacts
            WHERE subject_id = $1 AND content_key = $2
            "#,
        )
        .bind(subject_id)
        .bind(content_key)
        .fetch_optional(self.pool.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("reference")?)),
            None => Ok(None),
        }
    }

    /// Insert a reference unless one already exists; returns the stored reference
    ///
    /// The first writer wins, so a concurrent generator on another node observes the
    /// winner's reference instead of overwriting it.
    #[instrument(skip(self, reference))]
    pub async fn insert_if_absent(
        &self,
        subject_id: Uuid,
        content_key: &str,
        reference: &str,
    ) -> Result<String, DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO generated_artifacts (subject_id, content_key, reference)
            VALUES ($1, $2, $3)
            ON CONFLICT (subject_id, content_key) DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(content_key)
        .bind(reference)
        .execute(self.pool.pool())
        .await?;

        self.find(subject_id, content_key).await?.ok_or_else(|| {
            DatabaseError::NotFound(format!(
                "Artifact {} for subject {} vanished after insert",
                content_key, subject_id
            ))
        })
    }
}
