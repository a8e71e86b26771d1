// Subject repository implementation

use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::Subject;
use sqlx::Row;
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

/// Repository for subject rows (identity, channel address, template fields)
pub struct SubjectRepository {
    pool: DbPool,
}

impl SubjectRepository {
    /// Create a new SubjectRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find subjects that have at least one active enrollment
    ///
    /// Enrollments and artifacts are left empty; the caller attaches them.
    #[instrument(skip(self))]
    pub async fn find_with_active_enrollments(&self) -> Result<Vec<Subject>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.channel_address, s.fields
            FROM subjects s
            WHERE EXISTS (SELECT 1 FROM enrollments e WHERE e.subject_id = s.id)
            ORDER BY s.id
            "#,
        )
        .fetch_all(self.pool.pool())
        .await?;

        let mut subjects = Vec::with_capacity(rows.len());
        for row in rows {
            let fields_json: serde_json::Value = row.try_get("fields")?;
            let fields: HashMap<String, String> = parse_fields(fields_json)?;

            subjects.push(Subject {
                id: row.try_get("id")?,
                channel_address: row.try_get("channel_address")?,
                fields,
                enrollments: Vec::new(),
                generated_artifacts: HashMap::new(),
            });
        }

        tracing::debug!(count = subjects.len(), "Found subjects with active enrollments");
        Ok(subjects)
    }

    /// Insert a subject or refresh its channel address and fields
    #[instrument(skip(self, subject), fields(subject_id = %subject.id))]
    pub async fn upsert(&self, subject: &Subject) -> Result<(), DatabaseError> {
        let fields_json = serde_json::to_value(&subject.fields).map_err(|e| {
            DatabaseError::QueryFailed(format!("Failed to serialize subject fields: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO subjects (id, channel_address, fields)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET channel_address = EXCLUDED.channel_address,
                fields = EXCLUDED.fields,
                updated_at = NOW()
            "#,
        )
        .bind(subject.id)
        .bind(&subject.channel_address)
        .bind(fields_json)
        .execute(self.pool.pool())
        .await?;

        tracing::debug!(subject_id = %subject.id, "Subject upserted");
        Ok(())
    }

    /// Check whether a subject row exists
    #[instrument(skip(self))]
    pub async fn exists(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM subjects WHERE id = $1) AS present")
            .bind(id)
            .fetch_one(self.pool.pool())
            .await?;

        Ok(row.try_get("present")?)
    }
}

/// Decode the JSONB field map, stringifying non-string scalars
fn parse_fields(value: serde_json::Value) -> Result<HashMap<String, String>, DatabaseError> {
    match value {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .filter_map(|(name, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some((name, s)),
                other => Some((name, other.to_string())),
            })
            .collect()),
        serde_json::Value::Null => Ok(HashMap::new()),
        other => Err(DatabaseError::QueryFailed(format!(
            "Subject fields must be a JSON object, got: {}",
            other
        ))),
    }
}
