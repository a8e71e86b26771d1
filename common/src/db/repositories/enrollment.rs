// Enrollment repository implementation: progress rows and atomic advancement

use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{AdvanceOutcome, Enrollment};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

/// Repository for enrollment rows
pub struct EnrollmentRepository {
    pool: DbPool,
}

impl EnrollmentRepository {
    /// Create a new EnrollmentRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Load the active enrollments of the given subjects, grouped by subject
    #[instrument(skip(self, subject_ids), fields(subject_count = subject_ids.len()))]
    pub async fn find_by_subjects(
        &self,
        subject_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<Enrollment>>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT subject_id, trigger_name, started_at, next_step_index
            FROM enrollments
            WHERE subject_id = ANY($1)
            ORDER BY subject_id, started_at, trigger_name
            "#,
        )
        .bind(subject_ids)
        .fetch_all(self.pool.pool())
        .await?;

        let mut grouped: HashMap<Uuid, Vec<Enrollment>> = HashMap::new();
        for row in rows {
            let subject_id: Uuid = row.try_get("subject_id")?;
            let next_step_index: i32 = row.try_get("next_step_index")?;

            grouped.entry(subject_id).or_default().push(Enrollment {
                trigger: row.try_get("trigger_name")?,
                started_at: row.try_get("started_at")?,
                next_step_index: from_db_index(next_step_index, subject_id)?,
            });
        }

        Ok(grouped)
    }

    /// Load a single enrollment
    #[instrument(skip(self))]
    pub async fn find(
        &self,
        subject_id: Uuid,
        trigger: &str,
    ) -> Result<Option<Enrollment>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT trigger_name, started_at, next_step_index
            FROM enrollments
            WHERE subject_id = $1 AND trigger_name = $2
            "#,
        )
        .bind(subject_id)
        .bind(trigger)
        .fetch_optional(self.pool.pool())
        .await?;

        row.map(|row| -> Result<Enrollment, DatabaseError> {
            let next_step_index: i32 = row.try_get("next_step_index")?;
            Ok(Enrollment {
                trigger: row.try_get("trigger_name")?,
                started_at: row.try_get("started_at")?,
                next_step_index: from_db_index(next_step_index, subject_id)?,
            })
        })
        .transpose()
    }

    /// Create an enrollment at index 0 unless one already exists for the trigger
    ///
    /// Returns `true` when a new enrollment was created.
    #[instrument(skip(self))]
    pub async fn create_if_absent(
        &self,
        subject_id: Uuid,
        trigger: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO enrollments (subject_id, trigger_name, started_at, next_step_index)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (subject_id, trigger_name) DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(trigger)
        .bind(started_at)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Atomically move `next_step_index` from `expected` to `new`
    ///
    /// The `WHERE next_step_index = $3` predicate makes this a compare-and-set: a
    /// concurrent writer that already advanced the row leaves zero rows affected.
    #[instrument(skip(self))]
    pub async fn compare_and_advance(
        &self,
        subject_id: Uuid,
        trigger: &str,
        expected: u32,
        new: u32,
    ) -> Result<AdvanceOutcome, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE enrollments
            SET next_step_index = $4, updated_at = NOW()
            WHERE subject_id = $1 AND trigger_name = $2 AND next_step_index = $3
            "#,
        )
        .bind(subject_id)
        .bind(trigger)
        .bind(to_db_index(expected)?)
        .bind(to_db_index(new)?)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 1 {
            Ok(AdvanceOutcome::Advanced)
        } else {
            Ok(AdvanceOutcome::Conflict)
        }
    }

    /// Delete an enrollment
    #[instrument(skip(self))]
    pub async fn delete(&self, subject_id: Uuid, trigger: &str) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM enrollments WHERE subject_id = $1 AND trigger_name = $2")
                .bind(subject_id)
                .bind(trigger)
                .execute(self.pool.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count active enrollments
    #[instrument(skip(self))]
    pub async fn count_active(&self) -> Result<i64, DatabaseError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM enrollments")
            .fetch_one(self.pool.pool())
            .await?;

        Ok(row.try_get("total")?)
    }
}

fn from_db_index(index: i32, subject_id: Uuid) -> Result<u32, DatabaseError> {
    u32::try_from(index).map_err(|_| {
        DatabaseError::QueryFailed(format!(
            "Negative next_step_index {} for subject {}",
            index, subject_id
        ))
    })
}

fn to_db_index(index: u32) -> Result<i32, DatabaseError> {
    i32::try_from(index)
        .map_err(|_| DatabaseError::QueryFailed(format!("Step index {} out of range", index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_db_index_bounds() {
        assert_eq!(to_db_index(0).unwrap(), 0);
        assert_eq!(to_db_index(i32::MAX as u32).unwrap(), i32::MAX);
        assert!(to_db_index(u32::MAX).is_err());
    }
}
