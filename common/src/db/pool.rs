// PostgreSQL connection pool backing the enrollment store

use crate::config::DatabaseConfig;
use crate::errors::DatabaseError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

const APPLICATION_NAME: &str = "outreach-scheduler";

/// Shared Postgres pool used by every repository
#[derive(Debug, Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    /// Connect with the sizing and timeout from `config`.
    ///
    /// Each connection tags itself with `application_name` so scheduler sessions are
    /// easy to spot in `pg_stat_activity`.
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute(format!("SET application_name = '{}'", APPLICATION_NAME).as_str())
                        .await?;
                    Ok(())
                })
            })
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to PostgreSQL");
                DatabaseError::ConnectionFailed(e.to_string())
            })?;

        info!(
            min_connections = config.min_connections,
            "PostgreSQL pool ready"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query and report pool occupancy
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::HealthCheckFailed(e.to_string()))?;

        debug!(
            size = self.pool.size(),
            idle = self.pool.num_idle(),
            "PostgreSQL health check passed"
        );
        Ok(())
    }

    /// Apply pending schema migrations from `migrations/`
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Database migration failed");
                DatabaseError::MigrationFailed(e.to_string())
            })?;

        info!("Database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}
