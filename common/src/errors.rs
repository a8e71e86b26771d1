// Error handling framework

use thiserror::Error;

/// Sequence catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unknown trigger: {0}")]
    UnknownTrigger(String),

    #[error("Failed to read sequence catalog '{path}': {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Invalid sequence catalog: {0}")]
    Invalid(String),
}

/// Content generation pipeline errors
///
/// Any variant means nothing was written to the artifact cache.
#[derive(Error, Debug, Clone)]
pub enum GenerationError {
    #[error("Content generation failed: {0}")]
    Generation(String),

    #[error("Document rendering failed: {0}")]
    Rendering(String),

    #[error("Document upload failed: {0}")]
    Upload(String),

    #[error("Failed to persist generated artifact: {0}")]
    Persist(String),
}

/// Channel dispatch errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Channel request failed: {0}")]
    Request(String),

    #[error("Channel API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid channel response: {0}")]
    InvalidResponse(String),

    #[error("Channel not configured: {0}")]
    NotConfigured(String),
}

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("MinIO error: {0}")]
    MinioError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Lock already held for resource: {0}")]
    LockHeld(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

/// Variable substitution errors
#[derive(Error, Debug)]
pub enum SubstitutionError {
    #[error("Regex compilation error: {0}")]
    RegexError(String),
}

/// Trigger firing errors
#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Failure while processing a single enrollment during a tick
///
/// Every variant leaves the enrollment pending, so it is retried on the next tick.
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl StepError {
    /// Short label used for metrics and alerting
    pub fn reason(&self) -> &'static str {
        match self {
            StepError::Generation(_) => "generation",
            StepError::Dispatch(_) => "dispatch",
            StepError::Storage(_) => "storage",
            StepError::Catalog(_) => "unknown_trigger",
        }
    }
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // Check for specific database error codes
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        "23503" => DatabaseError::ForeignKeyViolation(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<DatabaseError> for StorageError {
    fn from(err: DatabaseError) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::RedisError(err.to_string())
    }
}

impl From<StorageError> for GenerationError {
    fn from(err: StorageError) -> Self {
        GenerationError::Persist(err.to_string())
    }
}
