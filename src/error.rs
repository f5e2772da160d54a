//! Error types for the dispatch engine.

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle errors.
///
/// `Conflict` is the expected outcome of losing a claim/transition race —
/// callers re-poll, and it is never logged at error level.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} lost a transition race (expected status {expected})")]
    Conflict { id: Uuid, expected: TaskStatus },

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} reached its deadline unclaimed")]
    DeadlineExceeded { id: Uuid },

    #[error("Task {id} exhausted its {attempts} attempts")]
    MaxAttemptsExceeded { id: Uuid, attempts: u32 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker {worker_id} not registered")]
    NotFound { worker_id: String },

    #[error("Invalid registration for {worker_id}: {reason}")]
    InvalidRegistration { worker_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
