//! Error types for the core library.

use thiserror::Error;

use crate::account::CredentialError;
use crate::service::ServiceError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// MIME header handling failed.
    #[error("MIME error: {0}")]
    Mime(#[from] mailledger_mime::Error),

    /// Mail service operation failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// An applied migration no longer matches its registered content.
    #[error("bad checksum for already applied migration `{version}`")]
    MigrationChecksum {
        /// Version of the offending migration.
        version: String,
    },

    /// The database records a migration this build does not know.
    #[error("found unknown migration version in database ({0})")]
    UnknownMigration(String),

    /// A migration could not be applied.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// No worker is configured for the account.
    #[error("no worker found for account `{0}`")]
    UnknownAccount(String),

    /// The worker does not handle this kind of request.
    #[error("request `{0}` is not supported by this worker")]
    Unsupported(&'static str),

    /// Credential lookup error.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
