//! Error types for contentdb.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using CmsError.
pub type Result<T> = std::result::Result<T, CmsError>;

/// Errors that can occur while compiling, syncing, querying or migrating.
#[derive(Error, Debug)]
pub enum CmsError {
    /// A content type has an unsupported or ambiguous field shape.
    #[error("Cannot compile content type {content_type}: {message}")]
    Compile {
        content_type: String,
        message: String,
    },

    /// Upstream content source unreachable or token rejected.
    #[error("Fetch failed: {message}")]
    Fetch { message: String },

    /// Upstream asked us to back off.
    #[error("Rate limited by content source, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// A page could not be applied (malformed payload, constraint violation).
    #[error("Apply failed: {message}")]
    Apply { message: String },

    /// A query request could not be translated; never retried.
    #[error("Invalid query: {message}")]
    QueryTranslation { message: String },

    /// A migration stage failed before the namespace swap.
    #[error("Migration failed during {stage}: {source}")]
    Migration {
        stage: String,
        #[source]
        source: Box<CmsError>,
    },

    /// Content type not present in the compiled schema.
    #[error("Content type not found: {id}")]
    ContentTypeNotFound { id: String },

    /// Locale not configured for the space.
    #[error("Locale not found: {code}")]
    LocaleNotFound { code: String },

    /// Space locale configuration violates its invariants.
    #[error("Invalid space: {message}")]
    InvalidSpace { message: String },

    /// Name that cannot be used as a SQL identifier.
    #[error("Invalid identifier: {name}")]
    InvalidIdentifier { name: String },

    /// Database error.
    #[error("Database error: {message}")]
    Database { message: String },

    /// Operation stopped by a cancellation signal.
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CmsError {
    /// Create a compile error for one content type.
    pub fn compile(content_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compile {
            content_type: content_type.into(),
            message: message.into(),
        }
    }

    /// Create a fetch error.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
        }
    }

    /// Create an apply error.
    pub fn apply(message: impl Into<String>) -> Self {
        Self::Apply {
            message: message.into(),
        }
    }

    /// Create a query translation error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::QueryTranslation {
            message: message.into(),
        }
    }

    /// Wrap an error with the migration stage it happened in.
    pub fn migration(stage: impl std::fmt::Display, source: CmsError) -> Self {
        Self::Migration {
            stage: stage.to_string(),
            source: Box::new(source),
        }
    }

    /// Create an invalid space error.
    pub fn invalid_space(message: impl Into<String>) -> Self {
        Self::InvalidSpace {
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error was caused by caller input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::QueryTranslation { .. }
                | Self::ContentTypeNotFound { .. }
                | Self::LocaleNotFound { .. }
        )
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Stable error code for callers.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "COMPILE_ERROR",
            Self::Fetch { .. } => "FETCH_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Apply { .. } => "APPLY_ERROR",
            Self::QueryTranslation { .. } => "INVALID_QUERY",
            Self::Migration { .. } => "MIGRATION_ERROR",
            Self::ContentTypeNotFound { .. } => "CONTENT_TYPE_NOT_FOUND",
            Self::LocaleNotFound { .. } => "LOCALE_NOT_FOUND",
            Self::InvalidSpace { .. } => "INVALID_SPACE",
            Self::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}
