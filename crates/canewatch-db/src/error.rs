//! Error types and failure classification for the persistence layer.
//!
//! Three layers, from the inside out:
//!
//! - [`StoreError`] -- what the store primitives return. Converted from
//!   [`sqlx::Error`] (or produced by the simulated store) and reduced to the
//!   parts classification needs: a native error code, a message, and the
//!   constraint name when one was violated.
//! - [`StoreFailure`] -- a classified [`StoreError`]: category,
//!   recoverability, and a human-readable suggestion. Produced by the pure
//!   [`classify`] function from a fixed table of `PostgreSQL` SQLSTATE codes.
//! - [`PersistenceError`] -- the single failure type callers of the stores
//!   see. Infrastructure failures arrive here only after the retry policy
//!   has given up.

use canewatch_types::SessionId;

use crate::config::ConfigError;

// =========================================================================
// Store-native errors
// =========================================================================

/// An error raised by a store primitive, before classification.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The server rejected a statement.
    #[error("database error {}: {message}", .code.as_deref().unwrap_or("?????"))]
    Database {
        /// SQLSTATE code reported by the server.
        code: Option<String>,
        /// Server message.
        message: String,
        /// Name of the violated constraint, if any.
        constraint: Option<String>,
    },

    /// The transport to the server failed.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Kind of the underlying I/O error.
        kind: std::io::ErrorKind,
        /// Rendered I/O error.
        message: String,
    },

    /// TLS negotiation, protocol framing, or a driver worker failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No pooled connection became free within the acquisition timeout.
    #[error("timed out waiting for a pooled connection")]
    PoolTimedOut,

    /// The pool was closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A row could not be mapped to or from its record type.
    #[error("decode error: {0}")]
    Decode(String),

    /// Any other driver error.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// SQLSTATE code, for database errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Whether the server refused to create an object that already exists.
    pub fn is_duplicate_object(&self) -> bool {
        matches!(self.code(), Some(DUPLICATE_TABLE | DUPLICATE_OBJECT | DUPLICATE_SCHEMA))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => Self::Database {
                code: db.code().map(std::borrow::Cow::into_owned),
                message: db.message().to_owned(),
                constraint: db.constraint().map(str::to_owned),
            },
            sqlx::Error::Io(io) => Self::Io {
                kind: io.kind(),
                message: io.to_string(),
            },
            sqlx::Error::PoolTimedOut => Self::PoolTimedOut,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Tls(e) => Self::Transport(e.to_string()),
            sqlx::Error::Protocol(message) => Self::Transport(message),
            sqlx::Error::WorkerCrashed => Self::Transport("driver worker crashed".to_owned()),
            err @ (sqlx::Error::RowNotFound
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }) => Self::Decode(err.to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

// =========================================================================
// Classification
// =========================================================================

/// `duplicate_table`
const DUPLICATE_TABLE: &str = "42P07";
/// `duplicate_object` (indexes, constraints)
const DUPLICATE_OBJECT: &str = "42710";
/// `duplicate_schema`
const DUPLICATE_SCHEMA: &str = "42P06";
/// `unique_violation`
const UNIQUE_VIOLATION: &str = "23505";

/// Connection exceptions and server shutdowns.
const CONNECTION_CODES: &[&str] = &[
    "08000", "08001", "08003", "08004", "08006", "08007", "57P01", "57P02", "57P03",
];

/// Insufficient resources, lock contention and deadlocks.
const RESOURCE_CODES: &[&str] = &["53000", "53100", "53200", "53300", "53400", "55P03", "40P01"];

/// Statement and idle-transaction timeouts.
const TIMEOUT_CODES: &[&str] = &["57014", "25P03"];

/// Integrity constraint violations.
const CONSTRAINT_CODES: &[&str] = &[
    "23000", "23001", "23502", "23503", UNIQUE_VIOLATION, "23514", "23P01",
];

/// Privilege and authentication failures.
const PERMISSION_CODES: &[&str] = &["42501", "28000", "28P01"];

/// Failure category assigned by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    /// The server is unreachable or dropped the connection.
    Connection,
    /// The server is short on memory, connections, disk or locks.
    Resource,
    /// The operation exceeded a time limit.
    Timeout,
    /// The data violates an integrity rule.
    Constraint,
    /// The login lacks the required privilege.
    Permission,
    /// Anything the code table does not cover.
    Unknown,
}

impl ErrorCategory {
    /// Whether retrying the same operation may succeed.
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::Connection | Self::Resource | Self::Timeout)
    }

    /// Category for a SQLSTATE code.
    pub fn from_code(code: &str) -> Self {
        if CONNECTION_CODES.contains(&code) {
            Self::Connection
        } else if RESOURCE_CODES.contains(&code) {
            Self::Resource
        } else if TIMEOUT_CODES.contains(&code) {
            Self::Timeout
        } else if CONSTRAINT_CODES.contains(&code) {
            Self::Constraint
        } else if PERMISSION_CODES.contains(&code) {
            Self::Permission
        } else {
            Self::Unknown
        }
    }

    /// Short lowercase name for logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Resource => "resource",
            Self::Timeout => "timeout",
            Self::Constraint => "constraint",
            Self::Permission => "permission",
            Self::Unknown => "unknown",
        }
    }

    const fn suggestion(self) -> &'static str {
        match self {
            Self::Connection => "check database connectivity and that the server is reachable",
            Self::Resource => "the database is short on resources; retry later or reduce load",
            Self::Timeout => "the operation exceeded its time limit; retry or raise the timeout",
            Self::Constraint => "the data violates an integrity rule; check the input",
            Self::Permission => "the database user lacks the required privilege",
            Self::Unknown => "inspect the logs for the full error context",
        }
    }
}

impl core::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified store error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFailure {
    /// Assigned category.
    pub category: ErrorCategory,
    /// Native error code, when the store reported one.
    pub code: Option<String>,
    /// The original error message.
    pub message: String,
    /// Violated constraint, for constraint failures.
    pub constraint: Option<String>,
    /// What an operator should look at.
    pub suggestion: &'static str,
}

impl StoreFailure {
    /// Whether retrying may succeed.
    pub const fn is_recoverable(&self) -> bool {
        self.category.is_recoverable()
    }
}

impl core::fmt::Display for StoreFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}] {} ({})", self.category, self.message, self.suggestion)
    }
}

/// Classify a store error. Pure: depends only on the error itself.
pub fn classify(err: &StoreError) -> StoreFailure {
    let (category, constraint) = match err {
        StoreError::Database {
            code, constraint, ..
        } => (
            code.as_deref()
                .map_or(ErrorCategory::Unknown, ErrorCategory::from_code),
            constraint.clone(),
        ),
        StoreError::Io { kind, .. } => {
            let category = if *kind == std::io::ErrorKind::TimedOut {
                ErrorCategory::Timeout
            } else {
                ErrorCategory::Connection
            };
            (category, None)
        }
        StoreError::Transport(_) | StoreError::PoolClosed => (ErrorCategory::Connection, None),
        StoreError::PoolTimedOut => (ErrorCategory::Timeout, None),
        StoreError::Decode(_) | StoreError::Other(_) => (ErrorCategory::Unknown, None),
    };

    let suggestion = if err.code() == Some(UNIQUE_VIOLATION) {
        "a record with the same key already exists"
    } else {
        category.suggestion()
    };

    StoreFailure {
        category,
        code: err.code().map(str::to_owned),
        message: err.to_string(),
        constraint,
        suggestion,
    }
}

// =========================================================================
// Caller-facing errors
// =========================================================================

/// Failure of a persistence operation, as seen by callers.
///
/// Expected business outcomes (version conflicts, rejected transitions) are
/// not errors; see [`crate::session_store::SessionUpdate`].
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The store failed and retrying did not help.
    #[error("{operation} failed after {attempts} attempt(s): {failure}")]
    Store {
        /// Name of the operation that failed.
        operation: &'static str,
        /// Attempts made, including the first.
        attempts: u32,
        /// The classified failure from the last attempt.
        failure: StoreFailure,
    },

    /// Records were offered for a session that is missing or not active.
    #[error("session {0} does not exist or is not active")]
    InvalidSession(SessionId),

    /// A session with the requested identifier already exists.
    #[error("session {0} already exists")]
    DuplicateSession(SessionId),

    /// An argument was outside the accepted set.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The configuration could not be loaded or is inconsistent.
    #[error("configuration error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },
}

impl PersistenceError {
    /// Category of an infrastructure failure.
    pub const fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Store { failure, .. } => Some(failure.category),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_error(code: &str) -> StoreError {
        StoreError::Database {
            code: Some(code.to_owned()),
            message: format!("server said {code}"),
            constraint: None,
        }
    }

    #[test]
    fn code_table_assigns_categories() {
        assert_eq!(classify(&db_error("08006")).category, ErrorCategory::Connection);
        assert_eq!(classify(&db_error("57P01")).category, ErrorCategory::Connection);
        assert_eq!(classify(&db_error("53300")).category, ErrorCategory::Resource);
        assert_eq!(classify(&db_error("40P01")).category, ErrorCategory::Resource);
        assert_eq!(classify(&db_error("57014")).category, ErrorCategory::Timeout);
        assert_eq!(classify(&db_error("23503")).category, ErrorCategory::Constraint);
        assert_eq!(classify(&db_error("42501")).category, ErrorCategory::Permission);
        assert_eq!(classify(&db_error("28P01")).category, ErrorCategory::Permission);
        assert_eq!(classify(&db_error("22012")).category, ErrorCategory::Unknown);
    }

    #[test]
    fn only_transient_categories_are_recoverable() {
        assert!(ErrorCategory::Connection.is_recoverable());
        assert!(ErrorCategory::Resource.is_recoverable());
        assert!(ErrorCategory::Timeout.is_recoverable());
        assert!(!ErrorCategory::Constraint.is_recoverable());
        assert!(!ErrorCategory::Permission.is_recoverable());
        assert!(!ErrorCategory::Unknown.is_recoverable());
    }

    #[test]
    fn non_database_errors_are_classified() {
        let refused = StoreError::Io {
            kind: std::io::ErrorKind::ConnectionRefused,
            message: "connection refused".to_owned(),
        };
        assert_eq!(classify(&refused).category, ErrorCategory::Connection);

        let timed_out = StoreError::Io {
            kind: std::io::ErrorKind::TimedOut,
            message: "timed out".to_owned(),
        };
        assert_eq!(classify(&timed_out).category, ErrorCategory::Timeout);
        assert_eq!(classify(&StoreError::PoolTimedOut).category, ErrorCategory::Timeout);
        assert_eq!(classify(&StoreError::PoolClosed).category, ErrorCategory::Connection);
        assert_eq!(
            classify(&StoreError::Decode("bad column".to_owned())).category,
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn unique_violation_carries_constraint_and_specific_suggestion() {
        let err = StoreError::Database {
            code: Some(UNIQUE_VIOLATION.to_owned()),
            message: "duplicate key".to_owned(),
            constraint: Some("sessions_pkey".to_owned()),
        };
        let failure = classify(&err);
        assert_eq!(failure.category, ErrorCategory::Constraint);
        assert_eq!(failure.constraint.as_deref(), Some("sessions_pkey"));
        assert_eq!(failure.suggestion, "a record with the same key already exists");
        assert!(!failure.is_recoverable());
    }

    #[test]
    fn failure_keeps_original_message() {
        let failure = classify(&db_error("53100"));
        assert!(failure.message.contains("server said 53100"));
        assert_eq!(failure.code.as_deref(), Some("53100"));
    }

    #[test]
    fn duplicate_object_codes() {
        assert!(db_error("42P07").is_duplicate_object());
        assert!(db_error("42710").is_duplicate_object());
        assert!(!db_error("42501").is_duplicate_object());
        assert!(!StoreError::PoolClosed.is_duplicate_object());
    }
}
