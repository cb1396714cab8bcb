//! Error types for the operator binary.
//!
//! [`CliError`] wraps every failure `main` can propagate with `?`.

/// Top-level error for the `canewatch` binary.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The command line could not be understood.
    #[error("usage error: {0}")]
    Usage(String),

    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: canewatch_db::ConfigError,
    },

    /// A persistence operation failed.
    #[error("persistence error: {source}")]
    Persistence {
        /// The underlying persistence error.
        #[from]
        source: canewatch_db::PersistenceError,
    },

    /// The export payload file could not be read.
    #[error("failed to read payload {path}: {source}")]
    Payload {
        /// Path that was given on the command line.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The export payload or command output is not valid JSON.
    #[error("JSON error: {source}")]
    Json {
        /// The underlying serde error.
        #[from]
        source: serde_json::Error,
    },

    /// The store did not answer the health probe.
    #[error("database is not reachable")]
    Unhealthy,

    /// Some records of an export could not be saved.
    #[error("export incomplete: {failed} save(s) failed for session {session_id}")]
    IncompleteExport {
        /// Session the export targeted.
        session_id: String,
        /// Number of failed saves.
        failed: usize,
    },

    /// The summary was requested for a session that does not exist.
    #[error("session {0} not found")]
    UnknownSession(String),
}
