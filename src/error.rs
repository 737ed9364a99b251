use crate::core::bracket::BracketStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures returned by bracket operations.
///
/// Every variant is recoverable and is handed back to whoever invoked the
/// operation; nothing here is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("bracket {bracket} is {actual}, expected {expected}")]
    Phase {
        bracket: i64,
        expected: BracketStatus,
        actual: BracketStatus,
    },

    #[error("a bracket needs at least 2 entries, found {0}")]
    InsufficientEntries(usize),

    #[error("matchup {0} is not accepting votes")]
    InactiveMatchup(i64),

    #[error("user {user} already voted on matchup {matchup}")]
    DuplicateVote { matchup: i64, user: String },

    #[error("'{choice}' is not an option in matchup {matchup}")]
    InvalidChoice { matchup: i64, choice: String },

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{} {}", kind, id))
    }

    /// True when the store rejected a write because a unique index already
    /// holds the key.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}
