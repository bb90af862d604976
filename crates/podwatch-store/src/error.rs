/// Errors from the rule/alert store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A required record was not found.
    #[error("store: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// The write violates a store invariant (operator/resolve-threshold
    /// orientation, or the single-firing uniqueness constraint).
    #[error("store: conflict: {0}")]
    Conflict(String),

    /// An underlying SQLite error.
    #[error("store: SQLite error: {0}")]
    Io(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
