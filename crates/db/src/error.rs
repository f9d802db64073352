#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid event kind in store: {0}")]
    InvalidKind(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
