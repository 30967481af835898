//! Event store error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o failure: {0}")]
    Io(String),

    #[error("background task failed: {0}")]
    Background(String),
}
