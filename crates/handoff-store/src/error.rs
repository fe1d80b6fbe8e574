//! Error kinds for the hint repository, mirroring spec.md §7's taxonomy
//! (`StorageFull`, `IOFailure`, `StoragePermanent`) at the repository
//! boundary.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hint repository is full")]
    StorageFull,
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("hint record is corrupt: {0}")]
    Corrupt(String),
    #[error("json encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("the hint repository has been closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
