//! Error kinds for the bus abstraction and protocol engine, matching
//! spec.md §7's error taxonomy at the boundaries this crate owns.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bus send failed: {0}")]
    Send(String),
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
    #[error("malformed message: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] handoff_store::Error),
    #[error(transparent)]
    Codec(#[from] proto_handoff::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
