// Engine-wide error type

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("socket is not connected")]
    SocketClosed,

    #[error("hello not completed")]
    HelloNotCompleted,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
