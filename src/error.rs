// src/error.rs
// Error taxonomy for the conversation engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The wallet refused to sign. Fatal for the in-progress state
    /// transition; the engine keeps its prior state.
    #[error("wallet declined the signature request")]
    UserDenied,

    /// The registry could not be reached or answered with a failure.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The peer has never published a messaging identity.
    #[error("no registry entry for {0}")]
    PeerNotEnrolled(String),

    /// 409 from the message POST: someone else took our index. Transient;
    /// retry after the ingestor advances.
    #[error("message index conflict")]
    IndexConflict,

    /// Another send is already in flight on this engine instance.
    #[error("a send is already in flight")]
    SendInFlight,

    /// A wallet address failed syntactic validation.
    #[error("invalid wallet address: {0}")]
    InvalidAddress(String),

    /// Bad or missing construction-time configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The engine has no bound wallet, or the identity state machine is
    /// not far enough along for the requested operation.
    #[error("identity not ready: {0}")]
    IdentityState(&'static str),

    /// A crypto primitive rejected its input (bad key length, bad blob).
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Non-200, non-409 answer from the key server.
    #[error("key server answered with status {0}")]
    Server(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    /// Outgoing message failed schema validation before encryption.
    #[error("message failed schema validation")]
    InvalidMessage,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
