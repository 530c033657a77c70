use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("no frame received for {0:?}")]
    ReadTimeout(Duration),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected binary frame")]
    Binary,

    #[error("connection closed")]
    Closed,

    #[error("dropped by a room for not keeping up")]
    SlowConsumer,

    #[error("history store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("history store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),

    #[error("history store lock poisoned")]
    StorePoisoned,

    #[error("room {0} is closed")]
    RoomClosed(String),

    #[error("hub is not running")]
    HubGone,

    #[error("user {0} is gone")]
    UserGone(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<warp::Error> for RelayError {
    fn from(err: warp::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

impl RelayError {
    /// Whether this error ends a connection normally rather than signalling a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RelayError::Closed)
    }
}
