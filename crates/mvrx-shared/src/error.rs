use thiserror::Error;

#[derive(Error, Debug)]
pub enum MvrxError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid station UUID: {0}")]
    InvalidStation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MvrxError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
