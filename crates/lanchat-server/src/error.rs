use lanchat_net::TransportError;
use lanchat_shared::ClientId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Outbound queue of client {0} is full")]
    Backlogged(ClientId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),
}
