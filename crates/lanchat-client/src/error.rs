use lanchat_net::{FileTransferError, TransportError};
use lanchat_shared::{ControlInfo, PayloadError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Unexpected reply from server: {0:?}")]
    UnexpectedReply(ControlInfo),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File transfer error: {0}")]
    FileTransfer(#[from] FileTransferError),

    #[error("Invalid request: {0}")]
    Payload(#[from] PayloadError),

    #[error("Not connected to the server")]
    Disconnected,
}
