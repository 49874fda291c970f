// Stream transports for the LAN chat protocol: framed chat messages over a
// persistent connection, and one-shot file transfers with an MD5 handshake.

pub mod chat_transport;
pub mod error;
pub mod file_transfer;

pub use chat_transport::{
    receive_message, receive_message_timeout, send_message, send_message_timeout,
};
pub use error::{FileTransferError, TransportError};
pub use file_transfer::{
    file_md5, receive_file, receive_file_on, receive_file_with, send_file, send_file_on, InfoPacket,
    ReceivedFile, TransferProgress, TransferTimeouts,
};
