//! Types shared by the LAN chat server, its client library, and the
//! transport layer: ids, protocol constants, the binary `Message` codec,
//! request classification, and listing payloads.

pub mod constants;
pub mod error;
pub mod listing;
pub mod message;
pub mod protocol;
pub mod types;

pub use error::{CodecError, PayloadError};
pub use message::{ControlInfo, Message, MessageKind, PacketHeader};
pub use protocol::{ClientRequest, DownloadRequest};
pub use types::{ChatroomId, ClientId, SessionState};
