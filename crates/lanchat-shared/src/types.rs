use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a connected client, chosen by the client itself.
pub type ClientId = Uuid;

/// Identity of a chatroom, assigned by the server.
pub type ChatroomId = Uuid;

/// Lifecycle of an admitted chat connection: `Connecting` until the
/// server has accepted it, then `Connected`, then `Disconnected` for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
}

impl SessionState {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Connecting),
            1 => Some(Self::Connected),
            2 => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Short form of an id for log lines.
pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Display names and room names travel inside newline-delimited listings,
/// so line breaks are flattened.
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}
