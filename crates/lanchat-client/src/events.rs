use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use lanchat_shared::listing::{ChatroomEntry, ClientEntry, FileEntry, FileRecord};
use lanchat_shared::{ChatroomId, ClientId};

pub const EVENT_MESSAGE_RECEIVED: &str = "message-received";
pub const EVENT_PRIVATE_MESSAGE_RECEIVED: &str = "private-message-received";
pub const EVENT_SYSTEM_MESSAGE: &str = "system-message";
pub const EVENT_CLIENT_LIST_UPDATED: &str = "client-list-updated";
pub const EVENT_CHATROOM_LIST_UPDATED: &str = "chatroom-list-updated";
pub const EVENT_JOINED_CHATROOM: &str = "joined-chatroom";
pub const EVENT_LEFT_CHATROOM: &str = "left-chatroom";
pub const EVENT_CLIENT_JOINED: &str = "client-joined";
pub const EVENT_CLIENT_LEFT: &str = "client-left";
pub const EVENT_FILE_LIST_RECEIVED: &str = "file-list-received";
pub const EVENT_FILE_AVAILABLE: &str = "file-available";
pub const EVENT_UPLOAD_FINISHED: &str = "upload-finished";
pub const EVENT_UPLOAD_FAILED: &str = "upload-failed";
pub const EVENT_DOWNLOAD_FINISHED: &str = "download-finished";
pub const EVENT_DOWNLOAD_FAILED: &str = "download-failed";
pub const EVENT_TRANSFER_PROGRESS: &str = "transfer-progress";
pub const EVENT_SEND_FAILED: &str = "send-failed";
pub const EVENT_SERVER_DISCONNECTED: &str = "server-disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Everything the server (or a transfer) can tell a front-end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    MessageReceived {
        sender_id: ClientId,
        /// Display name if the sender is currently known.
        sender_name: Option<String>,
        room_id: ChatroomId,
        text: String,
        time_sent: DateTime<Utc>,
    },
    PrivateMessageReceived {
        sender_id: ClientId,
        sender_name: Option<String>,
        target_id: ClientId,
        text: String,
        time_sent: DateTime<Utc>,
    },
    SystemMessage {
        target_id: Uuid,
        text: String,
    },
    ClientListUpdated {
        room_id: ChatroomId,
        clients: Vec<ClientEntry>,
    },
    ChatroomListUpdated {
        chatrooms: Vec<ChatroomEntry>,
    },
    /// We became a member of `room_id`.
    JoinedChatroom {
        room_id: ChatroomId,
    },
    /// We are no longer a member of `room_id`.
    LeftChatroom {
        room_id: ChatroomId,
    },
    ClientJoined {
        room_id: ChatroomId,
        client_id: ClientId,
        text: String,
    },
    ClientLeft {
        room_id: ChatroomId,
        client_id: ClientId,
        text: String,
    },
    FileListReceived {
        target_id: Uuid,
        files: Vec<FileEntry>,
    },
    FileAvailable {
        uploader_id: ClientId,
        target_id: Uuid,
        file: FileRecord,
    },
    UploadFinished {
        target_id: Uuid,
        file_name: String,
        bytes: u64,
    },
    UploadFailed {
        target_id: Uuid,
        file_name: String,
        reason: String,
    },
    DownloadFinished {
        target_id: Uuid,
        file: FileRecord,
        path: PathBuf,
    },
    DownloadFailed {
        target_id: Uuid,
        file_name: String,
        reason: String,
    },
    /// Share of a running transfer done so far, in `0.0..=1.0`. Sent at most
    /// once per whole percent.
    TransferProgress {
        direction: TransferDirection,
        target_id: Uuid,
        file_name: String,
        fraction: f64,
    },
    SendFailed {
        reason: String,
    },
    ServerDisconnected,
}

impl ClientEvent {
    /// Stable event name for front-ends that dispatch on strings.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::MessageReceived { .. } => EVENT_MESSAGE_RECEIVED,
            ClientEvent::PrivateMessageReceived { .. } => EVENT_PRIVATE_MESSAGE_RECEIVED,
            ClientEvent::SystemMessage { .. } => EVENT_SYSTEM_MESSAGE,
            ClientEvent::ClientListUpdated { .. } => EVENT_CLIENT_LIST_UPDATED,
            ClientEvent::ChatroomListUpdated { .. } => EVENT_CHATROOM_LIST_UPDATED,
            ClientEvent::JoinedChatroom { .. } => EVENT_JOINED_CHATROOM,
            ClientEvent::LeftChatroom { .. } => EVENT_LEFT_CHATROOM,
            ClientEvent::ClientJoined { .. } => EVENT_CLIENT_JOINED,
            ClientEvent::ClientLeft { .. } => EVENT_CLIENT_LEFT,
            ClientEvent::FileListReceived { .. } => EVENT_FILE_LIST_RECEIVED,
            ClientEvent::FileAvailable { .. } => EVENT_FILE_AVAILABLE,
            ClientEvent::UploadFinished { .. } => EVENT_UPLOAD_FINISHED,
            ClientEvent::UploadFailed { .. } => EVENT_UPLOAD_FAILED,
            ClientEvent::DownloadFinished { .. } => EVENT_DOWNLOAD_FINISHED,
            ClientEvent::DownloadFailed { .. } => EVENT_DOWNLOAD_FAILED,
            ClientEvent::TransferProgress { .. } => EVENT_TRANSFER_PROGRESS,
            ClientEvent::SendFailed { .. } => EVENT_SEND_FAILED,
            ClientEvent::ServerDisconnected => EVENT_SERVER_DISCONNECTED,
        }
    }
}
