use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use uuid::Uuid;

use crate::error::PayloadError;
use crate::message::{ControlInfo, Message, MessageKind};
use crate::types::{sanitize_name, ChatroomId};

/// Everything a connected client can ask of the server, classified once at
/// the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Handshake; only valid as the very first message.
    Connect { display_name: String },
    /// Text for every member of the room named by `target_id`.
    GroupMessage(Message),
    /// Text for the single client named by `target_id`.
    PrivateMessage(Message),
    JoinChatroom(ChatroomId),
    LeaveChatroom(ChatroomId),
    CreateChatroom { name: String },
    FileUpload { target: Uuid },
    FileDownload(DownloadRequest),
    FileRemove { target: Uuid, file_name: String },
}

impl TryFrom<Message> for ClientRequest {
    type Error = PayloadError;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        let request = match message.control {
            ControlInfo::ClientRequestConnection => ClientRequest::Connect {
                display_name: sanitize_name(message.text.as_deref().unwrap_or_default()),
            },
            ControlInfo::RequestJoinChatroom => ClientRequest::JoinChatroom(message.target_id),
            ControlInfo::RequestLeaveChatroom => ClientRequest::LeaveChatroom(message.target_id),
            ControlInfo::RequestCreateChatroom => {
                let name = sanitize_name(
                    message
                        .text
                        .as_deref()
                        .ok_or(PayloadError::Missing("RequestCreateChatroom"))?,
                );
                if name.is_empty() {
                    return Err(PayloadError::Missing("RequestCreateChatroom"));
                }
                ClientRequest::CreateChatroom { name }
            }
            ControlInfo::RequestFileUpload => ClientRequest::FileUpload {
                target: message.target_id,
            },
            ControlInfo::RequestFileDownload => {
                let text = message
                    .text
                    .as_deref()
                    .ok_or(PayloadError::Missing("RequestFileDownload"))?;
                let (endpoint, file_name) = parse_download_payload(text)?;
                ClientRequest::FileDownload(DownloadRequest {
                    target: message.target_id,
                    endpoint,
                    file_name,
                })
            }
            ControlInfo::RequestFileRemove => {
                let file_name = message
                    .text
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or(PayloadError::Missing("RequestFileRemove"))?
                    .to_string();
                ClientRequest::FileRemove {
                    target: message.target_id,
                    file_name,
                }
            }
            ControlInfo::None => match message.kind {
                MessageKind::UserPrivateMessage => ClientRequest::PrivateMessage(message),
                MessageKind::UserGroupMessage => ClientRequest::GroupMessage(message),
                other => return Err(PayloadError::NotARequest(format!("{other:?}"))),
            },
            other => return Err(PayloadError::NotARequest(format!("{other:?}"))),
        };

        Ok(request)
    }
}

/// Where the server should push a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadRequest {
    /// Room or private peer whose storage folder holds the file.
    pub target: Uuid,
    /// Listener advertised by the requesting client.
    pub endpoint: SocketAddr,
    pub file_name: String,
}

/// `ip\nport\nfile name`
pub fn encode_download_payload(endpoint: SocketAddr, file_name: &str) -> String {
    format!("{}\n{}\n{}", endpoint.ip(), endpoint.port(), file_name)
}

pub fn parse_download_payload(text: &str) -> Result<(SocketAddr, String), PayloadError> {
    let mut lines = text.lines();
    let ip = lines
        .next()
        .map(str::trim)
        .ok_or(PayloadError::Missing("download endpoint"))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| PayloadError::InvalidEndpoint(ip.to_string()))?;
    let port = parse_port(lines.next().unwrap_or_default())?;
    let file_name = lines
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(PayloadError::Missing("download file name"))?;

    Ok((SocketAddr::new(ip, port), file_name.to_string()))
}

/// The text of an `FtpPortOpened` message.
pub fn parse_port(text: &str) -> Result<u16, PayloadError> {
    let trimmed = text.trim();
    match trimmed.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(PayloadError::InvalidPort(trimmed.to_string())),
    }
}
