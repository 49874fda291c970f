//! Binary framing of chat messages.
//!
//! ```text
//!   2-bit kind
//!    |   6-bit control code                        time sent (i64 unix millis)
//!    |    |                                         |
//!  [ k k c c c c c c | <16-byte> | <16-byte> | <8-byte> || <4-byte> | <variable> ]
//!                        |           |                     |          |
//!                   sender id        |          text length (u32)     |
//!                               target id                       UTF-8 text
//! ```
//!
//! All integers are big-endian. The length and text fields are omitted when
//! the message carries no text, so a valid packet is either exactly 41 bytes
//! or at least 45 bytes.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{FULL_HEADER_LENGTH, HEADER_LENGTH, MAX_TEXT_LENGTH, NULL_ID};
use crate::error::CodecError;

/// Byte offset of the time field inside a packet.
const TIME_OFFSET: usize = 1 + 16 + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Session and room management.
    Control = 0b00,
    /// User text addressed to a single client.
    UserPrivateMessage = 0b01,
    /// Text generated by the server itself.
    SystemMessage = 0b10,
    /// User text addressed to a chatroom.
    UserGroupMessage = 0b11,
}

impl MessageKind {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Control,
            0b01 => Self::UserPrivateMessage,
            0b10 => Self::SystemMessage,
            _ => Self::UserGroupMessage,
        }
    }
}

/// Control codes. Server notifications live in `0x1_`, client requests in `0x2_`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlInfo {
    None = 0x00,
    ConnectionAccepted = 0x10,
    ConnectionRejected = 0x11,
    ClientJoinedChatroom = 0x12,
    ClientLeftChatroom = 0x13,
    ListOfClients = 0x14,
    ListOfChatrooms = 0x15,
    ListOfFiles = 0x16,
    FileAvailable = 0x17,
    FtpPortOpened = 0x18,
    /// An upload request was refused before any listener was opened.
    FtpRequestRejected = 0x19,
    ClientRequestConnection = 0x20,
    RequestJoinChatroom = 0x21,
    RequestLeaveChatroom = 0x22,
    RequestCreateChatroom = 0x23,
    RequestFileUpload = 0x2A,
    RequestFileDownload = 0x2B,
    RequestFileRemove = 0x2C,
}

impl ControlInfo {
    pub fn from_code(code: u8) -> Option<Self> {
        let control = match code {
            0x00 => Self::None,
            0x10 => Self::ConnectionAccepted,
            0x11 => Self::ConnectionRejected,
            0x12 => Self::ClientJoinedChatroom,
            0x13 => Self::ClientLeftChatroom,
            0x14 => Self::ListOfClients,
            0x15 => Self::ListOfChatrooms,
            0x16 => Self::ListOfFiles,
            0x17 => Self::FileAvailable,
            0x18 => Self::FtpPortOpened,
            0x19 => Self::FtpRequestRejected,
            0x20 => Self::ClientRequestConnection,
            0x21 => Self::RequestJoinChatroom,
            0x22 => Self::RequestLeaveChatroom,
            0x23 => Self::RequestCreateChatroom,
            0x2A => Self::RequestFileUpload,
            0x2B => Self::RequestFileDownload,
            0x2C => Self::RequestFileRemove,
            _ => return None,
        };
        Some(control)
    }
}

/// A single unit of chat traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub control: ControlInfo,
    pub sender_id: Uuid,
    pub target_id: Uuid,
    /// Overwritten with the current time when the packet hits the wire.
    pub time_sent: DateTime<Utc>,
    /// Local receipt time; never transmitted.
    pub time_received: Option<DateTime<Utc>>,
    pub text: Option<String>,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        control: ControlInfo,
        sender_id: Uuid,
        target_id: Uuid,
        text: Option<String>,
    ) -> Self {
        Self {
            kind,
            control,
            sender_id,
            target_id,
            time_sent: Utc::now(),
            time_received: None,
            text,
        }
    }

    /// A control message without text.
    pub fn control(control: ControlInfo, sender_id: Uuid, target_id: Uuid) -> Self {
        Self::new(MessageKind::Control, control, sender_id, target_id, None)
    }

    /// A server-generated notice shown to users.
    pub fn system(target_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(
            MessageKind::SystemMessage,
            ControlInfo::None,
            NULL_ID,
            target_id,
            Some(text.into()),
        )
    }

    pub fn group(sender_id: Uuid, room_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(
            MessageKind::UserGroupMessage,
            ControlInfo::None,
            sender_id,
            room_id,
            Some(text.into()),
        )
    }

    pub fn private(sender_id: Uuid, target_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(
            MessageKind::UserPrivateMessage,
            ControlInfo::None,
            sender_id,
            target_id,
            Some(text.into()),
        )
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn is_control(&self) -> bool {
        self.kind == MessageKind::Control
    }

    /// Encode into the canonical packet: 41 bytes without text, 45+n with.
    pub fn to_packet(&self) -> BytesMut {
        self.encode(self.text.is_some())
    }

    /// Encode with the length field always present (absent text = length 0).
    ///
    /// Stream receivers read a fixed 45-byte header, so this is the form
    /// written to chat connections.
    pub fn to_framed_packet(&self) -> BytesMut {
        self.encode(true)
    }

    fn encode(&self, with_length: bool) -> BytesMut {
        let text = self.text.as_deref().unwrap_or_default().as_bytes();
        let mut buf = BytesMut::with_capacity(FULL_HEADER_LENGTH + text.len());

        buf.put_u8(((self.kind as u8) << 6) | (self.control as u8 & 0x3F));
        buf.put_slice(self.sender_id.as_bytes());
        buf.put_slice(self.target_id.as_bytes());
        buf.put_i64(self.time_sent.timestamp_millis());

        if with_length {
            buf.put_u32(text.len() as u32);
            buf.put_slice(text);
        }

        buf
    }

    /// Decode only the fixed header; see [`PacketHeader::decode`].
    pub fn decode_header(bytes: &[u8]) -> Result<PacketHeader, CodecError> {
        PacketHeader::decode(bytes)
    }

    /// Decode a complete packet.
    pub fn from_packet(packet: &[u8]) -> Result<Self, CodecError> {
        let header = PacketHeader::decode(packet)?;

        let text = match header.text_length {
            None => None,
            Some(declared) => {
                let body = &packet[FULL_HEADER_LENGTH..];
                if body.len() != declared {
                    return Err(CodecError::LengthMismatch {
                        declared,
                        actual: body.len(),
                    });
                }
                Some(decode_text(body.to_vec())?)
            }
        };

        Ok(header.into_message(text))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message({:?}/{:?} {} -> {}, {} text bytes)",
            self.kind,
            self.control,
            self.sender_id,
            self.target_id,
            self.text.as_ref().map(|t| t.len()).unwrap_or(0)
        )
    }
}

/// The fixed part of a packet, decoded before the text is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: MessageKind,
    pub control: ControlInfo,
    pub sender_id: Uuid,
    pub target_id: Uuid,
    pub time_sent: DateTime<Utc>,
    /// `None` for a bare 41-byte packet.
    pub text_length: Option<usize>,
}

impl PacketHeader {
    /// Decode the first 41 (or 45) bytes of `bytes`. Extra bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let len = bytes.len();
        if len < HEADER_LENGTH {
            return Err(CodecError::TooShort { len });
        }
        if len > HEADER_LENGTH && len < FULL_HEADER_LENGTH {
            return Err(CodecError::Malformed { len });
        }

        let mut buf = bytes;
        let first = buf.get_u8();
        let kind = MessageKind::from_bits(first >> 6);
        let code = first & 0x3F;
        let control = ControlInfo::from_code(code).ok_or(CodecError::UnknownControl(code))?;

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let sender_id = Uuid::from_bytes(id);
        buf.copy_to_slice(&mut id);
        let target_id = Uuid::from_bytes(id);

        let millis = buf.get_i64();
        let time_sent = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or(CodecError::InvalidTimestamp(millis))?;

        let text_length = if len >= FULL_HEADER_LENGTH {
            let declared = buf.get_u32() as usize;
            if declared > MAX_TEXT_LENGTH {
                return Err(CodecError::TextTooLong {
                    len: declared,
                    max: MAX_TEXT_LENGTH,
                });
            }
            Some(declared)
        } else {
            None
        };

        Ok(Self {
            kind,
            control,
            sender_id,
            target_id,
            time_sent,
            text_length,
        })
    }

    pub fn into_message(self, text: Option<String>) -> Message {
        Message {
            kind: self.kind,
            control: self.control,
            sender_id: self.sender_id,
            target_id: self.target_id,
            time_sent: self.time_sent,
            time_received: None,
            text,
        }
    }
}

/// Overwrite the time field of an encoded packet.
pub fn stamp_time_sent(packet: &mut [u8], time: DateTime<Utc>) {
    if packet.len() >= HEADER_LENGTH {
        packet[TIME_OFFSET..HEADER_LENGTH].copy_from_slice(&time.timestamp_millis().to_be_bytes());
    }
}

pub fn decode_text(bytes: Vec<u8>) -> Result<String, CodecError> {
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidText)
}
