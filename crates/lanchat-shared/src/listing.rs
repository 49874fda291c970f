//! Newline-delimited record lists carried as message text.
//!
//! - clients:   `id`, `display name` pairs
//! - chatrooms: `id`, `name`, `member count` triples
//! - files:     `name`, `size`, `last modified (unix millis)`, `uploader` quadruples
//! - file available: `name`, `size`, `received at (unix millis)`, `md5 hex`

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::constants::FILE_HASH_LENGTH;
use crate::error::PayloadError;
use crate::types::{sanitize_name, ChatroomId, ClientId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientEntry {
    pub id: ClientId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatroomEntry {
    pub id: ChatroomId,
    pub name: String,
    pub member_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub uploader: String,
}

/// What a receiver learned about a file it stored successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub received_at: DateTime<Utc>,
    pub hash: [u8; FILE_HASH_LENGTH],
}

impl FileRecord {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

pub fn encode_clients(entries: &[ClientEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        push_line(&mut out, &entry.id.to_string());
        push_line(&mut out, &sanitize_name(&entry.display_name));
    }
    out
}

pub fn parse_clients(text: &str) -> Result<Vec<ClientEntry>, PayloadError> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() % 2 != 0 {
        return Err(PayloadError::InvalidListing(format!(
            "client list has {} lines, expected pairs",
            lines.len()
        )));
    }

    lines
        .chunks(2)
        .map(|record| {
            Ok(ClientEntry {
                id: parse_uuid(record[0])?,
                display_name: record[1].to_string(),
            })
        })
        .collect()
}

pub fn encode_chatrooms(entries: &[ChatroomEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        push_line(&mut out, &entry.id.to_string());
        push_line(&mut out, &sanitize_name(&entry.name));
        push_line(&mut out, &entry.member_count.to_string());
    }
    out
}

pub fn parse_chatrooms(text: &str) -> Result<Vec<ChatroomEntry>, PayloadError> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() % 3 != 0 {
        return Err(PayloadError::InvalidListing(format!(
            "chatroom list has {} lines, expected triples",
            lines.len()
        )));
    }

    lines
        .chunks(3)
        .map(|record| {
            Ok(ChatroomEntry {
                id: parse_uuid(record[0])?,
                name: record[1].to_string(),
                member_count: parse_number(record[2])? as usize,
            })
        })
        .collect()
}

pub fn encode_files(entries: &[FileEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        push_line(&mut out, &entry.name);
        push_line(&mut out, &entry.size.to_string());
        push_line(&mut out, &entry.last_modified.timestamp_millis().to_string());
        push_line(&mut out, &sanitize_name(&entry.uploader));
    }
    out
}

pub fn parse_files(text: &str) -> Result<Vec<FileEntry>, PayloadError> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() % 4 != 0 {
        return Err(PayloadError::InvalidListing(format!(
            "file list has {} lines, expected quadruples",
            lines.len()
        )));
    }

    lines
        .chunks(4)
        .map(|record| {
            Ok(FileEntry {
                name: record[0].to_string(),
                size: parse_number(record[1])?,
                last_modified: parse_millis(record[2])?,
                uploader: record[3].to_string(),
            })
        })
        .collect()
}

pub fn encode_file_record(record: &FileRecord) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        record.name,
        record.size,
        record.received_at.timestamp_millis(),
        record.hash_hex()
    )
}

pub fn parse_file_record(text: &str) -> Result<FileRecord, PayloadError> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() != 4 {
        return Err(PayloadError::InvalidListing(format!(
            "file record has {} lines, expected 4",
            lines.len()
        )));
    }

    let digest = hex::decode(lines[3].trim())
        .map_err(|e| PayloadError::InvalidListing(format!("bad hash: {e}")))?;
    let hash: [u8; FILE_HASH_LENGTH] = digest
        .try_into()
        .map_err(|_| PayloadError::InvalidListing("hash must be 16 bytes".to_string()))?;

    Ok(FileRecord {
        name: lines[0].to_string(),
        size: parse_number(lines[1])?,
        received_at: parse_millis(lines[2])?,
        hash,
    })
}

fn push_line(out: &mut String, value: &str) {
    out.push_str(value);
    out.push('\n');
}

fn parse_uuid(value: &str) -> Result<Uuid, PayloadError> {
    Uuid::parse_str(value.trim())
        .map_err(|_| PayloadError::InvalidListing(format!("bad id: {value}")))
}

fn parse_number(value: &str) -> Result<u64, PayloadError> {
    value
        .trim()
        .parse()
        .map_err(|_| PayloadError::InvalidListing(format!("bad number: {value}")))
}

fn parse_millis(value: &str) -> Result<DateTime<Utc>, PayloadError> {
    let millis: i64 = value
        .trim()
        .parse()
        .map_err(|_| PayloadError::InvalidListing(format!("bad timestamp: {value}")))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PayloadError::InvalidListing(format!("bad timestamp: {value}")))
}
