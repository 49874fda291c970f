//! One-shot file transfer over a dedicated TCP connection.
//!
//! ```text
//!  sender                                   receiver
//!    | -- info packet (312 bytes) ----------> |   sender id, target id,
//!    |                                        |   name, size, md5
//!    | <------------ response (256 bytes) --- |   byte 0: 1 = accept, 0 = reject
//!    |                                        |   bytes 1..: reject reason
//!    | -- file bytes (size) ----------------> |
//! ```
//!
//! The receiver recomputes the MD5 of what it saved and deletes the file
//! when the digest does not match.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use md5::{Digest, Md5};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lanchat_shared::constants::{
    FILE_BUFFER_SIZE, FILE_HASH_LENGTH, FILE_NAME_LENGTH, FILE_RESPONSE_LENGTH, INFO_PACKET_LENGTH,
};
use lanchat_shared::listing::FileRecord;

use crate::error::FileTransferError;

pub const REASON_FILE_EXISTS: &str = "There is already a file with that name on the receiver side.";
pub const REASON_INVALID_NAME: &str = "The file name is not allowed on the receiver side.";
pub const REASON_CREATE_FAILED: &str = "The receiver could not create the file.";

/// Fixed-size preamble describing the file about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPacket {
    pub sender_id: Uuid,
    pub target_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub hash: [u8; FILE_HASH_LENGTH],
}

impl InfoPacket {
    pub fn encode(&self) -> Result<[u8; INFO_PACKET_LENGTH], FileTransferError> {
        let name = self.file_name.as_bytes();
        if name.len() > FILE_NAME_LENGTH {
            return Err(FileTransferError::FileNameTooLong {
                len: name.len(),
                max: FILE_NAME_LENGTH,
            });
        }

        let mut packet = [0u8; INFO_PACKET_LENGTH];
        let mut offset = 0;
        packet[offset..offset + 16].copy_from_slice(self.sender_id.as_bytes());
        offset += 16;
        packet[offset..offset + 16].copy_from_slice(self.target_id.as_bytes());
        offset += 16;
        packet[offset..offset + name.len()].copy_from_slice(name);
        offset += FILE_NAME_LENGTH;
        packet[offset..offset + 8].copy_from_slice(&self.file_size.to_be_bytes());
        offset += 8;
        packet[offset..].copy_from_slice(&self.hash);

        Ok(packet)
    }

    pub fn decode(packet: &[u8; INFO_PACKET_LENGTH]) -> Result<Self, FileTransferError> {
        let mut id = [0u8; 16];
        id.copy_from_slice(&packet[0..16]);
        let sender_id = Uuid::from_bytes(id);
        id.copy_from_slice(&packet[16..32]);
        let target_id = Uuid::from_bytes(id);

        let name_field = &packet[32..32 + FILE_NAME_LENGTH];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILE_NAME_LENGTH);
        let file_name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| FileTransferError::InvalidInfo("file name is not UTF-8".to_string()))?
            .to_string();

        let size_start = 32 + FILE_NAME_LENGTH;
        let mut size = [0u8; 8];
        size.copy_from_slice(&packet[size_start..size_start + 8]);

        let mut hash = [0u8; FILE_HASH_LENGTH];
        hash.copy_from_slice(&packet[size_start + 8..]);

        Ok(Self {
            sender_id,
            target_id,
            file_name,
            file_size: u64::from_be_bytes(size),
            hash,
        })
    }
}

/// Snapshot handed to progress callbacks after every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    /// Completed share in `0.0..=1.0`. An empty file counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.transferred as f64 / self.total as f64
        }
    }
}

/// Deadlines applied to one transfer. `None` waits forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferTimeouts {
    /// How long a receiver waits for its single connection.
    pub accept: Option<Duration>,
    /// Bound on each connect, handshake read/write and chunk copy.
    pub io: Option<Duration>,
}

/// Result of a successful receive.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub sender_id: Uuid,
    pub target_id: Uuid,
    pub record: FileRecord,
    pub path: PathBuf,
}

/// MD5 of a file on disk, read in chunks.
pub async fn file_md5(path: &Path) -> io::Result<[u8; FILE_HASH_LENGTH]> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; FILE_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let mut hash = [0u8; FILE_HASH_LENGTH];
    hash.copy_from_slice(&hasher.finalize());
    Ok(hash)
}

/// Connect to a receiver and push `path` to it.
///
/// # Arguments
///
/// * `path` - File to send; its base name becomes the remote file name
/// * `addr` - The receiver's listening endpoint
/// * `sender_id` / `target_id` - Copied into the info packet
/// * `timeouts` - `io` bounds the connect and every read/write
/// * `progress` - Called after every chunk written
///
/// # Returns
///
/// The number of bytes sent. A rejection surfaces as
/// [`FileTransferError::Rejected`] carrying the receiver's reason.
pub async fn send_file<F>(
    path: &Path,
    addr: SocketAddr,
    sender_id: Uuid,
    target_id: Uuid,
    timeouts: TransferTimeouts,
    progress: F,
) -> Result<u64, FileTransferError>
where
    F: FnMut(TransferProgress),
{
    let stream = with_deadline(timeouts.io, TcpStream::connect(addr)).await?;
    debug!(peer = %addr, file = %path.display(), "Connected to file receiver");
    send_file_on(stream, path, sender_id, target_id, timeouts.io, progress).await
}

/// Same as [`send_file`] over an already established stream.
pub async fn send_file_on<S, F>(
    mut stream: S,
    path: &Path,
    sender_id: Uuid,
    target_id: Uuid,
    io_timeout: Option<Duration>,
    mut progress: F,
) -> Result<u64, FileTransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(TransferProgress),
{
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            FileTransferError::InvalidInfo(format!("no usable file name in {}", path.display()))
        })?
        .to_string();
    let total = fs::metadata(path).await?.len();
    let hash = file_md5(path).await?;

    let info = InfoPacket {
        sender_id,
        target_id,
        file_name,
        file_size: total,
        hash,
    };
    let packet = info.encode()?;
    with_deadline(io_timeout, stream.write_all(&packet)).await?;
    with_deadline(io_timeout, stream.flush()).await?;

    let mut response = [0u8; FILE_RESPONSE_LENGTH];
    with_deadline(io_timeout, stream.read_exact(&mut response)).await?;
    if let Err(reason) = decode_response(&response) {
        info!(file = %info.file_name, reason = %reason, "File transfer rejected by receiver");
        return Err(FileTransferError::Rejected(reason));
    }

    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; FILE_BUFFER_SIZE];
    let mut sent = 0u64;

    while sent < total {
        let want = (total - sent).min(FILE_BUFFER_SIZE as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            // File shrank after it was hashed.
            return Err(FileTransferError::Incomplete {
                received: sent,
                expected: total,
            });
        }
        with_deadline(io_timeout, stream.write_all(&buf[..n])).await?;
        sent += n as u64;
        progress(TransferProgress {
            transferred: sent,
            total,
        });
    }

    with_deadline(io_timeout, stream.flush()).await?;
    with_deadline(io_timeout, stream.shutdown()).await?;

    info!(
        file = %info.file_name,
        bytes = sent,
        md5 = %hex::encode(info.hash),
        "File sent"
    );
    Ok(sent)
}

/// Accept exactly one connection on `listener` and receive a file from it.
///
/// # Arguments
///
/// * `listener` - Single-use listener, consumed
/// * `save_path` - Destination; defaults to `<storage_root>/<target id>/<file name>`
/// * `storage_root` - Base folder for the default destination
/// * `timeouts` - `accept` bounds the wait for the sender, `io` each read/write
/// * `progress` - Called after every chunk written to disk
pub async fn receive_file<F>(
    listener: TcpListener,
    save_path: Option<PathBuf>,
    storage_root: &Path,
    timeouts: TransferTimeouts,
    progress: F,
) -> Result<ReceivedFile, FileTransferError>
where
    F: FnMut(TransferProgress),
{
    receive_file_with(listener, save_path, storage_root, timeouts, |_| {}, progress).await
}

/// [`receive_file`] that also reports the destination as soon as it has
/// been created, before the sender is told to start. The file stays partial
/// until this call returns.
pub async fn receive_file_with<A, F>(
    listener: TcpListener,
    save_path: Option<PathBuf>,
    storage_root: &Path,
    timeouts: TransferTimeouts,
    on_created: A,
    progress: F,
) -> Result<ReceivedFile, FileTransferError>
where
    A: FnOnce(&Path),
    F: FnMut(TransferProgress),
{
    let (stream, peer) = with_deadline(timeouts.accept, listener.accept()).await?;
    drop(listener);
    debug!(peer = %peer, "File sender connected");
    receive_into(stream, save_path, storage_root, timeouts.io, on_created, progress).await
}

/// Same as [`receive_file`] over an already accepted stream.
pub async fn receive_file_on<S, F>(
    stream: S,
    save_path: Option<PathBuf>,
    storage_root: &Path,
    io_timeout: Option<Duration>,
    progress: F,
) -> Result<ReceivedFile, FileTransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(TransferProgress),
{
    receive_into(stream, save_path, storage_root, io_timeout, |_| {}, progress).await
}

async fn receive_into<S, A, F>(
    mut stream: S,
    save_path: Option<PathBuf>,
    storage_root: &Path,
    io_timeout: Option<Duration>,
    on_created: A,
    mut progress: F,
) -> Result<ReceivedFile, FileTransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    A: FnOnce(&Path),
    F: FnMut(TransferProgress),
{
    let mut raw = [0u8; INFO_PACKET_LENGTH];
    with_deadline(io_timeout, stream.read_exact(&mut raw)).await?;
    let info = InfoPacket::decode(&raw)?;

    if !is_plain_file_name(&info.file_name) {
        reject(&mut stream, REASON_INVALID_NAME, io_timeout).await?;
        return Err(FileTransferError::InvalidInfo(format!(
            "refused file name {:?}",
            info.file_name
        )));
    }

    let path = save_path.unwrap_or_else(|| {
        storage_root
            .join(info.target_id.to_string())
            .join(&info.file_name)
    });

    let file = match create_destination(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            reject(&mut stream, REASON_FILE_EXISTS, io_timeout).await?;
            return Err(FileTransferError::Rejected(REASON_FILE_EXISTS.to_string()));
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot create destination file");
            reject(&mut stream, REASON_CREATE_FAILED, io_timeout).await?;
            return Err(e.into());
        }
    };
    on_created(&path);

    let mut accept = [0u8; FILE_RESPONSE_LENGTH];
    accept[0] = 1;
    let accepted = async {
        with_deadline(io_timeout, stream.write_all(&accept)).await?;
        with_deadline(io_timeout, stream.flush()).await
    }
    .await;
    if let Err(e) = accepted {
        drop(file);
        discard(&path).await;
        return Err(e);
    }

    if let Err(e) = copy_body(&mut stream, file, info.file_size, io_timeout, &mut progress).await {
        discard(&path).await;
        return Err(e);
    }

    let actual = file_md5(&path).await?;
    if actual != info.hash {
        discard(&path).await;
        return Err(FileTransferError::IntegrityMismatch {
            expected: hex::encode(info.hash),
            actual: hex::encode(actual),
        });
    }

    info!(
        file = %info.file_name,
        bytes = info.file_size,
        path = %path.display(),
        "File received"
    );

    Ok(ReceivedFile {
        sender_id: info.sender_id,
        target_id: info.target_id,
        record: FileRecord {
            name: info.file_name,
            size: info.file_size,
            received_at: Utc::now(),
            hash: actual,
        },
        path,
    })
}

/// A bare file name: no separators, not empty, not `.` or `..`.
///
/// Control characters are refused too. Names travel in newline-delimited
/// listings, so a `\n` in one would corrupt every listing of its folder.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.chars().any(char::is_control)
}

fn decode_response(response: &[u8; FILE_RESPONSE_LENGTH]) -> Result<(), String> {
    if response[0] == 1 {
        return Ok(());
    }
    let body = &response[1..];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    Err(String::from_utf8_lossy(&body[..end]).into_owned())
}

fn reject_response(reason: &str) -> [u8; FILE_RESPONSE_LENGTH] {
    let mut response = [0u8; FILE_RESPONSE_LENGTH];
    let mut len = reason.len().min(FILE_RESPONSE_LENGTH - 1);
    while !reason.is_char_boundary(len) {
        len -= 1;
    }
    response[1..1 + len].copy_from_slice(&reason.as_bytes()[..len]);
    response
}

async fn reject<S>(stream: &mut S, reason: &str, io_timeout: Option<Duration>) -> Result<(), FileTransferError>
where
    S: AsyncWrite + Unpin,
{
    debug!(reason, "Rejecting file transfer");
    with_deadline(io_timeout, stream.write_all(&reject_response(reason))).await?;
    with_deadline(io_timeout, stream.flush()).await
}

async fn create_destination(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().write(true).create_new(true).open(path).await
}

async fn copy_body<S, F>(
    stream: &mut S,
    mut file: File,
    total: u64,
    io_timeout: Option<Duration>,
    progress: &mut F,
) -> Result<(), FileTransferError>
where
    S: AsyncRead + Unpin,
    F: FnMut(TransferProgress),
{
    let mut buf = vec![0u8; FILE_BUFFER_SIZE];
    let mut received = 0u64;

    while received < total {
        let want = (total - received).min(FILE_BUFFER_SIZE as u64) as usize;
        let n = with_deadline(io_timeout, stream.read(&mut buf[..want])).await?;
        if n == 0 {
            return Err(FileTransferError::Incomplete {
                received,
                expected: total,
            });
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
        progress(TransferProgress {
            transferred: received,
            total,
        });
    }

    file.flush().await?;
    Ok(())
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to delete partial file");
    } else {
        debug!(path = %path.display(), "Deleted partial file");
    }
}

async fn with_deadline<T, Fut>(deadline: Option<Duration>, fut: Fut) -> Result<T, FileTransferError>
where
    Fut: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FileTransferError::TimedOut(limit))?
            .map_err(FileTransferError::from),
        None => fut.await.map_err(FileTransferError::from),
    }
}
