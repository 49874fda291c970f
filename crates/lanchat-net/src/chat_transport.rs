//! Framed chat messages over a persistent byte stream.
//!
//! Every frame on the wire carries the 4-byte text length, so a receiver
//! always reads a fixed 45-byte header first and then exactly the declared
//! number of text bytes. A frame with length 0 decodes to `text = None`.

use std::io;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use lanchat_shared::constants::{CHAT_BUFFER_SIZE, FULL_HEADER_LENGTH};
use lanchat_shared::message::{decode_text, stamp_time_sent};
use lanchat_shared::{Message, PacketHeader};

use crate::error::TransportError;

/// Write one message and flush.
///
/// `time_sent` in the packet is overwritten with the current time, whatever
/// the message struct carried.
pub async fn send_message<W>(writer: &mut W, message: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut packet = message.to_framed_packet();
    stamp_time_sent(&mut packet, Utc::now());

    writer.write_all(&packet).await?;
    writer.flush().await?;

    trace!(
        kind = ?message.kind,
        control = ?message.control,
        bytes = packet.len(),
        "Sent chat frame"
    );
    Ok(())
}

/// Read one message, waiting as long as it takes.
///
/// A peer that closes the stream cleanly between frames yields
/// [`TransportError::Closed`]; a close in the middle of a frame is an I/O
/// error.
pub async fn receive_message<R>(reader: &mut R) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; FULL_HEADER_LENGTH];
    read_header(reader, &mut raw).await?;

    let header = PacketHeader::decode(&raw)?;
    let declared = header.text_length.unwrap_or(0);

    let text = if declared > 0 {
        Some(decode_text(read_text(reader, declared).await?)?)
    } else {
        None
    };

    let mut message = header.into_message(text);
    message.time_received = Some(Utc::now());

    trace!(
        kind = ?message.kind,
        control = ?message.control,
        text_bytes = declared,
        "Received chat frame"
    );
    Ok(message)
}

pub async fn send_message_timeout<W>(
    writer: &mut W,
    message: &Message,
    deadline: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    tokio::time::timeout(deadline, send_message(writer, message))
        .await
        .map_err(|_| TransportError::TimedOut(deadline))?
}

pub async fn receive_message_timeout<R>(
    reader: &mut R,
    deadline: Duration,
) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::time::timeout(deadline, receive_message(reader))
        .await
        .map_err(|_| TransportError::TimedOut(deadline))?
}

async fn read_header<R>(reader: &mut R, raw: &mut [u8; FULL_HEADER_LENGTH]) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < FULL_HEADER_LENGTH {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(TransportError::Closed);
            }
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {filled} of {FULL_HEADER_LENGTH} header bytes"),
            )));
        }
        filled += n;
    }
    Ok(())
}

/// Read exactly `declared` bytes, at most one chunk per read call.
async fn read_text<R>(reader: &mut R, declared: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut text = Vec::with_capacity(declared.min(CHAT_BUFFER_SIZE * 8));
    let mut chunk = vec![0u8; CHAT_BUFFER_SIZE];

    while text.len() < declared {
        let want = (declared - text.len()).min(CHAT_BUFFER_SIZE);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {} of {declared} text bytes", text.len()),
            )));
        }
        text.extend_from_slice(&chunk[..n]);
    }

    Ok(text)
}
