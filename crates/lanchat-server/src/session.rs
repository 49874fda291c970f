//! One connected client: handshake, serialized sends, and the receive loop.
//!
//! The receive loop never acts on what it reads. Every frame is classified
//! into a [`ClientRequest`] and forwarded to the server loop as a
//! [`ServerEvent`], which owns all shared tables.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lanchat_net::{receive_message, receive_message_timeout, send_message_timeout, TransportError};
use lanchat_shared::constants::NULL_ID;
use lanchat_shared::types::{sanitize_name, short_id};
use lanchat_shared::{ClientId, ClientRequest, ControlInfo, Message, SessionState};

use crate::error::ServerError;

pub type SessionReader = Box<dyn AsyncRead + Send + Unpin>;
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const REASON_NOT_A_CONNECTION_REQUEST: &str = "The first message must be a connection request.";
pub const REASON_INVALID_CLIENT_ID: &str = "The client ID is not valid.";
pub const REASON_DUPLICATE_ID: &str = "A client with the same ID is already connected.";
pub const REASON_SERVER_FULL: &str = "Server is full.";

// ---------------------------------------------------------------------------
// Events raised towards the server loop
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ServerEvent {
    /// A connection passed the first-message check and waits for admission.
    Connected(PendingSession),
    /// Something happened on an admitted session.
    Session {
        client: ClientId,
        event: SessionEvent,
    },
}

#[derive(Debug)]
pub enum SessionEvent {
    Request(ClientRequest),
    SendFailed(String),
    /// Raised exactly once, when the receive loop ends.
    Disconnected,
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// A connection whose first message was a well-formed connection request.
pub struct PendingSession {
    pub client_id: ClientId,
    pub display_name: String,
    pub peer: SocketAddr,
    pub reader: SessionReader,
    pub writer: SessionWriter,
}

impl fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSession")
            .field("client_id", &self.client_id)
            .field("display_name", &self.display_name)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl PendingSession {
    /// Refuse admission: send `ConnectionRejected` with `reason`, then close.
    pub async fn reject(self, reason: &str, io_timeout: Duration) {
        info!(
            client = %short_id(&self.client_id),
            peer = %self.peer,
            reason,
            "Rejecting connection"
        );
        reject_and_close(self.writer, self.client_id, reason, io_timeout).await;
    }
}

/// Read the first message and check it is a connection request.
///
/// Anything else is answered with `ConnectionRejected` and the connection is
/// closed; `None` is returned in that case and on any read failure.
pub async fn handshake(
    mut reader: SessionReader,
    writer: SessionWriter,
    peer: SocketAddr,
    handshake_timeout: Duration,
    io_timeout: Duration,
) -> Option<PendingSession> {
    let hello = match receive_message_timeout(&mut reader, handshake_timeout).await {
        Ok(message) => message,
        Err(e) => {
            info!(peer = %peer, error = %e, "Handshake failed");
            return None;
        }
    };

    if hello.control != ControlInfo::ClientRequestConnection {
        debug!(peer = %peer, control = ?hello.control, "Unexpected first message");
        reject_and_close(writer, hello.sender_id, REASON_NOT_A_CONNECTION_REQUEST, io_timeout).await;
        return None;
    }
    if hello.sender_id == NULL_ID {
        reject_and_close(writer, hello.sender_id, REASON_INVALID_CLIENT_ID, io_timeout).await;
        return None;
    }

    let display_name = sanitize_name(hello.text.as_deref().unwrap_or_default());
    debug!(
        peer = %peer,
        client = %short_id(&hello.sender_id),
        name = %display_name,
        "Connection request received"
    );

    Some(PendingSession {
        client_id: hello.sender_id,
        display_name,
        peer,
        reader,
        writer,
    })
}

async fn reject_and_close(
    mut writer: SessionWriter,
    client_id: ClientId,
    reason: &str,
    io_timeout: Duration,
) {
    let reply = Message::control(ControlInfo::ConnectionRejected, NULL_ID, client_id).with_text(reason);
    if let Err(e) = send_message_timeout(&mut writer, &reply, io_timeout).await {
        debug!(error = %e, "Failed to deliver rejection");
    }
    let _ = tokio::time::timeout(io_timeout, writer.shutdown()).await;
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Frames a session may have waiting for its writer. A peer that lets the
/// queue fill up is not reading and gets reported as failed.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 128;

struct SessionInner {
    id: ClientId,
    display_name: String,
    peer: SocketAddr,
    state: AtomicU8,
    outbound: mpsc::Sender<Message>,
    closing: Arc<Notify>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    io_timeout: Duration,
    events: mpsc::Sender<ServerEvent>,
}

/// Cheap, cloneable handle to an admitted client.
///
/// Writes happen on a task of their own, so sending never waits on the
/// peer. Frames from one handle reach the wire in the order they were sent.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("display_name", &self.inner.display_name)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    /// Wrap an admitted connection and start its writer task. The session is
    /// `Connecting` until [`SessionHandle::mark_connected`]. Must be called
    /// from within a tokio runtime.
    pub fn new(
        id: ClientId,
        display_name: String,
        peer: SocketAddr,
        writer: SessionWriter,
        io_timeout: Duration,
        events: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let (outbound, queued) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let closing = Arc::new(Notify::new());
        let task = tokio::spawn(run_writer(
            id,
            writer,
            queued,
            closing.clone(),
            io_timeout,
            events.clone(),
        ));

        Self {
            inner: Arc::new(SessionInner {
                id,
                display_name,
                peer,
                state: AtomicU8::new(SessionState::Connecting as u8),
                outbound,
                closing,
                writer_task: Mutex::new(Some(task)),
                io_timeout,
                events,
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_byte(self.inner.state.load(Ordering::SeqCst))
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// `Connecting` to `Connected`. False if the session was already closed
    /// or connected.
    pub fn mark_connected(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Queue one message for the writer task. Never waits. Allowed until the
    /// session is `Disconnected`.
    ///
    /// A full queue raises [`SessionEvent::SendFailed`] and returns
    /// [`ServerError::Backlogged`]. A write that fails later on the writer
    /// task raises the same event from there.
    pub fn send(&self, message: &Message) -> Result<(), ServerError> {
        if self.state() == SessionState::Disconnected {
            return Err(TransportError::Closed.into());
        }

        match self.inner.outbound.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    client = %short_id(&self.inner.id),
                    control = ?message.control,
                    queued = OUTBOUND_QUEUE_CAPACITY,
                    "Outbound queue full, peer is not reading"
                );
                let _ = self.inner.events.try_send(ServerEvent::Session {
                    client: self.inner.id,
                    event: SessionEvent::SendFailed("outbound queue full".to_string()),
                });
                Err(ServerError::Backlogged(self.inner.id))
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed.into()),
        }
    }

    /// Explicit disconnect. Whatever is already queued is still written,
    /// then the connection is shut down. The receive loop will not raise
    /// [`SessionEvent::Disconnected`] afterwards.
    pub fn close(&self) {
        self.inner
            .state
            .store(SessionState::Disconnected as u8, Ordering::SeqCst);
        self.inner.closing.notify_one();
        debug!(client = %short_id(&self.inner.id), "Session closing");
    }

    /// Wait, at most the I/O timeout, for the writer task to finish.
    pub async fn closed(&self) {
        let task = self
            .inner
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(self.inner.io_timeout, task).await;
        }
    }

    /// Flip to `Disconnected`; true only for the first caller.
    fn mark_disconnected(&self) -> bool {
        self.inner
            .state
            .swap(SessionState::Disconnected as u8, Ordering::SeqCst)
            != SessionState::Disconnected as u8
    }
}

/// Drain the outbound queue onto the wire until the session is closed, every
/// handle is gone, or a write fails.
async fn run_writer(
    client: ClientId,
    mut writer: SessionWriter,
    mut queued: mpsc::Receiver<Message>,
    closing: Arc<Notify>,
    io_timeout: Duration,
    events: mpsc::Sender<ServerEvent>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = closing.notified() => None,
            next = queued.recv() => match next {
                Some(message) => Some(message),
                None => break,
            },
        };
        let Some(message) = next else {
            // Closing: flush what was queued before the close, nothing after.
            queued.close();
            while let Some(message) = queued.recv().await {
                if send_message_timeout(&mut writer, &message, io_timeout).await.is_err() {
                    break;
                }
            }
            break;
        };

        if let Err(e) = send_message_timeout(&mut writer, &message, io_timeout).await {
            warn!(
                client = %short_id(&client),
                control = ?message.control,
                error = %e,
                "Send failed"
            );
            let _ = events
                .send(ServerEvent::Session {
                    client,
                    event: SessionEvent::SendFailed(e.to_string()),
                })
                .await;
            break;
        }
    }

    let _ = tokio::time::timeout(io_timeout, writer.shutdown()).await;
    debug!(client = %short_id(&client), "Session writer stopped");
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// Read frames until the peer goes away, forwarding each request to the
/// server loop.
pub async fn run_receive_loop(session: SessionHandle, mut reader: SessionReader) {
    let client = session.id();
    let events = session.inner.events.clone();

    loop {
        let mut message = match receive_message(&mut reader).await {
            Ok(message) => message,
            Err(TransportError::Closed) => {
                info!(client = %short_id(&client), "Client closed the connection");
                break;
            }
            Err(e) => {
                warn!(client = %short_id(&client), error = %e, "Receive failed, dropping session");
                break;
            }
        };

        if message.sender_id != client {
            debug!(
                client = %short_id(&client),
                claimed = %message.sender_id,
                "Overriding sender id"
            );
            message.sender_id = client;
        }

        let request = match ClientRequest::try_from(message) {
            Ok(ClientRequest::Connect { .. }) => {
                debug!(client = %short_id(&client), "Ignoring repeated connection request");
                continue;
            }
            Ok(request) => request,
            Err(e) => {
                warn!(client = %short_id(&client), error = %e, "Dropping malformed request");
                continue;
            }
        };

        let event = ServerEvent::Session {
            client,
            event: SessionEvent::Request(request),
        };
        if events.send(event).await.is_err() {
            debug!(client = %short_id(&client), "Server loop gone, stopping receive loop");
            break;
        }
    }

    if session.mark_disconnected() {
        let _ = events
            .send(ServerEvent::Session {
                client,
                event: SessionEvent::Disconnected,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanchat_net::send_message;
    use uuid::Uuid;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn split(stream: tokio::io::DuplexStream) -> (SessionReader, SessionWriter) {
        let (r, w) = tokio::io::split(stream);
        (Box::new(r), Box::new(w))
    }

    #[tokio::test]
    async fn test_handshake_accepts_connection_request() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (reader, writer) = split(server);
        let id = Uuid::new_v4();

        let hello = Message::control(ControlInfo::ClientRequestConnection, id, NULL_ID).with_text("alice\n");
        send_message(&mut client, &hello).await.unwrap();

        let pending = handshake(reader, writer, peer(), Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pending.client_id, id);
        assert_eq!(pending.display_name, "alice");
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_first_message() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (reader, writer) = split(server);

        let msg = Message::group(Uuid::new_v4(), NULL_ID, "hi");
        send_message(&mut client, &msg).await.unwrap();

        let pending = handshake(reader, writer, peer(), Duration::from_secs(1), Duration::from_secs(1)).await;
        assert!(pending.is_none());

        let reply = receive_message(&mut client).await.unwrap();
        assert_eq!(reply.control, ControlInfo::ConnectionRejected);
        assert_eq!(reply.text.as_deref(), Some(REASON_NOT_A_CONNECTION_REQUEST));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let (_client, server) = tokio::io::duplex(4096);
        let (reader, writer) = split(server);
        let pending = handshake(reader, writer, peer(), Duration::from_millis(20), Duration::from_secs(1)).await;
        assert!(pending.is_none());
    }

    #[tokio::test]
    async fn test_receive_loop_forwards_requests_and_disconnect_once() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (reader, writer) = split(server);
        let (tx, mut rx) = mpsc::channel(16);
        let id = Uuid::new_v4();
        let session = SessionHandle::new(id, "bob".into(), peer(), writer, Duration::from_secs(1), tx);

        let task = tokio::spawn(run_receive_loop(session.clone(), reader));

        // Claimed sender id is replaced with the session's own.
        let room = Uuid::new_v4();
        let msg = Message::control(ControlInfo::RequestJoinChatroom, Uuid::new_v4(), room);
        send_message(&mut client, &msg).await.unwrap();

        match rx.recv().await.unwrap() {
            ServerEvent::Session {
                client: from,
                event: SessionEvent::Request(ClientRequest::JoinChatroom(r)),
            } => {
                assert_eq!(from, id);
                assert_eq!(r, room);
            }
            other => panic!("unexpected event {other:?}"),
        }

        drop(client);
        task.await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::Session {
                event: SessionEvent::Disconnected,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.mark_disconnected());
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_session_open() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (reader, writer) = split(server);
        let (tx, mut rx) = mpsc::channel(16);
        let id = Uuid::new_v4();
        let session = SessionHandle::new(id, "carol".into(), peer(), writer, Duration::from_secs(1), tx);
        assert!(session.mark_connected());
        tokio::spawn(run_receive_loop(session.clone(), reader));

        let bad = Message::control(ControlInfo::RequestFileDownload, id, NULL_ID).with_text("nonsense");
        send_message(&mut client, &bad).await.unwrap();
        let good = Message::group(id, NULL_ID, "still here");
        send_message(&mut client, &good).await.unwrap();

        match rx.recv().await.unwrap() {
            ServerEvent::Session {
                event: SessionEvent::Request(ClientRequest::GroupMessage(m)),
                ..
            } => assert_eq!(m.text.as_deref(), Some("still here")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_state_moves_forward_only() {
        let (_client, server) = tokio::io::duplex(4096);
        let (_reader, writer) = split(server);
        let (tx, _rx) = mpsc::channel(16);
        let session = SessionHandle::new(Uuid::new_v4(), "gina".into(), peer(), writer, Duration::from_secs(1), tx);

        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.is_connected());
        session.send(&Message::system(session.id(), "accepted soon")).unwrap();

        assert!(session.mark_connected());
        assert!(session.is_connected());
        assert!(!session.mark_connected());

        session.close();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.mark_connected());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (_reader, writer) = split(server);
        let (tx, _rx) = mpsc::channel(16);
        let session = SessionHandle::new(Uuid::new_v4(), "dave".into(), peer(), writer, Duration::from_secs(1), tx);

        let msg = Message::system(session.id(), "hello");
        session.send(&msg).unwrap();
        session.send(&msg.clone().with_text("queued before close")).unwrap();
        session.close();
        assert!(matches!(
            session.send(&msg),
            Err(ServerError::Transport(TransportError::Closed))
        ));
        session.closed().await;

        // Queued frames are flushed, then the stream ends.
        assert_eq!(receive_message(&mut client).await.unwrap().text.as_deref(), Some("hello"));
        assert_eq!(
            receive_message(&mut client).await.unwrap().text.as_deref(),
            Some("queued before close")
        );
        assert!(matches!(receive_message(&mut client).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_full_queue_reports_without_waiting() {
        // Tiny pipe that nobody reads: the writer task blocks on the first frame.
        let (_client, server) = tokio::io::duplex(64);
        let (_reader, writer) = split(server);
        let (tx, mut rx) = mpsc::channel(16);
        let session = SessionHandle::new(Uuid::new_v4(), "erin".into(), peer(), writer, Duration::from_secs(30), tx);

        let msg = Message::system(session.id(), "x".repeat(1024));
        let started = tokio::time::Instant::now();
        let failures = (0..OUTBOUND_QUEUE_CAPACITY + 2)
            .filter(|_| session.send(&msg).is_err())
            .count();
        assert!(failures >= 1);
        assert!(started.elapsed() < Duration::from_secs(1));

        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap() {
            ServerEvent::Session {
                client,
                event: SessionEvent::SendFailed(_),
            } => assert_eq!(client, session.id()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_timeout_reports_send_failed() {
        let (_client, server) = tokio::io::duplex(64);
        let (_reader, writer) = split(server);
        let (tx, mut rx) = mpsc::channel(16);
        let session = SessionHandle::new(Uuid::new_v4(), "frank".into(), peer(), writer, Duration::from_millis(50), tx);

        session.send(&Message::system(session.id(), "y".repeat(4096))).unwrap();

        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap(),
            ServerEvent::Session {
                event: SessionEvent::SendFailed(_),
                ..
            }
        ));
    }
}
