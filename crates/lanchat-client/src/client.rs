//! Collaborator-facing chat client.
//!
//! [`ChatClient::connect`] performs the handshake and hands back a receiver
//! of [`ClientEvent`]s. A background task reads the chat connection, keeps
//! [`ClientState`] current and starts file transfers when the server opens
//! a port for them.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use lanchat_net::{
    receive_file, receive_message, receive_message_timeout, send_file, send_message_timeout,
    TransferProgress, TransferTimeouts, TransportError,
};
use lanchat_shared::constants::NULL_ID;
use lanchat_shared::listing::{
    parse_chatrooms, parse_clients, parse_file_record, parse_files, ChatroomEntry, ClientEntry,
};
use lanchat_shared::protocol::{encode_download_payload, parse_port};
use lanchat_shared::types::{sanitize_name, short_id};
use lanchat_shared::{ChatroomId, ClientId, ControlInfo, Message, MessageKind, PayloadError};

use crate::error::ClientError;
use crate::events::{ClientEvent, TransferDirection};
use crate::state::ClientState;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Fixed client id. A random one is generated when `None`.
    pub client_id: Option<ClientId>,
    /// Bound on connecting, every chat send and every transfer read/write.
    pub io_timeout: Duration,
    /// How long a download listener waits for the server to connect.
    pub transfer_accept_timeout: Duration,
    pub event_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            io_timeout: Duration::from_secs(30),
            transfer_accept_timeout: Duration::from_secs(60),
            event_channel_capacity: 256,
        }
    }
}

struct Shared {
    id: ClientId,
    server_ip: IpAddr,
    local_ip: IpAddr,
    config: ClientConfig,
    connected: AtomicBool,
    writer: AsyncMutex<OwnedWriteHalf>,
    state: Mutex<ClientState>,
    /// Files waiting for the server to open an upload port, per target.
    pending_uploads: Mutex<HashMap<Uuid, VecDeque<PathBuf>>>,
    events: mpsc::Sender<ClientEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_uploads(&self) -> MutexGuard<'_, HashMap<Uuid, VecDeque<PathBuf>>> {
        self.pending_uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending_upload(&self, target: Uuid) -> Option<PathBuf> {
        let mut pending = self.pending_uploads();
        let queue = pending.get_mut(&target)?;
        let path = queue.pop_front();
        if queue.is_empty() {
            pending.remove(&target);
        }
        path
    }

    /// Undo the most recent `upload_file` for `target`.
    fn cancel_pending_upload(&self, target: Uuid) {
        let mut pending = self.pending_uploads();
        if let Some(queue) = pending.get_mut(&target) {
            queue.pop_back();
            if queue.is_empty() {
                pending.remove(&target);
            }
        }
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Event receiver dropped");
        }
    }
}

/// A connected client. Dropping it stops the background receive task.
pub struct ChatClient {
    shared: Arc<Shared>,
    display_name: String,
    server_addr: SocketAddr,
    receive_task: JoinHandle<()>,
}

impl ChatClient {
    /// Connect and perform the handshake.
    ///
    /// A `ConnectionRejected` reply becomes [`ClientError::Rejected`] with
    /// the server's reason.
    pub async fn connect(
        server_addr: SocketAddr,
        display_name: &str,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let id = config.client_id.unwrap_or_else(Uuid::new_v4);
        let display_name = sanitize_name(display_name);

        let stream = tokio::time::timeout(config.io_timeout, TcpStream::connect(server_addr))
            .await
            .map_err(|_| TransportError::TimedOut(config.io_timeout))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let local_ip = stream.local_addr()?.ip();
        let (mut reader, mut writer) = stream.into_split();

        let hello = Message::control(ControlInfo::ClientRequestConnection, id, NULL_ID)
            .with_text(display_name.clone());
        send_message_timeout(&mut writer, &hello, config.io_timeout).await?;

        let reply = receive_message_timeout(&mut reader, config.io_timeout).await?;
        match reply.control {
            ControlInfo::ConnectionAccepted => {}
            ControlInfo::ConnectionRejected => {
                let reason = reply.text.unwrap_or_default();
                info!(server = %server_addr, reason = %reason, "Connection rejected");
                return Err(ClientError::Rejected(reason));
            }
            other => return Err(ClientError::UnexpectedReply(other)),
        }

        info!(
            client = %short_id(&id),
            name = %display_name,
            server = %server_addr,
            "Connected to chat server"
        );

        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let shared = Arc::new(Shared {
            id,
            server_ip: server_addr.ip(),
            local_ip,
            config,
            connected: AtomicBool::new(true),
            writer: AsyncMutex::new(writer),
            state: Mutex::new(ClientState::new()),
            pending_uploads: Mutex::new(HashMap::new()),
            events: events_tx,
        });
        let receive_task = tokio::spawn(receive_loop(shared.clone(), reader));

        Ok((
            Self {
                shared,
                display_name,
                server_addr,
                receive_task,
            },
            events_rx,
        ))
    }

    pub fn id(&self) -> ClientId {
        self.shared.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn known_clients(&self) -> Vec<ClientEntry> {
        self.shared.state().known_clients()
    }

    pub fn chatrooms(&self) -> Vec<ChatroomEntry> {
        self.shared.state().chatrooms().to_vec()
    }

    pub fn joined_chatrooms(&self) -> Vec<ChatroomId> {
        self.shared.state().joined_chatrooms()
    }

    pub fn chatroom_members(&self, room: ChatroomId) -> Vec<ClientEntry> {
        self.shared.state().members(&room).to_vec()
    }

    /// Send chat text to a room, or to a single client when `is_private`.
    pub async fn send_message(
        &self,
        text: &str,
        target: Uuid,
        is_private: bool,
    ) -> Result<(), ClientError> {
        let message = if is_private {
            Message::private(self.id(), target, text)
        } else {
            Message::group(self.id(), target, text)
        };
        self.send(&message).await
    }

    pub async fn request_join_chatroom(&self, room: ChatroomId) -> Result<(), ClientError> {
        self.send(&Message::control(ControlInfo::RequestJoinChatroom, self.id(), room))
            .await
    }

    pub async fn request_leave_chatroom(&self, room: ChatroomId) -> Result<(), ClientError> {
        self.send(&Message::control(ControlInfo::RequestLeaveChatroom, self.id(), room))
            .await
    }

    /// Ask for a new room. The server answers with a join notification for
    /// the new room id.
    pub async fn request_create_chatroom(&self, name: &str) -> Result<(), ClientError> {
        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(PayloadError::Missing("chatroom name").into());
        }
        let request = Message::control(ControlInfo::RequestCreateChatroom, self.id(), NULL_ID)
            .with_text(name);
        self.send(&request).await
    }

    /// Ask the server to accept `path` for a room or private peer.
    ///
    /// Returns once the request is sent. The transfer itself starts when the
    /// server opens a port and ends with [`ClientEvent::UploadFinished`] or
    /// [`ClientEvent::UploadFailed`].
    pub async fn upload_file(&self, path: impl AsRef<Path>, target: Uuid) -> Result<(), ClientError> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )
            .into());
        }

        self.shared
            .pending_uploads()
            .entry(target)
            .or_default()
            .push_back(path.to_path_buf());

        let request = Message::control(ControlInfo::RequestFileUpload, self.id(), target);
        if let Err(e) = self.send(&request).await {
            self.shared.cancel_pending_upload(target);
            return Err(e);
        }
        debug!(file = %path.display(), target_id = %target, "Upload requested");
        Ok(())
    }

    /// Open a listener and ask the server to push `file_name` from the
    /// target's folder into `save_path`.
    ///
    /// Completion is reported as [`ClientEvent::DownloadFinished`] or
    /// [`ClientEvent::DownloadFailed`].
    pub async fn download_file(
        &self,
        file_name: &str,
        target: Uuid,
        save_path: impl Into<PathBuf>,
    ) -> Result<(), ClientError> {
        let save_path = save_path.into();
        let listener = TcpListener::bind(SocketAddr::new(self.shared.local_ip, 0)).await?;
        let endpoint = listener.local_addr()?;

        let request = Message::control(ControlInfo::RequestFileDownload, self.id(), target)
            .with_text(encode_download_payload(endpoint, file_name));
        self.send(&request).await?;
        debug!(file = %file_name, target_id = %target, endpoint = %endpoint, "Download requested");

        let shared = self.shared.clone();
        let file_name = file_name.to_string();
        let timeouts = TransferTimeouts {
            accept: Some(shared.config.transfer_accept_timeout),
            io: Some(shared.config.io_timeout),
        };
        let root = save_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        tokio::spawn(async move {
            let progress =
                progress_reporter(shared.clone(), TransferDirection::Download, target, file_name.clone());
            let result = receive_file(listener, Some(save_path), &root, timeouts, progress).await;
            let event = match result {
                Ok(received) => ClientEvent::DownloadFinished {
                    target_id: target,
                    file: received.record,
                    path: received.path,
                },
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Download failed");
                    ClientEvent::DownloadFailed {
                        target_id: target,
                        file_name,
                        reason: e.to_string(),
                    }
                }
            };
            shared.emit(event).await;
        });
        Ok(())
    }

    pub async fn request_remove_file(&self, file_name: &str, target: Uuid) -> Result<(), ClientError> {
        let request = Message::control(ControlInfo::RequestFileRemove, self.id(), target)
            .with_text(file_name);
        self.send(&request).await
    }

    /// Close the connection. No [`ClientEvent::ServerDisconnected`] follows.
    pub async fn disconnect(self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.receive_task.abort();

        let mut writer = self.shared.writer.lock().await;
        let _ = tokio::time::timeout(self.shared.config.io_timeout, writer.shutdown()).await;
        info!(client = %short_id(&self.shared.id), "Disconnected from chat server");
    }

    async fn send(&self, message: &Message) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }

        let result = {
            let mut writer = self.shared.writer.lock().await;
            send_message_timeout(&mut *writer, message, self.shared.config.io_timeout).await
        };

        if let Err(e) = result {
            warn!(control = ?message.control, error = %e, "Send failed");
            let _ = self.shared.events.try_send(ClientEvent::SendFailed {
                reason: e.to_string(),
            });
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

async fn receive_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    loop {
        match receive_message(&mut reader).await {
            Ok(message) => dispatch(&shared, message).await,
            Err(TransportError::Closed) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Receive failed, dropping connection");
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.emit(ClientEvent::ServerDisconnected).await;
}

async fn dispatch(shared: &Arc<Shared>, message: Message) {
    trace!(kind = ?message.kind, control = ?message.control, "Message received");
    match interpret(shared, message) {
        Ok(Some(event)) => shared.emit(event).await,
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Dropping malformed server message"),
    }
}

/// Turn one server message into an event, updating local state on the way.
fn interpret(shared: &Arc<Shared>, message: Message) -> Result<Option<ClientEvent>, PayloadError> {
    let Message {
        kind,
        control,
        sender_id,
        target_id,
        time_sent,
        text,
        ..
    } = message;
    let text = text.unwrap_or_default();

    let event = match (kind, control) {
        (MessageKind::UserGroupMessage, _) => ClientEvent::MessageReceived {
            sender_name: shared.state().display_name(&sender_id).map(str::to_string),
            sender_id,
            room_id: target_id,
            text,
            time_sent,
        },
        (MessageKind::UserPrivateMessage, _) => ClientEvent::PrivateMessageReceived {
            sender_name: shared.state().display_name(&sender_id).map(str::to_string),
            sender_id,
            target_id,
            text,
            time_sent,
        },
        (MessageKind::SystemMessage, _) => ClientEvent::SystemMessage { target_id, text },
        (_, ControlInfo::ClientJoinedChatroom) if sender_id == shared.id => {
            shared.state().mark_joined(target_id);
            ClientEvent::JoinedChatroom { room_id: target_id }
        }
        (_, ControlInfo::ClientJoinedChatroom) => ClientEvent::ClientJoined {
            room_id: target_id,
            client_id: sender_id,
            text,
        },
        (_, ControlInfo::ClientLeftChatroom) if sender_id == shared.id => {
            shared.state().mark_left(target_id);
            ClientEvent::LeftChatroom { room_id: target_id }
        }
        (_, ControlInfo::ClientLeftChatroom) => ClientEvent::ClientLeft {
            room_id: target_id,
            client_id: sender_id,
            text,
        },
        (_, ControlInfo::ListOfClients) => {
            let clients = parse_clients(&text)?;
            shared.state().apply_client_list(sender_id, clients.clone());
            ClientEvent::ClientListUpdated {
                room_id: sender_id,
                clients,
            }
        }
        (_, ControlInfo::ListOfChatrooms) => {
            let chatrooms = parse_chatrooms(&text)?;
            shared.state().apply_chatroom_list(chatrooms.clone());
            ClientEvent::ChatroomListUpdated { chatrooms }
        }
        (_, ControlInfo::ListOfFiles) => ClientEvent::FileListReceived {
            target_id: sender_id,
            files: parse_files(&text)?,
        },
        (_, ControlInfo::FileAvailable) => ClientEvent::FileAvailable {
            uploader_id: sender_id,
            target_id,
            file: parse_file_record(&text)?,
        },
        (_, ControlInfo::FtpPortOpened) => {
            start_upload(shared, sender_id, parse_port(&text)?);
            return Ok(None);
        }
        (_, ControlInfo::FtpRequestRejected) => {
            let Some(path) = shared.take_pending_upload(sender_id) else {
                debug!(target_id = %sender_id, "Upload refusal with nothing pending");
                return Ok(None);
            };
            info!(file = %path.display(), target_id = %sender_id, reason = %text, "Upload refused");
            ClientEvent::UploadFailed {
                target_id: sender_id,
                file_name: file_name_of(&path),
                reason: text,
            }
        }
        (_, other) => {
            debug!(control = ?other, "Ignoring unexpected control message");
            return Ok(None);
        }
    };

    Ok(Some(event))
}

/// Push the oldest pending file for `target` to the port the server opened.
fn start_upload(shared: &Arc<Shared>, target: Uuid, port: u16) {
    let Some(path) = shared.take_pending_upload(target) else {
        warn!(target_id = %target, port, "Upload port opened with nothing to upload");
        return;
    };

    let addr = SocketAddr::new(shared.server_ip, port);
    let shared = shared.clone();
    tokio::spawn(async move {
        let timeouts = TransferTimeouts {
            accept: None,
            io: Some(shared.config.io_timeout),
        };
        let file_name = file_name_of(&path);

        let progress =
            progress_reporter(shared.clone(), TransferDirection::Upload, target, file_name.clone());
        let result = send_file(&path, addr, shared.id, target, timeouts, progress).await;
        let event = match result {
            Ok(bytes) => ClientEvent::UploadFinished {
                target_id: target,
                file_name,
                bytes,
            },
            Err(e) => {
                warn!(file = %file_name, error = %e, "Upload failed");
                ClientEvent::UploadFailed {
                    target_id: target,
                    file_name,
                    reason: e.to_string(),
                }
            }
        };
        shared.emit(event).await;
    });
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Progress callback that forwards a [`ClientEvent::TransferProgress`] each
/// time the transfer crosses a whole percent. Events are dropped rather than
/// waited for when the front-end lags behind.
fn progress_reporter(
    shared: Arc<Shared>,
    direction: TransferDirection,
    target: Uuid,
    file_name: String,
) -> impl FnMut(TransferProgress) {
    let mut last_percent = None;
    move |progress| {
        let fraction = progress.fraction();
        let percent = (fraction * 100.0) as u8;
        if last_percent == Some(percent) {
            return;
        }
        last_percent = Some(percent);
        trace!(
            ?direction,
            transferred = progress.transferred,
            total = progress.total,
            "Transfer progress"
        );
        let _ = shared.events.try_send(ClientEvent::TransferProgress {
            direction,
            target_id: target,
            file_name: file_name.clone(),
            fraction,
        });
    }
}
