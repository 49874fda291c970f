//! The orchestrator: a single loop that owns every table.
//!
//! Sessions, handshakes and file transfers run in their own tasks and talk
//! back over one `mpsc` channel or through their `JoinSet` results. Nothing
//! else ever touches the client table, the chatroom table or the file store,
//! so no locking is needed around them.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lanchat_net::{receive_file_with, send_file, FileTransferError, ReceivedFile, TransferTimeouts};
use lanchat_shared::constants::{NULL_ID, PUBLIC_ROOM_ID};
use lanchat_shared::listing::{encode_chatrooms, encode_file_record, encode_files, ChatroomEntry};
use lanchat_shared::types::short_id;
use lanchat_shared::{ChatroomId, ClientId, ClientRequest, ControlInfo, DownloadRequest, Message};

use crate::chatroom::{Chatroom, Departure};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::file_store::FileStore;
use crate::session::{
    handshake, run_receive_loop, PendingSession, ServerEvent, SessionEvent, SessionHandle,
    REASON_DUPLICATE_ID, REASON_SERVER_FULL,
};

pub const REASON_UNKNOWN_UPLOAD_TARGET: &str = "The upload target does not exist.";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a finished transfer task hands back to the loop.
enum TransferOutcome {
    Upload {
        uploader: ClientId,
        uploader_name: String,
        target: Uuid,
        result: Result<ReceivedFile, FileTransferError>,
    },
    Download {
        requester: ClientId,
        file_name: String,
        result: Result<u64, FileTransferError>,
    },
}

pub struct ChatServer {
    config: ServerConfig,
    listener: TcpListener,
    clients: HashMap<ClientId, SessionHandle>,
    chatrooms: HashMap<ChatroomId, Chatroom>,
    files: FileStore,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: mpsc::Receiver<ServerEvent>,
    handshakes: JoinSet<()>,
    receive_loops: JoinSet<()>,
    receive_handles: HashMap<ClientId, AbortHandle>,
    transfers: JoinSet<TransferOutcome>,
}

impl ChatServer {
    /// Bind the chat listener and prepare storage. The permanent default
    /// room exists from the start.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.chat_addr).await?;
        let files = FileStore::new(config.storage_path.clone()).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut chatrooms = HashMap::new();
        chatrooms.insert(
            PUBLIC_ROOM_ID,
            Chatroom::permanent(PUBLIC_ROOM_ID, config.default_room_name.clone()),
        );

        info!(
            addr = %listener.local_addr()?,
            storage = %files.root().display(),
            "Chat server listening"
        );

        Ok(Self {
            config,
            listener,
            clients: HashMap::new(),
            chatrooms,
            files,
            events_tx,
            events_rx,
            handshakes: JoinSet::new(),
            receive_loops: JoinSet::new(),
            receive_handles: HashMap::new(),
            transfers: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until Ctrl-C.
    pub async fn run_until_ctrl_c(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for Ctrl+C, running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` completes, then close every session and abort
    /// whatever is still running.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_handshake(stream, peer),
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(joined) = self.transfers.join_next() => match joined {
                    Ok(outcome) => self.finish_transfer(outcome).await,
                    Err(e) => warn!(error = %e, "Transfer task failed"),
                },
                Some(joined) = self.receive_loops.join_next() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Receive loop task failed");
                    }
                }
                Some(joined) = self.handshakes.join_next() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Handshake task failed");
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        for session in self.clients.values() {
            session.close();
        }
        join_all(self.clients.values().map(SessionHandle::closed)).await;
        let closed = self.clients.len();
        self.clients.clear();

        self.handshakes.abort_all();
        self.receive_loops.abort_all();
        self.receive_handles.clear();
        self.transfers.abort_all();

        info!(sessions = closed, "Chat server stopped");
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    fn spawn_handshake(&mut self, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "Accepted chat connection");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let events = self.events_tx.clone();
        let handshake_timeout = self.config.handshake_timeout;
        let io_timeout = self.config.io_timeout;

        self.handshakes.spawn(async move {
            let pending = handshake(
                Box::new(reader),
                Box::new(writer),
                peer,
                handshake_timeout,
                io_timeout,
            )
            .await;
            if let Some(pending) = pending {
                let _ = events.send(ServerEvent::Connected(pending)).await;
            }
        });
    }

    fn spawn_reject(&mut self, pending: PendingSession, reason: &'static str) {
        let io_timeout = self.config.io_timeout;
        self.handshakes
            .spawn(async move { pending.reject(reason, io_timeout).await });
    }

    async fn admit(&mut self, pending: PendingSession) {
        if self.clients.contains_key(&pending.client_id) {
            self.spawn_reject(pending, REASON_DUPLICATE_ID);
            return;
        }
        if self.config.max_clients != 0 && self.clients.len() >= self.config.max_clients {
            self.spawn_reject(pending, REASON_SERVER_FULL);
            return;
        }

        let PendingSession {
            client_id,
            display_name,
            peer,
            reader,
            writer,
        } = pending;
        let session = SessionHandle::new(
            client_id,
            display_name,
            peer,
            writer,
            self.config.io_timeout,
            self.events_tx.clone(),
        );

        let accepted = Message::control(ControlInfo::ConnectionAccepted, NULL_ID, client_id);
        if session.send(&accepted).is_err() {
            session.close();
            return;
        }
        session.mark_connected();

        info!(
            client = %short_id(&client_id),
            name = %session.display_name(),
            peer = %peer,
            clients = self.clients.len() + 1,
            "Client connected"
        );

        self.clients.insert(client_id, session.clone());
        let receive_loop = self.receive_loops.spawn(run_receive_loop(session, reader));
        self.receive_handles.insert(client_id, receive_loop);

        self.join_room(client_id, PUBLIC_ROOM_ID).await;
        self.broadcast_lists();
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected(pending) => self.admit(pending).await,
            ServerEvent::Session { client, event } => match event {
                SessionEvent::Request(request) => self.handle_request(client, request).await,
                SessionEvent::SendFailed(reason) => {
                    if self.clients.contains_key(&client) {
                        warn!(client = %short_id(&client), reason = %reason, "Dropping client that cannot be written to");
                    }
                    self.drop_client(client).await;
                }
                SessionEvent::Disconnected => self.drop_client(client).await,
            },
        }
    }

    async fn handle_request(&mut self, client: ClientId, request: ClientRequest) {
        if !self.clients.contains_key(&client) {
            debug!(client = %short_id(&client), "Request from unknown client ignored");
            return;
        }

        match request {
            // Filtered out by the receive loop.
            ClientRequest::Connect { .. } => {}
            ClientRequest::GroupMessage(message) => self.relay_group(client, message),
            ClientRequest::PrivateMessage(message) => self.relay_private(client, message),
            ClientRequest::JoinChatroom(room) => {
                if self.join_room(client, room).await {
                    self.broadcast_lists();
                }
            }
            ClientRequest::LeaveChatroom(room) => {
                if self.leave_room(client, room).await {
                    self.broadcast_lists();
                }
            }
            ClientRequest::CreateChatroom { name } => self.create_room(client, name).await,
            ClientRequest::FileUpload { target } => self.start_upload(client, target).await,
            ClientRequest::FileDownload(request) => self.start_download(client, request).await,
            ClientRequest::FileRemove { target, file_name } => {
                self.remove_file(client, target, file_name).await
            }
        }
    }

    /// Forget a client: stop its receive loop, close its connection and take
    /// it out of every room. Safe to call more than once.
    async fn drop_client(&mut self, client: ClientId) {
        if let Some(receive_loop) = self.receive_handles.remove(&client) {
            receive_loop.abort();
        }
        let Some(session) = self.clients.remove(&client) else {
            return;
        };
        session.close();
        info!(
            client = %short_id(&client),
            name = %session.display_name(),
            clients = self.clients.len(),
            "Client disconnected"
        );

        let rooms: Vec<ChatroomId> = self
            .chatrooms
            .values()
            .filter(|room| room.contains(&client))
            .map(Chatroom::id)
            .collect();
        for room in rooms {
            self.leave_room(client, room).await;
        }
        self.broadcast_lists();
    }

    // -----------------------------------------------------------------------
    // Messages and rooms
    // -----------------------------------------------------------------------

    fn relay_group(&self, client: ClientId, message: Message) {
        let Some(room) = self.chatrooms.get(&message.target_id) else {
            debug!(client = %short_id(&client), room = %message.target_id, "Group message to unknown room dropped");
            return;
        };
        if !room.contains(&client) {
            debug!(client = %short_id(&client), room = %short_id(&room.id()), "Group message from non-member dropped");
            return;
        }
        room.broadcast(&message, None);
    }

    fn relay_private(&self, client: ClientId, message: Message) {
        let Some(target) = self.clients.get(&message.target_id) else {
            debug!(client = %short_id(&client), target_id = %message.target_id, "Private message to unknown client dropped");
            return;
        };
        let _ = target.send(&message);

        if message.target_id != client {
            if let Some(sender) = self.clients.get(&client) {
                let _ = sender.send(&message);
            }
        }
    }

    /// Returns `true` if membership changed.
    async fn join_room(&mut self, client: ClientId, room_id: ChatroomId) -> bool {
        let Some(session) = self.clients.get(&client).cloned() else {
            return false;
        };
        let Some(room) = self.chatrooms.get_mut(&room_id) else {
            debug!(client = %short_id(&client), room = %room_id, "Join of unknown room ignored");
            return false;
        };
        if !room.add_client(session) {
            return false;
        }

        if self.files.has_folder(room_id).await {
            self.send_file_list(room_id).await;
        }
        true
    }

    /// Returns `true` if membership changed. Tears the room down if it
    /// became empty.
    async fn leave_room(&mut self, client: ClientId, room_id: ChatroomId) -> bool {
        let Some(room) = self.chatrooms.get_mut(&room_id) else {
            return false;
        };
        match room.remove_client(client) {
            Departure::NotMember => false,
            Departure::Left => true,
            Departure::LeftEmpty => {
                self.teardown_room(room_id).await;
                true
            }
        }
    }

    async fn teardown_room(&mut self, room_id: ChatroomId) {
        let Some(room) = self.chatrooms.remove(&room_id) else {
            return;
        };
        if let Err(e) = self.files.remove_target_dir(room_id).await {
            warn!(room = %short_id(&room_id), error = %e, "Failed to delete chatroom files");
        }
        info!(room = %short_id(&room_id), name = %room.name(), "Chatroom removed");
    }

    async fn create_room(&mut self, client: ClientId, name: String) {
        let room_id = Uuid::new_v4();
        info!(
            room = %short_id(&room_id),
            name = %name,
            creator = %short_id(&client),
            "Chatroom created"
        );
        self.chatrooms.insert(room_id, Chatroom::new(room_id, name));

        if !self.join_room(client, room_id).await {
            self.chatrooms.remove(&room_id);
            return;
        }
        self.broadcast_lists();
    }

    /// Room list to everyone, then every room's member list to everyone.
    fn broadcast_lists(&self) {
        let mut rooms: Vec<&Chatroom> = self.chatrooms.values().collect();
        rooms.sort_by(|a, b| {
            b.is_permanent()
                .cmp(&a.is_permanent())
                .then_with(|| a.name().cmp(b.name()))
        });

        let entries: Vec<ChatroomEntry> = rooms.iter().map(|room| room.entry()).collect();
        let room_list = Message::control(ControlInfo::ListOfChatrooms, NULL_ID, NULL_ID)
            .with_text(encode_chatrooms(&entries));
        self.broadcast_all(&room_list);

        for room in rooms {
            self.broadcast_all(&room.client_list_message());
        }
    }

    fn broadcast_all(&self, message: &Message) {
        for session in self.clients.values() {
            let _ = session.send(message);
        }
    }

    /// Deliver to a room's members or to a single client, whichever `id` names.
    fn send_to_id(&self, id: Uuid, message: &Message) {
        if let Some(room) = self.chatrooms.get(&id) {
            room.broadcast(message, None);
        } else if let Some(session) = self.clients.get(&id) {
            let _ = session.send(message);
        }
    }

    fn send_system(&self, client: ClientId, text: String) {
        if let Some(session) = self.clients.get(&client) {
            let _ = session.send(&Message::system(client, text));
        }
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    fn is_known_target(&self, target: Uuid) -> bool {
        self.chatrooms.contains_key(&target) || self.clients.contains_key(&target)
    }

    async fn send_file_list(&self, target: Uuid) {
        let files = match self.files.list_files(target).await {
            Ok(files) => files,
            Err(e) => {
                warn!(target_id = %target, error = %e, "Failed to list files");
                return;
            }
        };
        let message =
            Message::control(ControlInfo::ListOfFiles, target, NULL_ID).with_text(encode_files(&files));
        self.send_to_id(target, &message);
    }

    fn transfer_timeouts(&self, accept: Option<Duration>) -> TransferTimeouts {
        TransferTimeouts {
            accept,
            io: Some(self.config.io_timeout),
        }
    }

    async fn start_upload(&mut self, client: ClientId, target: Uuid) {
        let Some(session) = self.clients.get(&client).cloned() else {
            return;
        };
        if !self.is_known_target(target) {
            debug!(client = %short_id(&client), target_id = %target, "Upload to unknown target refused");
            let refusal = Message::control(ControlInfo::FtpRequestRejected, target, client)
                .with_text(REASON_UNKNOWN_UPLOAD_TARGET);
            let _ = session.send(&refusal);
            return;
        }

        let bind_addr = SocketAddr::new(self.config.chat_addr.ip(), 0);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to open upload listener");
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                error!(error = %e, "Upload listener has no local address");
                return;
            }
        };

        let root = self.files.root().to_path_buf();
        let in_flight = self.files.in_flight();
        let timeouts = self.transfer_timeouts(Some(self.config.transfer_accept_timeout));
        let uploader_name = session.display_name().to_string();
        self.transfers.spawn(async move {
            // Hidden from listings until this task hands the outcome back.
            let mut partial = None;
            let result = receive_file_with(
                listener,
                None,
                &root,
                timeouts,
                |path| partial = Some(in_flight.track(path)),
                |_| {},
            )
            .await;
            drop(partial);
            TransferOutcome::Upload {
                uploader: client,
                uploader_name,
                target,
                result,
            }
        });

        debug!(client = %short_id(&client), target_id = %target, port, "Upload listener opened");
        let reply = Message::control(ControlInfo::FtpPortOpened, target, client).with_text(port.to_string());
        let _ = session.send(&reply);
    }

    async fn start_download(&mut self, client: ClientId, request: DownloadRequest) {
        let Some(session) = self.clients.get(&client).cloned() else {
            return;
        };
        let DownloadRequest {
            target,
            mut endpoint,
            file_name,
        } = request;

        let path = match self.files.existing_file(target, &file_name).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                self.send_system(client, format!("The file '{}' does not exist.", file_name));
                return;
            }
            Err(e) => {
                warn!(client = %short_id(&client), file = %file_name, error = %e, "Download refused");
                self.send_system(client, format!("The file '{}' does not exist.", file_name));
                return;
            }
        };

        if endpoint.ip().is_unspecified() {
            endpoint.set_ip(session.peer().ip());
        }

        debug!(
            client = %short_id(&client),
            file = %file_name,
            endpoint = %endpoint,
            "Starting download"
        );
        let timeouts = self.transfer_timeouts(None);
        self.transfers.spawn(async move {
            let result = send_file(&path, endpoint, target, client, timeouts, |_| {}).await;
            TransferOutcome::Download {
                requester: client,
                file_name,
                result,
            }
        });
    }

    async fn remove_file(&mut self, client: ClientId, target: Uuid, file_name: String) {
        if let Some(room) = self.chatrooms.get(&target) {
            if !room.contains(&client) {
                debug!(client = %short_id(&client), room = %short_id(&target), "File removal by non-member refused");
                return;
            }
        }

        match self.files.remove_file(target, &file_name).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(target_id = %target, file = %file_name, "File to remove does not exist");
                return;
            }
            Err(e) => {
                warn!(target_id = %target, file = %file_name, error = %e, "File removal failed");
                return;
            }
        }

        let remover = self
            .clients
            .get(&client)
            .map(|s| s.display_name().to_string())
            .unwrap_or_default();
        info!(client = %short_id(&client), target_id = %target, file = %file_name, "File removed");

        let notice = Message::system(
            target,
            format!("Client '{}' has removed the file '{}'.", remover, file_name),
        );
        self.send_to_id(target, &notice);

        if self.chatrooms.contains_key(&target) {
            self.send_file_list(target).await;
        } else if target != client {
            self.send_to_id(client, &notice);
        }
    }

    async fn finish_transfer(&mut self, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Upload {
                uploader,
                uploader_name,
                target,
                result: Ok(received),
            } => self.finish_upload(uploader, &uploader_name, target, received).await,
            TransferOutcome::Upload {
                uploader,
                target,
                result: Err(e),
                ..
            } => {
                warn!(client = %short_id(&uploader), target_id = %target, error = %e, "Upload failed");
            }
            TransferOutcome::Download {
                requester,
                file_name,
                result: Ok(bytes),
            } => {
                info!(client = %short_id(&requester), file = %file_name, bytes, "Download finished");
            }
            TransferOutcome::Download {
                requester,
                file_name,
                result: Err(e),
            } => {
                warn!(client = %short_id(&requester), file = %file_name, error = %e, "Download failed");
            }
        }
    }

    async fn finish_upload(
        &mut self,
        uploader: ClientId,
        uploader_name: &str,
        target: Uuid,
        received: ReceivedFile,
    ) {
        if received.target_id != target {
            warn!(
                client = %short_id(&uploader),
                requested = %target,
                announced = %received.target_id,
                "Uploaded file went to another target, discarding"
            );
            if let Err(e) = tokio::fs::remove_file(&received.path).await {
                warn!(path = %received.path.display(), error = %e, "Failed to discard file");
            }
            return;
        }

        self.files
            .record_uploader(target, &received.record.name, uploader_name);
        info!(
            client = %short_id(&uploader),
            target_id = %target,
            file = %received.record.name,
            bytes = received.record.size,
            md5 = %received.record.hash_hex(),
            "Upload stored"
        );

        let notice = Message::control(ControlInfo::FileAvailable, uploader, target)
            .with_text(encode_file_record(&received.record));
        self.send_to_id(target, &notice);

        if self.chatrooms.contains_key(&target) {
            self.send_file_list(target).await;
        } else if target != uploader {
            self.send_to_id(uploader, &notice);
        }
    }
}
