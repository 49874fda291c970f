//! Raw protocol against a live server on an ephemeral port.

use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use lanchat_net::file_transfer::REASON_FILE_EXISTS;
use lanchat_net::{
    receive_file, receive_message, send_file, send_message, FileTransferError, InfoPacket,
    TransferTimeouts,
};
use lanchat_server::server::REASON_UNKNOWN_UPLOAD_TARGET;
use lanchat_server::session::{REASON_DUPLICATE_ID, REASON_NOT_A_CONNECTION_REQUEST, REASON_SERVER_FULL};
use lanchat_server::{ChatServer, ServerConfig, ServerError};
use lanchat_shared::constants::{FILE_HASH_LENGTH, FILE_RESPONSE_LENGTH, NULL_ID, PUBLIC_ROOM_ID};
use lanchat_shared::listing::{parse_chatrooms, parse_clients, parse_file_record, parse_files};
use lanchat_shared::protocol::{encode_download_payload, parse_port};
use lanchat_shared::{ControlInfo, Message, MessageKind};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    storage: TempDir,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
}

async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

async fn start_server_with(tweak: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let storage = TempDir::new().unwrap();
    let mut config = ServerConfig {
        chat_addr: "127.0.0.1:0".parse().unwrap(),
        storage_path: storage.path().to_path_buf(),
        handshake_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_secs(2),
        transfer_accept_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    };
    tweak(&mut config);

    let server = ChatServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));

    TestServer {
        addr,
        storage,
        shutdown,
        task,
    }
}

async fn next(stream: &mut TcpStream) -> Message {
    timeout(WAIT, receive_message(stream))
        .await
        .expect("timed out waiting for a message")
        .expect("receive failed")
}

async fn wait_for(stream: &mut TcpStream, pred: impl Fn(&Message) -> bool) -> Message {
    loop {
        let message = next(stream).await;
        if pred(&message) {
            return message;
        }
    }
}

/// Open a chat connection and return the server's handshake reply.
async fn connect_as(addr: SocketAddr, id: Uuid, name: &str) -> (TcpStream, Message) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let hello = Message::control(ControlInfo::ClientRequestConnection, id, NULL_ID).with_text(name);
    send_message(&mut stream, &hello).await.unwrap();
    let reply = next(&mut stream).await;
    (stream, reply)
}

async fn connect(addr: SocketAddr, name: &str) -> (Uuid, TcpStream) {
    let id = Uuid::new_v4();
    let (stream, reply) = connect_as(addr, id, name).await;
    assert_eq!(reply.control, ControlInfo::ConnectionAccepted);
    (id, stream)
}

/// Ask for an upload slot and return the port the server opened.
async fn open_upload(stream: &mut TcpStream, client: Uuid, target: Uuid) -> u16 {
    send_message(stream, &Message::control(ControlInfo::RequestFileUpload, client, target))
        .await
        .unwrap();
    let opened = wait_for(stream, is_control(ControlInfo::FtpPortOpened)).await;
    assert_eq!(opened.sender_id, target);
    parse_port(opened.text.as_deref().unwrap()).unwrap()
}

async fn upload(
    stream: &mut TcpStream,
    client: Uuid,
    target: Uuid,
    path: &std::path::Path,
) -> Result<u64, FileTransferError> {
    let port = open_upload(stream, client, target).await;
    send_file(
        path,
        SocketAddr::from(([127, 0, 0, 1], port)),
        client,
        target,
        TransferTimeouts::default(),
        |_| {},
    )
    .await
}

fn is_kind(kind: MessageKind) -> impl Fn(&Message) -> bool {
    move |m| m.kind == kind
}

fn is_control(control: ControlInfo) -> impl Fn(&Message) -> bool {
    move |m| m.control == control
}

#[tokio::test]
async fn test_accepted_client_lands_in_public_room() {
    let server = start_server().await;
    let (id, mut a) = connect(server.addr, "alice").await;

    let joined = next(&mut a).await;
    assert_eq!(joined.control, ControlInfo::ClientJoinedChatroom);
    assert_eq!(joined.sender_id, id);
    assert_eq!(joined.target_id, PUBLIC_ROOM_ID);

    let rooms = wait_for(&mut a, is_control(ControlInfo::ListOfChatrooms)).await;
    let rooms = parse_chatrooms(rooms.text.as_deref().unwrap()).unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].id, PUBLIC_ROOM_ID);
    assert_eq!(rooms[0].name, "Public Room");
    assert_eq!(rooms[0].member_count, 1);

    let members = wait_for(&mut a, is_control(ControlInfo::ListOfClients)).await;
    assert_eq!(members.sender_id, PUBLIC_ROOM_ID);
    let members = parse_clients(members.text.as_deref().unwrap()).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].display_name, "alice");
}

#[tokio::test]
async fn test_first_message_must_be_connection_request() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    send_message(&mut stream, &Message::group(Uuid::new_v4(), PUBLIC_ROOM_ID, "hi"))
        .await
        .unwrap();

    let reply = next(&mut stream).await;
    assert_eq!(reply.control, ControlInfo::ConnectionRejected);
    assert_eq!(reply.text.as_deref(), Some(REASON_NOT_A_CONNECTION_REQUEST));
}

#[tokio::test]
async fn test_duplicate_id_rejected_original_stays() {
    let server = start_server().await;
    let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
    let (mut a, reply) = connect_as(server.addr, id, "alice").await;
    assert_eq!(reply.control, ControlInfo::ConnectionAccepted);

    let (mut b, reply) = connect_as(server.addr, id, "impostor").await;
    assert_eq!(reply.control, ControlInfo::ConnectionRejected);
    assert_eq!(reply.target_id, id);
    assert_eq!(reply.text.as_deref(), Some(REASON_DUPLICATE_ID));
    let after = timeout(WAIT, receive_message(&mut b)).await.unwrap();
    assert!(after.is_err(), "rejected connection should be closed");

    send_message(&mut a, &Message::group(id, PUBLIC_ROOM_ID, "still here"))
        .await
        .unwrap();
    let echoed = wait_for(&mut a, is_kind(MessageKind::UserGroupMessage)).await;
    assert_eq!(echoed.text.as_deref(), Some("still here"));
}

#[tokio::test]
async fn test_server_full() {
    let server = start_server_with(|c| c.max_clients = 1).await;
    let (_id, _a) = connect(server.addr, "alice").await;

    let (_b, reply) = connect_as(server.addr, Uuid::new_v4(), "bob").await;
    assert_eq!(reply.control, ControlInfo::ConnectionRejected);
    assert_eq!(reply.text.as_deref(), Some(REASON_SERVER_FULL));
}

#[tokio::test]
async fn test_group_message_reaches_every_member_once() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;
    let (_b_id, mut b) = connect(server.addr, "bob").await;

    send_message(&mut a, &Message::group(a_id, PUBLIC_ROOM_ID, "hello room"))
        .await
        .unwrap();

    let got = wait_for(&mut b, is_kind(MessageKind::UserGroupMessage)).await;
    assert_eq!(got.sender_id, a_id);
    assert_eq!(got.target_id, PUBLIC_ROOM_ID);
    assert_eq!(got.text.as_deref(), Some("hello room"));

    // A private note to self marks the end of what A should have seen.
    send_message(&mut a, &Message::private(a_id, a_id, "marker"))
        .await
        .unwrap();
    let mut group_seen = 0;
    loop {
        let m = next(&mut a).await;
        match m.kind {
            MessageKind::UserGroupMessage => group_seen += 1,
            MessageKind::UserPrivateMessage => {
                assert_eq!(m.text.as_deref(), Some("marker"));
                break;
            }
            _ => {}
        }
    }
    assert_eq!(group_seen, 1);
}

#[tokio::test]
async fn test_private_message_echo_and_unknown_target() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;
    let (b_id, mut b) = connect(server.addr, "bob").await;

    send_message(&mut a, &Message::private(a_id, Uuid::new_v4(), "lost"))
        .await
        .unwrap();
    // Claimed sender ids are replaced by the server.
    send_message(&mut a, &Message::private(Uuid::new_v4(), b_id, "psst"))
        .await
        .unwrap();

    let got = wait_for(&mut b, is_kind(MessageKind::UserPrivateMessage)).await;
    assert_eq!(got.sender_id, a_id);
    assert_eq!(got.text.as_deref(), Some("psst"));

    let echo = wait_for(&mut a, is_kind(MessageKind::UserPrivateMessage)).await;
    assert_eq!(echo.target_id, b_id);
    assert_eq!(echo.text.as_deref(), Some("psst"));
}

#[tokio::test]
async fn test_create_join_and_tear_down_room() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;
    let (b_id, mut b) = connect(server.addr, "bob").await;

    let create = Message::control(ControlInfo::RequestCreateChatroom, a_id, NULL_ID).with_text("rustaceans");
    send_message(&mut a, &create).await.unwrap();

    let joined = wait_for(&mut a, |m| {
        m.control == ControlInfo::ClientJoinedChatroom && m.target_id != PUBLIC_ROOM_ID
    })
    .await;
    let room = joined.target_id;
    assert_eq!(joined.text.as_deref(), Some("You are now a member of this chatroom."));

    let listed = wait_for(&mut b, |m| {
        m.control == ControlInfo::ListOfChatrooms
            && m.text.as_deref().unwrap_or_default().contains("rustaceans")
    })
    .await;
    let rooms = parse_chatrooms(listed.text.as_deref().unwrap()).unwrap();
    assert_eq!(rooms[0].id, PUBLIC_ROOM_ID);
    let created = rooms.iter().find(|r| r.id == room).unwrap();
    assert_eq!(created.member_count, 1);

    send_message(&mut b, &Message::control(ControlInfo::RequestJoinChatroom, b_id, room))
        .await
        .unwrap();
    let notice = wait_for(&mut a, |m| {
        m.control == ControlInfo::ClientJoinedChatroom && m.sender_id == b_id && m.target_id == room
    })
    .await;
    assert_eq!(notice.text.as_deref(), Some("Client 'bob' has joined the chat."));

    let work = TempDir::new().unwrap();
    let src = work.path().join("plan.txt");
    tokio::fs::write(&src, b"world domination").await.unwrap();
    upload(&mut a, a_id, room, &src).await.unwrap();
    wait_for(&mut a, |m| m.control == ControlInfo::FileAvailable && m.target_id == room).await;
    let folder = server.storage.path().join(room.to_string());
    assert!(folder.join("plan.txt").exists());

    send_message(&mut a, &Message::control(ControlInfo::RequestLeaveChatroom, a_id, room))
        .await
        .unwrap();
    let left = wait_for(&mut b, is_control(ControlInfo::ClientLeftChatroom)).await;
    assert_eq!(left.sender_id, a_id);
    assert_eq!(left.text.as_deref(), Some("Client 'alice' has left the chat."));

    send_message(&mut b, &Message::control(ControlInfo::RequestLeaveChatroom, b_id, room))
        .await
        .unwrap();
    let listed = wait_for(&mut a, |m| {
        m.control == ControlInfo::ListOfChatrooms
            && parse_chatrooms(m.text.as_deref().unwrap_or_default())
                .map(|rooms| rooms.iter().all(|r| r.id != room))
                .unwrap_or(false)
    })
    .await;
    assert_eq!(parse_chatrooms(listed.text.as_deref().unwrap()).unwrap().len(), 1);
    assert!(!folder.exists(), "room folder should be deleted with the room");
}

#[tokio::test]
async fn test_disconnect_notifies_room() {
    let server = start_server().await;
    let (_a_id, mut a) = connect(server.addr, "alice").await;
    let (b_id, b) = connect(server.addr, "bob").await;

    drop(b);

    let left = wait_for(&mut a, is_control(ControlInfo::ClientLeftChatroom)).await;
    assert_eq!(left.sender_id, b_id);
    assert_eq!(left.target_id, PUBLIC_ROOM_ID);
    assert_eq!(left.text.as_deref(), Some("Client 'bob' has left the chat."));
}

#[tokio::test]
async fn test_upload_then_download_round_trip() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;

    let src_dir = TempDir::new().unwrap();
    let src = src_dir.path().join("notes.bin");
    let mut data = vec![0u8; 100_000];
    rand::thread_rng().fill_bytes(&mut data);
    tokio::fs::write(&src, &data).await.unwrap();

    send_message(&mut a, &Message::control(ControlInfo::RequestFileUpload, a_id, PUBLIC_ROOM_ID))
        .await
        .unwrap();
    let opened = wait_for(&mut a, is_control(ControlInfo::FtpPortOpened)).await;
    assert_eq!(opened.sender_id, PUBLIC_ROOM_ID);
    let port = parse_port(opened.text.as_deref().unwrap()).unwrap();

    let sent = send_file(
        &src,
        SocketAddr::from(([127, 0, 0, 1], port)),
        a_id,
        PUBLIC_ROOM_ID,
        TransferTimeouts::default(),
        |_| {},
    )
    .await
    .unwrap();
    assert_eq!(sent, data.len() as u64);

    let available = wait_for(&mut a, is_control(ControlInfo::FileAvailable)).await;
    assert_eq!(available.sender_id, a_id);
    assert_eq!(available.target_id, PUBLIC_ROOM_ID);
    let record = parse_file_record(available.text.as_deref().unwrap()).unwrap();
    assert_eq!(record.name, "notes.bin");
    assert_eq!(record.size, data.len() as u64);

    let listing = wait_for(&mut a, is_control(ControlInfo::ListOfFiles)).await;
    assert_eq!(listing.sender_id, PUBLIC_ROOM_ID);
    let files = parse_files(listing.text.as_deref().unwrap()).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].uploader, "alice");

    let stored = server
        .storage
        .path()
        .join(PUBLIC_ROOM_ID.to_string())
        .join("notes.bin");
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), data);

    // Unspecified address: the server pushes to our peer address instead.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let request = Message::control(ControlInfo::RequestFileDownload, a_id, PUBLIC_ROOM_ID)
        .with_text(encode_download_payload(SocketAddr::from(([0, 0, 0, 0], port)), "notes.bin"));
    send_message(&mut a, &request).await.unwrap();

    let dest_dir = TempDir::new().unwrap();
    let dest = dest_dir.path().join("copy.bin");
    let timeouts = TransferTimeouts {
        accept: Some(WAIT),
        io: Some(WAIT),
    };
    let received = receive_file(listener, Some(dest.clone()), dest_dir.path(), timeouts, |_| {})
        .await
        .unwrap();
    assert_eq!(received.record.name, "notes.bin");
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);
}

#[tokio::test]
async fn test_download_of_missing_file_is_reported() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;

    let request = Message::control(ControlInfo::RequestFileDownload, a_id, PUBLIC_ROOM_ID)
        .with_text(encode_download_payload("127.0.0.1:9".parse().unwrap(), "nope.txt"));
    send_message(&mut a, &request).await.unwrap();

    let notice = wait_for(&mut a, is_kind(MessageKind::SystemMessage)).await;
    assert!(notice.text.unwrap().contains("nope.txt"));
}

#[tokio::test]
async fn test_remove_file_refreshes_listing() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;

    let folder = server.storage.path().join(PUBLIC_ROOM_ID.to_string());
    tokio::fs::create_dir_all(&folder).await.unwrap();
    tokio::fs::write(folder.join("old.txt"), b"stale").await.unwrap();

    let remove = Message::control(ControlInfo::RequestFileRemove, a_id, PUBLIC_ROOM_ID).with_text("old.txt");
    send_message(&mut a, &remove).await.unwrap();

    let notice = wait_for(&mut a, is_kind(MessageKind::SystemMessage)).await;
    assert_eq!(
        notice.text.as_deref(),
        Some("Client 'alice' has removed the file 'old.txt'.")
    );
    let listing = wait_for(&mut a, is_control(ControlInfo::ListOfFiles)).await;
    assert!(parse_files(listing.text.as_deref().unwrap_or_default()).unwrap().is_empty());
    assert!(!folder.join("old.txt").exists());
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let server = start_server().await;
    let (_id, mut a) = connect(server.addr, "alice").await;
    wait_for(&mut a, is_control(ControlInfo::ListOfChatrooms)).await;

    server.shutdown.send(()).unwrap();
    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();

    // Drain whatever was in flight; the stream must end.
    while timeout(WAIT, receive_message(&mut a)).await.unwrap().is_ok() {}
}

#[tokio::test]
async fn test_duplicate_upload_rejected_before_transfer() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;

    let work = TempDir::new().unwrap();
    let src = work.path().join("notes.txt");
    tokio::fs::write(&src, b"first version").await.unwrap();
    upload(&mut a, a_id, PUBLIC_ROOM_ID, &src).await.unwrap();
    wait_for(&mut a, is_control(ControlInfo::FileAvailable)).await;

    tokio::fs::write(&src, b"second version, longer").await.unwrap();
    match upload(&mut a, a_id, PUBLIC_ROOM_ID, &src).await {
        Err(FileTransferError::Rejected(reason)) => assert_eq!(reason, REASON_FILE_EXISTS),
        other => panic!("expected rejection, got {other:?}"),
    }

    let stored = server
        .storage
        .path()
        .join(PUBLIC_ROOM_ID.to_string())
        .join("notes.txt");
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"first version");
}

#[tokio::test]
async fn test_upload_to_unknown_target_is_refused() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;
    let nowhere = Uuid::new_v4();

    send_message(&mut a, &Message::control(ControlInfo::RequestFileUpload, a_id, nowhere))
        .await
        .unwrap();
    let refused = wait_for(&mut a, is_control(ControlInfo::FtpRequestRejected)).await;
    assert_eq!(refused.sender_id, nowhere);
    assert_eq!(refused.target_id, a_id);
    assert_eq!(refused.text.as_deref(), Some(REASON_UNKNOWN_UPLOAD_TARGET));
}

#[tokio::test]
async fn test_partial_upload_is_hidden() {
    let server = start_server().await;
    let (a_id, mut a) = connect(server.addr, "alice").await;
    let port = open_upload(&mut a, a_id, PUBLIC_ROOM_ID).await;

    // Start an upload by hand and stop after a few bytes.
    let mut transfer = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .unwrap();
    let info = InfoPacket {
        sender_id: a_id,
        target_id: PUBLIC_ROOM_ID,
        file_name: "partial.bin".to_string(),
        file_size: 1000,
        hash: [0; FILE_HASH_LENGTH],
    };
    transfer.write_all(&info.encode().unwrap()).await.unwrap();
    let mut response = [0u8; FILE_RESPONSE_LENGTH];
    transfer.read_exact(&mut response).await.unwrap();
    assert_eq!(response[0], 1);
    transfer.write_all(&[7u8; 10]).await.unwrap();
    transfer.flush().await.unwrap();

    let partial = server
        .storage
        .path()
        .join(PUBLIC_ROOM_ID.to_string())
        .join("partial.bin");
    assert!(partial.exists());

    // A newcomer joining the room gets the file list without it.
    let (_b_id, mut b) = connect(server.addr, "bob").await;
    let listing = wait_for(&mut b, is_control(ControlInfo::ListOfFiles)).await;
    assert!(parse_files(listing.text.as_deref().unwrap_or_default())
        .unwrap()
        .iter()
        .all(|f| f.name != "partial.bin"));

    let request = Message::control(ControlInfo::RequestFileDownload, a_id, PUBLIC_ROOM_ID)
        .with_text(encode_download_payload("127.0.0.1:9".parse().unwrap(), "partial.bin"));
    send_message(&mut a, &request).await.unwrap();
    let notice = wait_for(&mut a, is_kind(MessageKind::SystemMessage)).await;
    assert_eq!(notice.text.as_deref(), Some("The file 'partial.bin' does not exist."));

    let remove = Message::control(ControlInfo::RequestFileRemove, a_id, PUBLIC_ROOM_ID).with_text("partial.bin");
    send_message(&mut a, &remove).await.unwrap();
    // Ordering marker: once the echo arrives the removal has been handled.
    send_message(&mut a, &Message::private(a_id, a_id, "marker")).await.unwrap();
    wait_for(&mut a, is_kind(MessageKind::UserPrivateMessage)).await;
    assert!(partial.exists());
}

#[tokio::test]
async fn test_stalled_reader_does_not_hold_up_others() {
    let server = start_server_with(|c| c.io_timeout = Duration::from_secs(2)).await;

    // Connects and never reads again.
    let (stalled_id, _stalled) = connect(server.addr, "stalled").await;

    let (b_id, b) = connect(server.addr, "bob").await;
    let (mut b_read, mut b_write) = b.into_split();
    tokio::spawn(async move { while receive_message(&mut b_read).await.is_ok() {} });

    let big = "x".repeat(1024 * 1024);
    for _ in 0..40 {
        send_message(&mut b_write, &Message::group(b_id, PUBLIC_ROOM_ID, big.as_str()))
            .await
            .unwrap();
    }

    // A fresh client is admitted promptly while the stalled one is still
    // clogged.
    let started = tokio::time::Instant::now();
    let (_c_id, mut c) = connect(server.addr, "carol").await;
    assert!(started.elapsed() < WAIT);

    // The stalled client is dropped once its writes time out.
    let left = wait_for(&mut c, |m| {
        m.control == ControlInfo::ClientLeftChatroom && m.sender_id == stalled_id
    })
    .await;
    assert_eq!(left.target_id, PUBLIC_ROOM_ID);
}
