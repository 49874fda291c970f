use uuid::Uuid;

/// Port the server listens on for chat connections
pub const CHAT_PROTOCOL_PORT: u16 = 60000;

/// Chunk size used when reading message text off a chat stream
pub const CHAT_BUFFER_SIZE: usize = 8192;

/// Chunk size used when sending/receiving file bytes
pub const FILE_BUFFER_SIZE: usize = 8192;

/// Packet header without the text length field
pub const HEADER_LENGTH: usize = 1 + 16 + 16 + 8;

/// Packet header including the 4-byte text length field
pub const FULL_HEADER_LENGTH: usize = HEADER_LENGTH + 4;

/// Largest text payload a receiver will allocate for (16 MiB)
pub const MAX_TEXT_LENGTH: usize = 16 * 1024 * 1024;

/// Zero-padded file name field in the file info packet
pub const FILE_NAME_LENGTH: usize = 256;

/// MD5 digest size in bytes
pub const FILE_HASH_LENGTH: usize = 16;

/// File info packet = SenderID + TargetID + FileName + FileSize + FileHash
pub const INFO_PACKET_LENGTH: usize = 16 + 16 + FILE_NAME_LENGTH + 8 + FILE_HASH_LENGTH;

/// Accept/reject response sent by a file receiver
pub const FILE_RESPONSE_LENGTH: usize = 256;

/// Sender or target id when there is no need to be specific (also "the server")
pub const NULL_ID: Uuid = Uuid::nil();

/// Well-known id of the permanent public room
pub const PUBLIC_ROOM_ID: Uuid = Uuid::nil();

/// Display name of the permanent public room
pub const PUBLIC_ROOM_NAME: &str = "Public Room";

/// Placeholder used in file listings when the uploader is not known
pub const UNKNOWN_UPLOADER: &str = "<UNKNOWN UPLOADER>";
