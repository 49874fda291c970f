use thiserror::Error;

/// Failures while turning bytes into a `Message`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Packet too short: {len} bytes (min 41)")]
    TooShort { len: usize },

    #[error("Malformed packet: {len} bytes is between header and full header length")]
    Malformed { len: usize },

    #[error("Text length mismatch: header declares {declared} bytes, packet carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unknown control code: {0:#04x}")]
    UnknownControl(u8),

    #[error("Message text is not valid UTF-8")]
    InvalidText,

    #[error("Message text too long: {len} bytes (max {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

/// Failures while interpreting the text payload of a control message.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Missing payload for {0}")]
    Missing(&'static str),

    #[error("Invalid listing: {0}")]
    InvalidListing(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Not a client request: {0}")]
    NotARequest(String),
}
