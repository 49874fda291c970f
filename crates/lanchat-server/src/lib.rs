//! # lanchat-server
//!
//! LAN chat server library. One [`ChatServer`] loop owns every connected
//! client, every chatroom and the on-disk file store:
//! - **Sessions** handshake new connections and forward each request to the
//!   loop over a channel
//! - **Chatrooms** track membership and fan messages out to members
//! - **File store** keeps uploads under `<storage root>/<room or client id>/`
//!
//! The `lanchat-server` binary wraps this with environment configuration
//! and logging.

pub mod chatroom;
pub mod config;
pub mod error;
pub mod file_store;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::ChatServer;
