//! # lanchat-client
//!
//! Client library for the LAN chat server. A front-end (console, desktop,
//! anything) connects with [`ChatClient::connect`], drives the server through
//! its methods, and renders the [`ClientEvent`]s that come back.

pub mod client;
pub mod error;
pub mod events;
pub mod state;

pub use client::{ChatClient, ClientConfig};
pub use error::ClientError;
pub use events::{ClientEvent, TransferDirection};
pub use state::ClientState;
