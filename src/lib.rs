//! LAN collaboration relay
//!
//! A central relay multiplexes chat, file transfer, screen-share signalling
//! and presence over one TCP connection per peer, and relays live video and
//! audio datagrams over a single shared UDP socket.

pub mod config;
pub mod error;
pub mod model;
pub mod peer;
pub mod server;
pub mod util;

pub use error::{Error, Result};
