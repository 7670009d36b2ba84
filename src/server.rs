//! TCP server for DRMS client modules.
//!
//! This module provides the network layer that accepts client connections
//! and runs one worker per admitted client against the shared session.
//!
//! ## Architecture
//!
//! ```text
//! +--------+
//! | Server |  <- Accepts TCP connections, watches the shutdown state
//! +--------+
//!      |
//!      v
//! +-----------+     +---------+
//! | Handshake | --> | Session |  <- admit_client() hands out a ClientSlot
//! +-----------+     +---------+
//!      |
//!      v
//! +------------+
//! | Connection |  <- Per-client worker: queries, transients, SUMS requests
//! +------------+
//! ```
//!
//! ## Terminology
//!
//! - **Server**: TCP listener that spawns connections (the acceptor)
//! - **Handshake**: `Hello` exchange and authentication against the session key
//! - **Connection**: Per-client worker holding one share of the client count
//! - **Announcement**: File publishing host, port and key to modules

pub mod announce;
pub mod connection;
pub mod handshake;
pub mod listener;

pub use announce::{Announcement, ShellSyntax};
pub use connection::{Connection, ConnectionError};
pub use handshake::{AuthError, Authenticator, Credentials, Handshake, HandshakeError, SessionKey};
pub use listener::{Listener, Server, ServerOptions};
