//! Client wire protocol.
//!
//! Modules talk to the session server over a small framed protocol modelled
//! on the PostgreSQL frontend/backend split: every frame is a type byte, a
//! big-endian `i32` length that counts itself, and the body.
//!
//! ## Architecture
//!
//! ```text
//! +----------+                           +----------+
//! |  Client  |  --- FrontendMessage -->  |  Server  |
//! | (module) |  <-- BackendMessage  ---  |  (drms)  |
//! +----------+                           +----------+
//!               ^                   ^
//!               |    ServerCodec    |
//!               |    ClientCodec    |
//!               +-------------------+
//! ```
//!
//! ## Terminology
//!
//! - **FrontendMessage**: Messages from client to server (Hello, Query, SumsAlloc, etc.)
//! - **BackendMessage**: Messages from server to client (AuthOk, Rows, SumsReply, etc.)
//! - **Codec**: Framing and serialization for the wire protocol

pub mod backend;
pub mod codec;
pub mod error;
pub mod frontend;

pub use backend::{BackendMessage, error_code};
pub use codec::{ClientCodec, PROTOCOL_VERSION, ServerCodec};
pub use error::ProtocolError;
pub use frontend::{FrontendMessage, Hello};
