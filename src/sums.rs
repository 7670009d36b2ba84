//! Request/response plumbing to the storage-management subsystem (SUMS).
//!
//! Callers never talk to SUMS directly. They push a request tagged with their
//! [`WorkerId`](crate::session::WorkerId) into the inbox and later take the
//! reply carrying the same tag from the outbox. A single dispatcher task owns
//! the [`SumsService`] and moves entries from one queue to the other.
//!
//! ```text
//!  worker 3 --submit(3, req)--> +-------+            +-----------------+
//!  worker 5 --submit(5, req)--> | inbox | ---------> | SumsDispatcher  |
//!                               +-------+            |  SumsService    |
//!  worker 3 <--wait_reply(3)--  +--------+           +-----------------+
//!  worker 5 <--wait_reply(5)--  | outbox | <-- reply(tag, reply) --+
//!                               +--------+
//! ```
//!
//! Both queues only ever release their head entry. A consumer whose reply is
//! not at the head waits for everyone ahead of it, even when its own entry is
//! already queued further back. Requests carry a [`Ticket`] so that a reply
//! to a caller that timed out is dropped rather than handed to the next
//! caller on the same tag.

mod dispatcher;
mod error;
mod queue;
mod service;
mod types;

pub use dispatcher::SumsDispatcher;
pub use error::{QueueError, SumsError};
pub use queue::{SumsQueue, TaggedQueue, Ticket};
pub use service::{DirSums, SumsService};
pub use types::{StorageUnit, SumsReply, SumsRequest, Sunum, UnitKind};
