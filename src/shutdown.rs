//! Shutdown state machine.
//!
//! ```text
//!   SIGUSR1 ----------+
//!   SIGINT/QUIT/TERM -+--> ShutdownRequest --> Coordinator --watch--> ShutdownHandle::observe()
//!   Acceptor (fatal) -+                          |
//!                                                v
//!                                         ExitProtocol::run -> ExitStatus
//! ```
//!
//! `Uninitiated` moves to exactly one of `CommitRequested`, `AbortRequested`
//! or `MainDriven` and stays there. The coordinator is the only writer of
//! the watch channel.

mod coordinator;
mod operator;
mod signals;
mod state;

pub use coordinator::{Coordinator, ShutdownHandle, channel};
pub use operator::{FixedAnswer, Operator, Terminal, WaitPolicy};
pub use signals::{ControlSignals, request_for};
pub use state::{ShutdownRequest, ShutdownState};
