use std::fmt;

/// Where the session is in its shutdown lifecycle.
///
/// The state only moves forward: once it leaves `Uninitiated` it never
/// changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownState {
    #[default]
    Uninitiated,
    CommitRequested,
    AbortRequested,
    /// The acceptor stopped on its own; exits like a commit.
    MainDriven,
}

impl ShutdownState {
    pub fn is_terminal(self) -> bool {
        self != ShutdownState::Uninitiated
    }

    /// Whether the exit protocol takes the commit path.
    pub fn commits(self) -> bool {
        matches!(
            self,
            ShutdownState::CommitRequested | ShutdownState::MainDriven
        )
    }

    /// The state `request` moves to, or `None` if the state is already
    /// terminal.
    pub fn apply(self, request: ShutdownRequest) -> Option<ShutdownState> {
        (!self.is_terminal()).then(|| request.target())
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownState::Uninitiated => "uninitiated",
            ShutdownState::CommitRequested => "commit requested",
            ShutdownState::AbortRequested => "abort requested",
            ShutdownState::MainDriven => "main driven",
        };
        f.write_str(s)
    }
}

/// A request to end the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    Commit,
    Abort,
    /// Sent by the acceptor when the listener can no longer accept.
    MainDriven,
}

impl ShutdownRequest {
    pub fn target(self) -> ShutdownState {
        match self {
            ShutdownRequest::Commit => ShutdownState::CommitRequested,
            ShutdownRequest::Abort => ShutdownState::AbortRequested,
            ShutdownRequest::MainDriven => ShutdownState::MainDriven,
        }
    }
}
