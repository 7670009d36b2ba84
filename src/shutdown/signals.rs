use std::io;

use nix::sys::signal::Signal;
use tokio::signal::unix::{Signal as UnixSignal, SignalKind, signal};
use tokio::task::JoinHandle;

use super::coordinator::ShutdownHandle;
use super::state::ShutdownRequest;

/// The shutdown request a control signal stands for.
pub fn request_for(signal: Signal) -> Option<ShutdownRequest> {
    match signal {
        Signal::SIGUSR1 => Some(ShutdownRequest::Commit),
        Signal::SIGINT | Signal::SIGQUIT | Signal::SIGTERM => Some(ShutdownRequest::Abort),
        _ => None,
    }
}

/// Handlers for the control signals.
///
/// Installing replaces the default disposition, which would kill the
/// process, so it has to happen before the session is announced. Signals
/// that arrive before [`forward`](Self::forward) are held by the streams
/// and delivered once forwarding starts.
pub struct ControlSignals {
    usr1: UnixSignal,
    int: UnixSignal,
    quit: UnixSignal,
    term: UnixSignal,
}

impl ControlSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            usr1: signal(SignalKind::user_defined1())?,
            int: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            term: signal(SignalKind::terminate())?,
        })
    }

    /// Forwards each control signal to the coordinator as a
    /// [`ShutdownRequest`].
    ///
    /// Handlers stay installed for the life of the process, so a second
    /// signal during the exit protocol is logged by the coordinator instead
    /// of killing the server.
    pub fn forward(self, handle: ShutdownHandle) -> JoinHandle<()> {
        let Self {
            mut usr1,
            mut int,
            mut quit,
            mut term,
        } = self;
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = usr1.recv() => Signal::SIGUSR1,
                    Some(()) = int.recv() => Signal::SIGINT,
                    Some(()) = quit.recv() => Signal::SIGQUIT,
                    Some(()) = term.recv() => Signal::SIGTERM,
                    else => break,
                };
                if let Some(request) = request_for(received) {
                    tracing::info!(signal = received.as_str(), ?request, "control signal received");
                    handle.request(request);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_mapping() {
        assert_eq!(request_for(Signal::SIGUSR1), Some(ShutdownRequest::Commit));
        for abort in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
            assert_eq!(request_for(abort), Some(ShutdownRequest::Abort));
        }
        assert_eq!(request_for(Signal::SIGHUP), None);
    }
}
