use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::state::{ShutdownRequest, ShutdownState};
use crate::exit::{ExitProtocol, ExitStatus};

/// Creates the coordinator and the first handle onto it.
pub fn channel() -> (Coordinator, ShutdownHandle) {
    let (state_tx, state_rx) = watch::channel(ShutdownState::Uninitiated);
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    (
        Coordinator {
            state: state_tx,
            requests: request_rx,
        },
        ShutdownHandle {
            state: state_rx,
            requests: request_tx,
        },
    )
}

/// Read access to the shutdown state plus the ability to ask for a
/// transition.
///
/// Handles never change the state themselves. Requests go to the
/// [`Coordinator`], which is the only writer.
#[derive(Clone)]
pub struct ShutdownHandle {
    state: watch::Receiver<ShutdownState>,
    requests: mpsc::UnboundedSender<ShutdownRequest>,
}

impl ShutdownHandle {
    /// The current state. Once terminal, every call returns the same value.
    pub fn observe(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Asks the coordinator to end the session.
    pub fn request(&self, request: ShutdownRequest) {
        if self.requests.send(request).is_err() {
            tracing::debug!(?request, "shutdown coordinator is gone, request dropped");
        }
    }

    /// Waits for the next published state.
    ///
    /// Never returns if the coordinator is dropped without publishing.
    pub async fn changed(&mut self) -> ShutdownState {
        if self.state.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.state.borrow_and_update()
    }

    /// Waits until the state is terminal.
    pub async fn terminal(&mut self) -> ShutdownState {
        let reached = self
            .state
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state);
        match reached {
            Ok(state) => state,
            Err(_) => std::future::pending().await,
        }
    }
}

/// The single owner of the shutdown state machine.
pub struct Coordinator {
    state: watch::Sender<ShutdownState>,
    requests: mpsc::UnboundedReceiver<ShutdownRequest>,
}

impl Coordinator {
    /// Drives the session to its end.
    ///
    /// Applies shutdown requests until the acceptor stops, then runs exactly
    /// one exit path and returns the resulting status.
    pub async fn run(self, mut acceptor: JoinHandle<ShutdownState>, exit: ExitProtocol) -> ExitStatus {
        let Coordinator {
            state,
            mut requests,
        } = self;

        let joined = loop {
            tokio::select! {
                Some(request) = requests.recv() => {
                    decide(&state, request);
                }
                joined = &mut acceptor => break joined,
            }
        };

        let current = *state.borrow();
        // Requests arriving during the exit protocol are logged and dropped.
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                decide(&state, request);
            }
        });

        match joined {
            Ok(stopped) if current.is_terminal() => {
                tracing::debug!(state = %stopped, "acceptor stopped");
                exit.run(current).await
            }
            Ok(stopped) => {
                tracing::error!(state = %stopped, "acceptor stopped without a shutdown request");
                exit.run(ShutdownState::AbortRequested).await;
                ExitStatus::Abnormal
            }
            Err(e) => {
                tracing::error!(error = %e, "acceptor task failed");
                exit.run(ShutdownState::AbortRequested).await;
                ExitStatus::Abnormal
            }
        }
    }
}

/// Applies `request` if the state is still open. Returns whether it won.
fn decide(state: &watch::Sender<ShutdownState>, request: ShutdownRequest) -> bool {
    let mut next = None;
    state.send_if_modified(|current| match current.apply(request) {
        Some(target) => {
            *current = target;
            next = Some(target);
            true
        }
        None => false,
    });
    match next {
        Some(target) => {
            tracing::info!(?request, state = %target, "shutdown initiated");
            true
        }
        None => {
            tracing::warn!(?request, state = %*state.borrow(), "shutdown already in progress, request ignored");
            false
        }
    }
}
