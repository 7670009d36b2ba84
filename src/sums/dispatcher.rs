use std::sync::Arc;

use tokio::task::JoinHandle;

use super::error::{QueueError, SumsError};
use super::queue::SumsQueue;
use super::service::SumsService;
use super::types::{SumsReply, SumsRequest};
use crate::session::WorkerId;

/// The task that moves requests from the inbox through the service and onto
/// the outbox.
pub struct SumsDispatcher {
    handle: JoinHandle<()>,
}

impl SumsDispatcher {
    /// Spawns the dispatcher on the current runtime.
    pub fn spawn(queue: Arc<SumsQueue>, service: Box<dyn SumsService>) -> Self {
        let handle = tokio::spawn(dispatch(queue, service));
        Self { handle }
    }

    /// Asks the dispatcher to stop after the requests already queued, then
    /// waits for it.
    pub async fn finish(self, queue: &SumsQueue) -> Result<(), SumsError> {
        if queue.submit(WorkerId::SESSION, SumsRequest::Shutdown).is_err() {
            // Already closed by a sentinel; the task exits on its own.
            tracing::debug!("SUMS queue already closed");
        }
        self.handle.await?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn dispatch(queue: Arc<SumsQueue>, mut service: Box<dyn SumsService>) {
    tracing::debug!("SUMS dispatcher started");
    loop {
        let (tag, ticket, request) = match queue.next_request().await {
            Ok(entry) => entry,
            Err(QueueError::Closed) => {
                tracing::debug!("SUMS queue closed");
                break;
            }
        };
        if request == SumsRequest::Shutdown {
            tracing::debug!(worker = %tag, "SUMS shutdown requested");
            break;
        }

        tracing::trace!(worker = %tag, ?request, "dispatching SUMS request");
        let outcome = tokio::task::spawn_blocking(move || {
            let reply = service.handle(request);
            (service, reply)
        })
        .await;
        let reply = match outcome {
            Ok((returned, reply)) => {
                service = returned;
                reply
            }
            Err(e) => {
                // The service is lost with the panicked task.
                tracing::error!(worker = %tag, error = %e, "SUMS service failed");
                let _ = queue.reply(
                    tag,
                    ticket,
                    SumsReply::Failed {
                        reason: "storage service failed".to_string(),
                    },
                );
                break;
            }
        };

        if let SumsReply::Failed { reason } = &reply {
            tracing::warn!(worker = %tag, %reason, "SUMS request failed");
        }
        if queue.reply(tag, ticket, reply).is_err() {
            tracing::debug!(worker = %tag, "reply dropped, SUMS queue closed");
            break;
        }
    }
    tracing::debug!("SUMS dispatcher stopped");
}
