mod error;
mod state;

pub use error::ConnectionError;
use state::{ConnectionState, PendingSums};

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::db::{DbError, Participation, QueryResult};
use crate::protocol::{BackendMessage, FrontendMessage, ServerCodec, error_code};
use crate::server::handshake::Credentials;
use crate::session::{ClientSlot, WorkerId};
use crate::sums::{QueueError, StorageUnit, SumsQueue, SumsReply, SumsRequest, UnitKind};

/// One admitted client, serviced until it disconnects.
///
/// The connection owns the client's [`ClientSlot`]; dropping the connection
/// gives the slot back to the session.
pub struct Connection {
    framed: Framed<TcpStream, ServerCodec>,
    slot: ClientSlot,
    participation: Participation,
    sums: Option<Arc<SumsQueue>>,
    state: ConnectionState,
}

impl Connection {
    pub fn new(
        framed: Framed<TcpStream, ServerCodec>,
        slot: ClientSlot,
        credentials: &Credentials,
        sums: Option<Arc<SumsQueue>>,
    ) -> Self {
        Self {
            framed,
            slot,
            participation: Participation::from_no_share(credentials.no_share),
            sums,
            state: ConnectionState::new(),
        }
    }

    fn worker(&self) -> WorkerId {
        self.slot.worker()
    }

    /// Services the client, then collects its outstanding storage replies.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;
        self.collect_pending().await;
        tracing::debug!(
            worker = %self.worker(),
            statements = self.state.statements,
            failed = self.state.failed_statements,
            "worker finished"
        );
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let welcome = BackendMessage::AuthOk {
            worker: self.worker(),
            session: self.slot.session().id(),
        };
        self.framed.send(welcome).await?;

        while !self.handle_message().await? {}
        Ok(())
    }

    /// Handle a single message from the client.
    /// Returns true if the connection should terminate.
    async fn handle_message(&mut self) -> Result<bool, ConnectionError> {
        let message = match self.framed.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                let _ = self
                    .framed
                    .send(BackendMessage::error(error_code::PROTOCOL_VIOLATION, e.to_string()))
                    .await;
                return Err(e.into());
            }
            None => return Ok(true), // EOF - client disconnected
        };

        match message {
            FrontendMessage::Query(sql) => self.handle_query(sql).await?,
            FrontendMessage::MarkTransient { series, recnum } => {
                self.handle_mark_transient(series, recnum).await?;
            }
            FrontendMessage::SumsAlloc { bytes } => {
                self.handle_sums_submit(SumsRequest::Alloc { bytes }, PendingSums::Alloc { bytes })
                    .await?;
            }
            FrontendMessage::SumsGet { sunums, retrieve } => {
                let pending = PendingSums::Get {
                    units: sunums.len(),
                };
                self.handle_sums_submit(SumsRequest::Get { sunums, retrieve }, pending)
                    .await?;
            }
            FrontendMessage::SumsWait => self.handle_sums_wait().await?,
            FrontendMessage::Hello(_) => {
                self.send_error(error_code::PROTOCOL_VIOLATION, "already authenticated")
                    .await?;
            }
            FrontendMessage::Terminate => return Ok(true),
        }
        Ok(false)
    }

    async fn handle_query(&mut self, sql: String) -> Result<(), ConnectionError> {
        if sql.trim().is_empty() {
            self.framed
                .send(BackendMessage::CommandComplete { tag: String::new() })
                .await?;
            return Ok(());
        }

        let worker = self.worker();
        let participation = self.participation;
        let result = self
            .in_transaction(move |tx| tx.execute(worker, &sql, participation))
            .await?;
        self.state.statements += 1;

        let reply = match result {
            Ok(QueryResult::Command { tag, .. }) => BackendMessage::CommandComplete { tag },
            Ok(QueryResult::Rows { columns, rows }) => BackendMessage::Rows { columns, rows },
            Err(e) => {
                self.state.failed_statements += 1;
                tracing::debug!(worker = %worker, error = %e, "statement failed");
                BackendMessage::error(db_error_code(&e), e.to_string())
            }
        };
        self.framed.send(reply).await?;
        Ok(())
    }

    async fn handle_mark_transient(
        &mut self,
        series: String,
        recnum: i64,
    ) -> Result<(), ConnectionError> {
        let worker = self.worker();
        let session = self.slot.session().id();
        let participation = self.participation;
        let result = self
            .in_transaction(move |tx| {
                tx.mark_transient(worker, session, &series, recnum, participation)
            })
            .await?;

        let reply = match result {
            Ok(()) => BackendMessage::CommandComplete {
                tag: "TRANSIENT 1".to_string(),
            },
            Err(e) => BackendMessage::error(db_error_code(&e), e.to_string()),
        };
        self.framed.send(reply).await?;
        Ok(())
    }

    async fn handle_sums_submit(
        &mut self,
        request: SumsRequest,
        pending: PendingSums,
    ) -> Result<(), ConnectionError> {
        let Some(queue) = self.sums.clone() else {
            return self
                .send_error(error_code::STORAGE_ERROR, "storage subsystem is not available")
                .await;
        };
        match queue.submit(self.worker(), request) {
            Ok(_) => {
                let pending = self.state.submitted(pending);
                self.framed
                    .send(BackendMessage::SumsSubmitted {
                        pending: pending as u32,
                    })
                    .await?;
                Ok(())
            }
            Err(QueueError::Closed) => {
                self.send_error(error_code::ADMIN_SHUTDOWN, "session is shutting down")
                    .await
            }
        }
    }

    async fn handle_sums_wait(&mut self) -> Result<(), ConnectionError> {
        let Some(queue) = self.sums.clone() else {
            return self
                .send_error(error_code::STORAGE_ERROR, "storage subsystem is not available")
                .await;
        };
        if self.state.pending() == 0 {
            return self
                .send_error(error_code::PROTOCOL_VIOLATION, "no storage request pending")
                .await;
        }

        match queue.wait_reply(self.worker()).await {
            Ok(reply) => {
                self.record_reply(&reply);
                self.framed.send(BackendMessage::SumsReply(reply)).await?;
                Ok(())
            }
            Err(QueueError::Closed) => {
                self.state.abandon();
                self.send_error(error_code::ADMIN_SHUTDOWN, "session is shutting down")
                    .await
            }
        }
    }

    /// Registers allocated data units with the session.
    fn record_reply(&mut self, reply: &SumsReply) {
        let request = self.state.answered();
        if let SumsReply::Allocated { sunum, path } = reply {
            tracing::debug!(worker = %self.worker(), %sunum, ?request, "data unit allocated");
            self.slot.session().add_unit(StorageUnit {
                sunum: *sunum,
                path: path.clone(),
                kind: UnitKind::Data,
            });
        }
    }

    /// Takes every reply still queued for this worker so none is left
    /// blocking the head of the outbox.
    async fn collect_pending(&mut self) {
        let Some(queue) = self.sums.clone() else {
            return;
        };
        while self.state.oldest().is_some() {
            match queue.wait_reply(self.worker()).await {
                Ok(reply) => self.record_reply(&reply),
                Err(QueueError::Closed) => {
                    let abandoned = self.state.abandon();
                    tracing::debug!(worker = %self.worker(), abandoned, "storage replies abandoned");
                }
            }
        }
    }

    async fn send_error(&mut self, code: &str, message: &str) -> Result<(), ConnectionError> {
        self.framed
            .send(BackendMessage::error(code, message))
            .await?;
        Ok(())
    }

    /// Runs `f` on the shared transaction from the blocking pool.
    async fn in_transaction<T, F>(&self, f: F) -> Result<T, ConnectionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut crate::db::SharedTransaction) -> T + Send + 'static,
    {
        let session = Arc::clone(self.slot.session());
        Ok(tokio::task::spawn_blocking(move || session.with_transaction(f)).await?)
    }
}

fn db_error_code(error: &DbError) -> &'static str {
    match error {
        DbError::TransactionAborted | DbError::TransactionEnded => {
            error_code::IN_FAILED_TRANSACTION
        }
        DbError::NotActive(_) | DbError::TransactionControl(_) => {
            error_code::INVALID_TRANSACTION_STATE
        }
        DbError::Disconnected => error_code::ADMIN_SHUTDOWN,
        DbError::UnexpectedResult(_) => error_code::INTERNAL_ERROR,
        DbError::Sqlite(_) | DbError::Backend(_) => error_code::SQL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_codes() {
        assert_eq!(db_error_code(&DbError::TransactionAborted), "25P02");
        assert_eq!(db_error_code(&DbError::TransactionEnded), "25P02");
        assert_eq!(
            db_error_code(&DbError::TransactionControl("COMMIT".to_string())),
            "25000"
        );
        assert_eq!(db_error_code(&DbError::Backend("x".to_string())), "42000");
    }
}
