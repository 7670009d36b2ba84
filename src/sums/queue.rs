//! Worker-tagged FIFO queues with head-only removal.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::error::{QueueError, SumsError};
use super::types::{SumsReply, SumsRequest};
use crate::session::WorkerId;

enum Entry<T> {
    Item { tag: WorkerId, value: T },
    Sentinel,
}

struct QueueState<T> {
    entries: VecDeque<Entry<T>>,
    closed: bool,
}

/// A FIFO queue whose entries carry the identity of the worker they belong
/// to.
///
/// Only the head entry can be removed, and only by a consumer asking for the
/// head's tag. Once a sentinel has been pushed the queue is closed: pushes
/// fail, and every consumer whose entry is not at the head is released with
/// [`QueueError::Closed`].
pub struct TaggedQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Notified on every push, removal and close.
    changed: Notify,
}

impl<T> Default for TaggedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaggedQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    /// Appends an entry for `tag`.
    pub fn push(&self, tag: WorkerId, value: T) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.entries.push_back(Entry::Item { tag, value });
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Appends the sentinel and closes the queue.
    pub fn push_sentinel(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.entries.push_back(Entry::Sentinel);
        }
        self.changed.notify_waiters();
    }

    /// Removes the head entry if it belongs to `tag`.
    pub fn try_take(&self, tag: WorkerId) -> Result<Option<T>, QueueError> {
        let taken = {
            let mut state = self.state.lock();
            let at_head = matches!(
                state.entries.front(),
                Some(Entry::Item { tag: head, .. }) if *head == tag
            );
            if at_head && let Some(Entry::Item { value, .. }) = state.entries.pop_front() {
                value
            } else if state.closed {
                return Err(QueueError::Closed);
            } else {
                return Ok(None);
            }
        };
        self.changed.notify_waiters();
        Ok(Some(taken))
    }

    /// Removes the head entry whatever its tag.
    pub fn try_take_any(&self) -> Result<Option<(WorkerId, T)>, QueueError> {
        let taken = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            match state.entries.pop_front() {
                Some(Entry::Item { tag, value }) => (tag, value),
                Some(Entry::Sentinel) | None => return Ok(None),
            }
        };
        self.changed.notify_waiters();
        Ok(Some(taken))
    }

    /// Removes the head entry, whatever its tag, if `accept` approves it.
    pub fn take_head_if(&self, accept: impl FnOnce(WorkerId, &T) -> bool) -> Option<(WorkerId, T)> {
        let taken = {
            let mut state = self.state.lock();
            let accepted = match state.entries.front() {
                Some(Entry::Item { tag, value }) => accept(*tag, value),
                _ => false,
            };
            if !accepted {
                return None;
            }
            match state.entries.pop_front() {
                Some(Entry::Item { tag, value }) => (tag, value),
                _ => return None,
            }
        };
        self.changed.notify_waiters();
        Some(taken)
    }

    /// Waits until the head entry belongs to `tag` and removes it.
    pub async fn take(&self, tag: WorkerId) -> Result<T, QueueError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.try_take(tag)? {
                return Ok(value);
            }
            notified.await;
        }
    }

    /// Waits for any entry and removes it.
    pub async fn take_any(&self) -> Result<(WorkerId, T), QueueError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(entry) = self.try_take_any()? {
                return Ok(entry);
            }
            notified.await;
        }
    }

    /// Number of queued entries, not counting the sentinel.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| matches!(e, Entry::Item { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether an entry for `tag` is queued anywhere.
    pub fn contains(&self, tag: WorkerId) -> bool {
        self.state
            .lock()
            .entries
            .iter()
            .any(|e| matches!(e, Entry::Item { tag: t, .. } if *t == tag))
    }
}

/// Identifies one submitted request and the reply it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// The inbox/outbox pair connecting callers to the SUMS dispatcher.
///
/// Every request gets a [`Ticket`] that travels with it to the dispatcher
/// and back on the reply. A caller that stops waiting abandons its ticket:
/// the request is skipped if it is still queued and its reply is dropped
/// instead of being left at the head of the outbox.
#[derive(Default)]
pub struct SumsQueue {
    inbox: TaggedQueue<(Ticket, SumsRequest)>,
    outbox: TaggedQueue<(Ticket, SumsReply)>,
    next_ticket: AtomicU64,
    /// Locked before either queue whenever both are touched.
    abandoned: Mutex<HashSet<Ticket>>,
}

impl SumsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request on behalf of `tag` without waiting for the reply.
    pub fn submit(&self, tag: WorkerId, request: SumsRequest) -> Result<Ticket, QueueError> {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(worker = %tag, ?ticket, ?request, "SUMS request queued");
        self.inbox.push(tag, (ticket, request))?;
        Ok(ticket)
    }

    /// Waits for the next reply addressed to `tag`.
    pub async fn wait_reply(&self, tag: WorkerId) -> Result<SumsReply, QueueError> {
        let (_, reply) = self.outbox.take(tag).await?;
        self.discard_abandoned(&mut self.abandoned.lock());
        Ok(reply)
    }

    /// Takes the reply for `tag` if it is at the head of the outbox.
    pub fn try_reply(&self, tag: WorkerId) -> Result<Option<SumsReply>, QueueError> {
        let taken = self.outbox.try_take(tag)?;
        if taken.is_some() {
            self.discard_abandoned(&mut self.abandoned.lock());
        }
        Ok(taken.map(|(_, reply)| reply))
    }

    /// Submits a request and waits up to `timeout` for its own reply.
    ///
    /// On timeout the request is abandoned, so a late reply can neither
    /// answer a later call on the same tag nor hold up other tags.
    pub async fn call(
        &self,
        tag: WorkerId,
        request: SumsRequest,
        timeout: Duration,
    ) -> Result<SumsReply, SumsError> {
        let ticket = self.submit(tag, request)?;
        match tokio::time::timeout(timeout, self.wait_ticket(tag, ticket)).await {
            Ok(reply) => Ok(reply?),
            Err(_) => self.abandon(tag, ticket).ok_or(SumsError::Timeout),
        }
    }

    async fn wait_ticket(&self, tag: WorkerId, ticket: Ticket) -> Result<SumsReply, QueueError> {
        loop {
            let (answered, reply) = self.outbox.take(tag).await?;
            self.discard_abandoned(&mut self.abandoned.lock());
            if answered == ticket {
                return Ok(reply);
            }
            tracing::warn!(worker = %tag, ?answered, ?reply, "dropping SUMS reply to an earlier request");
        }
    }

    /// Gives up on `ticket`. Returns the reply if it reached the head of the
    /// outbox in the meantime.
    fn abandon(&self, tag: WorkerId, ticket: Ticket) -> Option<SumsReply> {
        let mut abandoned = self.abandoned.lock();
        if let Some((_, (_, reply))) = self
            .outbox
            .take_head_if(|head, (answered, _)| head == tag && *answered == ticket)
        {
            self.discard_abandoned(&mut abandoned);
            return Some(reply);
        }
        tracing::debug!(worker = %tag, ?ticket, "SUMS request abandoned");
        abandoned.insert(ticket);
        None
    }

    /// Drops abandoned replies sitting at the head of the outbox.
    fn discard_abandoned(&self, abandoned: &mut HashSet<Ticket>) {
        if abandoned.is_empty() {
            return;
        }
        while let Some((tag, (ticket, reply))) = self
            .outbox
            .take_head_if(|_, (ticket, _)| abandoned.contains(ticket))
        {
            abandoned.remove(&ticket);
            tracing::debug!(worker = %tag, ?ticket, ?reply, "late SUMS reply discarded");
        }
    }

    /// Dispatcher side: waits for the next request from any worker.
    ///
    /// Requests abandoned while still queued are skipped.
    pub async fn next_request(&self) -> Result<(WorkerId, Ticket, SumsRequest), QueueError> {
        loop {
            let (tag, (ticket, request)) = self.inbox.take_any().await?;
            if self.abandoned.lock().remove(&ticket) {
                tracing::debug!(worker = %tag, ?ticket, ?request, "skipping abandoned SUMS request");
                continue;
            }
            return Ok((tag, ticket, request));
        }
    }

    /// Dispatcher side: delivers the reply to `ticket`.
    pub fn reply(&self, tag: WorkerId, ticket: Ticket, reply: SumsReply) -> Result<(), QueueError> {
        let mut abandoned = self.abandoned.lock();
        if abandoned.remove(&ticket) {
            tracing::debug!(worker = %tag, ?ticket, ?reply, "late SUMS reply discarded");
            return Ok(());
        }
        self.outbox.push(tag, (ticket, reply))
    }

    /// Pushes a sentinel into both queues, releasing every blocked caller.
    pub fn close(&self) {
        self.inbox.push_sentinel();
        self.outbox.push_sentinel();
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed() && self.outbox.is_closed()
    }

    pub fn pending_requests(&self) -> usize {
        self.inbox.len()
    }

    pub fn pending_replies(&self) -> usize {
        self.outbox.len()
    }
}
