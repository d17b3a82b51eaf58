//! One attempt at sending a request, as handed between pool and connector.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::error::Result;
use crate::log::EventLog;
use crate::request::{RequestBody, RequestHead};
use crate::response::Response;
use crate::timeouts::Timeouts;

/// How an attempt ended, from the waiting caller's point of view.
pub(crate) enum TaskOutcome {
    Done(Result<Response>),
    /// No connector could take the task without sending it; dial fresh.
    PoolEmpty(ReqTask),
}

pub(crate) struct ReqTask {
    pub head: Arc<RequestHead>,
    pub body: Arc<AsyncMutex<RequestBody>>,
    pub timeouts: Timeouts,
    /// Absolute deadline from the request's total timeout.
    pub deadline: Option<Instant>,
    /// Set once any request byte has been written. Shared with the caller,
    /// which outlives the task when deciding on a retry.
    pub sent: Arc<AtomicBool>,
    pub key: Arc<str>,
    pub log: EventLog,
    reply: Option<oneshot::Sender<TaskOutcome>>,
}

impl ReqTask {
    pub fn new(
        head: Arc<RequestHead>,
        body: Arc<AsyncMutex<RequestBody>>,
        timeouts: Timeouts,
        deadline: Option<Instant>,
        key: Arc<str>,
        log: EventLog,
    ) -> (Self, oneshot::Receiver<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            head,
            body,
            timeouts,
            deadline,
            sent: Arc::new(AtomicBool::new(false)),
            key,
            log,
            reply: Some(tx),
        };
        (task, rx)
    }

    pub fn was_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    pub fn sent_flag(&self) -> Arc<AtomicBool> {
        self.sent.clone()
    }

    /// Fresh reply channel for a task that came back unsent.
    pub fn rearm(&mut self) -> oneshot::Receiver<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        rx
    }

    /// Deliver the result to the waiting caller.
    pub fn finish(mut self, result: Result<Response>) {
        if let Some(tx) = self.reply.take() {
            if tx.send(TaskOutcome::Done(result)).is_err() {
                tracing::trace!("request for {} abandoned before reply", self.key);
            }
        }
    }

    /// Hand the task back to the caller unsent.
    pub fn bounce(mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(TaskOutcome::PoolEmpty(self));
        }
    }

    /// The caller stopped waiting (timed out or dropped the future).
    pub fn is_abandoned(&self) -> bool {
        self.reply.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl fmt::Debug for ReqTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqTask")
            .field("method", &self.head.method)
            .field("url", &self.head.url.as_str())
            .field("key", &self.key)
            .field("sent", &self.was_sent())
            .finish()
    }
}

/// Callback that puts a connector back on its pool's idle queue.
///
/// Fired by the response body the moment it completes, so a follow-up
/// request issued right after reading the body finds the connection idle.
pub(crate) struct ReadyHook(Box<dyn FnOnce() + Send>);

impl ReadyHook {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn fire(self) {
        (self.0)()
    }
}

impl fmt::Debug for ReadyHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadyHook")
    }
}
