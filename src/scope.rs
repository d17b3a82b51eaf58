//! Cancellation scopes carrying a terminal cause.
//!
//! A [`Scope`] is a cancellation token plus the error that cancelled it.
//! Children are cancelled with their parent and report the parent's cause
//! unless they were cancelled with their own first. A Connector holds three:
//! *delete* (force close), *close* (graceful, child of delete) and one
//! *body* scope per response (child of delete).

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Clone, Debug)]
pub struct Scope {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    cause: OnceLock<Arc<Error>>,
    parent: Option<Scope>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Scope cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel with `cause`. Only the first cause is kept; returns whether
    /// this call was the one that recorded it.
    pub fn cancel(&self, cause: Error) -> bool {
        let first = self.inner.cause.set(Arc::new(cause)).is_ok();
        self.inner.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the scope (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// The terminal cause, if cancelled.
    pub fn cause(&self) -> Option<Arc<Error>> {
        if let Some(cause) = self.inner.cause.get() {
            return Some(cause.clone());
        }
        if !self.is_cancelled() {
            return None;
        }
        self.inner.parent.as_ref().and_then(Scope::cause)
    }

    /// Error describing why a wait at `stage` was interrupted.
    pub fn error(&self, stage: &'static str) -> Error {
        let cause = self.cause().unwrap_or_else(|| Arc::new(Error::Closed));
        Error::canceled(stage, cause)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}
