//! Structured connection events for an injected sink.
//!
//! This is separate from the crate's own `tracing` output: callers that want
//! per-request timing of DNS, TCP, TLS and proxy steps register a [`Logger`]
//! and receive one [`LogEvent`] per step.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Step a [`LogEvent`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    DnsLookup,
    TcpConnect,
    TlsHandshake,
    ProxyDnsLookup,
    ProxyTcpConnect,
    ProxyTlsHandshake,
    ProxyConnectRemote,
    ResponseHeader,
    ResponseBody,
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Request id supplied by the caller.
    pub id: String,
    pub time: DateTime<Utc>,
    pub kind: LogKind,
    pub payload: String,
}

/// Event sink. Called inline, so it should not block.
pub type Logger = Arc<dyn Fn(LogEvent) + Send + Sync>;

/// A sink bound to one request id.
#[derive(Clone, Default)]
pub struct EventLog {
    id: Arc<str>,
    sink: Option<Logger>,
}

impl EventLog {
    pub fn new(id: impl Into<Arc<str>>, sink: Option<Logger>) -> Self {
        Self {
            id: id.into(),
            sink,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Emit an event. `payload` is only built when a sink is installed.
    pub fn emit(&self, kind: LogKind, payload: impl FnOnce() -> String) {
        if let Some(sink) = &self.sink {
            sink(LogEvent {
                id: self.id.to_string(),
                time: Utc::now(),
                kind,
                payload: payload(),
            });
        }
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("id", &self.id)
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}
