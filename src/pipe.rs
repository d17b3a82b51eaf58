//! Unbuffered, acknowledged byte conduit between two tasks.
//!
//! The writer hands one chunk at a time to the reader and blocks until the
//! reader reports how many bytes it copied, then resends the remainder. No
//! bytes are held by the pipe itself, so a writer that returns early on
//! cancellation knows exactly how much was delivered.

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::scope::Scope;

/// Create a linked writer/reader pair bound to `scope`.
pub fn pipe(scope: Scope) -> (PipeWriter, PipeReader) {
    let (data_tx, data_rx) = mpsc::channel(1);
    let (ack_tx, ack_rx) = mpsc::channel(1);
    (
        PipeWriter {
            data_tx,
            ack_rx,
            scope: scope.clone(),
        },
        PipeReader {
            data_rx,
            ack_tx,
            scope,
        },
    )
}

#[derive(Debug)]
pub struct PipeWriter {
    data_tx: mpsc::Sender<Bytes>,
    ack_rx: mpsc::Receiver<usize>,
    scope: Scope,
}

impl PipeWriter {
    /// Deliver all of `data`, returning once the reader has acknowledged
    /// every byte. On cancellation the error carries the scope's cause.
    pub async fn write(&mut self, mut data: Bytes) -> Result<usize> {
        let total = data.len();
        while data.has_remaining() {
            tokio::select! {
                biased;
                _ = self.scope.cancelled() => return Err(self.scope.error("pipe write")),
                sent = self.data_tx.send(data.clone()) => {
                    if sent.is_err() {
                        return Err(Error::Closed);
                    }
                }
            }
            let n = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return Err(self.scope.error("pipe write")),
                n = self.ack_rx.recv() => n.ok_or(Error::Closed)?,
            };
            data.advance(n.min(data.len()));
        }
        Ok(total)
    }

    pub fn close(&self, err: Error) {
        self.scope.cancel(err);
    }
}

#[derive(Debug)]
pub struct PipeReader {
    data_rx: mpsc::Receiver<Bytes>,
    ack_tx: mpsc::Sender<usize>,
    scope: Scope,
}

impl PipeReader {
    /// Copy at most one chunk into `buf`. Returns `Ok(0)` once the writer is
    /// gone and nothing is pending.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = tokio::select! {
            biased;
            chunk = self.data_rx.recv() => chunk,
            _ = self.scope.cancelled() => return Err(self.scope.error("pipe read")),
        };
        let Some(chunk) = chunk else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        // Writer may already be gone after cancellation.
        let _ = self.ack_tx.send(n).await;
        Ok(n)
    }

    pub fn close(&self, err: Error) {
        self.scope.cancel(err);
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }
}
