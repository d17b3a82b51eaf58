//! Non-blocking interface to an HTTP/3 driver task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::request::RequestHead;
use crate::transport::h3::driver::{DriverCommand, H3Response};

#[derive(Clone, Debug)]
pub(crate) struct H3Handle {
    command_tx: mpsc::Sender<DriverCommand>,
    closed: Arc<AtomicBool>,
}

impl H3Handle {
    pub fn new(command_tx: mpsc::Sender<DriverCommand>, closed: Arc<AtomicBool>) -> Self {
        Self { command_tx, closed }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.command_tx.is_closed()
    }

    /// Queue a request on the driver and wait for its response head.
    ///
    /// The driver allocates the stream id. `sent` flips once the command
    /// reaches the driver.
    pub async fn send_request(
        &self,
        head: &RequestHead,
        body: Bytes,
        sent: &AtomicBool,
    ) -> Result<H3Response> {
        let (response_tx, response_rx) = oneshot::channel();
        let command = DriverCommand::SendRequest {
            method: head.method.clone(),
            authority: head.host_header(),
            path: head.path_and_query(),
            headers: head.headers.clone(),
            body,
            response_tx,
        };
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::connection("HTTP/3 driver channel closed"))?;
        sent.store(true, Ordering::Release);

        response_rx
            .await
            .map_err(|_| Error::connection("HTTP/3 response channel closed"))?
    }
}
