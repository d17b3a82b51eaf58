use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Records every TCP connection a mock accepts, in order.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    accepted: Arc<Mutex<Vec<(SocketAddr, Instant)>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted connection from `peer`.
    pub fn record(&self, peer: SocketAddr) {
        self.accepted.lock().unwrap().push((peer, Instant::now()));
    }

    /// Number of connections accepted so far.
    pub fn count(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }

    /// Peer addresses in accept order.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .map(|(peer, _)| *peer)
            .collect()
    }
}
