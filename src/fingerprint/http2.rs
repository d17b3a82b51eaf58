//! HTTP/2 SETTINGS fingerprint.

use std::time::Duration;

/// Connection-level receive window Chrome advertises (65535 + 15663105).
pub const CHROME_CONNECTION_WINDOW_SIZE: u32 = 15_728_640;

/// Values sent in the client SETTINGS frame.
#[derive(Debug, Clone)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    /// Bound on the client preface + SETTINGS exchange.
    pub handshake_timeout: Option<Duration>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        // Chrome defaults
        Self {
            header_table_size: 65536,
            enable_push: false,
            max_concurrent_streams: 1000,
            initial_window_size: 6291456,
            initial_connection_window_size: CHROME_CONNECTION_WINDOW_SIZE,
            max_frame_size: 16384,
            max_header_list_size: 262144,
            handshake_timeout: Some(Duration::from_secs(10)),
        }
    }
}
