use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::SocketError;
use crate::protocol::content::CloseResponse;

/// Returned once when a link is closed
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ProxyLinkStats {
    pub time_open: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error: SocketError,
}

impl From<CloseResponse> for ProxyLinkStats {
    fn from(value: CloseResponse) -> Self {
        ProxyLinkStats {
            time_open: Duration::from_millis(value.time_open_ms),
            bytes_sent: value.bytes_sent,
            bytes_received: value.bytes_received,
            error: SocketError::from_code(value.error_code),
        }
    }
}

impl From<ProxyLinkStats> for CloseResponse {
    fn from(value: ProxyLinkStats) -> Self {
        CloseResponse {
            time_open_ms: value.time_open.as_millis() as u64,
            bytes_sent: value.bytes_sent,
            bytes_received: value.bytes_received,
            error_code: value.error.code(),
        }
    }
}


/// Counters that the data plane updates while a link is open
#[derive(Debug)]
pub struct LinkCounters {
    opened_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_error: AtomicI32,
}

impl Default for LinkCounters {
    fn default() -> Self {
        LinkCounters::new()
    }
}

impl LinkCounters {
    pub fn new() -> LinkCounters {
        LinkCounters {
            opened_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_error: AtomicI32::new(SocketError::Success.code()),
        }
    }

    pub fn on_sent(&self, num_bytes: usize) {
        self.bytes_sent.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn on_received(&self, num_bytes: usize) {
        self.bytes_received.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn on_error(&self, error: SocketError) {
        self.last_error.store(error.code(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyLinkStats {
        ProxyLinkStats {
            time_open: self.opened_at.elapsed(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            error: SocketError::from_code(self.last_error.load(Ordering::Relaxed)),
        }
    }
}
