use super::timeouts::ClientTimeouts;
use crate::h2::consts::{
    DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_HEADER_LIST_SIZE,
};
use std::time::Duration;

/// Local side of an HTTP/2 connection. The SETTINGS-related fields are
/// advertised to the peer in the connection preface.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// Limit on concurrent streams the peer may push to us.
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    /// Receive window of the whole connection. Values above the protocol
    /// default are announced with a WINDOW_UPDATE right after the preface.
    pub connection_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub ping_interval: Option<Duration>,
    pub timeouts: ClientTimeouts,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: false,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            connection_window_size: 1 << 20,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            ping_interval: None,
            timeouts: ClientTimeouts::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn with_push(mut self, enabled: bool) -> Self {
        self.enable_push = enabled;
        self
    }

    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    pub fn with_connection_window_size(mut self, size: u32) -> Self {
        self.connection_window_size = size;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per pool; the least recently used go first.
    pub max_idle_connections: usize,
    /// How long an idle connection stays eligible for reuse.
    pub keep_alive: Duration,
    /// When set, acquiring beyond this many saturated connections fails with
    /// `PoolExhausted` instead of dialing another one.
    pub max_connections_per_destination: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
            max_connections_per_destination: None,
        }
    }
}
