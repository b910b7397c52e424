//! Immutable listener, connection and WebSocket options.
//!
//! Options are captured once when a listener or channel creator is built and
//! are read-only afterwards. Every struct implements `Default` and
//! `serde::Deserialize` with `#[serde(default)]`, so a host can load a partial
//! JSON document and inherit the defaults for the rest.
//!
//! # Example
//!
//! ```
//! use sockwire::options::ConnectionOptions;
//!
//! let options = ConnectionOptions::from_json(r#"{ "max_package_length": 1024 }"#).unwrap();
//! assert_eq!(options.max_package_length, 1024);
//! assert_eq!(options.receive_buffer_size, 64 * 1024);
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SockwireError};

/// Default maximum package length (4 MB).
pub const DEFAULT_MAX_PACKAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Default per-read cap (64 KB).
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Default outbound queue capacity.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Default maximum pending outbound chunks before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_SENDS: usize = 1024;

/// Default send backpressure timeout in milliseconds.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

/// Per-channel options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Largest number of bytes a single package may span. 0 disables the check.
    pub max_package_length: usize,
    /// Maximum number of bytes taken from the transport per read.
    pub receive_buffer_size: usize,
    /// Capacity of the outbound chunk queue.
    pub send_queue_capacity: usize,
    /// Pending outbound chunks allowed before senders wait.
    pub max_pending_sends: usize,
    /// How long a sender waits for backpressure to clear, in milliseconds.
    pub send_timeout_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_package_length: DEFAULT_MAX_PACKAGE_LENGTH,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_pending_sends: DEFAULT_MAX_PENDING_SENDS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

impl ConnectionOptions {
    /// Parse options from a JSON document and validate them.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Set the maximum package length.
    pub fn with_max_package_length(mut self, length: usize) -> Self {
        self.max_package_length = length;
        self
    }

    /// Set the per-read cap.
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Backpressure timeout as a `Duration`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Check option values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.receive_buffer_size == 0 {
            return Err(SockwireError::Config(
                "receive_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(SockwireError::Config(
                "send_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_pending_sends == 0 {
            return Err(SockwireError::Config(
                "max_pending_sends must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-listener options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Address to bind.
    pub ip: IpAddr,
    /// Port to bind (0 = OS-assigned).
    pub port: u16,
    /// Pending-connection backlog passed to `listen`.
    pub backlog: u32,
    /// Disable Nagle's algorithm on accepted TCP sockets.
    pub no_delay: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            backlog: 1024,
            no_delay: true,
        }
    }
}

impl ListenOptions {
    /// Options listening on the given address.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            ..Self::default()
        }
    }

    /// Parse options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The socket address to bind.
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Options for the WebSocket protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebSocketOptions {
    /// Sub-protocols this server speaks, in preference order.
    pub sub_protocols: Vec<String>,
    /// Reject client frames that are not masked.
    pub require_mask: bool,
    /// Seconds a connection may stay before completing the opening handshake.
    pub open_handshake_timeout_secs: u64,
    /// Seconds to wait for the peer to answer a close frame.
    pub close_handshake_timeout_secs: u64,
    /// Seconds between sweeps of the handshake pending queues.
    pub handshake_sweep_interval_secs: u64,
    /// Largest payload per outbound frame; longer messages are fragmented. 0 disables fragmentation.
    pub max_frame_payload: usize,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            sub_protocols: Vec::new(),
            require_mask: true,
            open_handshake_timeout_secs: 120,
            close_handshake_timeout_secs: 120,
            handshake_sweep_interval_secs: 60,
            max_frame_payload: 0,
        }
    }
}

impl WebSocketOptions {
    /// Parse options from a JSON document and validate them.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn open_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.open_handshake_timeout_secs)
    }

    pub fn close_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.close_handshake_timeout_secs)
    }

    pub fn handshake_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.handshake_sweep_interval_secs)
    }

    /// Check option values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.handshake_sweep_interval_secs == 0 {
            return Err(SockwireError::Config(
                "handshake_sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.sub_protocols.iter().any(|p| p.trim().is_empty()) {
            return Err(SockwireError::Config(
                "sub_protocols must not contain empty names".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let options = ConnectionOptions::default();
        assert_eq!(options.max_package_length, DEFAULT_MAX_PACKAGE_LENGTH);
        assert_eq!(options.receive_buffer_size, DEFAULT_RECEIVE_BUFFER_SIZE);
        assert_eq!(options.send_timeout(), Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_connection_partial_json() {
        let options =
            ConnectionOptions::from_json(r#"{ "max_package_length": 10, "send_timeout_ms": 7 }"#)
                .unwrap();
        assert_eq!(options.max_package_length, 10);
        assert_eq!(options.send_timeout(), Duration::from_millis(7));
        assert_eq!(options.send_queue_capacity, DEFAULT_SEND_QUEUE_CAPACITY);
    }

    #[test]
    fn test_connection_rejects_zero_read_size() {
        let result = ConnectionOptions::from_json(r#"{ "receive_buffer_size": 0 }"#);
        assert!(matches!(result, Err(SockwireError::Config(_))));
    }

    #[test]
    fn test_listen_options_json() {
        let options = ListenOptions::from_json(r#"{ "ip": "0.0.0.0", "port": 2020 }"#).unwrap();
        assert_eq!(options.to_socket_addr(), "0.0.0.0:2020".parse().unwrap());
        assert!(options.no_delay);
        assert_eq!(options.backlog, 1024);
    }

    #[test]
    fn test_websocket_options() {
        let options =
            WebSocketOptions::from_json(r#"{ "sub_protocols": ["chat", "echo"] }"#).unwrap();
        assert_eq!(options.sub_protocols, vec!["chat", "echo"]);
        assert!(options.require_mask);
        assert_eq!(options.open_handshake_timeout(), Duration::from_secs(120));

        let bad = WebSocketOptions::from_json(r#"{ "handshake_sweep_interval_secs": 0 }"#);
        assert!(bad.is_err());
    }
}
