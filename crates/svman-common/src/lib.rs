//! Common types for svman: errors, telemetry, backoff and wire constants

#![deny(missing_docs)]

pub mod backoff;
pub mod error;
pub mod telemetry;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub use backoff::{Backoff, BackoffPolicy};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the master's registrar
pub const DEFAULT_MASTER_PORT: u16 = 50051;

/// Default port for a slave's command listener
pub const DEFAULT_SLAVE_PORT: u16 = 50052;

/// Default ceiling for encoded and decoded gRPC messages (50 MiB)
pub const DEFAULT_GRPC_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Environment override for [`DEFAULT_GRPC_MAX_MESSAGE_SIZE`]
pub const GRPC_MAX_MESSAGE_SIZE_ENV: &str = "SVMAN_GRPC_MAX_MESSAGE_SIZE";

/// Client-side HTTP/2 keepalive ping interval
pub const CLIENT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Client-side HTTP/2 keepalive ack timeout
pub const CLIENT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side HTTP/2 keepalive ping interval
pub const SERVER_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Server-side HTTP/2 keepalive ack timeout
pub const SERVER_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata key carrying the shared secret on every RPC
pub const SECRET_METADATA_KEY: &str = "x-svman-secret";

/// Maximum gRPC message size, honoring `SVMAN_GRPC_MAX_MESSAGE_SIZE`
pub fn grpc_max_message_size() -> usize {
    std::env::var(GRPC_MAX_MESSAGE_SIZE_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_GRPC_MAX_MESSAGE_SIZE)
}

/// Append `port` to `address` when it carries none
///
/// Bare IPv6 literals come back bracketed.
pub fn with_default_port(address: &str, port: u16) -> String {
    let address = address.trim();
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match address.rsplit_once(':') {
        Some((host, p)) if !host.is_empty() && p.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{}:{}", address, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_max_message_size_defaults_to_50_mib() {
        std::env::remove_var(GRPC_MAX_MESSAGE_SIZE_ENV);
        assert_eq!(grpc_max_message_size(), 50 * 1024 * 1024);
    }

    #[test]
    fn ports_match_wire_contract() {
        assert_eq!(DEFAULT_MASTER_PORT, 50051);
        assert_eq!(DEFAULT_SLAVE_PORT, 50052);
    }

    #[test]
    fn default_port_only_added_when_missing() {
        assert_eq!(with_default_port("10.0.0.1", 50051), "10.0.0.1:50051");
        assert_eq!(with_default_port("master.lan:7000", 50051), "master.lan:7000");
        assert_eq!(with_default_port("master.lan", 50051), "master.lan:50051");
        assert_eq!(with_default_port("fe80::1", 50052), "[fe80::1]:50052");
    }
}
