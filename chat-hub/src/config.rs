use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::rate_limit::RateLimiter;

pub const DEFAULT_CHAT_ADDR: SocketAddr = SocketAddr::new(LOCALHOST, 12345);
pub const DEFAULT_OBSERVER_ADDR: SocketAddr = SocketAddr::new(LOCALHOST, 8765);
pub const DEFAULT_RELAY_ADDR: SocketAddr = SocketAddr::new(LOCALHOST, 9999);

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Tunables for a running hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub rate_limit: RateLimiter,
    /// Frames a session may have queued before it counts as a failed recipient.
    pub outbound_buffer: usize,
    /// Period of the status log line; zero disables it.
    pub stats_interval: Duration,
    /// How long shutdown waits for session workers before aborting them.
    pub shutdown_grace: Duration,
    /// How long a new connection may take to send its nickname.
    pub handshake_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimiter::default(),
            outbound_buffer: 256,
            stats_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upstream: SocketAddr,
    /// Prepended to every nickname forwarded upstream.
    pub marker: char,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream: DEFAULT_CHAT_ADDR,
            marker: '*',
        }
    }
}
