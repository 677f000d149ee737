use core::net::{IpAddr, Ipv4Addr, SocketAddr};
use core::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 2628;

/// Server tunables, loadable from TOML and overridable from the CLI.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Accepted distance between a request's signing date and server time.
    pub signature_skew_secs: u64,
    /// Idle window after which an event instance wipes its state.
    pub idle_eviction_secs: u64,
    /// Socket keepalive ping cadence; two missed pongs force a close.
    pub ping_interval_secs: u64,
    /// Lifetime of short join-request codes.
    pub request_code_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)),
            signature_skew_secs: 300,
            idle_eviction_secs: 24 * 60 * 60,
            ping_interval_secs: 30,
            request_code_ttl_secs: 600,
        }
    }
}

impl ServerConfig {
    pub fn signature_skew(&self) -> Duration {
        Duration::seconds(self.signature_skew_secs as i64)
    }

    pub fn request_code_ttl(&self) -> Duration {
        Duration::seconds(self.request_code_ttl_secs as i64)
    }

    pub fn idle_eviction(&self) -> StdDuration {
        StdDuration::from_secs(self.idle_eviction_secs)
    }

    pub fn ping_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.ping_interval_secs)
    }
}
