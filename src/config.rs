// src/config.rs

//! Client configuration: bootstrap location, protocol timeouts, and the
//! reconnect policy applied to session group members.

use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the directory service resolving an application key into a
    /// session credential and endpoint list.
    #[serde(default = "default_bootstrap_url")]
    pub bootstrap_url: Url,

    /// How long a transport-level connect may take before the attempt is
    /// abandoned and retried.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// How long a correlated request (handshake included) waits for its
    /// acknowledgement before resolving to an absent value.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Delay between a timed-out connect attempt and the next one.
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,

    /// Whether a member connection that loses its transport while connected
    /// re-enters the connect cycle on its own. Supplied to every connection
    /// by the session group; the connection never infers it.
    #[serde(default = "default_reconnect_on_disconnect")]
    pub reconnect_on_disconnect: bool,
}

fn default_bootstrap_url() -> Url {
    Url::parse("https://api.keysync.dev/").expect("default bootstrap URL is valid")
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_on_disconnect() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap_url: default_bootstrap_url(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            reconnect_delay: default_reconnect_delay(),
            reconnect_on_disconnect: default_reconnect_on_disconnect(),
        }
    }
}
