use std::env;
use std::time::Duration;

const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CHANNEL_LABEL: &str = "tincan-chat";
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Runtime configuration for a peer manager instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the signaling relay.
    pub relay_url: String,
    /// How often the relay is polled for queued envelopes.
    pub poll_interval: Duration,
    /// Label given to the data channel the initiating side creates.
    pub data_channel_label: String,
    /// Upper bound on time spent in `connecting`; `None` disables the bound.
    pub negotiation_timeout: Option<Duration>,
    /// STUN servers used when the relay does not advertise any.
    pub fallback_stun_servers: Vec<String>,
}

impl Config {
    /// Load configuration from `TINCAN_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let relay_url =
            env::var("TINCAN_RELAY_URL").unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let relay_url = if relay_url.contains("://localhost") {
            relay_url.replacen("localhost", "127.0.0.1", 1)
        } else {
            relay_url
        };
        let poll_interval = env_millis("TINCAN_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        // 0 disables the negotiation timeout.
        let negotiation_timeout = match env_millis("TINCAN_NEGOTIATION_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS)),
        };
        let data_channel_label = env::var("TINCAN_CHANNEL_LABEL")
            .ok()
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CHANNEL_LABEL.to_string());
        Self {
            relay_url,
            poll_interval,
            data_channel_label,
            negotiation_timeout,
            fallback_stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            data_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            negotiation_timeout: Some(Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS)),
            fallback_stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

fn env_millis(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
