use std::env;
use std::time::Duration;

/// Runtime tunables, read once at startup. Every knob has a default that
/// matches the deployed server's expectations; env vars override them.
#[derive(Debug, Clone)]
pub struct Config {
    /// REST base, e.g. `https://ivy.example.com`.
    pub api_url: String,
    /// WebSocket endpoint. Derived from `api_url` unless `CABLE_URL` is set.
    pub cable_url: String,
    /// Application-level ping cadence. Must stay under the server's 5 minute
    /// idle timeout or live subscriptions get culled.
    pub keepalive: Duration,
    /// Fixed delay before a dropped subscription is rebuilt.
    pub reconnect_delay: Duration,
    /// Window inside which an optimistic echo and its authoritative copy
    /// count as the same message.
    pub dedup_tolerance: Duration,
    /// Collapse window for autoscroll during message bursts.
    pub scroll_debounce: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let api_url = env::var("API_URL").unwrap_or("http://127.0.0.1:3000".to_string());
        let cable_url = env::var("CABLE_URL").unwrap_or_else(|_| derive_cable_url(&api_url));

        Config {
            api_url,
            cable_url,
            keepalive: secs_env("CHAT_KEEPALIVE_SECS", 240),
            reconnect_delay: secs_env("CHAT_RECONNECT_SECS", 3),
            dedup_tolerance: millis_env("CHAT_DEDUP_TOLERANCE_MS", 1_000),
            scroll_debounce: millis_env("CHAT_SCROLL_DEBOUNCE_MS", 150),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: "http://127.0.0.1:3000".to_string(),
            cable_url: "ws://127.0.0.1:3000/cable".to_string(),
            keepalive: Duration::from_secs(240),
            reconnect_delay: Duration::from_secs(3),
            dedup_tolerance: Duration::from_millis(1_000),
            scroll_debounce: Duration::from_millis(150),
        }
    }
}

/// `https://host/api` -> `wss://host/cable`, `http://` -> `ws://`.
fn derive_cable_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = base.strip_suffix("/api").unwrap_or(base);
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/cable", ws)
}

fn secs_env(key: &str, default: u64) -> Duration {
    Duration::from_secs(parsed_env(key, default))
}

fn millis_env(key: &str, default: u64) -> Duration {
    Duration::from_millis(parsed_env(key, default))
}

fn parsed_env(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("ignoring unparseable {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_cable_url_swaps_scheme() {
        assert_eq!(
            derive_cable_url("https://ivy.example.com"),
            "wss://ivy.example.com/cable"
        );
        assert_eq!(
            derive_cable_url("http://127.0.0.1:3000"),
            "ws://127.0.0.1:3000/cable"
        );
    }

    #[test]
    fn test_derive_cable_url_drops_api_suffix_and_slash() {
        assert_eq!(
            derive_cable_url("https://ivy.example.com/api/"),
            "wss://ivy.example.com/cable"
        );
    }

    #[test]
    fn test_defaults_keep_keepalive_under_server_timeout() {
        let cfg = Config::default();
        assert!(cfg.keepalive < Duration::from_secs(300));
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(3));
        assert_eq!(cfg.dedup_tolerance, Duration::from_millis(1_000));
    }
}
