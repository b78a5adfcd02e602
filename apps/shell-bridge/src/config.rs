use std::env;
use std::str::FromStr;
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::endpoint::{self, EndpointError};
use crate::session::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_DELAY, SessionConfig};
use crate::surface::{DEFAULT_RESIZE_DEBOUNCE, DEFAULT_SCROLLBACK, SurfaceOptions, Viewport};

pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:3001";

pub const ORIGIN_ENV: &str = "SHELL_BRIDGE_ORIGIN";
pub const RECONNECT_ENV: &str = "SHELL_BRIDGE_RECONNECT_MS";
pub const CONNECT_TIMEOUT_ENV: &str = "SHELL_BRIDGE_CONNECT_TIMEOUT_MS";
pub const RESIZE_DEBOUNCE_ENV: &str = "SHELL_BRIDGE_RESIZE_DEBOUNCE_MS";
pub const SCROLLBACK_ENV: &str = "SHELL_BRIDGE_SCROLLBACK";

/// Client configuration, read from the environment and overlaid by CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Origin the terminal endpoint is derived from.
    pub origin: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub resize_debounce: Duration,
    pub scrollback: usize,
}

impl Config {
    /// Load configuration from environment variables; unparsable values keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let origin = env::var(ORIGIN_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.origin);
        Self {
            origin,
            reconnect_delay: env_millis(RECONNECT_ENV).unwrap_or(defaults.reconnect_delay),
            connect_timeout: env_millis(CONNECT_TIMEOUT_ENV)
                .filter(|timeout| !timeout.is_zero())
                .unwrap_or(defaults.connect_timeout),
            resize_debounce: env_millis(RESIZE_DEBOUNCE_ENV).unwrap_or(defaults.resize_debounce),
            scrollback: env_parse(SCROLLBACK_ENV).unwrap_or(defaults.scrollback),
        }
    }

    /// WebSocket address of the terminal endpoint for the configured origin.
    pub fn endpoint(&self) -> Result<Url, EndpointError> {
        let origin = endpoint::parse_origin(&self.origin)?;
        endpoint::resolve_endpoint(&origin)
    }

    pub fn session_config(&self, endpoint: Url, viewport: Viewport) -> SessionConfig {
        SessionConfig {
            endpoint,
            viewport,
            reconnect_delay: self.reconnect_delay,
            connect_timeout: self.connect_timeout,
            surface: SurfaceOptions {
                scrollback: self.scrollback,
                resize_debounce: self.resize_debounce,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
            scrollback: DEFAULT_SCROLLBACK,
        }
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(target = "config", var, value = %raw, "ignoring unparsable value");
            None
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env_parse::<u64>(var).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Environment variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const ALL_VARS: [&str; 5] = [
        ORIGIN_ENV,
        RECONNECT_ENV,
        CONNECT_TIMEOUT_ENV,
        RESIZE_DEBOUNCE_ENV,
        SCROLLBACK_ENV,
    ];

    fn clear_env() {
        unsafe {
            for var in ALL_VARS {
                env::remove_var(var);
            }
        }
    }

    #[test_timeout::timeout]
    fn defaults_match_reference_values() {
        let config = Config::default();
        assert_eq!(config.origin, "http://127.0.0.1:3001");
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.resize_debounce, Duration::from_millis(50));
        assert_eq!(config.scrollback, 1000);
        assert_eq!(
            config.endpoint().map(|url| url.to_string()),
            Ok("ws://127.0.0.1:3001/terminal".to_string())
        );
    }

    #[test_timeout::timeout]
    fn from_env_without_variables_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = Config::from_env();
        assert_eq!(config.origin, DEFAULT_ORIGIN);
        assert_eq!(config.reconnect_delay, DEFAULT_RECONNECT_DELAY);
    }

    #[test_timeout::timeout]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(ORIGIN_ENV, "https://ide.example.com:8443/app");
            env::set_var(RECONNECT_ENV, "250");
            env::set_var(CONNECT_TIMEOUT_ENV, "1500");
            env::set_var(RESIZE_DEBOUNCE_ENV, "0");
            env::set_var(SCROLLBACK_ENV, "5000");
        }
        let config = Config::from_env();
        clear_env();

        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.resize_debounce, Duration::ZERO);
        assert_eq!(config.scrollback, 5000);
        assert_eq!(
            config.endpoint().map(|url| url.to_string()),
            Ok("wss://ide.example.com:8443/terminal".to_string())
        );
    }

    #[test_timeout::timeout]
    fn unparsable_values_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(RECONNECT_ENV, "soon");
            env::set_var(CONNECT_TIMEOUT_ENV, "0");
            env::set_var(SCROLLBACK_ENV, "-3");
        }
        let config = Config::from_env();
        clear_env();

        assert_eq!(config.reconnect_delay, DEFAULT_RECONNECT_DELAY);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.scrollback, DEFAULT_SCROLLBACK);
    }

    #[test_timeout::timeout]
    fn session_config_carries_timings() {
        let config = Config {
            reconnect_delay: Duration::from_millis(10),
            scrollback: 42,
            ..Config::default()
        };
        let endpoint = Url::parse("ws://localhost:9000/terminal").unwrap();
        let session = config.session_config(endpoint.clone(), Viewport::new(100, 30).unwrap());
        assert_eq!(session.endpoint, endpoint);
        assert_eq!(session.reconnect_delay, Duration::from_millis(10));
        assert_eq!(session.surface.scrollback, 42);
        assert_eq!(session.viewport.to_string(), "100x30");
    }
}
