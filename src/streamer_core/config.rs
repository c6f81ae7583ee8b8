use std::env;

pub const DEFAULT_MIRROR_REST_URL: &str = "https://testnet.mirrornode.hedera.com/api/v1";

/// Connection settings for the upstream mirror (REST pages + optional push stream)
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorConfig {
    /// REST base, e.g. `https://testnet.mirrornode.hedera.com/api/v1`
    pub rest_url: String,
    /// Push stream base; `None` selects the poll-only strategy
    pub ws_url: Option<String>,
    pub page_size: usize,
    pub request_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub jitter_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_MIRROR_REST_URL.to_string(),
            ws_url: None,
            page_size: 100,
            request_timeout_ms: 10_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            jitter_ms: 1_000,
            user_agent: format!("trustflow-ingestion/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl MirrorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment in production, a map in tests)
    ///
    /// Keys:
    /// - `MIRROR_REST_URL` (default: testnet mirror)
    /// - `MIRROR_WS_URL` (default: unset, poll-only)
    /// - `BACKFILL_PAGE_SIZE` (default: 100)
    /// - `MIRROR_TIMEOUT_MS` (default: 10000)
    /// - `WS_INITIAL_BACKOFF_MS` / `WS_MAX_BACKOFF_MS` / `WS_JITTER_MS` (default: 1000 / 30000 / 1000)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rest_url = lookup("MIRROR_REST_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.rest_url);

        let ws_url = lookup("MIRROR_WS_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        let config = Self {
            rest_url,
            ws_url,
            page_size: parse_or(&lookup, "BACKFILL_PAGE_SIZE", defaults.page_size),
            request_timeout_ms: parse_or(&lookup, "MIRROR_TIMEOUT_MS", defaults.request_timeout_ms),
            reconnect_initial_ms: parse_or(&lookup, "WS_INITIAL_BACKOFF_MS", defaults.reconnect_initial_ms),
            reconnect_max_ms: parse_or(&lookup, "WS_MAX_BACKOFF_MS", defaults.reconnect_max_ms),
            jitter_ms: parse_or(&lookup, "WS_JITTER_MS", defaults.jitter_ms),
            user_agent: defaults.user_agent,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rest_url.starts_with("http://") && !self.rest_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "MIRROR_REST_URL must start with http:// or https://".to_string(),
            ));
        }

        if let Some(ws) = &self.ws_url {
            let ok = ["ws://", "wss://", "http://", "https://"]
                .iter()
                .any(|scheme| ws.starts_with(scheme));
            if !ok {
                return Err(ConfigError::InvalidValue(
                    "MIRROR_WS_URL must start with ws://, wss://, http:// or https://".to_string(),
                ));
            }
        }

        if self.page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "BACKFILL_PAGE_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_initial_ms == 0 || self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(ConfigError::InvalidValue(format!(
                "reconnect backoff must satisfy 0 < initial ({}) <= max ({})",
                self.reconnect_initial_ms, self.reconnect_max_ms
            )));
        }

        Ok(())
    }

    pub fn streaming_enabled(&self) -> bool {
        self.ws_url.is_some()
    }
}

pub(crate) fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', using default", key, raw);
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_mirror_config() {
        let config = MirrorConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.rest_url, DEFAULT_MIRROR_REST_URL);
        assert_eq!(config.ws_url, None);
        assert_eq!(config.page_size, 100);
        assert!(!config.streaming_enabled());
    }

    #[test]
    fn test_custom_mirror_config() {
        let config = MirrorConfig::from_lookup(lookup_from(&[
            ("MIRROR_REST_URL", "https://mainnet.example.com/api/v1/"),
            ("MIRROR_WS_URL", "wss://stream.example.com"),
            ("BACKFILL_PAGE_SIZE", "25"),
            ("WS_MAX_BACKOFF_MS", "5000"),
        ]))
        .unwrap();

        assert_eq!(config.rest_url, "https://mainnet.example.com/api/v1");
        assert_eq!(config.ws_url.as_deref(), Some("wss://stream.example.com"));
        assert_eq!(config.page_size, 25);
        assert_eq!(config.reconnect_max_ms, 5000);
        assert!(config.streaming_enabled());
    }

    #[test]
    fn test_invalid_rest_url_rejected() {
        let err = MirrorConfig::from_lookup(lookup_from(&[("MIRROR_REST_URL", "ftp://nope")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_unparseable_number_falls_back_to_default() {
        let config =
            MirrorConfig::from_lookup(lookup_from(&[("BACKFILL_PAGE_SIZE", "lots")])).unwrap();
        assert_eq!(config.page_size, 100);
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let err = MirrorConfig::from_lookup(lookup_from(&[("BACKFILL_PAGE_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("BACKFILL_PAGE_SIZE"));
    }
}
