//! Configuration for the request coalescer.

use std::time::Duration;

use axum::http::Method;

/// Configuration for the request coalescer
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Time between flush ticks. Bounds the latency added to any caller and
    /// defines the coalescing window.
    pub flush_interval: Duration,

    /// Maximum time a caller waits for its group's result.
    /// `None` waits until delivery.
    pub wait_timeout: Option<Duration>,

    /// Maximum upstream body size captured for replay
    pub max_body_bytes: usize,

    /// Sort query pairs when deriving the request key
    pub normalize_query: bool,

    /// Longest request key accepted, in bytes
    pub max_key_len: usize,

    /// Methods that are coalesced; everything else is forwarded directly
    pub methods: Vec<Method>,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            wait_timeout: None,
            max_body_bytes: 10 * 1024 * 1024,
            normalize_query: false,
            max_key_len: 8192,
            methods: vec![Method::GET, Method::HEAD],
        }
    }
}

impl CoalescerConfig {
    /// Short window: small added latency, less coalescing
    pub fn low_latency() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            wait_timeout: Some(Duration::from_secs(30)),
            ..Self::default()
        }
    }

    /// Long window: maximise the number of callers sharing one upstream call
    pub fn high_coalescing() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            wait_timeout: Some(Duration::from_secs(60)),
            normalize_query: true,
            ..Self::default()
        }
    }

    /// Use a custom flush interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Bound how long callers wait for a result
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Flush interval actually used by the scheduler (never zero)
    pub fn effective_flush_interval(&self) -> Duration {
        self.flush_interval.max(Duration::from_millis(1))
    }

    /// Whether requests with this method take part in coalescing
    pub fn is_coalescible(&self, method: &Method) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    /// Look up a named preset (`default`, `low_latency`, `high_coalescing`)
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Some(Self::default()),
            "low_latency" => Some(Self::low_latency()),
            "high_coalescing" => Some(Self::high_coalescing()),
            _ => None,
        }
    }

    /// Create config from environment variables.
    ///
    /// `COALESCE_PRESET` picks the base; the other variables override it.
    pub fn from_env() -> Self {
        let mut config = match std::env::var("COALESCE_PRESET") {
            Ok(name) => Self::preset(&name).unwrap_or_else(|| {
                tracing::warn!(preset = %name, "Unknown coalescer preset, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Ok(val) = std::env::var("COALESCE_FLUSH_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                config.flush_interval = Duration::from_millis(n);
            }
        }

        if let Ok(val) = std::env::var("COALESCE_WAIT_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.wait_timeout = Some(Duration::from_secs(n));
            }
        }

        if let Ok(val) = std::env::var("COALESCE_MAX_BODY_BYTES") {
            if let Ok(n) = val.parse() {
                config.max_body_bytes = n;
            }
        }

        if let Ok(val) = std::env::var("COALESCE_NORMALIZE_QUERY") {
            config.normalize_query = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("COALESCE_MAX_KEY_LEN") {
            if let Ok(n) = val.parse() {
                config.max_key_len = n;
            }
        }

        if let Ok(val) = std::env::var("COALESCE_METHODS") {
            let methods = parse_methods(&val);
            if !methods.is_empty() {
                config.methods = methods;
            }
        }

        config
    }
}

/// Parse a comma separated method list, skipping invalid entries
fn parse_methods(raw: &str) -> Vec<Method> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| Method::from_bytes(s.to_ascii_uppercase().as_bytes()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoalescerConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(3));
        assert!(config.wait_timeout.is_none());
        assert!(config.is_coalescible(&Method::GET));
        assert!(config.is_coalescible(&Method::HEAD));
        assert!(!config.is_coalescible(&Method::POST));
    }

    #[test]
    fn test_low_latency_config() {
        let config = CoalescerConfig::low_latency();
        assert_eq!(config.flush_interval, Duration::from_millis(50));
        assert!(config.wait_timeout.is_some());
    }

    #[test]
    fn test_high_coalescing_config() {
        let config = CoalescerConfig::high_coalescing();
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert!(config.normalize_query);
    }

    #[test]
    fn test_preset_lookup() {
        let config = CoalescerConfig::preset("low-latency").unwrap();
        assert_eq!(config.flush_interval, Duration::from_millis(50));

        let config = CoalescerConfig::preset(" High_Coalescing ").unwrap();
        assert!(config.normalize_query);

        let config = CoalescerConfig::preset("default").unwrap();
        assert_eq!(config.flush_interval, Duration::from_secs(3));

        assert!(CoalescerConfig::preset("turbo").is_none());
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = CoalescerConfig::default().with_flush_interval(Duration::ZERO);
        assert_eq!(config.effective_flush_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_parse_methods() {
        assert_eq!(parse_methods("get, post"), vec![Method::GET, Method::POST]);
        assert_eq!(parse_methods(" ,GET,,"), vec![Method::GET]);
        assert!(parse_methods("").is_empty());
    }
}
