use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the evaluation backend, e.g. `https://cloud.example.com/api`.
    pub api_url: String,
    pub api_key: Option<String>,
    /// Project scope for every backend call. Batchers stay disabled until set.
    pub project_id: Option<String>,
    /// Timeout for a single backend request (seconds).
    pub http_timeout_secs: u64,
    /// Transient-failure retries performed by the HTTP middleware.
    pub http_max_retries: u32,
    pub session: SessionConfig,
}

/// Tunables consumed by the library side (`EvalSession`).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Log every metric-key candidate list and the strategy that matched.
    /// Set via EVALBOARD_DEBUG_METRIC_KEYS. Default: false.
    pub debug_metric_keys: bool,
    /// How long the coalescer waits for more keys before dispatching.
    /// 0 means "dispatch once the queue stops growing". Default: 0.
    pub batch_window_ms: u64,
    /// Window after a scenario write during which a missing metric does not
    /// trigger a refresh. Default: 5000.
    pub recent_save_ttl_ms: u64,
    /// Lifetime of cached query results. Default: 60.
    pub query_cache_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debug_metric_keys: false,
            batch_window_ms: 0,
            recent_save_ttl_ms: 5_000,
            query_cache_ttl_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn recent_save_ttl(&self) -> Duration {
        Duration::from_millis(self.recent_save_ttl_ms)
    }

    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_secs)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let api_url = std::env::var("EVALBOARD_API_URL")
        .unwrap_or_else(|_| "http://localhost:8000/api".into());
    url::Url::parse(&api_url)
        .map_err(|e| anyhow::anyhow!("EVALBOARD_API_URL is not a valid URL ({}): {}", api_url, e))?;

    let defaults = SessionConfig::default();

    Ok(Config {
        api_url: api_url.trim_end_matches('/').to_string(),
        api_key: std::env::var("EVALBOARD_API_KEY").ok().filter(|k| !k.is_empty()),
        project_id: std::env::var("EVALBOARD_PROJECT_ID")
            .ok()
            .filter(|p| !p.is_empty()),
        http_timeout_secs: env_parse("EVALBOARD_HTTP_TIMEOUT_SECS", 30),
        http_max_retries: env_parse("EVALBOARD_HTTP_MAX_RETRIES", 2),
        session: SessionConfig {
            debug_metric_keys: env_flag("EVALBOARD_DEBUG_METRIC_KEYS"),
            batch_window_ms: env_parse("EVALBOARD_BATCH_WINDOW_MS", defaults.batch_window_ms),
            recent_save_ttl_ms: env_parse(
                "EVALBOARD_RECENT_SAVE_TTL_MS",
                defaults.recent_save_ttl_ms,
            ),
            query_cache_ttl_secs: env_parse(
                "EVALBOARD_QUERY_CACHE_TTL_SECS",
                defaults.query_cache_ttl_secs,
            ),
        },
    })
}
