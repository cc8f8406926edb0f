use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub services: ServicesConfig,
    pub proxies: ProxyConfig,
    pub playback: PlaybackConfig,
    pub resilience: ResilienceConfig,
    pub retry: RetryConfig,
}

/// Resolution, stream and cover cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Track key -> resolution result
    pub resolution_ttl_secs: u64,
    /// External id -> playable URL
    pub stream_ttl_secs: u64,
    /// Track/playlist -> cover image URL
    pub cover_ttl_secs: u64,
    /// Maximum entries per cache
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resolution_ttl_secs: 5 * 60 * 60,
            stream_ttl_secs: 5 * 60 * 60,
            cover_ttl_secs: 5 * 60 * 60,
            capacity: 2048,
        }
    }
}

/// External lookup/extraction endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Video search endpoint (`?action=search&q=...`)
    pub lookup_url: String,
    /// Stream extraction endpoint (`?v=<id>`)
    pub extraction_url: String,
    /// Cover search endpoint, fetched through the proxies
    pub cover_search_url: String,
    pub playlist_cover_search_url: String,
    /// Returned when no cover matches a track
    pub fallback_cover: String,
    /// Appended to every track search
    pub search_qualifier: String,
    pub search_limit: usize,
    pub request_timeout_ms: u64,
    /// Metadata probe timeout for tracks without a known duration
    pub probe_timeout_ms: u64,
    /// Ranged GET timeout used to validate proxied stream URLs
    pub validation_timeout_ms: u64,
    pub validation_range: String,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            lookup_url: "http://localhost:8888/youtube".to_string(),
            extraction_url: "http://localhost:8888/audio".to_string(),
            cover_search_url: "https://api.deezer.com/search".to_string(),
            playlist_cover_search_url: "https://api.deezer.com/search/playlist".to_string(),
            fallback_cover: "covers/generic.png".to_string(),
            search_qualifier: "official audio".to_string(),
            search_limit: 10,
            request_timeout_ms: 8000,
            probe_timeout_ms: 5000,
            validation_timeout_ms: 6000,
            validation_range: "bytes=0-1023".to_string(),
        }
    }
}

/// A forwarding endpoint; `{url}` in the template is replaced by the
/// percent-encoded target URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub id: String,
    pub url_template: String,
}

impl ProxyEndpoint {
    pub fn new(id: &str, url_template: &str) -> Self {
        Self {
            id: id.to_string(),
            url_template: url_template.to_string(),
        }
    }
}

/// Tolerance rules for a single proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPolicy {
    pub timeout_ms: u64,
    /// Consecutive HTTP failures before blocking
    pub block_after: u32,
    /// Consecutive failures before an HTTP 403 blocks
    pub block_403_after: u32,
    /// Consecutive network failures (DNS, refused, timeout) before blocking
    pub transport_block_after: u32,
    /// Consecutive aborted requests before blocking
    pub abort_block_after: u32,
    /// Whether a transport error mentioning 403 counts towards a block
    pub transport_403_blocks: bool,
    /// Error substrings that are not counted against this proxy at all
    pub ignored_errors: Vec<String>,
    /// Block reasons containing one of these never block
    pub lenient_reasons: Vec<String>,
    /// When set, only block reasons containing this substring block
    pub block_only_on: Option<String>,
    /// HTTP statuses that are counted but not reported
    pub silent_statuses: Vec<u16>,
    /// Non-JSON bodies are expected from this proxy and never block it
    pub tolerate_invalid_payload: bool,
    /// The proxy wraps JSON in text; try the outermost `{...}` slice
    pub extract_embedded_json: bool,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            block_after: 3,
            block_403_after: 2,
            transport_block_after: 2,
            abort_block_after: 3,
            transport_403_blocks: false,
            ignored_errors: Vec::new(),
            lenient_reasons: Vec::new(),
            block_only_on: None,
            silent_statuses: Vec::new(),
            tolerate_invalid_payload: false,
            extract_embedded_json: false,
        }
    }
}

/// Proxy list, per-proxy policies and circuit breaker windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Block window after a proxy crosses its failure threshold
    pub block_ms: u64,
    /// Block window after repeated non-JSON payloads
    pub invalid_payload_block_ms: u64,
    /// Cooldown applied immediately on HTTP 429
    pub rate_limit_cooldown_ms: u64,
    /// Failed calls in a row before all lookups are suspended
    pub failure_threshold: u32,
    pub suspend_ms: u64,
    /// Ordered by priority
    pub endpoints: Vec<ProxyEndpoint>,
    /// Policy overrides keyed by proxy id
    pub policies: BTreeMap<String, ProxyPolicy>,
}

impl ProxyConfig {
    /// Policy for `id`, falling back to the defaults
    pub fn policy(&self, id: &str) -> ProxyPolicy {
        self.policies.get(id).cloned().unwrap_or_default()
    }

    fn default_policies() -> BTreeMap<String, ProxyPolicy> {
        let mut policies = BTreeMap::new();
        policies.insert(
            "netlify-proxy".to_string(),
            ProxyPolicy {
                timeout_ms: 12_000,
                ..ProxyPolicy::default()
            },
        );
        policies.insert(
            "corsproxy".to_string(),
            ProxyPolicy {
                transport_403_blocks: true,
                ..ProxyPolicy::default()
            },
        );
        policies.insert(
            "allorigins".to_string(),
            ProxyPolicy {
                timeout_ms: 6_000,
                ignored_errors: vec!["abort".to_string()],
                lenient_reasons: vec!["abort".to_string()],
                silent_statuses: vec![499],
                ..ProxyPolicy::default()
            },
        );
        policies.insert(
            "isomorphic".to_string(),
            ProxyPolicy {
                lenient_reasons: vec!["403".to_string(), "failed".to_string()],
                ..ProxyPolicy::default()
            },
        );
        policies.insert(
            "jina".to_string(),
            ProxyPolicy {
                ignored_errors: vec!["unexpected token".to_string()],
                block_only_on: Some("429".to_string()),
                tolerate_invalid_payload: true,
                extract_embedded_json: true,
                ..ProxyPolicy::default()
            },
        );
        policies
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            block_ms: 45_000,
            invalid_payload_block_ms: 3 * 60 * 1000,
            rate_limit_cooldown_ms: 8_000,
            failure_threshold: 5,
            suspend_ms: 5 * 60 * 1000,
            endpoints: vec![
                ProxyEndpoint::new("netlify-proxy", "http://localhost:8888/proxy?url={url}"),
                ProxyEndpoint::new("corsproxy", "https://corsproxy.io/?{url}"),
                ProxyEndpoint::new("allorigins", "https://api.allorigins.win/raw?url={url}"),
                ProxyEndpoint::new("codetabs", "https://api.codetabs.com/v1/proxy?quest={url}"),
            ],
            policies: Self::default_policies(),
        }
    }
}

/// Playback engine timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Default volume (0-100)
    pub default_volume: u8,
    pub crossfade_ms: u64,
    /// Fade level sampling period
    pub crossfade_step_ms: u64,
    /// Tracks shorter than this never auto-crossfade
    pub min_crossfade_track_ms: u64,
    /// Auto-crossfade starts this long before the crossfade would overrun the end
    pub crossfade_lead_ms: u64,
    /// Lower bound for the auto-crossfade trigger window
    pub min_crossfade_trigger_ms: u64,
    /// Watchdog fires this long after the expected end of a track
    pub watchdog_grace_ms: u64,
    /// Time updates this close to the end force end-of-track handling
    pub end_tolerance_ms: u64,
    /// Pause after resetting a sink before loading a new source
    pub reset_delay_ms: u64,
    /// How long errors from a freshly reset sink are ignored
    pub error_ignore_ms: u64,
    /// Repeat the queue from the start when it runs out
    pub repeat: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: 100,
            crossfade_ms: 10_000,
            crossfade_step_ms: 50,
            min_crossfade_track_ms: 12_000,
            crossfade_lead_ms: 400,
            min_crossfade_trigger_ms: 1_500,
            watchdog_grace_ms: 1_500,
            end_tolerance_ms: 300,
            reset_delay_ms: 100,
            error_ignore_ms: 100,
            repeat: false,
        }
    }
}

/// Stall, buffering and reconnect supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub stall_delay_ms: u64,
    pub buffering_timeout_ms: u64,
    /// Buffering episodes longer than this are reported as a slow connection
    pub slow_connection_ms: u64,
    /// Wait for the sink to become ready after a reconnect
    pub ready_timeout_ms: u64,
    /// Rewind applied when restoring the saved position after a reconnect
    pub rewind_ms: u64,
    /// Delay before re-checking connectivity after an error while offline
    pub offline_retry_ms: u64,
    /// Media error counters reset after this much quiet time
    pub error_window_ms: u64,
    /// Media error recoveries per track before it is marked unavailable
    pub max_recovery_attempts: u32,
    pub recovery_ready_timeout_ms: u64,
    pub recovery_rewind_ms: u64,
    pub recovery_retry_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            stall_delay_ms: 12_000,
            buffering_timeout_ms: 15_000,
            slow_connection_ms: 10_000,
            ready_timeout_ms: 8_000,
            rewind_ms: 1_000,
            offline_retry_ms: 1_500,
            error_window_ms: 15_000,
            max_recovery_attempts: 3,
            recovery_ready_timeout_ms: 3_000,
            recovery_rewind_ms: 500,
            recovery_retry_ms: 500,
        }
    }
}

/// Retry policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub extraction: RetryPolicy,
    pub play: RetryPolicy,
    pub reconnect: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            extraction: RetryPolicy::extraction(),
            play: RetryPolicy::play(),
            reconnect: RetryPolicy::reconnect(),
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("undertow");

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path).context("Failed to read config file")?;

            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;

            Ok(config)
        } else {
            // Create default config and save it
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
