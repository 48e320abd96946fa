//! Pipeline configuration
//!
//! A single [`PipelineConfig`] is built once at startup, either from defaults
//! through the builder methods or from the environment with
//! [`PipelineConfig::from_env`], and handed to every component.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default URL the proxy core measures delay against
pub const DEFAULT_DELAY_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Default speed test download URLs, tried in order
pub const DEFAULT_SPEED_URLS: &[&str] = &[
    "https://speed.cloudflare.com/__down?bytes=2000000",
    "https://cachefly.cachefly.net/5mb.bin",
];

/// Which proxy-core build is installed; gates the protocols it can load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreFlavor {
    Classic,
    Meta,
}

impl CoreFlavor {
    pub fn supports_vless(self) -> bool {
        self == CoreFlavor::Meta
    }

    pub fn supports_hysteria2(self) -> bool {
        self == CoreFlavor::Meta
    }
}

impl FromStr for CoreFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classic" | "clash" | "premium" => Ok(CoreFlavor::Classic),
            "meta" | "clash-meta" | "mihomo" => Ok(CoreFlavor::Meta),
            other => Err(format!("unknown core flavor: {}", other)),
        }
    }
}

impl fmt::Display for CoreFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreFlavor::Classic => write!(f, "classic"),
            CoreFlavor::Meta => write!(f, "meta"),
        }
    }
}

/// Which heavy tests the worker pool runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeavyMode {
    Off,
    Unlock,
    Speed,
    Both,
}

impl HeavyMode {
    pub fn is_enabled(self) -> bool {
        self != HeavyMode::Off
    }

    pub fn runs_unlock(self) -> bool {
        matches!(self, HeavyMode::Unlock | HeavyMode::Both)
    }

    pub fn runs_speed(self) -> bool {
        matches!(self, HeavyMode::Speed | HeavyMode::Both)
    }
}

impl FromStr for HeavyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => Ok(HeavyMode::Off),
            "unlock" => Ok(HeavyMode::Unlock),
            "speed" => Ok(HeavyMode::Speed),
            "both" | "all" => Ok(HeavyMode::Both),
            other => Err(format!("unknown heavy mode: {}", other)),
        }
    }
}

impl fmt::Display for HeavyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HeavyMode::Off => "off",
            HeavyMode::Unlock => "unlock",
            HeavyMode::Speed => "speed",
            HeavyMode::Both => "both",
        };
        write!(f, "{}", s)
    }
}

/// Throughput test tunables
#[derive(Debug, Clone)]
pub struct SpeedConfig {
    /// Download URLs, tried in order until one yields data
    pub urls: Vec<String>,
    /// Whole-request timeout per URL
    pub timeout: Duration,
    /// Stop reading after this long
    pub max_duration: Duration,
    /// Stop reading after this many bytes
    pub byte_budget: u64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            urls: DEFAULT_SPEED_URLS.iter().map(|u| u.to_string()).collect(),
            timeout: Duration::from_secs(8),
            max_duration: Duration::from_millis(2500),
            byte_budget: 512 * 1024,
        }
    }
}

/// Configuration shared by every stage of a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // TCP stage
    pub tcp_timeout: Duration,
    pub dns_timeout: Duration,
    pub tcp_concurrency: usize,

    // Delay stage
    pub delay_concurrency: usize,
    /// Latency ceiling applied by both the TCP and delay stages
    pub max_latency_ms: u32,
    pub delay_test_url: String,
    /// Timeout the proxy core applies to one delay measurement
    pub delay_timeout_ms: u32,
    /// Client-side timeout for one control-API request
    pub api_request_timeout: Duration,

    // Proxy core
    pub core_binary: PathBuf,
    pub core_flavor: CoreFlavor,
    pub api_host: String,
    pub api_port: u16,
    pub mixed_port: u16,
    pub socks_port: u16,
    pub api_secret: Option<String>,
    pub api_ready_timeout: Duration,
    pub api_poll_interval: Duration,
    /// How long a freshly spawned core must stay alive to count as started
    pub start_grace: Duration,
    /// How long `stop` waits after SIGTERM before escalating to SIGKILL
    pub stop_timeout: Duration,
    /// Directory rendered core configs are written to
    pub work_dir: PathBuf,

    // Heavy tests
    pub heavy_mode: HeavyMode,
    pub heavy_budget: usize,
    pub worker_count: usize,
    pub worker_base_port: u16,
    pub worker_port_stride: u16,
    pub switch_settle: Duration,
    pub unlock_timeout: Duration,
    pub speed: SpeedConfig,

    // Finalization
    pub rename: bool,
    pub name_max_length: usize,
    pub output_dir: PathBuf,
    pub geo_cache_path: PathBuf,
    pub mmdb_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(8),
            dns_timeout: Duration::from_secs(5),
            tcp_concurrency: 20,
            delay_concurrency: 50,
            max_latency_ms: 2000,
            delay_test_url: DEFAULT_DELAY_TEST_URL.to_string(),
            delay_timeout_ms: 5000,
            api_request_timeout: Duration::from_secs(10),
            core_binary: PathBuf::from("clash"),
            core_flavor: CoreFlavor::Meta,
            api_host: "127.0.0.1".to_string(),
            api_port: 9091,
            mixed_port: 7890,
            socks_port: 7891,
            api_secret: None,
            api_ready_timeout: Duration::from_secs(20),
            api_poll_interval: Duration::from_millis(500),
            start_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(2),
            work_dir: std::env::temp_dir().join("node-validator"),
            heavy_mode: HeavyMode::Unlock,
            heavy_budget: 50,
            worker_count: 3,
            worker_base_port: 7890 + 200,
            worker_port_stride: 100,
            switch_settle: Duration::from_millis(100),
            unlock_timeout: Duration::from_secs(5),
            speed: SpeedConfig::default(),
            rename: true,
            name_max_length: 20,
            output_dir: PathBuf::from("output"),
            geo_cache_path: PathBuf::from("data/ip_cache.json"),
            mmdb_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables; malformed values are
    /// logged and ignored
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("PROXY_TCP_TIMEOUT") {
            config.tcp_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PROXY_DNS_TIMEOUT") {
            config.dns_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("PROXY_BATCH_SIZE") {
            config.tcp_concurrency = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("PROXY_DELAY_CONCURRENCY") {
            config.delay_concurrency = n.max(1);
        }
        if let Some(ms) = env_parse("PROXY_MAX_LATENCY") {
            config.max_latency_ms = ms;
        }
        if let Some(url) = env_string("PROXY_DELAY_TEST_URL") {
            config.delay_test_url = url;
        }
        if let Some(ms) = env_parse("PROXY_DELAY_TIMEOUT") {
            config.delay_timeout_ms = ms;
        }

        if let Some(path) = env_string("CLASH_PATH") {
            config.core_binary = PathBuf::from(path);
        }
        if let Some(flavor) = env_parse("CLASH_CORE") {
            config.core_flavor = flavor;
        }
        if let Some(port) = env_parse("CLASH_API_PORT") {
            config.api_port = port;
        }
        if let Some(port) = env_parse::<u16>("CLASH_MIXED_PORT") {
            config.mixed_port = port;
            config.worker_base_port = port.saturating_add(200);
        }
        if let Some(port) = env_parse("CLASH_SOCKS_PORT") {
            config.socks_port = port;
        }
        config.api_secret = env_string("CLASH_API_SECRET");
        if let Some(secs) = env_parse::<u64>("PROXY_API_READY_TIMEOUT") {
            config.api_ready_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("PROXY_API_POLL_INTERVAL") {
            config.api_poll_interval = Duration::from_millis(ms.max(10));
        }

        if let Some(mode) = env_parse("PROXY_HEAVY_MODE") {
            config.heavy_mode = mode;
        }
        if env_bool("UNLOCK_TEST_ENABLED") == Some(false) {
            config.heavy_mode = HeavyMode::Off;
        }
        if let Some(n) = env_parse("UNLOCK_TEST_LIMIT") {
            config.heavy_budget = n;
        }
        if let Some(n) = env_parse::<usize>("UNLOCK_WORKER_COUNT") {
            config.worker_count = n.max(1);
        }

        if let Some(urls) = env_string("PROXY_SPEED_TEST_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                config.speed.urls = urls;
            }
        }
        if let Some(secs) = env_parse::<u64>("PROXY_SPEED_TIMEOUT") {
            config.speed.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<f64>("PROXY_SPEED_MAX_DURATION") {
            match Duration::try_from_secs_f64(secs) {
                Ok(duration) if !duration.is_zero() => config.speed.max_duration = duration,
                Ok(_) => warn!("ignoring PROXY_SPEED_MAX_DURATION={}: must be positive", secs),
                Err(e) => warn!("ignoring PROXY_SPEED_MAX_DURATION={}: {}", secs, e),
            }
        }
        if let Some(bytes) = env_parse("PROXY_SPEED_MIN_BYTES") {
            config.speed.byte_budget = bytes;
        }

        if let Some(n) = env_parse::<usize>("NODE_NAME_MAX_LENGTH") {
            config.name_max_length = n.max(1);
        }
        if let Some(dir) = env_string("PROXY_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_string("PROXY_GEO_CACHE") {
            config.geo_cache_path = PathBuf::from(path);
        }
        config.mmdb_path = env_string("PROXY_MMDB_PATH").map(PathBuf::from);

        config
    }

    pub fn with_tcp_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_timeout = timeout;
        self
    }

    pub fn with_dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    pub fn with_tcp_concurrency(mut self, concurrency: usize) -> Self {
        self.tcp_concurrency = concurrency.max(1);
        self
    }

    pub fn with_delay_concurrency(mut self, concurrency: usize) -> Self {
        self.delay_concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_latency_ms(mut self, ms: u32) -> Self {
        self.max_latency_ms = ms;
        self
    }

    pub fn with_core_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.core_binary = path.into();
        self
    }

    pub fn with_core_flavor(mut self, flavor: CoreFlavor) -> Self {
        self.core_flavor = flavor;
        self
    }

    pub fn with_api_ready_timeout(mut self, timeout: Duration) -> Self {
        self.api_ready_timeout = timeout;
        self
    }

    pub fn with_api_poll_interval(mut self, interval: Duration) -> Self {
        self.api_poll_interval = interval;
        self
    }

    pub fn with_start_grace(mut self, grace: Duration) -> Self {
        self.start_grace = grace;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_heavy_mode(mut self, mode: HeavyMode) -> Self {
        self.heavy_mode = mode;
        self
    }

    pub fn with_heavy_budget(mut self, budget: usize) -> Self {
        self.heavy_budget = budget;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    pub fn with_switch_settle(mut self, settle: Duration) -> Self {
        self.switch_settle = settle;
        self
    }

    pub fn with_rename(mut self, rename: bool) -> Self {
        self.rename = rename;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_geo_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.geo_cache_path = path.into();
        self
    }

    pub fn with_mmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mmdb_path = Some(path.into());
        self
    }

    /// Per-candidate time bound for one heavy test round
    ///
    /// The speed share covers one full attempt per fallback URL.
    pub fn heavy_probe_timeout(&self) -> Duration {
        let mut timeout = Duration::ZERO;
        if self.heavy_mode.runs_unlock() {
            timeout += self.unlock_timeout;
        }
        if self.heavy_mode.runs_speed() {
            let attempts = u32::try_from(self.speed.urls.len().max(1)).unwrap_or(u32::MAX);
            timeout += self.speed.timeout.saturating_mul(attempts);
        }
        timeout
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env_string(key)?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring {}={:?}: not a boolean", key, raw);
            None
        }
    }
}
