use std::{collections::HashMap, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::warn;

/// Built-in upstream pair used when the configuration omits nameservers.
pub const DEFAULT_UPSTREAMS: [&str; 2] = ["8.8.8.8:53", "1.1.1.1:53"];

/// Fallback worker endpoint used when no endpoint list is configured.
const DEFAULT_WORKER_URL: &str = "https://apricot-emu-jacklin-qikeha7m.bls.dev";

/// Runtime configuration parsed from `phantomdns.toml`.
///
/// Read once at startup; immutable for the process lifetime.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_true")]
    pub tcp_enabled: bool,
    #[serde(default)]
    pub metrics_listen: Option<String>,
    /// Per-query handling budget. Must stay below any client read budget so
    /// abandoned fallback attempts still produce a reply.
    #[serde(default = "default_query_deadline_ms")]
    pub query_deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxySection {
    /// Domain suffixes resolved through the worker indirection layer.
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub version: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Environment variable holding the API secret.
    #[serde(default = "default_api_secret_env")]
    pub api_secret_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_endpoints")]
    pub endpoints: Vec<WorkerEndpointEntry>,
    /// Region ranking applied when endpoints are discovered at run time.
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default = "default_invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// When true, the endpoint list is polled from the management API
    /// instead of taken from `endpoints`.
    #[serde(default)]
    pub discovery: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WorkerEndpointEntry {
    pub url: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_listen() -> String {
    "127.0.0.1:5353".into()
}

fn default_true() -> bool {
    true
}

fn default_query_deadline_ms() -> u64 {
    9_000
}

fn default_nameservers() -> Vec<String> {
    DEFAULT_UPSTREAMS.iter().map(|s| s.to_string()).collect()
}

fn default_attempt_timeout_ms() -> u64 {
    2_000
}

fn default_api_base_url() -> String {
    "https://api.bless.network".into()
}

fn default_api_version() -> String {
    "v1".into()
}

fn default_api_key_env() -> String {
    "PHANTOMDNS_API_KEY".into()
}

fn default_api_secret_env() -> String {
    "PHANTOMDNS_API_SECRET".into()
}

fn default_worker_endpoints() -> Vec<WorkerEndpointEntry> {
    vec![WorkerEndpointEntry {
        url: DEFAULT_WORKER_URL.into(),
        region: default_region(),
    }]
}

fn default_regions() -> Vec<String> {
    vec!["us-east".into(), "eu-west".into(), "ap-east".into()]
}

fn default_region() -> String {
    "us-east".into()
}

fn default_worker_count() -> usize {
    1
}

fn default_invoke_timeout_ms() -> u64 {
    15_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tcp_enabled: true,
            metrics_listen: None,
            query_deadline_ms: default_query_deadline_ms(),
        }
    }
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            nameservers: default_nameservers(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            version: default_api_version(),
            api_key_env: default_api_key_env(),
            api_secret_env: default_api_secret_env(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            endpoints: default_worker_endpoints(),
            regions: default_regions(),
            count: default_worker_count(),
            attributes: HashMap::new(),
            invoke_timeout_ms: default_invoke_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery: false,
        }
    }
}

impl Settings {
    /// Read and parse the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read config at {}", path.display()))?;
        let mut settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("Malformed config at {}", path.display()))?;
        settings.normalise();
        Ok(settings)
    }

    /// Load `path` when it exists, otherwise fall back to documented
    /// defaults with a warning.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            warn!(config = %path.display(), "Config missing; using built-in defaults");
            Ok(Self::default())
        }
    }

    /// Upstream nameservers with the `:53` port filled in where absent.
    /// Invariant: never empty.
    pub fn nameservers(&self) -> Vec<String> {
        let listed: Vec<String> = self
            .upstream
            .nameservers
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                if entry.contains(':') {
                    entry.to_string()
                } else {
                    format!("{entry}:53")
                }
            })
            .collect();
        if listed.is_empty() {
            default_nameservers()
        } else {
            listed
        }
    }

    fn normalise(&mut self) {
        if self.worker.endpoints.is_empty() {
            self.worker.endpoints = default_worker_endpoints();
        }
    }
}

/// Resolve the platform default location of `phantomdns.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("net", "phantomdns", "PhantomDNS")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("phantomdns.toml"))
}
