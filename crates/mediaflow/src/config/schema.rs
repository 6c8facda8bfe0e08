use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Falls back to `~/.mediaflow/data/mediaflow.db`.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL, used to build the provider webhook URL.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// How long a claimed trigger stays hidden before it is redelivered.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Deliveries after which a trigger is buried and the job marked failed.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 8)
}

fn default_lease_secs() -> u64 {
    300
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            lease_secs: default_lease_secs(),
            max_deliveries: default_max_deliveries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: Option<String>,
    #[serde(default)]
    pub speech_model: Option<String>,
    #[serde(default = "default_true")]
    pub speaker_labels: bool,
    /// Route the provider posts completion callbacks to.
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// Shared secret the provider echoes back in a header on every callback.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub webhook_secret_env_var: Option<String>,
}

fn default_provider_base_url() -> String {
    "https://api.assemblyai.com".to_string()
}

fn default_api_key_env_var() -> Option<String> {
    Some("ASSEMBLYAI_API_KEY".to_string())
}

fn default_true() -> bool {
    true
}

fn default_webhook_path() -> String {
    "/api/webhooks/transcription".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key: None,
            api_key_file: None,
            api_key_env_var: default_api_key_env_var(),
            speech_model: None,
            speaker_labels: true,
            webhook_path: default_webhook_path(),
            webhook_secret: None,
            webhook_secret_env_var: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Base URL media keys are resolved against when building read URLs.
    #[serde(default = "default_media_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub signing_key: Option<String>,
    #[serde(default)]
    pub signing_key_file: Option<String>,
    #[serde(default = "default_signing_key_env_var")]
    pub signing_key_env_var: Option<String>,
    #[serde(default = "default_url_ttl_secs")]
    pub url_ttl_secs: u64,
}

fn default_media_base_url() -> String {
    "http://127.0.0.1:8080/media".to_string()
}

fn default_signing_key_env_var() -> Option<String> {
    Some("MEDIAFLOW_MEDIA_SIGNING_KEY".to_string())
}

fn default_url_ttl_secs() -> u64 {
    3600
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            base_url: default_media_base_url(),
            signing_key: None,
            signing_key_file: None,
            signing_key_env_var: default_signing_key_env_var(),
            url_ttl_secs: default_url_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Analysis service endpoint. Each step is posted here.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_env_var: Option<String>,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_analysis_timeout_secs() -> u64 {
    120
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            token_env_var: None,
            timeout_secs: default_analysis_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Lease of a stage runner dispatch. Renewed after every analysis step.
    #[serde(default = "default_run_ttl_secs")]
    pub run_ttl_secs: u64,
    /// Lease held around a single provider submission.
    #[serde(default = "default_submit_ttl_secs")]
    pub submit_ttl_secs: u64,
}

fn default_run_ttl_secs() -> u64 {
    900
}

fn default_submit_ttl_secs() -> u64 {
    120
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            run_ttl_secs: default_run_ttl_secs(),
            submit_ttl_secs: default_submit_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// A job untouched for this long with nothing in flight counts as stuck.
    #[serde(default = "default_stall_after_secs")]
    pub stall_after_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_poll_concurrency")]
    pub poll_concurrency: usize,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_stall_after_secs() -> u64 {
    900
}

fn default_batch_size() -> u64 {
    25
}

fn default_poll_concurrency() -> usize {
    4
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            stall_after_secs: default_stall_after_secs(),
            batch_size: default_batch_size(),
            poll_concurrency: default_poll_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            workers: WorkersConfig::default(),
            provider: ProviderConfig::default(),
            media: MediaConfig::default(),
            analysis: AnalysisConfig::default(),
            guard: GuardConfig::default(),
            sweeper: SweeperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Full webhook URL handed to the provider, if a public base URL is set.
    pub fn webhook_url(&self) -> Option<String> {
        self.server.public_base_url.as_ref().map(|base| {
            format!(
                "{}{}",
                base.trim_end_matches('/'),
                self.provider.webhook_path
            )
        })
    }
}
