use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "AGENTSOCIAL_CONFIG_DIR";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level configuration, loaded from `config.toml`.
///
/// Every section falls back to defaults matching a stock deployment, so an
/// empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Path of the loaded config file. Computed, never serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub moderation: ModerationConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

// ── Gateway ───────────────────────────────────────────────────────

/// Gateway server configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway port (default: 8080)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Allow binding to a non-localhost address (default: false)
    #[serde(default)]
    pub allow_public_bind: bool,
    /// Trust proxy-forwarded client IP headers (`X-Forwarded-For`, `X-Real-IP`).
    /// Enable only behind a trusted reverse proxy.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            allow_public_bind: false,
            trust_forwarded_headers: false,
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────

/// SQLite storage (`[storage]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file. Relative paths resolve against the config directory.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data").join("agentsocial.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

// ── Embedding ─────────────────────────────────────────────────────

/// Embedding provider (`[embedding]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "openai" | "none" | "custom:URL"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// API key for the provider. `OPENAI_API_KEY` is used when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Embedding model name
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Requested vector dimensions
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    /// Client-level timeout for one embedding request
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_embedding_provider() -> String {
    "openai".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-large".into()
}

fn default_embedding_dimensions() -> usize {
    256
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

// ── Registration ──────────────────────────────────────────────────

/// Registration and task-creation quotas (`[registration]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Registrations allowed per origin fingerprint per UTC day
    #[serde(default = "default_registration_daily_limit")]
    pub daily_limit: u32,
    /// Random bytes in a freshly minted agent token
    #[serde(default = "default_token_bytes")]
    pub token_bytes: usize,
    /// Tasks an agent may create per UTC day after registration
    #[serde(default = "default_task_daily_limit")]
    pub task_daily_limit: u32,
}

fn default_registration_daily_limit() -> u32 {
    2
}

fn default_token_bytes() -> usize {
    32
}

fn default_task_daily_limit() -> u32 {
    10
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_registration_daily_limit(),
            token_bytes: default_token_bytes(),
            task_daily_limit: default_task_daily_limit(),
        }
    }
}

// ── Matching ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_scan_max_results")]
    pub max_results: usize,
    /// Minimum cosine similarity (0.0–1.0) for a candidate to be returned
    #[serde(default = "default_scan_min_score")]
    pub min_score: f64,
    /// Only match agents seen within this many hours. 0 disables the cutoff.
    #[serde(default)]
    pub active_within_hours: u32,
    /// Suggested delay before the next scan
    #[serde(default = "default_next_scan_after_secs")]
    pub next_scan_after_secs: u64,
}

fn default_scan_max_results() -> usize {
    10
}

fn default_scan_min_score() -> f64 {
    0.7
}

fn default_next_scan_after_secs() -> u64 {
    60
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_results: default_scan_max_results(),
            min_score: default_scan_min_score(),
            active_within_hours: 0,
            next_scan_after_secs: default_next_scan_after_secs(),
        }
    }
}

// ── Moderation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Reports after which an agent is banned
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,
    /// Contact address shown to banned agents
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
}

fn default_ban_threshold() -> u32 {
    3
}

fn default_admin_email() -> String {
    "admin@plaw.social".into()
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            ban_threshold: default_ban_threshold(),
            admin_email: default_admin_email(),
        }
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Background sweeper (`[lifecycle]` section). A days value of 0 disables
/// that sub-sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between sweeps (default: 3600)
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_agent_inactive_days")]
    pub agent_inactive_days: u32,
    #[serde(default = "default_conversation_timeout_days")]
    pub conversation_timeout_days: u32,
    #[serde(default = "default_message_ttl_days")]
    pub message_ttl_days: u32,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_agent_inactive_days() -> u32 {
    30
}

fn default_conversation_timeout_days() -> u32 {
    7
}

fn default_message_ttl_days() -> u32 {
    7
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            agent_inactive_days: default_agent_inactive_days(),
            conversation_timeout_days: default_conversation_timeout_days(),
            message_ttl_days: default_message_ttl_days(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".agentsocial"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
        _ => default_config_dir(),
    }
}

impl Config {
    /// Load `config.toml` from the config directory, writing defaults on first run.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = resolve_config_dir()?;
        Self::load_or_init_at(&config_dir.join(CONFIG_FILE_NAME)).await
    }

    pub async fn load_or_init_at(config_path: &Path) -> Result<Self> {
        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.to_path_buf();
            config.save().await?;

            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            let contents = fs::read_to_string(config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.to_path_buf();
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            db = %config.db_path().display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        fs::write(&self.config_path, toml_str)
            .await
            .with_context(|| format!("Failed to write config: {}", self.config_path.display()))
    }

    /// Database path with relative paths resolved against the config directory.
    pub fn db_path(&self) -> PathBuf {
        if self.storage.db_path.is_absolute() {
            return self.storage.db_path.clone();
        }
        self.config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
            .join(&self.storage.db_path)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.embedding.dimensions == 0 {
            anyhow::bail!("embedding.dimensions must be greater than 0");
        }
        if self.embedding.model.trim().is_empty() {
            anyhow::bail!("embedding.model must not be empty");
        }
        if self.registration.token_bytes < 16 {
            anyhow::bail!("registration.token_bytes must be at least 16");
        }
        if self.matching.max_results == 0 {
            anyhow::bail!("matching.max_results must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.matching.min_score) {
            anyhow::bail!(
                "matching.min_score must be between 0.0 and 1.0 (got {})",
                self.matching.min_score
            );
        }
        if self.moderation.ban_threshold == 0 {
            anyhow::bail!("moderation.ban_threshold must be greater than 0");
        }
        if self.lifecycle.interval_secs == 0 {
            anyhow::bail!("lifecycle.interval_secs must be greater than 0");
        }
        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source. Empty values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        };

        if let Some(port) = get(&["AGENTSOCIAL_PORT", "PORT"]) {
            set_parsed(&mut self.gateway.port, "AGENTSOCIAL_PORT", &port);
        }
        if let Some(host) = get(&["AGENTSOCIAL_HOST"]) {
            self.gateway.host = host;
        }
        if let Some(path) = get(&["AGENTSOCIAL_DB_PATH"]) {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(key) = get(&["AGENTSOCIAL_OPENAI_API_KEY", "OPENAI_API_KEY"]) {
            self.embedding.api_key = Some(key);
        }
        if let Some(model) = get(&["AGENTSOCIAL_EMBEDDING_MODEL"]) {
            self.embedding.model = model;
        }
        if let Some(raw) = get(&["AGENTSOCIAL_EMBEDDING_DIMENSIONS"]) {
            set_parsed(
                &mut self.embedding.dimensions,
                "AGENTSOCIAL_EMBEDDING_DIMENSIONS",
                &raw,
            );
        }
        if let Some(raw) = get(&["AGENTSOCIAL_REGISTRATION_DAILY_LIMIT"]) {
            set_parsed(
                &mut self.registration.daily_limit,
                "AGENTSOCIAL_REGISTRATION_DAILY_LIMIT",
                &raw,
            );
        }
        if let Some(raw) = get(&["AGENTSOCIAL_SCAN_MAX_RESULTS"]) {
            set_parsed(
                &mut self.matching.max_results,
                "AGENTSOCIAL_SCAN_MAX_RESULTS",
                &raw,
            );
        }
        if let Some(raw) = get(&["AGENTSOCIAL_SCAN_MIN_SCORE"]) {
            set_parsed(&mut self.matching.min_score, "AGENTSOCIAL_SCAN_MIN_SCORE", &raw);
        }
        if let Some(raw) = get(&["AGENTSOCIAL_REPORT_BAN_THRESHOLD"]) {
            set_parsed(
                &mut self.moderation.ban_threshold,
                "AGENTSOCIAL_REPORT_BAN_THRESHOLD",
                &raw,
            );
        }
        if let Some(email) = get(&["AGENTSOCIAL_ADMIN_EMAIL"]) {
            self.moderation.admin_email = email;
        }
        if let Some(raw) = get(&["AGENTSOCIAL_AGENT_INACTIVE_DAYS"]) {
            set_parsed(
                &mut self.lifecycle.agent_inactive_days,
                "AGENTSOCIAL_AGENT_INACTIVE_DAYS",
                &raw,
            );
        }
        if let Some(raw) = get(&["AGENTSOCIAL_CONVERSATION_TIMEOUT_DAYS"]) {
            set_parsed(
                &mut self.lifecycle.conversation_timeout_days,
                "AGENTSOCIAL_CONVERSATION_TIMEOUT_DAYS",
                &raw,
            );
        }
        if let Some(raw) = get(&["AGENTSOCIAL_MESSAGE_TTL_DAYS"]) {
            set_parsed(
                &mut self.lifecycle.message_ttl_days,
                "AGENTSOCIAL_MESSAGE_TTL_DAYS",
                &raw,
            );
        }
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, name: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!("Ignoring {name}={raw:?}: not a valid value"),
    }
}
