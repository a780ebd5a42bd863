use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level relay configuration, loaded from `config.toml`.
///
/// Resolution order for the config directory: `--config-dir` flag >
/// `THREADRELAY_CONFIG_DIR` env > `~/.threadrelay`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// HTTP intake server (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Slack app credentials and behaviour (`[slack]`).
    #[serde(default)]
    pub slack: SlackConfig,

    /// Docs assistant API (`[assistant]`).
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Thread-topic persistence (`[store]`).
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let config_dir = home.join(".threadrelay");

        Self {
            workspace_dir: config_dir.join("workspace"),
            config_path: config_dir.join("config.toml"),
            gateway: GatewayConfig::default(),
            slack: SlackConfig::default(),
            assistant: AssistantConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

/// Gateway server configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway port (default: 8787)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Allow binding to a non-localhost address (default: false)
    #[serde(default)]
    pub allow_public_bind: bool,

    /// TTL for Slack event-id idempotency keys.
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Maximum distinct idempotency keys retained in memory.
    #[serde(default = "default_idempotency_max_keys")]
    pub idempotency_max_keys: usize,
}

fn default_gateway_port() -> u16 {
    8787
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_idempotency_ttl_secs() -> u64 {
    300
}

fn default_idempotency_max_keys() -> usize {
    10_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            allow_public_bind: false,
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            idempotency_max_keys: default_idempotency_max_keys(),
        }
    }
}

// ── Slack ─────────────────────────────────────────────────────────

/// Slack app configuration (`[slack]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SlackConfig {
    /// Slack bot OAuth token (xoxb-...).
    #[serde(default)]
    pub bot_token: String,
    /// Signing secret used to verify inbound Events API requests.
    /// Requests are accepted unsigned when omitted.
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// The bot's own user id. Resolved via `auth.test` at startup when omitted.
    #[serde(default)]
    pub bot_user_id: Option<String>,
    /// Slack Web API base URL.
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
    /// Reaction shown on the triggering message while a reply is in flight.
    #[serde(default = "default_processing_reaction")]
    pub processing_reaction: String,
    /// Thread messages fetched to seed a new conversation (1..=100).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".into()
}

fn default_processing_reaction() -> String {
    "eyes".into()
}

fn default_history_limit() -> usize {
    100
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            signing_secret: None,
            bot_user_id: None,
            api_base: default_slack_api_base(),
            processing_reaction: default_processing_reaction(),
            history_limit: default_history_limit(),
        }
    }
}

// ── Assistant ─────────────────────────────────────────────────────

/// Docs assistant configuration (`[assistant]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AssistantConfig {
    /// Public assistant API key, sent as a bearer token.
    #[serde(default)]
    pub api_key: String,
    /// Assistant API base URL.
    #[serde(default = "default_assistant_api_base")]
    pub api_base: String,
    /// Base URL that relative source links are resolved against.
    #[serde(default = "default_docs_base_url")]
    pub docs_base_url: String,
    /// Marker that switches a message into debug mode.
    #[serde(default = "default_debug_marker")]
    pub debug_marker: String,
    /// Per-request timeout for assistant calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_assistant_api_base() -> String {
    "https://api-dsc.mintlify.com".into()
}

fn default_docs_base_url() -> String {
    "https://docs.firstquadrant.ai/".into()
}

fn default_debug_marker() -> String {
    "[debug]".into()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_assistant_api_base(),
            docs_base_url: default_docs_base_url(),
            debug_marker: default_debug_marker(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────

/// Thread-topic store configuration (`[store]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// SQLite database path. Defaults to `<workspace>/topics.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Lifetime of a thread → topic mapping, refreshed on every write.
    #[serde(default = "default_store_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_store_ttl_secs() -> u64 {
    crate::store::TOPIC_TTL_SECS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_secs: default_store_ttl_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".threadrelay"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigResolutionSource {
    CliFlag,
    EnvConfigDir,
    DefaultConfigDir,
}

impl ConfigResolutionSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::CliFlag => "--config-dir",
            Self::EnvConfigDir => "THREADRELAY_CONFIG_DIR",
            Self::DefaultConfigDir => "default",
        }
    }
}

fn resolve_config_dir(cli_override: Option<&Path>) -> Result<(PathBuf, ConfigResolutionSource)> {
    if let Some(dir) = cli_override.filter(|d| !d.as_os_str().is_empty()) {
        return Ok((dir.to_path_buf(), ConfigResolutionSource::CliFlag));
    }

    if let Ok(custom_config_dir) = std::env::var("THREADRELAY_CONFIG_DIR") {
        let custom_config_dir = custom_config_dir.trim();
        if !custom_config_dir.is_empty() {
            return Ok((
                PathBuf::from(custom_config_dir),
                ConfigResolutionSource::EnvConfigDir,
            ));
        }
    }

    Ok((default_config_dir()?, ConfigResolutionSource::DefaultConfigDir))
}

/// First non-empty value among the named environment variables.
fn env_first(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

impl Config {
    /// Load `config.toml` from the resolved config directory, writing a
    /// default file on first run. Env overrides are applied afterwards.
    pub async fn load_or_init(config_dir_override: Option<&Path>) -> Result<Self> {
        let (config_dir, resolution_source) = resolve_config_dir(config_dir_override)?;
        let config_path = config_dir.join("config.toml");
        let workspace_dir = config_dir.join("workspace");

        fs::create_dir_all(&config_dir).await.with_context(|| {
            format!("Failed to create config directory: {}", config_dir.display())
        })?;
        fs::create_dir_all(&workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config.save().await?;

            // Restrict permissions on newly created config file (holds tokens)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config
        };

        config.apply_env_overrides();
        tracing::info!(
            path = %config.config_path.display(),
            workspace = %config.workspace_dir.display(),
            source = resolution_source.as_str(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate values that would otherwise fail at request time.
    ///
    /// Not called by `load_or_init`: offline subcommands (`transcode`,
    /// `config schema`) must work without credentials.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.slack.bot_token.trim().is_empty() {
            anyhow::bail!(
                "slack.bot_token is required (set it in config.toml or SLACK_BOT_USER_OAUTH_TOKEN)"
            );
        }
        if self.assistant.api_key.trim().is_empty() {
            anyhow::bail!(
                "assistant.api_key is required (set it in config.toml or MINTLIFY_PUBLIC_ASSISTANT_API_KEY)"
            );
        }
        if self.assistant.api_base.trim().is_empty() {
            anyhow::bail!("assistant.api_base must not be empty");
        }
        if self.slack.processing_reaction.trim().is_empty() {
            anyhow::bail!("slack.processing_reaction must not be empty");
        }
        if self.store.ttl_secs == 0 {
            anyhow::bail!("store.ttl_secs must be greater than 0");
        }
        Ok(())
    }

    /// Apply environment variable overrides. Prefixed names win over the
    /// deployment-platform names.
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = env_first(&["THREADRELAY_SLACK_BOT_TOKEN", "SLACK_BOT_USER_OAUTH_TOKEN"])
        {
            self.slack.bot_token = token;
        }

        if let Some(secret) =
            env_first(&["THREADRELAY_SLACK_SIGNING_SECRET", "SLACK_SIGNING_SECRET"])
        {
            self.slack.signing_secret = Some(secret);
        }

        if let Some(user_id) = env_first(&["THREADRELAY_SLACK_BOT_USER_ID"]) {
            self.slack.bot_user_id = Some(user_id);
        }

        if let Some(key) = env_first(&[
            "THREADRELAY_ASSISTANT_API_KEY",
            "MINTLIFY_PUBLIC_ASSISTANT_API_KEY",
        ]) {
            self.assistant.api_key = key;
        }

        if let Some(base) = env_first(&["THREADRELAY_ASSISTANT_API_BASE"]) {
            self.assistant.api_base = base;
        }

        if let Some(host) = env_first(&["THREADRELAY_GATEWAY_HOST", "HOST"]) {
            self.gateway.host = host;
        }

        if let Some(port) = env_first(&["THREADRELAY_GATEWAY_PORT", "PORT"]) {
            match port.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("Ignoring invalid gateway port override: {port}"),
            }
        }

        if let Some(path) = env_first(&["THREADRELAY_STORE_PATH"]) {
            self.store.path = Some(PathBuf::from(path));
        }
    }

    /// Topic database path, defaulting into the workspace.
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join("topics.db"))
    }

    /// Clamped page size for thread history lookups.
    pub fn history_limit(&self) -> usize {
        self.slack.history_limit.clamp(1, 100)
    }

    /// Write the config atomically: temp file, fsync, rename.
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

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
