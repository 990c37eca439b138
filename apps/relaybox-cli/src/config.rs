//! CLI configuration.
//!
//! Stored as TOML at `~/.config/relaybox/relaybox.toml` unless `--config`
//! points elsewhere. The file holds the bot token and server secret, so it
//! is written owner-only. `RELAYBOX_SERVER_SECRET` and `RELAYBOX_BOT_TOKEN`
//! override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use relaybox_backend::{HttpConfig, TransportConfig};
use relaybox_crypto::ServerSecret;
use relaybox_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_UPLOAD_TIMEOUT,
};
use relaybox_session::ManagerConfig;
use relaybox_transfer::{DownloadOptions, InterChunkDelay, UploadOptions};
use serde::{Deserialize, Serialize};

pub const SECRET_ENV: &str = "RELAYBOX_SERVER_SECRET";
pub const TOKEN_ENV: &str = "RELAYBOX_BOT_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
    /// Hex (or raw) secret mixed into every chunk key.
    pub server_secret: String,
    pub chunk_size_bytes: usize,
    pub max_concurrent_transfers: usize,
    pub retry_attempts: u32,
    pub request_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub inter_chunk_delay_ms: u64,
    pub parallel_fetches: usize,
    pub auto_retry: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let http = HttpConfig::new("", "");
        Self {
            api_base: http.api_base,
            bot_token: String::new(),
            chat_id: String::new(),
            server_secret: String::new(),
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            upload_timeout_ms: DEFAULT_UPLOAD_TIMEOUT.as_millis() as u64,
            inter_chunk_delay_ms: InterChunkDelay::default().base.as_millis() as u64,
            parallel_fetches: DownloadOptions::default().parallel_fetches,
            auto_retry: false,
        }
    }
}

impl RelayConfig {
    /// Loads `path` (or the default location) and applies environment
    /// overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_overrides(
            std::env::var(SECRET_ENV).ok(),
            std::env::var(TOKEN_ENV).ok(),
        );
        Ok(config)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: RelayConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the configuration, restricting permissions on Unix.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Non-empty values replace the file's secret and token.
    pub fn apply_overrides(&mut self, secret: Option<String>, token: Option<String>) {
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            self.server_secret = secret;
        }
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.bot_token = token;
        }
    }

    pub fn server_secret(&self) -> anyhow::Result<ServerSecret> {
        if self.server_secret.is_empty() {
            anyhow::bail!("server secret not configured (set {SECRET_ENV})");
        }
        ServerSecret::parse(&self.server_secret).context("invalid server secret")
    }

    pub fn http_config(&self) -> anyhow::Result<HttpConfig> {
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            anyhow::bail!("bot_token and chat_id are required (or pass --memory)");
        }
        let mut http = HttpConfig::new(self.bot_token.clone(), self.chat_id.clone());
        http.api_base = self.api_base.trim_end_matches('/').to_string();
        Ok(http)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_retries: self.retry_attempts,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            upload_timeout: Duration::from_millis(self.upload_timeout_ms),
            ..TransportConfig::default()
        }
    }

    pub fn upload_options(&self) -> UploadOptions {
        let defaults = InterChunkDelay::default();
        let inter_chunk_delay = if self.inter_chunk_delay_ms == 0 {
            InterChunkDelay::none()
        } else {
            let base = Duration::from_millis(self.inter_chunk_delay_ms);
            InterChunkDelay {
                base,
                max: defaults.max.max(base),
                ..defaults
            }
        };
        UploadOptions {
            chunk_size: self.chunk_size_bytes,
            inter_chunk_delay,
        }
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            parallel_fetches: self.parallel_fetches.max(1),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent_transfers: self.max_concurrent_transfers,
            auto_retry: self.auto_retry,
            ..ManagerConfig::default()
        }
        .with_transport_retries(self.retry_attempts)
    }
}

/// Default configuration file path.
pub fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("relaybox").join("relaybox.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("relaybox")
            .join("relaybox.toml")
    }
}
