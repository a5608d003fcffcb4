//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! the bot's tuning constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub tg_token: String,
    /// VK access token
    pub vk_token: String,

    /// Album receiving photos sent outside any command
    pub vk_upload_album_id: Option<i64>,
    /// Community owning `vk_upload_album_id`, if it is not the user's own album
    pub vk_upload_group_id: Option<i64>,

    /// "Life is Life" album used by `/add_life`
    pub vk_life_album_id: Option<i64>,
    /// Community owning the "Life is Life" album
    pub vk_life_group_id: Option<i64>,

    /// Community whose wall receives `/wall_post` posts; the token owner's wall when unset
    pub vk_wall_group_id: Option<i64>,

    /// VK API version sent with every call
    #[serde(default = "default_vk_api_version")]
    pub vk_api_version: String,

    /// Media group coalescing window in milliseconds
    #[serde(default = "default_album_latency_ms")]
    pub album_latency_ms: u64,
    /// Extra time an album joiner waits for its releaser, in milliseconds
    #[serde(default = "default_album_join_grace_ms")]
    pub album_join_grace_ms: u64,

    /// Timeout for outgoing HTTP requests (VK API and photo downloads)
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_vk_api_version() -> String {
    "5.199".to_string()
}

const fn default_album_latency_ms() -> u64 {
    500
}

const fn default_album_join_grace_ms() -> u64 {
    5000
}

const fn default_http_timeout_secs() -> u64 {
    30
}

/// Builds the layered configuration source.
///
/// Order (later wins): `config/default`, `config/{RUN_MODE}`, `config/local`,
/// `APP__*` variables, then plain environment variables.
///
/// # Errors
///
/// Returns a `ConfigError` if a present file cannot be parsed.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Not checked into git
        .add_source(File::with_name("config/local").required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        // UPPER_SNAKE_CASE maps to snake_case keys; empty values count as unset
        .add_source(Environment::default().ignore_empty(true).try_parsing(true))
        .build()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use vk_album_bot::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a required token is missing.
    pub fn new() -> Result<Self, ConfigError> {
        build_config()?.try_deserialize()
    }

    /// Media group coalescing window
    #[must_use]
    pub const fn album_window(&self) -> Duration {
        Duration::from_millis(self.album_latency_ms)
    }

    /// Upper bound on how long an album joiner waits for the releaser
    #[must_use]
    pub const fn album_join_timeout(&self) -> Duration {
        Duration::from_millis(self.album_latency_ms.saturating_add(self.album_join_grace_ms))
    }

    /// Timeout for outgoing HTTP requests
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

// Telegram delivery
/// Maximum number of photos in one Telegram media group
pub const MEDIA_GROUP_LIMIT: usize = 10;
/// Pause between consecutive media groups (flood control)
pub const MEDIA_GROUP_PAUSE_MS: u64 = 1000;
/// Initial backoff for Telegram API retries
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum backoff for Telegram API retries
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;
/// Retries after the first failed Telegram API attempt
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;

// VK API
/// Base URL of the VK API
pub const VK_API_BASE_URL: &str = "https://api.vk.com/method";
/// Page size for `photos.get`
pub const VK_PHOTOS_PAGE_SIZE: u64 = 1000;
/// Files accepted by one album upload request
pub const VK_ALBUM_UPLOAD_BATCH: usize = 5;
/// Attempts per VK API call
pub const VK_API_MAX_ATTEMPTS: usize = 3;
/// Fixed delay between VK API attempts
pub const VK_API_RETRY_DELAY_MS: u64 = 1000;

// Photo downloads
/// Attempts per photo download
pub const DOWNLOAD_MAX_ATTEMPTS: usize = 3;
/// Fixed delay between download attempts
pub const DOWNLOAD_RETRY_DELAY_MS: u64 = 2000;
