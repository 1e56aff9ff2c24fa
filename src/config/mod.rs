//! Configuration loading for threadwatch.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `THREADWATCH_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::channel_matcher::ChannelMatcher;

const ENV_PREFIX: &str = "THREADWATCH_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `THREADWATCH_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Chat ingress and reply settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ChatConfig {
    /// Monitored channels. Plain entries match a channel name exactly,
    /// entries prefixed with `re:` are regular expressions.
    ///
    /// Environment variable: `THREADWATCH_CHANNELS` (comma-separated)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,

    /// Name the bot answers to; `@<bot_name>` in a message is an explicit trigger
    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    /// Chat user id of the bot itself, its own posts are ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_user_id: Option<String>,

    /// Shared token expected on incoming webhook calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_token: Option<String>,

    /// Chat server base URL used to post replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    #[serde(default = "default_true")]
    pub replies_enabled: bool,

    /// Team name used to build thread permalinks in issue bodies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

impl ChatConfig {
    /// Base of `{base}/{root_message_id}` thread permalinks. `None` unless both
    /// the server URL and the team are known.
    pub fn permalink_base(&self) -> Option<String> {
        let api_base = self.api_base.as_deref()?.trim_end_matches('/');
        let team = self.team.as_deref()?.trim_matches('/');
        if api_base.is_empty() || team.is_empty() {
            return None;
        }
        Some(format!("{}/{}/pl", api_base, team))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            bot_name: default_bot_name(),
            bot_user_id: None,
            webhook_token: None,
            api_base: None,
            api_token: None,
            replies_enabled: true,
            team: None,
        }
    }
}

/// Thresholds and windows driving aggregation and the decision gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PipelineConfig {
    /// Minimum classifier confidence for a thread to be considered actionable
    #[serde(default = "default_classification_threshold")]
    pub classification_threshold: f32,

    /// Minimum combined confidence for CREATE
    #[serde(default = "default_creation_threshold")]
    pub creation_threshold: f32,

    /// Weight of the classifier confidence against field completeness
    #[serde(default = "default_classifier_weight")]
    pub classifier_weight: f32,

    /// Field similarity at or above which a re-extraction is not a material change
    #[serde(default = "default_update_similarity_threshold")]
    pub update_similarity_threshold: f32,

    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,

    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,

    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    #[serde(default = "default_max_thread_messages")]
    pub max_thread_messages: usize,

    /// Transcript size cap sent to the model, oldest messages are cut first
    #[serde(default = "default_max_transcript_chars")]
    pub max_transcript_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classification_threshold: default_classification_threshold(),
            creation_threshold: default_creation_threshold(),
            classifier_weight: default_classifier_weight(),
            update_similarity_threshold: default_update_similarity_threshold(),
            debounce_seconds: default_debounce_seconds(),
            retention_seconds: default_retention_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            max_thread_messages: default_max_thread_messages(),
            max_transcript_chars: default_max_transcript_chars(),
        }
    }
}

impl PipelineConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_seconds)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Validate thresholds and window ordering
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("classification_threshold", self.classification_threshold),
            ("creation_threshold", self.creation_threshold),
            ("classifier_weight", self.classifier_weight),
            ("update_similarity_threshold", self.update_similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }

        if self.debounce_seconds == 0 {
            return Err(ConfigError::InvalidDebounceWindow {
                value: self.debounce_seconds,
            });
        }

        if self.retention_seconds <= self.debounce_seconds {
            return Err(ConfigError::InvalidRetentionWindow {
                retention: self.retention_seconds,
                debounce: self.debounce_seconds,
            });
        }

        if self.sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidSweepInterval {
                value: self.sweep_interval_seconds,
            });
        }

        if self.max_thread_messages < 2 {
            return Err(ConfigError::InvalidThreadWindow {
                value: self.max_thread_messages,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

impl LlmProvider {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            _ => Err(ConfigError::InvalidLlmProvider {
                value: value.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
        }
    }

    pub fn default_api_base(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
        }
    }
}

/// Language model transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: LlmProvider,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Overrides the provider's public endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            api_base: None,
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
            timeout_seconds: default_llm_timeout_seconds(),
        }
    }
}

impl LlmConfig {
    pub fn api_base(&self) -> String {
        self.api_base
            .clone()
            .unwrap_or_else(|| self.provider.default_api_base().to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Issue tracker (GitHub) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TrackerConfig {
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Labels added to every materialized issue
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_assignee: Option<String>,
    #[serde(default = "default_tracker_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Search the tracker for similar issues before creating one
    #[serde(default = "default_true")]
    pub related_search_enabled: bool,
    /// Only issues created within this many days are considered
    #[serde(default = "default_related_lookback_days")]
    pub related_lookback_days: u32,
    /// Similar issues listed on a new issue
    #[serde(default = "default_related_max_results")]
    pub related_max_results: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
            token: None,
            owner: None,
            repo: None,
            default_labels: Vec::new(),
            default_assignee: None,
            timeout_seconds: default_tracker_timeout_seconds(),
            related_search_enabled: true,
            related_lookback_days: default_related_lookback_days(),
            related_max_results: default_related_max_results(),
        }
    }
}

impl TrackerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Error-monitoring (Sentry) settings. Enrichment is off unless token,
/// organization and project are all present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MonitoringConfig {
    #[serde(default = "default_sentry_api_base")]
    pub api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default = "default_monitoring_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_enrichment_lookback_minutes")]
    pub lookback_minutes: u64,
    #[serde(default = "default_enrichment_max_events")]
    pub max_events: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            api_base: default_sentry_api_base(),
            auth_token: None,
            org: None,
            project: None,
            timeout_seconds: default_monitoring_timeout_seconds(),
            lookback_minutes: default_enrichment_lookback_minutes(),
            max_events: default_enrichment_max_events(),
        }
    }
}

impl MonitoringConfig {
    pub fn is_enabled(&self) -> bool {
        self.auth_token.is_some() && self.org.is_some() && self.project.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            chat: ChatConfig::default(),
            pipeline: PipelineConfig::default(),
            llm: LlmConfig::default(),
            tracker: TrackerConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    fn is_development_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    ///
    /// Every token and API key that is set is replaced by `[REDACTED]`, so the
    /// output is safe to log at startup.
    ///
    /// # Examples
    ///
    /// ```
    /// use threadwatch::config::AppConfig;
    ///
    /// let mut config = AppConfig::default();
    /// config.tracker.token = Some("ghp-secret".into());
    /// let json = config.redacted_json().unwrap();
    /// assert!(!json.contains("ghp-secret"));
    /// ```
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        for secret in [
            &mut config.chat.webhook_token,
            &mut config.chat.api_token,
            &mut config.llm.api_key,
            &mut config.tracker.token,
            &mut config.monitoring.auth_token,
        ] {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    ///
    /// Checks thresholds and windows, compiles every channel rule, and
    /// outside the `local` and `test` profiles requires LLM and GitHub
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found, e.g.
    /// [`ConfigError::InvalidChannelPattern`] for a malformed `re:` rule or
    /// [`ConfigError::MissingTrackerToken`] in production without a token.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;

        // Compiles every channel pattern so a bad regex fails at startup
        ChannelMatcher::from_rules(&self.chat.channels)?;

        if self.chat.bot_name.trim().is_empty() {
            return Err(ConfigError::MissingBotName);
        }

        if self.is_development_profile() {
            return Ok(());
        }

        if self.llm.api_key.is_none() {
            return Err(ConfigError::MissingLlmApiKey);
        }
        if self.tracker.token.is_none() {
            return Err(ConfigError::MissingTrackerToken);
        }
        if self.tracker.owner.is_none() || self.tracker.repo.is_none() {
            return Err(ConfigError::MissingTrackerRepository);
        }

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://threadwatch.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_bot_name() -> String {
    "threadwatch".to_string()
}

fn default_classification_threshold() -> f32 {
    0.6
}

fn default_creation_threshold() -> f32 {
    0.7
}

fn default_classifier_weight() -> f32 {
    0.6
}

fn default_update_similarity_threshold() -> f32 {
    0.85
}

fn default_debounce_seconds() -> u64 {
    120 // 2 minutes of silence
}

fn default_retention_seconds() -> u64 {
    86400 // 24 hours
}

fn default_sweep_interval_seconds() -> u64 {
    300
}

fn default_max_thread_messages() -> usize {
    200
}

fn default_max_transcript_chars() -> usize {
    24_000
}

fn default_llm_provider() -> LlmProvider {
    LlmProvider::OpenAi
}

fn default_llm_model() -> String {
    "gpt-4-turbo-preview".to_string()
}

fn default_llm_temperature() -> f32 {
    0.1
}

fn default_llm_max_tokens() -> u32 {
    2000
}

fn default_llm_timeout_seconds() -> u64 {
    60
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_tracker_timeout_seconds() -> u64 {
    15
}

fn default_related_lookback_days() -> u32 {
    180
}

fn default_related_max_results() -> usize {
    3
}

fn default_sentry_api_base() -> String {
    "https://sentry.io/api/0".to_string()
}

fn default_monitoring_timeout_seconds() -> u64 {
    10
}

fn default_enrichment_lookback_minutes() -> u64 {
    30
}

fn default_enrichment_max_events() -> usize {
    5
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid channel pattern '{pattern}': {source}")]
    InvalidChannelPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("{name} must be between 0.0 and 1.0, got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },
    #[error("debounce window must be positive, got {value}")]
    InvalidDebounceWindow { value: u64 },
    #[error("retention window ({retention}s) must be longer than the debounce window ({debounce}s)")]
    InvalidRetentionWindow { retention: u64, debounce: u64 },
    #[error("sweep interval must be positive, got {value}")]
    InvalidSweepInterval { value: u64 },
    #[error("thread window must keep at least 2 messages, got {value}")]
    InvalidThreadWindow { value: usize },
    #[error("unknown LLM provider '{value}'; expected openai or anthropic")]
    InvalidLlmProvider { value: String },
    #[error("bot name is empty; set THREADWATCH_BOT_NAME")]
    MissingBotName,
    #[error("LLM API key is missing; set THREADWATCH_LLM_API_KEY")]
    MissingLlmApiKey,
    #[error("GitHub token is missing; set THREADWATCH_GITHUB_TOKEN")]
    MissingTrackerToken,
    #[error("GitHub repository is missing; set THREADWATCH_GITHUB_OWNER and THREADWATCH_GITHUB_REPO")]
    MissingTrackerRepository,
}

/// Loads configuration using layered `.env` files and `THREADWATCH_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    ///
    /// Falls back to `.` when the working directory cannot be read.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Directory searched for `.env`, `.env.local`,
    ///   `.env.<profile>` and `.env.<profile>.local`
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates the configuration.
    ///
    /// Values are layered from `.env`, `.env.local`, `.env.<profile>` and
    /// `.env.<profile>.local`, then `THREADWATCH_*` process variables, later
    /// layers winning. Unset keys take their defaults.
    ///
    /// # Returns
    ///
    /// Returns the validated [`AppConfig`].
    ///
    /// # Errors
    ///
    /// Fails with [`ConfigError::EnvFile`] when an env file exists but cannot
    /// be parsed, and with any error [`AppConfig::validate`] reports.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use threadwatch::config::ConfigLoader;
    ///
    /// let config = ConfigLoader::new().load()?;
    /// println!("listening on {}", config.api_bind_addr);
    /// # Ok::<(), threadwatch::config::ConfigError>(())
    /// ```
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let chat = ChatConfig {
            channels: take_list(&mut layered, "CHANNELS"),
            bot_name: take_string(&mut layered, "BOT_NAME").unwrap_or_else(default_bot_name),
            bot_user_id: take_string(&mut layered, "BOT_USER_ID"),
            webhook_token: take_string(&mut layered, "CHAT_WEBHOOK_TOKEN"),
            api_base: take_string(&mut layered, "CHAT_API_BASE"),
            api_token: take_string(&mut layered, "CHAT_API_TOKEN"),
            replies_enabled: take_parsed(&mut layered, "CHAT_REPLIES_ENABLED")
                .unwrap_or_else(default_true),
            team: take_string(&mut layered, "CHAT_TEAM"),
        };

        let pipeline = PipelineConfig {
            classification_threshold: take_parsed(&mut layered, "CLASSIFICATION_THRESHOLD")
                .unwrap_or_else(default_classification_threshold),
            creation_threshold: take_parsed(&mut layered, "CREATION_THRESHOLD")
                .unwrap_or_else(default_creation_threshold),
            classifier_weight: take_parsed(&mut layered, "CLASSIFIER_WEIGHT")
                .unwrap_or_else(default_classifier_weight),
            update_similarity_threshold: take_parsed(&mut layered, "UPDATE_SIMILARITY_THRESHOLD")
                .unwrap_or_else(default_update_similarity_threshold),
            debounce_seconds: take_parsed(&mut layered, "DEBOUNCE_SECONDS")
                .unwrap_or_else(default_debounce_seconds),
            retention_seconds: take_parsed(&mut layered, "RETENTION_SECONDS")
                .unwrap_or_else(default_retention_seconds),
            sweep_interval_seconds: take_parsed(&mut layered, "SWEEP_INTERVAL_SECONDS")
                .unwrap_or_else(default_sweep_interval_seconds),
            max_thread_messages: take_parsed(&mut layered, "MAX_THREAD_MESSAGES")
                .unwrap_or_else(default_max_thread_messages),
            max_transcript_chars: take_parsed(&mut layered, "MAX_TRANSCRIPT_CHARS")
                .unwrap_or_else(default_max_transcript_chars),
        };

        let provider = match take_string(&mut layered, "LLM_PROVIDER") {
            Some(value) => LlmProvider::parse(&value)?,
            None => default_llm_provider(),
        };
        let llm = LlmConfig {
            provider,
            model: take_string(&mut layered, "LLM_MODEL").unwrap_or_else(default_llm_model),
            api_key: take_string(&mut layered, "LLM_API_KEY"),
            api_base: take_string(&mut layered, "LLM_API_BASE"),
            temperature: take_parsed(&mut layered, "LLM_TEMPERATURE")
                .unwrap_or_else(default_llm_temperature),
            max_tokens: take_parsed(&mut layered, "LLM_MAX_TOKENS")
                .unwrap_or_else(default_llm_max_tokens),
            timeout_seconds: take_parsed(&mut layered, "LLM_TIMEOUT_SECONDS")
                .unwrap_or_else(default_llm_timeout_seconds),
        };

        let tracker = TrackerConfig {
            api_base: take_string(&mut layered, "GITHUB_API_BASE")
                .unwrap_or_else(default_github_api_base),
            token: take_string(&mut layered, "GITHUB_TOKEN"),
            owner: take_string(&mut layered, "GITHUB_OWNER"),
            repo: take_string(&mut layered, "GITHUB_REPO"),
            default_labels: take_list(&mut layered, "TRACKER_DEFAULT_LABELS"),
            default_assignee: take_string(&mut layered, "TRACKER_DEFAULT_ASSIGNEE"),
            timeout_seconds: take_parsed(&mut layered, "TRACKER_TIMEOUT_SECONDS")
                .unwrap_or_else(default_tracker_timeout_seconds),
            related_search_enabled: take_parsed(&mut layered, "TRACKER_RELATED_SEARCH")
                .unwrap_or_else(default_true),
            related_lookback_days: take_parsed(&mut layered, "TRACKER_RELATED_LOOKBACK_DAYS")
                .unwrap_or_else(default_related_lookback_days),
            related_max_results: take_parsed(&mut layered, "TRACKER_RELATED_MAX_RESULTS")
                .unwrap_or_else(default_related_max_results),
        };

        let monitoring = MonitoringConfig {
            api_base: take_string(&mut layered, "SENTRY_API_BASE")
                .unwrap_or_else(default_sentry_api_base),
            auth_token: take_string(&mut layered, "SENTRY_AUTH_TOKEN"),
            org: take_string(&mut layered, "SENTRY_ORG"),
            project: take_string(&mut layered, "SENTRY_PROJECT"),
            timeout_seconds: take_parsed(&mut layered, "MONITORING_TIMEOUT_SECONDS")
                .unwrap_or_else(default_monitoring_timeout_seconds),
            lookback_minutes: take_parsed(&mut layered, "ENRICHMENT_LOOKBACK_MINUTES")
                .unwrap_or_else(default_enrichment_lookback_minutes),
            max_events: take_parsed(&mut layered, "ENRICHMENT_MAX_EVENTS")
                .unwrap_or_else(default_enrichment_max_events),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            chat,
            pipeline,
            llm,
            tracker,
            monitoring,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn take_parsed<T: std::str::FromStr>(layered: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    take_string(layered, key).and_then(|value| value.parse().ok())
}

fn take_list(layered: &mut BTreeMap<String, String>, key: &str) -> Vec<String> {
    take_string(layered, key)
        .map(|list| {
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
