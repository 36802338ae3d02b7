use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use teloxide::types::{ChatId, UserId};
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Unknown IANA timezone name.
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
    /// Validation error.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Telegram tokens are `{bot_id}:{secret}` with a numeric bot id.
static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+:[A-Za-z0-9_-]+$").expect("valid token regex"));

#[derive(Deserialize)]
struct ConfigFile {
    owner_ids: Vec<u64>,
    #[serde(default)]
    telegram_bot_token: String,
    #[serde(default)]
    anthropic_api_key: String,
    #[serde(default = "default_llm_model")]
    llm_model: String,
    /// Override for the Anthropic endpoint (tests, proxies).
    llm_base_url: Option<String>,
    #[serde(default = "default_credentials_path")]
    google_credentials_path: String,
    #[serde(default = "default_calendar_id")]
    calendar_id: String,
    /// Spreadsheet holding the expense worksheet. Expense commands are
    /// disabled when unset.
    spreadsheet_id: Option<String>,
    #[serde(default = "default_worksheet_name")]
    worksheet_name: String,
    #[serde(default = "default_categories")]
    expense_categories: Vec<String>,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default = "default_upcoming_events_limit")]
    upcoming_events_limit: u32,
    #[serde(default = "default_history_turns")]
    history_turns: usize,
    log_chat_id: Option<i64>,
    /// Directory for state files (logs, history). Defaults to current directory.
    data_dir: Option<String>,
}

fn default_llm_model() -> String {
    "claude-haiku-4-5-20251001".to_string()
}

fn default_credentials_path() -> String {
    "credentials/google_credentials.json".to_string()
}

fn default_calendar_id() -> String {
    "primary".to_string()
}

fn default_worksheet_name() -> String {
    "Expenses".to_string()
}

fn default_categories() -> Vec<String> {
    [
        "Alimentari",
        "Trasporti",
        "Casa",
        "Bollette",
        "Salute",
        "Intrattenimento",
        "Abbigliamento",
        "Regali",
        "Altro",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_timezone() -> String {
    "Europe/Rome".to_string()
}

fn default_upcoming_events_limit() -> u32 {
    10
}

fn default_history_turns() -> usize {
    10
}

pub struct Config {
    /// Users allowed to talk to the bot. The first one receives startup notices.
    pub owner_ids: Vec<UserId>,
    pub telegram_bot_token: String,
    pub anthropic_api_key: String,
    pub llm_model: String,
    pub llm_base_url: Option<String>,
    pub google_credentials_path: PathBuf,
    pub calendar_id: String,
    pub spreadsheet_id: Option<String>,
    pub worksheet_name: String,
    pub expense_categories: Vec<String>,
    pub timezone: Tz,
    /// How many upcoming events are fetched for listing and disambiguation.
    pub upcoming_events_limit: u32,
    /// How many recent turns are handed to the interpreter as context.
    pub history_turns: usize,
    pub log_chat_id: Option<ChatId>,
    pub data_dir: PathBuf,
}

impl Config {
    /// Load and validate a config file.
    ///
    /// `TELEGRAM_TOKEN` and `ANTHROPIC_API_KEY` from the environment take
    /// precedence over the file so secrets can stay in `.env`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    fn load_with_env<P, F>(path: P, env: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let mut file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if let Some(token) = env("TELEGRAM_TOKEN").filter(|t| !t.is_empty()) {
            file.telegram_bot_token = token;
        }
        if let Some(key) = env("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
            file.anthropic_api_key = key;
        }

        if file.owner_ids.is_empty() {
            return Err(ConfigError::Validation("owner_ids must contain at least one user ID".into()));
        }
        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        if !TOKEN_PATTERN.is_match(&file.telegram_bot_token) {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }
        if file.anthropic_api_key.is_empty() {
            return Err(ConfigError::Validation("anthropic_api_key is required".into()));
        }
        let expense_categories = dedup_categories(file.expense_categories);
        if expense_categories.is_empty() {
            return Err(ConfigError::Validation("expense_categories must not be empty".into()));
        }
        if file.upcoming_events_limit == 0 {
            return Err(ConfigError::Validation("upcoming_events_limit must be at least 1".into()));
        }

        let timezone: Tz = file
            .timezone
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone(file.timezone.clone()))?;

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            owner_ids: file.owner_ids.into_iter().map(UserId).collect(),
            telegram_bot_token: file.telegram_bot_token,
            anthropic_api_key: file.anthropic_api_key,
            llm_model: file.llm_model,
            llm_base_url: file.llm_base_url,
            google_credentials_path: PathBuf::from(file.google_credentials_path),
            calendar_id: file.calendar_id,
            spreadsheet_id: file.spreadsheet_id.filter(|id| !id.trim().is_empty()),
            worksheet_name: file.worksheet_name,
            expense_categories,
            timezone,
            upcoming_events_limit: file.upcoming_events_limit,
            history_turns: file.history_turns,
            log_chat_id: file.log_chat_id.map(ChatId),
            data_dir,
        })
    }

    pub fn is_owner(&self, user_id: UserId) -> bool {
        self.owner_ids.contains(&user_id)
    }
}

/// Trim category names and drop repeats, keeping first-seen order.
fn dedup_categories(categories: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    categories
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && seen.insert(c.to_lowercase()))
        .collect()
}
