use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the forwarder, read from the environment (+ `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    /// Empty means every user may issue commands.
    pub telegram_allowed_users: Vec<i64>,

    // Persistence / media
    pub subscriptions_file: PathBuf,
    pub media_dir: PathBuf,

    // Aggregation
    pub report_interval: Duration,
    pub report_language: String,

    // Network bounds
    pub network_timeout: Duration,
    pub dispatch_max_attempts: u32,
    pub dispatch_backoff: Duration,

    // History
    pub history_limit: usize,
    pub history_pacing: Duration,

    // Completion service
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model_id: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN")
            .and_then(non_empty)
            .or_else(|| env_str("FORWARD_BOT_TOKEN").and_then(non_empty))
            .ok_or_else(|| {
                Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
            })?;
        let telegram_allowed_users = parse_csv_i64(env_str("TELEGRAM_ALLOWED_USERS"));

        let subscriptions_file = PathBuf::from(
            env_str("SUBSCRIPTIONS_FILE").unwrap_or("forward_configs.json".to_string()),
        );
        let media_dir = PathBuf::from(env_str("MEDIA_DIR").unwrap_or("./temp".to_string()));
        fs::create_dir_all(&media_dir)?;

        let report_interval =
            Duration::from_secs(env_u64("REPORT_INTERVAL_SECS").unwrap_or(1800).max(1));
        let report_language = env_str("REPORT_LANGUAGE")
            .and_then(non_empty)
            .unwrap_or("English".to_string());

        let network_timeout =
            Duration::from_millis(env_u64("NETWORK_TIMEOUT_MS").unwrap_or(30_000).max(1));
        let dispatch_max_attempts = env_u32("DISPATCH_MAX_ATTEMPTS").unwrap_or(3).clamp(1, 10);
        let dispatch_backoff =
            Duration::from_millis(env_u64("DISPATCH_BACKOFF_MS").unwrap_or(1000));

        let history_limit = env_usize("HISTORY_LIMIT").unwrap_or(50).clamp(1, 500);
        let history_pacing = Duration::from_millis(env_u64("HISTORY_PACING_MS").unwrap_or(1300));

        let openai_api_key = env_str("OPENAI_API_KEY").and_then(non_empty);
        let openai_base_url = env_str("OPENAI_BASE_URL")
            .and_then(non_empty)
            .unwrap_or("https://api.openai.com/v1".to_string());
        let model_id = env_str("MODEL_ID")
            .and_then(non_empty)
            .unwrap_or("gpt-4o-mini".to_string());

        Ok(Self {
            telegram_bot_token,
            telegram_allowed_users,
            subscriptions_file,
            media_dir,
            report_interval,
            report_language,
            network_timeout,
            dispatch_max_attempts,
            dispatch_backoff,
            history_limit,
            history_pacing,
            openai_api_key,
            openai_base_url,
            model_id,
        })
    }

    /// Defaults with no environment involved. Used by tests and embedders.
    pub fn with_paths(subscriptions_file: PathBuf, media_dir: PathBuf) -> Self {
        Self {
            telegram_bot_token: String::new(),
            telegram_allowed_users: Vec::new(),
            subscriptions_file,
            media_dir,
            report_interval: Duration::from_secs(1800),
            report_language: "English".to_string(),
            network_timeout: Duration::from_secs(30),
            dispatch_max_attempts: 3,
            dispatch_backoff: Duration::from_millis(1000),
            history_limit: 50,
            history_pacing: Duration::from_millis(1300),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            model_id: "gpt-4o-mini".to_string(),
        }
    }

    pub fn is_authorized(&self, user_id: Option<i64>) -> bool {
        if self.telegram_allowed_users.is_empty() {
            return true;
        }
        user_id
            .map(|id| self.telegram_allowed_users.contains(&id))
            .unwrap_or(false)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
