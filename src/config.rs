//! Gateway configuration
//!
//! Settings come from three layers, later layers winning:
//! 1. Built-in defaults
//! 2. An optional YAML file (`CONFIG_FILE`, default `airelay.yaml` next to
//!    the data directory)
//! 3. Environment variables
//!
//! `channels:` and `models:` entries in the YAML file override DB-backed
//! rows; they are assigned negative ids so they can never collide with
//! persisted channels.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::{fs, path::PathBuf};

use once_cell::sync::Lazy;

use crate::model::entity::{Channel, ChannelKind, ChannelStatus};
use crate::model::price::{Price, Rates};

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Listen address for the HTTP server.
    pub listen_addr: String,
    /// Admin key protecting the status surface. Generated and persisted to
    /// a local env file when absent.
    pub admin_key: Option<String>,
    /// Retry budget for the dispatcher: a request makes at most
    /// `retry_times + 1` upstream attempts.
    pub retry_times: u32,
    /// Whether each failed-then-retried attempt also produces a log row.
    pub log_retry_attempts: bool,
    /// Hours to keep request logs; 0 disables log persistence entirely.
    pub log_storage_hours: i64,
    /// Hours to keep request/response detail bodies; 0 disables capture.
    pub log_detail_storage_hours: i64,
    pub log_detail_request_body_max_size: usize,
    pub log_detail_response_body_max_size: usize,
    /// Capture detail bodies for every request, not only failed ones.
    pub save_all_log_detail: bool,
    pub group_max_token_num: u32,
    /// Stepwise spend multiplier, "0=1,100=0.9" style: once a group's used
    /// amount passes a step, the step's ratio applies to new charges.
    pub group_consume_level_ratio: String,
    /// Request bodies shorter than this are token-counted precisely;
    /// longer ones use the approximate len/4 estimate.
    pub fuzzy_token_threshold: usize,
    pub ip_groups_threshold: u32,
    pub ip_groups_ban_threshold: u32,
    /// Fraction of a group's balance remaining that triggers a usage alert.
    pub usage_alert_threshold: f64,
    /// Models granted to channels created without an explicit model list.
    pub default_channel_models: Vec<String>,
    /// Default model alias mapping applied to channels without their own.
    pub default_channel_model_mapping: HashMap<String, String>,
    pub batch_flush_interval_secs: u64,
    pub drain_timeout_secs: u64,
    /// Grace period for in-flight requests on shutdown.
    pub shutdown_grace_secs: u64,
    /// File-defined channels; override DB rows and get negative ids.
    pub channels: Vec<ChannelFileEntry>,
    /// File-defined model configs; override DB rows.
    pub models: Vec<ModelFileEntry>,
    /// Data directory for the SQLite stores. Defaults to the platform data
    /// dir under `airelay/`.
    pub data_dir: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            admin_key: None,
            retry_times: 2,
            log_retry_attempts: true,
            log_storage_hours: 24 * 7,
            log_detail_storage_hours: 24,
            log_detail_request_body_max_size: 4096,
            log_detail_response_body_max_size: 4096,
            save_all_log_detail: false,
            group_max_token_num: 50,
            group_consume_level_ratio: String::new(),
            fuzzy_token_threshold: 8192,
            ip_groups_threshold: 5,
            ip_groups_ban_threshold: 10,
            usage_alert_threshold: 0.1,
            default_channel_models: Vec::new(),
            default_channel_model_mapping: HashMap::new(),
            batch_flush_interval_secs: 5,
            drain_timeout_secs: 30,
            shutdown_grace_secs: 30,
            channels: Vec::new(),
            models: Vec::new(),
            data_dir: None,
        }
    }
}

/// A channel defined in the YAML file rather than the operational store.
#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct ChannelFileEntry {
    pub name: String,
    /// Adaptor kind tag: openai / anthropic / gemini / bedrock-claude.
    pub kind: String,
    pub base_url: String,
    pub key: String,
    pub priority: i64,
    pub weight: u32,
    pub models: Vec<String>,
    pub model_mapping: HashMap<String, String>,
}

impl ChannelFileEntry {
    /// Materialize as a channel snapshot. `ordinal` is the 0-based position
    /// in the file; file channels get ids -1, -2, ... so they can never
    /// collide with persisted (positive-id) channels.
    pub fn to_channel(&self, ordinal: usize) -> Option<Channel> {
        let kind = ChannelKind::from_str(&self.kind)?;
        Some(Channel {
            id: -(ordinal as i64) - 1,
            name: self.name.clone(),
            kind,
            status: ChannelStatus::Enabled,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            key: self.key.clone(),
            priority: self.priority,
            weight: self.weight.max(1),
            models: self.models.clone(),
            model_mapping: self.model_mapping.clone(),
            plugin: serde_json::Value::Null,
        })
    }
}

/// A model config defined in the YAML file.
#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct ModelFileEntry {
    pub model: String,
    /// Capability mode: chat_completions / anthropic / gemini / responses /
    /// embeddings / image / audio / rerank.
    pub mode: String,
    pub price: Price,
    pub max_context_tokens: i64,
    pub max_output_tokens: i64,
    pub plugin: serde_json::Value,
}

// ============================================================================
// Snapshot loading
// ============================================================================

static CURRENT: Lazy<RwLock<Arc<Settings>>> =
    Lazy::new(|| RwLock::new(Arc::new(load_from_sources())));

/// Current settings snapshot. Cheap to call; holders see a consistent view.
pub fn load() -> Arc<Settings> {
    CURRENT.read().expect("settings lock poisoned").clone()
}

/// Re-read the YAML file and environment and swap the snapshot atomically.
pub fn reload() -> Arc<Settings> {
    let fresh = Arc::new(load_from_sources());
    *CURRENT.write().expect("settings lock poisoned") = fresh.clone();
    fresh
}

/// Replace the snapshot wholesale. Test hook and admin reload path.
pub fn replace(settings: Settings) {
    *CURRENT.write().expect("settings lock poisoned") = Arc::new(settings);
}

pub fn data_dir() -> PathBuf {
    if let Some(dir) = load().data_dir.as_deref() {
        let p = PathBuf::from(dir);
        fs::create_dir_all(&p).ok();
        return p;
    }
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("airelay");
    fs::create_dir_all(&p).ok();
    p
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = std::env::var("CONFIG_FILE") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("airelay");
    p.push("airelay.yaml");
    p
}

fn load_from_sources() -> Settings {
    let path = config_file_path();
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(&path).unwrap_or_default();
        serde_yaml::from_str(&raw).unwrap_or_else(|e| {
            eprintln!("failed to parse {}: {}", path.display(), e);
            Settings::default()
        })
    } else {
        Settings::default()
    };
    apply_env(&mut cfg);
    cfg
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        )
    })
}

fn apply_env(cfg: &mut Settings) {
    if let Some(v) = env_str("LISTEN_ADDR") {
        cfg.listen_addr = v;
    }
    if let Some(v) = env_str("ADMIN_KEY") {
        cfg.admin_key = Some(v);
    }
    if let Some(v) = env_parse("RETRY_TIMES") {
        cfg.retry_times = v;
    }
    if let Some(v) = env_bool("LOG_RETRY_ATTEMPTS") {
        cfg.log_retry_attempts = v;
    }
    if let Some(v) = env_parse("LOG_STORAGE_HOURS") {
        cfg.log_storage_hours = v;
    }
    if let Some(v) = env_parse("LOG_DETAIL_STORAGE_HOURS") {
        cfg.log_detail_storage_hours = v;
    }
    if let Some(v) = env_parse("LOG_DETAIL_REQUEST_BODY_MAX_SIZE") {
        cfg.log_detail_request_body_max_size = v;
    }
    if let Some(v) = env_parse("LOG_DETAIL_RESPONSE_BODY_MAX_SIZE") {
        cfg.log_detail_response_body_max_size = v;
    }
    if let Some(v) = env_bool("SAVE_ALL_LOG_DETAIL") {
        cfg.save_all_log_detail = v;
    }
    if let Some(v) = env_parse("GROUP_MAX_TOKEN_NUM") {
        cfg.group_max_token_num = v;
    }
    if let Some(v) = env_str("GROUP_CONSUME_LEVEL_RATIO") {
        cfg.group_consume_level_ratio = v;
    }
    if let Some(v) = env_parse("FUZZY_TOKEN_THRESHOLD") {
        cfg.fuzzy_token_threshold = v;
    }
    if let Some(v) = env_parse("IP_GROUPS_THRESHOLD") {
        cfg.ip_groups_threshold = v;
    }
    if let Some(v) = env_parse("IP_GROUPS_BAN_THRESHOLD") {
        cfg.ip_groups_ban_threshold = v;
    }
    if let Some(v) = env_parse("USAGE_ALERT_THRESHOLD") {
        cfg.usage_alert_threshold = v;
    }
    if let Some(v) = env_str("DEFAULT_CHANNEL_MODELS") {
        cfg.default_channel_models = v
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
    }
    if let Some(v) = env_str("DEFAULT_CHANNEL_MODEL_MAPPING") {
        cfg.default_channel_model_mapping = parse_mapping(&v);
    }
    if let Some(v) = env_parse("BATCH_FLUSH_INTERVAL_SECS") {
        cfg.batch_flush_interval_secs = v;
    }
    if let Some(v) = env_parse("DRAIN_TIMEOUT_SECS") {
        cfg.drain_timeout_secs = v;
    }
    if let Some(v) = env_parse("SHUTDOWN_GRACE_SECS") {
        cfg.shutdown_grace_secs = v;
    }
    if let Some(v) = env_str("DATA_DIR") {
        cfg.data_dir = Some(v);
    }
}

fn parse_mapping(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (from, to) = pair.split_once('=')?;
            let (from, to) = (from.trim(), to.trim());
            if from.is_empty() || to.is_empty() {
                None
            } else {
                Some((from.to_string(), to.to_string()))
            }
        })
        .collect()
}

/// Stepwise consume-level multiplier: "0=1,100=0.9,500=0.8" means charges
/// are scaled by the ratio of the highest step at or below the group's
/// spend to date.
pub fn consume_level_ratio(spec: &str, used_amount: f64) -> f64 {
    let mut steps: Vec<(f64, f64)> = spec
        .split(',')
        .filter_map(|pair| {
            let (level, ratio) = pair.split_once('=')?;
            Some((level.trim().parse().ok()?, ratio.trim().parse().ok()?))
        })
        .collect();
    if steps.is_empty() {
        return 1.0;
    }
    steps.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut ratio = 1.0;
    for (level, step_ratio) in steps {
        if used_amount >= level {
            ratio = step_ratio;
        }
    }
    ratio
}

// ============================================================================
// Admin key bootstrap
// ============================================================================

/// Ensure an admin key exists: keep the configured one, otherwise generate
/// a key and persist it to a local env file so restarts keep it stable.
pub fn ensure_admin_key() -> String {
    if let Some(key) = load().admin_key.clone() {
        return key;
    }
    let key = format!("ar-{}", uuid::Uuid::new_v4().simple());
    let mut env_path = data_dir();
    env_path.push("admin.env");
    let line = format!("ADMIN_KEY={}\n", key);
    if let Err(e) = fs::write(&env_path, line) {
        crate::logger::warn(
            "config",
            &format!("could not persist admin key to {}: {}", env_path.display(), e),
        );
    } else {
        crate::logger::info(
            "config",
            &format!("generated admin key, persisted to {}", env_path.display()),
        );
    }
    let mut cfg = (*load()).clone();
    cfg.admin_key = Some(key.clone());
    replace(cfg);
    key
}

/// Default price used when a model has no configured price at all.
pub fn zero_price() -> Price {
    Price {
        base: Rates::default(),
        conditional: Vec::new(),
    }
}
