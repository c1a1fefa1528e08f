//! Model/channel cache.
//!
//! Immutable snapshot tables rebuilt from the operational store and the
//! YAML file overrides, swapped atomically so readers never observe a torn
//! state. File-defined channels carry negative ids and shadow nothing in
//! the store; file-defined model configs take precedence over DB rows.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::model::entity::{Channel, Mode, ModelConfig};
use crate::{config, logger, store};

#[derive(Default)]
pub struct CacheTables {
    /// model name -> channels supporting it, priority descending, insertion
    /// order within a priority.
    channels_by_model: HashMap<String, Vec<Arc<Channel>>>,
    channels_by_id: HashMap<i64, Arc<Channel>>,
    model_configs: HashMap<String, Arc<ModelConfig>>,
}

static TABLES: Lazy<RwLock<Arc<CacheTables>>> =
    Lazy::new(|| RwLock::new(Arc::new(CacheTables::default())));

/// Current snapshot; cheap clone of an Arc.
fn snapshot() -> Arc<CacheTables> {
    TABLES.read().expect("cache lock").clone()
}

/// Channels able to serve `model`, highest priority first.
pub fn channels_for_model(model: &str) -> Vec<Arc<Channel>> {
    snapshot()
        .channels_by_model
        .get(model)
        .cloned()
        .unwrap_or_default()
}

pub fn channel_by_id(id: i64) -> Option<Arc<Channel>> {
    snapshot().channels_by_id.get(&id).cloned()
}

/// Two-tier lookup: file override first, then DB-backed.
pub fn model_config_for(model: &str) -> Option<Arc<ModelConfig>> {
    snapshot().model_configs.get(model).cloned()
}

pub fn known_models() -> Vec<String> {
    let mut models: Vec<String> = snapshot().model_configs.keys().cloned().collect();
    models.sort();
    models
}

/// Rebuild the snapshot from store + file and swap it in.
pub fn refresh() {
    let tables = build_tables();
    *TABLES.write().expect("cache lock") = Arc::new(tables);
}

/// Replace the snapshot directly. Test hook.
pub fn install(channels: Vec<Channel>, configs: Vec<ModelConfig>) {
    let tables = assemble(channels, configs);
    *TABLES.write().expect("cache lock") = Arc::new(tables);
}

fn build_tables() -> CacheTables {
    let cfg = config::load();
    let mut channels: Vec<Channel> = Vec::new();

    match store::global().list_channels() {
        Ok(db_channels) => channels.extend(db_channels),
        Err(e) => logger::error("cache", &format!("channel refresh failed: {}", e)),
    }
    for (ordinal, entry) in cfg.channels.iter().enumerate() {
        match entry.to_channel(ordinal) {
            Some(ch) => channels.push(ch),
            None => logger::warn(
                "cache",
                &format!("file channel '{}' has unknown kind '{}'", entry.name, entry.kind),
            ),
        }
    }
    for ch in &mut channels {
        if ch.models.is_empty() {
            ch.models = cfg.default_channel_models.clone();
        }
        if ch.model_mapping.is_empty() {
            ch.model_mapping = cfg.default_channel_model_mapping.clone();
        }
    }

    let mut configs: Vec<ModelConfig> = Vec::new();
    match store::global().list_model_configs() {
        Ok(db_configs) => configs.extend(db_configs),
        Err(e) => logger::error("cache", &format!("model config refresh failed: {}", e)),
    }
    // File entries override DB rows of the same model name.
    for entry in &cfg.models {
        let Some(mode) = Mode::from_str(&entry.mode) else {
            logger::warn(
                "cache",
                &format!("file model '{}' has unknown mode '{}'", entry.model, entry.mode),
            );
            continue;
        };
        if let Err(e) = entry.price.validate() {
            logger::error(
                "cache",
                &format!("file model '{}' price rejected: {}", entry.model, e),
            );
            continue;
        }
        configs.retain(|c| c.model != entry.model);
        configs.push(ModelConfig {
            model: entry.model.clone(),
            mode,
            price: entry.price.clone(),
            max_context_tokens: entry.max_context_tokens,
            max_output_tokens: entry.max_output_tokens,
            plugin: entry.plugin.clone(),
        });
    }

    assemble(channels, configs)
}

fn assemble(channels: Vec<Channel>, configs: Vec<ModelConfig>) -> CacheTables {
    let mut tables = CacheTables::default();
    for channel in channels {
        let channel = Arc::new(channel);
        tables.channels_by_id.insert(channel.id, channel.clone());
        for model in &channel.models {
            tables
                .channels_by_model
                .entry(model.clone())
                .or_default()
                .push(channel.clone());
        }
    }
    for list in tables.channels_by_model.values_mut() {
        // Stable sort keeps insertion order within a priority.
        list.sort_by_key(|ch| std::cmp::Reverse(ch.priority));
    }
    for config in configs {
        tables.model_configs.insert(config.model.clone(), Arc::new(config));
    }
    tables
}

/// Periodic refresh task: channels and model configs every 10s. Runs until
/// the process exits.
pub fn spawn_refresh_loop() {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tick.tick().await;
            refresh();
        }
    });
    // Options (env-overridable settings) refresh faster.
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            config::reload();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{ChannelKind, ChannelStatus};
    use crate::model::price::Price;

    fn channel(id: i64, priority: i64, models: &[&str]) -> Channel {
        Channel {
            id,
            name: format!("ch-{id}"),
            kind: ChannelKind::OpenAi,
            status: ChannelStatus::Enabled,
            base_url: "https://example.com".to_string(),
            key: String::new(),
            priority,
            weight: 1,
            models: models.iter().map(|m| m.to_string()).collect(),
            model_mapping: HashMap::new(),
            plugin: serde_json::Value::Null,
        }
    }

    #[test]
    fn priority_ordering_with_stable_insertion() {
        let tables = assemble(
            vec![
                channel(1, 0, &["m"]),
                channel(2, 5, &["m"]),
                channel(3, 5, &["m"]),
                channel(4, 1, &["m"]),
            ],
            Vec::new(),
        );
        let list = tables.channels_by_model.get("m").unwrap();
        let ids: Vec<i64> = list.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 3, 4, 1]);
    }

    #[test]
    fn config_lookup() {
        let tables = assemble(
            Vec::new(),
            vec![ModelConfig {
                model: "claude-3-5".to_string(),
                mode: Mode::Anthropic,
                price: Price::default(),
                max_context_tokens: 200_000,
                max_output_tokens: 8192,
                plugin: serde_json::Value::Null,
            }],
        );
        assert!(tables.model_configs.contains_key("claude-3-5"));
        assert!(tables.model_configs.get("missing").is_none());
    }
}
