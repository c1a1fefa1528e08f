//! Think plugin: force reasoning on for models configured with it.

use crate::adaptor::ClientRequest;
use crate::protocol::ThinkingOptions;
use crate::relay::error::RelayResult;
use crate::relay::meta::RelayMeta;

use super::RelayPlugin;

pub struct ThinkPlugin;

impl RelayPlugin for ThinkPlugin {
    fn name(&self) -> &'static str {
        "think"
    }

    fn before_convert(
        &self,
        meta: &mut RelayMeta,
        request: &mut ClientRequest,
    ) -> RelayResult<()> {
        let Some(config) = meta.model_config.plugin_config(self.name()).cloned() else {
            return Ok(());
        };
        if !config.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Ok(());
        }
        let ClientRequest::Canonical(req) = request else {
            return Ok(());
        };
        // Client-specified thinking wins; the plugin only fills a default.
        if req.thinking.is_none() {
            req.thinking = Some(ThinkingOptions {
                enabled: true,
                budget_tokens: config.get("budget_tokens").and_then(|v| v.as_i64()),
            });
            meta.scratch_set("think", serde_json::json!(true));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{ChannelKind, Mode};
    use crate::protocol::RelayRequest;

    #[test]
    fn enables_thinking_from_model_config() {
        let mut meta = crate::relay::admission::test_support::meta_for(
            Mode::ChatCompletions,
            ChannelKind::Anthropic,
            "https://api.anthropic.com",
        );
        let mut config = (*meta.model_config).clone();
        config.plugin = serde_json::json!({"think": {"enabled": true, "budget_tokens": 2048}});
        meta.model_config = std::sync::Arc::new(config);

        let mut request = ClientRequest::Canonical(RelayRequest::default());
        ThinkPlugin.before_convert(&mut meta, &mut request).unwrap();
        let ClientRequest::Canonical(req) = &request else {
            panic!("canonical expected");
        };
        assert_eq!(
            req.thinking,
            Some(ThinkingOptions {
                enabled: true,
                budget_tokens: Some(2048),
            })
        );
    }

    #[test]
    fn noop_without_config() {
        let mut meta = crate::relay::admission::test_support::meta_for(
            Mode::ChatCompletions,
            ChannelKind::Anthropic,
            "https://api.anthropic.com",
        );
        let mut request = ClientRequest::Canonical(RelayRequest::default());
        ThinkPlugin.before_convert(&mut meta, &mut request).unwrap();
        let ClientRequest::Canonical(req) = &request else {
            panic!("canonical expected");
        };
        assert!(req.thinking.is_none());
    }
}
