//! Plugin chain: around-advice on request conversion and response
//! handling. Composition order is fixed (outermost first): think,
//! stream-fake, patch. Per-plugin configuration lives in the model
//! config's `plugin` blob, keyed by plugin name.

pub mod patch;
pub mod stream_fake;
pub mod think;

use serde_json::Value;

use crate::adaptor::ClientRequest;
use crate::protocol::Completion;
use crate::relay::error::RelayResult;
use crate::relay::meta::RelayMeta;

pub trait RelayPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Advice before the adaptor converts the client request. May rewrite
    /// the request and stash state in the meta scratchpad. Must not hold
    /// references past the call.
    fn before_convert(
        &self,
        _meta: &mut RelayMeta,
        _request: &mut ClientRequest,
    ) -> RelayResult<()> {
        Ok(())
    }

    /// Advice on the final upstream body just before dispatch.
    fn after_convert(&self, _meta: &RelayMeta, _body: &mut Value) -> RelayResult<()> {
        Ok(())
    }

    /// Advice on a buffered (or coalesced) completion before it renders
    /// back to the client.
    fn on_completion(&self, _meta: &RelayMeta, _completion: &mut Completion) {}
}

static THINK: think::ThinkPlugin = think::ThinkPlugin;
static STREAM_FAKE: stream_fake::StreamFakePlugin = stream_fake::StreamFakePlugin;
static PATCH: patch::PatchPlugin = patch::PatchPlugin;

/// The fixed composition, outermost first.
pub fn chain() -> [&'static dyn RelayPlugin; 3] {
    [&THINK, &STREAM_FAKE, &PATCH]
}

pub fn apply_before_convert(
    meta: &mut RelayMeta,
    request: &mut ClientRequest,
) -> RelayResult<()> {
    for plugin in chain() {
        plugin.before_convert(meta, request)?;
    }
    Ok(())
}

pub fn apply_after_convert(meta: &RelayMeta, body: &mut Value) -> RelayResult<()> {
    for plugin in chain() {
        plugin.after_convert(meta, body)?;
    }
    Ok(())
}

/// Inner-to-outer on the way back.
pub fn apply_on_completion(meta: &RelayMeta, completion: &mut Completion) {
    for plugin in chain().iter().rev() {
        plugin.on_completion(meta, completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_order_is_fixed() {
        let names: Vec<&str> = chain().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["think", "stream-fake", "patch"]);
    }
}
