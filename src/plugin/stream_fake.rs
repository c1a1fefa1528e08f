//! Stream-fake plugin: ask the upstream for a stream even when the client
//! wants a buffered reply. The dispatcher notices the mismatch (client
//! non-streaming, upstream streaming) and coalesces the event stream back
//! into a single response.

use crate::adaptor::ClientRequest;
use crate::relay::error::RelayResult;
use crate::relay::meta::RelayMeta;

use super::RelayPlugin;

pub const SCRATCH_KEY: &str = "stream-fake";

pub struct StreamFakePlugin;

impl RelayPlugin for StreamFakePlugin {
    fn name(&self) -> &'static str {
        "stream-fake"
    }

    fn before_convert(
        &self,
        meta: &mut RelayMeta,
        request: &mut ClientRequest,
    ) -> RelayResult<()> {
        let enabled = meta
            .model_config
            .plugin_config(self.name())
            .and_then(|c| c.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !enabled || request.is_stream() {
            return Ok(());
        }
        match request {
            ClientRequest::Canonical(req) => req.stream = true,
            ClientRequest::Raw(body) => {
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("stream".to_string(), serde_json::Value::Bool(true));
                }
            }
        }
        meta.scratch_set(SCRATCH_KEY, serde_json::json!(true));
        Ok(())
    }
}
