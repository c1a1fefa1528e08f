//! Patch plugin: an ordered list of explicit mutations applied to the
//! final outgoing body just before dispatch. Paths are dot-separated
//! object keys; missing intermediates are created on `set`.

use serde_json::{Map, Value};

use crate::relay::error::RelayResult;
use crate::relay::meta::RelayMeta;

use super::RelayPlugin;

pub struct PatchPlugin;

impl RelayPlugin for PatchPlugin {
    fn name(&self) -> &'static str {
        "patch"
    }

    fn after_convert(&self, meta: &RelayMeta, body: &mut Value) -> RelayResult<()> {
        let Some(ops) = meta
            .model_config
            .plugin_config(self.name())
            .and_then(|c| c.as_array())
            .cloned()
        else {
            return Ok(());
        };
        for op in &ops {
            apply_op(body, op);
        }
        Ok(())
    }
}

fn apply_op(body: &mut Value, op: &Value) {
    let Some(path) = op.get("path").and_then(|v| v.as_str()) else {
        return;
    };
    match op.get("op").and_then(|v| v.as_str()) {
        Some("set") => {
            if let Some(value) = op.get("value") {
                set_path(body, path, value.clone());
            }
        }
        Some("remove") => {
            remove_path(body, path);
        }
        _ => {}
    }
}

fn set_path(body: &mut Value, path: &str, value: Value) {
    let mut current = body;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let obj = current.as_object_mut().expect("object ensured above");
        if i == segments.len() - 1 {
            obj.insert(segment.to_string(), value);
            return;
        }
        current = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn remove_path(body: &mut Value, path: &str) {
    let Some((parents, leaf)) = path.rsplit_once('.') else {
        if let Some(obj) = body.as_object_mut() {
            obj.remove(path);
        }
        return;
    };
    let mut current = body;
    for segment in parents.split('.') {
        let Some(next) = current.get_mut(segment) else {
            return;
        };
        current = next;
    }
    if let Some(obj) = current.as_object_mut() {
        obj.remove(leaf);
    }
}
