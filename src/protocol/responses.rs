//! OpenAI Responses API wire shape. Only the client side exists here:
//! requests parse into the canonical form and canonical results render
//! back out; there is no Responses-shaped upstream.

use serde_json::{json, Map, Value};

use crate::model::usage::Usage;

use super::{
    Completion, FinishReason, Message, MessagePart, RelayRequest, Role, SseRenderer, StreamEvent,
    ToolChoice, ToolDef,
};

// ============================================================================
// Request parsing (client mode = responses)
// ============================================================================

pub fn parse_request(body: &Value) -> Result<RelayRequest, String> {
    let obj = body.as_object().ok_or("request body must be a JSON object")?;
    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or("missing model")?
        .to_string();

    let mut request = RelayRequest {
        model,
        stream: obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        max_tokens: obj.get("max_output_tokens").and_then(|v| v.as_i64()),
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        system: obj
            .get("instructions")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        ..Default::default()
    };

    match obj.get("input") {
        Some(Value::String(text)) => request.messages.push(Message {
            role: Role::User,
            parts: vec![MessagePart::Text(text.clone())],
            reasoning: None,
        }),
        Some(Value::Array(items)) => {
            for item in items {
                // Function-call outputs arrive as standalone items.
                if item.get("type").and_then(|t| t.as_str()) == Some("function_call_output") {
                    request.messages.push(Message {
                        role: Role::Tool,
                        parts: vec![MessagePart::ToolResult {
                            call_id: item
                                .get("call_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            content: item
                                .get("output")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        }],
                        reasoning: None,
                    });
                    continue;
                }
                let role = match item.get("role").and_then(|v| v.as_str()) {
                    Some("assistant") => Role::Assistant,
                    Some("system") | Some("developer") => {
                        if let Some(text) = item_text(item) {
                            let system = request.system.get_or_insert_with(String::new);
                            if !system.is_empty() {
                                system.push('\n');
                            }
                            system.push_str(&text);
                        }
                        continue;
                    }
                    _ => Role::User,
                };
                let parts = item_parts(item);
                if !parts.is_empty() {
                    request.messages.push(Message {
                        role,
                        parts,
                        reasoning: None,
                    });
                }
            }
        }
        _ => return Err("missing input".to_string()),
    }

    if let Some(tools) = obj.get("tools").and_then(|v| v.as_array()) {
        for tool in tools {
            if tool.get("type").and_then(|t| t.as_str()) != Some("function") {
                continue;
            }
            let Some(name) = tool.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            request.tools.push(ToolDef {
                name: name.to_string(),
                description: tool
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                parameters: tool
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            });
        }
    }
    request.tool_choice = match obj.get("tool_choice") {
        Some(Value::String(s)) => match s.as_str() {
            "none" => Some(ToolChoice::None),
            "required" => Some(ToolChoice::Required),
            "auto" => Some(ToolChoice::Auto),
            _ => None,
        },
        Some(Value::Object(o)) => o
            .get("name")
            .and_then(|n| n.as_str())
            .map(|name| ToolChoice::Tool(name.to_string())),
        _ => None,
    };

    Ok(request)
}

fn item_text(item: &Value) -> Option<String> {
    match item.get("content")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => None,
    }
}

fn item_parts(item: &Value) -> Vec<MessagePart> {
    match item.get("content") {
        Some(Value::String(s)) => vec![MessagePart::Text(s.clone())],
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(|t| t.as_str()) {
                Some("input_text") | Some("output_text") | Some("text") => part
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(|t| MessagePart::Text(t.to_string())),
                Some("input_image") => part
                    .get("image_url")
                    .and_then(|u| u.as_str())
                    .map(|u| MessagePart::ImageUrl(u.to_string())),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Buffered response rendering
// ============================================================================

pub fn render_usage(usage: &Usage) -> Value {
    json!({
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens,
        "input_tokens_details": {"cached_tokens": usage.cached_tokens},
        "output_tokens_details": {"reasoning_tokens": usage.reasoning_tokens},
    })
}

pub fn render_response(completion: &Completion) -> Value {
    let response_id = response_id(&completion.id);
    let mut output = Vec::new();
    if let Some(reasoning) = &completion.reasoning {
        output.push(json!({
            "type": "reasoning",
            "id": format!("rs_{}", uuid::Uuid::new_v4().simple()),
            "summary": [{"type": "summary_text", "text": reasoning}],
        }));
    }
    output.push(json!({
        "type": "message",
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "role": "assistant",
        "status": "completed",
        "content": [{"type": "output_text", "text": completion.text, "annotations": []}],
    }));
    for call in &completion.tool_calls {
        output.push(json!({
            "type": "function_call",
            "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
            "call_id": call.id,
            "name": call.name,
            "arguments": call.arguments,
            "status": "completed",
        }));
    }
    json!({
        "id": response_id,
        "object": "response",
        "created_at": chrono::Utc::now().timestamp(),
        "status": "completed",
        "model": completion.model,
        "output": output,
        "usage": render_usage(&completion.usage),
    })
}

pub fn render_error_body(code: u16, message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": if (400..500).contains(&code) { "invalid_request_error" } else { "server_error" },
            "code": code,
        }
    })
}

fn response_id(id: &str) -> String {
    if id.starts_with("resp_") {
        id.to_string()
    } else {
        format!("resp_{}", uuid::Uuid::new_v4().simple())
    }
}

fn event_frame(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

// ============================================================================
// Client stream renderer
// ============================================================================

/// Emits Responses API SSE events from canonical events: `response.created`,
/// `response.output_text.delta`, function-call item events, and a final
/// `response.completed` carrying usage.
pub struct StreamRenderer {
    response_id: String,
    model: String,
    finished: bool,
    created: bool,
    text: String,
    sequence: u64,
}

impl StreamRenderer {
    pub fn new() -> Self {
        Self {
            response_id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: String::new(),
            finished: false,
            created: false,
            text: String::new(),
            sequence: 0,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn ensure_created(&mut self, out: &mut Vec<String>) {
        if self.created {
            return;
        }
        self.created = true;
        let sequence = self.next_sequence();
        out.push(event_frame(
            "response.created",
            &json!({
                "type": "response.created",
                "sequence_number": sequence,
                "response": {
                    "id": self.response_id,
                    "object": "response",
                    "status": "in_progress",
                    "model": self.model,
                },
            }),
        ));
    }
}

impl Default for StreamRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl SseRenderer for StreamRenderer {
    fn render(&mut self, event: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match event {
            StreamEvent::Start { model, .. } => {
                self.model = model.clone();
                self.ensure_created(&mut out);
            }
            StreamEvent::TextDelta(text) => {
                self.ensure_created(&mut out);
                self.text.push_str(text);
                let sequence = self.next_sequence();
                out.push(event_frame(
                    "response.output_text.delta",
                    &json!({
                        "type": "response.output_text.delta",
                        "sequence_number": sequence,
                        "item_id": self.response_id,
                        "output_index": 0,
                        "content_index": 0,
                        "delta": text,
                    }),
                ));
            }
            StreamEvent::ReasoningDelta(text) => {
                self.ensure_created(&mut out);
                let sequence = self.next_sequence();
                out.push(event_frame(
                    "response.reasoning_summary_text.delta",
                    &json!({
                        "type": "response.reasoning_summary_text.delta",
                        "sequence_number": sequence,
                        "output_index": 0,
                        "delta": text,
                    }),
                ));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_created(&mut out);
                let sequence = self.next_sequence();
                out.push(event_frame(
                    "response.output_item.added",
                    &json!({
                        "type": "response.output_item.added",
                        "sequence_number": sequence,
                        "output_index": index,
                        "item": {
                            "type": "function_call",
                            "call_id": id,
                            "name": name,
                            "arguments": "",
                        },
                    }),
                ));
            }
            StreamEvent::ToolCallDelta { index, arguments } => {
                let sequence = self.next_sequence();
                out.push(event_frame(
                    "response.function_call_arguments.delta",
                    &json!({
                        "type": "response.function_call_arguments.delta",
                        "sequence_number": sequence,
                        "output_index": index,
                        "delta": arguments,
                    }),
                ));
            }
            StreamEvent::Finish { usage, .. } => {
                if !self.finished {
                    self.finished = true;
                    self.ensure_created(&mut out);
                    let usage_value = usage
                        .as_ref()
                        .map(render_usage)
                        .unwrap_or(Value::Null);
                    let sequence = self.next_sequence();
                    out.push(event_frame(
                        "response.completed",
                        &json!({
                            "type": "response.completed",
                            "sequence_number": sequence,
                            "response": {
                                "id": self.response_id,
                                "object": "response",
                                "status": "completed",
                                "model": self.model,
                                "output": [{
                                    "type": "message",
                                    "role": "assistant",
                                    "status": "completed",
                                    "content": [{
                                        "type": "output_text",
                                        "text": self.text,
                                        "annotations": [],
                                    }],
                                }],
                                "usage": usage_value,
                            },
                        }),
                    ));
                }
            }
            StreamEvent::Done => {}
        }
        out
    }

    fn render_error(&mut self, code: u16, message: &str) -> Vec<String> {
        vec![event_frame(
            "error",
            &json!({
                "type": "error",
                "code": code,
                "message": message,
            }),
        )]
    }
}
