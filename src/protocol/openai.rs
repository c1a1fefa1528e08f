//! OpenAI Chat Completions wire shape: request parsing, upstream
//! rendering, and the two streaming state machines (upstream chunk
//! scanner and client chunk emitter).

use serde_json::{json, Map, Value};

use crate::model::usage::Usage;

use super::{
    Completion, CompletedToolCall, FinishReason, Message, MessagePart, RelayRequest, Role,
    SseParser, SseRenderer, StreamEvent, ThinkingOptions, ToolChoice, ToolDef,
};

// ============================================================================
// Request parsing (client mode = chat_completions)
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
        max_tokens: obj
            .get("max_tokens")
            .or_else(|| obj.get("max_completion_tokens"))
            .and_then(|v| v.as_i64()),
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        stop: parse_stop(obj.get("stop")),
        ..Default::default()
    };

    for raw in obj
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or("missing messages")?
    {
        let role = raw.get("role").and_then(|v| v.as_str()).unwrap_or("user");
        match role {
            "system" | "developer" => {
                if let Some(text) = content_as_text(raw.get("content")) {
                    let system = request.system.get_or_insert_with(String::new);
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&text);
                }
            }
            "tool" => {
                request.messages.push(Message {
                    role: Role::Tool,
                    parts: vec![MessagePart::ToolResult {
                        call_id: raw
                            .get("tool_call_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        content: content_as_text(raw.get("content")).unwrap_or_default(),
                    }],
                    reasoning: None,
                });
            }
            role => {
                let mut parts = parse_content_parts(raw.get("content"));
                if let Some(tool_calls) = raw.get("tool_calls").and_then(|v| v.as_array()) {
                    for call in tool_calls {
                        let function = call.get("function").cloned().unwrap_or(Value::Null);
                        let arguments = function
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .and_then(|raw| serde_json::from_str(raw).ok())
                            .unwrap_or(Value::Null);
                        parts.push(MessagePart::ToolCall {
                            id: call
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: function
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            arguments,
                        });
                    }
                }
                request.messages.push(Message {
                    role: if role == "assistant" {
                        Role::Assistant
                    } else {
                        Role::User
                    },
                    parts,
                    reasoning: raw
                        .get("reasoning_content")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                });
            }
        }
    }

    if let Some(tools) = obj.get("tools").and_then(|v| v.as_array()) {
        for tool in tools {
            let Some(function) = tool.get("function") else {
                continue;
            };
            let Some(name) = function.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            request.tools.push(ToolDef {
                name: name.to_string(),
                description: function
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                parameters: function
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
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| ToolChoice::Tool(name.to_string())),
        _ => None,
    };

    // Some OpenAI-compatible clients carry an Anthropic-style thinking
    // block through this shape; honor it so the scrubbing pass sees it.
    if let Some(thinking) = obj.get("thinking") {
        request.thinking = Some(ThinkingOptions {
            enabled: thinking
                .get("type")
                .and_then(|v| v.as_str())
                .map(|t| t == "enabled")
                .unwrap_or(true),
            budget_tokens: thinking.get("budget_tokens").and_then(|v| v.as_i64()),
        });
    }

    Ok(request)
}

fn parse_stop(raw: Option<&Value>) -> Vec<String> {
    match raw {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

fn content_as_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("");
            Some(text)
        }
        _ => None,
    }
}

fn parse_content_parts(content: Option<&Value>) -> Vec<MessagePart> {
    match content {
        Some(Value::String(s)) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![MessagePart::Text(s.clone())]
            }
        }
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|part| {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => part
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(|t| MessagePart::Text(t.to_string())),
                    Some("image_url") => part
                        .get("image_url")
                        .and_then(|i| i.get("url"))
                        .and_then(|u| u.as_str())
                        .map(|u| MessagePart::ImageUrl(u.to_string())),
                    _ => None,
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Request rendering (upstream kind = openai-compatible)
// ============================================================================

pub fn render_request(request: &RelayRequest, model: &str) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in &request.messages {
        match message.role {
            Role::Tool => {
                for part in &message.parts {
                    if let MessagePart::ToolResult { call_id, content } = part {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": call_id,
                            "content": content,
                        }));
                    }
                }
            }
            role => {
                let role_str = match role {
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                let mut entry = Map::new();
                entry.insert("role".to_string(), json!(role_str));
                let mut content_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for part in &message.parts {
                    match part {
                        MessagePart::Text(text) => {
                            content_parts.push(json!({"type": "text", "text": text}))
                        }
                        MessagePart::ImageUrl(url) => content_parts
                            .push(json!({"type": "image_url", "image_url": {"url": url}})),
                        MessagePart::ToolCall { id, name, arguments } => tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": arguments.to_string(),
                            },
                        })),
                        MessagePart::ToolResult { .. } => {}
                    }
                }
                // Collapse a lone text part to the plain-string form.
                if content_parts.len() == 1 && content_parts[0].get("type") == Some(&json!("text"))
                {
                    let text = content_parts[0]["text"].clone();
                    entry.insert("content".to_string(), text);
                } else if content_parts.is_empty() {
                    entry.insert("content".to_string(), Value::Null);
                } else {
                    entry.insert("content".to_string(), Value::Array(content_parts));
                }
                if !tool_calls.is_empty() {
                    entry.insert("tool_calls".to_string(), Value::Array(tool_calls));
                }
                messages.push(Value::Object(entry));
            }
        }
    }

    let mut body = Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert("messages".to_string(), Value::Array(messages));
    if request.stream {
        body.insert("stream".to_string(), json!(true));
        body.insert("stream_options".to_string(), json!({"include_usage": true}));
    }
    if let Some(max_tokens) = request.max_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if !request.stop.is_empty() {
        body.insert("stop".to_string(), json!(request.stop));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = &request.tool_choice {
        let value = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Tool(name) => {
                json!({"type": "function", "function": {"name": name}})
            }
        };
        body.insert("tool_choice".to_string(), value);
    }
    Value::Object(body)
}

// ============================================================================
// Usage and buffered responses
// ============================================================================

pub fn parse_usage(raw: &Value) -> Usage {
    let mut usage = Usage::default();
    usage.input_tokens = raw.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    usage.output_tokens = raw
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.total_tokens = raw
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(usage.input_tokens + usage.output_tokens);
    usage.cached_tokens = raw
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.reasoning_tokens = raw
        .get("completion_tokens_details")
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage
}

pub fn render_usage(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens,
        "prompt_tokens_details": {"cached_tokens": usage.cached_tokens},
        "completion_tokens_details": {"reasoning_tokens": usage.reasoning_tokens},
    })
}

pub fn parse_response(body: &Value) -> Completion {
    let mut completion = Completion {
        id: body
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        usage: body.get("usage").map(parse_usage).unwrap_or_default(),
        ..Default::default()
    };
    let Some(choice) = body
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|c| c.first())
    else {
        return completion;
    };
    completion.finish = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(FinishReason::from_openai)
        .unwrap_or(FinishReason::Stop);
    if let Some(message) = choice.get("message") {
        if let Some(text) = message.get("content").and_then(|v| v.as_str()) {
            completion.text = text.to_string();
        }
        if let Some(reasoning) = message.get("reasoning_content").and_then(|v| v.as_str()) {
            if !reasoning.is_empty() {
                completion.reasoning = Some(reasoning.to_string());
            }
        }
        if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
            for call in calls {
                let function = call.get("function").cloned().unwrap_or(Value::Null);
                completion.tool_calls.push(CompletedToolCall {
                    id: call
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    name: function
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: function
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
    }
    completion
}

pub fn render_response(completion: &Completion) -> Value {
    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert("content".to_string(), json!(completion.text));
    if let Some(reasoning) = &completion.reasoning {
        message.insert("reasoning_content".to_string(), json!(reasoning));
    }
    if !completion.tool_calls.is_empty() {
        let calls: Vec<Value> = completion
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments},
                })
            })
            .collect();
        message.insert("tool_calls".to_string(), Value::Array(calls));
    }
    json!({
        "id": ensure_id(&completion.id, "chatcmpl"),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": completion.model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": completion.finish.openai_str(),
        }],
        "usage": render_usage(&completion.usage),
    })
}

pub fn render_error_body(code: u16, message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": error_type_for(code),
            "code": code,
        }
    })
}

fn error_type_for(code: u16) -> &'static str {
    match code {
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "api_error",
    }
}

fn ensure_id(id: &str, prefix: &str) -> String {
    if id.is_empty() {
        format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
    } else {
        id.to_string()
    }
}

fn frame(value: &Value) -> String {
    format!("data: {}\n\n", value)
}

// ============================================================================
// Upstream stream scanner
// ============================================================================

/// Scans OpenAI-compatible `chat.completion.chunk` SSE payloads into
/// canonical events.
#[derive(Default)]
pub struct StreamParser {
    started: bool,
    finished: bool,
    done: bool,
    pending_finish: Option<FinishReason>,
    usage: Option<Usage>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit_finish(&mut self, out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        if let Some(reason) = self.pending_finish.take() {
            self.finished = true;
            out.push(StreamEvent::Finish {
                reason,
                usage: self.usage.take(),
            });
        }
    }
}

impl SseParser for StreamParser {
    fn feed(&mut self, data: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if data.trim() == "[DONE]" {
            self.emit_finish(&mut out);
            if !self.done {
                self.done = true;
                out.push(StreamEvent::Done);
            }
            return out;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return out;
        };

        if let Some(usage_raw) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(parse_usage(usage_raw));
        }
        if !self.started {
            self.started = true;
            out.push(StreamEvent::Start {
                id: chunk
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                model: chunk
                    .get("model")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                input_tokens: self.usage.map(|u| u.input_tokens).unwrap_or(0),
            });
        }
        let Some(choice) = chunk
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|c| c.first())
        else {
            // Bare usage chunk after the final choice; fold into Finish.
            self.emit_finish(&mut out);
            return out;
        };
        if let Some(delta) = choice.get("delta") {
            if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                if !reasoning.is_empty() {
                    out.push(StreamEvent::ReasoningDelta(reasoning.to_string()));
                }
            }
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                if !content.is_empty() {
                    out.push(StreamEvent::TextDelta(content.to_string()));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls {
                    let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let function = call.get("function").cloned().unwrap_or(Value::Null);
                    if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                        out.push(StreamEvent::ToolCallStart {
                            index,
                            id: call
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: name.to_string(),
                        });
                    }
                    if let Some(arguments) = function.get("arguments").and_then(|v| v.as_str()) {
                        if !arguments.is_empty() {
                            out.push(StreamEvent::ToolCallDelta {
                                index,
                                arguments: arguments.to_string(),
                            });
                        }
                    }
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.pending_finish = Some(FinishReason::from_openai(reason));
            // Hold the Finish until usage arrives (stream_options) or the
            // stream terminates; emit now if usage is already known.
            if self.usage.is_some() {
                self.emit_finish(&mut out);
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.pending_finish.is_none() && !self.finished {
            self.pending_finish = Some(FinishReason::Stop);
        }
        self.emit_finish(&mut out);
        if !self.done {
            self.done = true;
            out.push(StreamEvent::Done);
        }
        out
    }
}

// ============================================================================
// Client stream renderer
// ============================================================================

/// Emits OpenAI `chat.completion.chunk` frames from canonical events.
///
/// Upstream tool-call indices are content-block positions across all block
/// types; the chunk wire format wants a dense 0-based index over tool
/// calls only, so indices are remapped in first-seen order.
pub struct StreamRenderer {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    finished: bool,
    index_map: Vec<usize>,
}

impl StreamRenderer {
    pub fn new() -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: String::new(),
            created: chrono::Utc::now().timestamp(),
            sent_role: false,
            finished: false,
            index_map: Vec::new(),
        }
    }

    fn dense_index(&mut self, upstream: usize) -> usize {
        if let Some(pos) = self.index_map.iter().position(|i| *i == upstream) {
            return pos;
        }
        self.index_map.push(upstream);
        self.index_map.len() - 1
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> Value {
        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = usage;
        }
        chunk
    }

    fn role_preamble(&mut self, out: &mut Vec<String>) {
        if !self.sent_role {
            self.sent_role = true;
            out.push(frame(&self.chunk(
                json!({"role": "assistant", "content": ""}),
                None,
                None,
            )));
        }
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
            StreamEvent::Start { id, model, .. } => {
                if !id.is_empty() {
                    self.id = ensure_id(id, "chatcmpl");
                }
                self.model = model.clone();
                self.role_preamble(&mut out);
            }
            StreamEvent::TextDelta(text) => {
                self.role_preamble(&mut out);
                out.push(frame(&self.chunk(json!({"content": text}), None, None)));
            }
            StreamEvent::ReasoningDelta(text) => {
                self.role_preamble(&mut out);
                out.push(frame(&self.chunk(
                    json!({"reasoning_content": text}),
                    None,
                    None,
                )));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.role_preamble(&mut out);
                let dense = self.dense_index(*index);
                out.push(frame(&self.chunk(
                    json!({"tool_calls": [{
                        "index": dense,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""},
                    }]}),
                    None,
                    None,
                )));
            }
            StreamEvent::ToolCallDelta { index, arguments } => {
                let dense = self.dense_index(*index);
                out.push(frame(&self.chunk(
                    json!({"tool_calls": [{
                        "index": dense,
                        "function": {"arguments": arguments},
                    }]}),
                    None,
                    None,
                )));
            }
            StreamEvent::Finish { reason, usage } => {
                if !self.finished {
                    self.finished = true;
                    out.push(frame(&self.chunk(
                        json!({}),
                        Some(reason.openai_str()),
                        usage.as_ref().map(render_usage),
                    )));
                }
            }
            StreamEvent::Done => {
                out.push("data: [DONE]\n\n".to_string());
            }
        }
        out
    }

    fn render_error(&mut self, code: u16, message: &str) -> Vec<String> {
        vec![
            frame(&render_error_body(code, message)),
            "data: [DONE]\n\n".to_string(),
        ]
    }
}
