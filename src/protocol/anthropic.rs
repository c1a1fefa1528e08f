//! Anthropic Messages wire shape: request parsing, upstream rendering,
//! and the streaming state machines for the
//! `message_start → content_block_* → message_delta → message_stop`
//! event grammar.

use serde_json::{json, Map, Value};

use crate::model::usage::Usage;

use super::{
    Completion, CompletedToolCall, FinishReason, Message, MessagePart, RelayRequest, Role,
    SseParser, SseRenderer, StreamEvent, ThinkingOptions, ToolChoice, ToolDef,
};

pub const DEFAULT_MAX_TOKENS: i64 = 4096;

// ============================================================================
// Request parsing (client mode = anthropic)
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
        max_tokens: obj.get("max_tokens").and_then(|v| v.as_i64()),
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        stop: obj
            .get("stop_sequences")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default(),
        system: parse_system(obj.get("system")),
        ..Default::default()
    };

    for raw in obj
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or("missing messages")?
    {
        let role = match raw.get("role").and_then(|v| v.as_str()) {
            Some("assistant") => Role::Assistant,
            _ => Role::User,
        };
        let mut parts = Vec::new();
        let mut reasoning: Option<String> = None;
        match raw.get("content") {
            Some(Value::String(text)) => parts.push(MessagePart::Text(text.clone())),
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                parts.push(MessagePart::Text(text.to_string()));
                            }
                        }
                        Some("thinking") => {
                            if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                                reasoning
                                    .get_or_insert_with(String::new)
                                    .push_str(text);
                            }
                        }
                        Some("image") => {
                            if let Some(url) = image_source_to_url(block.get("source")) {
                                parts.push(MessagePart::ImageUrl(url));
                            }
                        }
                        Some("tool_use") => parts.push(MessagePart::ToolCall {
                            id: block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            arguments: block.get("input").cloned().unwrap_or(Value::Null),
                        }),
                        Some("tool_result") => parts.push(MessagePart::ToolResult {
                            call_id: block
                                .get("tool_use_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            content: tool_result_text(block.get("content")),
                        }),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        request.messages.push(Message {
            role,
            parts,
            reasoning,
        });
    }

    if let Some(tools) = obj.get("tools").and_then(|v| v.as_array()) {
        for tool in tools {
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
                    .get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            });
        }
    }

    request.tool_choice = obj.get("tool_choice").and_then(|choice| {
        match choice.get("type").and_then(|t| t.as_str())? {
            "auto" => Some(ToolChoice::Auto),
            "any" => Some(ToolChoice::Required),
            "none" => Some(ToolChoice::None),
            "tool" => choice
                .get("name")
                .and_then(|n| n.as_str())
                .map(|name| ToolChoice::Tool(name.to_string())),
            _ => None,
        }
    });

    if let Some(thinking) = obj.get("thinking") {
        let enabled = thinking
            .get("type")
            .and_then(|v| v.as_str())
            .map(|t| t == "enabled")
            .unwrap_or(false);
        request.thinking = Some(ThinkingOptions {
            enabled,
            budget_tokens: thinking.get("budget_tokens").and_then(|v| v.as_i64()),
        });
    }

    Ok(request)
}

fn parse_system(raw: Option<&Value>) -> Option<String> {
    match raw? {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        _ => None,
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn image_source_to_url(source: Option<&Value>) -> Option<String> {
    let source = source?;
    match source.get("type").and_then(|t| t.as_str())? {
        "base64" => {
            let media_type = source.get("media_type").and_then(|v| v.as_str())?;
            let data = source.get("data").and_then(|v| v.as_str())?;
            Some(format!("data:{};base64,{}", media_type, data))
        }
        "url" => source
            .get("url")
            .and_then(|v| v.as_str())
            .map(|u| u.to_string()),
        _ => None,
    }
}

// ============================================================================
// Request rendering (upstream kind = anthropic / bedrock-claude)
// ============================================================================

pub fn render_request(request: &RelayRequest, model: &str) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert(
        "max_tokens".to_string(),
        json!(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if request.stream {
        body.insert("stream".to_string(), json!(true));
    }
    if let Some(system) = &request.system {
        body.insert("system".to_string(), json!(system));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if !request.stop.is_empty() {
        body.insert("stop_sequences".to_string(), json!(request.stop));
    }

    let mut messages = Vec::new();
    for message in &request.messages {
        let (role, blocks) = match message.role {
            Role::Assistant => ("assistant", assistant_blocks(message)),
            Role::Tool => ("user", tool_result_blocks(message)),
            _ => ("user", user_blocks(message)),
        };
        if blocks.is_empty() {
            continue;
        }
        messages.push(json!({"role": role, "content": blocks}));
    }
    body.insert("messages".to_string(), Value::Array(messages));

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = &request.tool_choice {
        let value = match choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Required => json!({"type": "any"}),
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
        };
        body.insert("tool_choice".to_string(), value);
    }
    if let Some(thinking) = request.thinking {
        if thinking.enabled {
            body.insert(
                "thinking".to_string(),
                json!({
                    "type": "enabled",
                    "budget_tokens": thinking.budget_tokens.unwrap_or(1024),
                }),
            );
        }
    }
    Value::Object(body)
}

fn user_blocks(message: &Message) -> Vec<Value> {
    let mut blocks = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text(text) => blocks.push(json!({"type": "text", "text": text})),
            MessagePart::ImageUrl(url) => {
                if let Some(block) = image_block(url) {
                    blocks.push(block);
                }
            }
            MessagePart::ToolResult { call_id, content } => blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": content,
            })),
            MessagePart::ToolCall { .. } => {}
        }
    }
    blocks
}

fn assistant_blocks(message: &Message) -> Vec<Value> {
    let mut blocks = Vec::new();
    if let Some(reasoning) = &message.reasoning {
        blocks.push(json!({"type": "thinking", "thinking": reasoning}));
    }
    for part in &message.parts {
        match part {
            MessagePart::Text(text) => blocks.push(json!({"type": "text", "text": text})),
            MessagePart::ToolCall { id, name, arguments } => blocks.push(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": arguments,
            })),
            _ => {}
        }
    }
    blocks
}

fn tool_result_blocks(message: &Message) -> Vec<Value> {
    message
        .parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::ToolResult { call_id, content } => Some(json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": content,
            })),
            _ => None,
        })
        .collect()
}

/// data: URLs become inline base64 sources; remote URLs pass through as
/// url sources (the adaptor resolves them to data URLs first when the
/// upstream cannot fetch).
fn image_block(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (media_type, data) = rest.split_once(";base64,")?;
        return Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }));
    }
    Some(json!({
        "type": "image",
        "source": {"type": "url", "url": url},
    }))
}

// ============================================================================
// Usage and buffered responses
// ============================================================================

pub fn parse_usage(raw: &Value) -> Usage {
    let mut usage = Usage::default();
    usage.input_tokens = raw.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    usage.output_tokens = raw
        .get("output_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.cached_tokens = raw
        .get("cache_read_input_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.cache_creation_tokens = raw
        .get("cache_creation_input_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.web_search_count = raw
        .get("server_tool_use")
        .and_then(|t| t.get("web_search_requests"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.total_tokens = usage.input_tokens + usage.output_tokens;
    usage
}

pub fn render_usage(usage: &Usage) -> Value {
    json!({
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
        "cache_read_input_tokens": usage.cached_tokens,
        "cache_creation_input_tokens": usage.cache_creation_tokens,
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
        finish: body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(FinishReason::from_anthropic)
            .unwrap_or(FinishReason::Stop),
        ..Default::default()
    };
    if let Some(blocks) = body.get("content").and_then(|v| v.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        completion.text.push_str(text);
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                        completion
                            .reasoning
                            .get_or_insert_with(String::new)
                            .push_str(text);
                    }
                }
                Some("tool_use") => completion.tool_calls.push(CompletedToolCall {
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: block
                        .get("input")
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                }),
                _ => {}
            }
        }
    }
    completion
}

pub fn render_response(completion: &Completion) -> Value {
    let mut content = Vec::new();
    if let Some(reasoning) = &completion.reasoning {
        content.push(json!({"type": "thinking", "thinking": reasoning}));
    }
    if !completion.text.is_empty() || completion.tool_calls.is_empty() {
        content.push(json!({"type": "text", "text": completion.text}));
    }
    for call in &completion.tool_calls {
        let input: Value =
            serde_json::from_str(&call.arguments).unwrap_or(Value::Object(Map::new()));
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": input,
        }));
    }
    json!({
        "id": ensure_msg_id(&completion.id),
        "type": "message",
        "role": "assistant",
        "model": completion.model,
        "content": content,
        "stop_reason": completion.finish.anthropic_str(),
        "stop_sequence": null,
        "usage": render_usage(&completion.usage),
    })
}

pub fn render_error_body(code: u16, message: &str) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": error_type_for(code),
            "message": message,
        }
    })
}

fn error_type_for(code: u16) -> &'static str {
    match code {
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        413 => "request_too_large",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

fn ensure_msg_id(id: &str) -> String {
    if id.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else if id.starts_with("msg_") {
        id.to_string()
    } else {
        format!("msg_{}", id)
    }
}

fn event_frame(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

// ============================================================================
// Upstream stream scanner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Scans Anthropic SSE payloads into canonical events. Content-block
/// indices pass through unchanged; they are the upstream index space the
/// client renderers densify.
#[derive(Default)]
pub struct StreamParser {
    blocks: Vec<(usize, BlockKind)>,
    input_tokens: i64,
    finished: bool,
    done: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn block_kind(&self, index: usize) -> Option<BlockKind> {
        self.blocks
            .iter()
            .rev()
            .find(|(i, _)| *i == index)
            .map(|(_, kind)| *kind)
    }
}

impl SseParser for StreamParser {
    fn feed(&mut self, data: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return out;
        };
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                let message = event.get("message").cloned().unwrap_or(Value::Null);
                let usage = message.get("usage").map(parse_usage).unwrap_or_default();
                self.input_tokens =
                    usage.input_tokens + usage.cached_tokens + usage.cache_creation_tokens;
                out.push(StreamEvent::Start {
                    id: message
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    model: message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input_tokens: self.input_tokens,
                });
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let block = event.get("content_block").cloned().unwrap_or(Value::Null);
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("tool_use") => {
                        self.blocks.push((index, BlockKind::ToolUse));
                        out.push(StreamEvent::ToolCallStart {
                            index,
                            id: block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        });
                    }
                    Some("thinking") => self.blocks.push((index, BlockKind::Thinking)),
                    _ => self.blocks.push((index, BlockKind::Text)),
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let delta = event.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                            out.push(StreamEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta.get("thinking").and_then(|t| t.as_str()) {
                            out.push(StreamEvent::ReasoningDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(|t| t.as_str()) {
                            if self.block_kind(index) == Some(BlockKind::ToolUse) {
                                out.push(StreamEvent::ToolCallDelta {
                                    index,
                                    arguments: partial.to_string(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {}
            Some("message_delta") => {
                if !self.finished {
                    self.finished = true;
                    let reason = event
                        .get("delta")
                        .and_then(|d| d.get("stop_reason"))
                        .and_then(|v| v.as_str())
                        .map(FinishReason::from_anthropic)
                        .unwrap_or(FinishReason::Stop);
                    let mut usage = event.get("usage").map(parse_usage).unwrap_or_default();
                    usage.input_tokens = self.input_tokens;
                    usage.total_tokens = usage.input_tokens + usage.output_tokens;
                    out.push(StreamEvent::Finish {
                        reason,
                        usage: Some(usage),
                    });
                }
            }
            Some("message_stop") => {
                if !self.done {
                    self.done = true;
                    out.push(StreamEvent::Done);
                }
            }
            Some("error") => {
                // Upstream fault mid-stream: end the canonical stream; the
                // relay layer surfaces the protocol-shaped error frame.
                if !self.finished {
                    self.finished = true;
                    out.push(StreamEvent::Finish {
                        reason: FinishReason::Error,
                        usage: None,
                    });
                }
                if !self.done {
                    self.done = true;
                    out.push(StreamEvent::Done);
                }
            }
            _ => {}
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if !self.finished {
            self.finished = true;
            out.push(StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: None,
            });
        }
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Text(usize),
    Thinking(usize),
    Tool(usize),
}

/// Emits Anthropic SSE events from canonical events, assigning downstream
/// content-block indices in event order and closing blocks as the content
/// kind switches.
pub struct StreamRenderer {
    model: String,
    started: bool,
    finished: bool,
    next_index: usize,
    open: OpenBlock,
    /// upstream tool index -> downstream block index
    tool_blocks: Vec<(usize, usize)>,
    input_tokens: i64,
}

impl StreamRenderer {
    pub fn new() -> Self {
        Self {
            model: String::new(),
            started: false,
            finished: false,
            next_index: 0,
            open: OpenBlock::None,
            tool_blocks: Vec::new(),
            input_tokens: 0,
        }
    }

    fn close_open(&mut self, out: &mut Vec<String>) {
        let index = match self.open {
            OpenBlock::None => return,
            OpenBlock::Text(i) | OpenBlock::Thinking(i) | OpenBlock::Tool(i) => i,
        };
        out.push(event_frame(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": index}),
        ));
        self.open = OpenBlock::None;
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(event_frame(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0},
                },
            }),
        ));
    }

    fn open_block(&mut self, kind: BlockKind, out: &mut Vec<String>) -> usize {
        let wanted = match (kind, self.open) {
            (BlockKind::Text, OpenBlock::Text(i)) => return i,
            (BlockKind::Thinking, OpenBlock::Thinking(i)) => return i,
            _ => {
                self.close_open(out);
                let index = self.next_index;
                self.next_index += 1;
                index
            }
        };
        let (open, block) = match kind {
            BlockKind::Text => (
                OpenBlock::Text(wanted),
                json!({"type": "text", "text": ""}),
            ),
            BlockKind::Thinking => (
                OpenBlock::Thinking(wanted),
                json!({"type": "thinking", "thinking": ""}),
            ),
            BlockKind::ToolUse => (OpenBlock::Tool(wanted), Value::Null),
        };
        if kind != BlockKind::ToolUse {
            out.push(event_frame(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": wanted,
                    "content_block": block,
                }),
            ));
            self.open = open;
        }
        wanted
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
            StreamEvent::Start {
                model,
                input_tokens,
                ..
            } => {
                self.model = model.clone();
                self.input_tokens = *input_tokens;
                self.ensure_started(&mut out);
            }
            StreamEvent::TextDelta(text) => {
                self.ensure_started(&mut out);
                let index = self.open_block(BlockKind::Text, &mut out);
                out.push(event_frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
            StreamEvent::ReasoningDelta(text) => {
                self.ensure_started(&mut out);
                let index = self.open_block(BlockKind::Thinking, &mut out);
                out.push(event_frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "thinking_delta", "thinking": text},
                    }),
                ));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_started(&mut out);
                self.close_open(&mut out);
                let block_index = self.next_index;
                self.next_index += 1;
                self.tool_blocks.push((*index, block_index));
                self.open = OpenBlock::Tool(block_index);
                out.push(event_frame(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": {},
                        },
                    }),
                ));
            }
            StreamEvent::ToolCallDelta { index, arguments } => {
                if let Some((_, block_index)) =
                    self.tool_blocks.iter().rev().find(|(u, _)| u == index)
                {
                    out.push(event_frame(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": block_index,
                            "delta": {"type": "input_json_delta", "partial_json": arguments},
                        }),
                    ));
                }
            }
            StreamEvent::Finish { reason, usage } => {
                if !self.finished {
                    self.finished = true;
                    self.ensure_started(&mut out);
                    self.close_open(&mut out);
                    let output_tokens = usage.as_ref().map(|u| u.output_tokens).unwrap_or(0);
                    out.push(event_frame(
                        "message_delta",
                        &json!({
                            "type": "message_delta",
                            "delta": {
                                "stop_reason": reason.anthropic_str(),
                                "stop_sequence": null,
                            },
                            "usage": {"output_tokens": output_tokens},
                        }),
                    ));
                }
            }
            StreamEvent::Done => {
                out.push(event_frame("message_stop", &json!({"type": "message_stop"})));
            }
        }
        out
    }

    fn render_error(&mut self, code: u16, message: &str) -> Vec<String> {
        vec![event_frame("error", &render_error_body(code, message))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_system_and_thinking() {
        let body = json!({
            "model": "claude-3-5",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "be kind"}],
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [{"role": "user", "content": "hi"}],
        });
        let req = parse_request(&body).unwrap();
        assert_eq!(req.system.as_deref(), Some("be kind"));
        assert_eq!(
            req.thinking,
            Some(ThinkingOptions {
                enabled: true,
                budget_tokens: Some(2048),
            })
        );
        assert_eq!(req.max_tokens, Some(1024));
    }

    #[test]
    fn parse_request_tool_blocks() {
        let body = json!({
            "model": "claude-3-5",
            "max_tokens": 100,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "let me check"},
                    {"type": "tool_use", "id": "tc_1", "name": "lookup", "input": {"q": "x"}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tc_1", "content": "found"},
                ]},
            ],
        });
        let req = parse_request(&body).unwrap();
        assert_eq!(req.messages.len(), 2);
        assert!(matches!(
            req.messages[0].parts[1],
            MessagePart::ToolCall { .. }
        ));
        assert!(matches!(
            req.messages[1].parts[0],
            MessagePart::ToolResult { .. }
        ));
    }

    #[test]
    fn render_request_defaults_max_tokens() {
        let req = RelayRequest {
            model: "claude-3-5".to_string(),
            messages: vec![Message {
                role: Role::User,
                parts: vec![MessagePart::Text("ping".to_string())],
                reasoning: None,
            }],
            ..Default::default()
        };
        let body = render_request(&req, "claude-3-5-sonnet");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["model"], "claude-3-5-sonnet");
        assert_eq!(body["messages"][0]["content"][0]["text"], "ping");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn data_url_becomes_base64_source() {
        let block = image_block("data:image/png;base64,QUJD").unwrap();
        assert_eq!(block["source"]["type"], "base64");
        assert_eq!(block["source"]["media_type"], "image/png");
        assert_eq!(block["source"]["data"], "QUJD");
    }

    #[test]
    fn stream_parser_full_message() {
        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        events.extend(parser.feed(
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-3-5","usage":{"input_tokens":10,"output_tokens":0}}}"#,
        ));
        events.extend(parser.feed(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        ));
        events.extend(parser.feed(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hello"}}"#,
        ));
        events.extend(parser.feed(r#"{"type":"content_block_stop","index":0}"#));
        events.extend(parser.feed(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
        ));
        events.extend(parser.feed(r#"{"type":"message_stop"}"#));
        assert_eq!(
            events[0],
            StreamEvent::Start {
                id: "msg_1".to_string(),
                model: "claude-3-5".to_string(),
                input_tokens: 10,
            }
        );
        assert_eq!(events[1], StreamEvent::TextDelta("hello".to_string()));
        match &events[2] {
            StreamEvent::Finish { reason, usage } => {
                assert_eq!(*reason, FinishReason::Stop);
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 5);
                assert_eq!(usage.total_tokens, 15);
            }
            other => panic!("expected finish, got {:?}", other),
        }
        assert_eq!(events[3], StreamEvent::Done);
    }

    #[test]
    fn stream_parser_tool_use_keeps_upstream_index() {
        let mut parser = StreamParser::new();
        parser.feed(r#"{"type":"message_start","message":{"id":"m","model":"x","usage":{}}}"#);
        parser.feed(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        );
        let events = parser.feed(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tc_1","name":"lookup"}}"#,
        );
        assert_eq!(
            events[0],
            StreamEvent::ToolCallStart {
                index: 1,
                id: "tc_1".to_string(),
                name: "lookup".to_string(),
            }
        );
        let deltas = parser.feed(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":1}"}}"#,
        );
        assert_eq!(
            deltas[0],
            StreamEvent::ToolCallDelta {
                index: 1,
                arguments: "{\"q\":1}".to_string(),
            }
        );
    }

    #[test]
    fn renderer_switches_thinking_to_text_block() {
        let mut renderer = StreamRenderer::new();
        renderer.render(&StreamEvent::Start {
            id: "x".to_string(),
            model: "m".to_string(),
            input_tokens: 3,
        });
        let thinking = renderer.render(&StreamEvent::ReasoningDelta("hmm".to_string()));
        assert!(thinking[0].contains("content_block_start"));
        assert!(thinking[1].contains("thinking_delta"));
        let text = renderer.render(&StreamEvent::TextDelta("hi".to_string()));
        // Thinking block closes, text block 1 opens.
        assert!(text[0].contains("content_block_stop"));
        assert!(text[1].contains("\"index\":1"));
        let finish = renderer.render(&StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: Some(Usage::new(3, 9)),
        });
        assert!(finish[0].contains("content_block_stop"));
        assert!(finish[1].contains("message_delta"));
        assert!(finish[1].contains("\"output_tokens\":9"));
        let stop = renderer.render(&StreamEvent::Done);
        assert!(stop[0].contains("message_stop"));
    }

    #[test]
    fn response_render_parses_tool_arguments() {
        let completion = Completion {
            id: "abc".to_string(),
            model: "m".to_string(),
            text: String::new(),
            reasoning: None,
            tool_calls: vec![CompletedToolCall {
                id: "tc_1".to_string(),
                name: "lookup".to_string(),
                arguments: "{\"q\":\"x\"}".to_string(),
            }],
            finish: FinishReason::ToolCalls,
            usage: Usage::new(4, 6),
        };
        let body = render_response(&completion);
        assert_eq!(body["id"], "msg_abc");
        assert_eq!(body["stop_reason"], "tool_use");
        assert_eq!(body["content"][1]["input"]["q"], "x");
    }
}
