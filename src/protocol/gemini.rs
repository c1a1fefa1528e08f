//! Gemini GenerateContent wire shape. The model name lives in the URL
//! path rather than the body, so request parsing takes it as an argument.
//!
//! Gemini tool calls have no ids and arrive with complete argument
//! objects; canonical tool-call ids are the function names, and the client
//! renderer buffers argument fragments until it can emit whole
//! `functionCall` parts.

use serde_json::{json, Map, Value};

use crate::model::usage::Usage;

use super::{
    Completion, CompletedToolCall, FinishReason, Message, MessagePart, RelayRequest, Role,
    SseParser, SseRenderer, StreamEvent, ThinkingOptions, ToolChoice, ToolDef,
};

// ============================================================================
// Request parsing (client mode = gemini)
// ============================================================================

pub fn parse_request(body: &Value, model: &str, stream: bool) -> Result<RelayRequest, String> {
    let obj = body.as_object().ok_or("request body must be a JSON object")?;

    let mut request = RelayRequest {
        model: model.to_string(),
        stream,
        system: obj
            .get("systemInstruction")
            .or_else(|| obj.get("system_instruction"))
            .map(instruction_text)
            .filter(|s| !s.is_empty()),
        ..Default::default()
    };

    if let Some(config) = obj.get("generationConfig") {
        request.max_tokens = config.get("maxOutputTokens").and_then(|v| v.as_i64());
        request.temperature = config.get("temperature").and_then(|v| v.as_f64());
        request.top_p = config.get("topP").and_then(|v| v.as_f64());
        request.stop = config
            .get("stopSequences")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(thinking) = config.get("thinkingConfig") {
            request.thinking = Some(ThinkingOptions {
                enabled: thinking
                    .get("thinkingBudget")
                    .and_then(|v| v.as_i64())
                    .map(|b| b != 0)
                    .unwrap_or(true),
                budget_tokens: thinking.get("thinkingBudget").and_then(|v| v.as_i64()),
            });
        }
    }

    for content in obj
        .get("contents")
        .and_then(|v| v.as_array())
        .ok_or("missing contents")?
    {
        let role = match content.get("role").and_then(|v| v.as_str()) {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        let mut parts = Vec::new();
        for part in content
            .get("parts")
            .and_then(|v| v.as_array())
            .unwrap_or(&Vec::new())
        {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                parts.push(MessagePart::Text(text.to_string()));
            } else if let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) {
                let mime = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("image/png");
                if let Some(data) = inline.get("data").and_then(|v| v.as_str()) {
                    parts.push(MessagePart::ImageUrl(format!(
                        "data:{};base64,{}",
                        mime, data
                    )));
                }
            } else if let Some(file) = part.get("fileData").or_else(|| part.get("file_data")) {
                if let Some(uri) = file
                    .get("fileUri")
                    .or_else(|| file.get("file_uri"))
                    .and_then(|v| v.as_str())
                {
                    parts.push(MessagePart::ImageUrl(uri.to_string()));
                }
            } else if let Some(call) = part.get("functionCall").or_else(|| part.get("function_call"))
            {
                let name = call
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                parts.push(MessagePart::ToolCall {
                    id: name.clone(),
                    name,
                    arguments: call.get("args").cloned().unwrap_or(Value::Null),
                });
            } else if let Some(resp) = part
                .get("functionResponse")
                .or_else(|| part.get("function_response"))
            {
                parts.push(MessagePart::ToolResult {
                    call_id: resp
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    content: resp
                        .get("response")
                        .map(|r| r.to_string())
                        .unwrap_or_default(),
                });
            }
        }
        request.messages.push(Message {
            role,
            parts,
            reasoning: None,
        });
    }

    if let Some(tools) = obj.get("tools").and_then(|v| v.as_array()) {
        for tool in tools {
            let Some(declarations) = tool
                .get("functionDeclarations")
                .or_else(|| tool.get("function_declarations"))
                .and_then(|v| v.as_array())
            else {
                continue;
            };
            for declaration in declarations {
                let Some(name) = declaration.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                request.tools.push(ToolDef {
                    name: name.to_string(),
                    description: declaration
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    parameters: declaration
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                });
            }
        }
    }

    request.tool_choice = obj
        .get("toolConfig")
        .or_else(|| obj.get("tool_config"))
        .and_then(|config| config.get("functionCallingConfig"))
        .and_then(|fcc| fcc.get("mode"))
        .and_then(|mode| mode.as_str())
        .and_then(|mode| match mode {
            "AUTO" => Some(ToolChoice::Auto),
            "ANY" => Some(ToolChoice::Required),
            "NONE" => Some(ToolChoice::None),
            _ => None,
        });

    Ok(request)
}

fn instruction_text(raw: &Value) -> String {
    if let Some(text) = raw.as_str() {
        return text.to_string();
    }
    raw.get("parts")
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

// ============================================================================
// Request rendering (upstream kind = gemini)
// ============================================================================

pub fn render_request(request: &RelayRequest) -> Value {
    let mut body = Map::new();
    if let Some(system) = &request.system {
        body.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }

    let mut contents = Vec::new();
    for message in &request.messages {
        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let mut parts = Vec::new();
        for part in &message.parts {
            match part {
                MessagePart::Text(text) => parts.push(json!({"text": text})),
                MessagePart::ImageUrl(url) => {
                    if let Some(rest) = url.strip_prefix("data:") {
                        if let Some((mime, data)) = rest.split_once(";base64,") {
                            parts.push(json!({
                                "inlineData": {"mimeType": mime, "data": data},
                            }));
                        }
                    } else {
                        parts.push(json!({"fileData": {"fileUri": url}}));
                    }
                }
                MessagePart::ToolCall { name, arguments, .. } => parts.push(json!({
                    "functionCall": {"name": name, "args": arguments},
                })),
                MessagePart::ToolResult { call_id, content } => {
                    let response: Value = serde_json::from_str(content)
                        .unwrap_or_else(|_| json!({"result": content}));
                    parts.push(json!({
                        "functionResponse": {"name": call_id, "response": response},
                    }));
                }
            }
        }
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({"role": role, "parts": parts}));
    }
    body.insert("contents".to_string(), Value::Array(contents));

    let mut generation = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".to_string(), json!(top_p));
    }
    if !request.stop.is_empty() {
        generation.insert("stopSequences".to_string(), json!(request.stop));
    }
    if let Some(thinking) = request.thinking {
        if thinking.enabled {
            generation.insert(
                "thinkingConfig".to_string(),
                json!({"thinkingBudget": thinking.budget_tokens.unwrap_or(1024)}),
            );
        }
    }
    if !generation.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        body.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
    }
    if let Some(choice) = &request.tool_choice {
        let mode = match choice {
            ToolChoice::Auto | ToolChoice::Tool(_) => "AUTO",
            ToolChoice::Required => "ANY",
            ToolChoice::None => "NONE",
        };
        body.insert(
            "toolConfig".to_string(),
            json!({"functionCallingConfig": {"mode": mode}}),
        );
    }
    Value::Object(body)
}

// ============================================================================
// Usage and buffered responses
// ============================================================================

pub fn parse_usage(raw: &Value) -> Usage {
    let mut usage = Usage::default();
    usage.input_tokens = raw
        .get("promptTokenCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.output_tokens = raw
        .get("candidatesTokenCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.reasoning_tokens = raw
        .get("thoughtsTokenCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.cached_tokens = raw
        .get("cachedContentTokenCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.total_tokens = raw
        .get("totalTokenCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(usage.input_tokens + usage.output_tokens + usage.reasoning_tokens);
    usage
}

pub fn render_usage(usage: &Usage) -> Value {
    json!({
        "promptTokenCount": usage.input_tokens,
        "candidatesTokenCount": usage.output_tokens,
        "thoughtsTokenCount": usage.reasoning_tokens,
        "cachedContentTokenCount": usage.cached_tokens,
        "totalTokenCount": usage.total_tokens.max(usage.input_tokens + usage.output_tokens),
    })
}

pub fn parse_response(body: &Value) -> Completion {
    let mut completion = Completion {
        id: body
            .get("responseId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        model: body
            .get("modelVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        usage: body
            .get("usageMetadata")
            .map(parse_usage)
            .unwrap_or_default(),
        ..Default::default()
    };
    let Some(candidate) = body
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|c| c.first())
    else {
        return completion;
    };
    completion.finish = candidate
        .get("finishReason")
        .and_then(|v| v.as_str())
        .map(FinishReason::from_gemini)
        .unwrap_or(FinishReason::Stop);
    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|v| v.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                    completion
                        .reasoning
                        .get_or_insert_with(String::new)
                        .push_str(text);
                } else {
                    completion.text.push_str(text);
                }
            } else if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                completion.tool_calls.push(CompletedToolCall {
                    id: name.clone(),
                    name,
                    arguments: call
                        .get("args")
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                });
            }
        }
    }
    if !completion.tool_calls.is_empty() && completion.finish == FinishReason::Stop {
        completion.finish = FinishReason::ToolCalls;
    }
    completion
}

pub fn render_response(completion: &Completion) -> Value {
    let mut parts = Vec::new();
    if let Some(reasoning) = &completion.reasoning {
        parts.push(json!({"text": reasoning, "thought": true}));
    }
    if !completion.text.is_empty() || completion.tool_calls.is_empty() {
        parts.push(json!({"text": completion.text}));
    }
    for call in &completion.tool_calls {
        let args: Value =
            serde_json::from_str(&call.arguments).unwrap_or(Value::Object(Map::new()));
        parts.push(json!({"functionCall": {"name": call.name, "args": args}}));
    }
    json!({
        "candidates": [{
            "content": {"parts": parts, "role": "model"},
            "finishReason": completion.finish.gemini_str(),
            "index": 0,
        }],
        "usageMetadata": render_usage(&completion.usage),
        "modelVersion": completion.model,
    })
}

pub fn render_error_body(code: u16, message: &str) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message,
            "status": status_for(code),
        }
    })
}

fn status_for(code: u16) -> &'static str {
    match code {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        500 => "INTERNAL",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

fn frame(value: &Value) -> String {
    format!("data: {}\n\n", value)
}

// ============================================================================
// Upstream stream scanner
// ============================================================================

/// Scans streamGenerateContent SSE chunks. Gemini has no terminal marker;
/// `finish` synthesizes the trailing events at end of input.
#[derive(Default)]
pub struct StreamParser {
    started: bool,
    finished: bool,
    done: bool,
    next_tool_index: usize,
    pending_finish: Option<FinishReason>,
    usage: Option<Usage>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SseParser for StreamParser {
    fn feed(&mut self, data: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return out;
        };
        if let Some(meta) = chunk.get("usageMetadata").filter(|m| !m.is_null()) {
            self.usage = Some(parse_usage(meta));
        }
        if !self.started {
            self.started = true;
            out.push(StreamEvent::Start {
                id: chunk
                    .get("responseId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                model: chunk
                    .get("modelVersion")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                input_tokens: self.usage.map(|u| u.input_tokens).unwrap_or(0),
            });
        }
        let Some(candidate) = chunk
            .get("candidates")
            .and_then(|v| v.as_array())
            .and_then(|c| c.first())
        else {
            return out;
        };
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                        out.push(StreamEvent::ReasoningDelta(text.to_string()));
                    } else if !text.is_empty() {
                        out.push(StreamEvent::TextDelta(text.to_string()));
                    }
                } else if let Some(call) = part.get("functionCall") {
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    let name = call
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    out.push(StreamEvent::ToolCallStart {
                        index,
                        id: name.clone(),
                        name,
                    });
                    out.push(StreamEvent::ToolCallDelta {
                        index,
                        arguments: call
                            .get("args")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    });
                }
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            let mut finish = FinishReason::from_gemini(reason);
            if self.next_tool_index > 0 && finish == FinishReason::Stop {
                finish = FinishReason::ToolCalls;
            }
            self.pending_finish = Some(finish);
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if !self.finished {
            self.finished = true;
            out.push(StreamEvent::Finish {
                reason: self.pending_finish.take().unwrap_or(FinishReason::Stop),
                usage: self.usage.take(),
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

/// Emits Gemini SSE chunks. Tool-call argument fragments are buffered per
/// upstream index and flushed as whole `functionCall` parts, since the
/// Gemini wire has no partial-arguments form.
pub struct StreamRenderer {
    model: String,
    finished: bool,
    pending_tools: Vec<(usize, String, String)>,
}

impl StreamRenderer {
    pub fn new() -> Self {
        Self {
            model: String::new(),
            finished: false,
            pending_tools: Vec::new(),
        }
    }

    fn chunk(&self, parts: Vec<Value>, finish: Option<&FinishReason>, usage: Option<&Usage>) -> Value {
        let mut candidate = Map::new();
        candidate.insert(
            "content".to_string(),
            json!({"parts": parts, "role": "model"}),
        );
        if let Some(reason) = finish {
            candidate.insert("finishReason".to_string(), json!(reason.gemini_str()));
        }
        candidate.insert("index".to_string(), json!(0));
        let mut body = Map::new();
        body.insert("candidates".to_string(), json!([Value::Object(candidate)]));
        if let Some(usage) = usage {
            body.insert("usageMetadata".to_string(), render_usage(usage));
        }
        body.insert("modelVersion".to_string(), json!(self.model));
        Value::Object(body)
    }

    fn drain_tools(&mut self) -> Vec<Value> {
        self.pending_tools
            .drain(..)
            .map(|(_, name, arguments)| {
                let args: Value =
                    serde_json::from_str(&arguments).unwrap_or(Value::Object(Map::new()));
                json!({"functionCall": {"name": name, "args": args}})
            })
            .collect()
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
            }
            StreamEvent::TextDelta(text) => {
                out.push(frame(&self.chunk(vec![json!({"text": text})], None, None)));
            }
            StreamEvent::ReasoningDelta(text) => {
                out.push(frame(&self.chunk(
                    vec![json!({"text": text, "thought": true})],
                    None,
                    None,
                )));
            }
            StreamEvent::ToolCallStart { index, name, .. } => {
                self.pending_tools
                    .push((*index, name.clone(), String::new()));
            }
            StreamEvent::ToolCallDelta { index, arguments } => {
                if let Some((_, _, buffer)) =
                    self.pending_tools.iter_mut().rev().find(|(i, _, _)| i == index)
                {
                    buffer.push_str(arguments);
                }
            }
            StreamEvent::Finish { reason, usage } => {
                if !self.finished {
                    self.finished = true;
                    let parts = self.drain_tools();
                    out.push(frame(&self.chunk(parts, Some(reason), usage.as_ref())));
                }
            }
            StreamEvent::Done => {}
        }
        out
    }

    fn render_error(&mut self, code: u16, message: &str) -> Vec<String> {
        vec![frame(&render_error_body(code, message))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_contents_and_config() {
        let body = json!({
            "systemInstruction": {"parts": [{"text": "helpful"}]},
            "contents": [{"role": "user", "parts": [{"text": "ping"}]}],
            "generationConfig": {"maxOutputTokens": 512, "temperature": 0.4},
        });
        let req = parse_request(&body, "gemini-2.0-flash", false).unwrap();
        assert_eq!(req.model, "gemini-2.0-flash");
        assert_eq!(req.system.as_deref(), Some("helpful"));
        assert_eq!(req.max_tokens, Some(512));
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn parse_request_function_round_trip() {
        let body = json!({
            "contents": [
                {"role": "model", "parts": [{"functionCall": {"name": "lookup", "args": {"q": 1}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "lookup", "response": {"ok": true}}}]},
            ],
        });
        let req = parse_request(&body, "gemini-2.0-flash", false).unwrap();
        assert!(matches!(
            req.messages[0].parts[0],
            MessagePart::ToolCall { .. }
        ));
        let rendered = render_request(&req);
        assert_eq!(
            rendered["contents"][0]["parts"][0]["functionCall"]["name"],
            "lookup"
        );
        assert_eq!(
            rendered["contents"][1]["parts"][0]["functionResponse"]["name"],
            "lookup"
        );
    }

    #[test]
    fn render_response_shape() {
        let completion = Completion {
            model: "gemini-2.0-flash".to_string(),
            text: "pong".to_string(),
            usage: Usage::new(7, 2),
            ..Default::default()
        };
        let body = render_response(&completion);
        assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "pong");
        assert_eq!(body["candidates"][0]["finishReason"], "STOP");
        assert_eq!(body["usageMetadata"]["promptTokenCount"], 7);
        assert_eq!(body["usageMetadata"]["totalTokenCount"], 9);
    }

    #[test]
    fn stream_parser_synthesizes_finish_at_eof() {
        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        events.extend(parser.feed(
            r#"{"candidates":[{"content":{"parts":[{"text":"po"}],"role":"model"},"index":0}]}"#,
        ));
        events.extend(parser.feed(
            r#"{"candidates":[{"content":{"parts":[{"text":"ng"}],"role":"model"},"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6}}"#,
        ));
        events.extend(parser.finish());
        assert!(matches!(events[0], StreamEvent::Start { .. }));
        assert_eq!(events[1], StreamEvent::TextDelta("po".to_string()));
        assert_eq!(events[2], StreamEvent::TextDelta("ng".to_string()));
        match &events[3] {
            StreamEvent::Finish { reason, usage } => {
                assert_eq!(*reason, FinishReason::Stop);
                assert_eq!(usage.unwrap().total_tokens, 6);
            }
            other => panic!("expected finish, got {:?}", other),
        }
        assert_eq!(events[4], StreamEvent::Done);
    }

    #[test]
    fn renderer_flushes_buffered_tool_call_on_finish() {
        let mut renderer = StreamRenderer::new();
        renderer.render(&StreamEvent::Start {
            id: String::new(),
            model: "gemini-2.0-flash".to_string(),
            input_tokens: 0,
        });
        renderer.render(&StreamEvent::ToolCallStart {
            index: 1,
            id: "tc".to_string(),
            name: "lookup".to_string(),
        });
        renderer.render(&StreamEvent::ToolCallDelta {
            index: 1,
            arguments: "{\"q\":".to_string(),
        });
        renderer.render(&StreamEvent::ToolCallDelta {
            index: 1,
            arguments: "2}".to_string(),
        });
        let frames = renderer.render(&StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
            usage: Some(Usage::new(3, 4)),
        });
        let chunk: Value =
            serde_json::from_str(frames[0].trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(
            chunk["candidates"][0]["content"]["parts"][0]["functionCall"]["args"]["q"],
            2
        );
        assert_eq!(chunk["candidates"][0]["finishReason"], "STOP");
    }
}
