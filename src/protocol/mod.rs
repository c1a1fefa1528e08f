//! Protocol translation core.
//!
//! Every client wire shape parses into the canonical [`RelayRequest`];
//! every upstream kind renders the canonical form into its own body. On
//! the way back, upstream responses (buffered or SSE) parse into
//! [`StreamEvent`]s / [`Completion`]s, and a per-client-mode renderer
//! emits the client's wire shape. This keeps the conversion matrix at
//! parsers + renderers instead of pairwise translations.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod responses;

use serde_json::Value;

use crate::model::usage::Usage;

// ============================================================================
// Canonical request
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    /// http(s) or data: URL. Remote URLs are resolved to data URLs before
    /// rendering for upstreams that require inline image bytes.
    ImageUrl(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
    /// Assistant reasoning text carried alongside regular content.
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the tool parameters.
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThinkingOptions {
    pub enabled: bool,
    pub budget_tokens: Option<i64>,
}

/// Protocol-independent request form.
#[derive(Debug, Clone, Default)]
pub struct RelayRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    pub stream: bool,
    pub thinking: Option<ThinkingOptions>,
}

impl RelayRequest {
    /// Concatenated text view used for fallback token estimation.
    pub fn text_for_estimation(&self) -> String {
        let mut out = String::new();
        if let Some(system) = &self.system {
            out.push_str(system);
            out.push('\n');
        }
        for message in &self.messages {
            for part in &message.parts {
                match part {
                    MessagePart::Text(text) => {
                        out.push_str(text);
                        out.push('\n');
                    }
                    MessagePart::ToolResult { content, .. } => {
                        out.push_str(content);
                        out.push('\n');
                    }
                    MessagePart::ToolCall { name, arguments, .. } => {
                        out.push_str(name);
                        out.push_str(&arguments.to_string());
                        out.push('\n');
                    }
                    MessagePart::ImageUrl(_) => {}
                }
            }
        }
        out
    }

    /// Model-aware scrubbing applied before rendering for any upstream:
    /// thinking requests drop `temperature`, and `budget_tokens` is clamped
    /// into `[1024, max_tokens)`, doubling `max_tokens` when it is too
    /// small to leave room above the budget.
    pub fn scrub_capabilities(&mut self, default_max_tokens: i64) {
        let Some(thinking) = self.thinking else {
            return;
        };
        if !thinking.enabled {
            return;
        }
        self.temperature = None;
        let mut max_tokens = self.max_tokens.unwrap_or(default_max_tokens).max(1);
        let mut budget = thinking.budget_tokens.unwrap_or(max_tokens / 2).max(1024);
        if budget >= max_tokens {
            max_tokens *= 2;
        }
        if budget >= max_tokens {
            budget = (max_tokens - 1).max(1024);
        }
        self.max_tokens = Some(max_tokens);
        self.thinking = Some(ThinkingOptions {
            enabled: true,
            budget_tokens: Some(budget),
        });
    }
}

// ============================================================================
// Canonical stream events and buffered completions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn openai_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "stop",
        }
    }

    pub fn anthropic_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ToolCalls => "tool_use",
            FinishReason::ContentFilter => "refusal",
            FinishReason::Error => "end_turn",
        }
    }

    pub fn gemini_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "STOP",
            FinishReason::Length => "MAX_TOKENS",
            FinishReason::ToolCalls => "STOP",
            FinishReason::ContentFilter => "SAFETY",
            FinishReason::Error => "OTHER",
        }
    }

    pub fn from_openai(raw: &str) -> Self {
        match raw {
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }

    pub fn from_anthropic(raw: &str) -> Self {
        match raw {
            "max_tokens" => FinishReason::Length,
            "tool_use" => FinishReason::ToolCalls,
            "refusal" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }

    pub fn from_gemini(raw: &str) -> Self {
        match raw {
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
                FinishReason::ContentFilter
            }
            _ => FinishReason::Stop,
        }
    }
}

/// One event in the canonical stream. Upstream parsers produce these;
/// client renderers consume them.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        id: String,
        model: String,
        input_tokens: i64,
    },
    TextDelta(String),
    ReasoningDelta(String),
    /// `index` is the upstream content-block index across all block types;
    /// client renderers densify it per their own conventions.
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: usize,
        arguments: String,
    },
    Finish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
    Done,
}

/// Fully-accumulated tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the arguments.
    pub arguments: String,
}

/// Buffered (non-streaming) response in canonical form.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub id: String,
    pub model: String,
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<CompletedToolCall>,
    pub finish: FinishReason,
    pub usage: Usage,
}

impl Default for FinishReason {
    fn default() -> Self {
        FinishReason::Stop
    }
}

/// Upstream SSE scanner: data payloads in, canonical events out. Explicit
/// state object per the streaming design; no buffering of the full body.
pub trait SseParser: Send {
    fn feed(&mut self, data: &str) -> Vec<StreamEvent>;
    /// Flush at end of input; synthesizes Finish/Done for upstreams with
    /// no explicit terminal marker.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

/// Client-side event renderer: canonical events in, wire frames out. A
/// frame is a complete SSE block including the trailing blank line.
pub trait SseRenderer: Send {
    fn render(&mut self, event: &StreamEvent) -> Vec<String>;
    /// Protocol-shaped error frame for faults after the first byte.
    fn render_error(&mut self, code: u16, message: &str) -> Vec<String>;
}

/// Collects a canonical event stream into a [`Completion`]. Used by the
/// non-streaming paths and the stream-fake plugin.
#[derive(Debug, Default)]
pub struct CompletionCollector {
    completion: Completion,
    tool_order: Vec<usize>,
}

impl CompletionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Start {
                id,
                model,
                input_tokens,
            } => {
                self.completion.id = id.clone();
                self.completion.model = model.clone();
                self.completion.usage.input_tokens = *input_tokens;
            }
            StreamEvent::TextDelta(text) => self.completion.text.push_str(text),
            StreamEvent::ReasoningDelta(text) => {
                self.completion
                    .reasoning
                    .get_or_insert_with(String::new)
                    .push_str(text);
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.tool_order.push(*index);
                self.completion.tool_calls.push(CompletedToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });
            }
            StreamEvent::ToolCallDelta { index, arguments } => {
                if let Some(pos) = self.tool_order.iter().position(|i| i == index) {
                    self.completion.tool_calls[pos].arguments.push_str(arguments);
                }
            }
            StreamEvent::Finish { reason, usage } => {
                self.completion.finish = *reason;
                if let Some(usage) = usage {
                    let input = self.completion.usage.input_tokens;
                    self.completion.usage = *usage;
                    if self.completion.usage.input_tokens == 0 {
                        self.completion.usage.input_tokens = input;
                    }
                }
            }
            StreamEvent::Done => {}
        }
    }

    pub fn into_completion(mut self) -> Completion {
        self.completion.usage.finalize_total();
        self.completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_strips_temperature_and_clamps_budget() {
        let mut req = RelayRequest {
            temperature: Some(0.7),
            max_tokens: Some(2000),
            thinking: Some(ThinkingOptions {
                enabled: true,
                budget_tokens: Some(100),
            }),
            ..Default::default()
        };
        req.scrub_capabilities(4096);
        assert_eq!(req.temperature, None);
        let thinking = req.thinking.unwrap();
        assert_eq!(thinking.budget_tokens, Some(1024));
        assert_eq!(req.max_tokens, Some(2000));
    }

    #[test]
    fn scrub_doubles_max_tokens_when_budget_crowds_it() {
        let mut req = RelayRequest {
            max_tokens: Some(1024),
            thinking: Some(ThinkingOptions {
                enabled: true,
                budget_tokens: Some(1500),
            }),
            ..Default::default()
        };
        req.scrub_capabilities(4096);
        assert_eq!(req.max_tokens, Some(2048));
        let budget = req.thinking.unwrap().budget_tokens.unwrap();
        assert!(budget >= 1024 && budget < 2048);
    }

    #[test]
    fn scrub_ignores_disabled_thinking() {
        let mut req = RelayRequest {
            temperature: Some(0.3),
            thinking: Some(ThinkingOptions {
                enabled: false,
                budget_tokens: None,
            }),
            ..Default::default()
        };
        req.scrub_capabilities(4096);
        assert_eq!(req.temperature, Some(0.3));
    }

    fn strip_volatile(frame: &str) -> serde_json::Value {
        let data = frame
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap_or("null");
        let mut value: serde_json::Value = serde_json::from_str(data).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("created");
            obj.remove("id");
        }
        value
    }

    /// Feed a canned upstream script through a parser and a renderer;
    /// returns the emitted frames and the accumulated completion.
    fn drive(
        parser: &mut dyn SseParser,
        renderer: &mut dyn SseRenderer,
        script: &[&str],
    ) -> (Vec<String>, Completion) {
        let mut frames = Vec::new();
        let mut collector = CompletionCollector::new();
        let mut events = Vec::new();
        for data in script {
            events.extend(parser.feed(data));
        }
        events.extend(parser.finish());
        for event in &events {
            collector.on_event(event);
            frames.extend(renderer.render(event));
        }
        (frames, collector.into_completion())
    }

    const ANTHROPIC_SCRIPT: &[&str] = &[
        r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-3-5","usage":{"input_tokens":10,"output_tokens":0}}}"#,
        r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hello"}}"#,
        r#"{"type":"content_block_stop","index":0}"#,
        r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
        r#"{"type":"message_stop"}"#,
    ];

    const OPENAI_SCRIPT: &[&str] = &[
        r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"hello"}}]}"#,
        r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        "[DONE]",
    ];

    const GEMINI_SCRIPT: &[&str] = &[
        r#"{"candidates":[{"content":{"parts":[{"text":"hello"}],"role":"model"},"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5,"totalTokenCount":15},"modelVersion":"gemini-2.0-flash"}"#,
    ];

    fn parsers_and_scripts() -> Vec<(&'static str, Box<dyn SseParser>, &'static [&'static str])> {
        vec![
            ("anthropic", Box::new(anthropic::StreamParser::new()), ANTHROPIC_SCRIPT),
            ("openai", Box::new(openai::StreamParser::new()), OPENAI_SCRIPT),
            ("gemini", Box::new(gemini::StreamParser::new()), GEMINI_SCRIPT),
        ]
    }

    fn renderers() -> Vec<(&'static str, Box<dyn SseRenderer>)> {
        vec![
            ("openai", Box::new(openai::StreamRenderer::new())),
            ("anthropic", Box::new(anthropic::StreamRenderer::new())),
            ("gemini", Box::new(gemini::StreamRenderer::new())),
            ("responses", Box::new(responses::StreamRenderer::new())),
        ]
    }

    /// Every (upstream kind, client mode) pair relays the same canned
    /// content with identical final usage totals, and each client stream
    /// is properly terminated.
    #[test]
    fn streaming_matrix_round_trip() {
        for (upstream, _, script) in parsers_and_scripts() {
            for (mode, mut renderer) in renderers() {
                let mut parser: Box<dyn SseParser> = match upstream {
                    "anthropic" => Box::new(anthropic::StreamParser::new()),
                    "openai" => Box::new(openai::StreamParser::new()),
                    _ => Box::new(gemini::StreamParser::new()),
                };
                let (frames, completion) = drive(&mut *parser, &mut *renderer, script);
                assert_eq!(
                    completion.text, "hello",
                    "text mismatch for {upstream}->{mode}"
                );
                assert_eq!(
                    completion.usage.input_tokens, 10,
                    "input mismatch for {upstream}->{mode}"
                );
                assert_eq!(
                    completion.usage.output_tokens, 5,
                    "output mismatch for {upstream}->{mode}"
                );
                assert_eq!(completion.usage.total_tokens, 15);
                let joined = frames.join("");
                match mode {
                    "openai" => assert!(joined.ends_with("data: [DONE]\n\n")),
                    "anthropic" => assert!(joined.contains("event: message_stop")),
                    "responses" => assert!(joined.contains("response.completed")),
                    _ => assert!(joined.contains("\"finishReason\":\"STOP\"")),
                }
            }
        }
    }

    /// The relayed client stream is deterministic for a fixed upstream
    /// script, volatile fields (ids, created) aside.
    #[test]
    fn streaming_output_is_reproducible() {
        let run = || {
            let mut parser = anthropic::StreamParser::new();
            let mut renderer = openai::StreamRenderer::new();
            let (frames, _) = drive(&mut parser, &mut renderer, ANTHROPIC_SCRIPT);
            frames
                .iter()
                .map(|f| strip_volatile(f))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    /// Chat-to-Anthropic relay: the Anthropic upstream script renders as a
    /// valid OpenAI SSE stream with the upstream usage totals.
    #[test]
    fn anthropic_upstream_to_openai_client_stream() {
        let mut parser = anthropic::StreamParser::new();
        let mut renderer = openai::StreamRenderer::new();
        let (frames, completion) = drive(&mut parser, &mut renderer, ANTHROPIC_SCRIPT);
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
        let content_frame = frames
            .iter()
            .find(|f| f.contains("\"content\":\"hello\""))
            .expect("content delta frame");
        let value = strip_volatile(content_frame);
        assert_eq!(value["object"], "chat.completion.chunk");
        let finish_frame = frames
            .iter()
            .find(|f| f.contains("finish_reason\":\"stop"))
            .expect("finish frame");
        let value = strip_volatile(finish_frame);
        assert_eq!(value["usage"]["prompt_tokens"], 10);
        assert_eq!(value["usage"]["completion_tokens"], 5);
        assert_eq!(value["usage"]["total_tokens"], 15);
        assert_eq!(completion.usage.total_tokens, 15);
    }

    /// Gemini client against an Anthropic-shaped (Bedrock) upstream,
    /// non-streaming: request converts with the default max_tokens, and
    /// the reply renders as a Gemini candidate with usage metadata.
    #[test]
    fn gemini_client_to_anthropic_upstream_buffered() {
        let body = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": "ping"}]}],
        });
        let request = gemini::parse_request(&body, "claude-3-5", false).unwrap();
        let upstream_body = anthropic::render_request(&request, "claude-3-5");
        assert_eq!(upstream_body["max_tokens"], anthropic::DEFAULT_MAX_TOKENS);
        assert_eq!(upstream_body["messages"][0]["content"][0]["text"], "ping");

        let upstream_reply = serde_json::json!({
            "id": "msg_b1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5",
            "content": [{"type": "text", "text": "pong"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2},
        });
        let completion = anthropic::parse_response(&upstream_reply);
        let rendered = gemini::render_response(&completion);
        assert_eq!(
            rendered["candidates"][0]["content"]["parts"][0]["text"],
            "pong"
        );
        assert_eq!(rendered["candidates"][0]["finishReason"], "STOP");
        assert_eq!(rendered["usageMetadata"]["promptTokenCount"], 3);
        assert_eq!(rendered["usageMetadata"]["candidatesTokenCount"], 2);
    }

    /// Stream-fake coalescing: three text deltas and a final usage chunk
    /// reassemble into one buffered chat completion.
    #[test]
    fn coalesced_stream_becomes_single_completion() {
        let script = [
            r#"{"id":"c9","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"A"}}]}"#,
            r#"{"id":"c9","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"B"}}]}"#,
            r#"{"id":"c9","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"C"}}]}"#,
            r#"{"id":"c9","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":3,"total_tokens":13}}"#,
            "[DONE]",
        ];
        let mut parser = openai::StreamParser::new();
        let mut collector = CompletionCollector::new();
        let mut events = Vec::new();
        for data in script {
            events.extend(parser.feed(data));
        }
        events.extend(parser.finish());
        for event in &events {
            collector.on_event(event);
        }
        let completion = collector.into_completion();
        let body = openai::render_response(&completion);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "ABC");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["prompt_tokens"], 10);
        assert_eq!(body["usage"]["completion_tokens"], 3);
        assert_eq!(body["usage"]["total_tokens"], 13);
    }

    #[test]
    fn collector_accumulates_tool_calls_by_upstream_index() {
        let mut collector = CompletionCollector::new();
        collector.on_event(&StreamEvent::Start {
            id: "msg_1".to_string(),
            model: "m".to_string(),
            input_tokens: 12,
        });
        collector.on_event(&StreamEvent::ToolCallStart {
            index: 1,
            id: "tc_a".to_string(),
            name: "lookup".to_string(),
        });
        collector.on_event(&StreamEvent::ToolCallDelta {
            index: 1,
            arguments: "{\"q\":".to_string(),
        });
        collector.on_event(&StreamEvent::ToolCallDelta {
            index: 1,
            arguments: "\"x\"}".to_string(),
        });
        collector.on_event(&StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
            usage: Some(Usage::new(12, 8)),
        });
        let completion = collector.into_completion();
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].arguments, "{\"q\":\"x\"}");
        assert_eq!(completion.finish, FinishReason::ToolCalls);
        assert_eq!(completion.usage.total_tokens, 20);
    }
}
