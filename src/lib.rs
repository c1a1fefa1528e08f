//! airelay: a multi-protocol LLM API gateway.
//!
//! Client requests in any supported wire shape (OpenAI Chat Completions,
//! OpenAI Responses, Anthropic Messages, Gemini GenerateContent) are
//! admitted against per-group quotas, pre-charged, routed to a weighted
//! upstream channel, translated to the channel's protocol, relayed back
//! (streaming or buffered) with usage accounting, retried across channels
//! on failure, and settled through a write-behind consumption pipeline.

pub mod adaptor;
pub mod alert;
pub mod cache;
pub mod config;
pub mod consume;
pub mod logger;
pub mod model;
pub mod plugin;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod store;
pub mod text;
