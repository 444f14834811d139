//! Per-dialect request/response transformers.
//!
//! A [`Transformer`] knows the wire endpoint for its target dialect and how
//! to translate a unified JSON body to and from that dialect's native shape.
//! The pass-through fast path skips transformation entirely when the
//! incoming and outgoing dialects match; transformers only run on a dialect
//! change.

use anyhow::Context;
use serde_json::{json, Value};

use crate::config::Dialect;

pub trait Transformer: Send + Sync {
    fn endpoint(&self, body: &Value) -> String;
    fn transform_request(&self, unified: Value) -> anyhow::Result<Value>;
    fn transform_response(&self, raw: Value) -> anyhow::Result<Value>;
}

/// Used whenever `incomingDialect == targetDialect` — or for target dialects
/// this crate has no native translator for (images/speech/transcriptions),
/// where the body is forwarded verbatim.
pub struct PassthroughTransformer {
    endpoint: &'static str,
}

impl PassthroughTransformer {
    pub fn new(endpoint: &'static str) -> Self {
        Self { endpoint }
    }
}

impl Transformer for PassthroughTransformer {
    fn endpoint(&self, _body: &Value) -> String {
        self.endpoint.to_string()
    }

    fn transform_request(&self, unified: Value) -> anyhow::Result<Value> {
        Ok(unified)
    }

    fn transform_response(&self, raw: Value) -> anyhow::Result<Value> {
        Ok(raw)
    }
}

const DEFAULT_MAX_TOKENS: u64 = 8_192;
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Translates OpenAI Chat Completions <-> Anthropic Messages.
pub struct ChatToMessagesTransformer;

impl Transformer for ChatToMessagesTransformer {
    fn endpoint(&self, _body: &Value) -> String {
        "/v1/messages".to_string()
    }

    fn transform_request(&self, unified: Value) -> anyhow::Result<Value> {
        let model = unified["model"].as_str().context("`model` field is required")?.to_string();
        let max_tokens = unified["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);
        let raw_messages = unified["messages"].as_array().context("`messages` array is required")?;

        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());
        for msg in raw_messages {
            if msg["role"].as_str() == Some("system") {
                if let Some(content) = msg["content"].as_str() {
                    system_parts.push(content);
                }
            } else {
                messages.push(msg.clone());
            }
        }

        let mut req = json!({ "model": model, "max_tokens": max_tokens, "messages": messages });
        if !system_parts.is_empty() {
            req["system"] = Value::String(system_parts.join("\n\n"));
        }
        if let Some(temp) = unified["temperature"].as_f64() {
            req["temperature"] = json!(temp);
        }
        if let Some(stop) = unified.get("stop") {
            req["stop_sequences"] = stop.clone();
        }
        Ok(req)
    }

    fn transform_response(&self, raw: Value) -> anyhow::Result<Value> {
        let text = raw["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
            .and_then(|b| b["text"].as_str())
            .context("no text block in Anthropic response `content` array")?
            .to_string();

        let model = raw["model"].as_str().unwrap_or("unknown");
        let finish_reason = match raw["stop_reason"].as_str().unwrap_or("stop") {
            "end_turn" => "stop",
            "max_tokens" => "length",
            other => other,
        };
        let input_tokens = raw["usage"]["input_tokens"].as_u64().unwrap_or(0);
        let output_tokens = raw["usage"]["output_tokens"].as_u64().unwrap_or(0);

        Ok(json!({
            "id": raw["id"],
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": finish_reason,
            }],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens,
            },
        }))
    }
}

/// Translates Anthropic Messages <-> OpenAI Chat Completions (the inverse
/// direction of [`ChatToMessagesTransformer`] — needed when a `messages`
/// alias is dispatched to a provider only reachable through `chat`).
pub struct MessagesToChatTransformer;

impl Transformer for MessagesToChatTransformer {
    fn endpoint(&self, _body: &Value) -> String {
        "/v1/chat/completions".to_string()
    }

    fn transform_request(&self, unified: Value) -> anyhow::Result<Value> {
        let model = unified["model"].as_str().context("`model` field is required")?.to_string();
        let max_tokens = unified["max_tokens"].as_u64();
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = unified["system"].as_str() {
            messages.push(json!({ "role": "system", "content": system }));
        }
        if let Some(existing) = unified["messages"].as_array() {
            messages.extend(existing.iter().cloned());
        }

        let mut req = json!({ "model": model, "messages": messages });
        if let Some(mt) = max_tokens {
            req["max_tokens"] = json!(mt);
        }
        if let Some(temp) = unified["temperature"].as_f64() {
            req["temperature"] = json!(temp);
        }
        Ok(req)
    }

    fn transform_response(&self, raw: Value) -> anyhow::Result<Value> {
        let content = raw["choices"][0]["message"]["content"].as_str().unwrap_or("").to_string();
        let finish_reason = match raw["choices"][0]["finish_reason"].as_str().unwrap_or("stop") {
            "length" => "max_tokens",
            other => other,
        };
        let prompt_tokens = raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let completion_tokens = raw["usage"]["completion_tokens"].as_u64().unwrap_or(0);

        Ok(json!({
            "id": raw["id"],
            "type": "message",
            "role": "assistant",
            "model": raw["model"],
            "content": [{ "type": "text", "text": content }],
            "stop_reason": finish_reason,
            "usage": { "input_tokens": prompt_tokens, "output_tokens": completion_tokens },
        }))
    }
}

/// Resolves the transformer to use for a `(from, to)` dialect pair. Dialects
/// with no native translator (images/speech/transcriptions/embeddings/gemini)
/// fall back to pass-through — the outgoing body is the unified body as-is,
/// matching this crate's documented translation scope (see DESIGN.md).
pub fn transformer_for(from: Dialect, to: Dialect) -> Box<dyn Transformer> {
    match (from, to) {
        (a, b) if a == b => Box::new(PassthroughTransformer::new(default_endpoint(b))),
        (Dialect::Chat, Dialect::Messages) => Box::new(ChatToMessagesTransformer),
        (Dialect::Messages, Dialect::Chat) => Box::new(MessagesToChatTransformer),
        (_, other) => Box::new(PassthroughTransformer::new(default_endpoint(other))),
    }
}

fn default_endpoint(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Chat => "/v1/chat/completions",
        Dialect::Messages => "/v1/messages",
        Dialect::Gemini => "/v1beta/models",
        Dialect::Responses => "/v1/responses",
        Dialect::Embeddings => "/v1/embeddings",
        Dialect::Speech => "/v1/audio/speech",
        Dialect::Images => "/v1/images/generations",
        Dialect::Transcriptions => "/v1/audio/transcriptions",
        Dialect::Oauth => "/v1/messages",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_to_messages_extracts_system_message() {
        let req = json!({
            "model": "claude-haiku-4-5-20251001",
            "messages": [
                { "role": "system", "content": "be helpful" },
                { "role": "user", "content": "hi" },
            ],
        });
        let out = ChatToMessagesTransformer.transform_request(req).unwrap();
        assert_eq!(out["system"], "be helpful");
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn chat_to_messages_defaults_max_tokens() {
        let req = json!({ "model": "m", "messages": [{"role": "user", "content": "hi"}] });
        let out = ChatToMessagesTransformer.transform_request(req).unwrap();
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn messages_response_maps_end_turn_to_stop() {
        let resp = json!({
            "id": "msg_1",
            "model": "m",
            "content": [{ "type": "text", "text": "hello" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 3, "output_tokens": 2 },
        });
        let out = ChatToMessagesTransformer.transform_response(resp).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 5);
    }

    #[test]
    fn messages_to_chat_round_trips_system_field() {
        let req = json!({
            "model": "m",
            "system": "be terse",
            "messages": [{ "role": "user", "content": "hi" }],
        });
        let out = MessagesToChatTransformer.transform_request(req).unwrap();
        assert_eq!(out["messages"][0]["role"], "system");
        assert_eq!(out["messages"][0]["content"], "be terse");
    }

    #[test]
    fn same_dialect_pair_is_passthrough() {
        let t = transformer_for(Dialect::Chat, Dialect::Chat);
        let body = json!({ "a": 1 });
        assert_eq!(t.transform_request(body.clone()).unwrap(), body);
    }
}
