//! Stream inspector & snapshot reconstruction.
//!
//! SSE upstream bodies are folded incrementally into a running "snapshot"
//! value per dialect, so usage/token metadata that only appears in the
//! final chunk is still captured even though the bytes are forwarded to the
//! client as they arrive. Buffering is capped at 10 MiB; past that the
//! inspector stops folding and marks the snapshot truncated rather than
//! growing unbounded.
//!
//! Grounded in the base gateway's `bytes_stream()`-to-client proxying in
//! `backends/openai.rs`/`backends/ollama.rs`, generalized from verbatim
//! byte forwarding to an incremental fold.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::Dialect;

pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Splits a byte stream on blank-line-delimited SSE frames, yielding the
/// `data:` payload of each frame (or `None` for the terminal `[DONE]`
/// sentinel some dialects send).
pub struct SseSplitter {
    carry: String,
}

impl SseSplitter {
    pub fn new() -> Self {
        Self { carry: String::new() }
    }

    /// Feeds one chunk of raw bytes, returning every complete `data:` payload
    /// found so far as a parsed [`Value`]. `[DONE]` frames are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.carry.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();

        while let Some(pos) = self.carry.find("\n\n") {
            let frame = self.carry[..pos].to_string();
            self.carry.drain(..pos + 2);

            for line in frame.lines() {
                let Some(data) = line.strip_prefix("data:") else { continue };
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    out.push(value);
                }
            }
        }
        out
    }
}

impl Default for SseSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds a sequence of parsed SSE chunks into a running snapshot `Value`,
/// per dialect-specific merge rules.
pub struct StreamInspector {
    dialect: Dialect,
    splitter: SseSplitter,
    snapshot: Value,
    buffered_bytes: usize,
    truncated: bool,
}

impl StreamInspector {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            splitter: SseSplitter::new(),
            snapshot: json!({}),
            buffered_bytes: 0,
            truncated: false,
        }
    }

    /// Feeds one chunk of raw upstream bytes. Once the 10 MiB ceiling is
    /// crossed, further bytes are counted but no longer parsed/folded.
    pub fn ingest(&mut self, chunk: &[u8]) {
        self.buffered_bytes += chunk.len();
        if self.buffered_bytes > MAX_BUFFER_BYTES {
            if !self.truncated {
                self.truncated = true;
                if let Some(obj) = self.snapshot.as_object_mut() {
                    obj.insert("_truncated".to_string(), json!(true));
                }
            }
            return;
        }

        for event in self.splitter.push(chunk) {
            self.fold(&event);
        }
    }

    fn fold(&mut self, chunk: &Value) {
        match self.dialect {
            Dialect::Chat => fold_chat(&mut self.snapshot, chunk),
            Dialect::Responses => fold_responses(&mut self.snapshot, chunk),
            Dialect::Messages => fold_messages(&mut self.snapshot, chunk),
            Dialect::Gemini => fold_gemini(&mut self.snapshot, chunk),
            Dialect::Oauth => fold_oauth(&mut self.snapshot, chunk),
            _ => {}
        }
    }

    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> Value {
        self.snapshot
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

fn concat_str(dst: &mut Value, key: &str, piece: Option<&str>) {
    let Some(piece) = piece else { return };
    let obj = dst.as_object_mut().expect("fold target must be an object");
    let entry = obj.entry(key.to_string()).or_insert(json!(""));
    let combined = format!("{}{}", entry.as_str().unwrap_or(""), piece);
    *entry = json!(combined);
}

/// OpenAI Chat Completions — keyed by `choice.index`.
fn fold_chat(snapshot: &mut Value, chunk: &Value) {
    let obj = snapshot.as_object_mut().unwrap();
    obj.entry("id").or_insert_with(|| chunk["id"].clone());
    obj.entry("model").or_insert_with(|| chunk["model"].clone());

    let choices = obj.entry("choices").or_insert_with(|| json!([])).as_array_mut().unwrap();
    for choice in chunk["choices"].as_array().into_iter().flatten() {
        let index = choice["index"].as_u64().unwrap_or(0) as usize;
        while choices.len() <= index {
            choices.push(json!({ "index": choices.len(), "message": { "content": "" }, "finish_reason": null }));
        }
        let target = &mut choices[index];
        let delta = &choice["delta"];

        if let Some(role) = delta["role"].as_str() {
            if let Some(message) = target["message"].as_object_mut() {
                message.entry("role").or_insert_with(|| json!(role));
            }
        }
        concat_str(&mut target["message"], "content", delta["content"].as_str());
        concat_str(&mut target["message"], "reasoning_content", delta["reasoning_content"].as_str());
        concat_str(&mut target["message"], "refusal", delta["refusal"].as_str());

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            let list = target["message"]["tool_calls"].as_array_mut();
            let list = match list {
                Some(l) => l,
                None => {
                    target["message"]["tool_calls"] = json!([]);
                    target["message"]["tool_calls"].as_array_mut().unwrap()
                }
            };
            for tc in tool_calls {
                let tc_index = tc["index"].as_u64().unwrap_or(0) as usize;
                while list.len() <= tc_index {
                    list.push(json!({ "function": { "name": "", "arguments": "" } }));
                }
                let entry = &mut list[tc_index];
                if let Some(name) = tc["function"]["name"].as_str() {
                    if entry["function"]["name"].as_str().unwrap_or("").is_empty() {
                        entry["function"]["name"] = json!(name);
                    }
                }
                concat_str(&mut entry["function"], "arguments", tc["function"]["arguments"].as_str());
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            target["finish_reason"] = json!(reason);
        }
    }

    if !chunk["usage"].is_null() {
        obj.insert("usage".to_string(), chunk["usage"].clone());
    }
}

/// OpenAI Responses — seeded from `response.created`, items tracked by
/// `output_index`.
fn fold_responses(snapshot: &mut Value, chunk: &Value) {
    let obj = snapshot.as_object_mut().unwrap();
    let event_type = chunk["type"].as_str().unwrap_or("");

    match event_type {
        "response.created" => {
            obj.insert("id".to_string(), chunk["response"]["id"].clone());
            obj.entry("output").or_insert_with(|| json!([]));
        }
        "response.output_item.added" => {
            let index = chunk["output_index"].as_u64().unwrap_or(0) as usize;
            let output = obj.entry("output").or_insert_with(|| json!([])).as_array_mut().unwrap();
            while output.len() <= index {
                output.push(json!({ "content": [] }));
            }
            output[index] = chunk["item"].clone();
        }
        "response.output_text.delta" => {
            let index = chunk["output_index"].as_u64().unwrap_or(0) as usize;
            let content_index = chunk["content_index"].as_u64().unwrap_or(0) as usize;
            if let Some(output) = obj.get_mut("output").and_then(|o| o.as_array_mut()) {
                if let Some(item) = output.get_mut(index) {
                    let content = item["content"].as_array_mut().unwrap();
                    while content.len() <= content_index {
                        content.push(json!({ "text": "" }));
                    }
                    concat_str(&mut content[content_index], "text", chunk["delta"].as_str());
                }
            }
        }
        "response.function_call_arguments.delta" => {
            let index = chunk["output_index"].as_u64().unwrap_or(0) as usize;
            if let Some(output) = obj.get_mut("output").and_then(|o| o.as_array_mut()) {
                if let Some(item) = output.get_mut(index) {
                    concat_str(item, "arguments", chunk["delta"].as_str());
                }
            }
        }
        "response.output_item.done" => {
            let index = chunk["output_index"].as_u64().unwrap_or(0) as usize;
            if let Some(output) = obj.get_mut("output").and_then(|o| o.as_array_mut()) {
                if index < output.len() {
                    output[index] = chunk["item"].clone();
                }
            }
        }
        "response.completed" => {
            if let Some(top) = chunk["response"].as_object() {
                for (k, v) in top {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        _ => {}
    }
}

/// Anthropic Messages — seeded from `message_start.message`, blocks tracked
/// by `content_block_start.index`.
fn fold_messages(snapshot: &mut Value, chunk: &Value) {
    let obj = snapshot.as_object_mut().unwrap();
    let event_type = chunk["type"].as_str().unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(message) = chunk["message"].as_object() {
                for (k, v) in message {
                    obj.insert(k.clone(), v.clone());
                }
            }
            obj.entry("content").or_insert_with(|| json!([]));
        }
        "content_block_start" => {
            let index = chunk["index"].as_u64().unwrap_or(0) as usize;
            let content = obj.entry("content").or_insert_with(|| json!([])).as_array_mut().unwrap();
            while content.len() <= index {
                content.push(json!(null));
            }
            let block_type = chunk["content_block"]["type"].as_str().unwrap_or("text");
            content[index] = match block_type {
                "tool_use" => json!({
                    "type": "tool_use",
                    "id": chunk["content_block"]["id"],
                    "name": chunk["content_block"]["name"],
                    "partial_json": "",
                    "input": {},
                }),
                "thinking" | "thought" => json!({ "type": block_type, "thinking": "" }),
                _ => json!({ "type": "text", "text": "" }),
            };
        }
        "content_block_delta" => {
            let index = chunk["index"].as_u64().unwrap_or(0) as usize;
            if let Some(content) = obj.get_mut("content").and_then(|c| c.as_array_mut()) {
                if let Some(block) = content.get_mut(index) {
                    let delta = &chunk["delta"];
                    match delta["type"].as_str().unwrap_or("") {
                        "text_delta" => concat_str(block, "text", delta["text"].as_str()),
                        "thinking_delta" => concat_str(block, "thinking", delta["thinking"].as_str()),
                        "thought_delta" => concat_str(block, "thinking", delta["thought"].as_str()),
                        "input_json_delta" => {
                            concat_str(block, "partial_json", delta["partial_json"].as_str());
                            if let Some(partial) = block["partial_json"].as_str() {
                                if let Ok(parsed) = serde_json::from_str::<Value>(partial) {
                                    block["input"] = parsed;
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        "message_delta" => {
            if let Some(delta) = chunk["delta"].as_object() {
                for (k, v) in delta {
                    obj.insert(k.clone(), v.clone());
                }
            }
            if !chunk["usage"].is_null() {
                obj.insert("usage".to_string(), chunk["usage"].clone());
            }
        }
        _ => {}
    }
}

/// Google Gemini — per-candidate merge; adjacent `text` parts concatenate,
/// `function_call` parts append whole.
fn fold_gemini(snapshot: &mut Value, chunk: &Value) {
    let obj = snapshot.as_object_mut().unwrap();
    let candidates = obj.entry("candidates").or_insert_with(|| json!([])).as_array_mut().unwrap();

    for (i, candidate) in chunk["candidates"].as_array().into_iter().flatten().enumerate() {
        while candidates.len() <= i {
            candidates.push(json!({ "content": { "parts": [] } }));
        }
        let target = &mut candidates[i];
        let parts = target["content"]["parts"].as_array_mut().unwrap();

        for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(text) = part["text"].as_str() {
                if let Some(last) = parts.last_mut() {
                    if last.get("text").is_some() {
                        concat_str(last, "text", Some(text));
                        continue;
                    }
                }
                parts.push(json!({ "text": text }));
            } else if part.get("function_call").is_some() {
                parts.push(part.clone());
            }
        }

        if let Some(reason) = candidate["finishReason"].as_str() {
            target["finishReason"] = json!(reason);
        }
    }

    if !chunk["usageMetadata"].is_null() {
        obj.insert("usageMetadata".to_string(), chunk["usageMetadata"].clone());
    }
}

/// OAuth event stream (Claude-Code upstream) — maps upstream usage shape
/// `{input, output, cacheRead, cacheWrite, totalTokens}` to the unified
/// `{input_tokens, output_tokens, cached_tokens, cache_creation_tokens, total_tokens}`.
fn fold_oauth(snapshot: &mut Value, chunk: &Value) {
    let obj = snapshot.as_object_mut().unwrap();
    let event_type = chunk["type"].as_str().unwrap_or("");

    match event_type {
        "text_delta" => concat_str(snapshot, "text", chunk["text"].as_str()),
        "thinking_delta" => concat_str(snapshot, "thinking", chunk["thinking"].as_str()),
        "toolcall_start" | "toolcall_delta" | "toolcall_end" => {
            let index = chunk["contentIndex"].as_u64().unwrap_or(0) as usize;
            let calls = obj.entry("toolCalls").or_insert_with(|| json!([])).as_array_mut().unwrap();
            while calls.len() <= index {
                calls.push(json!({ "arguments": "" }));
            }
            if event_type == "toolcall_start" {
                calls[index]["name"] = chunk["name"].clone();
            } else if event_type == "toolcall_delta" {
                concat_str(&mut calls[index], "arguments", chunk["delta"].as_str());
            }
        }
        "done" | "error" => {
            if let Some(usage) = chunk.get("usage") {
                obj.insert(
                    "usage".to_string(),
                    json!({
                        "input_tokens": usage["input"],
                        "output_tokens": usage["output"],
                        "cached_tokens": usage["cacheRead"],
                        "cache_creation_tokens": usage["cacheWrite"],
                        "total_tokens": usage["totalTokens"],
                    }),
                );
            }
            if event_type == "error" {
                obj.insert("error".to_string(), chunk.get("error").cloned().unwrap_or(Value::Null));
            }
        }
        _ => {}
    }
}

/// Token counts pulled from a reconstructed snapshot, in the dialect-neutral
/// shape `UsageRecord` persists.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTokens {
    pub input: f64,
    pub output: f64,
    pub reasoning: f64,
    pub cached: f64,
    pub cache_write: f64,
}

/// Reads token counts out of a folded snapshot per dialect.
/// Missing fields default to 0 rather than failing the request — usage
/// accounting is post-flight and must never block the client response.
pub fn extract_usage(dialect: Dialect, snapshot: &Value) -> UsageTokens {
    let num = |v: &Value| v.as_f64().unwrap_or(0.0);
    match dialect {
        Dialect::Chat => {
            let usage = &snapshot["usage"];
            let or_fallback = |primary: &Value, fallback: &Value| {
                if primary.is_null() {
                    num(fallback)
                } else {
                    num(primary)
                }
            };
            UsageTokens {
                input: or_fallback(&usage["prompt_tokens"], &usage["input_tokens"]),
                output: or_fallback(&usage["completion_tokens"], &usage["output_tokens"]),
                reasoning: or_fallback(
                    &usage["completion_tokens_details"]["reasoning_tokens"],
                    &usage["reasoning_tokens"],
                ),
                cached: or_fallback(&usage["prompt_tokens_details"]["cached_tokens"], &usage["cached_tokens"]),
                cache_write: 0.0,
            }
        }
        Dialect::Responses => {
            let usage = &snapshot["usage"];
            UsageTokens {
                input: num(&usage["input_tokens"]),
                output: num(&usage["output_tokens"]),
                reasoning: num(&usage["output_tokens_details"]["reasoning_tokens"]),
                cached: num(&usage["input_tokens_details"]["cached_tokens"]),
                cache_write: 0.0,
            }
        }
        Dialect::Messages => {
            let usage = &snapshot["usage"];
            UsageTokens {
                input: num(&usage["input_tokens"]),
                output: num(&usage["output_tokens"]),
                reasoning: 0.0,
                cached: num(&usage["cache_read_input_tokens"]),
                cache_write: num(&usage["cache_creation_input_tokens"]),
            }
        }
        Dialect::Gemini => {
            let usage = &snapshot["usageMetadata"];
            UsageTokens {
                input: num(&usage["promptTokenCount"]),
                output: num(&usage["candidatesTokenCount"]),
                reasoning: num(&usage["thoughtsTokenCount"]),
                cached: num(&usage["cachedContentTokenCount"]),
                cache_write: 0.0,
            }
        }
        Dialect::Oauth => {
            let usage = &snapshot["usage"];
            UsageTokens {
                input: num(&usage["input_tokens"]),
                output: num(&usage["output_tokens"]),
                reasoning: 0.0,
                cached: num(&usage["cached_tokens"]),
                cache_write: num(&usage["cache_creation_tokens"]),
            }
        }
        _ => UsageTokens::default(),
    }
}

/// One in-flight or recently completed request's captured bodies, flushed to
/// the [`Store`](crate::store::Store) after 5 minutes regardless of
/// whether the owning dispatch task is still alive.
#[derive(Clone, Default)]
pub struct DebugEntry {
    pub raw_request: Value,
    pub transformed_request: Value,
    pub raw_response: Value,
    pub transformed_response: Value,
    pub raw_response_snapshot: Value,
    pub transformed_response_snapshot: Value,
    /// Gates whether [`DebugManager::flush`] writes this entry to the store —
    /// set from `gateway.debugEnabled` at capture time.
    pub persist: bool,
}

/// In-memory map of in-flight debug captures, keyed by request id. Entries
/// are flushed to the store and evicted by a 5-minute timer started when the
/// entry is first inserted — this fires even if the owning request task was
/// cancelled by client disconnect.
pub struct DebugManager {
    entries: Mutex<HashMap<String, DebugEntry>>,
    flush_tx: mpsc::UnboundedSender<String>,
}

impl DebugManager {
    pub fn new(store: std::sync::Arc<dyn crate::store::Store>) -> std::sync::Arc<Self> {
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<String>();
        let manager = std::sync::Arc::new(Self { entries: Mutex::new(HashMap::new()), flush_tx });

        let weak = std::sync::Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(request_id) = flush_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.flush(&request_id, &store);
            }
        });

        manager
    }

    pub fn insert(self: &std::sync::Arc<Self>, request_id: String, entry: DebugEntry) {
        self.entries.lock().expect("debug manager lock poisoned").insert(request_id.clone(), entry);

        let tx = self.flush_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5 * 60)).await;
            let _ = tx.send(request_id);
        });
    }

    /// Flushes a single entry immediately — called when a dispatch completes
    /// normally rather than waiting on the 5-minute auto-flush timer.
    pub fn flush_now(&self, request_id: &str) {
        let _ = self.flush_tx.send(request_id.to_string());
    }

    fn flush(&self, request_id: &str, store: &std::sync::Arc<dyn crate::store::Store>) {
        let Some(entry) = self.entries.lock().expect("debug manager lock poisoned").remove(request_id) else {
            return;
        };
        if !entry.persist {
            return;
        }
        store.save_debug_log(crate::store::DebugLogRow {
            request_id: request_id.to_string(),
            raw_request: entry.raw_request,
            transformed_request: entry.transformed_request,
            raw_response: entry.raw_response,
            transformed_response: entry.transformed_response,
            raw_response_snapshot: entry.raw_response_snapshot,
            transformed_response_snapshot: entry.transformed_response_snapshot,
            created_at: chrono::Utc::now(),
        });
    }
}
