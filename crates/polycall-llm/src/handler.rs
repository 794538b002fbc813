use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::response::CallResponse;
use crate::setup::PreparedCall;
use crate::stream::CallResponseChunk;

// ---------------------------------------------------------------------------
// CallHandler
// ---------------------------------------------------------------------------

/// Observer hooks around a call. Every hook defaults to a no-op; the async
/// variants default to the blocking ones.
#[async_trait]
pub trait CallHandler: Send + Sync {
    fn before_call(&self, _call: &PreparedCall) {}
    fn handle_call_response(&self, _call: &PreparedCall, _response: &CallResponse) {}
    fn handle_stream(&self, _call: &PreparedCall, _chunk: &CallResponseChunk) {}
    /// Sees the validated JSON of an extracted response model.
    fn handle_response_model(&self, _call: &PreparedCall, _value: &Value) {}

    async fn before_call_async(&self, call: &PreparedCall) {
        self.before_call(call);
    }

    async fn handle_call_response_async(&self, call: &PreparedCall, response: &CallResponse) {
        self.handle_call_response(call, response);
    }

    async fn handle_stream_async(&self, call: &PreparedCall, chunk: &CallResponseChunk) {
        self.handle_stream(call, chunk);
    }

    async fn handle_response_model_async(&self, call: &PreparedCall, value: &Value) {
        self.handle_response_model(call, value);
    }
}

// ---------------------------------------------------------------------------
// Built-in handler: LoggingHandler
// ---------------------------------------------------------------------------

pub struct LoggingHandler;

impl CallHandler for LoggingHandler {
    fn before_call(&self, call: &PreparedCall) {
        tracing::info!(
            provider = %call.request.provider,
            model = %call.request.model,
            messages = call.request.messages.len(),
            tools = call.registry.len(),
            stream = call.request.stream,
            "LLM request"
        );
    }

    fn handle_call_response(&self, _call: &PreparedCall, response: &CallResponse) {
        tracing::info!(
            provider = %response.provider,
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            finish = ?response.finish_reason(),
            tool_calls = response.tool_calls.len(),
            duration_ms = response.duration_ms(),
            "LLM response"
        );
    }

    fn handle_response_model(&self, call: &PreparedCall, value: &Value) {
        tracing::debug!(model = %call.request.model, %value, "extracted response model");
    }
}

// ---------------------------------------------------------------------------
// Built-in handler: UsageTracker
// ---------------------------------------------------------------------------

/// Accumulates token usage across calls. Clones share the same counters.
#[derive(Clone, Default)]
pub struct UsageTracker {
    total_input: Arc<AtomicU64>,
    total_output: Arc<AtomicU64>,
    calls: Arc<AtomicU64>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.total_input.load(Ordering::Relaxed)
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.total_output.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl CallHandler for UsageTracker {
    fn before_call(&self, _call: &PreparedCall) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_call_response(&self, _call: &PreparedCall, response: &CallResponse) {
        self.total_input
            .fetch_add(response.usage.input_tokens, Ordering::Relaxed);
        self.total_output
            .fetch_add(response.usage.output_tokens, Ordering::Relaxed);
    }

    // Streams report usage in chunks; vendors send either a single final
    // figure or per-chunk increments, so sum what arrives.
    fn handle_stream(&self, _call: &PreparedCall, chunk: &CallResponseChunk) {
        if let Some(usage) = chunk.usage() {
            self.total_input
                .fetch_add(usage.input_tokens, Ordering::Relaxed);
            self.total_output
                .fetch_add(usage.output_tokens, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
