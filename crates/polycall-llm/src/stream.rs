use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;

use crate::handler::CallHandler;
use crate::invoke::{ChunkIter, ChunkStream};
use crate::partial_json::parse_partial;
use crate::response::CallResponse;
use crate::setup::PreparedCall;
use crate::tool::ToolInstance;
use crate::{
    ContentPart, FinishReason, Message, Provider, ProviderAdapter, Role, ToolCallData, Usage,
    VendorOutput,
};
use polycall_types::{PolycallError, Result};

// ---------------------------------------------------------------------------
// StreamDelta
// ---------------------------------------------------------------------------

/// One normalized increment decoded from a vendor stream chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Metadata {
        id: Option<String>,
        model: Option<String>,
    },
    Text(String),
    /// A tool call begins at `index`. Arguments follow as fragments.
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallArguments {
        index: usize,
        fragment: String,
    },
    /// A tool call delivered whole in one chunk.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    Usage(Usage),
    Finish(FinishReason),
}

// ---------------------------------------------------------------------------
// PartialResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Everything a stream has delivered so far. Text is appended, tool-call
/// argument fragments are appended per call index, and usage is folded in.
#[derive(Debug, Clone, Default)]
pub struct PartialResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    text: String,
    tool_calls: BTreeMap<usize, ToolCallFragment>,
    open_call: Option<usize>,
    usage: Usage,
    finish_reasons: Vec<FinishReason>,
}

impl PartialResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta in. Returns the indices of tool calls that the delta
    /// closed: a call is complete once a different call starts.
    pub fn apply(&mut self, delta: StreamDelta) -> Vec<usize> {
        let mut closed = Vec::new();
        match delta {
            StreamDelta::Metadata { id, model } => {
                if self.id.is_none() {
                    self.id = id;
                }
                if self.model.is_none() {
                    self.model = model;
                }
            }
            StreamDelta::Text(text) => self.text.push_str(&text),
            StreamDelta::ToolCallStart { index, id, name } => {
                if let Some(open) = self.open_call.filter(|&open| open != index) {
                    closed.push(open);
                }
                self.open_call = Some(index);
                let fragment = self.tool_calls.entry(index).or_default();
                if !id.is_empty() {
                    fragment.id = id;
                }
                if !name.is_empty() {
                    fragment.name = name;
                }
            }
            StreamDelta::ToolCallArguments { index, fragment } => {
                self.tool_calls
                    .entry(index)
                    .or_default()
                    .arguments
                    .push_str(&fragment);
            }
            StreamDelta::ToolCall {
                id,
                name,
                arguments,
            } => {
                if let Some(open) = self.open_call.take() {
                    closed.push(open);
                }
                let index = self
                    .tool_calls
                    .keys()
                    .next_back()
                    .map_or(0, |last| last + 1);
                self.tool_calls.insert(
                    index,
                    ToolCallFragment {
                        id,
                        name,
                        arguments,
                    },
                );
                closed.push(index);
            }
            StreamDelta::Usage(usage) => self.usage.absorb(&usage),
            StreamDelta::Finish(reason) => {
                if let Some(open) = self.open_call.take() {
                    closed.push(open);
                }
                self.finish_reasons.push(reason);
            }
        }
        closed
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (usize, &ToolCallFragment)> {
        self.tool_calls.iter().map(|(i, f)| (*i, f))
    }

    pub fn fragment(&self, index: usize) -> Option<&ToolCallFragment> {
        self.tool_calls.get(&index)
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn finish_reasons(&self) -> &[FinishReason] {
        &self.finish_reasons
    }

    /// Lenient view of a call's arguments so far. Never fails.
    pub fn partial_arguments(&self, index: usize) -> Option<Value> {
        parse_partial(&self.tool_calls.get(&index)?.arguments)
    }

    /// Strict parse of a finished call's arguments.
    pub fn finish_tool_call(&self, provider: Provider, index: usize) -> Result<ToolCallData> {
        let fragment =
            self.tool_calls
                .get(&index)
                .ok_or_else(|| PolycallError::MalformedToolCall {
                    provider: provider.as_str().into(),
                    index,
                    buffer: String::new(),
                })?;
        let arguments = if fragment.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&fragment.arguments).map_err(|_| {
                PolycallError::MalformedToolCall {
                    provider: provider.as_str().into(),
                    index,
                    buffer: fragment.arguments.clone(),
                }
            })?
        };
        Ok(ToolCallData {
            id: fragment.id.clone(),
            name: fragment.name.clone(),
            arguments,
        })
    }

    /// The assistant message the stream amounts to. Fails if any tool call's
    /// accumulated arguments are not valid JSON.
    pub fn to_message(&self, provider: Provider) -> Result<Message> {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentPart::text(self.text.clone()));
        }
        for index in self.tool_calls.keys() {
            let call = self.finish_tool_call(provider, *index)?;
            content.push(ContentPart::ToolCall {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            });
        }
        Ok(Message::new(Role::Assistant, content))
    }
}

// ---------------------------------------------------------------------------
// CallResponseChunk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CallResponseChunk {
    pub raw: Value,
    pub deltas: Vec<StreamDelta>,
    /// Tool calls that finished streaming in this chunk and validated.
    pub tools: Vec<ToolInstance>,
}

impl CallResponseChunk {
    pub fn content(&self) -> String {
        self.deltas
            .iter()
            .filter_map(|d| match d {
                StreamDelta::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.deltas.iter().find_map(|d| match d {
            StreamDelta::Finish(r) => Some(*r),
            _ => None,
        })
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.deltas.iter().find_map(|d| match d {
            StreamDelta::Usage(u) => Some(u),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// StreamState (shared by the blocking and async streams)
// ---------------------------------------------------------------------------

struct StreamState {
    call: PreparedCall,
    adapter: Arc<dyn ProviderAdapter>,
    partial: PartialResponse,
    raw_chunks: Vec<Value>,
    start_time: DateTime<Utc>,
}

impl StreamState {
    fn new(call: PreparedCall, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            call,
            adapter,
            partial: PartialResponse::new(),
            raw_chunks: Vec::new(),
            start_time: Utc::now(),
        }
    }

    fn absorb(&mut self, raw: Value) -> Result<CallResponseChunk> {
        let provider = self.adapter.provider();
        let deltas = self.adapter.parse_chunk(&raw)?;
        let mut tools = Vec::new();
        for delta in &deltas {
            for index in self.partial.apply(delta.clone()) {
                // Failures here resurface when the stream finishes.
                let Ok(data) = self.partial.finish_tool_call(provider, index) else {
                    continue;
                };
                match self.call.registry.materialize(provider, &data) {
                    Ok(instance) => tools.push(instance),
                    Err(e) => tracing::debug!(index, error = %e, "streamed tool call not usable yet"),
                }
            }
        }
        self.raw_chunks.push(raw.clone());
        Ok(CallResponseChunk { raw, deltas, tools })
    }

    fn finish(&mut self) -> Result<CallResponse> {
        let provider = self.adapter.provider();
        let output = VendorOutput {
            id: self.partial.id.clone(),
            model: self.partial.model.clone(),
            message: self.partial.to_message(provider)?,
            finish_reasons: self.partial.finish_reasons.clone(),
            usage: self.partial.usage.clone(),
        };
        CallResponse::from_output(
            &self.call,
            output,
            Value::Array(std::mem::take(&mut self.raw_chunks)),
            self.start_time,
        )
    }
}

// ---------------------------------------------------------------------------
// CallStream (blocking)
// ---------------------------------------------------------------------------

/// Blocking stream of response chunks. Iterate for chunks, then call
/// [`CallStream::finish`] for the assembled response.
pub struct CallStream {
    chunks: ChunkIter,
    state: StreamState,
    handlers: Vec<Arc<dyn CallHandler>>,
    done: bool,
}

impl CallStream {
    pub(crate) fn new(
        call: PreparedCall,
        adapter: Arc<dyn ProviderAdapter>,
        chunks: ChunkIter,
        handlers: Vec<Arc<dyn CallHandler>>,
    ) -> Self {
        Self {
            chunks,
            state: StreamState::new(call, adapter),
            handlers,
            done: false,
        }
    }

    pub fn partial(&self) -> &PartialResponse {
        &self.state.partial
    }

    pub fn call(&self) -> &PreparedCall {
        &self.state.call
    }

    pub(crate) fn handlers(&self) -> &[Arc<dyn CallHandler>] {
        &self.handlers
    }

    /// Drain any remaining chunks and assemble the final response.
    pub fn finish(mut self) -> Result<CallResponse> {
        for chunk in self.by_ref() {
            chunk?;
        }
        self.state.finish()
    }
}

impl Iterator for CallStream {
    type Item = Result<CallResponseChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.chunks.next() {
            None => {
                self.done = true;
                return None;
            }
            Some(raw) => raw.and_then(|raw| self.state.absorb(raw)),
        };
        match &item {
            Ok(chunk) => {
                for handler in &self.handlers {
                    handler.handle_stream(&self.state.call, chunk);
                }
            }
            Err(_) => self.done = true,
        }
        Some(item)
    }
}

// ---------------------------------------------------------------------------
// AsyncCallStream
// ---------------------------------------------------------------------------

/// Async counterpart of [`CallStream`].
pub struct AsyncCallStream {
    chunks: ChunkStream,
    state: StreamState,
    handlers: Vec<Arc<dyn CallHandler>>,
    done: bool,
}

impl AsyncCallStream {
    pub(crate) fn new(
        call: PreparedCall,
        adapter: Arc<dyn ProviderAdapter>,
        chunks: ChunkStream,
        handlers: Vec<Arc<dyn CallHandler>>,
    ) -> Self {
        Self {
            chunks,
            state: StreamState::new(call, adapter),
            handlers,
            done: false,
        }
    }

    pub fn partial(&self) -> &PartialResponse {
        &self.state.partial
    }

    pub fn call(&self) -> &PreparedCall {
        &self.state.call
    }

    pub(crate) fn handlers(&self) -> &[Arc<dyn CallHandler>] {
        &self.handlers
    }

    /// Next chunk, or `None` once the vendor stream is exhausted.
    pub async fn next_chunk(&mut self) -> Option<Result<CallResponseChunk>> {
        if self.done {
            return None;
        }
        let item = match self.chunks.next().await {
            None => {
                self.done = true;
                return None;
            }
            Some(raw) => raw.and_then(|raw| self.state.absorb(raw)),
        };
        match &item {
            Ok(chunk) => {
                for handler in &self.handlers {
                    handler.handle_stream_async(&self.state.call, chunk).await;
                }
            }
            Err(_) => self.done = true,
        }
        Some(item)
    }

    pub async fn finish(mut self) -> Result<CallResponse> {
        while let Some(chunk) = self.next_chunk().await {
            chunk?;
        }
        self.state.finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
