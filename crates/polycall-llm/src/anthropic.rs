use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::provider::{
    decode_base64, decode_native, encode_base64, split_system, unsupported, Capabilities,
    MergePolicy, MessageConverter, ProviderAdapter, VendorOutput,
};
use crate::setup::CallRequest;
use crate::stream::StreamDelta;
use crate::{
    ContentPart, Field, FinishReason, Message, Provider, Role, ToolChoice, ToolDefinition, Usage,
};
use polycall_types::{PolycallError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

// ---------------------------------------------------------------------------
// Native message types (Messages API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnthropicRole {
    User,
    Assistant,
    /// Client-side only: lifted into the top-level `system` field when the
    /// request is built.
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: AnthropicRole,
    pub content: AnthropicContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        content: Field<AnthropicContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

impl AnthropicContent {
    fn text(&self) -> String {
        match self {
            AnthropicContent::Text(text) => text.clone(),
            AnthropicContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    AnthropicBlock::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    fn blocks(&self) -> Vec<AnthropicBlock> {
        match self {
            AnthropicContent::Text(text) => vec![text_block(text.clone())],
            AnthropicContent::Blocks(blocks) => blocks.clone(),
        }
    }
}

fn allowed_in(role: Role, part: &ContentPart) -> bool {
    match role {
        Role::System => matches!(part, ContentPart::Text { .. }),
        Role::User => matches!(
            part,
            ContentPart::Text { .. } | ContentPart::Image { .. } | ContentPart::ToolResult { .. }
        ),
        Role::Assistant => matches!(part, ContentPart::Text { .. } | ContentPart::ToolCall { .. }),
        Role::Tool => matches!(part, ContentPart::ToolResult { .. }),
    }
}

fn text_block(text: String) -> AnthropicBlock {
    AnthropicBlock::Text {
        text,
        cache_control: None,
    }
}

// ---------------------------------------------------------------------------
// AnthropicAdapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl MessageConverter for AnthropicAdapter {
    type Native = AnthropicMessage;

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::ConsecutiveSameRole
    }

    fn convert_message(&self, message: &Message) -> Result<Vec<AnthropicMessage>> {
        let provider = Provider::Anthropic;
        let role = match message.role {
            Role::Assistant => AnthropicRole::Assistant,
            Role::System => AnthropicRole::System,
            Role::User | Role::Tool => AnthropicRole::User,
        };

        let mut blocks = Vec::with_capacity(message.content.len());
        for part in &message.content {
            if !allowed_in(message.role, part) {
                return Err(unsupported(provider, part, message.role));
            }
            blocks.push(match part {
                ContentPart::Text { text } => text_block(text.clone()),
                ContentPart::Image {
                    media_type, data, ..
                } => {
                    if !IMAGE_TYPES.contains(&media_type.as_str()) {
                        return Err(unsupported(provider, part, message.role));
                    }
                    AnthropicBlock::Image {
                        source: ImageSource::Base64 {
                            media_type: media_type.clone(),
                            data: encode_base64(data),
                        },
                    }
                }
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => AnthropicBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: arguments.clone(),
                },
                ContentPart::ToolResult { id, content } => AnthropicBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: Field::Value(AnthropicContent::Text(content.clone())),
                    is_error: None,
                },
                ContentPart::Audio { .. } => return Err(unsupported(provider, part, message.role)),
            });
        }
        Ok(vec![AnthropicMessage {
            role,
            content: AnthropicContent::Blocks(blocks),
        }])
    }

    fn from_native(&self, native: &AnthropicMessage) -> Result<Message> {
        let blocks = native.content.blocks();
        let all_results = !blocks.is_empty()
            && blocks
                .iter()
                .all(|b| matches!(b, AnthropicBlock::ToolResult { .. }));
        let role = match native.role {
            AnthropicRole::Assistant => Role::Assistant,
            AnthropicRole::System => Role::System,
            AnthropicRole::User if all_results => Role::Tool,
            AnthropicRole::User => Role::User,
        };

        let mut parts = Vec::with_capacity(blocks.len());
        for block in blocks {
            parts.push(match block {
                AnthropicBlock::Text { text, .. } => ContentPart::text(text),
                AnthropicBlock::Image { source } => match source {
                    ImageSource::Base64 { media_type, data } => ContentPart::Image {
                        media_type,
                        data: decode_base64(Provider::Anthropic, &data)?,
                        detail: None,
                    },
                    ImageSource::Url { url } => {
                        return Err(PolycallError::Other(format!(
                            "anthropic image source is a URL and cannot be inlined: {url}"
                        )))
                    }
                },
                AnthropicBlock::ToolUse { id, name, input } => ContentPart::ToolCall {
                    id,
                    name,
                    arguments: input,
                },
                AnthropicBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => ContentPart::ToolResult {
                    id: tool_use_id,
                    content: content.as_option().map(AnthropicContent::text).unwrap_or_default(),
                },
            });
        }
        Ok(Message::new(role, parts))
    }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::MaxTokens,
        "stop_sequence" => FinishReason::StopSequence,
        "tool_use" => FinishReason::ToolUse,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::EndTurn,
    }
}

fn parse_usage(usage: &Value) -> Usage {
    let mut out = Usage::new(
        usage["input_tokens"].as_u64().unwrap_or(0),
        usage["output_tokens"].as_u64().unwrap_or(0),
    );
    out.cache_read_tokens = usage["cache_read_input_tokens"].as_u64();
    out.cache_write_tokens = usage["cache_creation_input_tokens"].as_u64();
    out
}

impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tool_slots: 128,
            strict_schemas: false,
            native_json_mode: false,
        }
    }

    fn tool_schema(&self, tool: &ToolDefinition) -> Value {
        json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.parameters,
        })
    }

    fn build_request(&self, request: &CallRequest) -> Result<Value> {
        // 1. Lift system messages into the top-level field
        let params = decode_native::<AnthropicMessage>(Provider::Anthropic, &request.messages)?;
        let (system, rest) = split_system(Provider::Anthropic, params)?;

        // 2. Convert the remaining turns; native system turns join the
        // top-level field too
        let mut system: Vec<AnthropicBlock> = system.into_iter().map(text_block).collect();
        let mut messages = Vec::new();
        for message in self.to_vendor(rest)? {
            if message.role == AnthropicRole::System {
                system.extend(message.content.blocks());
            } else {
                messages.push(message);
            }
        }

        // 3. Build body
        let p = &request.params;
        let mut body = json!({
            "model": request.model,
            "max_tokens": p.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(t) = p.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(top_p) = p.top_p {
            body["top_p"] = json!(top_p);
        }
        if !p.stop.is_empty() {
            body["stop_sequences"] = json!(p.stop);
        }
        if p.seed.is_some() {
            tracing::debug!("anthropic has no seed parameter; ignoring it");
        }

        // 4. Tools
        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| self.tool_schema(t))
                .collect::<Vec<_>>());
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => json!({ "type": "auto" }),
                    ToolChoice::None => json!({ "type": "none" }),
                    ToolChoice::Required => json!({ "type": "any" }),
                    ToolChoice::Specific(name) => json!({ "type": "tool", "name": name }),
                };
            }
        }

        if request.stream {
            body["stream"] = json!(true);
        }
        p.apply_extra(&mut body);
        Ok(body)
    }

    fn parse_response(&self, raw: &Value) -> Result<VendorOutput> {
        let mut parts = Vec::new();
        for block in raw["content"].as_array().into_iter().flatten() {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(t) = block["text"].as_str() {
                        parts.push(ContentPart::text(t));
                    }
                }
                Some("tool_use") => parts.push(ContentPart::ToolCall {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: block["input"].clone(),
                }),
                other => tracing::debug!(block = ?other, "skipping anthropic content block"),
            }
        }

        Ok(VendorOutput {
            id: raw["id"].as_str().map(String::from),
            model: raw["model"].as_str().map(String::from),
            message: Message::new(Role::Assistant, parts),
            finish_reasons: raw["stop_reason"]
                .as_str()
                .map(map_stop_reason)
                .into_iter()
                .collect(),
            usage: parse_usage(&raw["usage"]),
        })
    }

    fn parse_chunk(&self, raw: &Value) -> Result<Vec<StreamDelta>> {
        let mut deltas = Vec::new();
        match raw["type"].as_str() {
            Some("message_start") => {
                let message = &raw["message"];
                deltas.push(StreamDelta::Metadata {
                    id: message["id"].as_str().map(String::from),
                    model: message["model"].as_str().map(String::from),
                });
                // Output tokens arrive with message_delta.
                let mut usage = parse_usage(&message["usage"]);
                usage.output_tokens = 0;
                usage.total_tokens = usage.input_tokens;
                deltas.push(StreamDelta::Usage(usage));
            }
            Some("content_block_start") => {
                let index = raw["index"].as_u64().unwrap_or(0) as usize;
                let block = &raw["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => deltas.push(StreamDelta::ToolCallStart {
                        index,
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                    }),
                    Some("text") => {
                        if let Some(t) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            deltas.push(StreamDelta::Text(t.to_string()));
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_delta") => {
                let index = raw["index"].as_u64().unwrap_or(0) as usize;
                let delta = &raw["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(t) = delta["text"].as_str() {
                            deltas.push(StreamDelta::Text(t.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(f) = delta["partial_json"].as_str().filter(|f| !f.is_empty()) {
                            deltas.push(StreamDelta::ToolCallArguments {
                                index,
                                fragment: f.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Some("message_delta") => {
                if let Some(reason) = raw["delta"]["stop_reason"].as_str() {
                    deltas.push(StreamDelta::Finish(map_stop_reason(reason)));
                }
                if let Some(output) = raw["usage"]["output_tokens"].as_u64() {
                    deltas.push(StreamDelta::Usage(Usage::new(0, output)));
                }
            }
            Some("error") => {
                let error = &raw["error"];
                return Err(PolycallError::ProviderError {
                    provider: "anthropic".into(),
                    status: 0,
                    message: error["message"].as_str().unwrap_or("stream error").to_string(),
                    retryable: error["type"] == "overloaded_error",
                });
            }
            _ => {}
        }
        Ok(deltas)
    }

    fn default_base_url(&self) -> String {
        "https://api.anthropic.com".into()
    }

    fn endpoint(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        format!("{base_url}/v1/messages")
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", api_key.to_string()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ]
    }

    fn api_key_env(&self) -> &'static str {
        "ANTHROPIC_API_KEY"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
