use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::provider::{
    decode_native, parse_arguments, unsupported, Capabilities, MessageConverter, ProviderAdapter,
    VendorOutput,
};
use crate::setup::CallRequest;
use crate::stream::StreamDelta;
use crate::{
    ContentPart, Field, FinishReason, Message, Provider, Role, ToolChoice, ToolDefinition, Usage,
};
use polycall_types::{PolycallError, Result};

// ---------------------------------------------------------------------------
// Native message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MistralMessage {
    System {
        content: MistralContent,
    },
    User {
        content: MistralContent,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        content: Field<MistralContent>,
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        tool_calls: Field<Vec<MistralToolCall>>,
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        prefix: Field<bool>,
    },
    Tool {
        content: MistralContent,
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        tool_call_id: Field<String>,
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        name: Field<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MistralContent {
    Text(String),
    Chunks(Vec<MistralChunk>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MistralChunk {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MistralToolCall {
    #[serde(default)]
    pub id: String,
    pub function: MistralFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MistralFunction {
    pub name: String,
    /// A JSON string on the wire; requests may also carry an object.
    pub arguments: Value,
}

impl MistralContent {
    fn text(&self) -> String {
        match self {
            MistralContent::Text(text) => text.clone(),
            MistralContent::Chunks(chunks) => chunks
                .iter()
                .map(|MistralChunk::Text { text }| text.as_str())
                .collect(),
        }
    }
}

fn arguments_value(arguments: &Value) -> Value {
    match arguments {
        Value::String(raw) => parse_arguments(raw),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// MistralAdapter
// ---------------------------------------------------------------------------

/// Mistral chat completions. Text only: images and audio are rejected.
#[derive(Debug, Clone, Default)]
pub struct MistralAdapter;

impl MistralAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn text_only(message: &Message) -> Result<String> {
    for part in &message.content {
        if !matches!(part, ContentPart::Text { .. }) {
            return Err(unsupported(Provider::Mistral, part, message.role));
        }
    }
    Ok(message.text())
}

impl MessageConverter for MistralAdapter {
    type Native = MistralMessage;

    fn convert_message(&self, message: &Message) -> Result<Vec<MistralMessage>> {
        match message.role {
            Role::System => Ok(vec![MistralMessage::System {
                content: MistralContent::Text(text_only(message)?),
            }]),
            Role::User => Ok(vec![MistralMessage::User {
                content: MistralContent::Text(text_only(message)?),
            }]),
            Role::Assistant => {
                let mut text = String::new();
                let mut calls = Vec::new();
                for part in &message.content {
                    match part {
                        ContentPart::Text { text: t } => text.push_str(t),
                        ContentPart::ToolCall {
                            id,
                            name,
                            arguments,
                        } => calls.push(MistralToolCall {
                            id: id.clone(),
                            function: MistralFunction {
                                name: name.clone(),
                                arguments: Value::String(arguments.to_string()),
                            },
                        }),
                        other => return Err(unsupported(Provider::Mistral, other, Role::Assistant)),
                    }
                }
                Ok(vec![MistralMessage::Assistant {
                    content: if text.is_empty() && !calls.is_empty() {
                        Field::Absent
                    } else {
                        Field::Value(MistralContent::Text(text))
                    },
                    tool_calls: if calls.is_empty() {
                        Field::Absent
                    } else {
                        Field::Value(calls)
                    },
                    prefix: Field::Absent,
                }])
            }
            Role::Tool => message
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => Ok(MistralMessage::Tool {
                        content: MistralContent::Text(text.clone()),
                        tool_call_id: Field::Absent,
                        name: Field::Absent,
                    }),
                    ContentPart::ToolResult { id, content } => Ok(MistralMessage::Tool {
                        content: MistralContent::Text(content.clone()),
                        tool_call_id: if id.is_empty() {
                            Field::Absent
                        } else {
                            Field::Value(id.clone())
                        },
                        name: Field::Absent,
                    }),
                    other => Err(unsupported(Provider::Mistral, other, Role::Tool)),
                })
                .collect(),
        }
    }

    fn from_native(&self, native: &MistralMessage) -> Result<Message> {
        Ok(match native {
            MistralMessage::System { content } => Message::system(content.text()),
            MistralMessage::User { content } => Message::user(content.text()),
            MistralMessage::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut parts = Vec::new();
                if let Some(text) = content.as_option().map(MistralContent::text) {
                    if !text.is_empty() {
                        parts.push(ContentPart::text(text));
                    }
                }
                for call in tool_calls.as_option().into_iter().flatten() {
                    parts.push(ContentPart::ToolCall {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments: arguments_value(&call.function.arguments),
                    });
                }
                Message::new(Role::Assistant, parts)
            }
            MistralMessage::Tool {
                content,
                tool_call_id,
                ..
            } => match tool_call_id.as_option() {
                Some(id) => Message::tool_result(id.clone(), content.text()),
                None => Message::new(Role::Tool, vec![ContentPart::text(content.text())]),
            },
        })
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" | "model_length" => FinishReason::MaxTokens,
        "tool_calls" => FinishReason::ToolUse,
        "error" => FinishReason::Error,
        _ => FinishReason::EndTurn,
    }
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    Some(Usage::new(
        usage["prompt_tokens"].as_u64().unwrap_or(0),
        usage["completion_tokens"].as_u64().unwrap_or(0),
    ))
}

impl ProviderAdapter for MistralAdapter {
    fn provider(&self) -> Provider {
        Provider::Mistral
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tool_slots: 128,
            strict_schemas: false,
            native_json_mode: true,
        }
    }

    fn tool_schema(&self, tool: &ToolDefinition) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        })
    }

    fn build_request(&self, request: &CallRequest) -> Result<Value> {
        let params = decode_native::<MistralMessage>(Provider::Mistral, &request.messages)?;
        let messages = self.to_vendor(params)?;
        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });

        let p = &request.params;
        if let Some(t) = p.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = p.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(top_p) = p.top_p {
            body["top_p"] = json!(top_p);
        }
        if !p.stop.is_empty() {
            body["stop"] = json!(p.stop);
        }
        if let Some(seed) = p.seed {
            body["random_seed"] = json!(seed);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| self.tool_schema(t))
                .collect::<Vec<_>>());
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => json!("auto"),
                    ToolChoice::None => json!("none"),
                    ToolChoice::Required => json!("any"),
                    ToolChoice::Specific(name) => {
                        json!({ "type": "function", "function": { "name": name } })
                    }
                };
            }
        }

        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        if request.stream {
            body["stream"] = json!(true);
        }
        p.apply_extra(&mut body);
        Ok(body)
    }

    fn parse_response(&self, raw: &Value) -> Result<VendorOutput> {
        let choices = raw["choices"].as_array().cloned().unwrap_or_default();
        let first = choices
            .first()
            .ok_or_else(|| PolycallError::Other("mistral response has no choices".into()))?;
        let native: MistralMessage = serde_json::from_value(first["message"].clone())?;
        Ok(VendorOutput {
            id: raw["id"].as_str().map(String::from),
            model: raw["model"].as_str().map(String::from),
            message: self.from_native(&native)?,
            finish_reasons: choices
                .iter()
                .filter_map(|c| c["finish_reason"].as_str())
                .map(map_finish_reason)
                .collect(),
            usage: parse_usage(&raw["usage"]).unwrap_or_default(),
        })
    }

    fn parse_chunk(&self, raw: &Value) -> Result<Vec<StreamDelta>> {
        let mut deltas = Vec::new();
        if raw.get("id").is_some() || raw.get("model").is_some() {
            deltas.push(StreamDelta::Metadata {
                id: raw["id"].as_str().map(String::from),
                model: raw["model"].as_str().map(String::from),
            });
        }
        if let Some(choice) = raw["choices"].as_array().and_then(|c| c.first()) {
            let delta = &choice["delta"];
            if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
                deltas.push(StreamDelta::Text(text.to_string()));
            }
            for (position, call) in delta["tool_calls"].as_array().into_iter().flatten().enumerate() {
                let id = call["id"].as_str().unwrap_or("").to_string();
                let name = call["function"]["name"].as_str().unwrap_or("").to_string();
                let fragment = match &call["function"]["arguments"] {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                // Without an index, an id marks a whole call; positions only
                // count within this chunk.
                let index = match call["index"].as_u64() {
                    Some(i) => i as usize,
                    None if !id.is_empty() => {
                        deltas.push(StreamDelta::ToolCall {
                            id,
                            name,
                            arguments: fragment,
                        });
                        continue;
                    }
                    None => position,
                };
                deltas.push(StreamDelta::ToolCallStart { index, id, name });
                if !fragment.is_empty() {
                    deltas.push(StreamDelta::ToolCallArguments { index, fragment });
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                deltas.push(StreamDelta::Finish(map_finish_reason(reason)));
            }
        }
        if let Some(usage) = parse_usage(&raw["usage"]) {
            deltas.push(StreamDelta::Usage(usage));
        }
        Ok(deltas)
    }

    fn default_base_url(&self) -> String {
        "https://api.mistral.ai/v1".into()
    }

    fn endpoint(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        format!("{base_url}/chat/completions")
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        vec![("authorization", format!("Bearer {api_key}"))]
    }

    fn api_key_env(&self) -> &'static str {
        "MISTRAL_API_KEY"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
