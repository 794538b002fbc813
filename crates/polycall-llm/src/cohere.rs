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
// Native message types (v2 chat)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum CohereMessage {
    System {
        content: CohereContent,
    },
    User {
        content: CohereContent,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        content: Field<CohereContent>,
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        tool_calls: Field<Vec<CohereToolCall>>,
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        tool_plan: Field<String>,
    },
    Tool {
        tool_call_id: String,
        content: CohereContent,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CohereContent {
    Text(String),
    Blocks(Vec<CohereBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CohereBlock {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohereToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: CohereFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohereFunction {
    pub name: String,
    pub arguments: String,
}

fn function_kind() -> String {
    "function".into()
}

impl CohereContent {
    fn text(&self) -> String {
        match self {
            CohereContent::Text(text) => text.clone(),
            CohereContent::Blocks(blocks) => blocks
                .iter()
                .map(|CohereBlock::Text { text }| text.as_str())
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// CohereAdapter
// ---------------------------------------------------------------------------

/// Cohere v2 chat. Text only.
#[derive(Debug, Clone, Default)]
pub struct CohereAdapter;

impl CohereAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn text_only(message: &Message) -> Result<String> {
    match message
        .content
        .iter()
        .find(|part| !matches!(part, ContentPart::Text { .. }))
    {
        Some(part) => Err(unsupported(Provider::Cohere, part, message.role)),
        None => Ok(message.text()),
    }
}

impl MessageConverter for CohereAdapter {
    type Native = CohereMessage;

    fn convert_message(&self, message: &Message) -> Result<Vec<CohereMessage>> {
        match message.role {
            Role::System => Ok(vec![CohereMessage::System {
                content: CohereContent::Text(text_only(message)?),
            }]),
            Role::User => Ok(vec![CohereMessage::User {
                content: CohereContent::Text(text_only(message)?),
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
                        } => calls.push(CohereToolCall {
                            id: id.clone(),
                            kind: function_kind(),
                            function: CohereFunction {
                                name: name.clone(),
                                arguments: arguments.to_string(),
                            },
                        }),
                        other => return Err(unsupported(Provider::Cohere, other, Role::Assistant)),
                    }
                }
                Ok(vec![CohereMessage::Assistant {
                    content: if text.is_empty() && !calls.is_empty() {
                        Field::Absent
                    } else {
                        Field::Value(CohereContent::Text(text))
                    },
                    tool_calls: if calls.is_empty() {
                        Field::Absent
                    } else {
                        Field::Value(calls)
                    },
                    tool_plan: Field::Absent,
                }])
            }
            Role::Tool => message
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::ToolResult { id, content } => Ok(CohereMessage::Tool {
                        tool_call_id: id.clone(),
                        content: CohereContent::Text(content.clone()),
                    }),
                    other => Err(unsupported(Provider::Cohere, other, Role::Tool)),
                })
                .collect(),
        }
    }

    fn from_native(&self, native: &CohereMessage) -> Result<Message> {
        Ok(match native {
            CohereMessage::System { content } => Message::system(content.text()),
            CohereMessage::User { content } => Message::user(content.text()),
            CohereMessage::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut parts = Vec::new();
                if let Some(text) = content.as_option().map(CohereContent::text) {
                    if !text.is_empty() {
                        parts.push(ContentPart::text(text));
                    }
                }
                for call in tool_calls.as_option().into_iter().flatten() {
                    parts.push(ContentPart::ToolCall {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments: parse_arguments(&call.function.arguments),
                    });
                }
                Message::new(Role::Assistant, parts)
            }
            CohereMessage::Tool {
                tool_call_id,
                content,
            } => Message::tool_result(tool_call_id.clone(), content.text()),
        })
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::MaxTokens,
        "STOP_SEQUENCE" => FinishReason::StopSequence,
        "TOOL_CALL" => FinishReason::ToolUse,
        "ERROR" | "ERROR_TOXIC" | "ERROR_LIMIT" => FinishReason::Error,
        _ => FinishReason::EndTurn,
    }
}

/// `tokens` carries the raw counts; `billed_units` is the fallback.
fn parse_usage(usage: &Value) -> Option<Usage> {
    let counts = [&usage["tokens"], &usage["billed_units"]]
        .into_iter()
        .find(|c| c.is_object())?;
    Some(Usage::new(
        counts["input_tokens"].as_f64().unwrap_or(0.0) as u64,
        counts["output_tokens"].as_f64().unwrap_or(0.0) as u64,
    ))
}

impl ProviderAdapter for CohereAdapter {
    fn provider(&self) -> Provider {
        Provider::Cohere
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tool_slots: 64,
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
        // 1. Messages
        let params = decode_native::<CohereMessage>(Provider::Cohere, &request.messages)?;
        let messages = self.to_vendor(params)?;
        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });

        // 2. Generation parameters
        let p = &request.params;
        if let Some(t) = p.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = p.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(top_p) = p.top_p {
            body["p"] = json!(top_p);
        }
        if !p.stop.is_empty() {
            body["stop_sequences"] = json!(p.stop);
        }
        if let Some(seed) = p.seed {
            body["seed"] = json!(seed);
        }

        // 3. Tools. Cohere cannot force one named tool, so a specific choice
        //    is sent as REQUIRED.
        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| self.tool_schema(t))
                .collect::<Vec<_>>());
            match &request.tool_choice {
                Some(ToolChoice::Required) | Some(ToolChoice::Specific(_)) => {
                    body["tool_choice"] = json!("REQUIRED");
                }
                Some(ToolChoice::None) => body["tool_choice"] = json!("NONE"),
                Some(ToolChoice::Auto) | None => {}
            }
        }

        // 4. JSON mode
        if request.json_mode {
            body["response_format"] = match &request.response_format {
                Some(format) => json!({ "type": "json_object", "json_schema": format.schema }),
                None => json!({ "type": "json_object" }),
            };
        }

        if request.stream {
            body["stream"] = json!(true);
        }
        p.apply_extra(&mut body);
        Ok(body)
    }

    fn parse_response(&self, raw: &Value) -> Result<VendorOutput> {
        if raw["message"].is_null() {
            return Err(PolycallError::Other("cohere response has no message".into()));
        }
        let native: CohereMessage = serde_json::from_value(raw["message"].clone())?;
        Ok(VendorOutput {
            id: raw["id"].as_str().map(String::from),
            model: None,
            message: self.from_native(&native)?,
            finish_reasons: raw["finish_reason"]
                .as_str()
                .map(map_finish_reason)
                .into_iter()
                .collect(),
            usage: parse_usage(&raw["usage"]).unwrap_or_default(),
        })
    }

    fn parse_chunk(&self, raw: &Value) -> Result<Vec<StreamDelta>> {
        let message = &raw["delta"]["message"];
        let index = raw["index"].as_u64().unwrap_or(0) as usize;
        let mut deltas = Vec::new();
        match raw["type"].as_str().unwrap_or("") {
            "message-start" => deltas.push(StreamDelta::Metadata {
                id: raw["id"].as_str().map(String::from),
                model: None,
            }),
            "content-delta" => {
                if let Some(text) = message["content"]["text"].as_str() {
                    deltas.push(StreamDelta::Text(text.to_string()));
                }
            }
            "tool-call-start" => {
                let call = &message["tool_calls"];
                deltas.push(StreamDelta::ToolCallStart {
                    index,
                    id: call["id"].as_str().unwrap_or("").to_string(),
                    name: call["function"]["name"].as_str().unwrap_or("").to_string(),
                });
                if let Some(fragment) = call["function"]["arguments"]
                    .as_str()
                    .filter(|f| !f.is_empty())
                {
                    deltas.push(StreamDelta::ToolCallArguments {
                        index,
                        fragment: fragment.to_string(),
                    });
                }
            }
            "tool-call-delta" => {
                if let Some(fragment) = message["tool_calls"]["function"]["arguments"].as_str() {
                    deltas.push(StreamDelta::ToolCallArguments {
                        index,
                        fragment: fragment.to_string(),
                    });
                }
            }
            "message-end" => {
                if let Some(reason) = raw["delta"]["finish_reason"].as_str() {
                    deltas.push(StreamDelta::Finish(map_finish_reason(reason)));
                }
                if let Some(usage) = parse_usage(&raw["delta"]["usage"]) {
                    deltas.push(StreamDelta::Usage(usage));
                }
            }
            // tool-plan-delta, content-start/end, tool-call-end
            _ => {}
        }
        Ok(deltas)
    }

    fn default_base_url(&self) -> String {
        "https://api.cohere.com/v2".into()
    }

    fn endpoint(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        format!("{base_url}/chat")
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        vec![("authorization", format!("Bearer {api_key}"))]
    }

    fn api_key_env(&self) -> &'static str {
        "CO_API_KEY"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
