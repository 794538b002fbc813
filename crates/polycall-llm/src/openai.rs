use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::provider::{
    decode_base64, decode_native, encode_base64, parse_arguments, unsupported, Capabilities,
    MessageConverter, ProviderAdapter, VendorOutput,
};
use crate::setup::CallRequest;
use crate::stream::StreamDelta;
use crate::tool::strict_schema;
use crate::{
    ContentPart, Field, FinishReason, Message, Provider, Role, ToolChoice, ToolDefinition, Usage,
};
use polycall_types::{PolycallError, Result};

const AZURE_API_VERSION: &str = "2024-10-21";

// ---------------------------------------------------------------------------
// Native message types (Chat Completions)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum OpenAiMessage {
    System {
        content: OpenAiContent,
    },
    User {
        content: OpenAiContent,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        content: Field<OpenAiContent>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<OpenAiToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAiPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
    InputAudio { input_audio: OpenAiInputAudio },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiInputAudio {
    pub data: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: OpenAiFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiFunction {
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

fn function_type() -> String {
    "function".into()
}

impl OpenAiContent {
    fn text(&self) -> String {
        match self {
            OpenAiContent::Text(text) => text.clone(),
            OpenAiContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    OpenAiPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

/// Chat Completions adapter, shared by OpenAI, Azure OpenAI and Groq.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    provider: Provider,
    strict_tools: bool,
}

impl OpenAiAdapter {
    pub fn openai() -> Self {
        Self {
            provider: Provider::OpenAi,
            strict_tools: true,
        }
    }

    pub fn azure() -> Self {
        Self {
            provider: Provider::Azure,
            strict_tools: true,
        }
    }

    /// Groq speaks the same protocol but rejects strict schemas.
    pub fn groq() -> Self {
        Self {
            provider: Provider::Groq,
            strict_tools: false,
        }
    }
}

fn audio_format(media_type: &str) -> Option<&'static str> {
    match media_type {
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        _ => None,
    }
}

fn parse_data_url(provider: Provider, url: &str) -> Result<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:").ok_or_else(|| {
        PolycallError::Other(format!("{provider} image URL is not a data URL: {url}"))
    })?;
    let (media_type, data) = rest.split_once(";base64,").ok_or_else(|| {
        PolycallError::Other(format!("{provider} image data URL is not base64 encoded"))
    })?;
    Ok((media_type.to_string(), decode_base64(provider, data)?))
}

impl MessageConverter for OpenAiAdapter {
    type Native = OpenAiMessage;

    fn convert_message(&self, message: &Message) -> Result<Vec<OpenAiMessage>> {
        let provider = self.provider;
        match message.role {
            Role::System => {
                for part in &message.content {
                    if !matches!(part, ContentPart::Text { .. }) {
                        return Err(unsupported(provider, part, Role::System));
                    }
                }
                Ok(vec![OpenAiMessage::System {
                    content: OpenAiContent::Text(message.text()),
                }])
            }
            Role::User => {
                if let [ContentPart::Text { text }] = message.content.as_slice() {
                    return Ok(vec![OpenAiMessage::User {
                        content: OpenAiContent::Text(text.clone()),
                    }]);
                }
                let mut parts = Vec::with_capacity(message.content.len());
                for part in &message.content {
                    parts.push(match part {
                        ContentPart::Text { text } => OpenAiPart::Text { text: text.clone() },
                        ContentPart::Image {
                            media_type,
                            data,
                            detail,
                        } => OpenAiPart::ImageUrl {
                            image_url: OpenAiImageUrl {
                                url: format!("data:{media_type};base64,{}", encode_base64(data)),
                                detail: detail.clone(),
                            },
                        },
                        ContentPart::Audio { media_type, data } => {
                            let format = audio_format(media_type)
                                .ok_or_else(|| unsupported(provider, part, Role::User))?;
                            OpenAiPart::InputAudio {
                                input_audio: OpenAiInputAudio {
                                    data: encode_base64(data),
                                    format: format.into(),
                                },
                            }
                        }
                        other => return Err(unsupported(provider, other, Role::User)),
                    });
                }
                Ok(vec![OpenAiMessage::User {
                    content: OpenAiContent::Parts(parts),
                }])
            }
            Role::Assistant => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for part in &message.content {
                    match part {
                        ContentPart::Text { text: t } => text.push_str(t),
                        ContentPart::ToolCall {
                            id,
                            name,
                            arguments,
                        } => tool_calls.push(OpenAiToolCall {
                            id: id.clone(),
                            kind: function_type(),
                            function: OpenAiFunction {
                                name: name.clone(),
                                arguments: arguments.to_string(),
                            },
                        }),
                        other => return Err(unsupported(provider, other, Role::Assistant)),
                    }
                }
                let content = if text.is_empty() && !tool_calls.is_empty() {
                    Field::Null
                } else {
                    Field::Value(OpenAiContent::Text(text))
                };
                Ok(vec![OpenAiMessage::Assistant {
                    content,
                    tool_calls,
                }])
            }
            Role::Tool => message
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::ToolResult { id, content } => Ok(OpenAiMessage::Tool {
                        tool_call_id: id.clone(),
                        content: content.clone(),
                    }),
                    other => Err(unsupported(provider, other, Role::Tool)),
                })
                .collect(),
        }
    }

    fn from_native(&self, native: &OpenAiMessage) -> Result<Message> {
        let provider = self.provider;
        match native {
            OpenAiMessage::System { content } => Ok(Message::system(content.text())),
            OpenAiMessage::User { content } => match content {
                OpenAiContent::Text(text) => Ok(Message::user(text.clone())),
                OpenAiContent::Parts(parts) => {
                    let mut out = Vec::with_capacity(parts.len());
                    for part in parts {
                        out.push(match part {
                            OpenAiPart::Text { text } => ContentPart::text(text.clone()),
                            OpenAiPart::ImageUrl { image_url } => {
                                let (media_type, data) = parse_data_url(provider, &image_url.url)?;
                                ContentPart::Image {
                                    media_type,
                                    data,
                                    detail: image_url.detail.clone(),
                                }
                            }
                            OpenAiPart::InputAudio { input_audio } => ContentPart::Audio {
                                media_type: format!("audio/{}", input_audio.format),
                                data: decode_base64(provider, &input_audio.data)?,
                            },
                        });
                    }
                    Ok(Message::new(Role::User, out))
                }
            },
            OpenAiMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut out = Vec::new();
                if let Some(content) = content.as_option() {
                    let text = content.text();
                    if !text.is_empty() {
                        out.push(ContentPart::text(text));
                    }
                }
                for call in tool_calls {
                    out.push(ContentPart::ToolCall {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments: parse_arguments(&call.function.arguments),
                    });
                }
                Ok(Message::new(Role::Assistant, out))
            }
            OpenAiMessage::Tool {
                tool_call_id,
                content,
            } => Ok(Message::tool_result(tool_call_id.clone(), content.clone())),
        }
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::MaxTokens,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::EndTurn,
    }
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    let mut out = Usage::new(
        usage["prompt_tokens"].as_u64().unwrap_or(0),
        usage["completion_tokens"].as_u64().unwrap_or(0),
    );
    out.cache_read_tokens = usage["prompt_tokens_details"]["cached_tokens"].as_u64();
    Some(out)
}

impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tool_slots: 128,
            strict_schemas: self.strict_tools,
            native_json_mode: true,
        }
    }

    fn tool_schema(&self, tool: &ToolDefinition) -> Value {
        let mut function = json!({
            "name": tool.name,
            "description": tool.description,
        });
        if self.strict_tools {
            function["parameters"] = strict_schema(&tool.parameters);
            function["strict"] = json!(true);
        } else {
            function["parameters"] = tool.parameters.clone();
        }
        json!({ "type": "function", "function": function })
    }

    fn build_request(&self, request: &CallRequest) -> Result<Value> {
        // 1. Messages
        let params = decode_native::<OpenAiMessage>(self.provider, &request.messages)?;
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
            body["top_p"] = json!(top_p);
        }
        if !p.stop.is_empty() {
            body["stop"] = json!(p.stop);
        }
        if let Some(seed) = p.seed {
            body["seed"] = json!(seed);
        }

        // 3. Tools
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request.tools.iter().map(|t| self.tool_schema(t)).collect();
            body["tools"] = json!(tools);
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => json!("auto"),
                    ToolChoice::None => json!("none"),
                    ToolChoice::Required => json!("required"),
                    ToolChoice::Specific(name) => {
                        json!({ "type": "function", "function": { "name": name } })
                    }
                };
            }
        }

        // 4. JSON mode
        if request.json_mode {
            body["response_format"] = match (&request.response_format, self.strict_tools) {
                (Some(format), true) => json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": format.name,
                        "description": format.description,
                        "schema": strict_schema(&format.schema),
                        "strict": true,
                    }
                }),
                _ => json!({ "type": "json_object" }),
            };
        }

        // 5. Streaming
        if request.stream {
            body["stream"] = json!(true);
            if self.provider != Provider::Groq {
                body["stream_options"] = json!({ "include_usage": true });
            }
        }

        p.apply_extra(&mut body);
        Ok(body)
    }

    fn parse_response(&self, raw: &Value) -> Result<VendorOutput> {
        let choices = raw["choices"].as_array().ok_or_else(|| {
            PolycallError::Other(format!("{} response has no choices", self.provider))
        })?;
        let first = choices.first().ok_or_else(|| {
            PolycallError::Other(format!("{} response has no choices", self.provider))
        })?;
        let native: OpenAiMessage = serde_json::from_value(first["message"].clone())?;
        let message = self.from_native(&native)?;

        let finish_reasons = choices
            .iter()
            .filter_map(|c| c["finish_reason"].as_str())
            .map(map_finish_reason)
            .collect();

        Ok(VendorOutput {
            id: raw["id"].as_str().map(String::from),
            model: raw["model"].as_str().map(String::from),
            message,
            finish_reasons,
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
            if let Some(text) = delta["content"].as_str() {
                if !text.is_empty() {
                    deltas.push(StreamDelta::Text(text.to_string()));
                }
            }
            for call in delta["tool_calls"].as_array().into_iter().flatten() {
                let index = call["index"].as_u64().unwrap_or(0) as usize;
                let id = call["id"].as_str().unwrap_or("");
                let name = call["function"]["name"].as_str().unwrap_or("");
                if !id.is_empty() || !name.is_empty() {
                    deltas.push(StreamDelta::ToolCallStart {
                        index,
                        id: id.to_string(),
                        name: name.to_string(),
                    });
                }
                if let Some(fragment) = call["function"]["arguments"].as_str() {
                    if !fragment.is_empty() {
                        deltas.push(StreamDelta::ToolCallArguments {
                            index,
                            fragment: fragment.to_string(),
                        });
                    }
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                deltas.push(StreamDelta::Finish(map_finish_reason(reason)));
            }
        }

        // Groq reports stream usage under `x_groq`.
        let usage = parse_usage(&raw["usage"]).or_else(|| parse_usage(&raw["x_groq"]["usage"]));
        if let Some(usage) = usage {
            deltas.push(StreamDelta::Usage(usage));
        }
        Ok(deltas)
    }

    fn default_base_url(&self) -> String {
        match self.provider {
            Provider::Azure => std::env::var("AZURE_OPENAI_ENDPOINT").unwrap_or_default(),
            Provider::Groq => "https://api.groq.com/openai/v1".into(),
            _ => "https://api.openai.com/v1".into(),
        }
    }

    fn endpoint(&self, base_url: &str, model: &str, _stream: bool) -> String {
        match self.provider {
            Provider::Azure => format!(
                "{base_url}/openai/deployments/{model}/chat/completions?api-version={AZURE_API_VERSION}"
            ),
            _ => format!("{base_url}/chat/completions"),
        }
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        match self.provider {
            Provider::Azure => vec![("api-key", api_key.to_string())],
            _ => vec![("authorization", format!("Bearer {api_key}"))],
        }
    }

    fn api_key_env(&self) -> &'static str {
        match self.provider {
            Provider::Azure => "AZURE_OPENAI_API_KEY",
            Provider::Groq => "GROQ_API_KEY",
            _ => "OPENAI_API_KEY",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::ResponseFormat;
    use crate::{CallParams, MessageParam};

    fn make_request(messages: Vec<MessageParam<Value>>) -> CallRequest {
        CallRequest {
            provider: Provider::OpenAi,
            model: "gpt-4o-mini".into(),
            messages,
            tools: vec![],
            tool_choice: None,
            params: CallParams::default(),
            json_mode: false,
            response_format: None,
            stream: false,
        }
    }

    fn book_tool() -> ToolDefinition {
        ToolDefinition {
            name: "format_book".into(),
            description: "Format a book.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "year": {"type": ["integer", "null"]}
                },
                "required": ["title"]
            }),
        }
    }

    // Test 1: simple conversation keeps one message per turn
    #[test]
    fn build_request_body_produces_correct_structure() {
        let adapter = OpenAiAdapter::openai();
        let mut request = make_request(vec![
            Message::system("You are helpful.").into(),
            Message::user("Hello").into(),
        ]);
        request.params.temperature = Some(0.5);
        request.params.max_tokens = Some(100);
        let body = adapter.build_request(&request).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "You are helpful."}));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "Hello"}));
        assert_eq!(body["max_tokens"], 100);
        assert!(body.get("tools").is_none());
        assert!(body.get("stream").is_none());
    }

    // Test 2: images become data URLs
    #[test]
    fn images_become_data_urls() {
        let adapter = OpenAiAdapter::openai();
        let msg = Message::new(
            Role::User,
            vec![
                ContentPart::text("What is this?"),
                ContentPart::Image {
                    media_type: "image/png".into(),
                    data: vec![1, 2, 3],
                    detail: Some("low".into()),
                },
            ],
        );
        let native = adapter.convert_message(&msg).unwrap();
        let wire = serde_json::to_value(&native[0]).unwrap();
        assert_eq!(wire["content"][1]["type"], "image_url");
        assert_eq!(wire["content"][1]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(wire["content"][1]["image_url"]["detail"], "low");
        assert_eq!(adapter.from_native(&native[0]).unwrap(), msg);
    }

    #[test]
    fn unsupported_audio_format_is_rejected() {
        let adapter = OpenAiAdapter::openai();
        let msg = Message::new(
            Role::User,
            vec![ContentPart::Audio {
                media_type: "audio/ogg".into(),
                data: vec![0],
            }],
        );
        let err = adapter.convert_message(&msg).unwrap_err();
        assert!(matches!(err, PolycallError::UnsupportedContent { .. }));

        let wav = Message::new(
            Role::User,
            vec![ContentPart::Audio {
                media_type: "audio/wav".into(),
                data: vec![0],
            }],
        );
        let native = adapter.convert_message(&wav).unwrap();
        assert_eq!(adapter.from_native(&native[0]).unwrap(), wav);
    }

    #[test]
    fn images_in_system_messages_are_rejected() {
        let adapter = OpenAiAdapter::openai();
        let msg = Message::new(
            Role::System,
            vec![ContentPart::Image {
                media_type: "image/png".into(),
                data: vec![],
                detail: None,
            }],
        );
        match adapter.convert_message(&msg).unwrap_err() {
            PolycallError::UnsupportedContent { kind, role, .. } => {
                assert_eq!(kind, "image");
                assert_eq!(role, "system");
            }
            other => panic!("expected UnsupportedContent, got {other:?}"),
        }
    }

    // Test 3: assistant tool calls and tool results round-trip
    #[test]
    fn tool_turns_round_trip() {
        let adapter = OpenAiAdapter::openai();
        let call = Message::new(
            Role::Assistant,
            vec![
                ContentPart::text("Let me check."),
                ContentPart::ToolCall {
                    id: "call_1".into(),
                    name: "format_book".into(),
                    arguments: json!({"title": "Dune"}),
                },
            ],
        );
        let result = Message::tool_result("call_1", "Dune by Frank Herbert");
        let natives = adapter
            .to_vendor(vec![call.clone().into(), result.clone().into()])
            .unwrap();
        assert_eq!(natives.len(), 2);
        let wire = serde_json::to_value(&natives[0]).unwrap();
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], r#"{"title":"Dune"}"#);
        assert_eq!(adapter.from_vendor(&natives).unwrap(), vec![call, result]);
    }

    #[test]
    fn assistant_without_text_sends_null_content() {
        let adapter = OpenAiAdapter::openai();
        let msg = Message::new(
            Role::Assistant,
            vec![ContentPart::ToolCall {
                id: "c".into(),
                name: "f".into(),
                arguments: json!({}),
            }],
        );
        let wire = serde_json::to_value(&adapter.convert_message(&msg).unwrap()[0]).unwrap();
        assert!(wire["content"].is_null());
        assert!(wire.as_object().unwrap().contains_key("content"));
    }

    // Test 4: native messages pass through untouched
    #[test]
    fn native_messages_pass_through() {
        let adapter = OpenAiAdapter::openai();
        let native = json!({"role": "user", "content": [{"type": "text", "text": "hi"}]});
        let request = make_request(vec![MessageParam::Native(native.clone())]);
        let body = adapter.build_request(&request).unwrap();
        assert_eq!(body["messages"][0], native);

        let bad = make_request(vec![MessageParam::Native(json!({"role": "wizard"}))]);
        assert!(matches!(
            adapter.build_request(&bad).unwrap_err(),
            PolycallError::Configuration { .. }
        ));
    }

    // Test 5: strict tools and forced tool choice
    #[test]
    fn tools_are_strict_for_openai_only() {
        let mut request = make_request(vec![Message::user("x").into()]);
        request.tools = vec![book_tool()];
        request.tool_choice = Some(ToolChoice::Specific("format_book".into()));

        let body = OpenAiAdapter::openai().build_request(&request).unwrap();
        let function = &body["tools"][0]["function"];
        assert_eq!(function["strict"], true);
        assert_eq!(function["parameters"]["required"], json!(["title", "year"]));
        assert_eq!(function["parameters"]["additionalProperties"], false);
        assert_eq!(body["tool_choice"]["function"]["name"], "format_book");

        let body = OpenAiAdapter::groq().build_request(&request).unwrap();
        assert!(body["tools"][0]["function"].get("strict").is_none());
        assert_eq!(body["tools"][0]["function"]["parameters"]["required"], json!(["title"]));
    }

    #[test]
    fn json_mode_response_formats() {
        let mut request = make_request(vec![Message::user("x").into()]);
        request.json_mode = true;
        let body = OpenAiAdapter::openai().build_request(&request).unwrap();
        assert_eq!(body["response_format"], json!({"type": "json_object"}));

        request.response_format = Some(ResponseFormat {
            name: "Book".into(),
            description: "A book.".into(),
            schema: book_tool().parameters,
        });
        let body = OpenAiAdapter::openai().build_request(&request).unwrap();
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);

        let body = OpenAiAdapter::groq().build_request(&request).unwrap();
        assert_eq!(body["response_format"], json!({"type": "json_object"}));
    }

    #[test]
    fn stream_options_and_extra_params() {
        let mut request = make_request(vec![Message::user("x").into()]);
        request.stream = true;
        request
            .params
            .extra
            .insert("logprobs".into(), json!(true));
        request.params.extra.insert("model".into(), json!("ignored"));
        let body = OpenAiAdapter::openai().build_request(&request).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["logprobs"], true);
        assert_eq!(body["model"], "gpt-4o-mini");

        let body = OpenAiAdapter::groq().build_request(&request).unwrap();
        assert!(body.get("stream_options").is_none());
    }

    // Test 6: parse a complete response with a tool call
    #[test]
    fn parse_response_handles_tool_calls() {
        let raw = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "refusal": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "format_book", "arguments": "{\"title\":\"Dune\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20,
                      "prompt_tokens_details": {"cached_tokens": 4}}
        });
        let out = OpenAiAdapter::openai().parse_response(&raw).unwrap();
        assert_eq!(out.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(out.finish_reasons, vec![FinishReason::ToolUse]);
        assert_eq!(out.usage.total_tokens, 20);
        assert_eq!(out.usage.cache_read_tokens, Some(4));
        let calls: Vec<_> = out.message.tool_calls().collect();
        assert_eq!(calls[0].arguments, json!({"title": "Dune"}));
    }

    #[test]
    fn parse_response_without_choices_fails() {
        assert!(OpenAiAdapter::openai().parse_response(&json!({})).is_err());
    }

    // Test 7: stream chunks
    #[test]
    fn parse_chunk_emits_deltas() {
        let adapter = OpenAiAdapter::openai();
        let start = json!({
            "id": "c1", "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"role": "assistant", "tool_calls": [
                {"index": 0, "id": "call_1", "type": "function",
                 "function": {"name": "format_book", "arguments": ""}}
            ]}, "finish_reason": null}]
        });
        let deltas = adapter.parse_chunk(&start).unwrap();
        assert!(deltas.contains(&StreamDelta::ToolCallStart {
            index: 0,
            id: "call_1".into(),
            name: "format_book".into()
        }));
        assert!(!deltas
            .iter()
            .any(|d| matches!(d, StreamDelta::ToolCallArguments { .. })));

        let frag = json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{\"ti"}}
        ]}}]});
        assert_eq!(
            adapter.parse_chunk(&frag).unwrap(),
            vec![StreamDelta::ToolCallArguments {
                index: 0,
                fragment: "{\"ti".into()
            }]
        );

        let usage = json!({"id": "c1", "choices": [],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4}});
        let deltas = adapter.parse_chunk(&usage).unwrap();
        assert!(deltas.contains(&StreamDelta::Usage(Usage::new(3, 4))));
    }

    #[test]
    fn groq_usage_lives_under_x_groq() {
        let chunk = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "x_groq": {"usage": {"prompt_tokens": 1, "completion_tokens": 2}}});
        let deltas = OpenAiAdapter::groq().parse_chunk(&chunk).unwrap();
        assert!(deltas.contains(&StreamDelta::Finish(FinishReason::EndTurn)));
        assert!(deltas.contains(&StreamDelta::Usage(Usage::new(1, 2))));
    }

    // Test 8: endpoints and auth per deployment
    #[test]
    fn endpoints_and_headers() {
        let openai = OpenAiAdapter::openai();
        assert_eq!(
            openai.endpoint(&openai.default_base_url(), "gpt-4o", false),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(openai.auth_headers("k"), vec![("authorization", "Bearer k".to_string())]);

        let azure = OpenAiAdapter::azure();
        assert_eq!(
            azure.endpoint("https://x.openai.azure.com", "gpt-4o", true),
            format!(
                "https://x.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version={AZURE_API_VERSION}"
            )
        );
        assert_eq!(azure.auth_headers("k"), vec![("api-key", "k".to_string())]);
        assert_eq!(OpenAiAdapter::groq().api_key_env(), "GROQ_API_KEY");
    }
}
