use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::provider::{
    decode_base64, decode_native, encode_base64, split_system, unsupported, Capabilities,
    MergePolicy, MessageConverter, MessageParam, ProviderAdapter, VendorOutput,
};
use crate::setup::CallRequest;
use crate::stream::StreamDelta;
use crate::tool::walk_schema;
use crate::{
    ContentPart, Field, FinishReason, Message, Provider, Role, ToolChoice, ToolDefinition, Usage,
};
use polycall_types::{PolycallError, Result};

/// Keywords the Gemini schema dialect rejects.
const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "title",
    "default",
    "additionalProperties",
    "examples",
];

// ---------------------------------------------------------------------------
// Native message types (generateContent)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeminiRole {
    User,
    Model,
    /// Client-side only: lifted into `systemInstruction` when the request
    /// is built.
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<GeminiRole>,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiBlob,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiBlob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub id: Field<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub id: Field<String>,
    pub name: String,
    pub response: Value,
}

// ---------------------------------------------------------------------------
// GeminiAdapter
// ---------------------------------------------------------------------------

/// Adapter for the Gemini API and for Gemini models on Vertex AI.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    provider: Provider,
}

impl GeminiAdapter {
    pub fn gemini() -> Self {
        Self {
            provider: Provider::Gemini,
        }
    }

    pub fn vertex() -> Self {
        Self {
            provider: Provider::Vertex,
        }
    }

    fn convert_with(&self, message: &Message, names: &HashMap<String, String>) -> Result<GeminiContent> {
        let provider = self.provider;
        let role = match message.role {
            Role::Assistant => GeminiRole::Model,
            Role::System => GeminiRole::System,
            Role::User | Role::Tool => GeminiRole::User,
        };
        let mut parts = Vec::with_capacity(message.content.len());
        for part in &message.content {
            let allowed = match message.role {
                Role::System => matches!(part, ContentPart::Text { .. }),
                Role::User => !matches!(part, ContentPart::ToolCall { .. }),
                Role::Assistant => matches!(part, ContentPart::Text { .. } | ContentPart::ToolCall { .. }),
                Role::Tool => matches!(part, ContentPart::ToolResult { .. }),
            };
            if !allowed {
                return Err(unsupported(provider, part, message.role));
            }
            parts.push(match part {
                ContentPart::Text { text } => GeminiPart::Text { text: text.clone() },
                ContentPart::Image {
                    media_type, data, ..
                }
                | ContentPart::Audio { media_type, data } => GeminiPart::InlineData {
                    inline_data: GeminiBlob {
                        mime_type: media_type.clone(),
                        data: encode_base64(data),
                    },
                },
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => GeminiPart::FunctionCall {
                    function_call: GeminiFunctionCall {
                        id: Field::Value(id.clone()),
                        name: name.clone(),
                        args: arguments.clone(),
                    },
                },
                ContentPart::ToolResult { id, content } => GeminiPart::FunctionResponse {
                    function_response: GeminiFunctionResponse {
                        id: Field::Value(id.clone()),
                        name: names.get(id).cloned().unwrap_or_else(|| id.clone()),
                        response: json!({ "result": content }),
                    },
                },
            });
        }
        Ok(GeminiContent {
            role: Some(role),
            parts,
        })
    }
}

/// Tool-call ids mapped to function names, from every call in the history.
fn function_names(messages: &[MessageParam<GeminiContent>]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for message in messages {
        match message {
            MessageParam::Normalized(m) => {
                for call in m.tool_calls() {
                    names.insert(call.id, call.name);
                }
            }
            MessageParam::Native(content) => {
                for part in &content.parts {
                    if let GeminiPart::FunctionCall { function_call } = part {
                        let id = function_call
                            .id
                            .as_option()
                            .cloned()
                            .unwrap_or_else(|| function_call.name.clone());
                        names.insert(id, function_call.name.clone());
                    }
                }
            }
        }
    }
    names
}

impl MessageConverter for GeminiAdapter {
    type Native = GeminiContent;

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::ConsecutiveSameRole
    }

    fn convert_message(&self, message: &Message) -> Result<Vec<GeminiContent>> {
        Ok(vec![self.convert_with(message, &HashMap::new())?])
    }

    // Function responses must carry the function name, which normalized
    // tool results only know by call id.
    fn to_vendor(&self, messages: Vec<MessageParam<GeminiContent>>) -> Result<Vec<GeminiContent>> {
        let names = function_names(&messages);
        let messages = crate::provider::merge_consecutive(messages);
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            match message {
                MessageParam::Native(native) => out.push(native),
                MessageParam::Normalized(m) => match self.replay_native(&m) {
                    Some(native) => out.push(native),
                    None => out.push(self.convert_with(&m, &names)?),
                },
            }
        }
        Ok(out)
    }

    fn from_vendor(&self, natives: &[GeminiContent]) -> Result<Vec<Message>> {
        let history: Vec<MessageParam<GeminiContent>> =
            natives.iter().cloned().map(MessageParam::Native).collect();
        let names = function_names(&history);
        natives
            .iter()
            .map(|native| {
                let mut message = self.from_native(native)?;
                if self.convert_with(&message, &names).ok().as_ref() != Some(native) {
                    message.native = Some(serde_json::to_value(native)?);
                }
                Ok(message)
            })
            .collect()
    }

    fn from_native(&self, native: &GeminiContent) -> Result<Message> {
        let all_responses = !native.parts.is_empty()
            && native
                .parts
                .iter()
                .all(|p| matches!(p, GeminiPart::FunctionResponse { .. }));
        let role = match native.role {
            Some(GeminiRole::Model) => Role::Assistant,
            Some(GeminiRole::System) => Role::System,
            _ if all_responses => Role::Tool,
            _ => Role::User,
        };

        let mut parts = Vec::with_capacity(native.parts.len());
        for part in &native.parts {
            parts.push(match part {
                GeminiPart::Text { text } => ContentPart::text(text.clone()),
                GeminiPart::InlineData { inline_data } => {
                    let data = decode_base64(self.provider, &inline_data.data)?;
                    let media_type = inline_data.mime_type.clone();
                    if media_type.starts_with("audio/") {
                        ContentPart::Audio { media_type, data }
                    } else if media_type.starts_with("image/") {
                        ContentPart::Image {
                            media_type,
                            data,
                            detail: None,
                        }
                    } else {
                        return Err(PolycallError::Other(format!(
                            "{} inline data of type {media_type} has no normalized form",
                            self.provider
                        )));
                    }
                }
                GeminiPart::FunctionCall { function_call } => ContentPart::ToolCall {
                    id: function_call
                        .id
                        .as_option()
                        .cloned()
                        .unwrap_or_else(|| function_call.name.clone()),
                    name: function_call.name.clone(),
                    arguments: function_call.args.clone(),
                },
                GeminiPart::FunctionResponse { function_response } => ContentPart::ToolResult {
                    id: function_response
                        .id
                        .as_option()
                        .cloned()
                        .unwrap_or_else(|| function_response.name.clone()),
                    content: match &function_response.response["result"] {
                        Value::String(s) => s.clone(),
                        Value::Null => function_response.response.to_string(),
                        other => other.to_string(),
                    },
                },
            });
        }
        Ok(Message::new(role, parts))
    }
}

/// Rewrite a JSON schema into the dialect Gemini accepts: unsupported
/// keywords removed, `["T", "null"]` types turned into `nullable`.
pub fn gemini_schema(schema: &Value) -> Value {
    let mut out = schema.clone();
    walk_schema(&mut out, &mut |node| {
        for k in UNSUPPORTED_KEYWORDS {
            node.remove(*k);
        }
        let Some(Value::Array(types)) = node.get("type").cloned() else {
            return;
        };
        let non_null: Vec<Value> = types.iter().filter(|t| *t != "null").cloned().collect();
        if let [single] = non_null.as_slice() {
            node.insert("type".into(), single.clone());
            if non_null.len() < types.len() {
                node.insert("nullable".into(), Value::Bool(true));
            }
        }
    });
    out
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        _ => FinishReason::EndTurn,
    }
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    let mut out = Usage::new(
        usage["promptTokenCount"].as_u64().unwrap_or(0),
        usage["candidatesTokenCount"].as_u64().unwrap_or(0),
    );
    out.cache_read_tokens = usage["cachedContentTokenCount"].as_u64();
    Some(out)
}

/// Response parts as normalized content. Thought summaries are skipped.
fn parse_parts(content: &Value) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    for part in content["parts"].as_array().into_iter().flatten() {
        if part["thought"].as_bool() == Some(true) {
            continue;
        }
        if let Some(text) = part["text"].as_str() {
            parts.push(ContentPart::text(text));
        } else if part.get("functionCall").is_some() {
            let call = &part["functionCall"];
            let name = call["name"].as_str().unwrap_or("").to_string();
            parts.push(ContentPart::ToolCall {
                id: call["id"].as_str().map(String::from).unwrap_or_else(|| name.clone()),
                name,
                arguments: if call["args"].is_null() {
                    json!({})
                } else {
                    call["args"].clone()
                },
            });
        }
    }
    parts
}

impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        self.provider
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
            "name": tool.name,
            "description": tool.description,
            "parameters": gemini_schema(&tool.parameters),
        })
    }

    fn build_request(&self, request: &CallRequest) -> Result<Value> {
        // 1. Messages
        let params = decode_native::<GeminiContent>(self.provider, &request.messages)?;
        let (system, rest) = split_system(self.provider, params)?;
        let mut system_parts: Vec<GeminiPart> =
            system.into_iter().map(|text| GeminiPart::Text { text }).collect();
        let mut contents = Vec::new();
        for content in self.to_vendor(rest)? {
            if content.role == Some(GeminiRole::System) {
                system_parts.extend(content.parts);
            } else {
                contents.push(content);
            }
        }
        let mut body = json!({ "contents": contents });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }

        // 2. Generation config
        let p = &request.params;
        let mut config = serde_json::Map::new();
        if let Some(t) = p.temperature {
            config.insert("temperature".into(), json!(t));
        }
        if let Some(max) = p.max_tokens {
            config.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(top_p) = p.top_p {
            config.insert("topP".into(), json!(top_p));
        }
        if !p.stop.is_empty() {
            config.insert("stopSequences".into(), json!(p.stop));
        }
        if let Some(seed) = p.seed {
            config.insert("seed".into(), json!(seed));
        }
        if request.json_mode {
            config.insert("responseMimeType".into(), json!("application/json"));
            if let Some(format) = &request.response_format {
                config.insert("responseSchema".into(), gemini_schema(&format.schema));
            }
        }
        if !config.is_empty() {
            body["generationConfig"] = Value::Object(config);
        }

        // 3. Tools
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request.tools.iter().map(|t| self.tool_schema(t)).collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
            if let Some(choice) = &request.tool_choice {
                body["toolConfig"] = json!({
                    "functionCallingConfig": match choice {
                        ToolChoice::Auto => json!({ "mode": "AUTO" }),
                        ToolChoice::None => json!({ "mode": "NONE" }),
                        ToolChoice::Required => json!({ "mode": "ANY" }),
                        ToolChoice::Specific(name) => {
                            json!({ "mode": "ANY", "allowedFunctionNames": [name] })
                        }
                    }
                });
            }
        }

        p.apply_extra(&mut body);
        Ok(body)
    }

    fn parse_response(&self, raw: &Value) -> Result<VendorOutput> {
        let candidates = raw["candidates"].as_array().cloned().unwrap_or_default();
        let Some(first) = candidates.first() else {
            let reason = raw["promptFeedback"]["blockReason"].as_str().unwrap_or("no candidates");
            return Err(PolycallError::ProviderError {
                provider: self.provider.as_str().into(),
                status: 200,
                message: format!("response has no candidates: {reason}"),
                retryable: false,
            });
        };
        let parts = parse_parts(&first["content"]);
        let has_calls = parts.iter().any(|p| matches!(p, ContentPart::ToolCall { .. }));

        let finish_reasons = candidates
            .iter()
            .filter_map(|c| c["finishReason"].as_str())
            .map(|r| match map_finish_reason(r) {
                FinishReason::EndTurn if has_calls => FinishReason::ToolUse,
                other => other,
            })
            .collect();

        Ok(VendorOutput {
            id: raw["responseId"].as_str().map(String::from),
            model: raw["modelVersion"].as_str().map(String::from),
            message: Message::new(Role::Assistant, parts),
            finish_reasons,
            usage: parse_usage(&raw["usageMetadata"]).unwrap_or_default(),
        })
    }

    fn parse_chunk(&self, raw: &Value) -> Result<Vec<StreamDelta>> {
        let mut deltas = Vec::new();
        if raw.get("responseId").is_some() || raw.get("modelVersion").is_some() {
            deltas.push(StreamDelta::Metadata {
                id: raw["responseId"].as_str().map(String::from),
                model: raw["modelVersion"].as_str().map(String::from),
            });
        }
        let Some(candidate) = raw["candidates"].as_array().and_then(|c| c.first()) else {
            return Ok(deltas);
        };

        let mut has_calls = false;
        for part in parse_parts(&candidate["content"]) {
            match part {
                ContentPart::Text { text } => deltas.push(StreamDelta::Text(text)),
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    has_calls = true;
                    deltas.push(StreamDelta::ToolCall {
                        id,
                        name,
                        arguments: arguments.to_string(),
                    });
                }
                _ => {}
            }
        }

        // Every chunk repeats the running usage; take it once, at the end.
        if let Some(reason) = candidate["finishReason"].as_str() {
            let reason = match map_finish_reason(reason) {
                FinishReason::EndTurn if has_calls => FinishReason::ToolUse,
                other => other,
            };
            deltas.push(StreamDelta::Finish(reason));
            if let Some(usage) = parse_usage(&raw["usageMetadata"]) {
                deltas.push(StreamDelta::Usage(usage));
            }
        }
        Ok(deltas)
    }

    fn default_base_url(&self) -> String {
        match self.provider {
            Provider::Vertex => {
                let Ok(project) = std::env::var("GOOGLE_CLOUD_PROJECT") else {
                    return String::new();
                };
                let location = std::env::var("GOOGLE_CLOUD_LOCATION")
                    .unwrap_or_else(|_| "us-central1".to_string());
                format!(
                    "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google"
                )
            }
            _ => "https://generativelanguage.googleapis.com/v1beta".into(),
        }
    }

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String {
        if stream {
            format!("{base_url}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base_url}/models/{model}:generateContent")
        }
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        match self.provider {
            Provider::Vertex => vec![("authorization", format!("Bearer {api_key}"))],
            _ => vec![("x-goog-api-key", api_key.to_string())],
        }
    }

    fn api_key_env(&self) -> &'static str {
        match self.provider {
            Provider::Vertex => "GOOGLE_CLOUD_ACCESS_TOKEN",
            _ => "GEMINI_API_KEY",
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
    use crate::CallParams;

    fn make_request(messages: Vec<MessageParam<Value>>) -> CallRequest {
        CallRequest {
            provider: Provider::Gemini,
            model: "gemini-2.0-flash".into(),
            messages,
            tools: vec![],
            tool_choice: None,
            params: CallParams::default(),
            json_mode: false,
            response_format: None,
            stream: false,
        }
    }

    // Test 1: system instruction and model role
    #[test]
    fn build_request_uses_system_instruction_and_model_role() {
        let request = make_request(vec![
            Message::system("Be brief.").into(),
            Message::user("Hi").into(),
            Message::assistant("Hello!").into(),
        ]);
        let body = GeminiAdapter::gemini().build_request(&request).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(body["contents"][0], json!({"role": "user", "parts": [{"text": "Hi"}]}));
        assert_eq!(body["contents"][1]["role"], "model");
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn system_contents_round_trip_and_lift_into_system_instruction() {
        let adapter = GeminiAdapter::gemini();
        let messages = vec![Message::system("Be brief."), Message::user("Hi")];
        let contents = adapter
            .to_vendor(messages.iter().cloned().map(Into::into).collect())
            .unwrap();
        assert_eq!(contents[0].role, Some(GeminiRole::System));
        assert_eq!(adapter.from_vendor(&contents).unwrap(), messages);

        let request = make_request(vec![
            MessageParam::Native(json!({"role": "system", "parts": [{"text": "Cite sources."}]})),
            Message::user("Hi").into(),
        ]);
        let body = adapter.build_request(&request).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Cite sources.");
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
    }

    // Test 2: tool results resolve their function name from the history
    #[test]
    fn tool_results_carry_function_names() {
        let adapter = GeminiAdapter::gemini();
        let call = Message::new(
            Role::Assistant,
            vec![ContentPart::ToolCall {
                id: "call_7".into(),
                name: "get_weather".into(),
                arguments: json!({"city": "Oslo"}),
            }],
        );
        let result = Message::tool_result("call_7", "sunny");
        let natives = adapter
            .to_vendor(vec![call.clone().into(), result.clone().into()])
            .unwrap();
        let wire = serde_json::to_value(&natives[1]).unwrap();
        assert_eq!(wire["parts"][0]["functionResponse"]["name"], "get_weather");
        assert_eq!(wire["parts"][0]["functionResponse"]["response"]["result"], "sunny");
        assert_eq!(adapter.from_vendor(&natives).unwrap(), vec![call, result]);
    }

    #[test]
    fn missing_ids_fall_back_to_function_names() {
        let adapter = GeminiAdapter::gemini();
        let native: GeminiContent = serde_json::from_value(json!({
            "role": "model",
            "parts": [{"functionCall": {"name": "lookup", "args": {"q": "x"}}}]
        }))
        .unwrap();
        let msg = adapter.from_native(&native).unwrap();
        let call = msg.tool_calls().next().unwrap();
        assert_eq!(call.id, "lookup");
    }

    #[test]
    fn inline_data_round_trips_images_and_audio() {
        let adapter = GeminiAdapter::gemini();
        let msg = Message::new(
            Role::User,
            vec![
                ContentPart::Image {
                    media_type: "image/png".into(),
                    data: vec![9, 9],
                    detail: None,
                },
                ContentPart::Audio {
                    media_type: "audio/mp3".into(),
                    data: vec![1],
                },
            ],
        );
        let natives = adapter.convert_message(&msg).unwrap();
        let wire = serde_json::to_value(&natives[0]).unwrap();
        assert_eq!(wire["parts"][0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(adapter.from_native(&natives[0]).unwrap(), msg);
    }

    // Test 3: schemas are rewritten into Gemini's dialect
    #[test]
    fn schemas_are_sanitized() {
        let schema = json!({
            "type": "object",
            "title": "Book",
            "additionalProperties": false,
            "properties": {
                "title": {"type": "string", "default": "x"},
                "year": {"type": ["integer", "null"]}
            }
        });
        let out = gemini_schema(&schema);
        assert!(out.get("title").is_none());
        assert!(out.get("additionalProperties").is_none());
        assert!(out["properties"].get("title").is_some());
        assert!(out["properties"]["title"].get("default").is_none());
        assert_eq!(out["properties"]["year"], json!({"type": "integer", "nullable": true}));
    }

    #[test]
    fn tools_and_json_mode_config() {
        let mut request = make_request(vec![Message::user("x").into()]);
        request.tools = vec![ToolDefinition {
            name: "Book".into(),
            description: "A book.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }];
        request.tool_choice = Some(ToolChoice::Specific("Book".into()));
        request.params.max_tokens = Some(64);
        let body = GeminiAdapter::gemini().build_request(&request).unwrap();
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "Book");
        assert_eq!(
            body["toolConfig"]["functionCallingConfig"],
            json!({"mode": "ANY", "allowedFunctionNames": ["Book"]})
        );
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);

        let mut request = make_request(vec![Message::user("x").into()]);
        request.json_mode = true;
        request.response_format = Some(ResponseFormat {
            name: "Book".into(),
            description: String::new(),
            schema: json!({"type": "object", "properties": {"t": {"type": "string"}}}),
        });
        let body = GeminiAdapter::gemini().build_request(&request).unwrap();
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["responseSchema"]["type"], "object");
    }

    // Test 4: parse a response with a function call
    #[test]
    fn parse_response_reports_tool_use() {
        let raw = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking", "thought": true},
                    {"functionCall": {"name": "Book", "args": {"title": "Dune"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3, "totalTokenCount": 10},
            "modelVersion": "gemini-2.0-flash-001",
            "responseId": "r1"
        });
        let out = GeminiAdapter::gemini().parse_response(&raw).unwrap();
        assert_eq!(out.finish_reasons, vec![FinishReason::ToolUse]);
        assert_eq!(out.message.text(), "");
        assert_eq!(out.usage.total_tokens, 10);
        let call = out.message.tool_calls().next().unwrap();
        assert_eq!(call.id, "Book");
        assert_eq!(call.arguments, json!({"title": "Dune"}));
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let raw = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = GeminiAdapter::gemini().parse_response(&raw).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    // Test 5: stream chunks deliver whole function calls
    #[test]
    fn parse_chunk_emits_whole_calls_and_final_usage() {
        let adapter = GeminiAdapter::gemini();
        let text = json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "He"}]}}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 1}});
        assert_eq!(
            adapter.parse_chunk(&text).unwrap(),
            vec![StreamDelta::Text("He".into())]
        );

        let last = json!({"candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"name": "Book", "args": {"title": "Dune"}}}]},
                "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 5}});
        let deltas = adapter.parse_chunk(&last).unwrap();
        assert_eq!(
            deltas,
            vec![
                StreamDelta::ToolCall {
                    id: "Book".into(),
                    name: "Book".into(),
                    arguments: r#"{"title":"Dune"}"#.into()
                },
                StreamDelta::Finish(FinishReason::ToolUse),
                StreamDelta::Usage(Usage::new(7, 5)),
            ]
        );
    }

    #[test]
    fn endpoints_and_auth() {
        let gemini = GeminiAdapter::gemini();
        assert_eq!(
            gemini.endpoint(&gemini.default_base_url(), "gemini-2.0-flash", true),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
        assert_eq!(gemini.auth_headers("k")[0].0, "x-goog-api-key");
        let vertex = GeminiAdapter::vertex();
        assert_eq!(vertex.auth_headers("t"), vec![("authorization", "Bearer t".to_string())]);
        assert_eq!(vertex.api_key_env(), "GOOGLE_CLOUD_ACCESS_TOKEN");
    }
}
