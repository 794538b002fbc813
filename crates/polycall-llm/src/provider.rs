use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::setup::CallRequest;
use crate::stream::StreamDelta;
use crate::{
    AnthropicAdapter, CohereAdapter, ContentPart, FinishReason, GeminiAdapter, Message,
    MistralAdapter, OpenAiAdapter, Provider, Role, ToolDefinition, Usage,
};
use polycall_types::{PolycallError, Result};

// ---------------------------------------------------------------------------
// MessageParam
// ---------------------------------------------------------------------------

/// A message as supplied by the caller: either normalized, or already in the
/// vendor's native shape and passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageParam<N> {
    Normalized(Message),
    Native(N),
}

impl<N> From<Message> for MessageParam<N> {
    fn from(message: Message) -> Self {
        MessageParam::Normalized(message)
    }
}

/// Decode caller-supplied native messages (held as JSON) into a vendor's
/// typed native shape. Normalized messages pass through.
pub(crate) fn decode_native<N: DeserializeOwned>(
    provider: Provider,
    params: &[MessageParam<Value>],
) -> Result<Vec<MessageParam<N>>> {
    params
        .iter()
        .map(|p| match p {
            MessageParam::Normalized(m) => Ok(MessageParam::Normalized(m.clone())),
            MessageParam::Native(raw) => serde_json::from_value(raw.clone())
                .map(MessageParam::Native)
                .map_err(|e| {
                    PolycallError::configuration(
                        provider.as_str(),
                        format!("native message is not a valid {provider} message: {e}"),
                    )
                }),
        })
        .collect()
}

/// Pull normalized system messages out of a message list for vendors that
/// take the system prompt as a top-level request field.
pub(crate) fn split_system<N>(
    provider: Provider,
    params: Vec<MessageParam<N>>,
) -> Result<(Vec<String>, Vec<MessageParam<N>>)> {
    let mut system = Vec::new();
    let mut rest = Vec::with_capacity(params.len());
    for param in params {
        match param {
            MessageParam::Normalized(m) if m.role == Role::System => {
                for part in &m.content {
                    match part {
                        ContentPart::Text { text } => system.push(text.clone()),
                        other => return Err(unsupported(provider, other, Role::System)),
                    }
                }
            }
            other => rest.push(other),
        }
    }
    Ok((system, rest))
}

// ---------------------------------------------------------------------------
// MessageConverter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Every normalized message becomes its own vendor message.
    Never,
    /// Adjacent normalized messages with the same role are concatenated
    /// before conversion. Native messages always break a run.
    ConsecutiveSameRole,
}

/// Bidirectional mapping between normalized messages and one vendor's native
/// message type.
pub trait MessageConverter {
    type Native: Debug + Clone + PartialEq + Serialize + DeserializeOwned;

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::Never
    }

    /// Convert one normalized message. A message may expand into several
    /// native messages (one per tool result for some vendors).
    fn convert_message(&self, message: &Message) -> Result<Vec<Self::Native>>;

    fn from_native(&self, native: &Self::Native) -> Result<Message>;

    fn to_vendor(&self, messages: Vec<MessageParam<Self::Native>>) -> Result<Vec<Self::Native>> {
        let messages = match self.merge_policy() {
            MergePolicy::Never => messages,
            MergePolicy::ConsecutiveSameRole => merge_consecutive(messages),
        };
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            match message {
                MessageParam::Native(native) => out.push(native),
                MessageParam::Normalized(m) => match self.replay_native(&m) {
                    Some(native) => out.push(native),
                    None => out.extend(self.convert_message(&m)?),
                },
            }
        }
        Ok(out)
    }

    fn from_vendor(&self, natives: &[Self::Native]) -> Result<Vec<Message>> {
        natives.iter().map(|n| self.lift_native(n)).collect()
    }

    /// `from_native`, keeping a snapshot of `native` on the message when
    /// converting the message back would not reproduce it.
    fn lift_native(&self, native: &Self::Native) -> Result<Message> {
        let mut message = self.from_native(native)?;
        let reproduced = self.convert_message(&message).ok();
        if reproduced.as_deref() != Some(std::slice::from_ref(native)) {
            message.native = Some(serde_json::to_value(native)?);
        }
        Ok(message)
    }

    /// The snapshot taken by [`MessageConverter::lift_native`], if it still
    /// decodes to this message.
    fn replay_native(&self, message: &Message) -> Option<Self::Native> {
        let raw = message.native.as_ref()?;
        let native: Self::Native = serde_json::from_value(raw.clone()).ok()?;
        let decoded = self.from_native(&native).ok()?;
        (decoded.role == message.role && decoded.content == message.content).then_some(native)
    }
}

pub fn merge_consecutive<N>(messages: Vec<MessageParam<N>>) -> Vec<MessageParam<N>> {
    let mut out: Vec<MessageParam<N>> = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            MessageParam::Normalized(next) => {
                if let Some(MessageParam::Normalized(prev)) = out.last_mut() {
                    if prev.role == next.role && prev.native.is_none() && next.native.is_none() {
                        prev.content.extend(next.content);
                        continue;
                    }
                }
                out.push(MessageParam::Normalized(next));
            }
            native => out.push(native),
        }
    }
    out
}

pub(crate) fn unsupported(provider: Provider, part: &ContentPart, role: Role) -> PolycallError {
    PolycallError::UnsupportedContent {
        provider: provider.as_str().into(),
        kind: part.kind().into(),
        role: role.as_str().into(),
    }
}

pub(crate) fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub(crate) fn decode_base64(provider: Provider, data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| PolycallError::Other(format!("{provider} returned invalid base64 data: {e}")))
}

/// Parse tool-call arguments delivered as a JSON string. Unparseable text is
/// kept verbatim so validation can report it later.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// How many tools a single request may carry. Zero means no tool support.
    pub tool_slots: usize,
    /// Tool and response schemas are sent in the vendor's strict mode.
    pub strict_schemas: bool,
    /// The vendor has a native JSON response format switch.
    pub native_json_mode: bool,
}

/// A normalized view of one vendor completion.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorOutput {
    pub id: Option<String>,
    pub model: Option<String>,
    pub message: Message,
    pub finish_reasons: Vec<FinishReason>,
    pub usage: Usage,
}

/// Everything the call pipeline needs to know about one vendor. Message
/// conversion lives on the vendor's `MessageConverter`; this trait is the
/// object-safe face used by the registry.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn capabilities(&self) -> Capabilities;

    /// Vendor wire shape for one tool.
    fn tool_schema(&self, tool: &ToolDefinition) -> Value;

    fn build_request(&self, request: &CallRequest) -> Result<Value>;

    fn parse_response(&self, raw: &Value) -> Result<VendorOutput>;

    /// Translate one raw stream chunk into zero or more deltas.
    fn parse_chunk(&self, raw: &Value) -> Result<Vec<StreamDelta>>;

    fn default_base_url(&self) -> String;

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String;

    fn auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)>;

    fn api_key_env(&self) -> &'static str;

    fn name(&self) -> &str {
        self.provider().as_str()
    }
}

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in vendor adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(OpenAiAdapter::openai());
        registry.register(OpenAiAdapter::azure());
        registry.register(OpenAiAdapter::groq());
        registry.register(AnthropicAdapter::new());
        registry.register(GeminiAdapter::gemini());
        registry.register(GeminiAdapter::vertex());
        registry.register(MistralAdapter::new());
        registry.register(CohereAdapter::new());
        registry
    }

    pub fn register(&mut self, adapter: impl ProviderAdapter + 'static) {
        self.register_arc(Arc::new(adapter));
    }

    pub fn register_arc(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        tracing::debug!(provider = %adapter.provider(), "registered provider adapter");
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned().ok_or_else(|| {
            PolycallError::configuration(provider.as_str(), "no adapter registered")
        })
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut out: Vec<Provider> = self.adapters.keys().copied().collect();
        out.sort_by_key(|p| p.as_str());
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    struct EchoConverter {
        policy: MergePolicy,
    }

    impl MessageConverter for EchoConverter {
        type Native = Value;

        fn merge_policy(&self) -> MergePolicy {
            self.policy
        }

        fn convert_message(&self, message: &Message) -> Result<Vec<Value>> {
            Ok(vec![json!({
                "role": message.role.as_str(),
                "text": message.text(),
                "parts": message.content.len(),
            })])
        }

        fn from_native(&self, native: &Value) -> Result<Message> {
            Ok(Message::user(native["text"].as_str().unwrap_or_default()))
        }
    }

    #[test]
    fn never_policy_keeps_consecutive_messages_apart() {
        let conv = EchoConverter {
            policy: MergePolicy::Never,
        };
        let out = conv
            .to_vendor(vec![Message::user("a").into(), Message::user("b").into()])
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn consecutive_same_role_messages_merge() {
        let conv = EchoConverter {
            policy: MergePolicy::ConsecutiveSameRole,
        };
        let out = conv
            .to_vendor(vec![
                Message::user("a").into(),
                Message::user("b").into(),
                Message::assistant("c").into(),
            ])
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["text"], "ab");
        assert_eq!(out[0]["parts"], 2);
        assert_eq!(out[1]["role"], "assistant");
    }

    #[test]
    fn native_messages_pass_through_and_break_merge_runs() {
        let conv = EchoConverter {
            policy: MergePolicy::ConsecutiveSameRole,
        };
        let native = json!({"role": "user", "vendor_only": true});
        let out = conv
            .to_vendor(vec![
                Message::user("a").into(),
                MessageParam::Native(native.clone()),
                Message::user("b").into(),
            ])
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1], native);
        assert_eq!(out[2]["text"], "b");
    }

    #[test]
    fn split_system_extracts_text_only() {
        let params: Vec<MessageParam<Value>> = vec![
            Message::system("be brief").into(),
            Message::user("hi").into(),
        ];
        let (system, rest) = split_system(Provider::Anthropic, params).unwrap();
        assert_eq!(system, vec!["be brief".to_string()]);
        assert_eq!(rest.len(), 1);

        let image_system: Vec<MessageParam<Value>> = vec![Message::new(
            Role::System,
            vec![ContentPart::Image {
                media_type: "image/png".into(),
                data: vec![0],
                detail: None,
            }],
        )
        .into()];
        let err = split_system(Provider::Anthropic, image_system).unwrap_err();
        assert!(matches!(err, PolycallError::UnsupportedContent { .. }));
    }

    #[test]
    fn decode_native_reports_configuration_error() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Strict {
            role: String,
        }
        let params = vec![MessageParam::Native(json!({"nope": 1}))];
        let err = decode_native::<Strict>(Provider::Mistral, &params).unwrap_err();
        assert!(matches!(err, PolycallError::Configuration { .. }));
    }

    #[test]
    fn parse_arguments_handles_empty_and_invalid() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_arguments("{bad"), json!("{bad"));
    }

    #[test]
    fn default_registry_covers_every_provider() {
        let registry = ProviderRegistry::with_defaults();
        for provider in Provider::ALL {
            let adapter = registry.get(provider).unwrap();
            assert_eq!(adapter.provider(), provider);
            assert_eq!(adapter.name(), provider.as_str());
        }
        assert_eq!(registry.providers().len(), Provider::ALL.len());
    }

    #[test]
    fn empty_registry_returns_configuration_error() {
        let registry = ProviderRegistry::new();
        let err = registry.get(Provider::Cohere).err().unwrap();
        assert!(matches!(err, PolycallError::Configuration { .. }));
    }
}
