use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::extract::ResponseModelSpec;
use crate::invoke::VendorRequest;
use crate::tool::{ToolEntry, ToolRegistry};
use crate::{
    CallParams, ContentPart, Message, MessageParam, Provider, ProviderAdapter, Role, ToolChoice,
    ToolDefinition,
};
use polycall_types::{PolycallError, Result};

// ---------------------------------------------------------------------------
// Prompt output
// ---------------------------------------------------------------------------

/// Overrides a prompt function may return alongside (or instead of) its
/// messages.
#[derive(Clone, Default)]
pub struct DynamicConfig {
    pub messages: Option<Vec<MessageParam<Value>>>,
    /// Replaces the call's tools for this invocation.
    pub tools: Option<Vec<ToolEntry>>,
    /// Merged over the call's parameters.
    pub call_params: Option<CallParams>,
    /// Extra template variables, visible to the call's template.
    pub computed_fields: Map<String, Value>,
}

impl DynamicConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(mut self, messages: Vec<MessageParam<Value>>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolEntry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn call_params(mut self, params: CallParams) -> Self {
        self.call_params = Some(params);
        self
    }

    pub fn computed_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.computed_fields.insert(name.into(), value.into());
        self
    }
}

/// What a prompt function hands back to the call pipeline.
#[derive(Clone)]
pub enum PromptOutput {
    /// A bare string, sent as a single user message.
    Literal(String),
    Messages(Vec<MessageParam<Value>>),
    Config(DynamicConfig),
}

impl From<&str> for PromptOutput {
    fn from(s: &str) -> Self {
        PromptOutput::Literal(s.to_string())
    }
}

impl From<String> for PromptOutput {
    fn from(s: String) -> Self {
        PromptOutput::Literal(s)
    }
}

impl From<Vec<Message>> for PromptOutput {
    fn from(messages: Vec<Message>) -> Self {
        PromptOutput::Messages(messages.into_iter().map(MessageParam::Normalized).collect())
    }
}

impl From<Vec<MessageParam<Value>>> for PromptOutput {
    fn from(messages: Vec<MessageParam<Value>>) -> Self {
        PromptOutput::Messages(messages)
    }
}

impl From<DynamicConfig> for PromptOutput {
    fn from(config: DynamicConfig) -> Self {
        PromptOutput::Config(config)
    }
}

impl From<()> for PromptOutput {
    fn from(_: ()) -> Self {
        PromptOutput::Config(DynamicConfig::default())
    }
}

/// Renders a call's message template against the call arguments. Template
/// syntax belongs to the implementation.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, variables: &Value) -> Result<Vec<MessageParam<Value>>>;
}

// ---------------------------------------------------------------------------
// CallSpec
// ---------------------------------------------------------------------------

/// Static options of a call, fixed when the call is declared.
#[derive(Clone)]
pub struct CallSpec {
    pub provider: Provider,
    pub model: String,
    pub tools: Vec<ToolEntry>,
    pub response_model: Option<ResponseModelSpec>,
    pub json_mode: bool,
    pub call_params: CallParams,
    pub template: Option<Arc<dyn TemplateRenderer>>,
}

impl CallSpec {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            tools: Vec::new(),
            response_model: None,
            json_mode: false,
            call_params: CallParams::default(),
            template: None,
        }
    }
}

impl fmt::Debug for CallSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSpec")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .field("response_model", &self.response_model.as_ref().map(|r| &r.name))
            .field("json_mode", &self.json_mode)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CallRequest / PreparedCall
// ---------------------------------------------------------------------------

/// Schema the vendor should constrain JSON-mode output to, when it can.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFormat {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Vendor-neutral request handed to an adapter's `build_request`.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub provider: Provider,
    pub model: String,
    pub messages: Vec<MessageParam<Value>>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub params: CallParams,
    pub json_mode: bool,
    pub response_format: Option<ResponseFormat>,
    pub stream: bool,
}

/// Output of setup: the request, the tools a response may call, and the
/// vendor body ready to send.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub request: CallRequest,
    pub registry: ToolRegistry,
    pub body: Value,
    pub args: Value,
}

impl PreparedCall {
    pub fn vendor_request(&self) -> VendorRequest {
        VendorRequest {
            provider: self.request.provider,
            model: self.request.model.clone(),
            body: self.body.clone(),
            stream: self.request.stream,
        }
    }
}

// ---------------------------------------------------------------------------
// Setup state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    ResolveConfig,
    ResolveMessages,
    ResolveTools,
    BuildRequest,
    Ready,
}

enum PromptBody {
    Literal(String),
    Messages(Vec<MessageParam<Value>>),
    Empty,
}

struct Setup<'a, P> {
    state: SetupState,
    spec: &'a CallSpec,
    adapter: &'a dyn ProviderAdapter,
    args: &'a Value,
    stream: bool,
    prompt: Option<P>,
    body: PromptBody,
    config: DynamicConfig,
    messages: Vec<MessageParam<Value>>,
    registry: ToolRegistry,
    tool_choice: Option<ToolChoice>,
    params: CallParams,
    prepared: Option<PreparedCall>,
}

/// Turn a call declaration plus one invocation's arguments into a request
/// body for `adapter`. `prompt` runs exactly once.
pub fn setup_call<P>(
    spec: &CallSpec,
    adapter: &dyn ProviderAdapter,
    args: &Value,
    stream: bool,
    prompt: P,
) -> Result<PreparedCall>
where
    P: FnOnce() -> PromptOutput,
{
    let mut setup = Setup {
        state: SetupState::ResolveConfig,
        spec,
        adapter,
        args,
        stream,
        prompt: Some(prompt),
        body: PromptBody::Empty,
        config: DynamicConfig::default(),
        messages: Vec::new(),
        registry: ToolRegistry::new(),
        tool_choice: None,
        params: CallParams::default(),
        prepared: None,
    };
    while setup.state != SetupState::Ready {
        let from = setup.state;
        setup.state = setup.step()?;
        tracing::debug!(provider = %spec.provider, ?from, to = ?setup.state, "call setup");
    }
    setup
        .prepared
        .ok_or_else(|| PolycallError::configuration(spec.provider.as_str(), "setup ended early"))
}

impl<P: FnOnce() -> PromptOutput> Setup<'_, P> {
    fn error(&self, message: impl Into<String>) -> PolycallError {
        PolycallError::configuration(self.spec.provider.as_str(), message)
    }

    fn step(&mut self) -> Result<SetupState> {
        match self.state {
            SetupState::ResolveConfig => {
                self.resolve_config();
                Ok(SetupState::ResolveMessages)
            }
            SetupState::ResolveMessages => {
                self.resolve_messages()?;
                Ok(SetupState::ResolveTools)
            }
            SetupState::ResolveTools => {
                self.resolve_tools()?;
                Ok(SetupState::BuildRequest)
            }
            SetupState::BuildRequest => {
                self.build_request()?;
                Ok(SetupState::Ready)
            }
            SetupState::Ready => Ok(SetupState::Ready),
        }
    }

    fn resolve_config(&mut self) {
        let Some(prompt) = self.prompt.take() else {
            return;
        };
        match prompt() {
            PromptOutput::Literal(s) => self.body = PromptBody::Literal(s),
            PromptOutput::Messages(m) => self.body = PromptBody::Messages(m),
            PromptOutput::Config(c) => self.config = c,
        }
        self.params = match &self.config.call_params {
            Some(overrides) => self.spec.call_params.merged_with(overrides),
            None => self.spec.call_params.clone(),
        };
    }

    fn resolve_messages(&mut self) -> Result<()> {
        let body = std::mem::replace(&mut self.body, PromptBody::Empty);
        let config_messages = self.config.messages.take();
        let spec = self.spec;
        self.messages = match (&spec.template, body, config_messages) {
            (Some(_), PromptBody::Literal(_) | PromptBody::Messages(_), _) => {
                return Err(self.error("prompt returned messages but the call has a template"));
            }
            (Some(_), PromptBody::Empty, Some(_)) => {
                return Err(self.error("dynamic config messages conflict with the call template"));
            }
            (Some(template), PromptBody::Empty, None) => template.render(&self.template_variables())?,
            (None, PromptBody::Literal(text), _) => vec![Message::user(text).into()],
            (None, PromptBody::Messages(messages), _) => messages,
            (None, PromptBody::Empty, Some(messages)) => messages,
            (None, PromptBody::Empty, None) => Vec::new(),
        };
        if self.messages.is_empty() {
            return Err(self.error("the prompt produced no messages"));
        }
        Ok(())
    }

    fn template_variables(&self) -> Value {
        let mut vars = match self.args {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (k, v) in &self.config.computed_fields {
            vars.insert(k.clone(), v.clone());
        }
        Value::Object(vars)
    }

    fn resolve_tools(&mut self) -> Result<()> {
        let caps = self.adapter.capabilities();
        let tools = match self.config.tools.take() {
            Some(overrides) => overrides,
            None => self.spec.tools.clone(),
        };

        if let Some(model) = &self.spec.response_model {
            if !tools.is_empty() {
                return Err(self.error(format!(
                    "tools cannot be combined with response model '{}'",
                    model.name
                )));
            }
            if self.spec.json_mode {
                return Ok(());
            }
            if caps.tool_slots == 0 {
                return Err(self.error(format!(
                    "{} cannot call tools; enable json_mode to extract '{}'",
                    self.spec.provider, model.name
                )));
            }
            self.registry.register(model.tool_entry());
            self.tool_choice = Some(ToolChoice::Specific(model.name.clone()));
            return Ok(());
        }

        self.registry.extend(tools);
        if self.spec.json_mode && !self.registry.is_empty() {
            tracing::debug!(
                tools = self.registry.len(),
                "json mode drops the call's tools"
            );
            self.registry = ToolRegistry::new();
        }
        if self.registry.len() > caps.tool_slots {
            return Err(self.error(format!(
                "{} tools requested but {} accepts at most {}",
                self.registry.len(),
                self.spec.provider,
                caps.tool_slots
            )));
        }
        Ok(())
    }

    fn build_request(&mut self) -> Result<()> {
        let response_format = match (&self.spec.response_model, self.spec.json_mode) {
            (Some(model), true) => Some(ResponseFormat {
                name: model.name.clone(),
                description: model.description.clone(),
                schema: model.tool_parameters(),
            }),
            _ => None,
        };
        // Strict vendors enforce the schema through the response format.
        let caps = self.adapter.capabilities();
        let schema_enforced = caps.strict_schemas && caps.native_json_mode && response_format.is_some();
        if self.spec.json_mode && !schema_enforced {
            append_json_instruction(&mut self.messages, response_format.as_ref());
        }

        let request = CallRequest {
            provider: self.spec.provider,
            model: self.spec.model.clone(),
            messages: std::mem::take(&mut self.messages),
            tools: self.registry.definitions(),
            tool_choice: self.tool_choice.take(),
            params: std::mem::take(&mut self.params),
            json_mode: self.spec.json_mode,
            response_format,
            stream: self.stream,
        };
        let body = self.adapter.build_request(&request)?;
        self.prepared = Some(PreparedCall {
            request,
            registry: std::mem::take(&mut self.registry),
            body,
            args: self.args.clone(),
        });
        Ok(())
    }
}

/// Instruction asking for JSON output, with the target schema when known.
pub fn json_mode_instruction(format: Option<&ResponseFormat>) -> String {
    match format {
        Some(format) => {
            let schema = serde_json::to_string_pretty(&format.schema)
                .unwrap_or_else(|_| format.schema.to_string());
            format!(
                "Extract a valid JSON object instance from the content using this schema:\n\n{schema}"
            )
        }
        None => "Respond only with a valid JSON object.".to_string(),
    }
}

fn append_json_instruction(messages: &mut Vec<MessageParam<Value>>, format: Option<&ResponseFormat>) {
    let text = json_mode_instruction(format);
    if let Some(MessageParam::Normalized(last)) = messages.last_mut() {
        if last.role == Role::User {
            last.content.push(ContentPart::text(text));
            return;
        }
    }
    messages.push(Message::user(text).into());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
