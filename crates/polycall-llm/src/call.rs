use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::extract::{AsyncExtractStream, ExtractStream, ResponseModel, ResponseModelSpec};
use crate::handler::CallHandler;
use crate::invoke::{
    ensure_blocking_allowed, AsyncInvoker, BlockingHttpInvoker, HttpInvoker, Invoker,
};
use crate::response::CallResponse;
use crate::setup::{setup_call, CallSpec, PreparedCall, PromptOutput, TemplateRenderer};
use crate::stream::{AsyncCallStream, CallStream};
use crate::tool::{ToolEntry, Toolkit};
use crate::{CallParams, Provider, ProviderAdapter, ProviderRegistry};
use polycall_types::{PolycallError, Result};

type PromptFn<A> = Arc<dyn Fn(&A) -> PromptOutput + Send + Sync>;

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// A reusable LLM call: a prompt function bound to a provider and model.
///
/// `A` is the argument type the prompt is rendered from. It is also
/// serialized to JSON for templates and for response-model fields filled
/// from call arguments.
///
/// ```ignore
/// let recommend = Call::new(Provider::OpenAi, "gpt-4o-mini", |genre: &String| {
///     format!("Recommend a {genre} book")
/// });
/// let response = recommend.call(&"fantasy".to_string())?;
/// ```
pub struct Call<A> {
    spec: CallSpec,
    prompt: PromptFn<A>,
    adapters: ProviderRegistry,
    invoker: Option<Arc<dyn Invoker>>,
    async_invoker: Option<Arc<dyn AsyncInvoker>>,
    handlers: Vec<Arc<dyn CallHandler>>,
}

impl<A> Clone for Call<A> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            prompt: self.prompt.clone(),
            adapters: self.adapters.clone(),
            invoker: self.invoker.clone(),
            async_invoker: self.async_invoker.clone(),
            handlers: self.handlers.clone(),
        }
    }
}

impl<A> fmt::Debug for Call<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("spec", &self.spec)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl<A: Serialize + 'static> Call<A> {
    pub fn new<F, P>(provider: Provider, model: impl Into<String>, prompt: F) -> Self
    where
        F: Fn(&A) -> P + Send + Sync + 'static,
        P: Into<PromptOutput> + 'static,
    {
        Self {
            spec: CallSpec::new(provider, model),
            prompt: Arc::new(move |args: &A| prompt(args).into()),
            adapters: ProviderRegistry::with_defaults(),
            invoker: None,
            async_invoker: None,
            handlers: Vec::new(),
        }
    }

    // -- builder ------------------------------------------------------------

    pub fn tool(mut self, tool: ToolEntry) -> Self {
        self.spec.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolEntry>) -> Self {
        self.spec.tools.extend(tools);
        self
    }

    pub fn toolkit(self, toolkit: &dyn Toolkit) -> Self {
        self.tools(toolkit.create_tools())
    }

    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.spec.json_mode = enabled;
        self
    }

    pub fn call_params(mut self, params: CallParams) -> Self {
        self.spec.call_params = params;
        self
    }

    pub fn template(mut self, template: impl TemplateRenderer + 'static) -> Self {
        self.spec.template = Some(Arc::new(template));
        self
    }

    /// Blocking transport. Defaults to [`BlockingHttpInvoker`].
    pub fn client(mut self, invoker: impl Invoker + 'static) -> Self {
        self.invoker = Some(Arc::new(invoker));
        self
    }

    /// Async transport. Defaults to [`HttpInvoker`].
    pub fn async_client(mut self, invoker: impl AsyncInvoker + 'static) -> Self {
        self.async_invoker = Some(Arc::new(invoker));
        self
    }

    pub fn handler(mut self, handler: impl CallHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Replace the adapter used for its provider.
    pub fn adapter(mut self, adapter: impl ProviderAdapter + 'static) -> Self {
        self.adapters.register(adapter);
        self
    }

    /// Extract a runtime JSON schema instead of a typed model. See
    /// [`Call::extract_value`].
    pub fn response_schema(mut self, model: ResponseModelSpec) -> Self {
        self.spec.response_model = Some(model);
        self
    }

    /// Turn this call into a typed extraction of `T`.
    pub fn response_model<T: ResponseModel>(mut self) -> ExtractCall<A, T> {
        self.spec.response_model = Some(ResponseModelSpec::of::<T>());
        ExtractCall {
            inner: self,
            _model: PhantomData,
        }
    }

    pub fn spec(&self) -> &CallSpec {
        &self.spec
    }

    // -- operations ---------------------------------------------------------

    /// Run setup only and return the request that would be sent.
    pub fn prepare(&self, args: &A) -> Result<PreparedCall> {
        self.setup(args, false).map(|(call, _)| call)
    }

    pub fn call(&self, args: &A) -> Result<CallResponse> {
        self.call_prepared(args).map(|(_, response)| response)
    }

    pub async fn call_async(&self, args: &A) -> Result<CallResponse> {
        self.call_prepared_async(args)
            .await
            .map(|(_, response)| response)
    }

    pub fn stream(&self, args: &A) -> Result<CallStream> {
        let (call, adapter) = self.setup(args, true)?;
        for handler in &self.handlers {
            handler.before_call(&call);
        }
        let chunks = self.blocking_invoker()?.invoke_stream(&call.vendor_request())?;
        Ok(CallStream::new(call, adapter, chunks, self.handlers.clone()))
    }

    pub async fn stream_async(&self, args: &A) -> Result<AsyncCallStream> {
        let (call, adapter) = self.setup(args, true)?;
        for handler in &self.handlers {
            handler.before_call_async(&call).await;
        }
        let chunks = self
            .async_invoker()
            .invoke_stream(&call.vendor_request())
            .await?;
        Ok(AsyncCallStream::new(call, adapter, chunks, self.handlers.clone()))
    }

    /// Validated JSON for the schema set with [`Call::response_schema`].
    pub fn extract_value(&self, args: &A) -> Result<Value> {
        let model = self.response_spec()?;
        let (call, response) = self.call_prepared(args)?;
        let value = model.extract_value(&response, self.spec.json_mode, &call.args)?;
        for handler in &self.handlers {
            handler.handle_response_model(&call, &value);
        }
        Ok(value)
    }

    pub async fn extract_value_async(&self, args: &A) -> Result<Value> {
        let model = self.response_spec()?;
        let (call, response) = self.call_prepared_async(args).await?;
        let value = model.extract_value(&response, self.spec.json_mode, &call.args)?;
        for handler in &self.handlers {
            handler.handle_response_model_async(&call, &value).await;
        }
        Ok(value)
    }

    // -- internals ----------------------------------------------------------

    fn setup(&self, args: &A, stream: bool) -> Result<(PreparedCall, Arc<dyn ProviderAdapter>)> {
        let adapter = self.adapters.get(self.spec.provider)?;
        let args_value = serde_json::to_value(args)?;
        let call = setup_call(&self.spec, adapter.as_ref(), &args_value, stream, || {
            (self.prompt)(args)
        })?;
        Ok((call, adapter))
    }

    fn response_spec(&self) -> Result<&ResponseModelSpec> {
        self.spec.response_model.as_ref().ok_or_else(|| {
            PolycallError::configuration(self.spec.provider.as_str(), "no response model set")
        })
    }

    fn blocking_invoker(&self) -> Result<Arc<dyn Invoker>> {
        match &self.invoker {
            Some(invoker) => Ok(invoker.clone()),
            None => {
                ensure_blocking_allowed(self.spec.provider.as_str())?;
                Ok(Arc::new(BlockingHttpInvoker::new(HttpInvoker::with_adapters(
                    self.adapters.clone(),
                ))?))
            }
        }
    }

    fn async_invoker(&self) -> Arc<dyn AsyncInvoker> {
        match &self.async_invoker {
            Some(invoker) => invoker.clone(),
            None => Arc::new(HttpInvoker::with_adapters(self.adapters.clone())),
        }
    }

    fn call_prepared(&self, args: &A) -> Result<(PreparedCall, CallResponse)> {
        let (call, adapter) = self.setup(args, false)?;
        for handler in &self.handlers {
            handler.before_call(&call);
        }
        let start_time = Utc::now();
        let raw = self.blocking_invoker()?.invoke(&call.vendor_request())?;
        let response = Self::normalize(&call, adapter.as_ref(), raw, start_time)?;
        for handler in &self.handlers {
            handler.handle_call_response(&call, &response);
        }
        Ok((call, response))
    }

    async fn call_prepared_async(&self, args: &A) -> Result<(PreparedCall, CallResponse)> {
        let (call, adapter) = self.setup(args, false)?;
        for handler in &self.handlers {
            handler.before_call_async(&call).await;
        }
        let start_time = Utc::now();
        let raw = self
            .async_invoker()
            .invoke(&call.vendor_request())
            .await?;
        let response = Self::normalize(&call, adapter.as_ref(), raw, start_time)?;
        for handler in &self.handlers {
            handler.handle_call_response_async(&call, &response).await;
        }
        Ok((call, response))
    }

    fn normalize(
        call: &PreparedCall,
        adapter: &dyn ProviderAdapter,
        raw: Value,
        start_time: chrono::DateTime<Utc>,
    ) -> Result<CallResponse> {
        let output = adapter.parse_response(&raw)?;
        tracing::debug!(
            provider = %call.request.provider,
            tool_calls = output.message.tool_calls().count(),
            finish = ?output.finish_reasons,
            "normalized response"
        );
        CallResponse::from_output(call, output, raw, start_time)
    }
}

// ---------------------------------------------------------------------------
// ExtractCall
// ---------------------------------------------------------------------------

/// A [`Call`] whose output is parsed and validated into `T`.
pub struct ExtractCall<A, T> {
    inner: Call<A>,
    _model: PhantomData<fn() -> T>,
}

impl<A, T> Clone for ExtractCall<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _model: PhantomData,
        }
    }
}

impl<A: Serialize + 'static, T: ResponseModel> ExtractCall<A, T> {
    pub fn call(&self) -> &Call<A> {
        &self.inner
    }

    fn model(&self) -> Result<&ResponseModelSpec> {
        self.inner.response_spec()
    }

    pub fn extract(&self, args: &A) -> Result<T> {
        let model = self.model()?;
        let (call, response) = self.inner.call_prepared(args)?;
        let (value, out) = model.extract::<T>(&response, self.inner.spec.json_mode, &call.args)?;
        for handler in &self.inner.handlers {
            handler.handle_response_model(&call, &value);
        }
        Ok(out)
    }

    pub async fn extract_async(&self, args: &A) -> Result<T> {
        let model = self.model()?;
        let (call, response) = self.inner.call_prepared_async(args).await?;
        let (value, out) = model.extract::<T>(&response, self.inner.spec.json_mode, &call.args)?;
        for handler in &self.inner.handlers {
            handler.handle_response_model_async(&call, &value).await;
        }
        Ok(out)
    }

    pub fn extract_stream(&self, args: &A) -> Result<ExtractStream<T>> {
        let model = self.model()?.clone();
        let stream = self.inner.stream(args)?;
        Ok(ExtractStream::new(stream, model, self.inner.spec.json_mode))
    }

    pub async fn extract_stream_async(&self, args: &A) -> Result<AsyncExtractStream<T>> {
        let model = self.model()?.clone();
        let stream = self.inner.stream_async(args).await?;
        Ok(AsyncExtractStream::new(
            stream,
            model,
            self.inner.spec.json_mode,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::UsageTracker;
    use crate::invoke::{ChunkIter, ChunkStream, VendorRequest};
    use crate::setup::DynamicConfig;
    use crate::{CallParams, Message};
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays canned vendor payloads and records every request.
    #[derive(Clone, Default)]
    struct MockInvoker {
        response: Value,
        chunks: Vec<Value>,
        seen: Arc<Mutex<Vec<VendorRequest>>>,
    }

    impl MockInvoker {
        fn responding(response: Value) -> Self {
            Self {
                response,
                ..Default::default()
            }
        }

        fn streaming(chunks: Vec<Value>) -> Self {
            Self {
                chunks,
                ..Default::default()
            }
        }

        fn last_body(&self) -> Value {
            let seen = self.seen.lock().unwrap();
            seen.last().map(|r| r.body.clone()).unwrap_or_default()
        }
    }

    impl Invoker for MockInvoker {
        fn invoke(&self, request: &VendorRequest) -> Result<Value> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.response.clone())
        }

        fn invoke_stream(&self, request: &VendorRequest) -> Result<ChunkIter> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(Box::new(self.chunks.clone().into_iter().map(Ok)))
        }
    }

    #[async_trait]
    impl AsyncInvoker for MockInvoker {
        async fn invoke(&self, request: &VendorRequest) -> Result<Value> {
            Invoker::invoke(self, request)
        }

        async fn invoke_stream(&self, request: &VendorRequest) -> Result<ChunkStream> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(Box::pin(futures_util::stream::iter(
                self.chunks.clone().into_iter().map(Ok),
            )))
        }
    }

    /// A book recommendation.
    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Book {
        title: String,
        author: String,
    }

    #[derive(Debug, Clone, Default, Deserialize, PartialEq)]
    struct PartialBook {
        title: Option<String>,
        author: Option<String>,
    }

    impl ResponseModel for Book {
        type Partial = PartialBook;
    }

    fn text_response(text: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "finish_reason": "stop",
                "message": {"role": "assistant", "content": text}}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        })
    }

    fn tool_response(name: &str, arguments: &str) -> Value {
        json!({
            "id": "chatcmpl-2",
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "finish_reason": "tool_calls",
                "message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": name, "arguments": arguments}}
                ]}}],
            "usage": {"prompt_tokens": 20, "completion_tokens": 10, "total_tokens": 30}
        })
    }

    fn recommend() -> Call<String> {
        Call::new(Provider::OpenAi, "gpt-4o-mini", |genre: &String| {
            format!("Recommend a {genre} book")
        })
    }

    // Test 1: prompt renders into the vendor body
    #[test]
    fn prepare_renders_prompt() {
        let call = recommend()
            .call_params(CallParams {
                temperature: Some(0.2),
                ..Default::default()
            })
            .prepare(&"fantasy".to_string())
            .unwrap();
        assert_eq!(call.body["model"], "gpt-4o-mini");
        assert_eq!(
            call.body["messages"][0],
            json!({"role": "user", "content": "Recommend a fantasy book"})
        );
        assert_eq!(call.args, json!("fantasy"));
        assert!(!call.request.stream);
    }

    // Test 2: blocking call runs handlers around the invoker
    #[test]
    fn call_returns_normalized_response() {
        let tracker = UsageTracker::new();
        let invoker = MockInvoker::responding(text_response("Try Mistborn."));
        let response = recommend()
            .client(invoker.clone())
            .handler(tracker.clone())
            .call(&"fantasy".to_string())
            .unwrap();

        assert_eq!(response.content, "Try Mistborn.");
        assert_eq!(response.provider, Provider::OpenAi);
        assert_eq!(response.usage.total_tokens, 12);
        assert_eq!(tracker.calls(), 1);
        assert_eq!(tracker.total_input_tokens(), 9);
        assert_eq!(invoker.last_body()["messages"][0]["role"], "user");
    }

    // Test 3: typed extraction through the forced tool
    #[test]
    fn extract_book_from_tool_call() {
        let invoker = MockInvoker::responding(tool_response(
            "Book",
            r#"{"title": "The Name of the Wind", "author": "Patrick Rothfuss"}"#,
        ));
        let extractor = recommend().client(invoker.clone()).response_model::<Book>();
        let book = extractor.extract(&"fantasy".to_string()).unwrap();
        assert_eq!(
            book,
            Book {
                title: "The Name of the Wind".into(),
                author: "Patrick Rothfuss".into()
            }
        );

        let body = invoker.last_body();
        assert_eq!(body["tools"][0]["function"]["name"], "Book");
        assert_eq!(body["tool_choice"]["function"]["name"], "Book");
    }

    #[test]
    fn extract_reports_missing_fields() {
        let invoker = MockInvoker::responding(tool_response("Book", r#"{"title": "Dune"}"#));
        let err = recommend()
            .client(invoker)
            .response_model::<Book>()
            .extract(&"sci-fi".to_string())
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.field_errors().iter().any(|e| e.to_string().contains("author")));
    }

    // Test 4: json mode reads the object out of the text
    #[test]
    fn extract_in_json_mode() {
        let invoker = MockInvoker::responding(text_response(
            "Here you go: {\"title\": \"Dune\", \"author\": \"Frank Herbert\"}",
        ));
        let book = recommend()
            .client(invoker.clone())
            .json_mode(true)
            .response_model::<Book>()
            .extract(&"sci-fi".to_string())
            .unwrap();
        assert_eq!(book.author, "Frank Herbert");

        let body = invoker.last_body();
        assert!(body.get("tools").is_none());
        assert_eq!(body["response_format"]["type"], "json_schema");
    }

    #[test]
    fn explicit_tools_conflict_with_response_model() {
        let err = recommend()
            .client(MockInvoker::default())
            .tool(ToolEntry::from_fn("noop", "Does nothing.", |_: Value| {
                Ok("ok".to_string())
            }))
            .response_model::<Book>()
            .extract(&"x".to_string())
            .unwrap_err();
        assert!(matches!(err, PolycallError::Configuration { .. }));
    }

    // Test 5: dynamic config overrides the declared messages
    #[test]
    fn dynamic_config_messages() {
        let call = Call::new(Provider::Anthropic, "claude-sonnet-4-5", |topic: &String| {
            DynamicConfig::new().messages(vec![
                Message::system("You are a librarian.").into(),
                Message::user(format!("Something about {topic}")).into(),
            ])
        })
        .prepare(&"whales".to_string())
        .unwrap();
        assert_eq!(call.body["system"][0]["text"], "You are a librarian.");
        assert_eq!(call.body["messages"].as_array().map(Vec::len), Some(1));
    }

    // Test 6: blocking stream
    #[test]
    fn stream_accumulates_text() {
        let invoker = MockInvoker::streaming(vec![
            json!({"id": "c1", "model": "gpt-4o-mini", "choices": [{"index": 0, "delta": {"content": "Try "}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "Dune."}, "finish_reason": "stop"}]}),
        ]);
        let stream = recommend()
            .client(invoker.clone())
            .stream(&"sci-fi".to_string())
            .unwrap();
        let mut stream = stream;
        let texts: Vec<String> = stream
            .by_ref()
            .map(|chunk| chunk.unwrap().content())
            .collect();
        assert_eq!(texts, vec!["Try ", "Dune."]);
        let response = stream.finish().unwrap();
        assert_eq!(response.content, "Try Dune.");
        assert_eq!(invoker.last_body()["stream"], true);
    }

    #[test]
    fn extract_stream_yields_partials() {
        let invoker = MockInvoker::streaming(vec![
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function", "function": {"name": "Book", "arguments": ""}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"title\": \"Du"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "ne\", \"author\": \"Frank Herbert\"}"}}
            ]}, "finish_reason": "tool_calls"}]}),
        ]);
        let mut stream = recommend()
            .client(invoker)
            .response_model::<Book>()
            .extract_stream(&"sci-fi".to_string())
            .unwrap();
        let partials: Vec<PartialBook> = stream.by_ref().map(|p| p.unwrap()).collect();
        assert_eq!(partials[1].title.as_deref(), Some("Du"));
        assert_eq!(partials[2].author.as_deref(), Some("Frank Herbert"));
        assert_eq!(stream.finish().unwrap().title, "Dune");
    }

    // Test 7: async paths
    #[tokio::test]
    async fn call_async_uses_async_client() {
        let invoker = MockInvoker::responding(text_response("Try Hyperion."));
        let response = recommend()
            .async_client(invoker)
            .call_async(&"sci-fi".to_string())
            .await
            .unwrap();
        assert_eq!(response.content, "Try Hyperion.");
    }

    #[tokio::test]
    async fn extract_async_and_stream_async() {
        let invoker = MockInvoker {
            response: tool_response("Book", r#"{"title": "Hyperion", "author": "Dan Simmons"}"#),
            chunks: vec![
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "id": "call_1", "type": "function",
                     "function": {"name": "Book", "arguments": "{\"title\": \"Hyperion\", \"author\": \"Dan Simmons\"}"}}
                ]}, "finish_reason": "tool_calls"}]}),
            ],
            ..Default::default()
        };
        let extractor = recommend().async_client(invoker).response_model::<Book>();
        let book = extractor.extract_async(&"sci-fi".to_string()).await.unwrap();
        assert_eq!(book.author, "Dan Simmons");

        let mut stream = extractor
            .extract_stream_async(&"sci-fi".to_string())
            .await
            .unwrap();
        let first = stream.next_partial().await.unwrap().unwrap();
        assert_eq!(first.title.as_deref(), Some("Hyperion"));
        assert_eq!(stream.finish().await.unwrap().title, "Hyperion");
    }

    #[tokio::test]
    async fn blocking_call_inside_runtime_points_to_call_async() {
        let err = recommend().call(&"fantasy".to_string()).unwrap_err();
        match err {
            PolycallError::Configuration { provider, message } => {
                assert_eq!(provider, "openai");
                assert!(message.contains("call_async"));
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
        assert!(recommend().stream(&"fantasy".to_string()).is_err());
    }

    // Test 8: runtime schema extraction
    #[test]
    fn extract_value_with_runtime_schema() {
        let schema = json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        });
        let invoker = MockInvoker::responding(tool_response("Place", r#"{"city": "Lisbon"}"#));
        let call = recommend()
            .client(invoker)
            .response_schema(ResponseModelSpec::from_schema("Place", schema));
        assert_eq!(
            call.extract_value(&"travel".to_string()).unwrap(),
            json!({"city": "Lisbon"})
        );
    }

    #[test]
    fn extract_value_without_schema_is_configuration_error() {
        let err = recommend()
            .client(MockInvoker::responding(text_response("x")))
            .extract_value(&"x".to_string())
            .unwrap_err();
        assert!(matches!(err, PolycallError::Configuration { .. }));
    }
}
