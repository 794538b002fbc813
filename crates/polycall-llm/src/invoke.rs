use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::{Provider, ProviderAdapter, ProviderRegistry};
use polycall_types::{PolycallError, Result};

// ---------------------------------------------------------------------------
// Invoker traits
// ---------------------------------------------------------------------------

/// A fully built vendor request.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorRequest {
    pub provider: Provider,
    pub model: String,
    pub body: Value,
    pub stream: bool,
}

pub type ChunkIter = Box<dyn Iterator<Item = Result<Value>> + Send>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Sends vendor requests on the calling thread.
pub trait Invoker: Send + Sync {
    fn invoke(&self, request: &VendorRequest) -> Result<Value>;

    /// Raw stream chunks, one JSON value per vendor event.
    fn invoke_stream(&self, request: &VendorRequest) -> Result<ChunkIter>;
}

#[async_trait]
pub trait AsyncInvoker: Send + Sync {
    async fn invoke(&self, request: &VendorRequest) -> Result<Value>;

    async fn invoke_stream(&self, request: &VendorRequest) -> Result<ChunkStream>;
}

// ---------------------------------------------------------------------------
// HttpInvoker
// ---------------------------------------------------------------------------

/// Sends requests over HTTPS using each adapter's endpoint and auth headers.
/// API keys and base URLs fall back to the adapter's environment variables.
#[derive(Clone)]
pub struct HttpInvoker {
    http: reqwest::Client,
    adapters: ProviderRegistry,
    api_keys: HashMap<Provider, String>,
    base_urls: HashMap<Provider, String>,
    timeout: Option<Duration>,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self::with_adapters(ProviderRegistry::with_defaults())
    }

    pub fn with_adapters(adapters: ProviderRegistry) -> Self {
        Self {
            http: reqwest::Client::new(),
            adapters,
            api_keys: HashMap::new(),
            base_urls: HashMap::new(),
            timeout: None,
        }
    }

    pub fn with_api_key(mut self, provider: Provider, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider, key.into());
        self
    }

    pub fn with_base_url(mut self, provider: Provider, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn api_key(&self, adapter: &dyn ProviderAdapter) -> Result<String> {
        if let Some(key) = self.api_keys.get(&adapter.provider()) {
            return Ok(key.clone());
        }
        std::env::var(adapter.api_key_env()).map_err(|_| PolycallError::AuthError {
            provider: adapter.name().into(),
        })
    }

    fn url(&self, adapter: &dyn ProviderAdapter, request: &VendorRequest) -> Result<String> {
        let base_url = self
            .base_urls
            .get(&request.provider)
            .cloned()
            .unwrap_or_else(|| adapter.default_base_url());
        if base_url.is_empty() {
            return Err(PolycallError::configuration(
                adapter.name(),
                "no base URL configured",
            ));
        }
        Ok(adapter.endpoint(base_url.trim_end_matches('/'), &request.model, request.stream))
    }

    async fn send(&self, request: &VendorRequest) -> Result<reqwest::Response> {
        let adapter = self.adapters.get(request.provider)?;
        let url = self.url(adapter.as_ref(), request)?;
        let api_key = self.api_key(adapter.as_ref())?;
        let provider = adapter.name().to_string();

        let mut builder = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&request.body);
        for (name, value) in adapter.auth_headers(&api_key) {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        tracing::debug!(provider = %provider, url = %url, stream = request.stream, "sending request");
        let resp = builder.send().await.map_err(|e| {
            tracing::error!(provider = %provider, error = %e, "request failed");
            self.transport_error(&provider, e)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(&provider, status.as_u16(), &body));
        }
        Ok(resp)
    }

    fn transport_error(&self, provider: &str, e: reqwest::Error) -> PolycallError {
        match self.timeout {
            Some(timeout) if e.is_timeout() => PolycallError::RequestTimeout {
                provider: provider.into(),
                timeout_ms: timeout.as_millis() as u64,
            },
            _ => PolycallError::ProviderError {
                provider: provider.into(),
                status: 0,
                message: e.to_string(),
                retryable: true,
            },
        }
    }
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncInvoker for HttpInvoker {
    async fn invoke(&self, request: &VendorRequest) -> Result<Value> {
        let resp = self.send(request).await?;
        let status = resp.status().as_u16();
        let provider = request.provider.as_str();
        let body = resp.text().await.map_err(|e| self.transport_error(provider, e))?;
        serde_json::from_str(&body).map_err(|e| PolycallError::ProviderError {
            provider: provider.into(),
            status,
            message: format!("Failed to parse response JSON: {e}"),
            retryable: false,
        })
    }

    async fn invoke_stream(&self, request: &VendorRequest) -> Result<ChunkStream> {
        let resp = self.send(request).await?;
        let provider = request.provider;
        let events = resp.bytes_stream().eventsource();

        let chunks = events.filter_map(move |event| {
            let item = match event {
                Ok(event) => decode_event(provider.as_str(), &event.event, &event.data),
                Err(e) => Some(Err(PolycallError::ProviderError {
                    provider: provider.as_str().into(),
                    status: 0,
                    message: format!("stream error: {e}"),
                    retryable: true,
                })),
            };
            async move { item }
        });
        Ok(Box::pin(chunks))
    }
}

/// Decodes one SSE event into a chunk. Keep-alives and the `[DONE]` sentinel
/// yield nothing; any other data that is not JSON is a transport error.
pub(crate) fn decode_event(provider: &str, event: &str, data: &str) -> Option<Result<Value>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" || event == "ping" {
        return None;
    }
    Some(serde_json::from_str(data).map_err(|e| {
        tracing::error!(provider = %provider, error = %e, "unparseable SSE event");
        PolycallError::ProviderError {
            provider: provider.into(),
            status: 0,
            message: format!("malformed stream event: {e}"),
            retryable: false,
        }
    }))
}

// ---------------------------------------------------------------------------
// BlockingHttpInvoker
// ---------------------------------------------------------------------------

/// [`HttpInvoker`] driven by its own single-threaded runtime. Every entry point
/// refuses to run inside an async context, where blocking would panic.
#[derive(Clone)]
pub struct BlockingHttpInvoker {
    inner: HttpInvoker,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl BlockingHttpInvoker {
    pub fn new(inner: HttpInvoker) -> Result<Self> {
        ensure_blocking_allowed("http")?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PolycallError::Other(format!("failed to start runtime: {e}")))?;
        Ok(Self {
            inner,
            runtime: Arc::new(runtime),
        })
    }
}

/// Fails when called on a thread that is already driving a tokio runtime.
pub(crate) fn ensure_blocking_allowed(provider: &str) -> Result<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(PolycallError::configuration(
            provider,
            "blocking call made inside an async runtime; use call_async or stream_async instead",
        ));
    }
    Ok(())
}

struct BlockingChunks {
    runtime: Arc<tokio::runtime::Runtime>,
    stream: ChunkStream,
}

impl Iterator for BlockingChunks {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = ensure_blocking_allowed("http") {
            return Some(Err(e));
        }
        self.runtime.block_on(self.stream.next())
    }
}

impl Invoker for BlockingHttpInvoker {
    fn invoke(&self, request: &VendorRequest) -> Result<Value> {
        ensure_blocking_allowed(request.provider.as_str())?;
        self.runtime.block_on(self.inner.invoke(request))
    }

    fn invoke_stream(&self, request: &VendorRequest) -> Result<ChunkIter> {
        ensure_blocking_allowed(request.provider.as_str())?;
        let stream = self.runtime.block_on(self.inner.invoke_stream(request))?;
        Ok(Box::new(BlockingChunks {
            runtime: self.runtime.clone(),
            stream,
        }))
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) fn map_http_error(provider: &str, status: u16, body: &str) -> PolycallError {
    match status {
        429 => {
            let retry_ms = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["error"]["retry_after"].as_f64())
                .map(|s| (s * 1000.0) as u64)
                .unwrap_or(1000);
            PolycallError::RateLimited {
                provider: provider.into(),
                retry_after_ms: retry_ms,
            }
        }
        401 | 403 => PolycallError::AuthError {
            provider: provider.into(),
        },
        500 | 502 | 503 | 529 => PolycallError::ProviderError {
            provider: provider.into(),
            status,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => PolycallError::ProviderError {
            provider: provider.into(),
            status,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

/// Vendors nest the message differently: `error.message`, `message` or a
/// bare `error` string.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v["error"]["message"]
                .as_str()
                .or_else(|| v["message"].as_str())
                .or_else(|| v["error"].as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: 429 with retry_after in body
    #[test]
    fn rate_limit_reads_retry_after() {
        let err = map_http_error(
            "anthropic",
            429,
            r#"{"error": {"message": "slow down", "retry_after": 2.5}}"#,
        );
        match err {
            PolycallError::RateLimited { retry_after_ms, .. } => assert_eq!(retry_after_ms, 2500),
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert!(map_http_error("openai", 429, "").is_retryable());
    }

    // Test 2: auth failures
    #[test]
    fn unauthorized_is_auth_error() {
        let err = map_http_error("openai", 401, "{}");
        assert!(matches!(err, PolycallError::AuthError { .. }));
        assert!(!err.is_retryable());
    }

    // Test 3: server errors are retryable, client errors are not
    #[test]
    fn status_classification() {
        let err = map_http_error("gemini", 503, r#"{"error": {"message": "overloaded"}}"#);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("overloaded"));

        let err = map_http_error("mistral", 400, r#"{"message": "bad field"}"#);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("bad field"));
    }

    #[test]
    fn unparseable_error_body_is_kept() {
        let err = map_http_error("cohere", 418, "teapot");
        assert!(err.to_string().contains("teapot"));
    }

    // Test 4: missing base URL is reported before any network I/O
    #[tokio::test]
    async fn missing_base_url_is_configuration_error() {
        let invoker = HttpInvoker::new()
            .with_base_url(Provider::Azure, "")
            .with_api_key(Provider::Azure, "k");
        let request = VendorRequest {
            provider: Provider::Azure,
            model: "gpt-4o".into(),
            body: serde_json::json!({}),
            stream: false,
        };
        let err = invoker.invoke(&request).await.unwrap_err();
        assert!(matches!(err, PolycallError::Configuration { .. }));
    }

    #[tokio::test]
    async fn explicit_key_wins_over_environment() {
        let invoker = HttpInvoker::new().with_api_key(Provider::Mistral, "explicit");
        let adapter = invoker.adapters.get(Provider::Mistral).unwrap();
        assert_eq!(invoker.api_key(adapter.as_ref()).unwrap(), "explicit");
    }

    // Test 5: SSE framing
    #[test]
    fn sentinels_and_pings_are_skipped() {
        assert!(decode_event("openai", "", "[DONE]").is_none());
        assert!(decode_event("openai", "", "  ").is_none());
        assert!(decode_event("anthropic", "ping", "{}").is_none());
        let chunk = decode_event("openai", "", r#"{"id": "c1"}"#).unwrap().unwrap();
        assert_eq!(chunk["id"], "c1");
    }

    #[test]
    fn malformed_data_frame_is_an_error() {
        let err = decode_event("mistral", "", r#"{"choices": [{"delta": "#)
            .unwrap()
            .unwrap_err();
        match err {
            PolycallError::ProviderError { provider, message, .. } => {
                assert_eq!(provider, "mistral");
                assert!(message.contains("malformed stream event"));
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    // Test 6: blocking transport inside a runtime
    #[tokio::test]
    async fn blocking_invoker_refuses_async_context() {
        let err = BlockingHttpInvoker::new(HttpInvoker::new()).err().unwrap();
        match err {
            PolycallError::Configuration { message, .. } => {
                assert!(message.contains("call_async"))
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[test]
    fn blocking_invoker_builds_outside_a_runtime() {
        assert!(BlockingHttpInvoker::new(HttpInvoker::new()).is_ok());
    }
}
