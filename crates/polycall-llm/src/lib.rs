//! Provider-agnostic LLM calls with tools, streaming and structured
//! extraction.
//!
//! A [`Call`] binds a prompt function to a provider and model. Setup turns
//! the prompt into normalized [`Message`]s, each vendor adapter converts
//! them to its native wire format, and responses come back as a
//! [`CallResponse`] regardless of vendor. Supported vendors: OpenAI, Azure
//! OpenAI, Groq, Anthropic, Gemini, Vertex AI, Mistral and Cohere.

mod anthropic;
pub mod call;
mod cohere;
pub mod extract;
mod gemini;
pub mod handler;
pub mod invoke;
mod mistral;
mod openai;
pub mod partial_json;
mod provider;
pub mod response;
pub mod retry;
pub mod setup;
pub mod stream;
pub mod tool;
mod types;

pub use anthropic::{AnthropicAdapter, AnthropicBlock, AnthropicContent, AnthropicMessage};
pub use call::{Call, ExtractCall};
pub use cohere::{CohereAdapter, CohereContent, CohereMessage};
pub use extract::{find_json, ExtractStream, ResponseModel, ResponseModelSpec};
pub use gemini::{gemini_schema, GeminiAdapter, GeminiContent, GeminiPart};
pub use handler::{CallHandler, LoggingHandler, UsageTracker};
pub use invoke::{AsyncInvoker, BlockingHttpInvoker, HttpInvoker, Invoker, VendorRequest};
pub use mistral::{MistralAdapter, MistralContent, MistralMessage};
pub use openai::{OpenAiAdapter, OpenAiContent, OpenAiMessage};
pub use provider::*;
pub use response::CallResponse;
pub use setup::{CallSpec, DynamicConfig, PromptOutput, TemplateRenderer};
pub use stream::{CallResponseChunk, CallStream, PartialResponse, StreamDelta};
pub use tool::{Tool, ToolEntry, ToolInstance, ToolRegistry, Toolkit};
pub use types::*;

pub use polycall_types::{FieldError, PolycallError, Result};
