//! Shared error taxonomy for the polycall provider abstraction layer.
//!
//! This crate provides the foundational types used across the other polycall crates:
//! - `PolycallError`: unified error taxonomy (conversion, setup, tool, stream, extraction, transport)
//! - `FieldError`: one field-level validation failure, renderable back into a prompt
//! - `Result<T>`: crate-wide result alias

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// FieldError: a single field-level validation failure
// ---------------------------------------------------------------------------

/// A validation failure located at a JSON path inside a tool-call argument
/// set or an extracted object.
///
/// `path` uses JSON-pointer syntax (`/books/0/title`); an empty path refers to
/// the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// A failure that applies to the value as a whole.
    pub fn root(message: impl Into<String>) -> Self {
        Self::new("", message)
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn preview(buffer: &str) -> String {
    const MAX: usize = 200;
    if buffer.chars().count() <= MAX {
        buffer.to_string()
    } else {
        let head: String = buffer.chars().take(MAX).collect();
        format!("{head}...")
    }
}

// ---------------------------------------------------------------------------
// PolycallError
// ---------------------------------------------------------------------------

/// Unified error type for all polycall subsystems.
#[derive(Debug, thiserror::Error)]
pub enum PolycallError {
    // === Conversion Errors ===
    #[error("{provider} does not support {kind} content in {role} messages")]
    UnsupportedContent {
        provider: String,
        kind: String,
        role: String,
    },

    // === Setup Errors ===
    #[error("Invalid call configuration for {provider}: {message}")]
    Configuration { provider: String, message: String },

    // === Tool Errors ===
    #[error("{provider} called tool '{name}' which is not registered for this call")]
    ToolNotFound { provider: String, name: String },

    #[error("Arguments for tool '{tool}' from {provider} failed validation: {}", join_errors(.errors))]
    ArgumentValidation {
        provider: String,
        tool: String,
        errors: Vec<FieldError>,
    },

    // === Stream Errors ===
    #[error("Tool call {index} streamed by {provider} never became valid JSON: {}", preview(.buffer))]
    MalformedToolCall {
        provider: String,
        index: usize,
        buffer: String,
    },

    // === Extraction Errors ===
    #[error("Output from {provider} failed validation: {}", join_errors(.errors))]
    ExtractionValidation {
        provider: String,
        errors: Vec<FieldError>,
    },

    // === Transport Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    // === Generic ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PolycallError {
    /// Returns `true` if the error is transient and the same request may
    /// succeed when sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PolycallError::RateLimited { .. }
                | PolycallError::RequestTimeout { .. }
                | PolycallError::ProviderError {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` only for structured-output validation failures, the
    /// errors a re-prompting retry loop is expected to feed back to the model.
    pub fn is_validation(&self) -> bool {
        matches!(self, PolycallError::ExtractionValidation { .. })
    }

    /// Field-level errors carried by validation failures.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            PolycallError::ExtractionValidation { errors, .. }
            | PolycallError::ArgumentValidation { errors, .. } => errors,
            _ => &[],
        }
    }

    /// Name of the provider the error originated from, when known.
    pub fn provider(&self) -> Option<&str> {
        match self {
            PolycallError::UnsupportedContent { provider, .. }
            | PolycallError::Configuration { provider, .. }
            | PolycallError::ToolNotFound { provider, .. }
            | PolycallError::ArgumentValidation { provider, .. }
            | PolycallError::MalformedToolCall { provider, .. }
            | PolycallError::ExtractionValidation { provider, .. }
            | PolycallError::ProviderError { provider, .. }
            | PolycallError::RateLimited { provider, .. }
            | PolycallError::AuthError { provider }
            | PolycallError::RequestTimeout { provider, .. } => Some(provider),
            PolycallError::Json(_) | PolycallError::Other(_) => None,
        }
    }

    pub fn configuration(provider: impl Into<String>, message: impl Into<String>) -> Self {
        PolycallError::Configuration {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// A convenience alias for `Result<T, PolycallError>`.
pub type Result<T> = std::result::Result<T, PolycallError>;
