use std::marker::PhantomData;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::partial_json::parse_partial;
use crate::response::CallResponse;
use crate::stream::{AsyncCallStream, CallStream, PartialResponse};
use crate::tool::{
    compile_schema, drop_optional_nulls, json_schema_for, parameters_from_schema, schema_errors,
    serde_field_error, without_fields, ToolEntry, ToolHandler, DEFAULT_TOOL_DESCRIPTION,
};
use crate::{Provider, ToolDefinition};
use polycall_types::{FieldError, PolycallError, Result};

// ---------------------------------------------------------------------------
// ResponseModel
// ---------------------------------------------------------------------------

/// A type the model's output can be extracted into.
///
/// `Partial` is the shape yielded while streaming: every field optional, so
/// it can be filled from an incomplete document.
pub trait ResponseModel: DeserializeOwned + JsonSchema + Send + 'static {
    type Partial: DeserializeOwned + Default + Clone + Send;

    /// Non-object types travel on the wire wrapped as `{"value": ...}`.
    fn wrapped() -> bool {
        false
    }

    /// Fields filled from the call's own arguments instead of by the model.
    /// They are hidden from the schema the model sees.
    fn call_arg_fields() -> &'static [&'static str] {
        &[]
    }

    /// Semantic checks beyond the schema.
    fn validate(&self) -> std::result::Result<(), Vec<FieldError>> {
        Ok(())
    }
}

macro_rules! wrapped_response_model {
    ($($ty:ty),*) => {
        $(
            impl ResponseModel for $ty {
                type Partial = Option<$ty>;

                fn wrapped() -> bool {
                    true
                }
            }
        )*
    };
}

wrapped_response_model!(String, bool, i64, f64, Vec<String>);

// ---------------------------------------------------------------------------
// ResponseModelSpec
// ---------------------------------------------------------------------------

/// Type-erased description of a response model: what the model is shown and
/// what its output is validated against.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseModelSpec {
    pub name: String,
    pub description: String,
    /// Schema of the final value, after unwrapping and call-argument merge.
    pub schema: Value,
    pub wrapped: bool,
    pub call_arg_fields: Vec<String>,
}

/// Response-model tools only carry the arguments back; extraction does the
/// validating.
struct PassThrough;

impl ToolHandler for PassThrough {
    fn validate(&self, _arguments: &Value) -> std::result::Result<(), Vec<FieldError>> {
        Ok(())
    }

    fn invoke(&self, arguments: &Value) -> Result<String> {
        Ok(arguments.to_string())
    }
}

impl ResponseModelSpec {
    pub fn of<T: ResponseModel>() -> Self {
        let schema = json_schema_for::<T>();
        let description = schema
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_TOOL_DESCRIPTION.to_string());
        Self {
            name: T::schema_name().into_owned(),
            description,
            schema,
            wrapped: T::wrapped(),
            call_arg_fields: T::call_arg_fields().iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Response model from a raw JSON schema. Non-object schemas are wrapped.
    pub fn from_schema(name: impl Into<String>, schema: Value) -> Self {
        let description = schema
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_TOOL_DESCRIPTION.to_string());
        let wrapped = schema.get("type").and_then(Value::as_str) != Some("object");
        Self {
            name: name.into(),
            description,
            schema,
            wrapped,
            call_arg_fields: Vec::new(),
        }
    }

    /// Parameter schema shown to the model.
    pub fn tool_parameters(&self) -> Value {
        let parameters = if self.wrapped {
            let mut value = self.schema.clone();
            if let Some(map) = value.as_object_mut() {
                map.remove("$schema");
                map.remove("title");
            }
            json!({
                "type": "object",
                "properties": {"value": value},
                "required": ["value"],
            })
        } else {
            parameters_from_schema(self.schema.clone()).0
        };
        let hidden: Vec<&str> = self.call_arg_fields.iter().map(String::as_str).collect();
        without_fields(parameters, &hidden)
    }

    pub fn tool_entry(&self) -> ToolEntry {
        ToolEntry::new(
            ToolDefinition {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.tool_parameters(),
            },
            Arc::new(PassThrough),
        )
    }

    fn unwrap(&self, value: Value) -> Value {
        if !self.wrapped {
            return value;
        }
        match value {
            Value::Object(mut map) if map.contains_key("value") => {
                map.remove("value").unwrap_or(Value::Null)
            }
            other => other,
        }
    }

    fn merge_call_args(&self, value: &mut Value, args: &Value) {
        if let Value::Object(map) = value {
            for field in &self.call_arg_fields {
                if let Some(arg) = args.get(field) {
                    map.insert(field.clone(), arg.clone());
                }
            }
        }
    }

    /// Pull the raw output out of a response, unwrap it, fill call-argument
    /// fields and validate it against the schema.
    pub fn extract_value(
        &self,
        response: &CallResponse,
        json_mode: bool,
        args: &Value,
    ) -> Result<Value> {
        let provider = response.provider;
        let raw = if json_mode {
            find_json(&response.content).ok_or_else(|| {
                invalid(
                    provider,
                    vec![FieldError::root("response did not contain a JSON value")],
                )
            })?
        } else {
            let call = response
                .tool_calls
                .iter()
                .find(|c| c.name == self.name)
                .ok_or_else(|| {
                    invalid(
                        provider,
                        vec![FieldError::root(format!(
                            "response did not call tool '{}'",
                            self.name
                        ))],
                    )
                })?;
            if let Value::String(text) = &call.arguments {
                return Err(invalid(
                    provider,
                    vec![FieldError::root(format!("arguments are not valid JSON: {text}"))],
                ));
            }
            call.arguments.clone()
        };

        let mut value = self.unwrap(raw);
        self.merge_call_args(&mut value, args);
        drop_optional_nulls(&self.schema, &mut value);

        let validator = compile_schema(provider.as_str(), &self.schema)?;
        let errors = schema_errors(&validator, &value);
        if !errors.is_empty() {
            return Err(invalid(provider, errors));
        }
        Ok(value)
    }

    /// Typed extraction. Returns the validated JSON alongside the value.
    pub fn extract<T: ResponseModel>(
        &self,
        response: &CallResponse,
        json_mode: bool,
        args: &Value,
    ) -> Result<(Value, T)> {
        let value = self.extract_value(response, json_mode, args)?;
        let out: T = serde_json::from_value(value.clone())
            .map_err(|e| invalid(response.provider, vec![serde_field_error(&e)]))?;
        out.validate()
            .map_err(|errors| invalid(response.provider, errors))?;
        Ok((value, out))
    }

    /// Lenient view of the output streamed so far. Never fails.
    pub fn partial_value(&self, partial: &PartialResponse, json_mode: bool, args: &Value) -> Option<Value> {
        let buffer = if json_mode {
            let text = partial.text();
            let start = text.find(['{', '['])?;
            &text[start..]
        } else {
            let (_, fragment) = partial.tool_calls().find(|(_, f)| f.name == self.name)?;
            fragment.arguments.as_str()
        };
        let mut value = parse_partial(buffer)?;
        if self.wrapped {
            value = value.get("value")?.clone();
        }
        self.merge_call_args(&mut value, args);
        Some(value)
    }
}

fn invalid(provider: Provider, errors: Vec<FieldError>) -> PolycallError {
    PolycallError::ExtractionValidation {
        provider: provider.as_str().into(),
        errors,
    }
}

/// First JSON value in `text`: the whole text if it parses, otherwise the
/// first balanced `{...}` or `[...]` block (so fenced or chatty output works).
pub fn find_json(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text.trim()) {
        return Some(v);
    }
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(['{', '[']) {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_str = false;
        let mut escape = false;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_str {
                if escape {
                    escape = false;
                } else if b == b'\\' {
                    escape = true;
                } else if b == b'"' {
                    in_str = false;
                }
                continue;
            }
            match b {
                b'"' => in_str = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        if let Ok(v) = serde_json::from_str(&text[start..=i]) {
                            return Some(v);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

// ---------------------------------------------------------------------------
// ExtractStream
// ---------------------------------------------------------------------------

/// Stream of partial response models. Each item is the best partial value
/// so far; a chunk that does not yet decode repeats the previous partial.
pub struct ExtractStream<T: ResponseModel> {
    inner: CallStream,
    model: ResponseModelSpec,
    json_mode: bool,
    last: T::Partial,
    _model: PhantomData<fn() -> T>,
}

impl<T: ResponseModel> ExtractStream<T> {
    pub(crate) fn new(inner: CallStream, model: ResponseModelSpec, json_mode: bool) -> Self {
        Self {
            inner,
            model,
            json_mode,
            last: T::Partial::default(),
            _model: PhantomData,
        }
    }

    pub fn partial(&self) -> &PartialResponse {
        self.inner.partial()
    }

    /// Drain the stream and validate the final value.
    pub fn finish(self) -> Result<T> {
        let call = self.inner.call().clone();
        let handlers = self.inner.handlers().to_vec();
        let response = self.inner.finish()?;
        let (value, out) = self.model.extract::<T>(&response, self.json_mode, &call.args)?;
        for handler in &handlers {
            handler.handle_response_model(&call, &value);
        }
        Ok(out)
    }
}

impl<T: ResponseModel> Iterator for ExtractStream<T> {
    type Item = Result<T::Partial>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.inner.next()?;
        Some(chunk.map(|_| {
            let args = &self.inner.call().args;
            if let Some(value) = self.model.partial_value(self.inner.partial(), self.json_mode, args) {
                if let Ok(partial) = serde_json::from_value(value) {
                    self.last = partial;
                }
            }
            self.last.clone()
        }))
    }
}

/// Async counterpart of [`ExtractStream`].
pub struct AsyncExtractStream<T: ResponseModel> {
    inner: AsyncCallStream,
    model: ResponseModelSpec,
    json_mode: bool,
    last: T::Partial,
    _model: PhantomData<fn() -> T>,
}

impl<T: ResponseModel> AsyncExtractStream<T> {
    pub(crate) fn new(inner: AsyncCallStream, model: ResponseModelSpec, json_mode: bool) -> Self {
        Self {
            inner,
            model,
            json_mode,
            last: T::Partial::default(),
            _model: PhantomData,
        }
    }

    pub fn partial(&self) -> &PartialResponse {
        self.inner.partial()
    }

    pub async fn next_partial(&mut self) -> Option<Result<T::Partial>> {
        let chunk = self.inner.next_chunk().await?;
        Some(chunk.map(|_| {
            let args = &self.inner.call().args;
            if let Some(value) = self.model.partial_value(self.inner.partial(), self.json_mode, args) {
                if let Ok(partial) = serde_json::from_value(value) {
                    self.last = partial;
                }
            }
            self.last.clone()
        }))
    }

    pub async fn finish(self) -> Result<T> {
        let call = self.inner.call().clone();
        let handlers = self.inner.handlers().to_vec();
        let response = self.inner.finish().await?;
        let (value, out) = self.model.extract::<T>(&response, self.json_mode, &call.args)?;
        for handler in &handlers {
            handler.handle_response_model_async(&call, &value).await;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
