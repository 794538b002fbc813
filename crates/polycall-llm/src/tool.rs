use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use schemars::generate::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{ContentPart, Message, Provider, ToolCallData, ToolDefinition};
use polycall_types::{FieldError, PolycallError, Result};

/// Description used when a tool or response model has no doc comment.
pub const DEFAULT_TOOL_DESCRIPTION: &str = "Correctly formatted and typed parameters extracted \
from the completion. Must include required parameters and may exclude optional parameters \
unless present in the text.";

// ---------------------------------------------------------------------------
// Schema derivation
// ---------------------------------------------------------------------------

/// JSON Schema for `T` with every subschema inlined, so vendors that do not
/// resolve `$ref` can consume it directly.
pub fn json_schema_for<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        })
        .into_generator();
    let schema = generator.into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Split a root schema into tool parameters and the doc-comment description.
pub(crate) fn parameters_from_schema(schema: Value) -> (Value, Option<String>) {
    let mut map = match schema {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.remove("$schema");
    map.remove("title");
    let description = map
        .remove("description")
        .and_then(|d| d.as_str().map(str::to_string));
    map.entry("type")
        .or_insert_with(|| Value::String("object".into()));
    map.entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    (Value::Object(map), description)
}

/// Remove `fields` from a parameters schema's `properties` and `required`.
pub(crate) fn without_fields(mut parameters: Value, fields: &[&str]) -> Value {
    if let Some(props) = parameters
        .get_mut("properties")
        .and_then(Value::as_object_mut)
    {
        for f in fields {
            props.remove(*f);
        }
    }
    if let Some(required) = parameters
        .get_mut("required")
        .and_then(Value::as_array_mut)
    {
        required.retain(|r| !r.as_str().is_some_and(|name| fields.contains(&name)));
    }
    parameters
}

/// Visit every schema node reachable through the structural keywords
/// (`properties`, `items`, combinators, definitions). Property names are
/// never treated as keywords.
pub(crate) fn walk_schema(node: &mut Value, visit: &mut dyn FnMut(&mut Map<String, Value>)) {
    let Value::Object(map) = node else {
        return;
    };
    visit(map);
    if let Some(Value::Object(props)) = map.get_mut("properties") {
        for child in props.values_mut() {
            walk_schema(child, visit);
        }
    }
    for key in ["$defs", "definitions"] {
        if let Some(Value::Object(defs)) = map.get_mut(key) {
            for child in defs.values_mut() {
                walk_schema(child, visit);
            }
        }
    }
    match map.get_mut("items") {
        Some(Value::Array(items)) => items.iter_mut().for_each(|c| walk_schema(c, visit)),
        Some(items) if items.is_object() => walk_schema(items, visit),
        _ => {}
    }
    for key in ["anyOf", "allOf", "oneOf"] {
        if let Some(Value::Array(options)) = map.get_mut(key) {
            for child in options.iter_mut() {
                walk_schema(child, visit);
            }
        }
    }
    if let Some(extra) = map.get_mut("additionalProperties") {
        walk_schema(extra, visit);
    }
}

/// Drop the given keywords from every schema node.
pub fn sanitize_schema(schema: &Value, keywords: &[&str]) -> Value {
    let mut out = schema.clone();
    walk_schema(&mut out, &mut |node| {
        for k in keywords {
            node.remove(*k);
        }
    });
    out
}

const STRICT_UNSUPPORTED: &[&str] = &[
    "$schema",
    "title",
    "default",
    "format",
    "examples",
    "minLength",
    "maxLength",
    "pattern",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "minItems",
    "maxItems",
    "uniqueItems",
];

/// Rewrite a schema into the strict subset: every object closes its
/// properties and lists all of them as required (optional ones become
/// nullable), defaults and unsupported constraints are dropped, and `oneOf`
/// becomes `anyOf`.
pub fn strict_schema(schema: &Value) -> Value {
    let mut out = schema.clone();
    walk_schema(&mut out, &mut |node| {
        for k in STRICT_UNSUPPORTED {
            node.remove(*k);
        }
        if let Some(one_of) = node.remove("oneOf") {
            node.insert("anyOf".into(), one_of);
        }
        let required: Vec<String> = node
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let Some(Value::Object(props)) = node.get_mut("properties") else {
            return;
        };
        let mut names = Vec::with_capacity(props.len());
        for (name, prop) in props.iter_mut() {
            if !required.contains(name) {
                *prop = nullable(std::mem::take(prop));
            }
            names.push(Value::String(name.clone()));
        }
        node.insert("required".into(), Value::Array(names));
        node.insert("additionalProperties".into(), Value::Bool(false));
    });
    out
}

fn nullable(mut schema: Value) -> Value {
    let null = Value::String("null".into());
    if let Some(map) = schema.as_object_mut() {
        match map.get_mut("type") {
            Some(Value::String(t)) => {
                let t = Value::String(std::mem::take(t));
                map.insert("type".into(), Value::Array(vec![t, null]));
                return schema;
            }
            Some(Value::Array(types)) => {
                if !types.contains(&null) {
                    types.push(null);
                }
                return schema;
            }
            _ => {}
        }
        if let Some(Value::Array(options)) = map.get_mut("anyOf") {
            options.push(serde_json::json!({"type": "null"}));
            return schema;
        }
    }
    serde_json::json!({"anyOf": [schema, {"type": "null"}]})
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn accepts_null(schema: &Value) -> bool {
    let null = Value::String("null".into());
    match schema.get("type") {
        Some(Value::String(t)) if t == "null" => return true,
        Some(Value::Array(types)) if types.contains(&null) => return true,
        _ => {}
    }
    schema.get("nullable") == Some(&Value::Bool(true))
        || ["anyOf", "oneOf"].iter().any(|k| {
            schema
                .get(*k)
                .and_then(Value::as_array)
                .is_some_and(|options| options.iter().any(accepts_null))
        })
}

/// Remove `null` values of optional properties whose own schema does not
/// allow null. Strict vendors send `null` for every omitted optional field.
pub(crate) fn drop_optional_nulls(schema: &Value, value: &mut Value) {
    match value {
        Value::Object(map) => {
            let Some(props) = schema.get("properties").and_then(Value::as_object) else {
                return;
            };
            let required: Vec<&str> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            map.retain(|name, v| {
                !(v.is_null()
                    && !required.contains(&name.as_str())
                    && props.get(name).is_some_and(|p| !accepts_null(p)))
            });
            for (name, v) in map.iter_mut() {
                if let Some(sub) = props.get(name) {
                    drop_optional_nulls(sub, v);
                }
            }
        }
        Value::Array(items) => {
            if let Some(sub) = schema.get("items").filter(|s| s.is_object()) {
                for item in items {
                    drop_optional_nulls(sub, item);
                }
            }
        }
        _ => {}
    }
}

/// Turn a serde deserialization failure into a located field error.
pub(crate) fn serde_field_error(err: &serde_json::Error) -> FieldError {
    let msg = err.to_string();
    let path = msg
        .strip_prefix("missing field `")
        .and_then(|rest| rest.split('`').next())
        .map(|field| format!("/{field}"))
        .unwrap_or_default();
    let message = match msg.find(" at line ") {
        Some(i) => msg[..i].to_string(),
        None => msg,
    };
    FieldError::new(path, message)
}

pub(crate) fn compile_schema(provider: &str, schema: &Value) -> Result<jsonschema::Validator> {
    jsonschema::validator_for(schema)
        .map_err(|e| PolycallError::configuration(provider, format!("invalid JSON schema: {e}")))
}

/// Every violation of `validator` by `instance`, located by JSON pointer.
pub(crate) fn schema_errors(validator: &jsonschema::Validator, instance: &Value) -> Vec<FieldError> {
    validator
        .iter_errors(instance)
        .map(|err| {
            let mut path = err.instance_path.to_string();
            if let jsonschema::error::ValidationErrorKind::Required { property } = &err.kind {
                if let Some(name) = property.as_str() {
                    path = format!("{path}/{name}");
                }
            }
            FieldError::new(path, err.to_string())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tool / ToolHandler
// ---------------------------------------------------------------------------

/// A typed tool: the struct's fields are the arguments, its doc comment is
/// the description, and `call` runs it.
pub trait Tool: DeserializeOwned + JsonSchema + Send + Sync + 'static {
    fn name() -> String {
        Self::schema_name().into_owned()
    }

    fn description() -> Option<String> {
        None
    }

    fn call(&self) -> Result<String>;
}

/// Type-erased validation and invocation for one tool.
pub trait ToolHandler: Send + Sync {
    fn validate(&self, arguments: &Value) -> std::result::Result<(), Vec<FieldError>>;
    fn invoke(&self, arguments: &Value) -> Result<String>;
}

struct TypedHandler<T>(PhantomData<fn() -> T>);

impl<T: Tool> ToolHandler for TypedHandler<T> {
    fn validate(&self, arguments: &Value) -> std::result::Result<(), Vec<FieldError>> {
        serde_json::from_value::<T>(arguments.clone())
            .map(|_| ())
            .map_err(|e| vec![serde_field_error(&e)])
    }

    fn invoke(&self, arguments: &Value) -> Result<String> {
        let tool: T = serde_json::from_value(arguments.clone())?;
        tool.call()
    }
}

struct FnHandler<A, F> {
    f: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F> ToolHandler for FnHandler<A, F>
where
    A: DeserializeOwned,
    F: Fn(A) -> Result<String> + Send + Sync,
{
    fn validate(&self, arguments: &Value) -> std::result::Result<(), Vec<FieldError>> {
        serde_json::from_value::<A>(arguments.clone())
            .map(|_| ())
            .map_err(|e| vec![serde_field_error(&e)])
    }

    fn invoke(&self, arguments: &Value) -> Result<String> {
        (self.f)(serde_json::from_value(arguments.clone())?)
    }
}

type DynamicFn = dyn Fn(&Value) -> Result<String> + Send + Sync;

struct DynamicHandler {
    validator: jsonschema::Validator,
    f: Box<DynamicFn>,
}

impl ToolHandler for DynamicHandler {
    fn validate(&self, arguments: &Value) -> std::result::Result<(), Vec<FieldError>> {
        let errors = schema_errors(&self.validator, arguments);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn invoke(&self, arguments: &Value) -> Result<String> {
        (self.f)(arguments)
    }
}

// ---------------------------------------------------------------------------
// ToolEntry
// ---------------------------------------------------------------------------

/// A tool offered to the model: its wire definition plus the handler that
/// validates and runs a call to it.
#[derive(Clone)]
pub struct ToolEntry {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolEntry")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl ToolEntry {
    pub fn new(definition: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            definition,
            handler,
        }
    }

    /// Tool from a typed struct implementing [`Tool`].
    pub fn typed<T: Tool>() -> Self {
        let (parameters, doc) = parameters_from_schema(json_schema_for::<T>());
        let description = T::description()
            .or(doc)
            .unwrap_or_else(|| DEFAULT_TOOL_DESCRIPTION.to_string());
        Self::new(
            ToolDefinition {
                name: T::name(),
                description,
                parameters,
            },
            Arc::new(TypedHandler::<T>(PhantomData)),
        )
    }

    /// Tool from a closure. `A` is the argument struct; its schema becomes the
    /// tool's parameters.
    pub fn from_fn<A, F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + JsonSchema + 'static,
        F: Fn(A) -> Result<String> + Send + Sync + 'static,
    {
        let (parameters, _) = parameters_from_schema(json_schema_for::<A>());
        Self::new(
            ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            Arc::new(FnHandler {
                f,
                _args: PhantomData,
            }),
        )
    }

    /// Tool from a raw JSON schema. Arguments are validated against the
    /// schema before `f` sees them.
    pub fn dynamic<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        let name = name.into();
        let validator = compile_schema(&name, &parameters)?;
        Ok(Self::new(
            ToolDefinition {
                name,
                description: description.into(),
                parameters,
            },
            Arc::new(DynamicHandler {
                validator,
                f: Box::new(f),
            }),
        ))
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.definition.name = name.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Toolkit
// ---------------------------------------------------------------------------

/// A group of related tools, optionally namespaced. Namespaced tools are
/// offered to the model as `<namespace>_<tool>`.
pub trait Toolkit {
    fn namespace(&self) -> Option<&str> {
        None
    }

    fn tools(&self) -> Vec<ToolEntry>;

    fn create_tools(&self) -> Vec<ToolEntry> {
        let tools = self.tools();
        match self.namespace() {
            Some(ns) => tools
                .into_iter()
                .map(|t| {
                    let name = format!("{ns}_{}", t.name());
                    t.renamed(name)
                })
                .collect(),
            None => tools,
        }
    }
}

// ---------------------------------------------------------------------------
// ToolInstance
// ---------------------------------------------------------------------------

/// A validated tool call bound to its handler.
#[derive(Clone)]
pub struct ToolInstance {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

impl ToolInstance {
    pub fn call(&self) -> Result<String> {
        self.handler.invoke(&self.arguments)
    }

    /// The call as a content part, for replaying the assistant turn.
    pub fn tool_call(&self) -> ContentPart {
        ContentPart::ToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }

    pub fn result_message(&self, output: impl Into<String>) -> Message {
        Message::tool_result(self.id.clone(), output)
    }
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Tools available to one call, in registration order. Names are unique; the
/// first registration of a name wins.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
    index: HashMap<String, usize>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|e| e.name())).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a tool with the same name is already registered.
    pub fn register(&mut self, entry: ToolEntry) -> bool {
        if self.index.contains_key(entry.name()) {
            tracing::debug!(tool = entry.name(), "duplicate tool name ignored");
            return false;
        }
        self.index.insert(entry.name().to_string(), self.entries.len());
        self.entries.push(entry);
        true
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ToolEntry>) {
        for entry in entries {
            self.register(entry);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[ToolEntry] {
        &self.entries
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bind a vendor tool call to its registered handler, validating the
    /// arguments first.
    pub fn materialize(&self, provider: Provider, call: &ToolCallData) -> Result<ToolInstance> {
        let entry = self
            .get(&call.name)
            .ok_or_else(|| PolycallError::ToolNotFound {
                provider: provider.as_str().into(),
                name: call.name.clone(),
            })?;
        let mut arguments = call.arguments.clone();
        drop_optional_nulls(&entry.definition.parameters, &mut arguments);
        entry
            .handler
            .validate(&arguments)
            .map_err(|errors| PolycallError::ArgumentValidation {
                provider: provider.as_str().into(),
                tool: call.name.clone(),
                errors,
            })?;
        Ok(ToolInstance {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
            handler: entry.handler(),
        })
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

    /// Returns the author of a book.
    #[derive(Debug, Deserialize, JsonSchema)]
    struct GetBookAuthor {
        title: String,
    }

    impl Tool for GetBookAuthor {
        fn call(&self) -> Result<String> {
            if self.title == "The Name of the Wind" {
                Ok("Patrick Rothfuss".into())
            } else {
                Ok("Unknown".into())
            }
        }
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct SearchArgs {
        query: String,
        #[serde(default)]
        limit: Option<u32>,
    }

    fn call_data(name: &str, arguments: Value) -> ToolCallData {
        ToolCallData {
            id: "call_1".into(),
            name: name.into(),
            arguments,
        }
    }

    // Test 1: typed tool definition carries name, doc comment and schema
    #[test]
    fn typed_tool_definition() {
        let entry = ToolEntry::typed::<GetBookAuthor>();
        let def = entry.definition();
        assert_eq!(def.name, "GetBookAuthor");
        assert_eq!(def.description, "Returns the author of a book.");
        assert_eq!(def.parameters["type"], "object");
        assert_eq!(def.parameters["properties"]["title"]["type"], "string");
        assert_eq!(def.parameters["required"], json!(["title"]));
        assert!(def.parameters.get("title").is_none());
    }

    // Test 2: valid arguments materialize and the call runs
    #[test]
    fn materialize_and_call_typed_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolEntry::typed::<GetBookAuthor>());
        let instance = registry
            .materialize(
                Provider::OpenAi,
                &call_data("GetBookAuthor", json!({"title": "The Name of the Wind"})),
            )
            .unwrap();
        assert_eq!(instance.id, "call_1");
        assert_eq!(instance.call().unwrap(), "Patrick Rothfuss");
        assert_eq!(instance.result_message("x").role, crate::Role::Tool);
    }

    // Test 3: unknown tool names are rejected
    #[test]
    fn materialize_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .materialize(Provider::Anthropic, &call_data("nope", json!({})))
            .unwrap_err();
        assert!(matches!(err, PolycallError::ToolNotFound { name, .. } if name == "nope"));
    }

    // Test 4: invalid arguments report a located field error
    #[test]
    fn materialize_invalid_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolEntry::typed::<GetBookAuthor>());
        let err = registry
            .materialize(Provider::OpenAi, &call_data("GetBookAuthor", json!({})))
            .unwrap_err();
        match err {
            PolycallError::ArgumentValidation { tool, errors, .. } => {
                assert_eq!(tool, "GetBookAuthor");
                assert_eq!(errors[0].path, "/title");
            }
            other => panic!("expected ArgumentValidation, got {other:?}"),
        }
    }

    #[test]
    fn closure_tool() {
        let entry = ToolEntry::from_fn("search", "Search the catalog", |args: SearchArgs| {
            Ok(format!("{}:{}", args.query, args.limit.unwrap_or(10)))
        });
        assert_eq!(entry.definition().parameters["required"], json!(["query"]));
        let mut registry = ToolRegistry::new();
        registry.register(entry);
        let instance = registry
            .materialize(Provider::Gemini, &call_data("search", json!({"query": "rust"})))
            .unwrap();
        assert_eq!(instance.call().unwrap(), "rust:10");
    }

    #[test]
    fn dynamic_tool_validates_against_schema() {
        let entry = ToolEntry::dynamic(
            "lookup",
            "Look something up",
            json!({
                "type": "object",
                "properties": {"id": {"type": "integer"}},
                "required": ["id"]
            }),
            |args| Ok(args["id"].to_string()),
        )
        .unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(entry);

        let ok = registry
            .materialize(Provider::Cohere, &call_data("lookup", json!({"id": 7})))
            .unwrap();
        assert_eq!(ok.call().unwrap(), "7");

        let err = registry
            .materialize(Provider::Cohere, &call_data("lookup", json!({"id": "seven"})))
            .unwrap_err();
        assert_eq!(err.field_errors()[0].path, "/id");

        let err = registry
            .materialize(Provider::Cohere, &call_data("lookup", json!({})))
            .unwrap_err();
        assert_eq!(err.field_errors()[0].path, "/id");
    }

    #[test]
    fn optional_nulls_from_strict_vendors_are_accepted() {
        let parameters = json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "note": {"type": "string"},
                "tag": {"type": ["string", "null"]}
            },
            "required": ["id"]
        });
        let entry = ToolEntry::dynamic("lookup", "Look something up", parameters.clone(), |args| {
            Ok(args.to_string())
        })
        .unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(entry);

        // The strict form is what the model was shown.
        assert_eq!(
            strict_schema(&parameters)["properties"]["note"]["type"],
            json!(["string", "null"])
        );
        let instance = registry
            .materialize(
                Provider::OpenAi,
                &call_data("lookup", json!({"id": 7, "note": null, "tag": null})),
            )
            .unwrap();
        assert_eq!(instance.arguments, json!({"id": 7, "tag": null}));

        let err = registry
            .materialize(Provider::OpenAi, &call_data("lookup", json!({"id": null})))
            .unwrap_err();
        assert_eq!(err.field_errors()[0].path, "/id");
    }

    #[test]
    fn duplicate_names_keep_first_registration() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(ToolEntry::from_fn("t", "first", |_: SearchArgs| Ok("1".into()))));
        assert!(!registry.register(ToolEntry::from_fn("t", "second", |_: SearchArgs| Ok("2".into()))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("t").unwrap().definition().description, "first");
    }

    struct Library;

    impl Toolkit for Library {
        fn namespace(&self) -> Option<&str> {
            Some("library")
        }

        fn tools(&self) -> Vec<ToolEntry> {
            vec![ToolEntry::typed::<GetBookAuthor>()]
        }
    }

    #[test]
    fn toolkit_namespaces_tool_names() {
        let tools = Library.create_tools();
        assert_eq!(tools[0].name(), "library_GetBookAuthor");
    }

    #[test]
    fn strict_schema_closes_objects_and_requires_everything() {
        let schema = json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "minLength": 1},
                "limit": {"type": "integer", "default": 10},
                "filter": {
                    "type": "object",
                    "properties": {"default": {"type": "boolean"}},
                    "required": ["default"]
                }
            },
            "required": ["query", "filter"]
        });
        let strict = strict_schema(&schema);
        assert_eq!(strict["additionalProperties"], false);
        assert_eq!(strict["required"], json!(["query", "limit", "filter"]));
        assert_eq!(strict["properties"]["limit"]["type"], json!(["integer", "null"]));
        assert!(strict["properties"]["limit"].get("default").is_none());
        assert!(strict["properties"]["query"].get("minLength").is_none());
        // A property literally named "default" survives.
        assert!(strict["properties"]["filter"]["properties"]
            .get("default")
            .is_some());
        assert_eq!(strict["properties"]["filter"]["additionalProperties"], false);
    }

    #[test]
    fn strict_schema_rewrites_one_of() {
        let schema = json!({"oneOf": [{"type": "string"}, {"type": "integer"}]});
        let strict = strict_schema(&schema);
        assert!(strict.get("oneOf").is_none());
        assert_eq!(strict["anyOf"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn sanitize_schema_drops_keywords_recursively() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {"inner": {"type": "object", "additionalProperties": false}}
        });
        let clean = sanitize_schema(&schema, &["additionalProperties"]);
        assert!(clean.get("additionalProperties").is_none());
        assert!(clean["properties"]["inner"].get("additionalProperties").is_none());
    }

    #[test]
    fn without_fields_strips_properties_and_required() {
        let params = json!({
            "type": "object",
            "properties": {"a": {}, "b": {}},
            "required": ["a", "b"]
        });
        let out = without_fields(params, &["b"]);
        assert!(out["properties"].get("b").is_none());
        assert_eq!(out["required"], json!(["a"]));
    }
}
