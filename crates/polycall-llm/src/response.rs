use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::setup::PreparedCall;
use crate::tool::ToolInstance;
use crate::{
    FinishReason, Message, MessageParam, Provider, Role, ToolCallData, Usage, VendorOutput,
};
use polycall_types::Result;

// ---------------------------------------------------------------------------
// CallResponse
// ---------------------------------------------------------------------------

/// A completed call, normalized across vendors.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub provider: Provider,
    pub model: String,
    pub id: Option<String>,
    /// Concatenated assistant text.
    pub content: String,
    /// The assistant turn, ready to append to a conversation.
    pub message: Message,
    pub tool_calls: Vec<ToolCallData>,
    /// `tool_calls` bound to their handlers, in the same order.
    pub tools: Vec<ToolInstance>,
    pub finish_reasons: Vec<FinishReason>,
    pub usage: Usage,
    /// The vendor's untouched response body (an array of chunks for streams).
    pub raw: Value,
    /// The messages that were sent.
    pub messages: Vec<MessageParam<Value>>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl CallResponse {
    /// Build the response and bind every tool call to the call's registry.
    /// Fails on the first call to an unknown tool or with invalid arguments.
    pub(crate) fn from_output(
        call: &PreparedCall,
        output: VendorOutput,
        raw: Value,
        start_time: DateTime<Utc>,
    ) -> Result<Self> {
        let provider = call.request.provider;
        let tool_calls: Vec<ToolCallData> = output.message.tool_calls().collect();
        let tools = tool_calls
            .iter()
            .map(|c| call.registry.materialize(provider, c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            provider,
            model: output.model.unwrap_or_else(|| call.request.model.clone()),
            id: output.id,
            content: output.message.text(),
            message: output.message,
            tool_calls,
            tools,
            finish_reasons: output.finish_reasons,
            usage: output.usage,
            raw,
            messages: call.request.messages.clone(),
            start_time,
            end_time: Utc::now(),
        })
    }

    /// The first tool the model called, if any.
    pub fn tool(&self) -> Option<&ToolInstance> {
        self.tools.first()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reasons.first().copied()
    }

    /// One tool-result message per `(tool, output)` pair.
    pub fn tool_message_params(outputs: &[(ToolInstance, String)]) -> Vec<Message> {
        outputs
            .iter()
            .map(|(tool, output)| tool.result_message(output.clone()))
            .collect()
    }

    /// The sent messages followed by this response's assistant turn.
    pub fn history(&self) -> Vec<MessageParam<Value>> {
        let mut out = self.messages.clone();
        if self.message.role == Role::Assistant && !self.message.content.is_empty() {
            out.push(MessageParam::Normalized(self.message.clone()));
        }
        out
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::CallRequest;
    use crate::tool::{ToolEntry, ToolRegistry};
    use crate::{CallParams, ContentPart};
    use polycall_types::PolycallError;
    use serde_json::json;

    fn prepared(registry: ToolRegistry) -> PreparedCall {
        PreparedCall {
            request: CallRequest {
                provider: Provider::OpenAi,
                model: "gpt-4o-mini".into(),
                messages: vec![Message::user("Who wrote Dune?").into()],
                tools: registry.definitions(),
                tool_choice: None,
                params: CallParams::default(),
                json_mode: false,
                response_format: None,
                stream: false,
            },
            registry,
            body: json!({}),
            args: json!({}),
        }
    }

    fn lookup() -> ToolEntry {
        ToolEntry::from_fn("lookup", "Look up a book.", |args: Value| {
            Ok(format!("found {}", args["title"]))
        })
    }

    fn tool_output(name: &str) -> VendorOutput {
        VendorOutput {
            id: Some("chatcmpl-1".into()),
            model: None,
            message: Message::new(
                Role::Assistant,
                vec![
                    ContentPart::text("Checking."),
                    ContentPart::ToolCall {
                        id: "call_1".into(),
                        name: name.into(),
                        arguments: json!({"title": "Dune"}),
                    },
                ],
            ),
            finish_reasons: vec![FinishReason::ToolUse],
            usage: Usage::new(10, 5),
        }
    }

    // Test 1: tool calls are bound to the registry
    #[test]
    fn from_output_materializes_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(lookup());
        let call = prepared(registry);
        let response =
            CallResponse::from_output(&call, tool_output("lookup"), json!({"raw": true}), Utc::now())
                .unwrap();

        assert_eq!(response.content, "Checking.");
        assert_eq!(response.model, "gpt-4o-mini");
        assert_eq!(response.finish_reason(), Some(FinishReason::ToolUse));
        assert_eq!(response.raw, json!({"raw": true}));
        let tool = response.tool().unwrap();
        assert_eq!(tool.call().unwrap(), "found \"Dune\"");
        assert!(response.duration_ms() >= 0);
    }

    // Test 2: unknown tools fail normalization
    #[test]
    fn unknown_tool_is_reported() {
        let call = prepared(ToolRegistry::new());
        let err = CallResponse::from_output(&call, tool_output("lookup"), json!({}), Utc::now())
            .unwrap_err();
        assert!(matches!(err, PolycallError::ToolNotFound { ref name, .. } if name == "lookup"));
    }

    // Test 3: history and tool results for the next turn
    #[test]
    fn history_appends_assistant_turn_and_tool_results() {
        let mut registry = ToolRegistry::new();
        registry.register(lookup());
        let call = prepared(registry);
        let response =
            CallResponse::from_output(&call, tool_output("lookup"), json!({}), Utc::now()).unwrap();

        let history = response.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], MessageParam::Normalized(response.message.clone()));

        let tool = response.tool().unwrap().clone();
        let results = CallResponse::tool_message_params(&[(tool, "Frank Herbert".into())]);
        assert_eq!(results, vec![Message::tool_result("call_1", "Frank Herbert")]);
    }

    #[test]
    fn empty_assistant_turn_is_not_added_to_history() {
        let call = prepared(ToolRegistry::new());
        let output = VendorOutput {
            id: None,
            model: Some("gpt-4o-mini-2024-07-18".into()),
            message: Message::new(Role::Assistant, vec![]),
            finish_reasons: vec![FinishReason::MaxTokens],
            usage: Usage::default(),
        };
        let response = CallResponse::from_output(&call, output, json!({}), Utc::now()).unwrap();
        assert_eq!(response.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(response.history().len(), 1);
    }
}
