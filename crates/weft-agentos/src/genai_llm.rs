//! Default LLM port backed by `genai::Client`.
//!
//! Provider wire quirks stay on this side of the port: partial tool-call
//! chunks are accumulated (some providers resend the full argument string
//! per chunk), the end-of-stream capture overrides streamed partials, and
//! ghost calls with empty names are filtered. The runtime above only ever
//! sees complete calls.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use genai::chat::{
    ChatMessage, ChatOptions, ChatRequest, ChatStreamEvent, ContentPart, MessageContent,
    ToolResponse,
};
use genai::Client;
use serde_json::Value;
use std::collections::HashMap;
use weft_contract::ids::gen_message_id;
use weft_contract::ports::{
    Completion, LlmClient, LlmError, LlmEvent, LlmEventStream, LlmRequest, LlmUsage, StreamEnd,
};
use weft_contract::thread::{AssistantPart, Message, ToolCall};

pub struct GenaiLlm {
    client: Client,
    options: ChatOptions,
}

impl GenaiLlm {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            options: ChatOptions::default()
                .with_capture_usage(true)
                .with_capture_tool_calls(true),
        }
    }
}

impl Default for GenaiLlm {
    fn default() -> Self {
        Self::new(Client::default())
    }
}

impl std::fmt::Debug for GenaiLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenaiLlm").finish()
    }
}

fn to_chat_message(message: &Message) -> ChatMessage {
    match message {
        Message::System { content } => ChatMessage::system(content),
        Message::User { content } => ChatMessage::user(content),
        Message::Assistant { parts } => {
            let text: String = parts
                .iter()
                .filter_map(|part| match part {
                    AssistantPart::Text { text } => Some(text.as_str()),
                    AssistantPart::ToolCall(_) => None,
                })
                .collect();
            let calls: Vec<genai::chat::ToolCall> = parts
                .iter()
                .filter_map(|part| match part {
                    AssistantPart::ToolCall(call) => Some(genai::chat::ToolCall {
                        call_id: call.id.clone(),
                        fn_name: call.name.clone(),
                        fn_arguments: call.arguments.clone(),
                    }),
                    AssistantPart::Text { .. } => None,
                })
                .collect();
            if calls.is_empty() {
                ChatMessage::assistant(text)
            } else {
                let mut content = MessageContent::from(text.as_str());
                for call in calls {
                    content.push(ContentPart::ToolCall(call));
                }
                ChatMessage::assistant(content)
            }
        }
        Message::Tool {
            tool_call_id,
            output,
            ..
        } => {
            let rendered = weft_contract::thread::ToolOutput {
                parts: output.clone(),
                credits_used: 0.0,
                spawned_credits: 0.0,
                spawned_run_ids: Vec::new(),
            }
            .render_text();
            ChatMessage::from(ToolResponse {
                call_id: tool_call_id.clone(),
                content: rendered,
            })
        }
    }
}

fn build_request(request: &LlmRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(ChatMessage::system(system));
    }
    messages.extend(request.messages.iter().map(to_chat_message));

    let tools: Vec<genai::chat::Tool> = request
        .tools
        .iter()
        .map(|descriptor| {
            genai::chat::Tool::new(&descriptor.name)
                .with_description(&descriptor.description)
                .with_schema(descriptor.parameters.clone())
        })
        .collect();

    let mut chat_request = ChatRequest::new(messages);
    if !tools.is_empty() {
        chat_request = chat_request.with_tools(tools);
    }
    chat_request
}

fn map_usage(usage: Option<&genai::chat::Usage>) -> LlmUsage {
    let Some(usage) = usage else {
        return LlmUsage::default();
    };
    LlmUsage {
        input_tokens: usage.prompt_tokens.unwrap_or(0) as u64,
        output_tokens: usage.completion_tokens.unwrap_or(0) as u64,
        // Direct-key usage is not billed through the runtime.
        credits_used: 0.0,
    }
}

#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    name: String,
    arguments: String,
}

/// Extract the raw argument string from a chunk. genai wraps accumulated
/// argument text in `Value::String`; `.to_string()` on other shapes keeps
/// the JSON rendering.
fn raw_arguments(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn completed_calls(
    order: &[String],
    partials: &mut HashMap<String, PartialToolCall>,
) -> Vec<ToolCall> {
    let mut out = Vec::with_capacity(order.len());
    for call_id in order {
        let Some(partial) = partials.remove(call_id) else {
            continue;
        };
        // Ghost calls (empty name) are provider noise.
        if partial.name.is_empty() {
            continue;
        }
        let arguments =
            serde_json::from_str(&partial.arguments).unwrap_or(Value::Null);
        out.push(ToolCall::new(call_id.clone(), partial.name, arguments));
    }
    out
}

#[async_trait]
impl LlmClient for GenaiLlm {
    async fn stream(&self, request: LlmRequest) -> Result<LlmEventStream, LlmError> {
        let chat_request = build_request(&request);
        let response = self
            .client
            .exec_chat_stream(&request.model, chat_request, Some(&self.options))
            .await
            .map_err(|e| LlmError::new(e.to_string()))?;
        let mut inner = response.stream;

        let out = stream! {
            let mut order: Vec<String> = Vec::new();
            let mut partials: HashMap<String, PartialToolCall> = HashMap::new();

            while let Some(event) = inner.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        yield Err(LlmError::new(error.to_string()));
                        return;
                    }
                };
                match event {
                    ChatStreamEvent::Chunk(chunk) => {
                        if !chunk.content.is_empty() {
                            yield Ok(LlmEvent::TextDelta(chunk.content));
                        }
                    }
                    ChatStreamEvent::ToolCallChunk(tool_chunk) => {
                        let call_id = tool_chunk.tool_call.call_id.clone();
                        let partial = match partials.entry(call_id.clone()) {
                            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                            std::collections::hash_map::Entry::Vacant(e) => {
                                order.push(call_id);
                                e.insert(PartialToolCall::default())
                            }
                        };
                        if partial.name.is_empty() && !tool_chunk.tool_call.fn_name.is_empty() {
                            partial.name = tool_chunk.tool_call.fn_name.clone();
                        }
                        let args = raw_arguments(&tool_chunk.tool_call.fn_arguments);
                        if !args.is_empty() {
                            // Chunks carry the accumulated value; replace,
                            // never append.
                            partial.arguments = args;
                        }
                    }
                    ChatStreamEvent::End(end) => {
                        // The capture is the source of truth over partials.
                        if let Some(tool_calls) = end.captured_tool_calls() {
                            for tc in tool_calls {
                                let args = raw_arguments(&tc.fn_arguments);
                                let partial = match partials.entry(tc.call_id.clone()) {
                                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                                    std::collections::hash_map::Entry::Vacant(e) => {
                                        order.push(tc.call_id.clone());
                                        e.insert(PartialToolCall::default())
                                    }
                                };
                                if partial.name.is_empty() {
                                    partial.name = tc.fn_name.clone();
                                }
                                if !args.is_empty() {
                                    partial.arguments = args;
                                }
                            }
                        }
                        for call in completed_calls(&order, &mut partials) {
                            yield Ok(LlmEvent::ToolCall(call));
                        }
                        yield Ok(LlmEvent::End(StreamEnd {
                            message_id: gen_message_id(),
                            usage: map_usage(end.captured_usage.as_ref()),
                        }));
                    }
                    _ => {}
                }
            }
        };
        Ok(Box::pin(out))
    }

    async fn complete(&self, request: LlmRequest) -> Result<Completion, LlmError> {
        let chat_request = build_request(&request);
        let response = self
            .client
            .exec_chat(&request.model, chat_request, Some(&self.options))
            .await
            .map_err(|e| LlmError::new(e.to_string()))?;
        Ok(Completion {
            text: response
                .first_text()
                .map(str::to_string)
                .unwrap_or_default(),
            usage: map_usage(Some(&response.usage)),
        })
    }

    fn name(&self) -> &'static str {
        "genai_client"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_contract::thread::ToolOutputPart;
    use weft_contract::tool::ToolDescriptor;

    #[test]
    fn request_includes_system_history_and_tools() {
        let request = LlmRequest {
            model: "gpt-5".into(),
            system: Some("You are an agent.".into()),
            messages: vec![
                Message::user("list files"),
                Message::Assistant {
                    parts: vec![
                        AssistantPart::Text { text: "ok: ".into() },
                        AssistantPart::ToolCall(ToolCall::new(
                            "call_1",
                            "read_files",
                            json!({"paths": ["a.ts"]}),
                        )),
                    ],
                },
                Message::Tool {
                    tool_call_id: "call_1".into(),
                    tool_name: "read_files".into(),
                    output: vec![ToolOutputPart::Json(json!({"a.ts": "x"}))],
                },
            ],
            tools: vec![ToolDescriptor::new("read_files", "Read files")],
        };

        let chat_request = build_request(&request);
        // system + user + assistant + tool response
        assert_eq!(chat_request.messages.len(), 4);
        assert_eq!(chat_request.tools.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn usage_mapping_defaults_missing_fields() {
        assert_eq!(map_usage(None), LlmUsage::default());
    }

    #[test]
    fn raw_arguments_unwraps_strings() {
        assert_eq!(raw_arguments(&json!("{\"a\":1}")), "{\"a\":1}");
        assert_eq!(raw_arguments(&Value::Null), "");
        assert_eq!(raw_arguments(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn completed_calls_filter_ghosts_and_parse_arguments() {
        let order = vec!["tc_1".to_string(), "ghost".to_string(), "tc_2".to_string()];
        let mut partials = HashMap::new();
        partials.insert(
            "tc_1".to_string(),
            PartialToolCall {
                name: "search".into(),
                arguments: r#"{"q":"rust"}"#.into(),
            },
        );
        partials.insert("ghost".to_string(), PartialToolCall::default());
        partials.insert(
            "tc_2".to_string(),
            PartialToolCall {
                name: "fetch".into(),
                arguments: "not valid json {{".into(),
            },
        );

        let calls = completed_calls(&order, &mut partials);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, json!({"q": "rust"}));
        assert_eq!(calls[1].name, "fetch");
        // Truncated JSON degrades to null rather than failing the stream.
        assert_eq!(calls[1].arguments, Value::Null);
    }
}
