//! Streaming response reducer for the plan agent.
//!
//! The agent emits loosely shaped JSON events. They are mapped to a small set
//! of [`StreamEvent`]s and folded, strictly in arrival order, into a
//! [`StreamingState`] that a caller can render after every step.
//!
//! Recognised raw shapes:
//! - `{"data": "..."}` legacy text delta
//! - `{"event": {"messageStart": ..}}`
//! - `{"event": {"contentBlockStart": {"start": {"toolUse": {"name", "toolUseId"}}}}}`
//! - `{"event": {"contentBlockDelta": {"delta": {"toolUse": {"input": ".."}}}}}`
//! - `{"event": {"toolResultBlock": {"toolUseId", "result"}}}`
//! - `{"event": {"messageStop": {"stopReason": ".."}}}`
//! - `{"event": {"redactContent": {"redactAssistantContentMessage": ..}}}`
//!
//! Event-loop bookkeeping events (`init_event_loop`, `start`,
//! `start_event_loop`) are dropped.

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;

/// Keys that mark event-loop bookkeeping rather than content.
const INIT_EVENT_KEYS: [&str; 3] = ["init_event_loop", "start", "start_event_loop"];

/// Stop reason reported when `messageStop` does not carry one.
const DEFAULT_STOP_REASON: &str = "end_turn";

// --- Domain events ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub tool_id: String,
    pub tool_name: String,
    /// Concatenated input fragments, not parsed.
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub tool_id: String,
    /// Empty when no recorded call has a matching id.
    pub tool_name: String,
    pub result: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Start,
    Complete,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub status: StreamStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Text(String),
    ToolCall(ToolCall),
    ToolInput(String),
    ToolResult(ToolResult),
    Status(StatusUpdate),
}

// --- State ---

/// Everything accumulated so far for one generation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamingState {
    pub text: String,
    /// Index into `tool_calls` of the call still receiving input.
    pub current_tool_call: Option<usize>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub status_updates: Vec<StatusUpdate>,
}

impl StreamingState {
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Text(chunk) => self.text.push_str(chunk),
            StreamEvent::ToolCall(call) => {
                self.tool_calls.push(call.clone());
                self.current_tool_call = Some(self.tool_calls.len() - 1);
            }
            StreamEvent::ToolInput(fragment) => {
                if let Some(call) = self
                    .current_tool_call
                    .and_then(|idx| self.tool_calls.get_mut(idx))
                {
                    call.input.push_str(fragment);
                }
            }
            StreamEvent::ToolResult(result) => {
                self.tool_results.push(result.clone());
                self.current_tool_call = None;
            }
            StreamEvent::Status(update) => self.status_updates.push(update.clone()),
        }
    }

    pub fn current_tool_call(&self) -> Option<&ToolCall> {
        self.current_tool_call.and_then(|idx| self.tool_calls.get(idx))
    }

    fn tool_name_for(&self, tool_id: &str) -> String {
        self.tool_calls
            .iter()
            .find(|call| call.tool_id == tool_id)
            .map(|call| call.tool_name.clone())
            .unwrap_or_default()
    }
}

// --- Mapping ---

pub fn is_init_event(raw: &Value) -> bool {
    raw.as_object()
        .is_some_and(|obj| INIT_EVENT_KEYS.iter().any(|key| obj.contains_key(*key)))
}

/// Map one raw event to domain events. `state` is only read, to resolve
/// tool result names.
pub fn map_event(raw: &Value, state: &StreamingState) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    if let Some(data) = raw.get("data") {
        let chunk = match data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        events.push(StreamEvent::Text(chunk));
        return events;
    }

    let Some(event) = raw.get("event") else {
        return events;
    };

    if event.get("messageStart").is_some() {
        events.push(StreamEvent::Status(StatusUpdate {
            status: StreamStatus::Start,
            details: Some("Agent is generating a response".to_string()),
        }));
    }

    if let Some(tool_use) = event.pointer("/contentBlockStart/start/toolUse") {
        if let Some(name) = tool_use.get("name").and_then(Value::as_str) {
            events.push(StreamEvent::ToolCall(ToolCall {
                tool_id: str_field(tool_use, "toolUseId"),
                tool_name: name.to_string(),
                input: String::new(),
            }));
        }
    }

    if let Some(input) = event.pointer("/contentBlockDelta/delta/toolUse/input") {
        let fragment = match input {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if !fragment.is_empty() {
            events.push(StreamEvent::ToolInput(fragment));
        }
    }

    if let Some(block) = event.get("toolResultBlock") {
        let tool_id = str_field(block, "toolUseId");
        let result = block.get("result").cloned().unwrap_or(Value::Null);
        if !tool_id.is_empty() && !is_empty_payload(&result) {
            events.push(StreamEvent::ToolResult(ToolResult {
                tool_name: state.tool_name_for(&tool_id),
                tool_id,
                result,
            }));
        }
    }

    if let Some(stop) = event.get("messageStop") {
        let reason = stop
            .get("stopReason")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_STOP_REASON);
        events.push(StreamEvent::Status(StatusUpdate {
            status: StreamStatus::Complete,
            details: Some(reason.to_string()),
        }));
    }

    if event
        .pointer("/redactContent/redactAssistantContentMessage")
        .is_some()
    {
        events.push(StreamEvent::Status(StatusUpdate {
            status: StreamStatus::Warning,
            details: Some("Some content was redacted".to_string()),
        }));
    }

    events
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// --- Reducer ---

#[derive(Debug, Default)]
pub struct StreamReducer {
    state: StreamingState,
}

impl StreamReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map and apply one raw event. Returns the events that were applied.
    pub fn process(&mut self, raw: &Value) -> Vec<StreamEvent> {
        if is_init_event(raw) {
            return Vec::new();
        }
        let events = map_event(raw, &self.state);
        for event in &events {
            self.state.apply(event);
        }
        events
    }

    pub fn state(&self) -> &StreamingState {
        &self.state
    }

    pub fn into_text(self) -> String {
        self.state.text
    }
}

/// Drain `stream` through a reducer, calling `on_event` after each applied
/// event with the updated state. Returns the accumulated text.
pub async fn process_stream<S, E, F>(stream: S, mut on_event: F) -> Result<String, E>
where
    S: Stream<Item = Result<Value, E>>,
    E: Display,
    F: FnMut(&StreamEvent, &StreamingState),
{
    let mut stream = std::pin::pin!(stream);
    let mut reducer = StreamReducer::new();

    while let Some(item) = stream.next().await {
        let raw = match item {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("Streaming: agent stream failed: {}", e);
                return Err(e);
            }
        };

        if is_init_event(&raw) {
            continue;
        }
        for event in map_event(&raw, reducer.state()) {
            reducer.state.apply(&event);
            on_event(&event, reducer.state());
        }
    }

    let state = reducer.state();
    tracing::debug!(
        "Streaming: finished with {} chars, {} tool calls, {} tool results",
        state.text.len(),
        state.tool_calls.len(),
        state.tool_results.len()
    );
    Ok(reducer.into_text())
}

// --- Agent boundary ---

/// A language-model agent that turns a fully built prompt into a plan.
#[async_trait]
pub trait PlanAgent: Send + Sync {
    type Error: Display + Send;

    async fn generate(&self, prompt: &str) -> Result<String, Self::Error>;

    fn stream<'a>(&'a self, prompt: &'a str) -> BoxStream<'a, Result<Value, Self::Error>>;
}

/// Stream a response from `agent`, reporting progress through `on_event`.
pub async fn generate_streaming<A, F>(
    agent: &A,
    prompt: &str,
    on_event: F,
) -> Result<String, A::Error>
where
    A: PlanAgent + ?Sized,
    F: FnMut(&StreamEvent, &StreamingState),
{
    process_stream(agent.stream(prompt), on_event).await
}
