//! Inline tool-call extraction from free-form model text.
//!
//! Wire grammar: `<tool_name><param>value</param>...</tool_name>` where
//! `tool_name` matches `[a-z][a-z0-9_]*` and params nest one level only.
//! The parser is an explicit state machine over the character stream; it
//! buffers only the tag currently being disambiguated, so a `<` that never
//! becomes a tag is replayed as literal text. Unclosed tags at stream end
//! are discarded.

use serde_json::{Map, Value};

/// Derived event from the inline path.
#[derive(Debug, Clone, PartialEq)]
pub enum InlineEvent {
    /// Literal text. Always emitted before any tool call whose opening tag
    /// began after it.
    Text(String),
    /// A completed inline tool invocation (id not yet assigned).
    ToolCall { name: String, arguments: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Plain text.
    Text,
    /// After `<`, accumulating a candidate tool name.
    TagName,
    /// Inside a tool body, between parameters.
    InTool,
    /// After `<` inside a tool body: parameter name or `</` tool close.
    ParamTagName,
    /// Accumulating a parameter value.
    ParamValue,
    /// Matching a candidate `</param>` close inside a value.
    ParamClose,
    /// Matching the `</tool_name>` close.
    ToolClose,
}

/// Streaming parser for the inline tool-call grammar.
#[derive(Debug)]
pub struct InlineToolParser {
    state: State,
    pending_text: String,
    /// Raw characters of the tag being disambiguated, `<` included.
    tag_buf: String,
    name_buf: String,
    tool_name: String,
    params: Vec<(String, String)>,
    param_name: String,
    param_value: String,
    close_buf: String,
}

impl Default for InlineToolParser {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineToolParser {
    pub fn new() -> Self {
        Self {
            state: State::Text,
            pending_text: String::new(),
            tag_buf: String::new(),
            name_buf: String::new(),
            tool_name: String::new(),
            params: Vec::new(),
            param_name: String::new(),
            param_value: String::new(),
            close_buf: String::new(),
        }
    }

    /// Feed a text delta; returns the events it completes, in order.
    pub fn push(&mut self, delta: &str) -> Vec<InlineEvent> {
        let mut events = Vec::new();
        for c in delta.chars() {
            self.step(c, &mut events);
        }
        self.flush_text(&mut events);
        events
    }

    /// End of stream: flush trailing text, discard any partial tag.
    pub fn finish(&mut self) -> Vec<InlineEvent> {
        let mut events = Vec::new();
        self.flush_text(&mut events);
        self.state = State::Text;
        self.tag_buf.clear();
        self.name_buf.clear();
        self.tool_name.clear();
        self.params.clear();
        events
    }

    fn flush_text(&mut self, events: &mut Vec<InlineEvent>) {
        if !self.pending_text.is_empty() {
            events.push(InlineEvent::Text(std::mem::take(&mut self.pending_text)));
        }
    }

    fn step(&mut self, c: char, events: &mut Vec<InlineEvent>) {
        match self.state {
            State::Text => {
                if c == '<' {
                    self.begin_tag();
                } else {
                    self.pending_text.push(c);
                }
            }
            State::TagName => self.step_tag_name(c, events),
            State::InTool => {
                if c == '<' {
                    self.tag_buf.clear();
                    self.tag_buf.push('<');
                    self.name_buf.clear();
                    self.state = State::ParamTagName;
                }
                // Stray characters between parameters are ignored.
            }
            State::ParamTagName => self.step_param_tag_name(c),
            State::ParamValue => {
                if c == '<' {
                    self.close_buf.clear();
                    self.close_buf.push('<');
                    self.state = State::ParamClose;
                } else {
                    self.param_value.push(c);
                }
            }
            State::ParamClose => self.step_param_close(c),
            State::ToolClose => self.step_tool_close(c, events),
        }
    }

    fn begin_tag(&mut self) {
        self.tag_buf.clear();
        self.tag_buf.push('<');
        self.name_buf.clear();
        self.state = State::TagName;
    }

    fn step_tag_name(&mut self, c: char, events: &mut Vec<InlineEvent>) {
        if c == '>' && !self.name_buf.is_empty() {
            // Tool opens: text preceding the tag goes out first.
            self.flush_text(events);
            self.tool_name = std::mem::take(&mut self.name_buf);
            self.tag_buf.clear();
            self.params.clear();
            self.state = State::InTool;
        } else if c == '<' {
            // Previous '<'-run was literal text; this char restarts a tag.
            self.pending_text.push_str(&self.tag_buf);
            self.begin_tag();
        } else if is_name_char(c, self.name_buf.is_empty()) {
            self.name_buf.push(c);
            self.tag_buf.push(c);
        } else {
            // Not a tag after all — replay buffered chars as text.
            self.pending_text.push_str(&self.tag_buf);
            self.pending_text.push(c);
            self.tag_buf.clear();
            self.name_buf.clear();
            self.state = State::Text;
        }
    }

    fn step_param_tag_name(&mut self, c: char) {
        if c == '/' && self.name_buf.is_empty() && self.tag_buf == "<" {
            self.tag_buf.push('/');
            self.close_buf.clear();
            self.close_buf.push_str("</");
            self.state = State::ToolClose;
        } else if c == '>' && !self.name_buf.is_empty() {
            self.param_name = std::mem::take(&mut self.name_buf);
            self.param_value.clear();
            self.tag_buf.clear();
            self.state = State::ParamValue;
        } else if is_name_char(c, self.name_buf.is_empty()) {
            self.name_buf.push(c);
            self.tag_buf.push(c);
        } else {
            // Malformed tag inside a tool body — drop it.
            self.tag_buf.clear();
            self.name_buf.clear();
            self.state = State::InTool;
        }
    }

    fn step_param_close(&mut self, c: char) {
        let expected = format!("</{}>", self.param_name);
        self.close_buf.push(c);
        if expected == self.close_buf {
            let name = std::mem::take(&mut self.param_name);
            let value = std::mem::take(&mut self.param_value);
            self.params.push((name, value));
            self.close_buf.clear();
            self.state = State::InTool;
        } else if !expected.starts_with(&self.close_buf) {
            // Not the closing tag; buffered chars belong to the value.
            self.close_buf.pop();
            self.param_value.push_str(&self.close_buf);
            self.close_buf.clear();
            if c == '<' {
                self.close_buf.push('<');
            } else {
                self.param_value.push(c);
                self.state = State::ParamValue;
            }
        }
    }

    fn step_tool_close(&mut self, c: char, events: &mut Vec<InlineEvent>) {
        let expected = format!("</{}>", self.tool_name);
        self.close_buf.push(c);
        if expected == self.close_buf {
            let name = std::mem::take(&mut self.tool_name);
            let arguments = params_to_arguments(std::mem::take(&mut self.params));
            self.close_buf.clear();
            self.tag_buf.clear();
            self.state = State::Text;
            events.push(InlineEvent::ToolCall { name, arguments });
        } else if !expected.starts_with(&self.close_buf) {
            // Mismatched closing tag — discard and stay in the tool body.
            self.close_buf.clear();
            self.state = State::InTool;
        }
    }
}

fn is_name_char(c: char, first: bool) -> bool {
    if first {
        c.is_ascii_lowercase()
    } else {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'
    }
}

/// Parameter values that parse as JSON keep their parsed type; everything
/// else stays a string.
fn params_to_arguments(params: Vec<(String, String)>) -> Value {
    let mut map = Map::new();
    for (name, raw) in params {
        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw));
        map.insert(name, value);
    }
    Value::Object(map)
}
