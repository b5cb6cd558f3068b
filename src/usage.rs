//! Incremental usage extraction from response bodies.
//!
//! The observer is fed the same bytes the client receives; it never blocks
//! or reorders forwarding. Anthropic SSE usage arrives in `message_start`
//! (input + cache buckets, model) and `message_delta` (final output count);
//! non-streamed bodies are parsed once at the end. OpenAI-style bodies
//! carry a single `usage` object in either framing.

use serde_json::Value;

use crate::models::TokenUsage;
use crate::providers::UsageFraming;

/// Cap on body bytes retained for payload capture and final JSON parsing.
pub const BODY_CAPTURE_CAP: usize = 512 * 1024;

#[derive(Debug)]
pub struct UsageObserver {
    framing: UsageFraming,
    line_buffer: String,
    usage: TokenUsage,
    saw_usage: bool,
    model: Option<String>,
    saw_message_stop: bool,
    body: Vec<u8>,
    body_truncated: bool,
}

/// What the observer learned once the stream ended.
#[derive(Debug)]
pub struct UsageSummary {
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    /// Captured body (may be truncated) for the payload archive.
    pub body: Vec<u8>,
    pub body_truncated: bool,
}

impl UsageObserver {
    pub fn new(framing: UsageFraming) -> Self {
        Self {
            framing,
            line_buffer: String::new(),
            usage: TokenUsage::default(),
            saw_usage: false,
            model: None,
            saw_message_stop: false,
            body: Vec::new(),
            body_truncated: false,
        }
    }

    /// Feed one forwarded chunk. Cheap when the chunk carries no events.
    pub fn observe(&mut self, chunk: &[u8]) {
        if self.body.len() < BODY_CAPTURE_CAP {
            let room = BODY_CAPTURE_CAP - self.body.len();
            if chunk.len() > room {
                self.body.extend_from_slice(&chunk[..room]);
                self.body_truncated = true;
            } else {
                self.body.extend_from_slice(chunk);
            }
        } else if !chunk.is_empty() {
            self.body_truncated = true;
        }

        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline_pos) = self.line_buffer.find('\n') {
            let line = self.line_buffer[..newline_pos].trim().to_string();
            self.line_buffer = self.line_buffer[newline_pos + 1..].to_string();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    continue;
                }
                if let Ok(event) = serde_json::from_str::<Value>(data) {
                    self.observe_event(&event);
                }
            }
        }
    }

    fn observe_event(&mut self, event: &Value) {
        match self.framing {
            UsageFraming::AnthropicSse => {
                match event.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "message_start" => {
                        if let Some(message) = event.get("message") {
                            if let Some(model) = message.get("model").and_then(|m| m.as_str()) {
                                self.model = Some(model.to_string());
                            }
                            if let Some(usage) = message.get("usage") {
                                self.apply_anthropic_usage(usage);
                            }
                        }
                    }
                    "message_delta" => {
                        if let Some(usage) = event.get("usage") {
                            self.apply_anthropic_usage(usage);
                        }
                    }
                    "message_stop" => {
                        self.saw_message_stop = true;
                    }
                    _ => {}
                }
            }
            UsageFraming::OpenAiJson => {
                if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
                    self.apply_openai_usage(usage);
                }
                if self.model.is_none()
                    && let Some(model) = event.get("model").and_then(|m| m.as_str())
                {
                    self.model = Some(model.to_string());
                }
            }
        }
    }

    /// Later events override earlier counts field-by-field: `message_delta`
    /// carries the authoritative final `output_tokens`.
    fn apply_anthropic_usage(&mut self, usage: &Value) {
        let field = |name: &str| usage.get(name).and_then(|v| v.as_i64());
        if let Some(n) = field("input_tokens") {
            self.usage.input_tokens = n;
            self.saw_usage = true;
        }
        if let Some(n) = field("output_tokens") {
            self.usage.output_tokens = n;
            self.saw_usage = true;
        }
        if let Some(n) = field("cache_read_input_tokens") {
            self.usage.cache_read_input_tokens = n;
            self.saw_usage = true;
        }
        if let Some(n) = field("cache_creation_input_tokens") {
            self.usage.cache_creation_input_tokens = n;
            self.saw_usage = true;
        }
    }

    fn apply_openai_usage(&mut self, usage: &Value) {
        let field = |name: &str| usage.get(name).and_then(|v| v.as_i64());
        if let Some(n) = field("prompt_tokens") {
            self.usage.input_tokens = n;
            self.saw_usage = true;
        }
        if let Some(n) = field("completion_tokens") {
            self.usage.output_tokens = n;
            self.saw_usage = true;
        }
        if let Some(n) = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_i64())
        {
            self.usage.cache_read_input_tokens = n;
        }
    }

    /// Stream ended. For non-streamed bodies no SSE events were seen, so
    /// parse the captured body as one JSON document.
    pub fn finish(mut self) -> UsageSummary {
        if !self.saw_usage
            && !self.body_truncated
            && let Ok(body) = serde_json::from_slice::<Value>(&self.body)
        {
            if self.model.is_none()
                && let Some(model) = body.get("model").and_then(|m| m.as_str())
            {
                self.model = Some(model.to_string());
            }
            if let Some(usage) = body.get("usage") {
                match self.framing {
                    UsageFraming::AnthropicSse => self.apply_anthropic_usage(usage),
                    UsageFraming::OpenAiJson => self.apply_openai_usage(usage),
                }
            }
        }
        UsageSummary {
            usage: self.saw_usage.then_some(self.usage),
            model: self.model,
            body: self.body,
            body_truncated: self.body_truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(observer: &mut UsageObserver, frames: &[&str]) {
        for frame in frames {
            observer.observe(frame.as_bytes());
        }
    }

    #[test]
    fn anthropic_sse_accounting() {
        let mut observer = UsageObserver::new(UsageFraming::AnthropicSse);
        feed(
            &mut observer,
            &[
                "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":120,\"cache_read_input_tokens\":40,\"cache_creation_input_tokens\":8,\"output_tokens\":1}}}\n\n",
                "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
                "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":57}}\n\n",
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ],
        );
        let summary = observer.finish();
        let usage = summary.usage.unwrap();
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 57);
        assert_eq!(usage.cache_read_input_tokens, 40);
        assert_eq!(usage.cache_creation_input_tokens, 8);
        assert_eq!(summary.model.as_deref(), Some("claude-sonnet-4-5"));
    }

    #[test]
    fn split_chunks_reassemble() {
        let mut observer = UsageObserver::new(UsageFraming::AnthropicSse);
        let frame = "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":9}}\n";
        observer.observe(frame[..20].as_bytes());
        observer.observe(frame[20..].as_bytes());
        let usage = observer.finish().usage.unwrap();
        assert_eq!(usage.output_tokens, 9);
    }

    #[test]
    fn non_streamed_json_body() {
        let mut observer = UsageObserver::new(UsageFraming::AnthropicSse);
        observer.observe(
            br#"{"id":"msg_1","model":"claude-haiku-4-5","content":[],"usage":{"input_tokens":10,"output_tokens":3}}"#,
        );
        let summary = observer.finish();
        let usage = summary.usage.unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(summary.model.as_deref(), Some("claude-haiku-4-5"));
    }

    #[test]
    fn openai_usage_fields() {
        let mut observer = UsageObserver::new(UsageFraming::OpenAiJson);
        observer.observe(
            br#"{"model":"gpt-4o","choices":[],"usage":{"prompt_tokens":31,"completion_tokens":7,"prompt_tokens_details":{"cached_tokens":16}}}"#,
        );
        let summary = observer.finish();
        let usage = summary.usage.unwrap();
        assert_eq!(usage.input_tokens, 31);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.cache_read_input_tokens, 16);
    }

    #[test]
    fn capture_cap_marks_truncation() {
        let mut observer = UsageObserver::new(UsageFraming::AnthropicSse);
        observer.observe(&vec![b'x'; BODY_CAPTURE_CAP + 10]);
        let summary = observer.finish();
        assert_eq!(summary.body.len(), BODY_CAPTURE_CAP);
        assert!(summary.body_truncated);
        assert!(summary.usage.is_none());
    }
}
