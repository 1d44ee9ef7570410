//! Token estimation and history truncation.
//!
//! Counting is heuristic: a character ratio per model family, with a denser
//! ratio for JSON (tool arguments and tool results). Estimates are cached on
//! the message the first time they are computed and persisted with it.

use std::sync::Arc;

use crate::message::{ContentPart, Message, Role};

/// Fixed cost of a tool-call structure on top of its name and arguments.
const TOOL_CALL_OVERHEAD_TOKENS: u32 = 10;

/// Estimates token cost for one model family.
pub trait TokenCounter: Send + Sync {
    /// Tokens for natural-language text.
    fn count_text(&self, text: &str) -> u32;

    /// Tokens for JSON or other structured content.
    fn count_json(&self, json: &str) -> u32;

    /// Framing tokens added per message (role label, separators).
    fn message_overhead(&self) -> u32;
}

/// Character-ratio counter.
#[derive(Debug, Clone, Copy)]
pub struct RatioCounter {
    pub chars_per_token: f64,
    pub json_chars_per_token: f64,
    pub overhead: u32,
}

impl RatioCounter {
    /// OpenAI chat and reasoning models.
    pub const OPENAI: Self = Self {
        chars_per_token: 4.0,
        json_chars_per_token: 3.0,
        overhead: 3,
    };

    /// Anthropic Claude models.
    pub const CLAUDE: Self = Self {
        chars_per_token: 3.5,
        json_chars_per_token: 2.8,
        overhead: 5,
    };

    /// Anything else. Errs on overestimating.
    pub const CONSERVATIVE: Self = Self {
        chars_per_token: 3.0,
        json_chars_per_token: 2.5,
        overhead: 4,
    };

    fn ratio(len: usize, per_token: f64) -> u32 {
        if len == 0 {
            return 0;
        }
        (len as f64 / per_token).ceil() as u32
    }
}

impl TokenCounter for RatioCounter {
    fn count_text(&self, text: &str) -> u32 {
        Self::ratio(text.len(), self.chars_per_token)
    }

    fn count_json(&self, json: &str) -> u32 {
        Self::ratio(json.len(), self.json_chars_per_token)
    }

    fn message_overhead(&self) -> u32 {
        self.overhead
    }
}

/// Pick a counter by model name.
pub fn counter_for_model(model: &str) -> Arc<dyn TokenCounter> {
    let model = model.to_ascii_lowercase();
    let is_openai = model.starts_with("gpt")
        || model.starts_with("chatgpt")
        || ["o1", "o3", "o4"].iter().any(|p| model.starts_with(p));

    if is_openai {
        Arc::new(RatioCounter::OPENAI)
    } else if model.contains("claude") {
        Arc::new(RatioCounter::CLAUDE)
    } else {
        Arc::new(RatioCounter::CONSERVATIVE)
    }
}

/// Result of fitting a history into a budget.
#[derive(Debug, Clone)]
pub struct Truncation {
    /// Kept contiguous suffix, oldest first.
    pub messages: Vec<Message>,
    /// Estimated cost of `messages`, overhead included.
    pub used: u32,
    /// Number of messages dropped from the front.
    pub dropped: usize,
    /// The most recent unit alone exceeds the budget and was kept anyway.
    pub budget_exceeded: bool,
}

/// Counts messages and trims history to a token budget.
#[derive(Clone)]
pub struct TokenAccountant {
    counter: Arc<dyn TokenCounter>,
}

impl TokenAccountant {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn for_model(model: &str) -> Self {
        Self::new(counter_for_model(model))
    }

    /// Content cost of a message, without framing overhead.
    ///
    /// A cached `token_count` wins over recomputation.
    pub fn count_message(&self, message: &Message) -> u32 {
        message
            .token_count
            .unwrap_or_else(|| self.estimate_parts(&message.parts))
    }

    /// Fill in the cached count if it is missing.
    pub fn ensure_counted(&self, message: &mut Message) -> u32 {
        if let Some(count) = message.token_count {
            return count;
        }
        let count = self.estimate_parts(&message.parts);
        message.token_count = Some(count);
        count
    }

    /// Cost of one message as sent, overhead included.
    pub fn message_cost(&self, message: &Message) -> u32 {
        self.count_message(message) + self.counter.message_overhead()
    }

    /// Sum of message costs.
    pub fn count_history(&self, history: &[Message]) -> u32 {
        history.iter().map(|m| self.message_cost(m)).sum()
    }

    /// Keep the most recent suffix of `history` that fits in `budget`.
    ///
    /// An assistant message carrying tool calls and the tool messages that
    /// follow it are kept or dropped together. Tool messages left at the
    /// front without their request are dropped. A budget of zero keeps
    /// everything.
    pub fn truncate(&self, history: Vec<Message>, budget: u32) -> Truncation {
        if budget == 0 {
            let used = self.count_history(&history);
            return Truncation {
                messages: history,
                used,
                dropped: 0,
                budget_exceeded: false,
            };
        }

        let units = unit_starts(&history);
        let total = history.len();

        let mut start = total;
        let mut used = 0u32;
        let mut budget_exceeded = false;

        for (i, &unit_start) in units.iter().enumerate().rev() {
            let unit_end = units.get(i + 1).copied().unwrap_or(total);
            let cost = self.count_history(&history[unit_start..unit_end]);

            if used + cost > budget {
                if start == total {
                    // Most recent unit alone is over budget.
                    start = unit_start;
                    used = cost;
                    budget_exceeded = true;
                }
                break;
            }
            start = unit_start;
            used += cost;
        }

        let mut messages: Vec<Message> = history.into_iter().skip(start).collect();
        let orphans = messages.iter().take_while(|m| m.role == Role::Tool).count();
        if orphans > 0 && orphans < messages.len() {
            let removed: Vec<Message> = messages.drain(..orphans).collect();
            used -= self.count_history(&removed);
        }

        Truncation {
            dropped: total - messages.len(),
            messages,
            used,
            budget_exceeded,
        }
    }

    fn estimate_parts(&self, parts: &[ContentPart]) -> u32 {
        parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => self.counter.count_text(text),
                ContentPart::Thinking { thinking, .. } => self.counter.count_text(thinking),
                ContentPart::RedactedThinking { data } => self.counter.count_json(data),
                ContentPart::ToolCall(call) => {
                    let args = serde_json::to_string(&call.arguments).unwrap_or_default();
                    TOOL_CALL_OVERHEAD_TOKENS
                        + self.counter.count_text(&call.qualified_name())
                        + self.counter.count_json(&args)
                }
                ContentPart::ToolResult(result) => self.counter.count_json(&result.payload),
            })
            .sum()
    }
}

/// Indices where truncation units begin.
///
/// Every non-tool message opens a unit; tool messages join the unit before
/// them. Tool messages at the very front form their own unit.
fn unit_starts(history: &[Message]) -> Vec<usize> {
    let mut starts = Vec::new();
    for (i, msg) in history.iter().enumerate() {
        if i == 0 || msg.role != Role::Tool {
            starts.push(i);
        }
    }
    starts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ThreadId, ToolCallRequest, ToolResult};

    fn counted(role: Role, text: &str, tokens: u32) -> Message {
        let mut msg = Message::new(ThreadId::from("t"), role, vec![ContentPart::text(text)]);
        msg.token_count = Some(tokens);
        msg
    }

    fn accountant() -> TokenAccountant {
        TokenAccountant::new(Arc::new(RatioCounter::CONSERVATIVE))
    }

    #[test]
    fn test_counter_selection() {
        assert_eq!(counter_for_model("gpt-4o").message_overhead(), 3);
        assert_eq!(counter_for_model("o3-mini").message_overhead(), 3);
        assert_eq!(counter_for_model("claude-sonnet-4-5").message_overhead(), 5);
        assert_eq!(counter_for_model("llama3").message_overhead(), 4);
    }

    #[test]
    fn test_json_is_denser_than_prose() {
        let c = RatioCounter::CONSERVATIVE;
        let s = "{\"a\":1,\"b\":[1,2,3]}";
        assert!(c.count_json(s) > c.count_text(s));
        assert_eq!(c.count_text(""), 0);
    }

    #[test]
    fn test_cached_count_wins() {
        let acc = accountant();
        let mut msg = Message::user(ThreadId::from("t"), "hello world, this is a test");
        let estimated = acc.ensure_counted(&mut msg);
        assert_eq!(msg.token_count, Some(estimated));

        msg.token_count = Some(999);
        assert_eq!(acc.count_message(&msg), 999);
        assert_eq!(acc.message_cost(&msg), 999 + 4);
    }

    #[test]
    fn test_history_under_budget_is_kept_whole() {
        let acc = accountant();
        let history = vec![
            counted(Role::User, "a", 3000),
            counted(Role::Assistant, "b", 3000),
            counted(Role::User, "c", 3000),
            counted(Role::User, "d", 200),
        ];
        let out = acc.truncate(history, 10_000);
        assert_eq!(out.messages.len(), 4);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.used, 9200 + 4 * 4);
        assert!(!out.budget_exceeded);
    }

    #[test]
    fn test_truncate_keeps_recent_suffix() {
        let acc = accountant();
        let history: Vec<Message> = (0..10)
            .map(|i| counted(Role::User, &format!("m{i}"), 96))
            .collect();
        let out = acc.truncate(history, 350);
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].text(), "m7");
        assert!(out.used <= 350);
        assert_eq!(out.dropped, 7);
    }

    #[test]
    fn test_oversized_latest_message_is_kept_with_warning() {
        let acc = accountant();
        let history = vec![
            counted(Role::User, "old", 10),
            counted(Role::User, "huge", 5000),
        ];
        let out = acc.truncate(history, 1000);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].text(), "huge");
        assert!(out.budget_exceeded);
        assert!(out.used > 1000);
    }

    #[test]
    fn test_tool_round_is_atomic() {
        let acc = accountant();
        let tid = ThreadId::from("t");
        let mut call = Message::new(
            tid.clone(),
            Role::Assistant,
            vec![ContentPart::ToolCall(ToolCallRequest::new(
                "c1",
                "srv",
                "echo",
                Default::default(),
            ))],
        );
        call.token_count = Some(50);
        let mut result = Message::tool_result(tid, ToolResult::ok("c1", "done"));
        result.token_count = Some(50);

        let history = vec![
            counted(Role::User, "q", 10),
            call,
            result,
            counted(Role::Assistant, "answer", 10),
        ];
        // Room for the answer and the result, but not the call that produced it.
        let out = acc.truncate(history, 80);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].text(), "answer");
    }

    #[test]
    fn test_leading_orphan_tool_results_are_dropped() {
        let acc = accountant();
        let tid = ThreadId::from("t");
        let mut orphan = Message::tool_result(tid, ToolResult::ok("gone", "x"));
        orphan.token_count = Some(1);
        let history = vec![orphan, counted(Role::User, "hi", 1)];
        let out = acc.truncate(history, 1000);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].role, Role::User);
        assert_eq!(out.dropped, 1);
    }

    #[test]
    fn test_zero_budget_keeps_everything() {
        let acc = accountant();
        let history = vec![counted(Role::User, "a", 50_000)];
        let out = acc.truncate(history, 0);
        assert_eq!(out.messages.len(), 1);
        assert!(!out.budget_exceeded);
    }
}
