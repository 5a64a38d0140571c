use anvil_llm::{ChatMessage, MessageSource, Role};
use serde::{Deserialize, Serialize};

/// How history size is measured against the budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Chars,
    Tokens,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContextConfig {
    pub mode: ContextMode,
    pub max_chars: usize,
    pub max_tokens: usize,
    pub compact_trigger_chars: usize,
    pub compact_trigger_tokens: usize,
    pub keep_last_messages: usize,
    pub compact_keep_tail: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            mode: ContextMode::Chars,
            max_chars: 24_000,
            max_tokens: 24_000,
            compact_trigger_chars: 36_000,
            compact_trigger_tokens: 36_000,
            keep_last_messages: 30,
            compact_keep_tail: 16,
        }
    }
}

/// Heuristic token count, ~4 bytes per token. No external tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        (text.len() / 4).max(1)
    }
}

/// Instruction to persist a compaction: replace the snapshot's first
/// `replace_up_to` messages with `summary`.
#[derive(Clone, Debug, PartialEq)]
pub struct CompactionPlan {
    pub replace_up_to: usize,
    pub summary: ChatMessage,
}

/// Result of preparing one turn's context.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextView {
    pub messages: Vec<ChatMessage>,
    pub compaction: Option<CompactionPlan>,
}

/// Keeps histories within the configured budget by trimming old messages
/// and, past the trigger, collapsing the prefix into a summary message.
#[derive(Clone, Debug)]
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Produce the message view for one turn. Deterministic: the same
    /// snapshot under the same config always yields the same view, and a
    /// history that already fits passes through untouched.
    pub fn prepare(&self, snapshot: &[ChatMessage]) -> ContextView {
        let full_size = self.measure(snapshot);
        let cap = self.cap();
        if full_size <= cap {
            return ContextView {
                messages: snapshot.to_vec(),
                compaction: None,
            };
        }

        let trimmed = self.trim(snapshot);
        let needs_compaction = (self.measure(&trimmed) > cap || full_size > self.trigger())
            && snapshot.len() > self.config.compact_keep_tail;
        if !needs_compaction {
            return ContextView {
                messages: trimmed,
                compaction: None,
            };
        }

        let replace_up_to = snapshot.len() - self.config.compact_keep_tail;
        let tail_size = self.measure(&snapshot[replace_up_to..]);
        let summary_budget = self.summary_char_budget(cap.saturating_sub(tail_size));
        let summary = build_summary(&snapshot[..replace_up_to], summary_budget);
        let mut messages = Vec::with_capacity(self.config.compact_keep_tail + 1);
        messages.push(summary.clone());
        messages.extend(snapshot[replace_up_to..].iter().cloned());
        ContextView {
            messages,
            compaction: Some(CompactionPlan {
                replace_up_to,
                summary,
            }),
        }
    }

    /// Drop the oldest non-system messages until the view fits or only
    /// `keep_last_messages` remain. Tool-call/tool-result groups are dropped
    /// whole so no tool message is ever orphaned.
    fn trim(&self, snapshot: &[ChatMessage]) -> Vec<ChatMessage> {
        let cap = self.cap();
        let mut working: Vec<ChatMessage> = snapshot.to_vec();
        loop {
            if self.measure(&working) <= cap {
                break;
            }
            if working.len() <= self.config.keep_last_messages {
                break;
            }
            let Some(start) = working.iter().position(|m| m.role != Role::System) else {
                break;
            };
            let span = group_span(&working, start);
            working.drain(start..start + span);
        }
        working
    }

    fn measure(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.message_size(m)).sum()
    }

    fn message_size(&self, message: &ChatMessage) -> usize {
        let mut text = message.content.clone();
        for call in message.calls() {
            text.push_str(&call.name);
            text.push_str(&call.arguments);
        }
        match self.config.mode {
            ContextMode::Chars => text.len(),
            ContextMode::Tokens => estimate_tokens(&text),
        }
    }

    fn cap(&self) -> usize {
        match self.config.mode {
            ContextMode::Chars => self.config.max_chars,
            ContextMode::Tokens => self.config.max_tokens,
        }
    }

    fn trigger(&self) -> usize {
        match self.config.mode {
            ContextMode::Chars => self.config.compact_trigger_chars,
            ContextMode::Tokens => self.config.compact_trigger_tokens,
        }
    }

    /// Character budget available to the summary message so the compacted
    /// view still fits under the cap alongside the kept tail.
    fn summary_char_budget(&self, remaining: usize) -> usize {
        let chars = match self.config.mode {
            ContextMode::Chars => remaining,
            ContextMode::Tokens => remaining.saturating_mul(4),
        };
        chars.max(MIN_SUMMARY_CHARS)
    }
}

/// Length of the matched message group starting at `start`: an assistant
/// message with tool calls spans its following tool results; a stray run of
/// tool results is taken together. Everything else stands alone.
fn group_span(messages: &[ChatMessage], start: usize) -> usize {
    let first = &messages[start];
    if first.role == Role::Assistant && !first.calls().is_empty() {
        let ids: Vec<&str> = first.calls().iter().map(|call| call.id.as_str()).collect();
        let mut span = 1;
        while let Some(next) = messages.get(start + span) {
            let matched = next.role == Role::Tool
                && next
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| ids.contains(&id));
            if !matched {
                break;
            }
            span += 1;
        }
        return span;
    }
    if first.role == Role::Tool {
        let mut span = 1;
        while messages
            .get(start + span)
            .is_some_and(|next| next.role == Role::Tool)
        {
            span += 1;
        }
        return span;
    }
    1
}

const SUMMARY_PREVIEW_CHARS: usize = 140;
const SUMMARY_MAX_POINTS: usize = 10;
const MIN_SUMMARY_CHARS: usize = 80;

/// Deterministic digest of the compacted prefix: one role-prefixed preview
/// line per message, capped at `SUMMARY_MAX_POINTS` lines and truncated to
/// `max_chars`.
fn build_summary(messages: &[ChatMessage], max_chars: usize) -> ChatMessage {
    let mut points = Vec::new();
    for message in messages {
        let text = message.content.trim().replace('\n', " ");
        if text.is_empty() {
            continue;
        }
        let short: String = if text.chars().count() > SUMMARY_PREVIEW_CHARS {
            let head: String = text.chars().take(SUMMARY_PREVIEW_CHARS).collect();
            format!("{head}...")
        } else {
            text
        };
        points.push(format!("- {}: {}", message.role.as_str(), short));
        if points.len() >= SUMMARY_MAX_POINTS {
            break;
        }
    }
    if points.is_empty() {
        points.push("- No significant earlier content.".to_string());
    }
    let mut summary_text = format!("[Compacted conversation summary]\n{}", points.join("\n"));
    if summary_text.chars().count() > max_chars {
        summary_text = summary_text.chars().take(max_chars).collect();
    }
    ChatMessage::system(summary_text).with_source(MessageSource::Compaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_llm::ToolCall;

    fn filler(role: Role, len: usize) -> ChatMessage {
        let content = "x".repeat(len);
        match role {
            Role::User => ChatMessage::user(content),
            _ => ChatMessage::assistant(content),
        }
    }

    fn manager(max_chars: usize, trigger: usize, keep_last: usize, tail: usize) -> ContextManager {
        ContextManager::new(ContextConfig {
            mode: ContextMode::Chars,
            max_chars,
            compact_trigger_chars: trigger,
            keep_last_messages: keep_last,
            compact_keep_tail: tail,
            ..ContextConfig::default()
        })
    }

    #[test]
    fn estimate_tokens_uses_four_byte_heuristic() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn history_within_budget_passes_through() {
        let manager = manager(1_000, 2_000, 5, 2);
        let history = vec![filler(Role::User, 100), filler(Role::Assistant, 100)];
        let view = manager.prepare(&history);
        assert_eq!(view.messages, history);
        assert!(view.compaction.is_none());
    }

    #[test]
    fn trim_drops_oldest_non_system_first() {
        let manager = manager(250, 10_000, 2, 2);
        let history = vec![
            filler(Role::User, 100),
            filler(Role::Assistant, 100),
            filler(Role::User, 100),
            filler(Role::Assistant, 100),
        ];
        let view = manager.prepare(&history);
        assert!(view.compaction.is_none());
        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.messages, history[2..].to_vec());
    }

    #[test]
    fn trim_keeps_tool_groups_whole() {
        let manager = manager(150, 10_000, 1, 1);
        let assistant = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("tc1", "run_cmd", "{\"command\":\"ls\"}")],
        );
        let result = ChatMessage::tool_result("tc1", None, "y".repeat(100));
        let history = vec![assistant, result, filler(Role::Assistant, 100)];
        let view = manager.prepare(&history);
        // The pair is dropped together, never leaving an orphaned result.
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].role, Role::Assistant);
        assert!(view.messages[0].tool_call_id.is_none());
    }

    #[test]
    fn oversized_history_compacts_into_summary_plus_tail() {
        let manager = manager(200, 300, 2, 2);
        let history: Vec<ChatMessage> = (0..20)
            .map(|i| {
                if i % 2 == 0 {
                    filler(Role::User, 50)
                } else {
                    filler(Role::Assistant, 50)
                }
            })
            .collect();
        let view = manager.prepare(&history);
        let plan = view.compaction.expect("compaction planned");
        assert_eq!(plan.replace_up_to, 18);
        assert_eq!(view.messages.len(), 3);
        assert_eq!(view.messages[0].source, Some(MessageSource::Compaction));
        assert!(view.messages[0]
            .content
            .starts_with("[Compacted conversation summary]"));
        assert_eq!(view.messages[1..], history[18..]);
    }

    #[test]
    fn compacted_view_fits_under_the_cap() {
        let manager = manager(200, 300, 2, 2);
        let history: Vec<ChatMessage> = (0..20).map(|_| filler(Role::User, 50)).collect();
        let view = manager.prepare(&history);
        assert!(view.compaction.is_some());
        let total: usize = view.messages.iter().map(|m| m.content.len()).sum();
        assert!(total <= 200, "compacted view measured {total} chars");
    }

    #[test]
    fn compaction_is_idempotent_on_a_compacted_history() {
        let manager = manager(800, 300, 2, 2);
        let history: Vec<ChatMessage> = (0..20).map(|_| filler(Role::User, 50)).collect();
        let first = manager.prepare(&history);
        assert!(first.compaction.is_some());
        let second = manager.prepare(&first.messages);
        assert_eq!(second.messages, first.messages);
        assert!(second.compaction.is_none());
    }

    #[test]
    fn summary_is_deterministic_for_the_same_prefix() {
        let history: Vec<ChatMessage> =
            (0..5).map(|i| ChatMessage::user(format!("message {i}"))).collect();
        assert_eq!(build_summary(&history, 600), build_summary(&history, 600));
        assert!(build_summary(&history, 600)
            .content
            .contains("- user: message 0"));
    }
}
