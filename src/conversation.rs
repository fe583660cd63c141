//! Conversation log (C9): the turn history shared between the LLM worker and
//! lifecycle persistence, with append/rollback semantics so a cancelled LLM
//! turn doesn't leave a half-written assistant message in history.

use serde::{Deserialize, Serialize};

/// A single chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    /// Turn content.
    pub content: String,
}

impl ChatMessage {
    /// Build a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_owned(),
            content: content.into(),
        }
    }

    /// Build a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: content.into(),
        }
    }

    /// Build an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_owned(),
            content: content.into(),
        }
    }
}

/// The running conversation log. Entry 0 is always the system prompt.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    entries: Vec<ChatMessage>,
    max_history_messages: usize,
    /// One slot per appended (non-system) turn, in the same order as
    /// `entries[1..]`: the turn `trim` evicted when that append happened, if
    /// any. `remove_last` consults the top of this stack to restore exactly
    /// what that append's trim dropped, so append-then-rollback is a no-op
    /// at every history size, not just below the cap.
    evicted_on_append: Vec<Option<ChatMessage>>,
}

impl Conversation {
    /// Start a new conversation with the given system prompt and a cap on
    /// the number of non-system messages retained (0 = unbounded).
    pub fn new(system_prompt: impl Into<String>, max_history_messages: usize) -> Self {
        Self {
            entries: vec![ChatMessage::system(system_prompt)],
            max_history_messages,
            evicted_on_append: Vec::new(),
        }
    }

    /// Append a turn, trimming the oldest non-system turn if the history cap
    /// is exceeded. The evicted turn (if any) is remembered so a matching
    /// `remove_last` can restore it, keeping append-then-rollback a no-op.
    pub fn append(&mut self, message: ChatMessage) {
        self.entries.push(message);
        let evicted = self.trim();
        self.evicted_on_append.push(evicted);
    }

    /// Remove the most recently appended turn, if any (used to roll back a
    /// partially-generated assistant turn after a cancelled LLM call).
    /// Never removes the system prompt at index 0. Restores whatever turn
    /// that append's trim evicted, making it an exact inverse of `append`.
    pub fn remove_last(&mut self) {
        if self.entries.len() > 1 {
            self.entries.pop();
            if let Some(evicted) = self.evicted_on_append.pop().flatten() {
                self.entries.insert(1, evicted);
            }
        }
    }

    /// Reset the conversation to a single system turn with a new prompt.
    pub fn reset(&mut self, system_prompt: impl Into<String>) {
        self.entries.clear();
        self.entries.push(ChatMessage::system(system_prompt));
        self.evicted_on_append.clear();
    }

    /// A snapshot of the conversation suitable for sending to an LLM API:
    /// all entries, with trailing whitespace trimmed from content.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: m.content.trim_end().to_owned(),
            })
            .collect()
    }

    /// Number of turns, including the system prompt.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if only the system prompt is present.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Drop the oldest non-system turn if the history cap is exceeded,
    /// returning it so the caller can remember it for a possible rollback.
    /// `max_history_messages` only ever grows the log by one turn per
    /// `append` call, so at most one turn is ever evicted here.
    fn trim(&mut self) -> Option<ChatMessage> {
        if self.max_history_messages == 0 {
            return None;
        }
        // entries[0] is the system prompt and is never trimmed.
        let non_system = self.entries.len().saturating_sub(1);
        if non_system > self.max_history_messages {
            Some(self.entries.remove(1))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_conversation_starts_with_system_prompt() {
        let c = Conversation::new("be helpful", 10);
        assert_eq!(c.len(), 1);
        assert_eq!(c.snapshot()[0].role, "system");
    }

    #[test]
    fn append_grows_history() {
        let mut c = Conversation::new("sys", 10);
        c.append(ChatMessage::user("hi"));
        c.append(ChatMessage::assistant("hello"));
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn remove_last_rolls_back_without_touching_system_prompt() {
        let mut c = Conversation::new("sys", 10);
        c.append(ChatMessage::user("hi"));
        c.remove_last();
        assert_eq!(c.len(), 1);
        c.remove_last();
        assert_eq!(c.len(), 1, "system prompt must never be removed");
    }

    #[test]
    fn trim_drops_oldest_non_system_turns_once_over_cap() {
        let mut c = Conversation::new("sys", 2);
        c.append(ChatMessage::user("one"));
        c.append(ChatMessage::assistant("two"));
        c.append(ChatMessage::user("three"));
        let snapshot = c.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].role, "system");
        assert_eq!(snapshot[1].content, "two");
        assert_eq!(snapshot[2].content, "three");
    }

    #[test]
    fn snapshot_trims_trailing_whitespace() {
        let mut c = Conversation::new("sys", 10);
        c.append(ChatMessage::user("hello   \n"));
        assert_eq!(c.snapshot()[1].content, "hello");
    }

    #[test]
    fn append_then_rollback_is_a_no_op_once_over_the_history_cap() {
        let mut c = Conversation::new("sys", 2);
        c.append(ChatMessage::user("one"));
        c.append(ChatMessage::assistant("two"));
        // History is now full: [system, one, two].
        let before = c.snapshot();

        c.append(ChatMessage::user("three"));
        c.remove_last();

        assert_eq!(
            c.snapshot(),
            before,
            "append-then-rollback must restore the pre-append snapshot exactly, \
             including a turn trimmed by the append"
        );
    }

    #[test]
    fn reset_clears_history_back_to_new_system_prompt() {
        let mut c = Conversation::new("sys", 10);
        c.append(ChatMessage::user("hi"));
        c.reset("new sys");
        assert_eq!(c.len(), 1);
        assert_eq!(c.snapshot()[0].content, "new sys");
    }
}
