//! Bounded input queue (C6) that decouples direct-command / LLM producers
//! from the single-consumer dispatch loop.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::warn;

/// Maximum number of pending items. Older items are dropped once full.
pub const CAPACITY: usize = 16;

/// Maximum length (in chars) retained per item; longer text is truncated.
pub const MAX_ITEM_CHARS: usize = 1024;

/// A single queued utterance, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInput {
    /// Free-form tag identifying the producer (e.g. "asr", "dispatcher").
    pub source_tag: String,
    /// The utterance text, truncated to `MAX_ITEM_CHARS`.
    pub text: String,
}

/// Thread-safe bounded FIFO of `QueuedInput`.
#[derive(Default)]
pub struct InputQueue {
    items: Mutex<VecDeque<QueuedInput>>,
}

impl InputQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new item, truncating long text and dropping the oldest item
    /// if the queue is already at `CAPACITY`.
    pub fn push(&self, source_tag: impl Into<String>, text: impl Into<String>) {
        let mut text = text.into();
        if text.chars().count() > MAX_ITEM_CHARS {
            text = text.chars().take(MAX_ITEM_CHARS).collect();
        }
        let item = QueuedInput {
            source_tag: source_tag.into(),
            text,
        };

        let mut items = self.items.lock();
        if items.len() >= CAPACITY {
            let dropped = items.pop_front();
            warn!(
                "input queue full, dropping oldest item from '{}'",
                dropped.map(|d| d.source_tag).unwrap_or_default()
            );
        }
        items.push_back(item);
    }

    /// True if at least one item is queued.
    pub fn has_item(&self) -> bool {
        !self.items.lock().is_empty()
    }

    /// Pop the oldest queued item, if any.
    pub fn pop(&self) -> Option<QueuedInput> {
        self.items.lock().pop_front()
    }

    /// Discard all queued items.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_preserves_fifo_order() {
        let q = InputQueue::new();
        q.push("asr", "first");
        q.push("asr", "second");
        assert_eq!(q.pop().unwrap().text, "first");
        assert_eq!(q.pop().unwrap().text, "second");
        assert!(q.pop().is_none());
    }

    #[test]
    fn overflow_drops_oldest_item() {
        let q = InputQueue::new();
        for i in 0..(CAPACITY + 2) {
            q.push("asr", format!("item-{i}"));
        }
        assert_eq!(q.len(), CAPACITY);
        let first = q.pop().unwrap();
        assert_eq!(first.text, "item-2");
    }

    #[test]
    fn long_text_is_truncated() {
        let q = InputQueue::new();
        let long = "x".repeat(MAX_ITEM_CHARS + 500);
        q.push("asr", long);
        let item = q.pop().unwrap();
        assert_eq!(item.text.chars().count(), MAX_ITEM_CHARS);
    }

    #[test]
    fn clear_empties_queue() {
        let q = InputQueue::new();
        q.push("asr", "hello");
        q.clear();
        assert!(!q.has_item());
    }
}
