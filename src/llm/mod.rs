//! Language model worker (C8): a single in-flight HTTP completion job at a
//! time, streamed sentence-by-sentence to the TTS gateway, cancellable
//! mid-stream via an atomic interrupt flag checked at token granularity.

pub mod api;
pub mod worker;

/// A chunk of LLM output delivered to the TTS gateway: either a completed
/// sentence (`is_final: false`) or the trailing remainder once generation
/// ends (`is_final: true`, possibly empty to signal "no more text").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceChunk {
    /// Sentence text.
    pub text: String,
    /// Whether this is the last chunk of the response.
    pub is_final: bool,
}

/// Find the index of the first sentence-terminating character in `text`
/// (`.`, `!`, `?`, or `\n`). A sentence is a run of text terminated by one
/// of these. Returns `None` if no terminator has appeared yet.
pub fn find_clause_boundary(text: &str) -> Option<usize> {
    text.char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_period_boundary() {
        assert_eq!(find_clause_boundary("Hello there. More"), Some(11));
    }

    #[test]
    fn finds_question_mark_boundary() {
        assert_eq!(find_clause_boundary("How are you? Fine"), Some(11));
    }

    #[test]
    fn finds_newline_boundary() {
        assert_eq!(find_clause_boundary("line one\nline two"), Some(8));
    }

    #[test]
    fn returns_none_without_terminator() {
        assert_eq!(find_clause_boundary("still going"), None);
    }

    #[test]
    fn finds_earliest_terminator() {
        assert_eq!(find_clause_boundary("Wait... really?"), Some(4));
    }
}
