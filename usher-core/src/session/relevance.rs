//! Pluggable selection of history context for a new query.
//!
//! The store guarantees the contract; policies only choose which messages.
//! Selected messages are always a subsequence of the real history (original
//! order, no fabrication) of at most `max_items` entries, with ties broken
//! by recency.

use super::types::Message;

/// Strategy for picking the history subset most pertinent to a query.
pub trait RelevancePolicy: Send + Sync {
    /// Select at most `max_items` messages from `history` (oldest first),
    /// returned in their original order.
    fn select(&self, history: &[Message], query: &str, max_items: usize) -> Vec<Message>;
}

/// Most-recent-first selection. The conservative default: the tail of the
/// conversation is the context.
#[derive(Debug, Default)]
pub struct RecencyPolicy;

impl RelevancePolicy for RecencyPolicy {
    fn select(&self, history: &[Message], _query: &str, max_items: usize) -> Vec<Message> {
        let start = history.len().saturating_sub(max_items);
        history[start..].to_vec()
    }
}

/// Term-overlap selection: scores each message by how many query terms it
/// shares, ranks by score with recency breaking ties, then restores the
/// chosen subset to history order.
#[derive(Debug, Default)]
pub struct KeywordOverlapPolicy;

impl KeywordOverlapPolicy {
    fn terms(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
            .map(str::to_string)
            .collect()
    }

    fn score(message: &Message, query_terms: &[String]) -> usize {
        let message_terms = Self::terms(&message.content);
        query_terms
            .iter()
            .filter(|t| message_terms.contains(t))
            .count()
    }
}

impl RelevancePolicy for KeywordOverlapPolicy {
    fn select(&self, history: &[Message], query: &str, max_items: usize) -> Vec<Message> {
        if max_items == 0 || history.is_empty() {
            return Vec::new();
        }

        let query_terms = Self::terms(query);
        let mut ranked: Vec<(usize, usize)> = history
            .iter()
            .enumerate()
            .map(|(index, message)| (index, Self::score(message, &query_terms)))
            .collect();

        // Highest score first; the later (more recent) message wins ties.
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

        let mut chosen: Vec<usize> = ranked.into_iter().take(max_items).map(|(i, _)| i).collect();
        chosen.sort_unstable();
        chosen.into_iter().map(|i| history[i].clone()).collect()
    }
}
