//! Retrieval of earlier narrative for prompt context.
//!
//! The similarity backend is a black box behind [`Retriever`]. The default
//! [`RecentTurnRetriever`] keeps the most recent snippets per session and
//! ignores the query text.

use std::collections::VecDeque;

use dashmap::DashMap;
use tale_core::SessionId;

/// Snippets retrieved per turn.
pub const DEFAULT_TOP_K: usize = 6;

/// Source of context snippets for a session.
pub trait Retriever: Send + Sync {
    /// Remember `text` for `session`.
    fn index(&self, session: &SessionId, text: &str);

    /// Up to `k` snippets relevant to `query`, oldest first.
    fn query(&self, session: &SessionId, query: &str, k: usize) -> Vec<String>;

    /// Drop everything indexed for `session`.
    fn forget(&self, session: &SessionId);
}

/// Keeps the last `capacity` snippets per session.
#[derive(Debug)]
pub struct RecentTurnRetriever {
    snippets: DashMap<SessionId, VecDeque<String>>,
    capacity: usize,
}

impl RecentTurnRetriever {
    /// Retriever holding at most `capacity` snippets per session.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            snippets: DashMap::new(),
            capacity: capacity.max(1),
        }
    }
}

impl Default for RecentTurnRetriever {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Retriever for RecentTurnRetriever {
    fn index(&self, session: &SessionId, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut entry = self.snippets.entry(*session).or_default();
        if entry.len() == self.capacity {
            entry.pop_front();
        }
        entry.push_back(text.to_string());
    }

    fn query(&self, session: &SessionId, _query: &str, k: usize) -> Vec<String> {
        self.snippets
            .get(session)
            .map(|entry| {
                let skip = entry.len().saturating_sub(k);
                entry.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    fn forget(&self, session: &SessionId) {
        self.snippets.remove(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_last_k_in_order() {
        let r = RecentTurnRetriever::new(3);
        let s = SessionId::new();
        for t in ["one", "two", "  ", "three", "four"] {
            r.index(&s, t);
        }
        assert_eq!(r.query(&s, "anything", 2), vec!["three", "four"]);
        assert_eq!(r.query(&s, "anything", 10), vec!["two", "three", "four"]);
        assert!(r.query(&SessionId::new(), "x", 3).is_empty());

        r.forget(&s);
        assert!(r.query(&s, "x", 3).is_empty());
    }
}
