use serde::{Deserialize, Serialize};

/// Minimal identity returned by `auth/whoami`, shared between the client
/// and server crates.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub id: String,
    pub display_name: String,
}

/// A document indexed by a set of lower-cased search terms and an optional
/// sort key.
#[derive(Clone, Debug, PartialEq)]
pub struct SearcherDocument<T> {
    queries: Vec<String>,
    order: Option<i64>,
    pub doc: T,
}

impl<T> SearcherDocument<T> {
    pub fn new(queries: impl IntoIterator<Item = impl Into<String>>, order: Option<i64>, doc: T) -> Self {
        Self {
            queries: queries.into_iter().map(|q| q.into().to_lowercase()).collect(),
            order,
            doc,
        }
    }
}

/// Substring filter over an in-memory document set. Unordered mode returns
/// every match in original order; ordered mode additionally stable-sorts
/// by `order` and truncates to `limit`.
#[derive(Clone, Debug, Default)]
pub struct Searcher<T> {
    documents: Vec<SearcherDocument<T>>,
}

impl<T: Clone> Searcher<T> {
    pub fn new(documents: Vec<SearcherDocument<T>>) -> Self {
        Self { documents }
    }

    /// Every document whose `queries` contain `needle` as a substring
    /// (case-insensitive); an empty needle matches everything.
    pub fn search_unordered(&self, needle: &str) -> Vec<&T> {
        let needle = needle.to_lowercase();
        self.documents
            .iter()
            .filter(|d| needle.is_empty() || d.queries.iter().any(|q| q.contains(&needle)))
            .map(|d| &d.doc)
            .collect()
    }

    /// Same filter as [`Searcher::search_unordered`], additionally sorted
    /// ascending by `order` (documents without an `order` sort last, stable
    /// among themselves) and truncated to `limit`.
    pub fn search_ordered(&self, needle: &str, limit: usize) -> Vec<&T> {
        let needle = needle.to_lowercase();
        let mut matches: Vec<&SearcherDocument<T>> = self
            .documents
            .iter()
            .filter(|d| needle.is_empty() || d.queries.iter().any(|q| q.contains(&needle)))
            .collect();
        matches.sort_by_key(|d| d.order.unwrap_or(i64::MAX));
        matches.into_iter().take(limit).map(|d| &d.doc).collect()
    }
}
