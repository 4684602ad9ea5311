//! Plain-text previews and substring search over one user's notes.
//!
//! Search is a linear scan through the store; there is no inverted index.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{NoteMeta, Result, UserStore};

pub const DEFAULT_PREVIEW_LENGTH: usize = 150;

const MARKDOWN_PUNCTUATION: &[char] = &['#', '*', '_', '~', '`', '>', '[', ']', '(', ')', '!', '|'];

/// Lightweight search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub name: String,
    pub id: String,
    pub preview: String,
    pub tags: Vec<String>,
}

/// Derives a one-line preview: list markers and markdown punctuation
/// stripped, whitespace collapsed, cut at `max_len` characters with `...`
/// appended when anything was cut.
pub fn summarize(content: &str, max_len: usize) -> String {
    let mut plain = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim_start();
        let body = ["- ", "+ ", "* "]
            .iter()
            .find_map(|marker| trimmed.strip_prefix(marker))
            .unwrap_or(trimmed);
        plain.extend(body.chars().filter(|c| !MARKDOWN_PUNCTUATION.contains(c)));
        plain.push(' ');
    }

    let collapsed = plain.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_len {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_len).collect();
    format!("{}...", cut.trim_end())
}

fn matches(meta: &NoteMeta, content: &str, needle: &str) -> bool {
    meta.title.to_lowercase().contains(needle)
        || content.to_lowercase().contains(needle)
        || meta.tags.iter().any(|t| t.to_lowercase().contains(needle))
        || meta.groups.iter().any(|g| g.to_lowercase().contains(needle))
}

/// Case-insensitive substring search over title, content, tags and groups.
/// Results follow list order; notes whose content cannot be read are skipped.
pub async fn search_notes(
    store: &UserStore,
    user_id: &str,
    query: &str,
    preview_length: usize,
) -> Result<Vec<SearchResult>> {
    let needle = query.trim().to_lowercase();
    let notes = store.list(user_id).await?;
    debug!("Searching {} notes of {} for {:?}", notes.len(), user_id, query);

    let mut results = Vec::new();
    for meta in notes {
        let content = match store.read_content(user_id, &meta.id).await {
            Ok(content) => content.unwrap_or_default(),
            Err(e) => {
                warn!("Skipping note {}/{} in search: {}", user_id, meta.id, e);
                continue;
            }
        };
        if matches(&meta, &content, &needle) {
            results.push(SearchResult {
                preview: summarize(&content, preview_length),
                name: meta.title,
                id: meta.id,
                tags: meta.tags,
            });
        }
    }

    debug!("Found {} matches", results.len());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, Note, SystemRegistry, WriteMode};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn summary_strips_markdown() {
        let md = "# Groceries\n\n- milk\n- **eggs**\n> quoted `code`";
        assert_eq!(summarize(md, 100), "Groceries milk eggs quoted code");
    }

    #[test]
    fn summary_truncates_on_char_boundaries() {
        assert_eq!(summarize("héllo wörld", 5), "héllo...");
        assert_eq!(summarize("short", 5), "short");
        assert_eq!(summarize("", 5), "");
    }

    #[tokio::test]
    async fn search_checks_every_field_case_insensitively() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(SystemRegistry::new(Arc::new(MemoryStore::new())));
        let store = UserStore::new(dir.path(), registry);

        let mut groceries = Note::new("Groceries");
        groceries.content = "- milk\n- eggs".to_string();
        groceries.meta.tags = vec!["home".to_string()];
        let mut trip = Note::new("Trip");
        trip.content = "passport".to_string();
        trip.meta.groups = vec!["Travel".to_string()];

        for note in [groceries, trip] {
            let id = note.id().to_string();
            store.write("alice", &id, WriteMode::Replace(note)).await.unwrap();
        }

        let hits = search_notes(&store, "alice", "MILK", 150).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Groceries");
        assert_eq!(hits[0].preview, "milk eggs");
        assert_eq!(hits[0].tags, vec!["home"]);

        assert_eq!(search_notes(&store, "alice", "hom", 150).await.unwrap().len(), 1);
        assert_eq!(search_notes(&store, "alice", "travel", 150).await.unwrap()[0].name, "Trip");
        assert_eq!(search_notes(&store, "alice", "", 150).await.unwrap().len(), 2);
        assert!(search_notes(&store, "alice", "zebra", 150).await.unwrap().is_empty());
        assert!(search_notes(&store, "bob", "milk", 150).await.unwrap().is_empty());
    }
}
