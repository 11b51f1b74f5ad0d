use super::document::Document;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::debug;

/// Keep the valid hits, counting the ones dropped.
///
/// Hits without a usable title or timestamp are skipped rather than reported;
/// shards index loosely structured data and partial records are expected.
pub fn validate(raw: Vec<Value>) -> (Vec<Document>, usize) {
    let total = raw.len();
    let docs: Vec<Document> = raw.into_iter().filter_map(Document::from_value).collect();
    let skipped = total - docs.len();
    if skipped > 0 {
        debug!(skipped, total, "skipped hits without title or timestamp");
    }
    (docs, skipped)
}

/// One document per title (the most recently crawled), newest first, at most `limit`.
pub fn dedup_and_rank(docs: Vec<Document>, limit: usize) -> Vec<Document> {
    let mut latest: HashMap<String, Document> = HashMap::with_capacity(docs.len());
    for doc in docs {
        match latest.entry(doc.title().to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(doc);
            }
            // Only a strictly later crawl replaces; ties keep the first seen.
            Entry::Occupied(mut slot) if doc.crawled_at() > slot.get().crawled_at() => {
                slot.insert(doc);
            }
            Entry::Occupied(_) => {}
        }
    }

    let mut ranked: Vec<Document> = latest.into_values().collect();
    ranked.sort_by(|a, b| {
        b.crawled_at()
            .cmp(&a.crawled_at())
            .then_with(|| a.title().cmp(b.title()))
    });
    ranked.truncate(limit);
    ranked
}
