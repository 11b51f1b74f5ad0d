//! Stored shapes of cache entries and request handles.
//!
//! Both are Redis-style hashes. A missing hash (or one without a recognizable
//! status) is the `absent` state.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a cache entry. Ordering follows the allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryStatus {
    Loading,
    Ready,
    Failed,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Loading => "loading",
            EntryStatus::Ready => "ready",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Ready | EntryStatus::Failed)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loading" => Ok(EntryStatus::Loading),
            "ready" => Ok(EntryStatus::Ready),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(format!("unknown entry status {other:?}")),
        }
    }
}

pub mod field {
    pub const STATUS: &str = "status";
    pub const KEYWORD: &str = "keyword";
    pub const DATA: &str = "data";
    pub const ERROR: &str = "error_msg";
    pub const CREATED: &str = "create_time";
    pub const UPDATED: &str = "update_time";
    pub const CACHE_KEY: &str = "cache_key";
    pub const PENDING: &str = "pending";
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
}

/// Hash fields ready to hand to `KvStore::hset`.
pub type Fields = Vec<(&'static str, String)>;

pub fn as_pairs(fields: &Fields) -> Vec<(&str, &str)> {
    fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub status: EntryStatus,
    pub keyword: Option<String>,
    /// Serialized result, meaningful only when ready.
    pub payload: Option<String>,
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Decode a stored hash; `None` for the absent state.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let status = fields.get(field::STATUS)?.parse::<EntryStatus>().ok()?;
        let non_empty = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();
        Some(Self {
            status,
            keyword: non_empty(field::KEYWORD),
            payload: non_empty(field::DATA),
            error: non_empty(field::ERROR),
            created_at: parse_timestamp(fields, field::CREATED),
            updated_at: parse_timestamp(fields, field::UPDATED),
        })
    }

    /// Parse the ready payload. Malformed payloads are a cache miss to the caller.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(self.payload.as_deref().unwrap_or_default())
    }

    /// Fields claiming a key for computation.
    pub fn loading_fields(keyword: &str, now: DateTime<Utc>) -> Fields {
        let now = timestamp(now);
        vec![
            (field::STATUS, EntryStatus::Loading.as_str().to_owned()),
            (field::KEYWORD, keyword.to_owned()),
            (field::ERROR, String::new()),
            (field::CREATED, now.clone()),
            (field::UPDATED, now),
        ]
    }

    pub fn ready_fields(payload: &str, now: DateTime<Utc>) -> Fields {
        vec![
            (field::STATUS, EntryStatus::Ready.as_str().to_owned()),
            (field::DATA, payload.to_owned()),
            (field::ERROR, String::new()),
            (field::UPDATED, timestamp(now)),
        ]
    }

    pub fn failed_fields(error: &str, now: DateTime<Utc>) -> Fields {
        vec![
            (field::STATUS, EntryStatus::Failed.as_str().to_owned()),
            (field::ERROR, error.to_owned()),
            (field::UPDATED, timestamp(now)),
        ]
    }
}

/// A client's handle onto a (shared) cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHandle {
    pub req_id: String,
    pub keyword: String,
    pub cache_key: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl RequestHandle {
    pub fn new(req_id: String, keyword: &str, cache_key: &str, now: DateTime<Utc>) -> Self {
        Self {
            req_id,
            keyword: keyword.to_owned(),
            cache_key: cache_key.to_owned(),
            created_at: Some(now),
        }
    }

    pub fn from_fields(req_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let cache_key = fields.get(field::CACHE_KEY).filter(|k| !k.is_empty())?;
        Some(Self {
            req_id: req_id.to_owned(),
            keyword: fields.get(field::KEYWORD).cloned().unwrap_or_default(),
            cache_key: cache_key.clone(),
            created_at: parse_timestamp(fields, field::CREATED),
        })
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = vec![
            (field::STATUS, field::PENDING.to_owned()),
            (field::KEYWORD, self.keyword.clone()),
            (field::CACHE_KEY, self.cache_key.clone()),
        ];
        if let Some(at) = self.created_at {
            fields.push((field::CREATED, timestamp(at)));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_map(fields: &Fields) -> HashMap<String, String> {
        fields
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn absent_hash_is_no_entry() {
        assert_eq!(CacheEntry::from_fields(&HashMap::new()), None);
    }

    #[test]
    fn unknown_status_is_no_entry() {
        let map = HashMap::from([("status".to_owned(), "exploded".to_owned())]);
        assert_eq!(CacheEntry::from_fields(&map), None);
    }

    #[test]
    fn loading_then_ready_decodes_as_ready() {
        let now = Utc::now();
        let mut map = to_map(&CacheEntry::loading_fields("weather", now));
        map.extend(to_map(&CacheEntry::ready_fields(r#"[{"title":"x"}]"#, now)));

        let entry = CacheEntry::from_fields(&map).unwrap();
        assert_eq!(entry.status, EntryStatus::Ready);
        assert_eq!(entry.keyword.as_deref(), Some("weather"));
        assert_eq!(entry.error, None);
        assert_eq!(entry.payload_json().unwrap()[0]["title"], "x");
        assert!(entry.created_at.is_some());
    }

    #[test]
    fn failed_carries_error() {
        let map = to_map(&CacheEntry::failed_fields("all shards failed", Utc::now()));
        let entry = CacheEntry::from_fields(&map).unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("all shards failed"));
    }

    #[test]
    fn malformed_payload_fails_to_parse() {
        let map = to_map(&CacheEntry::ready_fields("{not json", Utc::now()));
        assert!(CacheEntry::from_fields(&map).unwrap().payload_json().is_err());
    }

    #[test]
    fn status_order_matches_lifecycle() {
        assert!(EntryStatus::Loading < EntryStatus::Ready);
        assert!(EntryStatus::Loading < EntryStatus::Failed);
        assert!(!EntryStatus::Loading.is_terminal());
        assert!(EntryStatus::Failed.is_terminal());
    }

    #[test]
    fn request_handle_round_trip() {
        let handle = RequestHandle::new("01J0".into(), "weather", "fuzzy:cache:ab", Utc::now());
        let decoded = RequestHandle::from_fields("01J0", &to_map(&handle.to_fields())).unwrap();
        assert_eq!(decoded.cache_key, "fuzzy:cache:ab");
        assert_eq!(decoded.keyword, "weather");
    }

    #[test]
    fn request_handle_without_cache_key_is_missing() {
        let map = HashMap::from([("status".to_owned(), "pending".to_owned())]);
        assert_eq!(RequestHandle::from_fields("x", &map), None);
    }
}
