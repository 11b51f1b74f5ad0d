//! Key namespaces for cache entries, dedup locks and request handles.

use sha2::{Digest, Sha256};

pub const CACHE_PREFIX: &str = "fuzzy:cache:";
pub const LOCK_PREFIX: &str = "fuzzy:lock:";
pub const REQUEST_PREFIX: &str = "query-result:";

/// Longest accepted keyword, in characters.
pub const MAX_KEYWORD_CHARS: usize = 256;

/// Trim a raw keyword, rejecting empty and oversized input.
pub fn normalize_keyword(raw: &str) -> Option<&str> {
    let keyword = raw.trim();
    if keyword.is_empty() || keyword.chars().count() > MAX_KEYWORD_CHARS {
        return None;
    }
    Some(keyword)
}

/// Hex SHA-256 of the keyword.
pub fn keyword_digest(keyword: &str) -> String {
    hex::encode(Sha256::digest(keyword.as_bytes()))
}

/// The cache and lock keys derived from one keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKeys {
    pub cache: String,
    pub lock: String,
}

impl QueryKeys {
    pub fn for_keyword(keyword: &str) -> Self {
        let digest = keyword_digest(keyword);
        Self {
            cache: format!("{CACHE_PREFIX}{digest}"),
            lock: format!("{LOCK_PREFIX}{digest}"),
        }
    }
}

pub fn request_key(req_id: &str) -> String {
    format!("{REQUEST_PREFIX}{req_id}")
}
