//! Opening connections to discovered endpoints.

use crate::store::redis_store::RedisOptions;
use crate::store::{KvStore, MemoryCluster, RedisStore, StoreError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Translates addresses reported by the coordinator into addresses this process can reach.
///
/// Coordinators inside a container network report container-internal
/// addresses; deployments map those to published host ports here. Unknown
/// addresses pass through unchanged.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AddressMap(HashMap<String, String>);

impl AddressMap {
    pub fn new(map: HashMap<String, String>) -> Self {
        Self(map)
    }

    pub fn translate<'a>(&'a self, addr: &'a str) -> &'a str {
        self.0.get(addr).map(String::as_str).unwrap_or(addr)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for AddressMap {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(from, to)| (from.to_owned(), to.to_owned()))
                .collect(),
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `addr` without verifying it; the monitor probes separately.
    async fn connect(&self, addr: &str) -> Result<Arc<dyn KvStore>, StoreError>;
}

pub struct RedisConnector {
    options: RedisOptions,
}

impl RedisConnector {
    pub fn new(options: RedisOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn KvStore>, StoreError> {
        Ok(Arc::new(RedisStore::open(addr, &self.options)?))
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn KvStore>, StoreError> {
        Ok(Arc::new(self.open(addr)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_maps_known_addresses() {
        let map = AddressMap::from([
            ("172.28.0.10:6379", "localhost:6379"),
            ("172.28.0.11:6379", "localhost:6380"),
        ]);
        assert_eq!(map.translate("172.28.0.11:6379"), "localhost:6380");
    }

    #[test]
    fn translate_falls_back_to_identity() {
        let map = AddressMap::from([("172.28.0.10:6379", "localhost:6379")]);
        assert_eq!(map.translate("10.1.1.1:6379"), "10.1.1.1:6379");
        assert_eq!(AddressMap::default().translate("a:1"), "a:1");
    }

    #[test]
    fn deserializes_from_a_plain_table() {
        let map: AddressMap =
            serde_json::from_str(r#"{"172.28.0.12:6379": "localhost:6381"}"#).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.translate("172.28.0.12:6379"), "localhost:6381");
    }
}
