//! In-process store backend.
//!
//! A [`MemoryCluster`] is a set of named nodes, each holding one keyspace.
//! Several addresses may alias the same keyspace, which models a primary with
//! synchronously replicated read replicas; each address can be made
//! unreachable on its own. Expiry is measured with
//! `tokio::time::Instant`, so paused-clock tests observe TTLs exactly.

use super::{KvStore, StoreError, resolve_range};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: DashMap<String, Slot>,
}

impl Keyspace {

    /// Clone out a live slot, purging it first if it has expired.
    fn live(&self, key: &str) -> Option<Slot> {
        let slot = self.entries.get(key)?.clone();
        if slot.is_live() {
            Some(slot)
        } else {
            self.entries.remove_if(key, |_, slot| !slot.is_live());
            None
        }
    }
}

/// A connection handle onto one keyspace.
#[derive(Debug)]
pub struct MemoryStore {
    addr: String,
    keyspace: Arc<Keyspace>,
    reachable: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// A standalone store with its own private keyspace.
    pub fn new() -> Self {
        Self::on(String::from("memory"), &Node::default())
    }

    fn on(addr: String, node: &Node) -> Self {
        Self {
            addr,
            keyspace: node.keyspace.clone(),
            reachable: node.reachable.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<&Keyspace, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if !self.reachable.load(Ordering::Acquire) {
            return Err(StoreError::Connection(format!("{} is unreachable", self.addr)));
        }
        Ok(self.keyspace.as_ref())
    }

    /// Like [`check`](Self::check), after yielding once so concurrent callers
    /// interleave between a read and a following write as they would over a network.
    async fn round_trip(&self) -> Result<&Keyspace, StoreError> {
        tokio::task::yield_now().await;
        self.check()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check().map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.round_trip().await?.live(key).map(|slot| slot.value) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?
            .entries
            .insert(key.to_owned(), Slot::new(Value::Str(value.to_owned()), ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let slot = Slot::new(Value::Str(value.to_owned()), Some(ttl));
        // The entry guard holds the shard lock, so test and set are one step.
        match self.round_trip().await?.entries.entry(key.to_owned()) {
            Entry::Occupied(existing) if existing.get().is_live() => Ok(false),
            Entry::Occupied(mut expired) => {
                expired.insert(slot);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn hset(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let keyspace = self.check()?;
        let mut slot = keyspace
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Slot::new(Value::Hash(HashMap::new()), None));
        if !slot.is_live() {
            *slot = Slot::new(Value::Hash(HashMap::new()), None);
        }
        let Value::Hash(hash) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        for (field, value) in fields {
            hash.insert((*field).to_owned(), (*value).to_owned());
        }
        if let Some(ttl) = ttl {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        match self.round_trip().await?.live(key).map(|slot| slot.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let keyspace = self.check()?;
        let mut slot = keyspace
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Slot::new(Value::ZSet(Vec::new()), None));
        if !slot.is_live() {
            *slot = Slot::new(Value::ZSet(Vec::new()), None);
        }
        let Value::ZSet(members) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        match members.iter_mut().find(|(_, m)| m == member) {
            Some(existing) => existing.0 = score,
            None => members.push((score, member.to_owned())),
        }
        Ok(())
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut members = match self.check()?.live(key).map(|slot| slot.value) {
            None => return Ok(Vec::new()),
            Some(Value::ZSet(members)) => members,
            Some(_) => return Err(wrong_type(key)),
        };
        members.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        let Some((from, to)) = resolve_range(members.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(members[from..=to].iter().map(|(_, m)| m.clone()).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let keyspace = self.check()?;
        if let Some(mut slot) = keyspace.entries.get_mut(key) {
            match &mut slot.value {
                Value::ZSet(members) => members.retain(|(_, m)| m != member),
                _ => return Err(wrong_type(key)),
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check()?.entries.remove(key);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One addressable node: a keyspace, possibly shared, and its own reachability switch.
#[derive(Debug, Clone)]
struct Node {
    keyspace: Arc<Keyspace>,
    reachable: Arc<AtomicBool>,
}

impl Default for Node {
    fn default() -> Self {
        Self::sharing(Arc::default())
    }
}

impl Node {
    fn sharing(keyspace: Arc<Keyspace>) -> Self {
        Self {
            keyspace,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// A set of addressable in-process nodes.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    nodes: Arc<DashMap<String, Node>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node with its own keyspace.
    pub fn add_node(&self, addr: &str) {
        self.nodes.insert(addr.to_owned(), Node::default());
    }

    /// Register `addr` as a replica sharing `source`'s keyspace.
    ///
    /// Returns `false` if `source` is unknown.
    pub fn add_replica_of(&self, addr: &str, source: &str) -> bool {
        let Some(keyspace) = self.nodes.get(source).map(|n| n.keyspace.clone()) else {
            return false;
        };
        self.nodes.insert(addr.to_owned(), Node::sharing(keyspace));
        true
    }

    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        if let Some(node) = self.nodes.get(addr) {
            node.reachable.store(reachable, Ordering::Release);
        }
    }

    /// Open a new handle onto the node at `addr`.
    pub fn open(&self, addr: &str) -> Result<MemoryStore, StoreError> {
        let node = self
            .nodes
            .get(addr)
            .map(|n| n.clone())
            .ok_or_else(|| StoreError::Connection(format!("no node listening at {addr}")))?;
        Ok(MemoryStore::on(addr.to_owned(), &node))
    }
}
