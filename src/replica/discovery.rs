//! Failover coordinator queries: where is the primary, which replicas exist.

use super::MonitorError;
use async_trait::async_trait;
use redis::Value;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait FailoverCoordinator: Send + Sync {
    /// Current primary address for the group.
    async fn primary_addr(&self, group: &str) -> Result<String, MonitorError>;

    /// Current replica addresses for the group. An empty list is an authoritative answer.
    async fn replica_addrs(&self, group: &str) -> Result<Vec<String>, MonitorError>;
}

/// Join a host and port the way `host:port` addresses are written, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6()) {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Queries Redis Sentinel (`SENTINEL REPLICAS`, `SENTINEL GET-MASTER-ADDR-BY-NAME`).
pub struct SentinelCoordinator {
    sentinels: Vec<String>,
    timeout: Duration,
}

impl SentinelCoordinator {
    pub fn new(sentinels: Vec<String>, timeout: Duration) -> Self {
        Self { sentinels, timeout }
    }

    /// Send `cmd` to each sentinel in turn until one answers.
    async fn ask(&self, cmd: &redis::Cmd) -> Result<Value, MonitorError> {
        if self.sentinels.is_empty() {
            return Err(MonitorError::Discovery(
                "sentinel address list is empty".into(),
            ));
        }

        let mut last_error = None;
        for sentinel in &self.sentinels {
            let attempt = async {
                let client = redis::Client::open(format!("redis://{sentinel}"))?;
                let mut conn = client.get_multiplexed_async_connection().await?;
                cmd.query_async::<Value>(&mut conn).await
            };
            match tokio::time::timeout(self.timeout, attempt).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    debug!(sentinel = sentinel.as_str(), error = %e, "sentinel query failed");
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    debug!(sentinel = sentinel.as_str(), "sentinel query timed out");
                    last_error = Some(format!("{sentinel} timed out"));
                }
            }
        }
        Err(MonitorError::Discovery(format!(
            "no sentinel answered: {}",
            last_error.unwrap_or_default()
        )))
    }
}

#[async_trait]
impl FailoverCoordinator for SentinelCoordinator {
    async fn primary_addr(&self, group: &str) -> Result<String, MonitorError> {
        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("GET-MASTER-ADDR-BY-NAME").arg(group);
        let reply = self.ask(&cmd).await?;
        parse_primary_reply(&reply).ok_or_else(|| {
            MonitorError::Discovery(format!("sentinel does not know group {group}"))
        })
    }

    async fn replica_addrs(&self, group: &str) -> Result<Vec<String>, MonitorError> {
        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("REPLICAS").arg(group);
        let reply = self.ask(&cmd).await?;
        parse_replicas_reply(&reply)
    }
}

fn value_str(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::Double(n) => Some(format!("{n:.0}")),
        _ => None,
    }
}

/// Flatten one replica description into `(field, value)` pairs.
///
/// RESP2 sentinels answer with flat `[k1, v1, k2, v2, ...]` arrays, RESP3 with maps.
fn fields(entry: &Value) -> Option<Vec<(String, String)>> {
    match entry {
        Value::Array(flat) => Some(
            flat.chunks_exact(2)
                .filter_map(|pair| Some((value_str(&pair[0])?, value_str(&pair[1])?)))
                .collect(),
        ),
        Value::Map(pairs) => Some(
            pairs
                .iter()
                .filter_map(|(k, v)| Some((value_str(k)?, value_str(v)?)))
                .collect(),
        ),
        _ => None,
    }
}

/// Extract replica addresses from a `SENTINEL REPLICAS` reply.
///
/// Entries that are malformed or missing ip/port are skipped with a warning.
pub fn parse_replicas_reply(reply: &Value) -> Result<Vec<String>, MonitorError> {
    let Value::Array(entries) = reply else {
        return Err(MonitorError::Discovery(
            "invalid SENTINEL REPLICAS response".into(),
        ));
    };

    let mut addrs = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(pairs) = fields(entry) else {
            warn!("invalid replica entry format, skipping");
            continue;
        };
        let lookup = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .filter(|v| !v.is_empty())
        };
        match (lookup("ip"), lookup("port")) {
            (Some(ip), Some(port)) => addrs.push(join_host_port(ip, port)),
            (ip, port) => warn!(?ip, ?port, "replica entry missing ip/port, skipping"),
        }
    }
    Ok(addrs)
}

/// Extract `host:port` from a `SENTINEL GET-MASTER-ADDR-BY-NAME` reply (nil when unknown).
pub fn parse_primary_reply(reply: &Value) -> Option<String> {
    match reply {
        Value::Array(parts) if parts.len() == 2 => {
            Some(join_host_port(&value_str(&parts[0])?, &value_str(&parts[1])?))
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Topology {
    primary: String,
    replicas: Vec<String>,
    available: bool,
}

/// A coordinator whose answers are set programmatically.
///
/// Serves single-node deployments (a fixed primary and no replicas) and tests
/// that need to move the topology around.
#[derive(Debug, Clone)]
pub struct StaticCoordinator {
    topology: Arc<RwLock<Topology>>,
}

impl StaticCoordinator {
    pub fn new(primary: impl Into<String>, replicas: Vec<String>) -> Self {
        Self {
            topology: Arc::new(RwLock::new(Topology {
                primary: primary.into(),
                replicas,
                available: true,
            })),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Topology)) {
        let mut topology = self
            .topology
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut topology);
    }

    fn snapshot(&self) -> Result<Topology, MonitorError> {
        let topology = self
            .topology
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if topology.available {
            Ok(topology)
        } else {
            Err(MonitorError::Discovery("coordinator unavailable".into()))
        }
    }

    pub fn set_replicas(&self, replicas: Vec<String>) {
        self.update(|t| t.replicas = replicas);
    }

    pub fn set_primary(&self, primary: impl Into<String>) {
        let primary = primary.into();
        self.update(|t| t.primary = primary);
    }

    /// Make every query fail until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.update(|t| t.available = available);
    }
}

#[async_trait]
impl FailoverCoordinator for StaticCoordinator {
    async fn primary_addr(&self, _group: &str) -> Result<String, MonitorError> {
        Ok(self.snapshot()?.primary)
    }

    async fn replica_addrs(&self, _group: &str) -> Result<Vec<String>, MonitorError> {
        Ok(self.snapshot()?.replicas)
    }
}
