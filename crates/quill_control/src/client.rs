//! Per-endpoint control seam and the replica-group client.
//!
//! `NodeClient` is the single transport boundary: one method per wire
//! operation, addressed to one endpoint. `GroupClient` layers the
//! group-level operations on top — leader discovery, config-version
//! out-versioning, and the add/remove member wrappers that rewrite the
//! group config.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::keys::{IndexSpec, KeyPattern};
use crate::oplog::{OpTime, OplogPage};
use crate::routing::KeyRange;
use crate::{Document, Endpoint};

/// Leader and membership as reported by `is_leader`.
#[derive(Debug, Clone)]
pub struct LeaderInfo {
    pub leader: Endpoint,
    pub members: Vec<Endpoint>,
}

/// One member of a group config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub id: u32,
    pub host: Endpoint,
    pub priority: f64,
}

/// A replica group configuration, monotone in `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub version: u32,
    pub members: Vec<MemberSpec>,
}

impl GroupConfig {
    pub fn member_hosts(&self) -> Vec<Endpoint> {
        self.members.iter().map(|m| m.host.clone()).collect()
    }

    pub fn contains(&self, host: &Endpoint) -> bool {
        self.members.iter().any(|m| &m.host == host)
    }

    pub fn max_priority(&self) -> f64 {
        self.members
            .iter()
            .map(|m| m.priority)
            .fold(1.0, f64::max)
    }

    pub fn next_member_id(&self) -> u32 {
        self.members.iter().map(|m| m.id).max().unwrap_or(0) + 1
    }
}

/// A `moveData` request, addressed to the destination endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveDataRequest {
    pub ns: String,
    pub from: Endpoint,
    pub range: KeyRange,
    pub max_bytes: u64,
    /// Opaque token the receiver uses to skip duplicate application.
    pub chunk_id: String,
    pub config_addr: String,
    pub secondary_throttle: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MoveDataResponse {
    pub moved: u64,
}

/// The transport boundary: every control and data operation the
/// coordinator issues against a single endpoint.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    // Replica-set control plane.
    async fn is_leader(&self, ep: &Endpoint) -> ControlResult<LeaderInfo>;
    async fn group_config(&self, ep: &Endpoint) -> ControlResult<GroupConfig>;
    async fn reconfig(&self, ep: &Endpoint, config: GroupConfig, force: bool)
        -> ControlResult<()>;
    async fn step_down(&self, ep: &Endpoint, seconds: u64, force: bool) -> ControlResult<()>;
    async fn request_leadership(&self, ep: &Endpoint, min_priority: f64) -> ControlResult<()>;
    async fn heartbeat(&self, ep: &Endpoint) -> ControlResult<u32>;
    async fn rollback_id(&self, ep: &Endpoint) -> ControlResult<u32>;
    async fn last_applied(&self, ep: &Endpoint) -> ControlResult<OpTime>;

    // Oplog capture.
    async fn oplog_head(&self, ep: &Endpoint) -> ControlResult<OpTime>;
    async fn read_oplog(
        &self,
        ep: &Endpoint,
        since: OpTime,
        limit: usize,
    ) -> ControlResult<OplogPage>;

    // Data plane.
    async fn scan_projected(
        &self,
        ep: &Endpoint,
        ns: &str,
        fields: &[String],
    ) -> ControlResult<Vec<Document>>;
    async fn count_range(&self, ep: &Endpoint, ns: &str, range: &KeyRange) -> ControlResult<u64>;
    async fn collection_count(&self, ep: &Endpoint, ns: &str) -> ControlResult<u64>;
    async fn list_indexes(&self, ep: &Endpoint, ns: &str) -> ControlResult<Vec<IndexSpec>>;
    async fn ensure_index(
        &self,
        ep: &Endpoint,
        ns: &str,
        key: &KeyPattern,
        unique: bool,
    ) -> ControlResult<()>;
    async fn move_data(
        &self,
        ep: &Endpoint,
        request: MoveDataRequest,
    ) -> ControlResult<MoveDataResponse>;
    async fn insert(&self, ep: &Endpoint, ns: &str, doc: Document) -> ControlResult<()>;
    async fn update(
        &self,
        ep: &Endpoint,
        ns: &str,
        selector: &Document,
        update: Document,
        upsert: bool,
    ) -> ControlResult<()>;
    async fn delete(
        &self,
        ep: &Endpoint,
        ns: &str,
        selector: &Document,
        just_one: bool,
    ) -> ControlResult<()>;
}

/// Retry transient failures under a bounded budget with fixed backoff.
pub async fn with_retry<T, F, Fut>(
    what: &str,
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> ControlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                attempt += 1;
                tracing::debug!(what, attempt, error = %err, "retrying control operation");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Client for one replica group, addressed through its seed endpoints.
#[derive(Clone)]
pub struct GroupClient {
    client: Arc<dyn NodeClient>,
    name: String,
    seeds: Vec<Endpoint>,
    /// Freeze window handed to the old leader during a primary handoff.
    stepdown_freeze: Duration,
}

impl GroupClient {
    pub fn new(client: Arc<dyn NodeClient>, name: String, seeds: Vec<Endpoint>) -> Self {
        Self {
            client,
            name,
            seeds,
            stepdown_freeze: Duration::from_secs(120),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Discover the current leader, trying seeds in order.
    pub async fn leader(&self) -> ControlResult<LeaderInfo> {
        let mut last_err = None;
        for seed in &self.seeds {
            match self.client.is_leader(seed).await {
                Ok(info) => return Ok(info),
                Err(err) => {
                    tracing::debug!(group = %self.name, seed = %seed, error = %err,
                        "leader probe failed, trying next seed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ControlError::NotReady(format!("{}: no seeds configured", self.name))
        }))
    }

    /// Highest config version observed across the group.
    ///
    /// A peer reporting a version higher than the leader's silently
    /// advances the baseline; the next config is proposed at that
    /// maximum plus one.
    async fn version_baseline(&self, config: &GroupConfig) -> u32 {
        let mut baseline = config.version;
        for member in &config.members {
            match self.client.heartbeat(&member.host).await {
                Ok(version) => baseline = baseline.max(version),
                Err(err) => {
                    tracing::debug!(group = %self.name, member = %member.host, error = %err,
                        "heartbeat failed while collecting config versions");
                }
            }
        }
        baseline
    }

    /// Remove `host` from the group via a reconfig at the leader.
    pub async fn remove_member(&self, host: &Endpoint) -> ControlResult<()> {
        let info = self.leader().await?;
        let mut leader = info.leader;
        if &leader == host {
            // Removing the leader requires it to step down first.
            self.client.step_down(&leader, 60, false).await?;
            leader = self.leader().await?.leader;
        }
        let config = self.client.group_config(&leader).await?;
        if !config.contains(host) {
            return Ok(());
        }
        let version = self.version_baseline(&config).await + 1;
        let members = config
            .members
            .iter()
            .filter(|m| &m.host != host)
            .cloned()
            .collect();
        let new_config = GroupConfig {
            name: config.name,
            version,
            members,
        };
        tracing::info!(group = %self.name, host = %host, version,
            "removing member from group");
        self.client.reconfig(&leader, new_config, false).await
    }

    /// Add `host` back to the group. With `want_primary`, the member is
    /// given top priority and leadership is transferred to it: the old
    /// leader steps down frozen for the handoff window, then the new
    /// member requests leadership.
    pub async fn add_member(&self, host: &Endpoint, want_primary: bool) -> ControlResult<()> {
        let info = self.leader().await?;
        let leader = info.leader;
        let config = self.client.group_config(&leader).await?;
        let max_priority = config.max_priority();
        let version = self.version_baseline(&config).await + 1;

        let mut members = config.members.clone();
        if !config.contains(host) {
            members.push(MemberSpec {
                id: config.next_member_id(),
                host: host.clone(),
                priority: if want_primary { max_priority + 1.0 } else { 1.0 },
            });
        }
        let new_config = GroupConfig {
            name: config.name,
            version,
            members,
        };
        tracing::info!(group = %self.name, host = %host, version, want_primary,
            "adding member to group");
        self.client.reconfig(&leader, new_config, false).await?;

        if want_primary && &leader != host {
            self.client
                .step_down(&leader, self.stepdown_freeze.as_secs(), false)
                .await?;
            self.client
                .request_leadership(host, max_priority + 1.0)
                .await?;
        }
        Ok(())
    }
}
