//! In-process cluster used by `quillctl` and the integration tests.
//!
//! The simulation implements the `NodeClient` seam over a set of
//! in-memory nodes grouped into replica groups: leader writes
//! replicate to attached members and append oplog entries; detached
//! members freeze and are mutated only by `moveData`. Failure
//! injection (unreachable endpoints, forced `RetryLater`) drives the
//! abort and retry paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::client::{
    GroupConfig, LeaderInfo, MemberSpec, MoveDataRequest, MoveDataResponse, NodeClient,
};
use crate::error::{ControlError, ControlResult};
use crate::keys::{IndexSpec, KeyPattern};
use crate::migrate::estimated_bytes;
use crate::oplog::{OpKind, OplogEntry, OplogPage, OpTime};
use crate::routing::{
    new_epoch, ChunkLastmod, ChunkRecord, CollectionEntry, GroupEntry, KeyBound, KeyRange,
    RoutingStore, RoutingTable,
};
use crate::{Document, Endpoint};

/// Follower freshness window for unforced step-downs, in logical
/// seconds.
const STEP_DOWN_FRESHNESS_SECS: u64 = 10;

/// Fixture description of a cluster: groups, members, seed documents,
/// and the sharded collection's initial routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub groups: Vec<GroupSpec>,
    pub collection: CollectionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub members: Vec<Endpoint>,
    /// Documents seeded onto every member of this group.
    #[serde(default)]
    pub docs: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub ns: String,
    /// Current shard key document, e.g. `{"a": 1}`.
    pub key: Document,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub capped: bool,
    /// Initial chunk table; `null` bounds mean the infinite end caps.
    pub chunks: Vec<ChunkBoundSpec>,
    /// Extra indexes seeded on every member (the `_id` and shard-key
    /// indexes are always present).
    #[serde(default)]
    pub indexes: Vec<IndexSpecFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkBoundSpec {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub shard: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSpecFixture {
    pub key: Document,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

struct SimGroup {
    config: GroupConfig,
    leader: Option<Endpoint>,
}

struct SimNode {
    group: String,
    attached: bool,
    election_freeze_until: u64,
    rbid: u32,
    last_applied: OpTime,
    oplog: Vec<OplogEntry>,
    truncated_before: OpTime,
    collections: HashMap<String, BTreeMap<String, Document>>,
    indexes: HashMap<String, Vec<IndexSpec>>,
    applied_chunk_tokens: HashSet<String>,
}

impl SimNode {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            attached: true,
            election_freeze_until: 0,
            rbid: 1,
            last_applied: OpTime::ZERO,
            oplog: Vec::new(),
            truncated_before: OpTime::ZERO,
            collections: HashMap::new(),
            indexes: HashMap::new(),
            applied_chunk_tokens: HashSet::new(),
        }
    }
}

struct SimState {
    clock: u64,
    next_id: u64,
    nodes: HashMap<Endpoint, SimNode>,
    groups: BTreeMap<String, SimGroup>,
    unreachable: HashSet<Endpoint>,
    retry_later: HashMap<Endpoint, u32>,
}

impl SimState {
    fn tick(&mut self) -> OpTime {
        self.clock += 1;
        OpTime::new(self.clock, 0)
    }

    fn check_reachable(&self, ep: &Endpoint) -> ControlResult<()> {
        if self.unreachable.contains(ep) || !self.nodes.contains_key(ep) {
            return Err(ControlError::Unreachable(ep.clone()));
        }
        Ok(())
    }

    fn group_of(&self, ep: &Endpoint) -> ControlResult<&SimGroup> {
        let node = self
            .nodes
            .get(ep)
            .ok_or_else(|| ControlError::Unreachable(ep.clone()))?;
        self.groups
            .get(&node.group)
            .ok_or_else(|| ControlError::NotReady(ep.clone()))
    }

    fn is_group_leader(&self, ep: &Endpoint) -> ControlResult<bool> {
        Ok(self.group_of(ep)?.leader.as_ref() == Some(ep))
    }

    /// Highest-priority attached, unfrozen member; ties go to config
    /// order.
    fn elect(&self, group_name: &str, exclude: &[&Endpoint]) -> Option<Endpoint> {
        let group = self.groups.get(group_name)?;
        let mut best: Option<(f64, Endpoint)> = None;
        for member in &group.config.members {
            if exclude.contains(&&member.host) {
                continue;
            }
            let Some(node) = self.nodes.get(&member.host) else {
                continue;
            };
            if !node.attached
                || node.election_freeze_until > self.clock
                || self.unreachable.contains(&member.host)
            {
                continue;
            }
            let better = match &best {
                Some((priority, _)) => member.priority > *priority,
                None => true,
            };
            if better {
                best = Some((member.priority, member.host.clone()));
            }
        }
        best.map(|(_, host)| host)
    }

    /// Replicated write: apply at the leader and every attached member,
    /// appending the entry to each oplog.
    fn group_apply(&mut self, leader: &Endpoint, entry: OplogEntry) -> ControlResult<()> {
        let group_name = self
            .nodes
            .get(leader)
            .ok_or_else(|| ControlError::Unreachable(leader.clone()))?
            .group
            .clone();
        let members: Vec<Endpoint> = self
            .groups
            .get(&group_name)
            .map(|g| g.config.member_hosts())
            .unwrap_or_default();
        let mut assigned = self.next_id;
        for member in members {
            if let Some(node) = self.nodes.get_mut(&member) {
                if node.attached {
                    assigned = apply_entry(node, &entry, assigned, true);
                }
            }
        }
        self.next_id = assigned;
        Ok(())
    }
}

/// Stable map key for a document's primary key value.
fn id_key(value: &Document) -> String {
    value.to_string()
}

fn matches_selector(doc: &Document, selector: &Document) -> bool {
    selector
        .as_object()
        .map(|sel| sel.iter().all(|(k, v)| doc.get(k) == Some(v)))
        .unwrap_or(false)
}

/// Apply one entry to one node, returning the updated auto-id counter.
/// Inserts of an existing primary key and deletes of an absent one are
/// no-ops.
fn apply_entry(node: &mut SimNode, entry: &OplogEntry, mut next_id: u64, log: bool) -> u64 {
    let docs = node.collections.entry(entry.ns.clone()).or_default();
    match entry.op {
        OpKind::Insert => {
            let mut doc = entry.payload.clone();
            if doc.get("_id").is_none() {
                if let Some(obj) = doc.as_object_mut() {
                    next_id += 1;
                    obj.insert("_id".to_string(), json!(next_id));
                }
            }
            let id = doc.get("_id").map(id_key).unwrap_or_default();
            docs.entry(id).or_insert(doc);
        }
        OpKind::Update => {
            let selector = entry.selector.as_ref().unwrap_or(&entry.payload);
            let matched: Option<String> = docs
                .iter()
                .find(|(_, doc)| matches_selector(doc, selector))
                .map(|(id, _)| id.clone());
            match matched {
                Some(id) => {
                    let old_id = docs
                        .get(&id)
                        .and_then(|d| d.get("_id").cloned());
                    let mut updated = entry.payload.clone();
                    if let (Some(obj), Some(old_id)) = (updated.as_object_mut(), old_id) {
                        obj.entry("_id".to_string()).or_insert(old_id);
                    }
                    let new_id = updated.get("_id").map(id_key).unwrap_or(id.clone());
                    docs.remove(&id);
                    docs.insert(new_id, updated);
                }
                None if entry.flag => {
                    let mut doc = entry.payload.clone();
                    if doc.get("_id").is_none() {
                        if let Some(sel_id) = selector.get("_id").cloned() {
                            if let Some(obj) = doc.as_object_mut() {
                                obj.insert("_id".to_string(), sel_id);
                            }
                        }
                    }
                    let id = doc.get("_id").map(id_key).unwrap_or_else(|| {
                        next_id += 1;
                        json!(next_id).to_string()
                    });
                    docs.insert(id, doc);
                }
                None => {}
            }
        }
        OpKind::Delete => {
            let selector = entry.selector.as_ref().unwrap_or(&entry.payload);
            let matched: Vec<String> = docs
                .iter()
                .filter(|(_, doc)| matches_selector(doc, selector))
                .map(|(id, _)| id.clone())
                .collect();
            let take = if entry.flag { matched.len().min(1) } else { matched.len() };
            for id in matched.into_iter().take(take) {
                docs.remove(&id);
            }
        }
        OpKind::Noop | OpKind::Command => {}
    }
    if log {
        node.last_applied = entry.ts;
        node.oplog.push(entry.clone());
    }
    next_id
}

/// The in-process cluster.
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Build nodes and groups from a fixture, seeding documents and
    /// indexes onto every member.
    pub fn build(spec: &ClusterSpec) -> ControlResult<Self> {
        let collection_key = KeyPattern::parse(&spec.collection.key)?;
        let mut state = SimState {
            clock: 0,
            next_id: 0,
            nodes: HashMap::new(),
            groups: BTreeMap::new(),
            unreachable: HashSet::new(),
            retry_later: HashMap::new(),
        };

        let mut default_indexes = vec![
            IndexSpec {
                key: KeyPattern::ascending("_id"),
                unique: true,
                sparse: false,
            },
            IndexSpec {
                key: collection_key,
                unique: spec.collection.unique,
                sparse: false,
            },
        ];
        for fixture in &spec.collection.indexes {
            default_indexes.push(IndexSpec {
                key: KeyPattern::parse(&fixture.key)?,
                unique: fixture.unique,
                sparse: fixture.sparse,
            });
        }

        for group_spec in &spec.groups {
            if group_spec.members.is_empty() {
                return Err(ControlError::validation(format!(
                    "group {} has no members",
                    group_spec.name
                )));
            }
            let members = group_spec
                .members
                .iter()
                .enumerate()
                .map(|(i, host)| MemberSpec {
                    id: i as u32 + 1,
                    host: host.clone(),
                    priority: 1.0,
                })
                .collect();
            state.groups.insert(
                group_spec.name.clone(),
                SimGroup {
                    config: GroupConfig {
                        name: group_spec.name.clone(),
                        version: 1,
                        members,
                    },
                    leader: group_spec.members.first().cloned(),
                },
            );

            let mut seeded: BTreeMap<String, Document> = BTreeMap::new();
            for doc in &group_spec.docs {
                let mut doc = doc.clone();
                if doc.get("_id").is_none() {
                    if let Some(obj) = doc.as_object_mut() {
                        state.next_id += 1;
                        obj.insert("_id".to_string(), json!(state.next_id));
                    }
                }
                let id = doc.get("_id").map(id_key).unwrap_or_default();
                seeded.insert(id, doc);
            }

            for host in &group_spec.members {
                let mut node = SimNode::new(&group_spec.name);
                node.collections
                    .insert(spec.collection.ns.clone(), seeded.clone());
                node.indexes
                    .insert(spec.collection.ns.clone(), default_indexes.clone());
                state.nodes.insert(host.clone(), node);
            }
        }

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Seed the routing store from the fixture: group directory,
    /// collection catalog, and the initial chunk table.
    pub async fn bootstrap_store(
        spec: &ClusterSpec,
        store: &dyn RoutingStore,
    ) -> ControlResult<()> {
        let groups = spec
            .groups
            .iter()
            .map(|g| GroupEntry {
                name: g.name.clone(),
                seeds: g.members.clone(),
            })
            .collect();
        store.put_groups(groups).await?;

        store
            .put_collection(CollectionEntry {
                ns: spec.collection.ns.clone(),
                unique: spec.collection.unique,
                capped: spec.collection.capped,
            })
            .await?;

        let key = KeyPattern::parse(&spec.collection.key)?;
        let epoch = new_epoch();
        let chunks = spec
            .collection
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| ChunkRecord {
                ns: spec.collection.ns.clone(),
                min: c.min.map(KeyBound::Value).unwrap_or(KeyBound::NegInf),
                max: c.max.map(KeyBound::Value).unwrap_or(KeyBound::PosInf),
                shard: c.shard.clone(),
                lastmod: ChunkLastmod {
                    major: 1,
                    minor: i as u32,
                },
                epoch: epoch.clone(),
            })
            .collect();
        let table = RoutingTable {
            ns: spec.collection.ns.clone(),
            key,
            chunks,
        };
        if let Err(detail) = table.verify() {
            return Err(ControlError::validation(format!(
                "fixture chunk table invalid: {detail}"
            )));
        }
        store.put_table(table).await
    }

    /// Insert documents through the group leader, generating oplog
    /// entries like any client write.
    pub fn insert_many(&self, ns: &str, group: &str, docs: Vec<Document>) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        let leader = state
            .groups
            .get(group)
            .and_then(|g| g.leader.clone())
            .ok_or_else(|| ControlError::NotReady(group.to_string()))?;
        for doc in docs {
            let ts = state.tick();
            state.group_apply(
                &leader,
                OplogEntry {
                    ts,
                    op: OpKind::Insert,
                    ns: ns.to_string(),
                    payload: doc,
                    selector: None,
                    flag: false,
                },
            )?;
        }
        Ok(())
    }

    /// Append a no-op entry at the group leader.
    pub fn append_noop(&self, ns: &str, group: &str) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        let leader = state
            .groups
            .get(group)
            .and_then(|g| g.leader.clone())
            .ok_or_else(|| ControlError::NotReady(group.to_string()))?;
        let ts = state.tick();
        state.group_apply(
            &leader,
            OplogEntry {
                ts,
                op: OpKind::Noop,
                ns: ns.to_string(),
                payload: json!({}),
                selector: None,
                flag: false,
            },
        )
    }

    pub fn leader_of(&self, group: &str) -> Option<Endpoint> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(group)
            .and_then(|g| g.leader.clone())
    }

    /// Current member hosts of a group, in config order.
    pub fn members_of(&self, group: &str) -> Vec<Endpoint> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(group)
            .map(|g| g.config.member_hosts())
            .unwrap_or_default()
    }

    pub fn docs_on(&self, ep: &Endpoint, ns: &str) -> Vec<Document> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(ep)
            .and_then(|n| n.collections.get(ns))
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_unreachable(&self, ep: &Endpoint, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(ep.clone());
        } else {
            state.unreachable.remove(ep);
        }
    }

    /// Make the next `count` leadership requests at `ep` fail with
    /// `RetryLater`.
    pub fn inject_retry_later(&self, ep: &Endpoint, count: u32) {
        self.state
            .lock()
            .unwrap()
            .retry_later
            .insert(ep.clone(), count);
    }

    /// Discard oplog entries before `before` on one node.
    pub fn truncate_oplog(&self, ep: &Endpoint, before: OpTime) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(ep) {
            node.oplog.retain(|e| e.ts >= before);
            node.truncated_before = before;
        }
    }
}

#[async_trait::async_trait]
impl NodeClient for SimCluster {
    async fn is_leader(&self, ep: &Endpoint) -> ControlResult<LeaderInfo> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let group = state.group_of(ep)?;
        let leader = group
            .leader
            .clone()
            .ok_or_else(|| ControlError::NotReady(ep.clone()))?;
        Ok(LeaderInfo {
            leader,
            members: group.config.member_hosts(),
        })
    }

    async fn group_config(&self, ep: &Endpoint) -> ControlResult<GroupConfig> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        Ok(state.group_of(ep)?.config.clone())
    }

    async fn reconfig(
        &self,
        ep: &Endpoint,
        config: GroupConfig,
        force: bool,
    ) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        if !force && !state.is_group_leader(ep)? {
            return Err(ControlError::NotLeader(ep.clone()));
        }
        let group_name = state.nodes.get(ep).expect("checked reachable").group.clone();
        let current = state
            .groups
            .get(&group_name)
            .map(|g| g.config.clone())
            .ok_or_else(|| ControlError::NotReady(ep.clone()))?;
        if config.version <= current.version {
            // Idempotent by config version.
            return Ok(());
        }

        let old_hosts: HashSet<Endpoint> = current.member_hosts().into_iter().collect();
        let new_hosts: HashSet<Endpoint> = config.member_hosts().into_iter().collect();
        let leader_snapshot = state
            .groups
            .get(&group_name)
            .and_then(|g| g.leader.clone());

        // Freeze removed members.
        for host in old_hosts.difference(&new_hosts) {
            if let Some(node) = state.nodes.get_mut(host) {
                node.attached = false;
            }
        }

        // Attach added members. A brand-new node takes an initial sync
        // from the leader; a rejoining replica keeps its frozen data and
        // catches up to the leader's oplog position.
        let leader_state = leader_snapshot.as_ref().and_then(|l| {
            state
                .nodes
                .get(l)
                .map(|n| (n.collections.clone(), n.oplog.clone(), n.last_applied))
        });
        for host in new_hosts.difference(&old_hosts) {
            // A never-seen node takes an initial sync; a rejoining
            // replica keeps its own data and only its oplog position
            // catches up to the leader.
            let brand_new = !state.nodes.contains_key(host);
            let node = state
                .nodes
                .entry(host.clone())
                .or_insert_with(|| SimNode::new(&group_name));
            node.group = group_name.clone();
            node.attached = true;
            if let Some((collections, oplog, last_applied)) = &leader_state {
                if brand_new {
                    node.collections = collections.clone();
                    node.oplog = oplog.clone();
                }
                node.last_applied = *last_applied;
            }
        }

        let group = state.groups.get_mut(&group_name).expect("group exists");
        group.config = config;
        let leader_removed = group
            .leader
            .as_ref()
            .map(|l| !new_hosts.contains(l))
            .unwrap_or(true);
        if leader_removed {
            group.leader = None;
            if let Some(next) = state.elect(&group_name, &[]) {
                state.groups.get_mut(&group_name).expect("group exists").leader = Some(next);
            }
        }
        Ok(())
    }

    async fn step_down(&self, ep: &Endpoint, seconds: u64, force: bool) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        if !state.is_group_leader(ep)? {
            return Err(ControlError::NotLeader(ep.clone()));
        }
        let seconds = if seconds == 0 { 60 } else { seconds };
        let group_name = state.nodes.get(ep).expect("checked reachable").group.clone();

        if !force {
            let leader_applied = state.nodes.get(ep).expect("checked").last_applied;
            let followers: Vec<Endpoint> = state
                .groups
                .get(&group_name)
                .map(|g| g.config.member_hosts())
                .unwrap_or_default()
                .into_iter()
                .filter(|h| h != ep)
                .collect();
            let mut closest: Option<i64> = None;
            for follower in &followers {
                let Some(node) = state.nodes.get(follower) else {
                    continue;
                };
                if !node.attached {
                    continue;
                }
                let diff = leader_applied.secs as i64 - node.last_applied.secs as i64;
                if closest.map(|c| diff < c).unwrap_or(true) {
                    closest = Some(diff);
                }
            }
            match closest {
                Some(diff) if diff < 0 => {
                    return Err(ControlError::Unsafe {
                        endpoint: ep.clone(),
                        reason: "someone is ahead of the primary?".to_string(),
                    });
                }
                Some(diff) if diff > STEP_DOWN_FRESHNESS_SECS as i64 => {
                    return Err(ControlError::Unsafe {
                        endpoint: ep.clone(),
                        reason: format!("no followers within {STEP_DOWN_FRESHNESS_SECS} seconds of my optime"),
                    });
                }
                Some(_) => {}
                None => {
                    return Err(ControlError::Unsafe {
                        endpoint: ep.clone(),
                        reason: "no attached followers".to_string(),
                    });
                }
            }
        }

        let clock = state.clock;
        if let Some(node) = state.nodes.get_mut(ep) {
            node.election_freeze_until = clock + seconds;
        }
        let next = state.elect(&group_name, &[ep]);
        state
            .groups
            .get_mut(&group_name)
            .expect("group exists")
            .leader = next;
        Ok(())
    }

    async fn request_leadership(&self, ep: &Endpoint, _min_priority: f64) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        if let Some(count) = state.retry_later.get_mut(ep) {
            if *count > 0 {
                *count -= 1;
                return Err(ControlError::RetryLater(format!(
                    "{ep}: election in progress"
                )));
            }
        }
        let node = state.nodes.get(ep).expect("checked reachable");
        let group_name = node.group.clone();
        let attached = node.attached;
        let in_config = state
            .groups
            .get(&group_name)
            .map(|g| g.config.contains(ep))
            .unwrap_or(false);
        if !attached || !in_config {
            return Err(ControlError::Rejected(ep.clone()));
        }
        state
            .groups
            .get_mut(&group_name)
            .expect("group exists")
            .leader = Some(ep.clone());
        Ok(())
    }

    async fn heartbeat(&self, ep: &Endpoint) -> ControlResult<u32> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        Ok(state.group_of(ep)?.config.version)
    }

    async fn rollback_id(&self, ep: &Endpoint) -> ControlResult<u32> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        Ok(state.nodes.get(ep).expect("checked reachable").rbid)
    }

    async fn last_applied(&self, ep: &Endpoint) -> ControlResult<OpTime> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        Ok(state.nodes.get(ep).expect("checked reachable").last_applied)
    }

    async fn oplog_head(&self, ep: &Endpoint) -> ControlResult<OpTime> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let node = state.nodes.get(ep).expect("checked reachable");
        Ok(node.oplog.last().map(|e| e.ts).unwrap_or(OpTime::ZERO))
    }

    async fn read_oplog(
        &self,
        ep: &Endpoint,
        since: OpTime,
        limit: usize,
    ) -> ControlResult<OplogPage> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let node = state.nodes.get(ep).expect("checked reachable");
        let entries = node
            .oplog
            .iter()
            .filter(|e| e.ts >= since)
            .take(limit)
            .cloned()
            .collect();
        Ok(OplogPage {
            entries,
            truncated_before: node.truncated_before,
        })
    }

    async fn scan_projected(
        &self,
        ep: &Endpoint,
        ns: &str,
        fields: &[String],
    ) -> ControlResult<Vec<Document>> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let node = state.nodes.get(ep).expect("checked reachable");
        let docs = node.collections.get(ns);
        Ok(docs
            .map(|docs| {
                docs.values()
                    .map(|doc| {
                        let mut projected = serde_json::Map::new();
                        for field in fields {
                            if let Some(value) = doc.get(field) {
                                projected.insert(field.clone(), value.clone());
                            }
                        }
                        Document::Object(projected)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_range(&self, ep: &Endpoint, ns: &str, range: &KeyRange) -> ControlResult<u64> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let node = state.nodes.get(ep).expect("checked reachable");
        Ok(node
            .collections
            .get(ns)
            .map(|docs| {
                docs.values()
                    .filter(|doc| {
                        doc.get(&range.field)
                            .and_then(|v| v.as_f64())
                            .map(|v| range.contains(v))
                            .unwrap_or(false)
                    })
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn collection_count(&self, ep: &Endpoint, ns: &str) -> ControlResult<u64> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let node = state.nodes.get(ep).expect("checked reachable");
        Ok(node.collections.get(ns).map(|d| d.len() as u64).unwrap_or(0))
    }

    async fn list_indexes(&self, ep: &Endpoint, ns: &str) -> ControlResult<Vec<IndexSpec>> {
        let state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let node = state.nodes.get(ep).expect("checked reachable");
        Ok(node.indexes.get(ns).cloned().unwrap_or_default())
    }

    async fn ensure_index(
        &self,
        ep: &Endpoint,
        ns: &str,
        key: &KeyPattern,
        unique: bool,
    ) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let group_name = state.nodes.get(ep).expect("checked reachable").group.clone();
        let members: Vec<Endpoint> = state
            .groups
            .get(&group_name)
            .map(|g| g.config.member_hosts())
            .unwrap_or_default();
        for member in members {
            if let Some(node) = state.nodes.get_mut(&member) {
                if !node.attached {
                    continue;
                }
                let indexes = node.indexes.entry(ns.to_string()).or_default();
                if !indexes.iter().any(|i| i.key.same_pattern(key)) {
                    indexes.push(IndexSpec {
                        key: key.clone(),
                        unique,
                        sparse: false,
                    });
                }
            }
        }
        Ok(())
    }

    async fn move_data(
        &self,
        ep: &Endpoint,
        request: MoveDataRequest,
    ) -> ControlResult<MoveDataResponse> {
        let mut state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        state.check_reachable(&request.from)?;

        let already_applied = state
            .nodes
            .get(ep)
            .expect("checked reachable")
            .applied_chunk_tokens
            .contains(&request.chunk_id);
        if already_applied {
            return Ok(MoveDataResponse { moved: 0 });
        }

        let source = state.nodes.get(&request.from).expect("checked reachable");
        let matching: Vec<(String, Document)> = source
            .collections
            .get(&request.ns)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| {
                        doc.get(&request.range.field)
                            .and_then(|v| v.as_f64())
                            .map(|v| request.range.contains(v))
                            .unwrap_or(false)
                    })
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let source_count = matching.len() as u64;

        let batch: Vec<Document> = matching.iter().map(|(_, d)| d.clone()).collect();
        if estimated_bytes(&batch) > request.max_bytes {
            return Err(ControlError::validation(format!(
                "chunk {} exceeds maxChunkSizeBytes",
                request.chunk_id
            )));
        }

        // Count-checked copy at the receiver, then delete at the sender.
        let dest = state.nodes.get_mut(ep).expect("checked reachable");
        let dest_docs = dest.collections.entry(request.ns.clone()).or_default();
        let mut applied = 0u64;
        for (id, doc) in &matching {
            dest_docs.entry(id.clone()).or_insert_with(|| doc.clone());
            applied += 1;
        }
        if applied != source_count {
            return Err(ControlError::validation(format!(
                "chunk {}: copied {applied} of {source_count} documents",
                request.chunk_id
            )));
        }
        dest.applied_chunk_tokens.insert(request.chunk_id.clone());

        let source = state
            .nodes
            .get_mut(&request.from)
            .expect("checked reachable");
        if let Some(docs) = source.collections.get_mut(&request.ns) {
            for (id, _) in &matching {
                docs.remove(id);
            }
        }
        Ok(MoveDataResponse {
            moved: source_count,
        })
    }

    async fn insert(&self, ep: &Endpoint, ns: &str, doc: Document) -> ControlResult<()> {
        self.write(ep, ns, OpKind::Insert, doc, None, false).await
    }

    async fn update(
        &self,
        ep: &Endpoint,
        ns: &str,
        selector: &Document,
        update: Document,
        upsert: bool,
    ) -> ControlResult<()> {
        self.write(ep, ns, OpKind::Update, update, Some(selector.clone()), upsert)
            .await
    }

    async fn delete(
        &self,
        ep: &Endpoint,
        ns: &str,
        selector: &Document,
        just_one: bool,
    ) -> ControlResult<()> {
        self.write(
            ep,
            ns,
            OpKind::Delete,
            selector.clone(),
            Some(selector.clone()),
            just_one,
        )
        .await
    }
}

impl SimCluster {
    async fn write(
        &self,
        ep: &Endpoint,
        ns: &str,
        op: OpKind,
        payload: Document,
        selector: Option<Document>,
        flag: bool,
    ) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_reachable(ep)?;
        let attached = state.nodes.get(ep).expect("checked reachable").attached;
        // A detached replica is frozen: only `moveData` touches it.
        if !attached || !state.is_group_leader(ep)? {
            return Err(ControlError::NotLeader(ep.clone()));
        }
        let ts = state.tick();
        let entry = OplogEntry {
            ts,
            op,
            ns: ns.to_string(),
            payload,
            selector,
            flag,
        };
        state.group_apply(ep, entry)
    }
}
