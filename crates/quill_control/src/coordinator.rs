//! The resharding session state machine.
//!
//! One session drives a single `reShardCollection` invocation through
//! its stages:
//!
//! ```text
//! INIT -> VALIDATE -> LOCK -> SNAPSHOT -> DETACH -> SAMPLE -> MIGRATE
//!      -> COMMIT -> REJOIN -> REPLAY -> DONE
//!                                 |
//!          any stage failure -----+--> ABORT -> rejoin -> FAIL
//! ```
//!
//! The machine is stepwise: `step` executes the current stage and
//! advances, `run` drives steps to a terminal state. COMMIT is the
//! linearization point; everything before it leaves routing untouched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{with_retry, GroupClient, NodeClient};
use crate::detach::{DetachManager, DetachedReplica};
use crate::error::{ControlError, ControlResult};
use crate::keys::{self, KeyPattern};
use crate::migrate::{FailedChunk, MigrationConfig, MigrationEngine};
use crate::oplog::{OpTime, OplogEntry, OplogTailer};
use crate::replay::OplogReplayer;
use crate::routing::{
    chunk_ranges, new_epoch, ChunkSpec, ChunkVersion, Lease, RoutingCache, RoutingStore,
    RoutingTable,
};
use crate::sample::{build_assignment, scan_detached, Assignment};
use crate::{Document, Endpoint};

/// Stages of a resharding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Validate,
    Lock,
    Snapshot,
    Detach,
    Sample,
    Migrate,
    Commit,
    Rejoin,
    Replay,
    Done,
    Abort,
    Failed,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::Init => Stage::Validate,
            Stage::Validate => Stage::Lock,
            Stage::Lock => Stage::Snapshot,
            Stage::Snapshot => Stage::Detach,
            Stage::Detach => Stage::Sample,
            Stage::Sample => Stage::Migrate,
            Stage::Migrate => Stage::Commit,
            Stage::Commit => Stage::Rejoin,
            Stage::Rejoin => Stage::Replay,
            Stage::Replay => Stage::Done,
            Stage::Done | Stage::Abort | Stage::Failed => self,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Validate => "validate",
            Stage::Lock => "lock",
            Stage::Snapshot => "snapshot",
            Stage::Detach => "detach",
            Stage::Sample => "sample",
            Stage::Migrate => "migrate",
            Stage::Commit => "commit",
            Stage::Rejoin => "rejoin",
            Stage::Replay => "replay",
            Stage::Done => "done",
            Stage::Abort => "abort",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tunables for one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline applied to each stage.
    pub stage_timeout: Duration,
    /// Attempts for transient failures before the session aborts.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// TTL of the distributed lock; renewed at a third of this.
    pub lock_ttl: Duration,
    pub max_chunk_bytes: u64,
    pub secondary_throttle: bool,
    /// Config store address stamped into `moveData` requests.
    pub config_addr: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            lock_ttl: Duration::from_secs(30),
            max_chunk_bytes: 64 * 1024 * 1024,
            secondary_throttle: true,
            config_addr: String::new(),
        }
    }
}

/// One `reShardCollection` invocation.
#[derive(Debug, Clone)]
pub struct ReshardRequest {
    pub ns: String,
    /// Proposed key document, e.g. `{"b": 1}`.
    pub key: Document,
    pub unique: bool,
    pub num_initial_chunks: Option<u32>,
}

/// Result payload of a session. Every failed operation the session
/// survived is listed here; nothing is silently swallowed.
#[derive(Debug)]
pub struct ReshardOutcome {
    pub ok: bool,
    pub errmsg: Option<String>,
    pub routing_version: Option<ChunkVersion>,
    pub failed_chunks: Vec<FailedChunk>,
    pub rejoin_errors: Vec<String>,
    pub replayed: u64,
    pub replay_failures: Vec<String>,
}

impl ReshardOutcome {
    pub fn to_document(&self) -> Document {
        let mut doc = json!({ "ok": if self.ok { 1 } else { 0 } });
        let obj = doc.as_object_mut().expect("object");
        if let Some(errmsg) = &self.errmsg {
            obj.insert("errmsg".to_string(), json!(errmsg));
        }
        if let Some(version) = &self.routing_version {
            obj.insert(
                "routingVersion".to_string(),
                json!({
                    "epoch": version.epoch,
                    "major": version.major,
                    "minor": version.minor,
                }),
            );
        }
        if !self.failed_chunks.is_empty() {
            obj.insert(
                "failedChunks".to_string(),
                serde_json::to_value(&self.failed_chunks).unwrap_or_default(),
            );
        }
        if !self.rejoin_errors.is_empty() {
            obj.insert("rejoinErrors".to_string(), json!(self.rejoin_errors));
        }
        obj.insert("replayed".to_string(), json!(self.replayed));
        if !self.replay_failures.is_empty() {
            obj.insert("replayFailures".to_string(), json!(self.replay_failures));
        }
        doc
    }
}

/// Factory for resharding sessions over one cluster.
pub struct ReshardCoordinator {
    client: Arc<dyn NodeClient>,
    store: Arc<dyn RoutingStore>,
    cache: Arc<RoutingCache>,
    config: CoordinatorConfig,
}

impl ReshardCoordinator {
    pub fn new(
        client: Arc<dyn NodeClient>,
        store: Arc<dyn RoutingStore>,
        cache: Arc<RoutingCache>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            client,
            store,
            cache,
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn RoutingStore> {
        self.store.clone()
    }

    pub fn cache(&self) -> Arc<RoutingCache> {
        self.cache.clone()
    }

    pub fn node_client(&self) -> Arc<dyn NodeClient> {
        self.client.clone()
    }

    pub fn session(&self, request: ReshardRequest) -> ReshardSession {
        ReshardSession::new(
            self.client.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.config.clone(),
            request,
        )
    }

    /// Run one full session to completion.
    pub async fn reshard(&self, request: ReshardRequest) -> ReshardOutcome {
        self.session(request).run().await
    }
}

/// Renews the distributed lock in the background; `alive` flips to
/// false the moment a renewal fails.
struct LeaseRenewer {
    alive: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl LeaseRenewer {
    fn spawn(store: Arc<dyn RoutingStore>, lease: Lease) -> Self {
        let (tx, rx) = watch::channel(true);
        let interval = lease.ttl / 3;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = store.renew_lock(&lease).await {
                    tracing::warn!(ns = %lease.ns, error = %err, "lease renewal failed");
                    let _ = tx.send(false);
                    break;
                }
            }
        });
        Self { alive: rx, handle }
    }

    fn alive(&self) -> bool {
        *self.alive.borrow()
    }
}

impl Drop for LeaseRenewer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn bounded<F>(timeout: Duration, stage: Stage, fut: F) -> ControlResult<()>
where
    F: std::future::Future<Output = ControlResult<()>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ControlError::Timeout(format!("stage {stage}"))),
    }
}

fn validate_ns(ns: &str) -> ControlResult<()> {
    if ns.is_empty() {
        return Err(ControlError::validation("no ns"));
    }
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {}
        _ => return Err(ControlError::validation(format!("bad ns [{ns}]"))),
    }
    if ns.contains(".system.") {
        return Err(ControlError::validation("can't reshard system namespaces"));
    }
    Ok(())
}

/// Where one group's oplog capture starts: the leader whose oplog was
/// fenced at SNAPSHOT, and the fence itself. The same node is tailed
/// later so frontier and entries come from one optime timeline.
#[derive(Debug, Clone)]
struct SnapshotPoint {
    leader: Endpoint,
    frontier: OpTime,
}

/// State and logic of one in-flight resharding session.
pub struct ReshardSession {
    client: Arc<dyn NodeClient>,
    store: Arc<dyn RoutingStore>,
    cache: Arc<RoutingCache>,
    config: CoordinatorConfig,
    request: ReshardRequest,
    holder: String,

    stage: Stage,
    groups: Vec<GroupClient>,
    old_key: Option<KeyPattern>,
    new_key: Option<KeyPattern>,
    num_chunks: usize,
    pre_version: ChunkVersion,
    frontier: Vec<SnapshotPoint>,
    detached: Vec<DetachedReplica>,
    assignment: Option<Assignment>,
    lease: Option<Lease>,
    renewer: Option<LeaseRenewer>,
    new_table: Option<RoutingTable>,
    routing_version: Option<ChunkVersion>,
    failed_chunks: Vec<FailedChunk>,
    rejoin_errors: Vec<String>,
    replayed: u64,
    replay_failures: Vec<String>,
    error: Option<ControlError>,
}

impl ReshardSession {
    fn new(
        client: Arc<dyn NodeClient>,
        store: Arc<dyn RoutingStore>,
        cache: Arc<RoutingCache>,
        config: CoordinatorConfig,
        request: ReshardRequest,
    ) -> Self {
        let holder = format!(
            "quill-control:{}:{:08x}",
            std::process::id(),
            rand::random::<u32>()
        );
        Self {
            client,
            store,
            cache,
            config,
            request,
            holder,
            stage: Stage::Init,
            groups: Vec::new(),
            old_key: None,
            new_key: None,
            num_chunks: 0,
            pre_version: ChunkVersion::default(),
            frontier: Vec::new(),
            detached: Vec::new(),
            assignment: None,
            lease: None,
            renewer: None,
            new_table: None,
            routing_version: None,
            failed_chunks: Vec::new(),
            rejoin_errors: Vec::new(),
            replayed: 0,
            replay_failures: Vec::new(),
            error: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn detached_endpoints(&self) -> Vec<Endpoint> {
        self.detached.iter().map(|d| d.endpoint.clone()).collect()
    }

    /// Execute the current stage and advance. On failure the session
    /// transitions to ABORT; the next step runs the abort path.
    pub async fn step(&mut self) -> ControlResult<Stage> {
        let stage = self.stage;
        let timeout = self.config.stage_timeout;
        tracing::debug!(ns = %self.request.ns, %stage, "resharding stage");

        let result: ControlResult<()> = match stage {
            Stage::Init => Ok(()),
            Stage::Validate => bounded(timeout, stage, self.run_validate()).await,
            Stage::Lock => bounded(timeout, stage, self.run_lock()).await,
            Stage::Snapshot => bounded(timeout, stage, self.run_snapshot()).await,
            Stage::Detach => bounded(timeout, stage, self.run_detach()).await,
            Stage::Sample => bounded(timeout, stage, self.run_sample()).await,
            Stage::Migrate => bounded(timeout, stage, self.run_migrate()).await,
            Stage::Commit => bounded(timeout, stage, self.run_commit()).await,
            Stage::Rejoin => bounded(timeout, stage, self.run_rejoin()).await,
            Stage::Replay => bounded(timeout, stage, self.run_replay()).await,
            Stage::Abort => {
                self.run_abort().await;
                self.stage = Stage::Failed;
                return Ok(self.stage);
            }
            Stage::Done | Stage::Failed => return Ok(stage),
        };

        match result {
            Ok(()) => {
                self.stage = stage.next();
                if self.stage == Stage::Done {
                    self.finish().await;
                }
                Ok(self.stage)
            }
            Err(err) => {
                tracing::error!(ns = %self.request.ns, %stage, error = %err,
                    "resharding stage failed");
                self.error = Some(err.clone());
                self.stage = Stage::Abort;
                Err(err)
            }
        }
    }

    /// Drive the session to a terminal state.
    pub async fn run(mut self) -> ReshardOutcome {
        loop {
            match self.stage {
                Stage::Done | Stage::Failed => break,
                _ => {
                    let _ = self.step().await;
                }
            }
        }
        self.into_outcome()
    }

    fn into_outcome(self) -> ReshardOutcome {
        ReshardOutcome {
            ok: self.stage == Stage::Done,
            errmsg: self.error.map(|e| e.to_string()),
            routing_version: self.routing_version,
            failed_chunks: self.failed_chunks,
            rejoin_errors: self.rejoin_errors,
            replayed: self.replayed,
            replay_failures: self.replay_failures,
        }
    }

    fn new_key(&self) -> &KeyPattern {
        self.new_key.as_ref().expect("set during validate")
    }

    async fn run_validate(&mut self) -> ControlResult<()> {
        let ns = self.request.ns.clone();
        validate_ns(&ns)?;

        let entry = self
            .store
            .collection(&ns)
            .await?
            .ok_or_else(|| ControlError::validation(format!("{ns} is not sharded")))?;
        if entry.capped {
            return Err(ControlError::validation("can't reshard capped collection"));
        }
        let table = self
            .store
            .read_table(&ns)
            .await?
            .ok_or_else(|| ControlError::validation(format!("{ns} is not sharded")))?;

        let proposed = KeyPattern::parse(&self.request.key)?;
        if self.request.unique && proposed.is_hashed() {
            return Err(ControlError::validation(
                "hashed shard keys cannot be declared unique",
            ));
        }
        if proposed.same_pattern(&table.key) {
            return Err(ControlError::validation("shard key already in use"));
        }
        if proposed.is_hashed() {
            return Err(ControlError::UnsupportedKey(
                "hashed keys have no numeric domain estimate".to_string(),
            ));
        }

        let groups = self.store.list_groups().await?;
        if groups.is_empty() {
            return Err(ControlError::validation("cluster has no shard groups"));
        }
        self.groups = groups
            .into_iter()
            .map(|g| GroupClient::new(self.client.clone(), g.name, g.seeds))
            .collect();

        // Index preconditions, checked at the primary group's leader as
        // an initial shard-key assignment would.
        let primary_leader = self.groups[0].leader().await?.leader;
        let indexes = self.client.list_indexes(&primary_leader, &ns).await?;
        for index in indexes.iter().filter(|i| i.unique) {
            if !keys::unique_index_compatible(&proposed, &index.key) {
                return Err(ControlError::validation(format!(
                    "can't reshard collection {ns} with unique index on {:?} and proposed \
                     shard key {:?}: uniqueness can't be maintained unless shard key is a prefix",
                    index.key.to_document(),
                    proposed.to_document(),
                )));
            }
        }
        let mut useful = keys::has_useful_index(&proposed, &indexes);
        if useful && self.request.unique {
            match indexes.iter().find(|i| i.key.same_pattern(&proposed)) {
                Some(exact) if exact.unique || exact.key.first_field() == "_id" => {}
                Some(_) => {
                    return Err(ControlError::validation(format!(
                        "can't reshard collection {ns}: index not unique, and unique index \
                         explicitly specified"
                    )));
                }
                // No exact match: not useful yet, but one can be built.
                None => useful = false,
            }
        }
        if !useful {
            let mut total = 0u64;
            for group in &self.groups {
                let leader = group.leader().await?.leader;
                total += self.client.collection_count(&leader, &ns).await?;
            }
            if total != 0 {
                return Err(ControlError::validation(
                    "please create an index that starts with the shard key before resharding",
                ));
            }
            self.client
                .ensure_index(&primary_leader, &ns, &proposed, self.request.unique)
                .await?;
        }

        let num_chunks = match self.request.num_initial_chunks {
            Some(n) if n >= 1 => n as usize,
            Some(_) => {
                return Err(ControlError::validation("numInitialChunks must be >= 1"));
            }
            None => table.chunks.len(),
        };

        self.pre_version = table.version();
        self.num_chunks = num_chunks;
        self.old_key = Some(table.key);
        self.new_key = Some(proposed);
        tracing::info!(ns = %self.request.ns, num_chunks, groups = self.groups.len(),
            pre_version = %self.pre_version, "resharding validated");
        Ok(())
    }

    async fn run_lock(&mut self) -> ControlResult<()> {
        let lease = self
            .store
            .acquire_lock(
                &self.request.ns,
                "reShardCollection",
                &self.holder,
                self.config.lock_ttl,
            )
            .await?;
        self.renewer = Some(LeaseRenewer::spawn(self.store.clone(), lease.clone()));
        self.lease = Some(lease);
        Ok(())
    }

    async fn run_snapshot(&mut self) -> ControlResult<()> {
        let tailer = OplogTailer::new(self.client.clone());
        let attempts = self.config.retry_attempts;
        let backoff = self.config.retry_backoff;

        let probes = self.groups.iter().map(|group| {
            let tailer = &tailer;
            async move {
                with_retry("snapshot frontier", attempts, backoff, || {
                    let tailer = tailer;
                    let group = group;
                    async move {
                        let leader = group.leader().await?.leader;
                        let frontier = tailer.snapshot_frontier(&leader).await?;
                        Ok(SnapshotPoint { leader, frontier })
                    }
                })
                .await
            }
        });
        self.frontier = join_all(probes)
            .await
            .into_iter()
            .collect::<ControlResult<Vec<_>>>()?;
        tracing::info!(ns = %self.request.ns, frontier = ?self.frontier,
            "oplog frontier snapshotted");
        Ok(())
    }

    async fn run_detach(&mut self) -> ControlResult<()> {
        let manager = DetachManager::new(self.client.clone());
        let detaches = self.groups.iter().map(|group| {
            let manager = &manager;
            async move { manager.detach(group).await }
        });

        let mut first_err = None;
        for result in join_all(detaches).await {
            match result {
                Ok(replica) => self.detached.push(replica),
                Err(err) if first_err.is_none() => first_err = Some(err),
                Err(_) => {}
            }
        }
        match first_err {
            // Abort will rejoin whatever did detach.
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_sample(&mut self) -> ControlResult<()> {
        let endpoints = self.detached_endpoints();
        let old_key = self.old_key.clone().expect("set during validate");
        let samples = scan_detached(
            self.client.clone(),
            &self.request.ns,
            &endpoints,
            &old_key,
            self.new_key(),
        )
        .await?;
        let assignment = build_assignment(&samples, self.new_key(), self.num_chunks)?;
        debug_assert!(assignment.owners.iter().all(|o| *o < self.groups.len()));
        tracing::info!(ns = %self.request.ns, range_per_chunk = assignment.range_per_chunk,
            owners = ?assignment.owners, "chunk assignment computed");
        self.assignment = Some(assignment);
        Ok(())
    }

    async fn run_migrate(&mut self) -> ControlResult<()> {
        let assignment = self.assignment.as_ref().expect("set during sample");
        let engine = MigrationEngine::new(
            self.client.clone(),
            MigrationConfig {
                max_chunk_bytes: self.config.max_chunk_bytes,
                secondary_throttle: self.config.secondary_throttle,
                config_addr: self.config.config_addr.clone(),
            },
        );
        let report = engine
            .migrate(
                &self.request.ns,
                self.new_key().first_field(),
                assignment,
                &self.detached_endpoints(),
            )
            .await;
        self.failed_chunks = report.failed;
        Ok(())
    }

    async fn run_commit(&mut self) -> ControlResult<()> {
        let ns = self.request.ns.clone();
        let assignment = self.assignment.clone().expect("set during sample");
        let lease = self
            .lease
            .clone()
            .ok_or_else(|| ControlError::LeaseLost(format!("{ns}: no lease held")))?;

        let epoch = new_epoch();
        let ranges = chunk_ranges(
            self.new_key().first_field(),
            assignment.range_per_chunk,
            assignment.num_chunks,
        );
        let specs: Vec<ChunkSpec> = ranges
            .iter()
            .zip(&assignment.owners)
            .map(|(range, owner)| ChunkSpec {
                min: range.min,
                max: range.max,
                shard: self.groups[*owner].name().to_string(),
            })
            .collect();

        let renewal_alive = self.renewer.as_ref().map(LeaseRenewer::alive).unwrap_or(false);
        let new_key = self.new_key().clone();
        let swap = if renewal_alive {
            self.store
                .swap_chunks(&ns, &new_key, &epoch, specs, &lease)
                .await
        } else {
            Err(ControlError::LeaseLost(format!(
                "{ns}: lease renewal failed before commit"
            )))
        };

        let version = match swap {
            Ok(version) => version,
            Err(ControlError::LeaseLost(reason)) => {
                // The swap may or may not have applied; routing decides.
                let current = self.store.read_table(&ns).await?;
                match current {
                    Some(table) if table.version().epoch == epoch => {
                        tracing::warn!(ns = %ns,
                            "lease lost at commit but swap applied; rolling forward");
                        table.version()
                    }
                    _ => return Err(ControlError::LeaseLost(reason)),
                }
            }
            Err(err) => return Err(err),
        };

        // Post-commit invariants: partition intact, epoch changed,
        // version strictly increased.
        let table = self.store.read_table(&ns).await?.ok_or_else(|| {
            ControlError::RoutingInconsistent {
                ns: ns.clone(),
                detail: "chunk table missing after swap".to_string(),
            }
        })?;
        if let Err(detail) = table.verify() {
            return Err(ControlError::RoutingInconsistent { ns, detail });
        }
        let committed = table.version();
        if committed.epoch == self.pre_version.epoch {
            return Err(ControlError::RoutingInconsistent {
                ns,
                detail: "epoch did not change across commit".to_string(),
            });
        }
        if (committed.major, committed.minor) <= (self.pre_version.major, self.pre_version.minor) {
            return Err(ControlError::RoutingInconsistent {
                ns,
                detail: format!(
                    "routing version went from {} to {}",
                    self.pre_version, committed
                ),
            });
        }

        self.cache.invalidate(&ns);
        tracing::info!(ns = %self.request.ns, version = %version, "routing metadata swapped");
        self.new_table = Some(table);
        self.routing_version = Some(version);
        Ok(())
    }

    async fn run_rejoin(&mut self) -> ControlResult<()> {
        let manager = DetachManager::with_retries(
            self.client.clone(),
            self.config.retry_attempts,
            self.config.retry_backoff,
        );
        let errors = manager.rejoin_all(&self.groups, &self.detached).await;
        self.rejoin_errors = errors
            .into_iter()
            .map(|(group, err)| format!("{group}: {err}"))
            .collect();
        Ok(())
    }

    async fn run_replay(&mut self) -> ControlResult<()> {
        let tailer = OplogTailer::new(self.client.clone());
        let attempts = self.config.retry_attempts;
        let backoff = self.config.retry_backoff;

        let mut captures: Vec<Vec<OplogEntry>> = Vec::with_capacity(self.groups.len());
        let tailer_ref = &tailer;
        // Capture from the node whose oplog was fenced at SNAPSHOT; the
        // rejoined replica's oplog is missing the in-procedure writes.
        for point in &self.frontier {
            let entries = with_retry("capture oplog", attempts, backoff, || {
                let tailer = tailer_ref;
                let point = point;
                async move {
                    let tail = tailer.tail_from(&point.leader, point.frontier).await?;
                    tail.collect().await
                }
            })
            .await?;
            captures.push(entries);
        }

        let table = self.new_table.as_ref().expect("set during commit");
        let replayer = OplogReplayer::new(self.client.clone());
        let stats = replayer.replay(table, &self.groups, &captures).await?;
        self.replayed = stats.applied;
        self.replay_failures = stats.failed;
        Ok(())
    }

    /// Entering DONE: drop the renewer, release the lock, refresh
    /// routing caches.
    async fn finish(&mut self) {
        self.renewer = None;
        if let Some(lease) = self.lease.take() {
            if let Err(err) = self.store.release_lock(&lease).await {
                tracing::warn!(ns = %self.request.ns, error = %err, "lock release failed");
            }
        }
        self.cache.invalidate(&self.request.ns);
        tracing::info!(ns = %self.request.ns, "resharding complete");
    }

    /// Abort path: return loaned replicas, leave routing untouched,
    /// release the lock.
    async fn run_abort(&mut self) {
        tracing::warn!(ns = %self.request.ns, error = ?self.error, "aborting resharding session");
        if !self.detached.is_empty() {
            let manager = DetachManager::with_retries(
                self.client.clone(),
                self.config.retry_attempts,
                self.config.retry_backoff,
            );
            let errors = manager.rejoin_all(&self.groups, &self.detached).await;
            self.rejoin_errors.extend(
                errors
                    .into_iter()
                    .map(|(group, err)| format!("{group}: {err}")),
            );
        }
        self.renewer = None;
        if let Some(lease) = self.lease.take() {
            if let Err(err) = self.store.release_lock(&lease).await {
                tracing::warn!(ns = %self.request.ns, error = %err,
                    "lock release failed during abort");
            }
        }
    }
}
