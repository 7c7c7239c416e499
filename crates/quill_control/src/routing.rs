//! Routing metadata: chunk table, versions, config store, distributed lock.
//!
//! The config store owns the cluster-wide routing state: the group
//! directory, the collection catalog, and one chunk table per sharded
//! collection. Chunk tables are replaced wholesale by `swap_chunks`
//! under a TTL'd lease; the replacement is staged to a side file and
//! flipped with a single rename so no reader observes a partial table.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::keys::KeyPattern;
use crate::{Document, Endpoint};

/// One bound of a half-open chunk range over the numeric key domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyBound {
    NegInf,
    Value(i64),
    PosInf,
}

impl KeyBound {
    /// Whether `value` falls in `[min, max)`.
    pub fn in_range(value: f64, min: KeyBound, max: KeyBound) -> bool {
        let above = match min {
            KeyBound::NegInf => true,
            KeyBound::Value(b) => value >= b as f64,
            KeyBound::PosInf => false,
        };
        let below = match max {
            KeyBound::NegInf => false,
            KeyBound::Value(b) => value < b as f64,
            KeyBound::PosInf => true,
        };
        above && below
    }
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBound::NegInf => write!(f, "-inf"),
            KeyBound::Value(v) => write!(f, "{v}"),
            KeyBound::PosInf => write!(f, "+inf"),
        }
    }
}

/// A half-open range of one key field, `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub field: String,
    pub min: KeyBound,
    pub max: KeyBound,
}

impl KeyRange {
    pub fn contains(&self, value: f64) -> bool {
        KeyBound::in_range(value, self.min, self.max)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in [{}, {})", self.field, self.min, self.max)
    }
}

/// Partition the key domain into `num_chunks` ranges of width
/// `range_per_chunk`, anchored at zero, with infinite end caps.
pub fn chunk_ranges(field: &str, range_per_chunk: u64, num_chunks: usize) -> Vec<KeyRange> {
    let width = range_per_chunk.max(1) as i64;
    (0..num_chunks)
        .map(|i| {
            let min = if i == 0 {
                KeyBound::NegInf
            } else {
                KeyBound::Value(i as i64 * width)
            };
            let max = if i + 1 == num_chunks {
                KeyBound::PosInf
            } else {
                KeyBound::Value((i as i64 + 1) * width)
            };
            KeyRange {
                field: field.to_string(),
                min,
                max,
            }
        })
        .collect()
}

/// `(major, minor)` portion of a chunk's version.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkLastmod {
    pub major: u32,
    pub minor: u32,
}

/// Full routing version: epoch plus the highest `(major, minor)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: String,
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{} ({})", self.major, self.minor, self.epoch)
    }
}

/// Fresh opaque epoch id for a routing generation.
pub fn new_epoch() -> String {
    format!(
        "{:016x}{:08x}",
        rand::random::<u64>(),
        rand::random::<u32>()
    )
}

/// One persisted chunk record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub ns: String,
    pub min: KeyBound,
    pub max: KeyBound,
    pub shard: String,
    pub lastmod: ChunkLastmod,
    pub epoch: String,
}

/// Owner and bounds for one chunk of a swap, before versions are
/// assigned.
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub min: KeyBound,
    pub max: KeyBound,
    pub shard: String,
}

/// The routing table for one collection: its key pattern and the chunk
/// records partitioning the key space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    pub ns: String,
    pub key: KeyPattern,
    pub chunks: Vec<ChunkRecord>,
}

impl RoutingTable {
    /// Name of the group owning the chunk containing `value`.
    pub fn owner_for(&self, value: f64) -> Option<&str> {
        self.chunks
            .iter()
            .find(|c| KeyBound::in_range(value, c.min, c.max))
            .map(|c| c.shard.as_str())
    }

    /// Route a document by the table's key pattern.
    pub fn owner_for_doc(&self, doc: &Document) -> ControlResult<&str> {
        let value = self.key.first_value_numeric(doc)?;
        self.owner_for(value).ok_or_else(|| ControlError::RoutingInconsistent {
            ns: self.ns.clone(),
            detail: format!("no chunk contains {value}"),
        })
    }

    /// Collection routing version: the common epoch plus max lastmod.
    pub fn version(&self) -> ChunkVersion {
        let epoch = self
            .chunks
            .first()
            .map(|c| c.epoch.clone())
            .unwrap_or_default();
        let lastmod = self
            .chunks
            .iter()
            .map(|c| c.lastmod)
            .max()
            .unwrap_or_default();
        ChunkVersion {
            epoch,
            major: lastmod.major,
            minor: lastmod.minor,
        }
    }

    /// Check the table invariants: chunks cover `[-inf, +inf)` without
    /// gap or overlap, share one epoch, and carry unique lastmods.
    pub fn verify(&self) -> Result<(), String> {
        if self.chunks.is_empty() {
            return Err("empty chunk table".to_string());
        }
        let first = &self.chunks[0];
        if first.min != KeyBound::NegInf {
            return Err(format!("first chunk starts at {}", first.min));
        }
        let last = self.chunks.last().expect("non-empty");
        if last.max != KeyBound::PosInf {
            return Err(format!("last chunk ends at {}", last.max));
        }
        let mut lastmods = HashSet::new();
        for pair in self.chunks.windows(2) {
            if pair[0].max != pair[1].min {
                return Err(format!(
                    "gap or overlap between {} and {}",
                    pair[0].max, pair[1].min
                ));
            }
        }
        for chunk in &self.chunks {
            if chunk.min >= chunk.max {
                return Err(format!("empty range [{}, {})", chunk.min, chunk.max));
            }
            if chunk.epoch != first.epoch {
                return Err("mixed epochs in one chunk table".to_string());
            }
            if !lastmods.insert(chunk.lastmod) {
                return Err(format!(
                    "duplicate lastmod {}|{}",
                    chunk.lastmod.major, chunk.lastmod.minor
                ));
            }
        }
        Ok(())
    }
}

/// Catalog entry for one sharded collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub ns: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub capped: bool,
}

/// One shard group in the cluster directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    /// Initially known members, tried in order for leader discovery.
    pub seeds: Vec<Endpoint>,
}

/// A held distributed lock. The holder must renew before the TTL
/// elapses or lose the lock.
#[derive(Debug, Clone)]
pub struct Lease {
    pub ns: String,
    pub holder: String,
    pub token: u64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    key: String,
    holder: String,
    reason: String,
    token: u64,
    expires_at_ms: u64,
}

/// Cluster-wide routing store: group directory, collection catalog,
/// chunk tables, and the per-namespace distributed lock.
#[async_trait::async_trait]
pub trait RoutingStore: Send + Sync {
    async fn list_groups(&self) -> ControlResult<Vec<GroupEntry>>;
    async fn put_groups(&self, groups: Vec<GroupEntry>) -> ControlResult<()>;

    async fn collection(&self, ns: &str) -> ControlResult<Option<CollectionEntry>>;
    async fn put_collection(&self, entry: CollectionEntry) -> ControlResult<()>;

    async fn read_table(&self, ns: &str) -> ControlResult<Option<RoutingTable>>;
    async fn put_table(&self, table: RoutingTable) -> ControlResult<()>;
    async fn read_max_version(&self, ns: &str) -> ControlResult<ChunkVersion>;

    /// Atomically replace the chunk table for `ns`: all old records
    /// deleted, the new ones installed under `epoch` with
    /// `major = old.major + 1` and `minor` counting up from chunk 0.
    /// The lease is re-verified at commit time.
    async fn swap_chunks(
        &self,
        ns: &str,
        new_key: &KeyPattern,
        epoch: &str,
        chunks: Vec<ChunkSpec>,
        lease: &Lease,
    ) -> ControlResult<ChunkVersion>;

    async fn acquire_lock(
        &self,
        ns: &str,
        reason: &str,
        holder: &str,
        ttl: Duration,
    ) -> ControlResult<Lease>;
    async fn renew_lock(&self, lease: &Lease) -> ControlResult<()>;
    async fn release_lock(&self, lease: &Lease) -> ControlResult<()>;
    /// Operator escape hatch: drop a lock regardless of holder.
    async fn force_unlock(&self, ns: &str) -> ControlResult<()>;
}

/// Local cache of chunk tables, dropped on epoch change.
#[derive(Default)]
pub struct RoutingCache {
    tables: RwLock<HashMap<String, std::sync::Arc<RoutingTable>>>,
}

impl RoutingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-through lookup of the routing table for `ns`.
    pub async fn table(
        &self,
        store: &dyn RoutingStore,
        ns: &str,
    ) -> ControlResult<std::sync::Arc<RoutingTable>> {
        if let Some(table) = self.tables.read().expect("cache lock").get(ns) {
            return Ok(table.clone());
        }
        let table = store
            .read_table(ns)
            .await?
            .ok_or_else(|| ControlError::validation(format!("{ns} is not sharded")))?;
        let table = std::sync::Arc::new(table);
        self.tables
            .write()
            .expect("cache lock")
            .insert(ns.to_string(), table.clone());
        Ok(table)
    }

    pub fn invalidate(&self, ns: &str) {
        self.tables.write().expect("cache lock").remove(ns);
    }

    /// Teardown: drop every cached table.
    pub fn clear(&self) {
        self.tables.write().expect("cache lock").clear();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// File-backed routing store: one JSON file per concern under a data
/// directory, each replaced via staged write + rename.
pub struct FileRoutingStore {
    dir: PathBuf,
}

impl FileRoutingStore {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create routing store dir")?;
        Ok(Self { dir })
    }

    fn groups_path(&self) -> PathBuf {
        self.dir.join("groups.json")
    }

    fn collections_path(&self) -> PathBuf {
        self.dir.join("collections.json")
    }

    fn table_path(&self, ns: &str) -> PathBuf {
        self.dir.join(format!("table-{ns}.json"))
    }

    fn lock_path(&self, ns: &str) -> PathBuf {
        self.dir.join(format!("lock-{ns}.json"))
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> ControlResult<Option<T>> {
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(ControlError::io),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ControlError::io(err)),
        }
    }

    /// Stage to a side file, then flip with one atomic rename.
    fn write_json<T: Serialize>(path: &Path, value: &T) -> ControlResult<()> {
        let staged = path.with_extension("json.staged");
        let data = serde_json::to_vec_pretty(value).map_err(ControlError::io)?;
        fs::write(&staged, data).map_err(ControlError::io)?;
        fs::rename(&staged, path).map_err(ControlError::io)
    }

    fn read_lock(&self, ns: &str) -> ControlResult<Option<LockRecord>> {
        Self::read_json(&self.lock_path(ns))
    }

    fn check_lease(&self, lease: &Lease) -> ControlResult<LockRecord> {
        let record = self
            .read_lock(&lease.ns)?
            .ok_or_else(|| ControlError::LeaseLost(format!("{}: lock record gone", lease.ns)))?;
        if record.token != lease.token {
            return Err(ControlError::LeaseLost(format!(
                "{}: lock held by {}",
                lease.ns, record.holder
            )));
        }
        if record.expires_at_ms < now_ms() {
            return Err(ControlError::LeaseLost(format!(
                "{}: lease expired",
                lease.ns
            )));
        }
        Ok(record)
    }
}

#[async_trait::async_trait]
impl RoutingStore for FileRoutingStore {
    async fn list_groups(&self) -> ControlResult<Vec<GroupEntry>> {
        Ok(Self::read_json(&self.groups_path())?.unwrap_or_default())
    }

    async fn put_groups(&self, groups: Vec<GroupEntry>) -> ControlResult<()> {
        Self::write_json(&self.groups_path(), &groups)
    }

    async fn collection(&self, ns: &str) -> ControlResult<Option<CollectionEntry>> {
        let all: Vec<CollectionEntry> =
            Self::read_json(&self.collections_path())?.unwrap_or_default();
        Ok(all.into_iter().find(|c| c.ns == ns))
    }

    async fn put_collection(&self, entry: CollectionEntry) -> ControlResult<()> {
        let mut all: Vec<CollectionEntry> =
            Self::read_json(&self.collections_path())?.unwrap_or_default();
        all.retain(|c| c.ns != entry.ns);
        all.push(entry);
        Self::write_json(&self.collections_path(), &all)
    }

    async fn read_table(&self, ns: &str) -> ControlResult<Option<RoutingTable>> {
        Self::read_json(&self.table_path(ns))
    }

    async fn put_table(&self, table: RoutingTable) -> ControlResult<()> {
        Self::write_json(&self.table_path(&table.ns), &table)
    }

    async fn read_max_version(&self, ns: &str) -> ControlResult<ChunkVersion> {
        Ok(self
            .read_table(ns)
            .await?
            .map(|t| t.version())
            .unwrap_or_default())
    }

    async fn swap_chunks(
        &self,
        ns: &str,
        new_key: &KeyPattern,
        epoch: &str,
        chunks: Vec<ChunkSpec>,
        lease: &Lease,
    ) -> ControlResult<ChunkVersion> {
        self.check_lease(lease)?;

        let old_version = self.read_max_version(ns).await?;
        let mut records = Vec::with_capacity(chunks.len());
        for (i, spec) in chunks.into_iter().enumerate() {
            records.push(ChunkRecord {
                ns: ns.to_string(),
                min: spec.min,
                max: spec.max,
                shard: spec.shard,
                lastmod: ChunkLastmod {
                    major: old_version.major + 1,
                    minor: i as u32,
                },
                epoch: epoch.to_string(),
            });
        }
        let table = RoutingTable {
            ns: ns.to_string(),
            key: new_key.clone(),
            chunks: records,
        };
        if let Err(detail) = table.verify() {
            return Err(ControlError::RoutingInconsistent {
                ns: ns.to_string(),
                detail,
            });
        }

        // Re-verify the lease immediately before the flip.
        self.check_lease(lease)?;
        let version = table.version();
        self.put_table(table).await?;
        Ok(version)
    }

    async fn acquire_lock(
        &self,
        ns: &str,
        reason: &str,
        holder: &str,
        ttl: Duration,
    ) -> ControlResult<Lease> {
        if let Some(record) = self.read_lock(ns)? {
            if record.expires_at_ms >= now_ms() && record.holder != holder {
                return Err(ControlError::LockBusy(format!(
                    "{ns} locked by {} ({})",
                    record.holder, record.reason
                )));
            }
        }
        let token = rand::random::<u64>();
        let record = LockRecord {
            key: format!("{ns}-reShardCollection"),
            holder: holder.to_string(),
            reason: reason.to_string(),
            token,
            expires_at_ms: now_ms() + ttl.as_millis() as u64,
        };
        Self::write_json(&self.lock_path(ns), &record)?;
        Ok(Lease {
            ns: ns.to_string(),
            holder: holder.to_string(),
            token,
            ttl,
        })
    }

    async fn renew_lock(&self, lease: &Lease) -> ControlResult<()> {
        let mut record = self.check_lease(lease)?;
        record.expires_at_ms = now_ms() + lease.ttl.as_millis() as u64;
        Self::write_json(&self.lock_path(&lease.ns), &record)
    }

    async fn release_lock(&self, lease: &Lease) -> ControlResult<()> {
        match self.read_lock(&lease.ns)? {
            Some(record) if record.token == lease.token => {
                fs::remove_file(self.lock_path(&lease.ns)).map_err(ControlError::io)
            }
            // Lost or already released; nothing left to do.
            _ => Ok(()),
        }
    }

    async fn force_unlock(&self, ns: &str) -> ControlResult<()> {
        match fs::remove_file(self.lock_path(ns)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ControlError::io(err)),
        }
    }
}
