//! Shared helpers for integration tests.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

use quill_control::coordinator::{CoordinatorConfig, ReshardCoordinator, ReshardRequest};
use quill_control::routing::{FileRoutingStore, RoutingCache};
use quill_control::sim::{
    ChunkBoundSpec, ClusterSpec, CollectionSpec, GroupSpec, IndexSpecFixture, SimCluster,
};
use quill_control::Document;

pub const NS: &str = "app.events";

/// Build a per-test data directory under the system temp dir.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    std::env::temp_dir()
        .join("quill-tests")
        .join(format!("{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

pub fn group_members(name: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{name}-n{i}:27017")).collect()
}

/// `count` documents with ascending `a` from `start` and `b = a mod 10`.
pub fn mod_ten_docs(start: i64, count: i64) -> Vec<Document> {
    (start..start + count)
        .map(|a| json!({"_id": a, "a": a, "b": a % 10}))
        .collect()
}

/// Two 3-member groups holding 100 documents sharded on `{a: 1}` with a
/// chunk split at `a = 50`, plus an index on `{b: 1}` so the new key
/// passes validation.
pub fn two_group_spec() -> ClusterSpec {
    ClusterSpec {
        groups: vec![
            GroupSpec {
                name: "g0".to_string(),
                members: group_members("g0", 3),
                docs: mod_ten_docs(0, 50),
            },
            GroupSpec {
                name: "g1".to_string(),
                members: group_members("g1", 3),
                docs: mod_ten_docs(50, 50),
            },
        ],
        collection: CollectionSpec {
            ns: NS.to_string(),
            key: json!({"a": 1}),
            unique: false,
            capped: false,
            chunks: vec![
                ChunkBoundSpec {
                    min: None,
                    max: Some(50),
                    shard: "g0".to_string(),
                },
                ChunkBoundSpec {
                    min: Some(50),
                    max: None,
                    shard: "g1".to_string(),
                },
            ],
            indexes: vec![IndexSpecFixture {
                key: json!({"b": 1}),
                unique: false,
                sparse: false,
            }],
        },
    }
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        stage_timeout: Duration::from_secs(10),
        retry_attempts: 3,
        retry_backoff: Duration::from_millis(10),
        lock_ttl: Duration::from_secs(5),
        ..CoordinatorConfig::default()
    }
}

pub fn reshard_request(key: Document) -> ReshardRequest {
    ReshardRequest {
        ns: NS.to_string(),
        key,
        unique: false,
        num_initial_chunks: None,
    }
}

pub fn as_set(hosts: Vec<String>) -> BTreeSet<String> {
    hosts.into_iter().collect()
}

/// One cluster plus its routing store and coordinator.
pub struct TestHarness {
    pub cluster: SimCluster,
    pub store: Arc<FileRoutingStore>,
    pub cache: Arc<RoutingCache>,
    pub coordinator: Arc<ReshardCoordinator>,
    pub dir: PathBuf,
}

impl TestHarness {
    pub async fn new(name: &str, spec: &ClusterSpec) -> Self {
        let dir = test_dir(name);
        let cluster = SimCluster::build(spec).expect("build cluster");
        let store = Arc::new(FileRoutingStore::open(&dir).expect("open store"));
        SimCluster::bootstrap_store(spec, store.as_ref())
            .await
            .expect("bootstrap store");
        let cache = Arc::new(RoutingCache::new());
        let coordinator = Arc::new(ReshardCoordinator::new(
            Arc::new(cluster.clone()),
            store.clone(),
            cache.clone(),
            test_config(),
        ));
        Self {
            cluster,
            store,
            cache,
            coordinator,
            dir,
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        cleanup_dir(&self.dir);
    }
}
