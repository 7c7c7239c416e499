//! Assignment placement and the boundary shapes: clustered values,
//! single-group clusters, and empty collections.

mod common;

use common::{group_members, reshard_request, TestHarness, NS};
use quill_control::routing::{KeyBound, RoutingStore};
use quill_control::sim::{ChunkBoundSpec, ClusterSpec, CollectionSpec, GroupSpec, IndexSpecFixture};
use serde_json::json;

fn b_index() -> IndexSpecFixture {
    IndexSpecFixture {
        key: json!({"b": 1}),
        unique: false,
        sparse: false,
    }
}

fn doc(a: i64) -> serde_json::Value {
    json!({"_id": a, "a": a, "b": a % 10})
}

/// Three groups; 90% of the documents (over the whole new-key range)
/// sit on group 0.
fn clustered_spec() -> ClusterSpec {
    ClusterSpec {
        groups: vec![
            GroupSpec {
                name: "g0".to_string(),
                members: group_members("g0", 3),
                docs: (0..90).map(doc).collect(),
            },
            GroupSpec {
                name: "g1".to_string(),
                members: group_members("g1", 3),
                docs: (90..95).map(doc).collect(),
            },
            GroupSpec {
                name: "g2".to_string(),
                members: group_members("g2", 3),
                docs: (95..100).map(doc).collect(),
            },
        ],
        collection: CollectionSpec {
            ns: NS.to_string(),
            key: json!({"a": 1}),
            unique: false,
            capped: false,
            chunks: vec![
                ChunkBoundSpec { min: None, max: Some(90), shard: "g0".to_string() },
                ChunkBoundSpec { min: Some(90), max: Some(95), shard: "g1".to_string() },
                ChunkBoundSpec { min: Some(95), max: None, shard: "g2".to_string() },
            ],
            indexes: vec![b_index()],
        },
    }
}

#[tokio::test]
async fn clustered_values_keep_their_chunks_on_the_heavy_group() {
    let spec = clustered_spec();
    let h = TestHarness::new("assign-clustered", &spec).await;

    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(outcome.ok, "reshard failed: {:?}", outcome.errmsg);

    let table = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table");
    table.verify().expect("valid table");
    // Group 0 holds the plurality of every chunk's documents, so every
    // chunk lands there and only the minority's documents move.
    assert!(table.chunks.iter().all(|c| c.shard == "g0"));

    let leader = h.cluster.leader_of("g0").expect("leader");
    assert_eq!(h.cluster.docs_on(&leader, NS).len(), 100);
}

#[tokio::test]
async fn single_group_cluster_still_bumps_routing() {
    let spec = ClusterSpec {
        groups: vec![GroupSpec {
            name: "g0".to_string(),
            members: group_members("g0", 3),
            docs: (0..20).map(doc).collect(),
        }],
        collection: CollectionSpec {
            ns: NS.to_string(),
            key: json!({"a": 1}),
            unique: false,
            capped: false,
            chunks: vec![
                ChunkBoundSpec { min: None, max: Some(10), shard: "g0".to_string() },
                ChunkBoundSpec { min: Some(10), max: None, shard: "g0".to_string() },
            ],
            indexes: vec![b_index()],
        },
    };
    let h = TestHarness::new("assign-single-group", &spec).await;
    let pre_version = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table")
        .version();

    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(outcome.ok, "reshard failed: {:?}", outcome.errmsg);

    let table = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table");
    table.verify().expect("valid table");
    assert!(table.chunks.iter().all(|c| c.shard == "g0"));
    assert_ne!(table.version().epoch, pre_version.epoch);
    assert!(table.version().major > pre_version.major);

    // No data moved anywhere.
    let leader = h.cluster.leader_of("g0").expect("leader");
    assert_eq!(h.cluster.docs_on(&leader, NS).len(), 20);
}

#[tokio::test]
async fn empty_collection_commits_empty_ranges_covering_everything() {
    let spec = ClusterSpec {
        groups: vec![
            GroupSpec {
                name: "g0".to_string(),
                members: group_members("g0", 3),
                docs: vec![],
            },
            GroupSpec {
                name: "g1".to_string(),
                members: group_members("g1", 3),
                docs: vec![],
            },
        ],
        collection: CollectionSpec {
            ns: NS.to_string(),
            key: json!({"a": 1}),
            unique: false,
            capped: false,
            chunks: vec![
                ChunkBoundSpec { min: None, max: Some(10), shard: "g0".to_string() },
                ChunkBoundSpec { min: Some(10), max: Some(20), shard: "g0".to_string() },
                ChunkBoundSpec { min: Some(20), max: Some(30), shard: "g1".to_string() },
                ChunkBoundSpec { min: Some(30), max: None, shard: "g1".to_string() },
            ],
            // No index on the new key: the empty collection gets one
            // created during validation.
            indexes: vec![],
        },
    };
    let h = TestHarness::new("assign-empty", &spec).await;
    let pre_epoch = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table")
        .version()
        .epoch;

    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(outcome.ok, "reshard failed: {:?}", outcome.errmsg);

    let table = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table");
    table.verify().expect("valid table");
    assert_eq!(table.chunks.len(), 4);
    assert_eq!(table.chunks[0].min, KeyBound::NegInf);
    assert_eq!(table.chunks[3].max, KeyBound::PosInf);
    assert_ne!(table.version().epoch, pre_epoch);
}
