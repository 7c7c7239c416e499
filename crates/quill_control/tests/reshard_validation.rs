//! VALIDATE preconditions: key rules, index compatibility, and the
//! guarantee that a rejected request mutates nothing.

mod common;

use common::{
    as_set, group_members, mod_ten_docs, reshard_request, two_group_spec, TestHarness, NS,
};
use quill_control::routing::RoutingStore;
use quill_control::sim::{ChunkBoundSpec, ClusterSpec, CollectionSpec, GroupSpec, IndexSpecFixture};
use serde_json::json;

/// Three empty groups sharded on `{a: 1}` with six chunks.
fn three_group_empty_spec() -> ClusterSpec {
    ClusterSpec {
        groups: ["g0", "g1", "g2"]
            .iter()
            .map(|name| GroupSpec {
                name: name.to_string(),
                members: group_members(name, 3),
                docs: vec![],
            })
            .collect(),
        collection: CollectionSpec {
            ns: NS.to_string(),
            key: json!({"a": 1}),
            unique: false,
            capped: false,
            chunks: vec![
                ChunkBoundSpec { min: None, max: Some(10), shard: "g0".to_string() },
                ChunkBoundSpec { min: Some(10), max: Some(20), shard: "g0".to_string() },
                ChunkBoundSpec { min: Some(20), max: Some(30), shard: "g1".to_string() },
                ChunkBoundSpec { min: Some(30), max: Some(40), shard: "g1".to_string() },
                ChunkBoundSpec { min: Some(40), max: Some(50), shard: "g2".to_string() },
                ChunkBoundSpec { min: Some(50), max: None, shard: "g2".to_string() },
            ],
            indexes: vec![],
        },
    }
}

async fn assert_untouched(h: &TestHarness, pre_epoch: &str) {
    let table = h
        .store
        .read_table(NS)
        .await
        .expect("read table")
        .expect("table");
    assert_eq!(table.version().epoch, pre_epoch, "routing mutated");
    for group in ["g0", "g1"] {
        let members = h.cluster.members_of(group);
        if members.is_empty() {
            continue;
        }
        assert_eq!(
            as_set(members),
            as_set(group_members(group, 3)),
            "{group} membership mutated"
        );
    }
}

#[tokio::test]
async fn hashed_new_key_is_unsupported_and_mutates_nothing() {
    let spec = three_group_empty_spec();
    let h = TestHarness::new("validate-hashed", &spec).await;
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
        .reshard(reshard_request(json!({"a": "hashed"})))
        .await;
    assert!(!outcome.ok);
    let errmsg = outcome.errmsg.expect("errmsg");
    assert!(errmsg.contains("unsupported shard key"), "{errmsg}");
    assert_untouched(&h, &pre_epoch).await;
    for group in ["g0", "g1", "g2"] {
        assert_eq!(
            as_set(h.cluster.members_of(group)),
            as_set(group_members(group, 3))
        );
    }

    // Nothing was locked: a valid request right after succeeds.
    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(outcome.ok, "follow-up reshard failed: {:?}", outcome.errmsg);
}

#[tokio::test]
async fn same_key_is_rejected() {
    let spec = two_group_spec();
    let h = TestHarness::new("validate-same-key", &spec).await;
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
        .reshard(reshard_request(json!({"a": 1})))
        .await;
    assert!(!outcome.ok);
    assert!(
        outcome
            .errmsg
            .as_deref()
            .unwrap_or_default()
            .contains("shard key already in use"),
        "{:?}",
        outcome.errmsg
    );
    assert_untouched(&h, &pre_epoch).await;
}

#[tokio::test]
async fn unique_hashed_and_bad_namespaces_are_rejected() {
    let spec = two_group_spec();
    let h = TestHarness::new("validate-misc", &spec).await;

    let mut request = reshard_request(json!({"b": "hashed"}));
    request.unique = true;
    let outcome = h.coordinator.reshard(request).await;
    assert!(!outcome.ok);
    assert!(
        outcome
            .errmsg
            .as_deref()
            .unwrap_or_default()
            .contains("cannot be declared unique"),
        "{:?}",
        outcome.errmsg
    );

    let mut request = reshard_request(json!({"b": 1}));
    request.ns = "app.system.indexes".to_string();
    let outcome = h.coordinator.reshard(request).await;
    assert!(!outcome.ok);

    let mut request = reshard_request(json!({"b": 1}));
    request.ns = "app.missing".to_string();
    let outcome = h.coordinator.reshard(request).await;
    assert!(!outcome.ok);
    assert!(
        outcome
            .errmsg
            .as_deref()
            .unwrap_or_default()
            .contains("not sharded"),
        "{:?}",
        outcome.errmsg
    );
}

#[tokio::test]
async fn missing_useful_index_fails_when_collection_is_not_empty() {
    let mut spec = two_group_spec();
    // Drop the `{b: 1}` index: the proposed key has no useful index.
    spec.collection.indexes.clear();
    let h = TestHarness::new("validate-no-index", &spec).await;

    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(!outcome.ok);
    assert!(
        outcome
            .errmsg
            .as_deref()
            .unwrap_or_default()
            .contains("create an index"),
        "{:?}",
        outcome.errmsg
    );
}

#[tokio::test]
async fn incompatible_unique_index_is_rejected() {
    let mut spec = two_group_spec();
    spec.collection.indexes.push(IndexSpecFixture {
        key: json!({"c": 1}),
        unique: true,
        sparse: false,
    });
    // Keep some documents so the useful-index path is not short-cut.
    spec.groups[0].docs = mod_ten_docs(0, 10);
    let h = TestHarness::new("validate-unique-index", &spec).await;

    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(!outcome.ok);
    assert!(
        outcome
            .errmsg
            .as_deref()
            .unwrap_or_default()
            .contains("uniqueness"),
        "{:?}",
        outcome.errmsg
    );
}
