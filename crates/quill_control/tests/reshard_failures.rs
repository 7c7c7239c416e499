//! Failure paths: unreachable detach candidates abort cleanly, and
//! transient election churn is retried through the budget.

mod common;

use common::{as_set, group_members, reshard_request, two_group_spec, TestHarness, NS};
use quill_control::client::NodeClient;
use quill_control::coordinator::Stage;
use quill_control::error::ControlError;
use quill_control::routing::RoutingStore;
use quill_control::sim::{ChunkBoundSpec, ClusterSpec, CollectionSpec, GroupSpec, IndexSpecFixture};
use serde_json::json;

/// Two 2-member groups: exactly one detachable follower each.
fn minimal_spec() -> ClusterSpec {
    ClusterSpec {
        groups: vec![
            GroupSpec {
                name: "g0".to_string(),
                members: group_members("g0", 2),
                docs: (0..10).map(|a| json!({"_id": a, "a": a, "b": a % 10})).collect(),
            },
            GroupSpec {
                name: "g1".to_string(),
                members: group_members("g1", 2),
                docs: (10..20).map(|a| json!({"_id": a, "a": a, "b": a % 10})).collect(),
            },
        ],
        collection: CollectionSpec {
            ns: NS.to_string(),
            key: json!({"a": 1}),
            unique: false,
            capped: false,
            chunks: vec![
                ChunkBoundSpec { min: None, max: Some(10), shard: "g0".to_string() },
                ChunkBoundSpec { min: Some(10), max: None, shard: "g1".to_string() },
            ],
            indexes: vec![IndexSpecFixture {
                key: json!({"b": 1}),
                unique: false,
                sparse: false,
            }],
        },
    }
}

#[tokio::test]
async fn unreachable_detach_candidate_aborts_and_returns_replicas() {
    let spec = minimal_spec();
    let h = TestHarness::new("fail-detach", &spec).await;
    let pre_epoch = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table")
        .version()
        .epoch;

    // g1's only follower cannot be reached; its detach must fail and
    // the session must return g0's already-loaned replica.
    h.cluster
        .set_unreachable(&"g1-n1:27017".to_string(), true);

    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(!outcome.ok);

    assert_eq!(
        as_set(h.cluster.members_of("g0")),
        as_set(group_members("g0", 2))
    );
    assert_eq!(
        as_set(h.cluster.members_of("g1")),
        as_set(group_members("g1", 2))
    );

    // Routing never changed.
    let table = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table");
    assert_eq!(table.version().epoch, pre_epoch);
}

#[tokio::test]
async fn retry_later_during_rejoin_is_absorbed_by_the_budget() {
    let spec = two_group_spec();
    let h = TestHarness::new("fail-retry-later", &spec).await;

    // The detach candidate is the first follower; its first leadership
    // request after rejoin fails with RetryLater.
    let candidate = "g0-n1:27017".to_string();
    h.cluster.inject_retry_later(&candidate, 1);

    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(outcome.ok, "reshard failed: {:?}", outcome.errmsg);
    assert!(outcome.rejoin_errors.is_empty(), "{:?}", outcome.rejoin_errors);

    // The rejoined replica ended up leading its group.
    assert_eq!(h.cluster.leader_of("g0"), Some(candidate));
}

#[tokio::test]
async fn detached_replicas_reject_direct_writes() {
    let spec = two_group_spec();
    let h = TestHarness::new("fail-detached-write", &spec).await;
    let mut session = h.coordinator.session(reshard_request(json!({"b": 1})));

    // Run through DETACH so one replica per group is on loan.
    loop {
        let stage = session.step().await.expect("stage");
        if stage == Stage::Sample {
            break;
        }
    }
    let detached = session.detached_endpoints();
    assert!(!detached.is_empty());

    // A frozen replica takes no client writes; only moveData may touch it.
    let rejected = h
        .cluster
        .insert(&detached[0], NS, json!({"_id": 999, "a": 999, "b": 9}))
        .await;
    assert!(matches!(rejected, Err(ControlError::NotLeader(_))), "{rejected:?}");

    let outcome = session.run().await;
    assert!(outcome.ok, "reshard failed: {:?}", outcome.errmsg);

    // The rejected document never surfaced anywhere.
    for group in ["g0", "g1"] {
        let leader = h.cluster.leader_of(group).expect("leader");
        let docs = h.cluster.docs_on(&leader, NS);
        assert!(!docs.iter().any(|d| d["_id"] == json!(999)));
    }
}

#[tokio::test]
async fn capped_collections_refuse_resharding() {
    let mut spec = minimal_spec();
    spec.collection.capped = true;
    let h = TestHarness::new("fail-capped", &spec).await;

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
            .contains("capped"),
        "{:?}",
        outcome.errmsg
    );
}
