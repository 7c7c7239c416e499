//! Oplog capture and replay: in-flight writes land on their new
//! owners, replay is idempotent, and truncation is never skipped over.

mod common;

use common::{reshard_request, two_group_spec, TestHarness, NS};
use quill_control::command::{CommandContext, CommandRegistry};
use quill_control::coordinator::Stage;
use quill_control::oplog::OpTime;
use quill_control::routing::RoutingStore;
use serde_json::json;

#[tokio::test]
async fn concurrent_inserts_replay_to_their_new_owners() {
    let spec = two_group_spec();
    let h = TestHarness::new("replay-inserts", &spec).await;
    let mut session = h.coordinator.session(reshard_request(json!({"b": 1})));

    // Run through SAMPLE, stopping before MIGRATE/COMMIT.
    loop {
        let stage = session.step().await.expect("stage");
        if stage == Stage::Migrate {
            break;
        }
    }

    // Ten writes race the procedure, five per group leader. They miss
    // the detached replicas entirely.
    let extra_g0 = (100..105)
        .map(|a| json!({"_id": a, "a": a, "b": a % 10}))
        .collect();
    h.cluster.insert_many(NS, "g0", extra_g0).expect("insert g0");
    let extra_g1 = (105..110)
        .map(|a| json!({"_id": a, "a": a, "b": a % 10}))
        .collect();
    h.cluster.insert_many(NS, "g1", extra_g1).expect("insert g1");
    // Noops in the capture window are skipped, not applied.
    h.cluster.append_noop(NS, "g0").expect("noop");

    let outcome = session.run().await;
    assert!(outcome.ok, "reshard failed: {:?}", outcome.errmsg);
    assert!(outcome.replayed >= 10, "replayed {}", outcome.replayed);
    assert!(outcome.replay_failures.is_empty(), "{:?}", outcome.replay_failures);

    // Every raced insert is present and located under the new routing.
    let table = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table");
    for a in 100..110 {
        let b = a % 10;
        let owner = table.owner_for(b as f64).expect("owner").to_string();
        let leader = h.cluster.leader_of(&owner).expect("leader");
        let docs = h.cluster.docs_on(&leader, NS);
        assert!(
            docs.iter().any(|d| d["_id"] == json!(a)),
            "document {a} missing from {owner}"
        );
    }

    let total: usize = ["g0", "g1"]
        .iter()
        .map(|g| {
            let leader = h.cluster.leader_of(g).expect("leader");
            h.cluster.docs_on(&leader, NS).len()
        })
        .sum();
    assert_eq!(total, 110);
}

#[tokio::test]
async fn replaying_the_same_capture_again_changes_nothing() {
    let spec = two_group_spec();
    let h = TestHarness::new("replay-idempotent", &spec).await;

    // Writes that exist in the oplog before the session starts.
    let extra = (100..110)
        .map(|a| json!({"_id": a, "a": a, "b": a % 10}))
        .collect();
    h.cluster.insert_many(NS, "g0", extra).expect("insert");

    let outcome = h
        .coordinator
        .reshard(reshard_request(json!({"b": 1})))
        .await;
    assert!(outcome.ok, "reshard failed: {:?}", outcome.errmsg);

    let counts = |h: &TestHarness| -> Vec<usize> {
        ["g0", "g1"]
            .iter()
            .map(|g| {
                let leader = h.cluster.leader_of(g).expect("leader");
                h.cluster.docs_on(&leader, NS).len()
            })
            .collect()
    };
    let before = counts(&h);

    // Re-run replay over the full history through the operator command.
    let table = h
        .store
        .read_table(NS)
        .await
        .expect("read")
        .expect("table");
    let registry = CommandRegistry::standard();
    let ctx = CommandContext {
        coordinator: h.coordinator.clone(),
    };
    let payload = json!({ "replayOplog": {
        "ns": NS,
        "startTime": { "secs": 1, "counter": 0 },
        "proposedKey": { "b": 1 },
        "splitPoints": [],
        "numChunks": table.chunks.len(),
        "assignments": table.chunks.iter().map(|_| 0usize).collect::<Vec<_>>(),
        "removedReplicas": ["g0-n1:27017", "g1-n1:27017"],
    }});
    let result = registry.dispatch(&ctx, &payload).await;
    assert_eq!(result["ok"], 1, "replayOplog failed: {result}");

    // Duplicate-key inserts were no-ops: nothing changed.
    assert_eq!(counts(&h), before);
}

#[tokio::test]
async fn replay_oplog_command_validates_its_payload() {
    let spec = two_group_spec();
    let h = TestHarness::new("replay-validate", &spec).await;
    let registry = CommandRegistry::standard();
    let ctx = CommandContext {
        coordinator: h.coordinator.clone(),
    };

    // Assignment count disagrees with numChunks.
    let bad = json!({ "replayOplog": {
        "ns": NS,
        "startTime": { "secs": 1, "counter": 0 },
        "proposedKey": { "b": 1 },
        "splitPoints": [],
        "numChunks": 2,
        "assignments": [0],
        "removedReplicas": ["g0-n1:27017", "g1-n1:27017"],
    }});
    let result = registry.dispatch(&ctx, &bad).await;
    assert_eq!(result["ok"], 0, "{result}");
}

#[tokio::test]
async fn truncated_oplog_fails_the_session_loudly() {
    let spec = two_group_spec();
    let h = TestHarness::new("replay-truncated", &spec).await;

    // Put entries in the oplog so the frontier is non-zero.
    let extra = (100..110)
        .map(|a| json!({"_id": a, "a": a, "b": a % 10}))
        .collect();
    h.cluster.insert_many(NS, "g0", extra).expect("insert");

    let mut session = h.coordinator.session(reshard_request(json!({"b": 1})));
    loop {
        let stage = session.step().await.expect("stage");
        if stage == Stage::Replay {
            break;
        }
    }

    // The capture source loses its history before replay reads it.
    let snapshot_leader = "g0-n0:27017".to_string();
    h.cluster
        .truncate_oplog(&snapshot_leader, OpTime::new(1_000, 0));

    let outcome = session.run().await;
    assert!(!outcome.ok);
    assert!(
        outcome
            .errmsg
            .as_deref()
            .unwrap_or_default()
            .contains("oplog truncated"),
        "{:?}",
        outcome.errmsg
    );
}
