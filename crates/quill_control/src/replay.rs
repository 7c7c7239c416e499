//! Re-applying captured oplog entries through the new routing.
//!
//! Entries captured since each group's frontier are walked in per-group
//! order; each data operation is routed by the new key pattern and
//! applied at its now-correct owner's leader. Cross-group ordering is
//! not preserved. Replay is idempotent: duplicate-key inserts and
//! deletes of absent documents are no-ops, and updates match by key.

use std::sync::Arc;

use crate::client::{GroupClient, NodeClient};
use crate::error::{ControlError, ControlResult};
use crate::oplog::{OpKind, OplogEntry};
use crate::routing::RoutingTable;

/// What replay did, surfaced in the session payload.
#[derive(Debug, Default)]
pub struct ReplayStats {
    pub applied: u64,
    pub skipped: u64,
    /// Entries that could not be applied, with reasons. Never silently
    /// dropped.
    pub failed: Vec<String>,
}

pub struct OplogReplayer {
    client: Arc<dyn NodeClient>,
}

impl OplogReplayer {
    pub fn new(client: Arc<dyn NodeClient>) -> Self {
        Self { client }
    }

    /// Replay per-group captures through `table`, applying each entry
    /// at the owning group's current leader.
    pub async fn replay(
        &self,
        table: &RoutingTable,
        groups: &[GroupClient],
        captures: &[Vec<OplogEntry>],
    ) -> ControlResult<ReplayStats> {
        let mut stats = ReplayStats::default();
        for (source_group, entries) in captures.iter().enumerate() {
            for entry in entries {
                if !entry.op.is_replayable() {
                    stats.skipped += 1;
                    continue;
                }
                if entry.ns != table.ns {
                    stats.skipped += 1;
                    continue;
                }
                match self.apply(table, groups, entry).await {
                    Ok(()) => stats.applied += 1,
                    Err(err) => {
                        tracing::warn!(source_group, ts = %entry.ts, error = %err,
                            "replay entry failed");
                        stats.failed.push(format!(
                            "group {source_group} ts {}: {err}",
                            entry.ts
                        ));
                    }
                }
            }
        }
        tracing::info!(ns = %table.ns, applied = stats.applied, skipped = stats.skipped,
            failed = stats.failed.len(), "oplog replay finished");
        Ok(stats)
    }

    async fn apply(
        &self,
        table: &RoutingTable,
        groups: &[GroupClient],
        entry: &OplogEntry,
    ) -> ControlResult<()> {
        // Key fields come from the document for inserts and deletes,
        // and from the selector for updates.
        let key_doc = match entry.op {
            OpKind::Update => entry.selector.as_ref().ok_or_else(|| {
                ControlError::validation("update entry without a selector")
            })?,
            _ => &entry.payload,
        };
        let owner = table.owner_for_doc(key_doc)?;
        let group = groups
            .iter()
            .find(|g| g.name() == owner)
            .ok_or_else(|| ControlError::validation(format!("unknown owner group {owner}")))?;
        let leader = group.leader().await?.leader;

        match entry.op {
            OpKind::Insert => {
                self.client
                    .insert(&leader, &entry.ns, entry.payload.clone())
                    .await
            }
            OpKind::Update => {
                let selector = entry.selector.as_ref().expect("checked above");
                self.client
                    .update(&leader, &entry.ns, selector, entry.payload.clone(), entry.flag)
                    .await
            }
            OpKind::Delete => {
                let selector = entry.selector.as_ref().unwrap_or(&entry.payload);
                self.client
                    .delete(&leader, &entry.ns, selector, entry.flag)
                    .await
            }
            OpKind::Noop | OpKind::Command => Ok(()),
        }
    }
}
