//! Chunk migration across detached replicas.
//!
//! For each chunk of the new key domain, every non-owning detached
//! replica ships its matching documents to the owner via `moveData`
//! addressed to the destination. Chunks migrate in index order; moves
//! within one chunk fan out concurrently (each `(source, dest)` pair
//! occurs at most once per chunk, and chunks are processed one at a
//! time, so per-pair ordering holds). A failed chunk is recorded and
//! the remaining chunks continue.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::client::{MoveDataRequest, NodeClient};
use crate::error::ControlResult;
use crate::routing::{chunk_ranges, KeyRange};
use crate::sample::Assignment;
use crate::{Document, Endpoint};

/// One chunk whose migration failed, surfaced in the session payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedChunk {
    pub index: usize,
    pub range: String,
    pub error: String,
}

/// Outcome of the migration stage.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub moved_documents: u64,
    pub failed: Vec<FailedChunk>,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Per-chunk transfer guard handed to `moveData`.
    pub max_chunk_bytes: u64,
    pub secondary_throttle: bool,
    /// Config store address recorded in each request.
    pub config_addr: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 64 * 1024 * 1024,
            secondary_throttle: true,
            config_addr: String::new(),
        }
    }
}

pub struct MigrationEngine {
    client: Arc<dyn NodeClient>,
    config: MigrationConfig,
}

impl MigrationEngine {
    pub fn new(client: Arc<dyn NodeClient>, config: MigrationConfig) -> Self {
        Self { client, config }
    }

    /// Move every document of every chunk onto its assigned owner.
    pub async fn migrate(
        &self,
        ns: &str,
        new_key_field: &str,
        assignment: &Assignment,
        detached: &[Endpoint],
    ) -> MigrationReport {
        let ranges = chunk_ranges(new_key_field, assignment.range_per_chunk, assignment.num_chunks);
        let mut report = MigrationReport::default();

        for (index, range) in ranges.iter().enumerate() {
            let owner = assignment.owners[index];
            let dest = &detached[owner];

            let moves = detached.iter().enumerate().filter_map(|(group, source)| {
                if group == owner || assignment.counts[index][group] == 0 {
                    return None;
                }
                Some(self.move_one(ns, index, range, source, dest))
            });

            let mut errors = Vec::new();
            for result in join_all(moves).await {
                match result {
                    Ok(moved) => report.moved_documents += moved,
                    Err(err) => errors.push(err.to_string()),
                }
            }
            if !errors.is_empty() {
                tracing::warn!(ns, chunk = index, errors = ?errors, "chunk migration failed");
                report.failed.push(FailedChunk {
                    index,
                    range: range.to_string(),
                    error: errors.join("; "),
                });
            }
        }

        tracing::info!(ns, moved = report.moved_documents, failed = report.failed.len(),
            "chunk migration finished");
        report
    }

    async fn move_one(
        &self,
        ns: &str,
        index: usize,
        range: &KeyRange,
        source: &Endpoint,
        dest: &Endpoint,
    ) -> ControlResult<u64> {
        let request = MoveDataRequest {
            ns: ns.to_string(),
            from: source.clone(),
            range: range.clone(),
            max_bytes: self.config.max_chunk_bytes,
            chunk_id: format!("{ns}-{index}-from-{source}"),
            config_addr: self.config.config_addr.clone(),
            secondary_throttle: self.config.secondary_throttle,
        };
        tracing::debug!(ns, chunk = index, %source, %dest, range = %range,
            "moving chunk data");
        let response = self.client.move_data(dest, request).await?;
        Ok(response.moved)
    }
}

/// Rough transfer size of a document batch, for the per-chunk guard.
pub fn estimated_bytes(docs: &[Document]) -> u64 {
    docs.iter()
        .map(|d| serde_json::to_vec(d).map(|v| v.len() as u64).unwrap_or(0))
        .sum()
}
