//! Oplog records and the capture tailer.
//!
//! The tailer snapshots a frontier optime before any replica is
//! detached, then later pulls every entry at or after that frontier up
//! to the tip observed when tailing begins. Entries are never silently
//! skipped: a start point that has been truncated away fails the
//! session with `OplogTruncated`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::NodeClient;
use crate::error::{ControlError, ControlResult};
use crate::{Document, Endpoint};

/// Monotone `(seconds, counter)` pair, totally ordered within one
/// group's oplog.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    pub secs: u64,
    pub counter: u32,
}

impl OpTime {
    pub const ZERO: OpTime = OpTime { secs: 0, counter: 0 };

    pub fn new(secs: u64, counter: u32) -> Self {
        Self { secs, counter }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// The smallest optime strictly after this one.
    pub fn next(self) -> Self {
        Self {
            secs: self.secs,
            counter: self.counter + 1,
        }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.secs, self.counter)
    }
}

/// Kind of a replicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Noop,
    Command,
}

impl OpKind {
    /// Only inserts, updates, and deletes are re-applied by replay.
    pub fn is_replayable(self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update | OpKind::Delete)
    }
}

/// One replicated oplog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: OpTime,
    pub op: OpKind,
    pub ns: String,
    /// Inserted document, update document, or delete selector.
    pub payload: Document,
    /// Query selector for updates (and deletes issued with one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Document>,
    /// Upsert flag for updates, just-one flag for deletes.
    #[serde(default)]
    pub flag: bool,
}

/// One page of an oplog read, oldest entry first.
#[derive(Debug, Clone)]
pub struct OplogPage {
    pub entries: Vec<OplogEntry>,
    /// Entries strictly before this optime have been discarded by
    /// truncation. Zero when nothing was ever truncated.
    pub truncated_before: OpTime,
}

/// Capture-side access to per-group oplogs.
pub struct OplogTailer {
    client: Arc<dyn NodeClient>,
    page_size: usize,
}

impl OplogTailer {
    pub fn new(client: Arc<dyn NodeClient>) -> Self {
        Self {
            client,
            page_size: 512,
        }
    }

    /// Most recent optime in the leader's oplog; the start fence for
    /// later capture.
    pub async fn snapshot_frontier(&self, leader: &Endpoint) -> ControlResult<OpTime> {
        self.client.oplog_head(leader).await
    }

    /// Begin a finite tail of entries with `ts >= since`, bounded by
    /// the tip observed now. The tail is lazy and non-restartable.
    pub async fn tail_from(&self, leader: &Endpoint, since: OpTime) -> ControlResult<OplogTail> {
        let fence = self.client.oplog_head(leader).await?;
        Ok(OplogTail {
            client: self.client.clone(),
            endpoint: leader.clone(),
            fence,
            cursor: since,
            start: since,
            buffer: VecDeque::new(),
            first_page: true,
            done: false,
            page_size: self.page_size,
        })
    }
}

/// A lazy, consuming sequence of oplog entries in per-group order.
pub struct OplogTail {
    client: Arc<dyn NodeClient>,
    endpoint: Endpoint,
    fence: OpTime,
    cursor: OpTime,
    start: OpTime,
    buffer: VecDeque<OplogEntry>,
    first_page: bool,
    done: bool,
    page_size: usize,
}

impl OplogTail {
    pub async fn next(&mut self) -> ControlResult<Option<OplogEntry>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                if entry.ts > self.fence {
                    self.done = true;
                    self.buffer.clear();
                    return Ok(None);
                }
                self.cursor = entry.ts.next();
                return Ok(Some(entry));
            }
            if self.done {
                return Ok(None);
            }
            let page = self
                .client
                .read_oplog(&self.endpoint, self.cursor, self.page_size)
                .await?;
            if self.first_page {
                self.first_page = false;
                if self.start < page.truncated_before {
                    return Err(ControlError::OplogTruncated {
                        endpoint: self.endpoint.clone(),
                        requested: self.start,
                        oldest: page.truncated_before,
                    });
                }
            }
            if page.entries.len() < self.page_size {
                self.done = true;
            }
            if page.entries.is_empty() {
                return Ok(None);
            }
            self.buffer.extend(page.entries);
        }
    }

    /// Drain the remaining entries. Consumes the tail.
    pub async fn collect(mut self) -> ControlResult<Vec<OplogEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }
}
