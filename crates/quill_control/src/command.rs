//! Admin command surface: an explicit registry populated at startup.
//!
//! Handlers are looked up by the payload field carrying the command
//! name, the way the wire protocol names commands. Nothing registers
//! itself as a construction side effect; `CommandRegistry::standard`
//! builds the full set.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::client::GroupClient;
use crate::coordinator::{ReshardCoordinator, ReshardRequest};
use crate::error::{ControlError, ControlResult};
use crate::keys::KeyPattern;
use crate::oplog::{OplogEntry, OplogTailer, OpTime};
use crate::replay::OplogReplayer;
use crate::Document;

/// Shared context handed to every handler.
pub struct CommandContext {
    pub coordinator: Arc<ReshardCoordinator>,
}

/// One admin command handler.
#[async_trait::async_trait]
pub trait AdminCommand: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: &CommandContext, payload: &Document) -> Document;
}

/// Name-to-handler dispatch table.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Arc<dyn AdminCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: Arc<dyn AdminCommand>) {
        self.handlers.insert(command.name(), command);
    }

    /// The standard command set, registered explicitly at startup.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReshardCollectionCommand));
        registry.register(Arc::new(ReplayOplogCommand));
        registry
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Dispatch a payload by its command field name.
    pub async fn dispatch(&self, ctx: &CommandContext, payload: &Document) -> Document {
        let Some(obj) = payload.as_object() else {
            return error_doc("command payload must be a document");
        };
        if let Some(handler) = obj.keys().find_map(|name| self.handlers.get(name.as_str())) {
            return handler.run(ctx, payload).await;
        }
        match obj.keys().next() {
            Some(name) => error_doc(&format!("no such command: {name}")),
            None => error_doc("empty command payload"),
        }
    }
}

fn error_doc(errmsg: &str) -> Document {
    json!({ "ok": 0, "errmsg": errmsg })
}

/// `{ reShardCollection: "<db>.<coll>", key: {...}, unique, numInitialChunks }`
pub struct ReshardCollectionCommand;

impl ReshardCollectionCommand {
    fn parse(payload: &Document) -> ControlResult<ReshardRequest> {
        let ns = payload
            .get("reShardCollection")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ControlError::validation("no ns"))?
            .to_string();
        let key = payload
            .get("key")
            .cloned()
            .ok_or_else(|| ControlError::validation("no shard key"))?;
        if !key.is_object() || key.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            return Err(ControlError::validation("no shard key"));
        }
        let unique = payload
            .get("unique")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let num_initial_chunks = match payload.get("numInitialChunks") {
            None => None,
            Some(v) => Some(
                v.as_u64()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| ControlError::validation("numInitialChunks must be >= 1"))?
                    as u32,
            ),
        };
        Ok(ReshardRequest {
            ns,
            key,
            unique,
            num_initial_chunks,
        })
    }
}

#[async_trait::async_trait]
impl AdminCommand for ReshardCollectionCommand {
    fn name(&self) -> &'static str {
        "reShardCollection"
    }

    async fn run(&self, ctx: &CommandContext, payload: &Document) -> Document {
        let request = match Self::parse(payload) {
            Ok(request) => request,
            Err(err) => return error_doc(&err.to_string()),
        };
        tracing::info!(ns = %request.ns, key = %request.key, "reShardCollection requested");
        ctx.coordinator.reshard(request).await.to_document()
    }
}

/// Payload of the `replayOplog` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayOplogParams {
    pub ns: String,
    #[serde(rename = "startTime")]
    pub start_time: OpTime,
    #[serde(rename = "proposedKey")]
    pub proposed_key: Document,
    #[serde(rename = "splitPoints", default)]
    pub split_points: Vec<Document>,
    #[serde(rename = "numChunks")]
    pub num_chunks: usize,
    pub assignments: Vec<usize>,
    #[serde(rename = "removedReplicas")]
    pub removed_replicas: Vec<String>,
}

impl ReplayOplogParams {
    pub fn validate(&self, group_count: usize) -> ControlResult<()> {
        if self.ns.is_empty() {
            return Err(ControlError::validation("no ns"));
        }
        if self.start_time.is_zero() {
            return Err(ControlError::validation("no start time"));
        }
        KeyPattern::parse(&self.proposed_key)?;
        if self.num_chunks < 1 {
            return Err(ControlError::validation("numChunks must be >= 1"));
        }
        if self.assignments.len() != self.num_chunks {
            return Err(ControlError::validation(format!(
                "expected {} assignments, got {}",
                self.num_chunks,
                self.assignments.len()
            )));
        }
        if self.removed_replicas.len() != group_count {
            return Err(ControlError::validation(format!(
                "expected {} removed replicas, got {}",
                group_count,
                self.removed_replicas.len()
            )));
        }
        Ok(())
    }
}

/// Re-capture each group's oplog from a start time and replay it
/// through current routing. Operator recovery path for a session whose
/// replay step was interrupted.
pub struct ReplayOplogCommand;

#[async_trait::async_trait]
impl AdminCommand for ReplayOplogCommand {
    fn name(&self) -> &'static str {
        "replayOplog"
    }

    async fn run(&self, ctx: &CommandContext, payload: &Document) -> Document {
        match self.replay(ctx, payload).await {
            Ok(applied) => json!({ "ok": 1, "replayed": applied }),
            Err(err) => error_doc(&err.to_string()),
        }
    }
}

impl ReplayOplogCommand {
    async fn replay(&self, ctx: &CommandContext, payload: &Document) -> ControlResult<u64> {
        let params: ReplayOplogParams = payload
            .get("replayOplog")
            .cloned()
            .ok_or_else(|| ControlError::validation("no replayOplog parameters"))
            .and_then(|v| serde_json::from_value(v).map_err(|e| ControlError::validation(e.to_string())))?;

        let store = ctx.coordinator.store();
        let client = ctx.coordinator.node_client();
        let groups: Vec<GroupClient> = store
            .list_groups()
            .await?
            .into_iter()
            .map(|g| GroupClient::new(client.clone(), g.name, g.seeds))
            .collect();
        params.validate(groups.len())?;

        let cache = ctx.coordinator.cache();
        let table = cache.table(store.as_ref(), &params.ns).await?;

        let tailer = OplogTailer::new(client.clone());
        let mut captures: Vec<Vec<OplogEntry>> = Vec::with_capacity(groups.len());
        for group in &groups {
            let leader = group.leader().await?.leader;
            let tail = tailer.tail_from(&leader, params.start_time).await?;
            captures.push(tail.collect().await?);
        }

        let replayer = OplogReplayer::new(client);
        let stats = replayer.replay(&table, &groups, &captures).await?;
        Ok(stats.applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reshard_payload_parsing() {
        let good = ReshardCollectionCommand::parse(&json!({
            "reShardCollection": "app.events",
            "key": {"b": 1},
            "unique": false,
            "numInitialChunks": 4,
        }))
        .expect("parse");
        assert_eq!(good.ns, "app.events");
        assert_eq!(good.num_initial_chunks, Some(4));
        assert!(!good.unique);

        assert!(ReshardCollectionCommand::parse(&json!({"key": {"b": 1}})).is_err());
        assert!(ReshardCollectionCommand::parse(&json!({
            "reShardCollection": "app.events"
        }))
        .is_err());
        assert!(ReshardCollectionCommand::parse(&json!({
            "reShardCollection": "app.events",
            "key": {},
        }))
        .is_err());
        assert!(ReshardCollectionCommand::parse(&json!({
            "reShardCollection": "app.events",
            "key": {"b": 1},
            "numInitialChunks": 0,
        }))
        .is_err());
    }

    #[test]
    fn replay_params_validation() {
        let params = ReplayOplogParams {
            ns: "app.events".to_string(),
            start_time: OpTime::new(10, 0),
            proposed_key: json!({"b": 1}),
            split_points: vec![],
            num_chunks: 2,
            assignments: vec![0, 1],
            removed_replicas: vec!["n1:4001".to_string(), "n2:4001".to_string()],
        };
        params.validate(2).expect("valid");

        let mut bad = params.clone();
        bad.assignments = vec![0];
        assert!(bad.validate(2).is_err());

        let mut bad = params.clone();
        bad.start_time = OpTime::ZERO;
        assert!(bad.validate(2).is_err());

        let mut bad = params.clone();
        bad.proposed_key = json!({});
        assert!(bad.validate(2).is_err());

        assert!(params.validate(3).is_err());
    }

    #[test]
    fn registry_lists_standard_commands() {
        let registry = CommandRegistry::standard();
        assert_eq!(registry.names(), vec!["reShardCollection", "replayOplog"]);
    }
}
