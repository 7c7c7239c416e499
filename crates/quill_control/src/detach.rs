//! Replica detach/rejoin management.
//!
//! One follower per shard group is removed from its group for the
//! session, freezing its data for sampling and migration; at the end
//! every loaned replica is re-added and, best effort, promoted to
//! leader.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::client::{with_retry, GroupClient, NodeClient};
use crate::error::{ControlError, ControlResult};
use crate::oplog::OpTime;
use crate::Endpoint;

/// A follower on loan from its group for the session's duration.
#[derive(Debug, Clone)]
pub struct DetachedReplica {
    pub group: String,
    pub endpoint: Endpoint,
    /// The group leader when the detach happened.
    pub leader_at_detach: Endpoint,
}

pub struct DetachManager {
    client: Arc<dyn NodeClient>,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl DetachManager {
    pub fn new(client: Arc<dyn NodeClient>) -> Self {
        Self::with_retries(client, 3, Duration::from_millis(250))
    }

    pub fn with_retries(
        client: Arc<dyn NodeClient>,
        retry_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            client,
            retry_attempts,
            retry_backoff,
        }
    }

    /// Pick the detach candidate for one group: the most lagged healthy
    /// follower whose rollback id stays stable across the scan window.
    pub async fn select_candidate(&self, group: &GroupClient) -> ControlResult<Endpoint> {
        let info = group.leader().await?;
        let followers: Vec<Endpoint> = info
            .members
            .iter()
            .filter(|m| **m != info.leader)
            .cloned()
            .collect();
        if followers.is_empty() {
            return Err(ControlError::validation(format!(
                "group {} has no follower to detach",
                group.name()
            )));
        }

        let mut best: Option<(OpTime, Endpoint)> = None;
        let mut last_err = None;
        for follower in followers {
            match self.probe_follower(&follower).await {
                Ok(applied) => {
                    let better = match &best {
                        Some((current, _)) => applied < *current,
                        None => true,
                    };
                    if better {
                        best = Some((applied, follower));
                    }
                }
                Err(err) => {
                    tracing::warn!(group = %group.name(), follower = %follower, error = %err,
                        "skipping unhealthy detach candidate");
                    last_err = Some(err);
                }
            }
        }

        match best {
            Some((_, endpoint)) => Ok(endpoint),
            None => Err(last_err.unwrap_or_else(|| {
                ControlError::NotReady(format!(
                    "group {} has no healthy detach candidate",
                    group.name()
                ))
            })),
        }
    }

    /// Health probe: reachable, with a rollback id stable across the
    /// lag read. A changing rollback id means the member is mid-rollback
    /// and its data cannot be trusted frozen.
    async fn probe_follower(&self, follower: &Endpoint) -> ControlResult<OpTime> {
        let rbid_before = self.client.rollback_id(follower).await?;
        let applied = self.client.last_applied(follower).await?;
        let rbid_after = self.client.rollback_id(follower).await?;
        if rbid_before != rbid_after {
            return Err(ControlError::NotReady(format!(
                "{follower}: rollback id changed during scan"
            )));
        }
        Ok(applied)
    }

    /// Detach the chosen follower from its group.
    pub async fn detach(&self, group: &GroupClient) -> ControlResult<DetachedReplica> {
        let candidate = self.select_candidate(group).await?;
        let leader = group.leader().await?.leader;
        group.remove_member(&candidate).await?;
        tracing::info!(group = %group.name(), replica = %candidate, "detached replica");
        Ok(DetachedReplica {
            group: group.name().to_string(),
            endpoint: candidate,
            leader_at_detach: leader,
        })
    }

    /// Rejoin every loaned replica, requesting leadership for each.
    ///
    /// Failures are collected rather than propagated: a replica that
    /// cannot be re-added is an operator problem, not a reason to undo
    /// completed data redistribution.
    pub async fn rejoin_all(
        &self,
        groups: &[GroupClient],
        detached: &[DetachedReplica],
    ) -> Vec<(String, ControlError)> {
        let attempts = self.retry_attempts;
        let backoff = self.retry_backoff;
        let tasks = detached.iter().map(|replica| {
            let group = groups.iter().find(|g| g.name() == replica.group);
            async move {
                let Some(group) = group else {
                    return Some((
                        replica.group.clone(),
                        ControlError::validation(format!("unknown group {}", replica.group)),
                    ));
                };
                let endpoint = &replica.endpoint;
                let rejoin = with_retry("rejoin replica", attempts, backoff, || {
                    let group = group;
                    let endpoint = endpoint;
                    async move { group.add_member(endpoint, true).await }
                })
                .await;
                match rejoin {
                    Ok(()) => {
                        tracing::info!(group = %replica.group, replica = %replica.endpoint,
                            "rejoined replica");
                        None
                    }
                    Err(err) => {
                        tracing::error!(group = %replica.group, replica = %replica.endpoint,
                            error = %err, "replica rejoin failed; re-add manually");
                        Some((replica.group.clone(), err))
                    }
                }
            }
        });
        join_all(tasks).await.into_iter().flatten().collect()
    }
}
