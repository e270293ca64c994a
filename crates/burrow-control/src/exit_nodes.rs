//! Exit-node selection and communication
//!
//! Candidates for an organization are the exit nodes linked to it through
//! `exit_node_orgs`. Each candidate is weighted by its spare capacity:
//!
//! ```text
//! weight = 1                                  if max_connections is unset
//! weight = (max - online_sites) / max         otherwise, excluded when <= 0
//! ```
//!
//! Sites get a ranked list on request and use it, together with their own
//! ping results, to pick where to connect.

use std::sync::Arc;

use burrow_db::entities::{
    exit_node::{self, ExitNodeType},
    exit_node_org, site,
};
use burrow_proto::{AgentMessage, ExitNodeCandidate, ExitNodePingResult};
use rand::seq::SliceRandom;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};
use crate::message_bus::MessageBus;
use crate::session::agent_for_exit_node;

/// Minimum weight a node needs before latency alone can pick it
pub const MIN_CAPACITY_WEIGHT: f64 = 0.1;
/// Absolute latency slack granted to the previously used node
pub const LATENCY_TOLERANCE_MS: f64 = 30.0;
/// Relative latency slack granted to the previously used node
pub const LATENCY_TOLERANCE_RATIO: f64 = 0.15;

/// An exit node with its capacity weight, as offered to a site
#[derive(Debug, Clone, PartialEq)]
pub struct RankedExitNode {
    pub node: exit_node::Model,
    pub weight: f64,
    pub was_previously_connected: bool,
}

impl RankedExitNode {
    pub fn to_candidate(&self) -> ExitNodeCandidate {
        ExitNodeCandidate {
            exit_node_id: self.node.exit_node_id,
            exit_node_name: self.node.name.clone(),
            endpoint: self.node.endpoint.clone(),
            weight: self.weight,
            was_previously_connected: self.was_previously_connected,
        }
    }
}

/// Capacity weight for a node, or `None` when it is saturated
pub fn capacity_weight(max_connections: Option<i32>, online_sites: u64) -> Option<f64> {
    match max_connections {
        None => Some(1.0),
        Some(max) if max <= 0 => None,
        Some(max) => {
            let max = f64::from(max);
            let used = online_sites as f64;
            if used >= max {
                None
            } else {
                Some((max - used) / max)
            }
        }
    }
}

/// Pick among a site's own ping results
///
/// Sticks with the previously connected node while it has capacity and is
/// within `max(30ms, 15%)` of the fastest; otherwise takes the fastest node
/// with capacity, falling back to the node with the most spare capacity.
pub fn select_best_exit_node(results: &[ExitNodePingResult]) -> Option<&ExitNodePingResult> {
    let mut usable: Vec<&ExitNodePingResult> = results
        .iter()
        .filter(|r| r.error.is_none() && r.weight > 0.0 && r.latency_ms.is_finite())
        .collect();

    if usable.is_empty() {
        return None;
    }

    usable.sort_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));
    let fastest = usable[0];

    if let Some(previous) = usable
        .iter()
        .find(|r| r.was_previously_connected && r.weight >= MIN_CAPACITY_WEIGHT)
    {
        let tolerance = LATENCY_TOLERANCE_MS.max(fastest.latency_ms * LATENCY_TOLERANCE_RATIO);
        if previous.latency_ms - fastest.latency_ms <= tolerance {
            return Some(previous);
        }
    }

    if let Some(with_capacity) = usable.iter().find(|r| r.weight >= MIN_CAPACITY_WEIGHT) {
        return Some(with_capacity);
    }

    usable
        .into_iter()
        .max_by(|a, b| a.weight.total_cmp(&b.weight))
}

/// Exit nodes associated with an organization
///
/// When remote nodes are allowed and the org has any, only those are
/// returned; operator-run nodes serve orgs without their own relays.
pub async fn list_exit_nodes<C: ConnectionTrait>(
    conn: &C,
    org_id: &str,
    online_only: bool,
    exclude_remote: bool,
) -> ControlResult<Vec<exit_node::Model>> {
    let linked: Vec<i32> = exit_node_org::Entity::find()
        .filter(exit_node_org::Column::OrgId.eq(org_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|row| row.exit_node_id)
        .collect();

    if linked.is_empty() {
        return Ok(Vec::new());
    }

    let mut query = exit_node::Entity::find()
        .filter(exit_node::Column::ExitNodeId.is_in(linked))
        .order_by_asc(exit_node::Column::ExitNodeId);
    if online_only {
        query = query.filter(exit_node::Column::Online.eq(true));
    }
    if exclude_remote {
        query = query.filter(exit_node::Column::NodeType.ne(ExitNodeType::RemoteExitNode));
    }

    let nodes = query.all(conn).await?;

    let (remote, local): (Vec<_>, Vec<_>) = nodes
        .into_iter()
        .partition(|node| node.node_type == ExitNodeType::RemoteExitNode);

    Ok(if remote.is_empty() { local } else { remote })
}

/// Ranks and selects exit nodes for an organization
pub struct ExitNodeSelector {
    db: DatabaseConnection,
}

impl ExitNodeSelector {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Candidates with their capacity weight; saturated nodes are left out
    ///
    /// `current_exit_node_id` marks the node the site is attached to now.
    pub async fn rank_exit_nodes(
        &self,
        org_id: &str,
        online_only: bool,
        exclude_remote: bool,
        current_exit_node_id: Option<i32>,
    ) -> ControlResult<Vec<RankedExitNode>> {
        rank_exit_nodes(
            &self.db,
            org_id,
            online_only,
            exclude_remote,
            current_exit_node_id,
        )
        .await
    }

    /// Initial placement: uniformly random among online, non-saturated nodes
    pub async fn select_exit_node(&self, org_id: &str) -> ControlResult<exit_node::Model> {
        select_exit_node(&self.db, org_id, false).await
    }
}

pub(crate) async fn rank_exit_nodes<C: ConnectionTrait>(
    conn: &C,
    org_id: &str,
    online_only: bool,
    exclude_remote: bool,
    current_exit_node_id: Option<i32>,
) -> ControlResult<Vec<RankedExitNode>> {
    let nodes = list_exit_nodes(conn, org_id, online_only, exclude_remote).await?;
    let mut ranked = Vec::with_capacity(nodes.len());

    for node in nodes {
        let online_sites = site::Entity::find()
            .filter(site::Column::ExitNodeId.eq(node.exit_node_id))
            .filter(site::Column::Online.eq(true))
            .count(conn)
            .await?;

        match capacity_weight(node.max_connections, online_sites) {
            Some(weight) => ranked.push(RankedExitNode {
                was_previously_connected: current_exit_node_id == Some(node.exit_node_id),
                weight,
                node,
            }),
            None => debug!(
                exit_node_id = node.exit_node_id,
                online_sites, "Exit node at capacity, skipping"
            ),
        }
    }

    Ok(ranked)
}

pub(crate) async fn select_exit_node<C: ConnectionTrait>(
    conn: &C,
    org_id: &str,
    exclude_remote: bool,
) -> ControlResult<exit_node::Model> {
    let ranked = rank_exit_nodes(conn, org_id, true, exclude_remote, None).await?;
    ranked
        .choose(&mut rand::thread_rng())
        .map(|r| r.node.clone())
        .ok_or_else(|| {
            ControlError::CapacityExhausted(format!(
                "no available exit node for organization {}",
                org_id
            ))
        })
}

/// Sends configuration changes to exit nodes
///
/// Operator-run nodes are called over HTTP at `reachable_at`; remote nodes
/// only through their agent session on the message bus.
pub struct ExitNodeClient {
    http: reqwest::Client,
    bus: Arc<dyn MessageBus>,
    db: DatabaseConnection,
}

impl ExitNodeClient {
    pub fn new(
        config: &ControlConfig,
        db: DatabaseConnection,
        bus: Arc<dyn MessageBus>,
    ) -> ControlResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.exit_node_request_timeout)
            .build()
            .map_err(|e| ControlError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, bus, db })
    }

    /// POST `payload` to `path` on a gerbil node, or publish it as `message_type` to a remote one
    pub async fn send<T: Serialize + Sync>(
        &self,
        node: &exit_node::Model,
        path: &str,
        message_type: &str,
        payload: &T,
    ) -> ControlResult<()> {
        match node.node_type {
            ExitNodeType::Gerbil => {
                let base = node.reachable_at.as_deref().ok_or_else(|| {
                    ControlError::InvalidInput(format!(
                        "exit node {} has no reachable address",
                        node.exit_node_id
                    ))
                })?;
                let url = format!("{}{}", base.trim_end_matches('/'), path);

                let response = self.http.post(&url).json(payload).send().await?;
                if !response.status().is_success() {
                    return Err(ControlError::ExitNode(format!(
                        "{} returned {}",
                        url,
                        response.status()
                    )));
                }
                Ok(())
            }
            ExitNodeType::RemoteExitNode => {
                let agent = agent_for_exit_node(&self.db, node.exit_node_id)
                    .await?
                    .ok_or_else(|| {
                        ControlError::Unavailable(format!(
                            "remote exit node {} has no registered agent",
                            node.exit_node_id
                        ))
                    })?;
                let message = AgentMessage::new(message_type, payload)?;
                if self.bus.publish(&agent.agent_id, message).await {
                    Ok(())
                } else {
                    Err(ControlError::Unavailable(format!(
                        "remote exit node {} is not connected",
                        node.exit_node_id
                    )))
                }
            }
        }
    }

    /// Best-effort variant that logs instead of failing
    pub async fn notify<T: Serialize + Sync>(
        &self,
        node: &exit_node::Model,
        path: &str,
        message_type: &str,
        payload: &T,
    ) {
        if let Err(e) = self.send(node, path, message_type, payload).await {
            warn!(
                exit_node_id = node.exit_node_id,
                path, "Failed to notify exit node: {}", e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_result(id: i32, latency_ms: f64, weight: f64, previous: bool) -> ExitNodePingResult {
        ExitNodePingResult {
            exit_node_id: id,
            exit_node_name: format!("node-{}", id),
            endpoint: format!("node-{}.example.com:51820", id),
            latency_ms,
            weight,
            error: None,
            was_previously_connected: previous,
        }
    }

    #[test]
    fn test_capacity_weight() {
        assert_eq!(capacity_weight(None, 500), Some(1.0));
        assert_eq!(capacity_weight(Some(4), 1), Some(0.75));
        assert_eq!(capacity_weight(Some(2), 2), None);
        assert_eq!(capacity_weight(Some(2), 3), None);
        assert_eq!(capacity_weight(Some(0), 0), None);
    }

    #[test]
    fn test_fewer_connections_means_higher_weight() {
        let busy = capacity_weight(Some(10), 7).unwrap();
        let idle = capacity_weight(Some(10), 2).unwrap();
        assert!(idle > busy);
    }

    #[test]
    fn test_prefers_previous_within_tolerance() {
        let results = vec![ping_result(1, 20.0, 1.0, false), ping_result(2, 45.0, 1.0, true)];
        assert_eq!(select_best_exit_node(&results).unwrap().exit_node_id, 2);
    }

    #[test]
    fn test_abandons_previous_outside_tolerance() {
        let results = vec![ping_result(1, 20.0, 1.0, false), ping_result(2, 80.0, 1.0, true)];
        assert_eq!(select_best_exit_node(&results).unwrap().exit_node_id, 1);
    }

    #[test]
    fn test_relative_tolerance_on_slow_links() {
        // 15% of 300ms is 45ms, which beats the 30ms floor
        let results = vec![ping_result(1, 300.0, 1.0, false), ping_result(2, 340.0, 1.0, true)];
        assert_eq!(select_best_exit_node(&results).unwrap().exit_node_id, 2);
    }

    #[test]
    fn test_skips_nearly_full_fastest_node() {
        let results = vec![ping_result(1, 10.0, 0.05, false), ping_result(2, 50.0, 0.5, false)];
        assert_eq!(select_best_exit_node(&results).unwrap().exit_node_id, 2);
    }

    #[test]
    fn test_falls_back_to_highest_weight() {
        let results = vec![ping_result(1, 10.0, 0.02, false), ping_result(2, 50.0, 0.08, false)];
        assert_eq!(select_best_exit_node(&results).unwrap().exit_node_id, 2);
    }

    #[test]
    fn test_ignores_errors_and_empty_input() {
        let mut failed = ping_result(1, 5.0, 1.0, false);
        failed.error = Some("timeout".to_string());
        assert!(select_best_exit_node(&[failed.clone()]).is_none());
        assert!(select_best_exit_node(&[]).is_none());

        let results = vec![failed, ping_result(2, 90.0, 1.0, false)];
        assert_eq!(select_best_exit_node(&results).unwrap().exit_node_id, 2);
    }
}
