//! Liveness tracking for agents and the periodic offline sweep

use std::sync::Arc;
use std::time::Duration;

use burrow_db::entities::{
    agent::AgentType,
    client,
    exit_node::{self, ExitNodeType},
    site,
};
use burrow_proto::{message_types, AgentMessage};
use sea_orm::{
    sea_query::Expr, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{chrono_duration, ControlConfig};
use crate::error::{ControlError, ControlResult};
use crate::message_bus::MessageBus;
use crate::session::{agent_for_client, AuthenticatedAgent};

/// Rows demoted by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub exit_nodes: u64,
    pub sites: u64,
    pub clients: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.exit_nodes == 0 && self.sites == 0 && self.clients == 0
    }
}

/// Records heartbeats and demotes agents that stopped sending them
pub struct HeartbeatManager {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    bus: Arc<dyn MessageBus>,
    exit_node_offline_after: chrono::Duration,
    client_offline_after: chrono::Duration,
    site_bandwidth_stale_after: chrono::Duration,
}

impl HeartbeatManager {
    pub fn new(
        db: DatabaseConnection,
        clock: Arc<dyn Clock>,
        bus: Arc<dyn MessageBus>,
        config: &ControlConfig,
    ) -> Self {
        Self {
            db,
            clock,
            bus,
            exit_node_offline_after: chrono_duration(config.exit_node_offline_after),
            client_offline_after: chrono_duration(config.client_offline_after),
            site_bandwidth_stale_after: chrono_duration(config.site_bandwidth_stale_after),
        }
    }

    /// Stamp `lastPing` and mark the agent's entity online
    pub async fn on_heartbeat(&self, agent: &AuthenticatedAgent) -> ControlResult<()> {
        let now = self.clock.now().timestamp();

        let updated = match agent.agent_type {
            AgentType::Newt => {
                let site_id = bound_id(agent.site_id, agent)?;
                site::Entity::update_many()
                    .col_expr(site::Column::LastPing, Expr::value(now))
                    .col_expr(site::Column::Online, Expr::value(true))
                    .filter(site::Column::SiteId.eq(site_id))
                    .exec(&self.db)
                    .await?
            }
            AgentType::Olm => {
                let client_id = bound_id(agent.client_id, agent)?;
                client::Entity::update_many()
                    .col_expr(client::Column::LastPing, Expr::value(now))
                    .col_expr(client::Column::Online, Expr::value(true))
                    .filter(client::Column::ClientId.eq(client_id))
                    .exec(&self.db)
                    .await?
            }
            AgentType::RemoteExitNode => {
                let exit_node_id = bound_id(agent.exit_node_id, agent)?;
                exit_node::Entity::update_many()
                    .col_expr(exit_node::Column::LastPing, Expr::value(now))
                    .col_expr(exit_node::Column::Online, Expr::value(true))
                    .filter(exit_node::Column::ExitNodeId.eq(exit_node_id))
                    .exec(&self.db)
                    .await?
            }
        };

        if updated.rows_affected == 0 {
            return Err(ControlError::not_found(format!(
                "entity bound to agent {}",
                agent.agent_id
            )));
        }

        debug!(agent_id = %agent.agent_id, agent_type = ?agent.agent_type, "Heartbeat");
        Ok(())
    }

    /// One pass of the offline sweep
    ///
    /// Remote exit nodes and Olm clients whose last ping is older than the
    /// threshold (or missing) go offline. Sites behind an offline remote exit
    /// node follow only if their own bandwidth reports have also gone stale;
    /// a site that never reported is left alone.
    pub async fn demote_stale_agents(&self) -> ControlResult<SweepReport> {
        let now = self.clock.now();
        let node_cutoff = (now - self.exit_node_offline_after).timestamp();
        let client_cutoff = (now - self.client_offline_after).timestamp();
        let bandwidth_cutoff = now - self.site_bandwidth_stale_after;

        let mut report = SweepReport::default();

        let demoted_nodes = exit_node::Entity::update_many()
            .col_expr(exit_node::Column::Online, Expr::value(false))
            .filter(exit_node::Column::NodeType.eq(ExitNodeType::RemoteExitNode))
            .filter(exit_node::Column::Online.eq(true))
            .filter(stale_ping(exit_node::Column::LastPing, node_cutoff))
            .exec(&self.db)
            .await?;
        report.exit_nodes = demoted_nodes.rows_affected;

        let offline_nodes: Vec<i32> = exit_node::Entity::find()
            .select_only()
            .column(exit_node::Column::ExitNodeId)
            .filter(exit_node::Column::NodeType.eq(ExitNodeType::RemoteExitNode))
            .filter(exit_node::Column::Online.eq(false))
            .into_tuple()
            .all(&self.db)
            .await?;

        if !offline_nodes.is_empty() {
            let demoted_sites = site::Entity::update_many()
                .col_expr(site::Column::Online, Expr::value(false))
                .filter(site::Column::ExitNodeId.is_in(offline_nodes))
                .filter(site::Column::Online.eq(true))
                .filter(site::Column::LastBandwidthUpdate.lt(bandwidth_cutoff))
                .exec(&self.db)
                .await?;
            report.sites = demoted_sites.rows_affected;
        }

        let stale_clients = client::Entity::find()
            .filter(client::Column::Online.eq(true))
            .filter(stale_ping(client::Column::LastPing, client_cutoff))
            .all(&self.db)
            .await?;

        for stale in stale_clients {
            client::Entity::update_many()
                .col_expr(client::Column::Online, Expr::value(false))
                .filter(client::Column::ClientId.eq(stale.client_id))
                .exec(&self.db)
                .await?;
            report.clients += 1;

            match agent_for_client(&self.db, stale.client_id).await? {
                Some(agent) => {
                    let delivered = self
                        .bus
                        .publish(&agent.agent_id, AgentMessage::empty(message_types::OLM_TERMINATE))
                        .await;
                    if delivered {
                        self.bus.disconnect(&agent.agent_id).await;
                    } else {
                        debug!(client_id = stale.client_id, "Olm not connected, terminate not delivered");
                    }
                }
                None => debug!(client_id = stale.client_id, "Client has no Olm agent"),
            }
        }

        Ok(report)
    }
}

fn bound_id(id: Option<i32>, agent: &AuthenticatedAgent) -> ControlResult<i32> {
    id.ok_or_else(|| {
        ControlError::InvalidInput(format!(
            "agent {} is not bound to a {:?} entity",
            agent.agent_id, agent.agent_type
        ))
    })
}

fn stale_ping<C: ColumnTrait>(column: C, cutoff: i64) -> Condition {
    Condition::any()
        .add(column.lt(cutoff))
        .add(column.is_null())
}

/// Shortest sweep period; a zero period would make the interval timer panic
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Background task running [`HeartbeatManager::demote_stale_agents`] on a fixed interval
///
/// At most one sweep loop runs per sweeper; `start` while running is a no-op.
pub struct OfflineSweeper {
    heartbeat: Arc<HeartbeatManager>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineSweeper {
    pub fn new(heartbeat: Arc<HeartbeatManager>, interval: Duration) -> Self {
        Self {
            heartbeat,
            interval: interval.max(MIN_SWEEP_INTERVAL),
            handle: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the sweep loop; returns `false` if it was already running
    pub async fn start(&self) -> bool {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Offline sweeper already running");
            return false;
        }

        let heartbeat = self.heartbeat.clone();
        let period = self.interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_tick(&heartbeat).await;
            }
        }));

        info!(interval_secs = period.as_secs(), "Offline sweeper started");
        true
    }

    /// Abort the sweep loop; returns `false` if it was not running
    pub async fn stop(&self) -> bool {
        match self.handle.lock().await.take() {
            Some(handle) => {
                handle.abort();
                info!("Offline sweeper stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Run one sweep immediately, independent of the loop
    pub async fn tick(&self) -> Option<SweepReport> {
        run_tick(&self.heartbeat).await
    }
}

async fn run_tick(heartbeat: &HeartbeatManager) -> Option<SweepReport> {
    match heartbeat.demote_stale_agents().await {
        Ok(report) if report.is_empty() => {
            debug!("Offline sweep: nothing to demote");
            Some(report)
        }
        Ok(report) => {
            info!(
                exit_nodes = report.exit_nodes,
                sites = report.sites,
                clients = report.clients,
                "Offline sweep demoted stale agents"
            );
            Some(report)
        }
        Err(ControlError::Transient(e)) => {
            warn!("Offline sweep hit store contention, will retry next tick: {}", e);
            None
        }
        Err(e) => {
            error!("Offline sweep failed: {}", e);
            None
        }
    }
}
