//! Wiring of every control-plane component around one database and bus

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::access::AccessResolver;
use crate::bandwidth::BandwidthAggregator;
use crate::clock::{Clock, SystemClock};
use crate::config::ControlConfig;
use crate::error::ControlResult;
use crate::exit_nodes::{ExitNodeClient, ExitNodeSelector};
use crate::handler::AgentMessageHandler;
use crate::heartbeat::{HeartbeatManager, OfflineSweeper};
use crate::message_bus::MessageBus;
use crate::provisioning::Provisioner;
use crate::session::SessionManager;

/// The control plane: one instance per process
pub struct ControlPlane {
    pub db: DatabaseConnection,
    pub config: ControlConfig,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<dyn MessageBus>,
    pub access: Arc<AccessResolver>,
    pub exit_nodes: Arc<ExitNodeSelector>,
    pub exit_node_client: Arc<ExitNodeClient>,
    pub sessions: Arc<SessionManager>,
    pub heartbeat: Arc<HeartbeatManager>,
    pub bandwidth: Arc<BandwidthAggregator>,
    pub provisioning: Arc<Provisioner>,
    pub handler: Arc<AgentMessageHandler>,
    pub sweeper: Arc<OfflineSweeper>,
}

impl ControlPlane {
    /// Build against the wall clock
    pub fn new(
        db: DatabaseConnection,
        config: ControlConfig,
        bus: Arc<dyn MessageBus>,
    ) -> ControlResult<Self> {
        Self::with_clock(db, config, bus, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: DatabaseConnection,
        config: ControlConfig,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> ControlResult<Self> {
        let access = Arc::new(AccessResolver::new(db.clone(), bus.clone()));
        let exit_nodes = Arc::new(ExitNodeSelector::new(db.clone()));
        let exit_node_client = Arc::new(ExitNodeClient::new(&config, db.clone(), bus.clone())?);
        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            clock.clone(),
            config.session_ttl,
        ));
        let heartbeat = Arc::new(HeartbeatManager::new(
            db.clone(),
            clock.clone(),
            bus.clone(),
            &config,
        ));
        let bandwidth = Arc::new(BandwidthAggregator::new(db.clone(), clock.clone(), &config));
        let provisioning = Arc::new(Provisioner::new(
            db.clone(),
            clock.clone(),
            access.clone(),
            exit_node_client.clone(),
            &config,
        ));
        let handler = Arc::new(AgentMessageHandler::new(
            db.clone(),
            clock.clone(),
            heartbeat.clone(),
            exit_nodes.clone(),
            bandwidth.clone(),
            provisioning.clone(),
        ));
        let sweeper = Arc::new(OfflineSweeper::new(heartbeat.clone(), config.sweep_interval));

        Ok(Self {
            db,
            config,
            clock,
            bus,
            access,
            exit_nodes,
            exit_node_client,
            sessions,
            heartbeat,
            bandwidth,
            provisioning,
            handler,
            sweeper,
        })
    }
}
