//! Dispatch of inbound agent messages
//!
//! The protocol has no error message type, so a failed request is logged and
//! answered with nothing; agents retry on their next interval.

use std::sync::Arc;

use burrow_db::entities::{agent::AgentType, site};
use burrow_proto::{
    message_types, AgentMessage, BandwidthReport, ExitNodeList, OlmRegisterRequest, PingRequest,
    Pong, RegisterRequest,
};
use sea_orm::{DatabaseConnection, EntityTrait};
use tracing::{debug, warn};

use crate::bandwidth::BandwidthAggregator;
use crate::clock::Clock;
use crate::error::{ControlError, ControlResult};
use crate::exit_nodes::ExitNodeSelector;
use crate::heartbeat::HeartbeatManager;
use crate::provisioning::Provisioner;
use crate::session::AuthenticatedAgent;

pub struct AgentMessageHandler {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    heartbeat: Arc<HeartbeatManager>,
    exit_nodes: Arc<ExitNodeSelector>,
    bandwidth: Arc<BandwidthAggregator>,
    provisioning: Arc<Provisioner>,
}

impl AgentMessageHandler {
    pub fn new(
        db: DatabaseConnection,
        clock: Arc<dyn Clock>,
        heartbeat: Arc<HeartbeatManager>,
        exit_nodes: Arc<ExitNodeSelector>,
        bandwidth: Arc<BandwidthAggregator>,
        provisioning: Arc<Provisioner>,
    ) -> Self {
        Self {
            db,
            clock,
            heartbeat,
            exit_nodes,
            bandwidth,
            provisioning,
        }
    }

    /// Handle one message, returning the reply to send back if there is one
    pub async fn handle(
        &self,
        agent: &AuthenticatedAgent,
        message: AgentMessage,
    ) -> Option<AgentMessage> {
        let message_type = message.message_type.clone();
        match self.dispatch(agent, message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    agent_id = %agent.agent_id,
                    message_type = %message_type,
                    code = e.code(),
                    "Agent message failed: {}",
                    e
                );
                None
            }
        }
    }

    async fn dispatch(
        &self,
        agent: &AuthenticatedAgent,
        message: AgentMessage,
    ) -> ControlResult<Option<AgentMessage>> {
        match (agent.agent_type, message.message_type.as_str()) {
            (AgentType::Newt, message_types::NEWT_PING)
            | (AgentType::Olm, message_types::OLM_PING)
            | (AgentType::RemoteExitNode, message_types::REMOTE_EXIT_NODE_PING) => {
                self.heartbeat.on_heartbeat(agent).await?;
                let pong = Pong {
                    timestamp: self.clock.now().to_rfc3339(),
                };
                Ok(Some(AgentMessage::new(message_types::PONG, &pong)?))
            }

            (AgentType::Newt, message_types::NEWT_PING_REQUEST) => {
                let request: PingRequest = message.parse_data()?;
                let site = self.agent_site(agent).await?;
                let ranked = self
                    .exit_nodes
                    .rank_exit_nodes(&site.org_id, true, request.no_cloud, site.exit_node_id)
                    .await?;

                let list = ExitNodeList {
                    exit_nodes: ranked.iter().map(|r| r.to_candidate()).collect(),
                };
                debug!(site_id = site.site_id, candidates = list.exit_nodes.len(), "Offering exit nodes");
                Ok(Some(AgentMessage::new(
                    message_types::NEWT_PING_EXIT_NODES,
                    &list,
                )?))
            }

            (AgentType::Newt, message_types::NEWT_RECEIVE_BANDWIDTH) => {
                let report: BandwidthReport = message.parse_data()?;
                let summary = self
                    .bandwidth
                    .apply_usage_report(report.bandwidth_data)
                    .await;
                debug!(agent_id = %agent.agent_id, ?summary, "Applied client bandwidth");
                Ok(None)
            }

            (AgentType::Newt, message_types::NEWT_REGISTER) => {
                let request: RegisterRequest = message.parse_data()?;
                let reply = self.provisioning.register_newt(agent, request).await?;
                Ok(Some(AgentMessage::new(message_types::NEWT_CONNECT, &reply)?))
            }

            (AgentType::Olm, message_types::OLM_REGISTER) => {
                let request: OlmRegisterRequest = message.parse_data()?;
                let reply = self.provisioning.register_olm(agent, request).await?;
                Ok(Some(AgentMessage::new(message_types::OLM_CONNECT, &reply)?))
            }

            (AgentType::RemoteExitNode, message_types::EXIT_NODE_RECEIVE_BANDWIDTH) => {
                let report: BandwidthReport = message.parse_data()?;
                let summary = self.bandwidth.apply_site_usage(report.bandwidth_data).await;
                debug!(agent_id = %agent.agent_id, ?summary, "Applied site bandwidth");
                Ok(None)
            }

            (agent_type, other) => {
                debug!(agent_id = %agent.agent_id, ?agent_type, message_type = other, "Ignoring unhandled message");
                Ok(None)
            }
        }
    }

    async fn agent_site(&self, agent: &AuthenticatedAgent) -> ControlResult<site::Model> {
        let site_id = agent.site_id.ok_or_else(|| {
            ControlError::InvalidInput(format!("agent {} is not a site agent", agent.agent_id))
        })?;
        site::Entity::find_by_id(site_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("site {}", site_id)))
    }
}
