use burrow_control::{
    AccessTarget, AssociationDelta, GrantTarget, Grantee, SiteDefaults, SweepReport,
    UsageReportSummary,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Stable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Version
    pub version: String,
    /// Agents with a live session on this process
    pub connected_agents: usize,
}

/// Bootstrap payload for a new site
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SiteDefaultsResponse {
    pub exit_node_id: i32,
    /// Exit node anchor address in CIDR form
    pub address: String,
    /// Exit node WireGuard public key
    pub public_key: String,
    /// Exit node name
    pub name: String,
    pub listen_port: i32,
    pub endpoint: String,
    /// Site subnet reserved on the exit node
    pub subnet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    pub newt_id: String,
    pub newt_secret: String,
}

impl From<SiteDefaults> for SiteDefaultsResponse {
    fn from(defaults: SiteDefaults) -> Self {
        Self {
            exit_node_id: defaults.exit_node_id,
            address: defaults.address,
            public_key: defaults.public_key,
            name: defaults.name,
            listen_port: defaults.listen_port,
            endpoint: defaults.endpoint,
            subnet: defaults.subnet,
            client_address: defaults.client_address,
            newt_id: defaults.newt_id,
            newt_secret: defaults.newt_secret,
        }
    }
}

/// Request to create a site
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSiteRequest {
    pub name: String,
    /// Short org-unique identifier; generated when omitted
    #[serde(default)]
    pub nice_id: Option<String>,
    /// Pin the site to an exit node instead of random placement
    #[serde(default)]
    pub exit_node_id: Option<i32>,
    /// Credentials from a prior pick-site-defaults call
    #[serde(default)]
    pub newt_id: Option<String>,
    #[serde(default)]
    pub newt_secret: Option<String>,
}

/// Created site with its Newt credentials
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSiteResponse {
    pub site_id: i32,
    pub nice_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_node_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub newt_id: String,
    /// Shown once; only its hash is stored
    pub newt_secret: String,
}

/// Request to create a client
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateClientRequest {
    pub name: String,
    /// Owning user for a per-user client; omitted for machine clients
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Created client with its Olm credentials
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateClientResponse {
    pub client_id: i32,
    pub name: String,
    pub address: String,
    pub olm_id: String,
    /// Shown once; only its hash is stored
    pub olm_secret: String,
}

/// Credentials exchanged for a session token
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentTokenRequest {
    pub agent_id: String,
    pub secret: String,
}

/// Session token for an agent
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentTokenResponse {
    /// Bearer token for the agent WebSocket
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Target of an explicit grant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum GrantTargetRef {
    Resource(i32),
    SiteResource(i32),
}

impl From<GrantTargetRef> for GrantTarget {
    fn from(target: GrantTargetRef) -> Self {
        match target {
            GrantTargetRef::Resource(id) => GrantTarget::Resource(id),
            GrantTargetRef::SiteResource(id) => GrantTarget::SiteResource(id),
        }
    }
}

/// Principal receiving a grant
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum GranteeRef {
    Role(i32),
    User(String),
    /// Machine client; site resources only
    Client(i32),
}

impl From<GranteeRef> for Grantee {
    fn from(grantee: GranteeRef) -> Self {
        match grantee {
            GranteeRef::Role(id) => Grantee::Role(id),
            GranteeRef::User(id) => Grantee::User(id),
            GranteeRef::Client(id) => Grantee::Client(id),
        }
    }
}

/// Add or remove one grant
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GrantRequest {
    pub target: GrantTargetRef,
    pub grantee: GranteeRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetRoleGrantsRequest {
    pub role_ids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetUserGrantsRequest {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetClientGrantsRequest {
    pub client_ids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetUserRoleRequest {
    pub role_id: i32,
}

/// Query for role deletion
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRoleQuery {
    /// Role that inherits the deleted role's members
    pub replacement_role_id: i32,
}

/// How a grant change rewired clients and sites
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssociationChanges {
    pub targets_added: usize,
    pub targets_removed: usize,
    pub peers_added: usize,
    pub peers_removed: usize,
}

impl From<&AssociationDelta> for AssociationChanges {
    fn from(delta: &AssociationDelta) -> Self {
        Self {
            targets_added: delta.targets_added.len(),
            targets_removed: delta.targets_removed.len(),
            peers_added: delta.peers_added.len(),
            peers_removed: delta.peers_removed.len(),
        }
    }
}

/// Resolved client set of a site resource
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveClients {
    pub site_resource_id: i32,
    pub client_ids: Vec<i32>,
}

/// Anything a user may ask to reach
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum AccessTargetRef {
    Resource(i32),
    SiteResource(i32),
    Site(i32),
    Client(i32),
}

impl From<AccessTargetRef> for AccessTarget {
    fn from(target: AccessTargetRef) -> Self {
        match target {
            AccessTargetRef::Resource(id) => AccessTarget::Resource(id),
            AccessTargetRef::SiteResource(id) => AccessTarget::SiteResource(id),
            AccessTargetRef::Site(id) => AccessTarget::Site(id),
            AccessTargetRef::Client(id) => AccessTarget::Client(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessCheckRequest {
    pub user_id: String,
    pub target: AccessTargetRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccessCheckResponse {
    pub allowed: bool,
}

/// Outcome of applying a usage report
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageReportResponse {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub marked_offline: usize,
}

impl From<UsageReportSummary> for UsageReportResponse {
    fn from(summary: UsageReportSummary) -> Self {
        Self {
            applied: summary.applied,
            skipped: summary.skipped,
            failed: summary.failed,
            marked_offline: summary.marked_offline,
        }
    }
}

/// Rows demoted by an on-demand sweep
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepResponse {
    pub exit_nodes: u64,
    pub sites: u64,
    pub clients: u64,
}

impl From<SweepReport> for SweepResponse {
    fn from(report: SweepReport) -> Self {
        Self {
            exit_nodes: report.exit_nodes,
            sites: report.sites,
            clients: report.clients,
        }
    }
}
