//! Control plane for the burrow tunnel fleet
//!
//! Decides who may reach what, places sites on exit nodes, hands out
//! addresses, keeps agent sessions and liveness, and accounts bandwidth.
pub mod access;
pub mod bandwidth;
pub mod clock;
pub mod config;
pub mod error;
pub mod exit_nodes;
pub mod handler;
pub mod heartbeat;
pub mod ip;
pub mod message_bus;
pub mod provisioning;
pub mod registry;
pub mod retry;
pub mod session;

pub use access::{
    AccessDecision, AccessResolver, AccessTarget, AssociationDelta, ChangedEntity, GrantTarget,
    Grantee, PeerChange, SiteWiring, TargetChange,
};
pub use bandwidth::{BandwidthAggregator, UsageReportSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ControlConfig, MAX_DURATION};
pub use error::{ControlError, ControlResult};
pub use exit_nodes::{select_best_exit_node, ExitNodeClient, ExitNodeSelector, RankedExitNode};
pub use handler::AgentMessageHandler;
pub use heartbeat::{HeartbeatManager, OfflineSweeper, SweepReport, MIN_SWEEP_INTERVAL};
pub use message_bus::{LocalMessageBus, MessageBus};
pub use provisioning::{CreatedClient, CreatedSite, NewClient, NewSite, Provisioner, SiteDefaults};
pub use registry::ControlPlane;
pub use retry::RetryPolicy;
pub use session::{
    AgentBinding, AgentCredentials, AuthenticatedAgent, IssuedToken, SessionManager,
};
