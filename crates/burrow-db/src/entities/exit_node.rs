//! ExitNode entity for relays that carry site traffic

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// How the control plane reaches an exit node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum ExitNodeType {
    /// Operator-run relay called directly over HTTP at `reachable_at`
    #[sea_orm(string_value = "gerbil")]
    Gerbil,

    /// Relay reachable only through its own authenticated agent session
    #[sea_orm(string_value = "remoteExitNode")]
    RemoteExitNode,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "exit_nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub exit_node_id: i32,

    pub name: String,

    /// Anchor CIDR; site subnets are carved out of this range
    pub address: String,

    /// Public WireGuard endpoint (`host:port`)
    pub endpoint: String,

    pub public_key: String,

    pub listen_port: i32,

    /// HTTP base URL for direct calls (gerbil nodes only)
    pub reachable_at: Option<String>,

    /// Capacity in online sites; `None` means unlimited
    pub max_connections: Option<i32>,

    pub online: bool,

    /// Unix seconds of the last heartbeat
    pub last_ping: Option<i64>,

    pub node_type: ExitNodeType,

    pub region: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::site::Entity")]
    Site,
}

impl Related<super::site::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Site.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
