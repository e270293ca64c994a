//! Agent entity: credentials for a Newt, Olm or remote exit node

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Kind of agent holding a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum AgentType {
    /// Site agent
    #[sea_orm(string_value = "newt")]
    Newt,

    /// Client agent
    #[sea_orm(string_value = "olm")]
    Olm,

    #[sea_orm(string_value = "remoteExitNode")]
    RemoteExitNode,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub agent_id: String,

    pub agent_type: AgentType,

    /// Argon2id PHC hash of the agent secret
    #[serde(skip_serializing)]
    pub secret_hash: String,

    pub site_id: Option<i32>,

    pub client_id: Option<i32>,

    pub exit_node_id: Option<i32>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::agent_session::Entity")]
    Session,
}

impl Related<super::agent_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Session.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
