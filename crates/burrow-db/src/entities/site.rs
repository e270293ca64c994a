//! Site entity: a network endpoint run by a Newt agent

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sites")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub site_id: i32,

    pub org_id: String,

    /// Human-friendly id, unique per org
    pub nice_id: String,

    pub name: String,

    /// WireGuard public key reported by the Newt
    pub pub_key: Option<String>,

    /// Block allocated from the exit node's anchor range
    pub subnet: Option<String>,

    /// Address inside the org subnet
    pub address: Option<String>,

    pub exit_node_id: Option<i32>,

    pub online: bool,

    /// Unix seconds of the last heartbeat
    pub last_ping: Option<i64>,

    pub last_bandwidth_update: Option<ChronoDateTimeUtc>,

    pub bytes_in: i64,

    pub bytes_out: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::org::Entity",
        from = "Column::OrgId",
        to = "super::org::Column::OrgId",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Org,

    #[sea_orm(
        belongs_to = "super::exit_node::Entity",
        from = "Column::ExitNodeId",
        to = "super::exit_node::Column::ExitNodeId",
        on_update = "Cascade",
        on_delete = "SetNull"
    )]
    ExitNode,

    #[sea_orm(has_many = "super::site_resource::Entity")]
    SiteResource,
}

impl Related<super::org::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Org.def()
    }
}

impl Related<super::exit_node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExitNode.def()
    }
}

impl Related<super::site_resource::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SiteResource.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
