//! Client entity: a user- or machine-bound network peer

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub client_id: i32,

    pub org_id: String,

    /// Set for per-user clients, which derive access from the user's role
    pub user_id: Option<String>,

    pub name: String,

    #[sea_orm(unique)]
    pub pub_key: Option<String>,

    /// Single address inside the org subnet
    pub address: String,

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
}

impl Related<super::org::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Org.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
