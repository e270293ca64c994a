//! OrgAddress entity: one row per address taken from an org subnet
//!
//! Sites and clients draw from the same per-org range, so both reserve their
//! address here; the unique `(org_id, address)` index is what stops a site and
//! a client from landing on the same address.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "org_addresses")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub org_address_id: i32,

    pub org_id: String,

    /// Bare IPv4 address, no prefix
    pub address: String,

    /// Holder when the address belongs to a site
    pub site_id: Option<i32>,

    /// Holder when the address belongs to a client
    pub client_id: Option<i32>,
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
        belongs_to = "super::site::Entity",
        from = "Column::SiteId",
        to = "super::site::Column::SiteId",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Site,
    #[sea_orm(
        belongs_to = "super::client::Entity",
        from = "Column::ClientId",
        to = "super::client::Column::ClientId",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Client,
}

impl Related<super::org::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Org.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
