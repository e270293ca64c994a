//! SiteResource entity: a routable destination behind a site

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "site_resources")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub site_resource_id: i32,

    pub site_id: i32,

    pub org_id: String,

    pub name: String,

    /// Host or address behind the site
    pub destination: String,

    pub destination_port: Option<i32>,
}

impl Model {
    /// `host:port`, or the bare host when no port is set
    pub fn target(&self) -> String {
        match self.destination_port {
            Some(port) => format!("{}:{}", self.destination, port),
            None => self.destination.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::site::Entity",
        from = "Column::SiteId",
        to = "super::site::Column::SiteId",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    Site,
}

impl Related<super::site::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Site.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
