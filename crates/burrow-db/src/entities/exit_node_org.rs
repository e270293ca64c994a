//! Association of exit nodes with the organizations allowed to use them

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "exit_node_orgs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub exit_node_id: i32,

    #[sea_orm(primary_key, auto_increment = false)]
    pub org_id: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::exit_node::Entity",
        from = "Column::ExitNodeId",
        to = "super::exit_node::Column::ExitNodeId",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    ExitNode,
}

impl Related<super::exit_node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExitNode.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
