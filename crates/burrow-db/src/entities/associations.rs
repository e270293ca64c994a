//! Derived reachability tables maintained by association rebuilds

/// Effective client set of a site resource
pub mod client_site_resource {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "client_site_resource_associations")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub client_id: i32,

        #[sea_orm(primary_key, auto_increment = false)]
        pub site_resource_id: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Clients that must be peered with a site because some resource on it reaches them
pub mod client_site {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "client_site_associations")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub client_id: i32,

        #[sea_orm(primary_key, auto_increment = false)]
        pub site_id: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
