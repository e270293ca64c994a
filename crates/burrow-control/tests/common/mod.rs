//! Shared fixtures for control-plane integration tests
#![allow(dead_code)]

use std::sync::Arc;

use burrow_control::{Clock, ControlConfig, ControlPlane, LocalMessageBus, ManualClock};
use burrow_db::entities::{
    client,
    exit_node::{self, ExitNodeType},
    exit_node_org, org, resource, role, site, site_resource, user, user_org,
};
use burrow_db::{connect, migrate};
use chrono::{DateTime, TimeZone, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};

pub const ORG: &str = "acme";
pub const ORG_SUBNET: &str = "100.90.128.0/24";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub async fn setup_db() -> DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    migrate(&db).await.expect("Failed to run migrations");
    db
}

pub struct TestPlane {
    pub db: DatabaseConnection,
    pub clock: ManualClock,
    pub bus: Arc<LocalMessageBus>,
    pub plane: ControlPlane,
}

pub async fn setup_plane() -> TestPlane {
    setup_plane_with(ControlConfig::default()).await
}

pub async fn setup_plane_with(config: ControlConfig) -> TestPlane {
    let db = setup_db().await;
    let clock = ManualClock::new(start_time());
    let bus = Arc::new(LocalMessageBus::new());
    let plane = ControlPlane::with_clock(
        db.clone(),
        config,
        bus.clone(),
        Arc::new(clock.clone()) as Arc<dyn Clock>,
    )
    .expect("Failed to build control plane");

    TestPlane {
        db,
        clock,
        bus,
        plane,
    }
}

pub async fn seed_org(db: &DatabaseConnection, org_id: &str, subnet: Option<&str>) {
    org::ActiveModel {
        org_id: Set(org_id.to_string()),
        name: Set(format!("Org {}", org_id)),
        subnet: Set(subnet.map(str::to_string)),
        created_at: Set(start_time()),
    }
    .insert(db)
    .await
    .expect("Failed to insert org");
}

pub async fn seed_user(db: &DatabaseConnection, user_id: &str) {
    user::ActiveModel {
        user_id: Set(user_id.to_string()),
        email: Set(format!("{}@example.com", user_id)),
    }
    .insert(db)
    .await
    .expect("Failed to insert user");
}

pub async fn seed_role(db: &DatabaseConnection, org_id: &str, name: &str, is_admin: bool) -> i32 {
    role::ActiveModel {
        org_id: Set(org_id.to_string()),
        name: Set(name.to_string()),
        is_admin: Set(is_admin),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert role")
    .role_id
}

pub async fn add_member(
    db: &DatabaseConnection,
    user_id: &str,
    org_id: &str,
    role_id: i32,
    is_owner: bool,
) {
    user_org::Entity::insert(user_org::ActiveModel {
        user_id: Set(user_id.to_string()),
        org_id: Set(org_id.to_string()),
        role_id: Set(role_id),
        is_owner: Set(is_owner),
    })
    .exec_without_returning(db)
    .await
    .expect("Failed to insert membership");
}

pub struct NodeSpec<'a> {
    pub name: &'a str,
    pub address: &'a str,
    pub max_connections: Option<i32>,
    pub node_type: ExitNodeType,
    pub online: bool,
    pub last_ping: Option<i64>,
}

impl<'a> NodeSpec<'a> {
    pub fn remote(name: &'a str, address: &'a str) -> Self {
        Self {
            name,
            address,
            max_connections: None,
            node_type: ExitNodeType::RemoteExitNode,
            online: true,
            last_ping: None,
        }
    }

    pub fn gerbil(name: &'a str, address: &'a str) -> Self {
        Self {
            node_type: ExitNodeType::Gerbil,
            ..Self::remote(name, address)
        }
    }

    pub fn max(mut self, max: i32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn pinged_at(mut self, unix_secs: i64) -> Self {
        self.last_ping = Some(unix_secs);
        self
    }
}

/// Insert an exit node and link it to `org_id`
pub async fn seed_exit_node(
    db: &DatabaseConnection,
    org_id: &str,
    spec: NodeSpec<'_>,
) -> exit_node::Model {
    let node = exit_node::ActiveModel {
        name: Set(spec.name.to_string()),
        address: Set(spec.address.to_string()),
        endpoint: Set(format!("{}.example.com:51820", spec.name)),
        public_key: Set(format!("{}-pub", spec.name)),
        listen_port: Set(51820),
        reachable_at: Set(None),
        max_connections: Set(spec.max_connections),
        online: Set(spec.online),
        last_ping: Set(spec.last_ping),
        node_type: Set(spec.node_type),
        region: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert exit node");

    exit_node_org::Entity::insert(exit_node_org::ActiveModel {
        exit_node_id: Set(node.exit_node_id),
        org_id: Set(org_id.to_string()),
    })
    .exec_without_returning(db)
    .await
    .expect("Failed to link exit node");

    node
}

pub async fn seed_site(
    db: &DatabaseConnection,
    org_id: &str,
    nice_id: &str,
    exit_node_id: Option<i32>,
    subnet: Option<&str>,
    online: bool,
) -> site::Model {
    site::ActiveModel {
        org_id: Set(org_id.to_string()),
        nice_id: Set(nice_id.to_string()),
        name: Set(nice_id.to_string()),
        pub_key: Set(Some(format!("{}-pub", nice_id))),
        subnet: Set(subnet.map(str::to_string)),
        address: Set(None),
        exit_node_id: Set(exit_node_id),
        online: Set(online),
        last_ping: Set(None),
        last_bandwidth_update: Set(None),
        bytes_in: Set(0),
        bytes_out: Set(0),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert site")
}

pub async fn seed_site_resource(
    db: &DatabaseConnection,
    site: &site::Model,
    name: &str,
    port: i32,
) -> i32 {
    site_resource::ActiveModel {
        site_id: Set(site.site_id),
        org_id: Set(site.org_id.clone()),
        name: Set(name.to_string()),
        destination: Set(format!("{}.internal", name)),
        destination_port: Set(Some(port)),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert site resource")
    .site_resource_id
}

pub async fn seed_resource(db: &DatabaseConnection, org_id: &str, name: &str) -> i32 {
    resource::ActiveModel {
        org_id: Set(org_id.to_string()),
        name: Set(name.to_string()),
        full_domain: Set(Some(format!("{}.example.com", name))),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert resource")
    .resource_id
}

pub async fn seed_client(
    db: &DatabaseConnection,
    org_id: &str,
    user_id: Option<&str>,
    address: &str,
    pub_key: &str,
) -> client::Model {
    client::ActiveModel {
        org_id: Set(org_id.to_string()),
        user_id: Set(user_id.map(str::to_string)),
        name: Set(pub_key.to_string()),
        pub_key: Set(Some(pub_key.to_string())),
        address: Set(address.to_string()),
        online: Set(false),
        last_ping: Set(None),
        last_bandwidth_update: Set(None),
        bytes_in: Set(0),
        bytes_out: Set(0),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert client")
}

pub async fn reload_site(db: &DatabaseConnection, site_id: i32) -> site::Model {
    site::Entity::find_by_id(site_id)
        .one(db)
        .await
        .expect("Failed to load site")
        .expect("Site missing")
}

pub async fn reload_client(db: &DatabaseConnection, client_id: i32) -> client::Model {
    client::Entity::find_by_id(client_id)
        .one(db)
        .await
        .expect("Failed to load client")
        .expect("Client missing")
}

pub async fn reload_exit_node(db: &DatabaseConnection, exit_node_id: i32) -> exit_node::Model {
    exit_node::Entity::find_by_id(exit_node_id)
        .one(db)
        .await
        .expect("Failed to load exit node")
        .expect("Exit node missing")
}
