//! Integration tests for burrow-db
//!
//! Runs the schema against a real SQLite in-memory database

use burrow_db::entities::{
    client,
    exit_node::{self, ExitNodeType},
    grants::role_site_resource,
    org, org_address, role, site, site_resource,
};
use burrow_db::{connect, migrate};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Set,
};

async fn setup_test_db() -> sea_orm::DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    db
}

async fn seed_org(db: &sea_orm::DatabaseConnection, org_id: &str) {
    org::ActiveModel {
        org_id: Set(org_id.to_string()),
        name: Set(format!("Org {}", org_id)),
        subnet: Set(Some("100.90.128.0/24".to_string())),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("Failed to insert org");
}

async fn seed_exit_node(db: &sea_orm::DatabaseConnection) -> exit_node::Model {
    exit_node::ActiveModel {
        name: Set("fra-1".to_string()),
        address: Set("100.89.128.1/20".to_string()),
        endpoint: Set("fra.example.com:51820".to_string()),
        public_key: Set("exit-pub".to_string()),
        listen_port: Set(51820),
        reachable_at: Set(None),
        max_connections: Set(Some(10)),
        online: Set(true),
        last_ping: Set(None),
        node_type: Set(ExitNodeType::RemoteExitNode),
        region: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert exit node")
}

fn site_model(org_id: &str, nice_id: &str, exit_node_id: i32, subnet: &str) -> site::ActiveModel {
    site::ActiveModel {
        org_id: Set(org_id.to_string()),
        nice_id: Set(nice_id.to_string()),
        name: Set(nice_id.to_string()),
        pub_key: Set(None),
        subnet: Set(Some(subnet.to_string())),
        address: Set(None),
        exit_node_id: Set(Some(exit_node_id)),
        online: Set(false),
        last_ping: Set(None),
        last_bandwidth_update: Set(None),
        bytes_in: Set(0),
        bytes_out: Set(0),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_database_connection() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let backend = db.get_database_backend();
    assert!(matches!(backend, sea_orm::DatabaseBackend::Sqlite));
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    assert!(migrate(&db).await.is_ok());
    // Running twice is a no-op
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_exit_node_type_roundtrip() {
    let db = setup_test_db().await;
    let node = seed_exit_node(&db).await;

    let loaded = exit_node::Entity::find_by_id(node.exit_node_id)
        .one(&db)
        .await
        .unwrap()
        .expect("exit node should exist");

    assert_eq!(loaded.node_type, ExitNodeType::RemoteExitNode);
    assert_eq!(loaded.max_connections, Some(10));
}

#[tokio::test]
async fn test_unique_subnet_per_exit_node() {
    let db = setup_test_db().await;
    seed_org(&db, "acme").await;
    let node = seed_exit_node(&db).await;

    site_model("acme", "first", node.exit_node_id, "100.89.128.4/30")
        .insert(&db)
        .await
        .expect("first site should insert");

    let duplicate = site_model("acme", "second", node.exit_node_id, "100.89.128.4/30")
        .insert(&db)
        .await;

    let err = duplicate.expect_err("same subnet on the same exit node must be rejected");
    assert!(matches!(
        err.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    ));
}

#[tokio::test]
async fn test_duplicate_grant_is_rejected() {
    let db = setup_test_db().await;
    seed_org(&db, "acme").await;
    let node = seed_exit_node(&db).await;

    let site = site_model("acme", "office", node.exit_node_id, "100.89.128.4/30")
        .insert(&db)
        .await
        .unwrap();

    let resource = site_resource::ActiveModel {
        site_id: Set(site.site_id),
        org_id: Set("acme".to_string()),
        name: Set("db".to_string()),
        destination: Set("10.0.0.5".to_string()),
        destination_port: Set(Some(5432)),
        ..Default::default()
    }
    .insert(&db)
    .await
    .unwrap();

    let role = role::ActiveModel {
        org_id: Set("acme".to_string()),
        name: Set("Member".to_string()),
        is_admin: Set(false),
        ..Default::default()
    }
    .insert(&db)
    .await
    .unwrap();

    let grant = role_site_resource::ActiveModel {
        role_id: Set(role.role_id),
        site_resource_id: Set(resource.site_resource_id),
    };

    role_site_resource::Entity::insert(grant.clone())
        .exec(&db)
        .await
        .expect("first grant should insert");

    let again = role_site_resource::Entity::insert(grant).exec(&db).await;
    assert!(again.is_err());

    let count = role_site_resource::Entity::find()
        .filter(role_site_resource::Column::RoleId.eq(role.role_id))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_site_with_resources_cannot_be_deleted() {
    let db = setup_test_db().await;
    seed_org(&db, "acme").await;
    let node = seed_exit_node(&db).await;

    let site = site_model("acme", "office", node.exit_node_id, "100.89.128.4/30")
        .insert(&db)
        .await
        .unwrap();

    let resource = site_resource::ActiveModel {
        site_id: Set(site.site_id),
        org_id: Set("acme".to_string()),
        name: Set("ssh".to_string()),
        destination: Set("10.0.0.6".to_string()),
        destination_port: Set(Some(22)),
        ..Default::default()
    }
    .insert(&db)
    .await
    .unwrap();

    let deleted = site::Entity::delete_by_id(site.site_id).exec(&db).await;
    assert!(deleted.is_err(), "site with resources must not be deletable");

    assert!(site::Entity::find_by_id(site.site_id)
        .one(&db)
        .await
        .unwrap()
        .is_some());
    let remaining = site_resource::Entity::find_by_id(resource.site_resource_id)
        .one(&db)
        .await
        .unwrap();
    assert_eq!(remaining, Some(resource.clone()));

    // Once the resource is gone the site can go too
    site_resource::Entity::delete_by_id(resource.site_resource_id)
        .exec(&db)
        .await
        .unwrap();
    site::Entity::delete_by_id(site.site_id)
        .exec(&db)
        .await
        .unwrap();
    assert_eq!(site::Entity::find().count(&db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_site_and_client_cannot_share_an_org_address() {
    let db = setup_test_db().await;
    seed_org(&db, "acme").await;
    let node = seed_exit_node(&db).await;

    let site = site_model("acme", "office", node.exit_node_id, "100.89.128.4/30")
        .insert(&db)
        .await
        .unwrap();
    let laptop = client::ActiveModel {
        org_id: Set("acme".to_string()),
        user_id: Set(None),
        name: Set("laptop".to_string()),
        pub_key: Set(None),
        address: Set("100.90.128.1".to_string()),
        online: Set(false),
        last_ping: Set(None),
        last_bandwidth_update: Set(None),
        bytes_in: Set(0),
        bytes_out: Set(0),
        ..Default::default()
    }
    .insert(&db)
    .await
    .unwrap();

    org_address::ActiveModel {
        org_id: Set("acme".to_string()),
        address: Set("100.90.128.1".to_string()),
        site_id: Set(Some(site.site_id)),
        client_id: Set(None),
        ..Default::default()
    }
    .insert(&db)
    .await
    .expect("site reservation should insert");

    let clash = org_address::ActiveModel {
        org_id: Set("acme".to_string()),
        address: Set("100.90.128.1".to_string()),
        site_id: Set(None),
        client_id: Set(Some(laptop.client_id)),
        ..Default::default()
    }
    .insert(&db)
    .await
    .unwrap_err();
    assert!(matches!(
        clash.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    ));

    // The site keeps its reservation when the client goes
    client::Entity::delete_by_id(laptop.client_id)
        .exec(&db)
        .await
        .unwrap();
    let held = org_address::Entity::find()
        .filter(org_address::Column::OrgId.eq("acme"))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].site_id, Some(site.site_id));
}
