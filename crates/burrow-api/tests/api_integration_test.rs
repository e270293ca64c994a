//! Integration tests for the HTTP API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use burrow_api::{models::*, ApiServer, ApiServerConfig};
use burrow_control::{ControlConfig, ControlPlane, LocalMessageBus};
use burrow_db::entities::{
    client,
    exit_node::{self, ExitNodeType},
    exit_node_org, org, role, site, site_resource, user, user_org,
};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // For `oneshot` method

const ORG: &str = "acme";

/// Helper to create an in-memory database with migrations applied
async fn create_test_db() -> DatabaseConnection {
    let db = burrow_db::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    burrow_db::migrate(&db)
        .await
        .expect("Failed to run migrations");
    db
}

/// Helper to create a test router over a fresh control plane
fn create_test_router(db: DatabaseConnection) -> Router {
    let bus = Arc::new(LocalMessageBus::new());
    let control = ControlPlane::new(db, ControlConfig::default(), bus.clone())
        .expect("Failed to build control plane");
    let config = ApiServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        enable_cors: true,
        cors_origins: None,
    };

    ApiServer::new(config, Arc::new(control), bus).build_router()
}

async fn seed_org(db: &DatabaseConnection) {
    org::ActiveModel {
        org_id: Set(ORG.to_string()),
        name: Set("Acme".to_string()),
        subnet: Set(Some("100.90.128.0/24".to_string())),
        created_at: Set(chrono::Utc::now()),
    }
    .insert(db)
    .await
    .unwrap();
}

async fn seed_exit_node(db: &DatabaseConnection) -> exit_node::Model {
    let node = exit_node::ActiveModel {
        name: Set("fra".to_string()),
        address: Set("100.89.128.1/24".to_string()),
        endpoint: Set("fra.example.com:51820".to_string()),
        public_key: Set("fra-pub".to_string()),
        listen_port: Set(51820),
        reachable_at: Set(None),
        max_connections: Set(None),
        online: Set(true),
        last_ping: Set(None),
        node_type: Set(ExitNodeType::RemoteExitNode),
        region: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap();

    exit_node_org::Entity::insert(exit_node_org::ActiveModel {
        exit_node_id: Set(node.exit_node_id),
        org_id: Set(ORG.to_string()),
    })
    .exec_without_returning(db)
    .await
    .unwrap();

    node
}

async fn seed_role(db: &DatabaseConnection, name: &str, is_admin: bool) -> i32 {
    role::ActiveModel {
        org_id: Set(ORG.to_string()),
        name: Set(name.to_string()),
        is_admin: Set(is_admin),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
    .role_id
}

async fn seed_member(db: &DatabaseConnection, user_id: &str, role_id: i32, is_owner: bool) {
    user::ActiveModel {
        user_id: Set(user_id.to_string()),
        email: Set(format!("{}@example.com", user_id)),
    }
    .insert(db)
    .await
    .unwrap();

    user_org::Entity::insert(user_org::ActiveModel {
        user_id: Set(user_id.to_string()),
        org_id: Set(ORG.to_string()),
        role_id: Set(role_id),
        is_owner: Set(is_owner),
    })
    .exec_without_returning(db)
    .await
    .unwrap();
}

async fn seed_site_resource(db: &DatabaseConnection, site_id: i32) -> i32 {
    site_resource::ActiveModel {
        site_id: Set(site_id),
        org_id: Set(ORG.to_string()),
        name: Set("ssh".to_string()),
        destination: Set("ssh.internal".to_string()),
        destination_port: Set(Some(22)),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
    .site_resource_id
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_and_openapi() {
    let app = create_test_router(create_test_db().await);

    let response = app.clone().oneshot(get_request("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: HealthResponse = body_json(response).await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.connected_agents, 0);

    let response = app.oneshot(get_request("/api/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc: Value = body_json(response).await;
    assert!(doc["paths"]["/api/agents/token"].is_object());
}

#[tokio::test]
async fn test_pick_site_defaults() {
    let db = create_test_db().await;
    seed_org(&db).await;
    let node = seed_exit_node(&db).await;
    let app = create_test_router(db);

    let response = app
        .clone()
        .oneshot(get_request("/api/orgs/acme/pick-site-defaults"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = body_json(response).await;
    assert_eq!(body["exitNodeId"], node.exit_node_id);
    assert_eq!(body["subnet"], "100.89.128.4/30");
    assert_eq!(body["clientAddress"], "100.90.128.1");
    assert_eq!(body["listenPort"], 51820);
    assert!(body["newtSecret"].as_str().is_some_and(|s| !s.is_empty()));

    let response = app
        .oneshot(get_request("/api/orgs/nobody/pick-site-defaults"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("NOT_FOUND"));
}

#[tokio::test]
async fn test_no_exit_node_is_service_unavailable() {
    let db = create_test_db().await;
    seed_org(&db).await;
    let app = create_test_router(db);

    let response = app
        .oneshot(get_request("/api/orgs/acme/pick-site-defaults"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("CAPACITY_EXHAUSTED"));
}

#[tokio::test]
async fn test_create_site_then_exchange_token() {
    let db = create_test_db().await;
    seed_org(&db).await;
    seed_exit_node(&db).await;
    let app = create_test_router(db);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/orgs/acme/sites",
            json!({ "name": "HQ", "niceId": "hq" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let site: CreateSiteResponse = body_json(response).await;
    assert_eq!(site.nice_id, "hq");
    assert_eq!(site.subnet.as_deref(), Some("100.89.128.4/30"));

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/orgs/acme/sites",
            json!({ "name": "HQ again", "niceId": "hq" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/agents/token",
            json!({ "agentId": site.newt_id, "secret": site.newt_secret }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let token: AgentTokenResponse = body_json(response).await;
    assert!(!token.token.is_empty());

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/agents/token",
            json!({ "agentId": site.newt_id, "secret": "wrong" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("UNAUTHORIZED"));
}

#[tokio::test]
async fn test_grants_drive_access_and_effective_clients() {
    let db = create_test_db().await;
    seed_org(&db).await;
    seed_exit_node(&db).await;
    let admin = seed_role(&db, "Admin", true).await;
    let member = seed_role(&db, "Member", false).await;
    seed_member(&db, "alice", admin, true).await;
    seed_member(&db, "bob", member, false).await;
    let app = create_test_router(db.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/orgs/acme/sites",
            json!({ "name": "HQ" }),
        ))
        .await
        .unwrap();
    let created: CreateSiteResponse = body_json(response).await;
    let ssh = seed_site_resource(&db, created.site_id).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/orgs/acme/clients",
            json!({ "name": "bob laptop", "userId": "bob", "publicKey": "bob-key" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let laptop: CreateClientResponse = body_json(response).await;

    let check = json!({ "userId": "bob", "target": { "type": "siteResource", "id": ssh } });
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/access/check", check.clone()))
        .await
        .unwrap();
    let decision: AccessCheckResponse = body_json(response).await;
    assert!(!decision.allowed);

    // Admin roles never appear in grant lists
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/grants",
            json!({
                "target": { "type": "siteResource", "id": ssh },
                "grantee": { "type": "role", "id": admin }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("INVALID_INPUT"));

    let grant = json!({
        "target": { "type": "siteResource", "id": ssh },
        "grantee": { "type": "role", "id": member }
    });
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/grants", grant.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let changes: AssociationChanges = body_json(response).await;
    assert_eq!(changes.targets_added, 1);
    assert_eq!(changes.peers_added, 1);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/grants", grant.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/access/check", check.clone()))
        .await
        .unwrap();
    let decision: AccessCheckResponse = body_json(response).await;
    assert!(decision.allowed);

    let response = app
        .clone()
        .oneshot(get_request(&format!("/api/site-resources/{}/clients", ssh)))
        .await
        .unwrap();
    let effective: EffectiveClients = body_json(response).await;
    assert_eq!(effective.client_ids, vec![laptop.client_id]);

    let response = app
        .clone()
        .oneshot(json_request("DELETE", "/api/grants", grant))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let changes: AssociationChanges = body_json(response).await;
    assert_eq!(changes.targets_removed, 1);
    assert_eq!(changes.peers_removed, 1);

    // Owners keep their role
    let response = app
        .oneshot(json_request(
            "PUT",
            "/api/orgs/acme/users/alice/role",
            json!({ "roleId": member }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_exit_node_bandwidth_updates_sites() {
    let db = create_test_db().await;
    seed_org(&db).await;
    seed_exit_node(&db).await;
    let app = create_test_router(db.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/orgs/acme/sites",
            json!({ "name": "HQ" }),
        ))
        .await
        .unwrap();
    let created: CreateSiteResponse = body_json(response).await;

    let mut active: site::ActiveModel = site::Entity::find_by_id(created.site_id)
        .one(&db)
        .await
        .unwrap()
        .unwrap()
        .into();
    active.pub_key = Set(Some("hq-key".to_string()));
    active.update(&db).await.unwrap();

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/exit-nodes/receive-bandwidth",
            json!({
                "bandwidthData": [
                    { "publicKey": "hq-key", "bytesIn": 300, "bytesOut": 200 },
                    { "publicKey": "unknown", "bytesIn": 1, "bytesOut": 1 }
                ]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary: UsageReportResponse = body_json(response).await;
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.skipped, 1);

    let reloaded = site::Entity::find_by_id(created.site_id)
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.online);
    assert_eq!(reloaded.bytes_in, 300);
    assert_eq!(reloaded.bytes_out, 200);

    // Clients are untouched by site usage
    assert!(client::Entity::find().all(&db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_agent_ws_requires_upgrade() {
    let app = create_test_router(create_test_db().await);

    let response = app.oneshot(get_request("/api/agents/ws")).await.unwrap();
    assert!(response.status().is_client_error());
}
