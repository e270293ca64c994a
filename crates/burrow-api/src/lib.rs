//! HTTP and WebSocket surface of the burrow control plane
pub mod handlers;
pub mod models;
pub mod ws;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Json, Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::OpenApi;

use burrow_control::{ControlPlane, LocalMessageBus};

/// Application state shared across handlers
pub struct AppState {
    pub control: Arc<ControlPlane>,
    /// Live agent connections; the control plane publishes through the same bus
    pub bus: Arc<LocalMessageBus>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Burrow Control API",
        version = "0.1.0",
        description = "Control plane for sites, clients and exit nodes of a tunnel fleet"
    ),
    paths(
        handlers::health_check,
        handlers::pick_site_defaults,
        handlers::create_site,
        handlers::create_client,
        handlers::issue_agent_token,
        handlers::add_grant,
        handlers::remove_grant,
        handlers::set_resource_roles,
        handlers::set_resource_users,
        handlers::set_site_resource_roles,
        handlers::set_site_resource_users,
        handlers::set_site_resource_clients,
        handlers::get_effective_clients,
        handlers::set_user_role,
        handlers::delete_role,
        handlers::check_access,
        handlers::receive_exit_node_bandwidth,
        handlers::run_sweep,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::HealthResponse,
            models::SiteDefaultsResponse,
            models::CreateSiteRequest,
            models::CreateSiteResponse,
            models::CreateClientRequest,
            models::CreateClientResponse,
            models::AgentTokenRequest,
            models::AgentTokenResponse,
            models::GrantTargetRef,
            models::GranteeRef,
            models::GrantRequest,
            models::SetRoleGrantsRequest,
            models::SetUserGrantsRequest,
            models::SetClientGrantsRequest,
            models::SetUserRoleRequest,
            models::AssociationChanges,
            models::EffectiveClients,
            models::AccessTargetRef,
            models::AccessCheckRequest,
            models::AccessCheckResponse,
            models::UsageReportResponse,
            models::SweepResponse,
            burrow_proto::BandwidthReport,
            burrow_proto::PeerBandwidth,
        )
    ),
    tags(
        (name = "sites", description = "Site provisioning"),
        (name = "clients", description = "Client provisioning"),
        (name = "agents", description = "Agent sessions"),
        (name = "access", description = "Grants and access decisions"),
        (name = "exit-nodes", description = "Exit node reporting"),
        (name = "system", description = "System health and maintenance")
    )
)]
pub struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS (for development)
    pub enable_cors: bool,
    /// Allowed CORS origins (if None, allows all)
    pub cors_origins: Option<Vec<String>>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            enable_cors: false,
            cors_origins: None,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(
        config: ApiServerConfig,
        control: Arc<ControlPlane>,
        bus: Arc<LocalMessageBus>,
    ) -> Self {
        let state = Arc::new(AppState { control, bus });
        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/openapi.json", get(openapi_json))
            .route(
                "/api/orgs/{org_id}/pick-site-defaults",
                get(handlers::pick_site_defaults),
            )
            .route("/api/orgs/{org_id}/sites", post(handlers::create_site))
            .route("/api/orgs/{org_id}/clients", post(handlers::create_client))
            .route(
                "/api/orgs/{org_id}/users/{user_id}/role",
                put(handlers::set_user_role),
            )
            .route("/api/agents/token", post(handlers::issue_agent_token))
            .route("/api/agents/ws", get(ws::agent_ws))
            .route(
                "/api/grants",
                post(handlers::add_grant).delete(handlers::remove_grant),
            )
            .route(
                "/api/resources/{resource_id}/roles",
                put(handlers::set_resource_roles),
            )
            .route(
                "/api/resources/{resource_id}/users",
                put(handlers::set_resource_users),
            )
            .route(
                "/api/site-resources/{site_resource_id}/roles",
                put(handlers::set_site_resource_roles),
            )
            .route(
                "/api/site-resources/{site_resource_id}/users",
                put(handlers::set_site_resource_users),
            )
            .route(
                "/api/site-resources/{site_resource_id}/clients",
                get(handlers::get_effective_clients).put(handlers::set_site_resource_clients),
            )
            .route(
                "/api/roles/{role_id}",
                axum::routing::delete(handlers::delete_role),
            )
            .route("/api/access/check", post(handlers::check_access))
            .route(
                "/api/exit-nodes/receive-bandwidth",
                post(handlers::receive_exit_node_bandwidth),
            )
            .route("/api/sweep", post(handlers::run_sweep))
            .with_state(self.state.clone());

        let mut router = api_router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(self.cors_layer());
        }

        router
    }

    fn cors_layer(&self) -> CorsLayer {
        let origin = match &self.config.cors_origins {
            Some(origins) => AllowOrigin::list(
                origins
                    .iter()
                    .filter_map(|o| HeaderValue::from_str(o).ok())
                    .collect::<Vec<_>>(),
            ),
            None => AllowOrigin::from(Any),
        };

        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_origin(origin)
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
