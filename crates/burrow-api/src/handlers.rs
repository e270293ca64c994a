use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use burrow_control::{ControlError, GrantTarget, NewClient, NewSite};
use burrow_proto::BandwidthReport;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::models::*;
use crate::AppState;

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a control-plane failure onto an HTTP status with a stable code
pub(crate) fn api_error(err: ControlError) -> ApiError {
    let status = match &err {
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::Conflict(_) => StatusCode::CONFLICT,
        ControlError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ControlError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ControlError::Forbidden(_) => StatusCode::FORBIDDEN,
        ControlError::CapacityExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::Unavailable(_) | ControlError::ExitNode(_) => StatusCode::BAD_GATEWAY,
        ControlError::Transient(_) | ControlError::Database(_) | ControlError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status.is_server_error() {
        error!(code = err.code(), "Request failed: {}", err);
    } else {
        debug!(code = err.code(), "Request rejected: {}", err);
    }

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: Some(err.code().to_string()),
        }),
    )
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_agents: state.bus.connected_agents().await.len(),
    })
}

/// Bootstrap values for a new site, without creating it
#[utoipa::path(
    get,
    path = "/api/orgs/{org_id}/pick-site-defaults",
    params(
        ("org_id" = String, Path, description = "Organization ID")
    ),
    responses(
        (status = 200, description = "Site defaults", body = SiteDefaultsResponse),
        (status = 404, description = "Organization not found", body = ErrorResponse),
        (status = 503, description = "No exit node or subnet available", body = ErrorResponse)
    ),
    tag = "sites"
)]
pub async fn pick_site_defaults(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
) -> Result<Json<SiteDefaultsResponse>, ApiError> {
    debug!("Picking site defaults for org: {}", org_id);

    let defaults = state
        .control
        .provisioning
        .pick_site_defaults(&org_id)
        .await
        .map_err(api_error)?;

    Ok(Json(defaults.into()))
}

/// Create a site and its Newt agent
#[utoipa::path(
    post,
    path = "/api/orgs/{org_id}/sites",
    params(
        ("org_id" = String, Path, description = "Organization ID")
    ),
    request_body = CreateSiteRequest,
    responses(
        (status = 201, description = "Site created", body = CreateSiteResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Organization or exit node not found", body = ErrorResponse),
        (status = 409, description = "Site id already used", body = ErrorResponse),
        (status = 503, description = "No exit node or subnet available", body = ErrorResponse)
    ),
    tag = "sites"
)]
pub async fn create_site(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
    Json(req): Json<CreateSiteRequest>,
) -> Result<(StatusCode, Json<CreateSiteResponse>), ApiError> {
    let created = state
        .control
        .provisioning
        .create_site(NewSite {
            org_id,
            name: req.name,
            nice_id: req.nice_id,
            exit_node_id: req.exit_node_id,
            newt_id: req.newt_id,
            newt_secret: req.newt_secret,
        })
        .await
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSiteResponse {
            site_id: created.site.site_id,
            nice_id: created.site.nice_id,
            name: created.site.name,
            exit_node_id: created.site.exit_node_id,
            subnet: created.site.subnet,
            address: created.site.address,
            newt_id: created.newt.agent_id,
            newt_secret: created.newt.secret,
        }),
    ))
}

/// Create a client and its Olm agent
#[utoipa::path(
    post,
    path = "/api/orgs/{org_id}/clients",
    params(
        ("org_id" = String, Path, description = "Organization ID")
    ),
    request_body = CreateClientRequest,
    responses(
        (status = 201, description = "Client created", body = CreateClientResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Organization not found", body = ErrorResponse),
        (status = 503, description = "Organization subnet exhausted", body = ErrorResponse)
    ),
    tag = "clients"
)]
pub async fn create_client(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
    Json(req): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<CreateClientResponse>), ApiError> {
    let created = state
        .control
        .provisioning
        .create_client(NewClient {
            org_id,
            name: req.name,
            user_id: req.user_id,
            pub_key: req.public_key,
        })
        .await
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateClientResponse {
            client_id: created.client.client_id,
            name: created.client.name,
            address: created.client.address,
            olm_id: created.olm.agent_id,
            olm_secret: created.olm.secret,
        }),
    ))
}

/// Exchange agent credentials for a session token
#[utoipa::path(
    post,
    path = "/api/agents/token",
    request_body = AgentTokenRequest,
    responses(
        (status = 200, description = "Session token issued", body = AgentTokenResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn issue_agent_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AgentTokenRequest>,
) -> Result<Json<AgentTokenResponse>, ApiError> {
    let issued = state
        .control
        .sessions
        .issue_token(&req.agent_id, &req.secret)
        .await
        .map_err(api_error)?;

    info!(agent_id = %req.agent_id, "Issued agent session token");

    Ok(Json(AgentTokenResponse {
        token: issued.token,
        expires_at: issued.expires_at,
    }))
}

/// Add one grant and rewire affected clients
#[utoipa::path(
    post,
    path = "/api/grants",
    request_body = GrantRequest,
    responses(
        (status = 201, description = "Grant added", body = AssociationChanges),
        (status = 400, description = "Grant not allowed", body = ErrorResponse),
        (status = 404, description = "Target or grantee not found", body = ErrorResponse),
        (status = 409, description = "Grant already exists", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn add_grant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GrantRequest>,
) -> Result<(StatusCode, Json<AssociationChanges>), ApiError> {
    let delta = state
        .control
        .access
        .add_grant(req.target.into(), req.grantee.into())
        .await
        .map_err(api_error)?;

    Ok((StatusCode::CREATED, Json((&delta).into())))
}

/// Remove one grant and rewire affected clients
#[utoipa::path(
    delete,
    path = "/api/grants",
    request_body = GrantRequest,
    responses(
        (status = 200, description = "Grant removed", body = AssociationChanges),
        (status = 400, description = "Grant not allowed", body = ErrorResponse),
        (status = 404, description = "Grant not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn remove_grant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GrantRequest>,
) -> Result<Json<AssociationChanges>, ApiError> {
    let delta = state
        .control
        .access
        .remove_grant(req.target.into(), req.grantee.into())
        .await
        .map_err(api_error)?;

    Ok(Json((&delta).into()))
}

/// Replace the role grants of a resource
#[utoipa::path(
    put,
    path = "/api/resources/{resource_id}/roles",
    params(
        ("resource_id" = i32, Path, description = "Resource ID")
    ),
    request_body = SetRoleGrantsRequest,
    responses(
        (status = 200, description = "Role grants replaced", body = AssociationChanges),
        (status = 400, description = "Admin or foreign role", body = ErrorResponse),
        (status = 404, description = "Resource not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn set_resource_roles(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<i32>,
    Json(req): Json<SetRoleGrantsRequest>,
) -> Result<Json<AssociationChanges>, ApiError> {
    set_roles(&state, GrantTarget::Resource(resource_id), req.role_ids).await
}

/// Replace the user grants of a resource
#[utoipa::path(
    put,
    path = "/api/resources/{resource_id}/users",
    params(
        ("resource_id" = i32, Path, description = "Resource ID")
    ),
    request_body = SetUserGrantsRequest,
    responses(
        (status = 200, description = "User grants replaced", body = AssociationChanges),
        (status = 400, description = "User is not an org member", body = ErrorResponse),
        (status = 404, description = "Resource or user not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn set_resource_users(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<i32>,
    Json(req): Json<SetUserGrantsRequest>,
) -> Result<Json<AssociationChanges>, ApiError> {
    set_users(&state, GrantTarget::Resource(resource_id), req.user_ids).await
}

/// Replace the role grants of a site resource
#[utoipa::path(
    put,
    path = "/api/site-resources/{site_resource_id}/roles",
    params(
        ("site_resource_id" = i32, Path, description = "Site resource ID")
    ),
    request_body = SetRoleGrantsRequest,
    responses(
        (status = 200, description = "Role grants replaced", body = AssociationChanges),
        (status = 400, description = "Admin or foreign role", body = ErrorResponse),
        (status = 404, description = "Site resource not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn set_site_resource_roles(
    State(state): State<Arc<AppState>>,
    Path(site_resource_id): Path<i32>,
    Json(req): Json<SetRoleGrantsRequest>,
) -> Result<Json<AssociationChanges>, ApiError> {
    set_roles(&state, GrantTarget::SiteResource(site_resource_id), req.role_ids).await
}

/// Replace the user grants of a site resource
#[utoipa::path(
    put,
    path = "/api/site-resources/{site_resource_id}/users",
    params(
        ("site_resource_id" = i32, Path, description = "Site resource ID")
    ),
    request_body = SetUserGrantsRequest,
    responses(
        (status = 200, description = "User grants replaced", body = AssociationChanges),
        (status = 400, description = "User is not an org member", body = ErrorResponse),
        (status = 404, description = "Site resource or user not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn set_site_resource_users(
    State(state): State<Arc<AppState>>,
    Path(site_resource_id): Path<i32>,
    Json(req): Json<SetUserGrantsRequest>,
) -> Result<Json<AssociationChanges>, ApiError> {
    set_users(&state, GrantTarget::SiteResource(site_resource_id), req.user_ids).await
}

/// Replace the machine-client grants of a site resource
#[utoipa::path(
    put,
    path = "/api/site-resources/{site_resource_id}/clients",
    params(
        ("site_resource_id" = i32, Path, description = "Site resource ID")
    ),
    request_body = SetClientGrantsRequest,
    responses(
        (status = 200, description = "Client grants replaced", body = AssociationChanges),
        (status = 400, description = "Foreign or user-bound client", body = ErrorResponse),
        (status = 404, description = "Site resource not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn set_site_resource_clients(
    State(state): State<Arc<AppState>>,
    Path(site_resource_id): Path<i32>,
    Json(req): Json<SetClientGrantsRequest>,
) -> Result<Json<AssociationChanges>, ApiError> {
    let delta = state
        .control
        .access
        .set_client_grants(site_resource_id, req.client_ids)
        .await
        .map_err(api_error)?;

    Ok(Json((&delta).into()))
}

/// Clients currently wired to a site resource
#[utoipa::path(
    get,
    path = "/api/site-resources/{site_resource_id}/clients",
    params(
        ("site_resource_id" = i32, Path, description = "Site resource ID")
    ),
    responses(
        (status = 200, description = "Effective client set", body = EffectiveClients)
    ),
    tag = "access"
)]
pub async fn get_effective_clients(
    State(state): State<Arc<AppState>>,
    Path(site_resource_id): Path<i32>,
) -> Result<Json<EffectiveClients>, ApiError> {
    let client_ids = state
        .control
        .access
        .effective_clients(site_resource_id)
        .await
        .map_err(api_error)?;

    Ok(Json(EffectiveClients {
        site_resource_id,
        client_ids,
    }))
}

/// Move a member to another role
#[utoipa::path(
    put,
    path = "/api/orgs/{org_id}/users/{user_id}/role",
    params(
        ("org_id" = String, Path, description = "Organization ID"),
        ("user_id" = String, Path, description = "User ID")
    ),
    request_body = SetUserRoleRequest,
    responses(
        (status = 200, description = "Role changed", body = AssociationChanges),
        (status = 403, description = "Owner role cannot change", body = ErrorResponse),
        (status = 404, description = "Membership or role not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn set_user_role(
    State(state): State<Arc<AppState>>,
    Path((org_id, user_id)): Path<(String, String)>,
    Json(req): Json<SetUserRoleRequest>,
) -> Result<Json<AssociationChanges>, ApiError> {
    let delta = state
        .control
        .access
        .set_user_role(&user_id, &org_id, req.role_id)
        .await
        .map_err(api_error)?;

    Ok(Json((&delta).into()))
}

/// Delete a role, moving its members to a replacement
#[utoipa::path(
    delete,
    path = "/api/roles/{role_id}",
    params(
        ("role_id" = i32, Path, description = "Role ID"),
        ("replacementRoleId" = i32, Query, description = "Role that inherits the members")
    ),
    responses(
        (status = 200, description = "Role deleted", body = AssociationChanges),
        (status = 400, description = "Admin role or invalid replacement", body = ErrorResponse),
        (status = 403, description = "Role is held by an owner", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn delete_role(
    State(state): State<Arc<AppState>>,
    Path(role_id): Path<i32>,
    Query(query): Query<DeleteRoleQuery>,
) -> Result<Json<AssociationChanges>, ApiError> {
    let delta = state
        .control
        .access
        .delete_role(role_id, query.replacement_role_id)
        .await
        .map_err(api_error)?;

    Ok(Json((&delta).into()))
}

/// Decide whether a user may reach a target
#[utoipa::path(
    post,
    path = "/api/access/check",
    request_body = AccessCheckRequest,
    responses(
        (status = 200, description = "Access decision", body = AccessCheckResponse),
        (status = 404, description = "Target not found", body = ErrorResponse)
    ),
    tag = "access"
)]
pub async fn check_access(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccessCheckRequest>,
) -> Result<Json<AccessCheckResponse>, ApiError> {
    let decision = state
        .control
        .access
        .can_access(&req.user_id, req.target.into())
        .await
        .map_err(api_error)?;

    Ok(Json(AccessCheckResponse {
        allowed: decision.is_allowed(),
    }))
}

/// Site peer usage pushed by a local exit node
#[utoipa::path(
    post,
    path = "/api/exit-nodes/receive-bandwidth",
    request_body = BandwidthReport,
    responses(
        (status = 200, description = "Usage applied", body = UsageReportResponse)
    ),
    tag = "exit-nodes"
)]
pub async fn receive_exit_node_bandwidth(
    State(state): State<Arc<AppState>>,
    Json(report): Json<BandwidthReport>,
) -> Json<UsageReportResponse> {
    let summary = state
        .control
        .bandwidth
        .apply_site_usage(report.bandwidth_data)
        .await;

    if summary.failed > 0 {
        warn!(failed = summary.failed, "Some site usage entries could not be applied");
    }

    Json(summary.into())
}

/// Run one offline sweep now
#[utoipa::path(
    post,
    path = "/api/sweep",
    responses(
        (status = 200, description = "Rows demoted", body = SweepResponse),
        (status = 500, description = "Sweep failed", body = ErrorResponse)
    ),
    tag = "system"
)]
pub async fn run_sweep(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepResponse>, ApiError> {
    let report = state
        .control
        .heartbeat
        .demote_stale_agents()
        .await
        .map_err(api_error)?;

    Ok(Json(report.into()))
}

async fn set_roles(
    state: &AppState,
    target: GrantTarget,
    role_ids: Vec<i32>,
) -> Result<Json<AssociationChanges>, ApiError> {
    let delta = state
        .control
        .access
        .set_role_grants(target, role_ids)
        .await
        .map_err(api_error)?;

    Ok(Json((&delta).into()))
}

async fn set_users(
    state: &AppState,
    target: GrantTarget,
    user_ids: Vec<String>,
) -> Result<Json<AssociationChanges>, ApiError> {
    let delta = state
        .control
        .access
        .set_user_grants(target, user_ids)
        .await
        .map_err(api_error)?;

    Ok(Json((&delta).into()))
}
