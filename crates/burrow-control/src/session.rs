//! Agent credentials and bearer sessions
//!
//! Agents (Newt, Olm, remote exit nodes) exchange their id and secret for a
//! random bearer token. Only the SHA-256 digest of a token is stored; it is
//! the session's primary key.
//!
//! Sessions slide: a validation after more than half the TTL has elapsed
//! pushes the expiry a full TTL past "now". An expired session is deleted the
//! first time it is presented.

use std::sync::Arc;

use burrow_auth::{generate_id, generate_session_token, hash_secret, hash_token, verify_secret};
use burrow_db::entities::{
    agent::{self, AgentType},
    agent_session,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::chrono_duration;
use crate::error::{ControlError, ControlResult};

/// Length of generated agent ids
pub const AGENT_ID_LENGTH: usize = 15;
/// Length of generated agent secrets
pub const AGENT_SECRET_LENGTH: usize = 48;

/// What an agent speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentBinding {
    Site(i32),
    Client(i32),
    ExitNode(i32),
}

impl AgentBinding {
    pub fn agent_type(&self) -> AgentType {
        match self {
            AgentBinding::Site(_) => AgentType::Newt,
            AgentBinding::Client(_) => AgentType::Olm,
            AgentBinding::ExitNode(_) => AgentType::RemoteExitNode,
        }
    }
}

/// Clear-text agent credentials; only the secret's hash is ever stored
#[derive(Debug, Clone)]
pub struct AgentCredentials {
    pub agent_id: String,
    pub secret: String,
}

impl AgentCredentials {
    pub fn generate() -> Self {
        Self {
            agent_id: generate_id(AGENT_ID_LENGTH),
            secret: generate_id(AGENT_SECRET_LENGTH),
        }
    }
}

/// Bearer token handed to an agent
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// An agent whose session token checked out
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedAgent {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub site_id: Option<i32>,
    pub client_id: Option<i32>,
    pub exit_node_id: Option<i32>,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthenticatedAgent {
    fn from_parts(agent: agent::Model, session: agent_session::Model) -> Self {
        Self {
            agent_id: agent.agent_id,
            agent_type: agent.agent_type,
            site_id: agent.site_id,
            client_id: agent.client_id,
            exit_node_id: agent.exit_node_id,
            session_id: session.session_id,
            expires_at: session.expires_at,
        }
    }
}

/// Insert an agent bound to `binding` with the given credentials
pub(crate) async fn insert_agent<C: ConnectionTrait>(
    conn: &C,
    binding: AgentBinding,
    credentials: AgentCredentials,
    now: DateTime<Utc>,
) -> ControlResult<AgentCredentials> {
    if credentials.agent_id.is_empty() || credentials.secret.is_empty() {
        return Err(ControlError::InvalidInput(
            "agent id and secret must not be empty".to_string(),
        ));
    }
    if agent::Entity::find_by_id(credentials.agent_id.clone())
        .one(conn)
        .await?
        .is_some()
    {
        return Err(ControlError::Conflict(format!(
            "agent {} already exists",
            credentials.agent_id
        )));
    }
    let secret_hash = hash_secret(&credentials.secret)?;

    let (site_id, client_id, exit_node_id) = match binding {
        AgentBinding::Site(id) => (Some(id), None, None),
        AgentBinding::Client(id) => (None, Some(id), None),
        AgentBinding::ExitNode(id) => (None, None, Some(id)),
    };

    agent::ActiveModel {
        agent_id: Set(credentials.agent_id.clone()),
        agent_type: Set(binding.agent_type()),
        secret_hash: Set(secret_hash),
        site_id: Set(site_id),
        client_id: Set(client_id),
        exit_node_id: Set(exit_node_id),
        created_at: Set(now),
    }
    .insert(conn)
    .await?;

    Ok(credentials)
}

pub(crate) async fn agent_for_site<C: ConnectionTrait>(
    conn: &C,
    site_id: i32,
) -> ControlResult<Option<agent::Model>> {
    Ok(agent::Entity::find()
        .filter(agent::Column::SiteId.eq(site_id))
        .one(conn)
        .await?)
}

pub(crate) async fn agent_for_client<C: ConnectionTrait>(
    conn: &C,
    client_id: i32,
) -> ControlResult<Option<agent::Model>> {
    Ok(agent::Entity::find()
        .filter(agent::Column::ClientId.eq(client_id))
        .one(conn)
        .await?)
}

pub(crate) async fn agent_for_exit_node<C: ConnectionTrait>(
    conn: &C,
    exit_node_id: i32,
) -> ControlResult<Option<agent::Model>> {
    Ok(agent::Entity::find()
        .filter(agent::Column::ExitNodeId.eq(exit_node_id))
        .one(conn)
        .await?)
}

/// Issues, validates and revokes agent sessions
pub struct SessionManager {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl SessionManager {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>, ttl: std::time::Duration) -> Self {
        Self {
            db,
            clock,
            ttl: chrono_duration(ttl),
        }
    }

    /// Create an agent bound to an existing site, client or exit node
    pub async fn register_agent(&self, binding: AgentBinding) -> ControlResult<AgentCredentials> {
        let credentials = insert_agent(
            &self.db,
            binding,
            AgentCredentials::generate(),
            self.clock.now(),
        )
        .await?;
        info!(agent_id = %credentials.agent_id, ?binding, "Registered agent");
        Ok(credentials)
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> ControlResult<DateTime<Utc>> {
        now.checked_add_signed(self.ttl).ok_or_else(|| {
            ControlError::InvalidInput(format!("session lifetime {} is out of range", self.ttl))
        })
    }

    /// Store a session for `token`, keyed by its hash
    pub async fn create_session(
        &self,
        token: &str,
        agent_id: &str,
    ) -> ControlResult<agent_session::Model> {
        let now = self.clock.now();
        let session = agent_session::ActiveModel {
            session_id: Set(hash_token(token)),
            agent_id: Set(agent_id.to_string()),
            expires_at: Set(self.expiry_from(now)?),
            created_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        debug!(agent_id, expires_at = %session.expires_at, "Created agent session");
        Ok(session)
    }

    /// Exchange an agent id and secret for a fresh bearer token
    pub async fn issue_token(&self, agent_id: &str, secret: &str) -> ControlResult<IssuedToken> {
        let agent = agent::Entity::find_by_id(agent_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::Unauthorized("invalid agent credentials".to_string()))?;

        let secret = secret.to_string();
        let hash = agent.secret_hash.clone();
        let valid = tokio::task::spawn_blocking(move || verify_secret(&secret, &hash))
            .await
            .map_err(|e| ControlError::Internal(format!("secret verification task failed: {}", e)))??;

        if !valid {
            debug!(agent_id, "Rejected agent secret");
            return Err(ControlError::Unauthorized(
                "invalid agent credentials".to_string(),
            ));
        }

        let token = generate_session_token();
        let session = self.create_session(&token, &agent.agent_id).await?;

        info!(agent_id, agent_type = ?agent.agent_type, "Issued agent session");
        Ok(IssuedToken {
            token,
            expires_at: session.expires_at,
        })
    }

    /// Look up the session for `token`, renewing or deleting it as time dictates
    ///
    /// Returns `None` for unknown or expired tokens.
    pub async fn validate_session_token(
        &self,
        token: &str,
    ) -> ControlResult<Option<(agent_session::Model, agent::Model)>> {
        let session_id = hash_token(token);
        let found = agent_session::Entity::find_by_id(session_id.clone())
            .find_also_related(agent::Entity)
            .one(&self.db)
            .await?;

        let (session, agent) = match found {
            Some((session, Some(agent))) => (session, agent),
            Some((_, None)) | None => return Ok(None),
        };

        let now = self.clock.now();
        if now >= session.expires_at {
            agent_session::Entity::delete_by_id(session_id)
                .exec(&self.db)
                .await?;
            debug!(agent_id = %agent.agent_id, "Deleted expired session");
            return Ok(None);
        }

        let renew_after = session.expires_at - self.ttl / 2;
        if now >= renew_after {
            let mut active: agent_session::ActiveModel = session.into();
            active.expires_at = Set(self.expiry_from(now)?);
            let renewed = active.update(&self.db).await?;
            debug!(agent_id = %agent.agent_id, expires_at = %renewed.expires_at, "Renewed session");
            return Ok(Some((renewed, agent)));
        }

        Ok(Some((session, agent)))
    }

    /// Resolve a bearer token to its agent, or fail with `Unauthorized`
    pub async fn authenticate(&self, token: &str) -> ControlResult<AuthenticatedAgent> {
        match self.validate_session_token(token).await? {
            Some((session, agent)) => Ok(AuthenticatedAgent::from_parts(agent, session)),
            None => Err(ControlError::Unauthorized(
                "invalid or expired session token".to_string(),
            )),
        }
    }

    pub async fn invalidate_session(&self, session_id: &str) -> ControlResult<()> {
        agent_session::Entity::delete_by_id(session_id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Drop every session held by `agent_id`, returning how many were removed
    pub async fn invalidate_all_sessions(&self, agent_id: &str) -> ControlResult<u64> {
        let result = agent_session::Entity::delete_many()
            .filter(agent_session::Column::AgentId.eq(agent_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            info!(agent_id, sessions = result.rows_affected, "Invalidated agent sessions");
        }
        Ok(result.rows_affected)
    }
}
