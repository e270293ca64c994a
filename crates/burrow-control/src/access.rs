//! Access resolution and derived reachability
//!
//! Every permission question goes through [`AccessResolver::can_access`]:
//! admin role first, then the role grant table, then the user grant table.
//! Admin access is implicit and never written to a grant table.
//!
//! Grant mutations rebuild the derived association tables inside the same
//! transaction, so the effective client set of a site resource is always
//!
//! ```text
//! clients of users whose role is granted
//!   ∪ clients of users granted directly
//!   ∪ machine clients granted directly
//! ```
//!
//! Once the transaction commits, the resulting peer and target changes are
//! pushed to the affected Newt and Olm agents.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use burrow_db::entities::{
    associations::{client_site as client_site_assoc, client_site_resource as csr_assoc},
    client, exit_node,
    grants::{
        client_site_resource, role_client, role_resource, role_site, role_site_resource,
        user_client, user_resource, user_site, user_site_resource,
    },
    resource, role, site, site_resource, user, user_org,
};
use burrow_proto::{
    message_types, AgentMessage, NewtPeer, NewtPeerRemove, NewtTargets, OlmPeer, OlmPeerRemove,
};
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::message_bus::MessageBus;
use crate::session::{agent_for_client, agent_for_site};

/// Anything a principal may ask to reach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTarget {
    Resource(i32),
    SiteResource(i32),
    Site(i32),
    Client(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny,
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

/// Targets that carry explicit grant lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantTarget {
    Resource(i32),
    SiteResource(i32),
}

/// Who a grant is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grantee {
    Role(i32),
    User(String),
    /// Machine clients only; site resources only
    Client(i32),
}

/// What changed, from the rebuild's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedEntity {
    SiteResource(i32),
    Client(i32),
    /// Every client of the user inside the org
    User { user_id: String, org_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetChange {
    pub client_id: i32,
    pub site_resource_id: i32,
    pub site_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerChange {
    pub client_id: i32,
    pub site_id: i32,
}

/// Net effect of a rebuild on the association tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationDelta {
    pub targets_added: Vec<TargetChange>,
    pub targets_removed: Vec<TargetChange>,
    pub peers_added: Vec<PeerChange>,
    pub peers_removed: Vec<PeerChange>,
}

impl AssociationDelta {
    pub fn is_empty(&self) -> bool {
        self.targets_added.is_empty()
            && self.targets_removed.is_empty()
            && self.peers_added.is_empty()
            && self.peers_removed.is_empty()
    }

    fn merge(&mut self, other: AssociationDelta) {
        self.targets_added.extend(other.targets_added);
        self.targets_removed.extend(other.targets_removed);
        self.peers_added.extend(other.peers_added);
        self.peers_removed.extend(other.peers_removed);
    }
}

/// Single authority for permission checks and grant mutations
pub struct AccessResolver {
    db: DatabaseConnection,
    bus: Arc<dyn MessageBus>,
}

impl AccessResolver {
    pub fn new(db: DatabaseConnection, bus: Arc<dyn MessageBus>) -> Self {
        Self { db, bus }
    }

    /// Decide whether `user_id` may reach `target`
    pub async fn can_access(
        &self,
        user_id: &str,
        target: AccessTarget,
    ) -> ControlResult<AccessDecision> {
        let org_id = access_target_org(&self.db, target).await?;

        let Some(membership) = membership(&self.db, user_id, &org_id).await? else {
            debug!(user_id, org_id = %org_id, "Principal is not a member of the owning org");
            return Ok(AccessDecision::Deny);
        };

        let role = role::Entity::find_by_id(membership.role_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("role {}", membership.role_id)))?;

        if role.is_admin {
            return Ok(AccessDecision::Allow);
        }

        let role_granted = match target {
            AccessTarget::Resource(id) => role_resource::Entity::find_by_id((role.role_id, id))
                .one(&self.db)
                .await?
                .is_some(),
            AccessTarget::SiteResource(id) => {
                role_site_resource::Entity::find_by_id((role.role_id, id))
                    .one(&self.db)
                    .await?
                    .is_some()
            }
            AccessTarget::Site(id) => role_site::Entity::find_by_id((role.role_id, id))
                .one(&self.db)
                .await?
                .is_some(),
            AccessTarget::Client(id) => role_client::Entity::find_by_id((role.role_id, id))
                .one(&self.db)
                .await?
                .is_some(),
        };
        if role_granted {
            return Ok(AccessDecision::Allow);
        }

        let user_key = user_id.to_string();
        let user_granted = match target {
            AccessTarget::Resource(id) => user_resource::Entity::find_by_id((user_key, id))
                .one(&self.db)
                .await?
                .is_some(),
            AccessTarget::SiteResource(id) => {
                user_site_resource::Entity::find_by_id((user_key, id))
                    .one(&self.db)
                    .await?
                    .is_some()
            }
            AccessTarget::Site(id) => user_site::Entity::find_by_id((user_key, id))
                .one(&self.db)
                .await?
                .is_some(),
            AccessTarget::Client(id) => user_client::Entity::find_by_id((user_key, id))
                .one(&self.db)
                .await?
                .is_some(),
        };

        Ok(if user_granted {
            AccessDecision::Allow
        } else {
            AccessDecision::Deny
        })
    }

    /// Add one grant; a duplicate is a `Conflict`
    pub async fn add_grant(
        &self,
        target: GrantTarget,
        grantee: Grantee,
    ) -> ControlResult<AssociationDelta> {
        let txn = self.db.begin().await?;

        let org_id = grant_target_org(&txn, target).await?;
        validate_grantee(&txn, &org_id, target, &grantee).await?;

        if grant_exists(&txn, target, &grantee).await? {
            return Err(ControlError::Conflict(format!(
                "grant for {:?} on {:?} already exists",
                grantee, target
            )));
        }
        insert_grant(&txn, target, &grantee).await?;

        let delta = rebuild_for_target(&txn, target).await?;
        txn.commit().await?;

        info!(?target, ?grantee, "Added grant");
        self.notify(&delta).await;
        Ok(delta)
    }

    /// Remove one grant; a missing grant is `NotFound`
    pub async fn remove_grant(
        &self,
        target: GrantTarget,
        grantee: Grantee,
    ) -> ControlResult<AssociationDelta> {
        let txn = self.db.begin().await?;

        let org_id = grant_target_org(&txn, target).await?;
        validate_grantee(&txn, &org_id, target, &grantee).await?;

        if !delete_grant(&txn, target, &grantee).await? {
            return Err(ControlError::not_found(format!(
                "grant for {:?} on {:?}",
                grantee, target
            )));
        }

        let delta = rebuild_for_target(&txn, target).await?;
        txn.commit().await?;

        info!(?target, ?grantee, "Removed grant");
        self.notify(&delta).await;
        Ok(delta)
    }

    /// Replace the role grant list of `target`
    pub async fn set_role_grants(
        &self,
        target: GrantTarget,
        role_ids: Vec<i32>,
    ) -> ControlResult<AssociationDelta> {
        let grantees = role_ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(Grantee::Role)
            .collect();
        self.set_grants(target, GranteeKind::Role, grantees).await
    }

    /// Replace the user grant list of `target`
    pub async fn set_user_grants(
        &self,
        target: GrantTarget,
        user_ids: Vec<String>,
    ) -> ControlResult<AssociationDelta> {
        let grantees = user_ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(Grantee::User)
            .collect();
        self.set_grants(target, GranteeKind::User, grantees).await
    }

    /// Replace the machine-client grant list of a site resource
    pub async fn set_client_grants(
        &self,
        site_resource_id: i32,
        client_ids: Vec<i32>,
    ) -> ControlResult<AssociationDelta> {
        let grantees = client_ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(Grantee::Client)
            .collect();
        self.set_grants(
            GrantTarget::SiteResource(site_resource_id),
            GranteeKind::Client,
            grantees,
        )
        .await
    }

    async fn set_grants(
        &self,
        target: GrantTarget,
        kind: GranteeKind,
        grantees: Vec<Grantee>,
    ) -> ControlResult<AssociationDelta> {
        if kind == GranteeKind::Client && matches!(target, GrantTarget::Resource(_)) {
            return Err(ControlError::InvalidInput(
                "client grants apply only to site resources".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let org_id = grant_target_org(&txn, target).await?;
        for grantee in &grantees {
            validate_grantee(&txn, &org_id, target, grantee).await?;
        }

        clear_grants(&txn, target, kind).await?;
        for grantee in &grantees {
            insert_grant(&txn, target, grantee).await?;
        }

        let delta = rebuild_for_target(&txn, target).await?;
        txn.commit().await?;

        info!(?target, ?kind, count = grantees.len(), "Replaced grants");
        self.notify(&delta).await;
        Ok(delta)
    }

    /// Move a member to another role in the same org
    ///
    /// Owner memberships are immutable here.
    pub async fn set_user_role(
        &self,
        user_id: &str,
        org_id: &str,
        role_id: i32,
    ) -> ControlResult<AssociationDelta> {
        let txn = self.db.begin().await?;

        let current = membership(&txn, user_id, org_id).await?.ok_or_else(|| {
            ControlError::not_found(format!("membership of {} in {}", user_id, org_id))
        })?;
        if current.is_owner {
            return Err(ControlError::Forbidden(
                "owner role cannot change".to_string(),
            ));
        }
        require_role_in_org(&txn, role_id, org_id).await?;

        user_org::Entity::update_many()
            .col_expr(user_org::Column::RoleId, Expr::value(role_id))
            .filter(user_org::Column::UserId.eq(user_id))
            .filter(user_org::Column::OrgId.eq(org_id))
            .exec(&txn)
            .await?;

        let delta = rebuild_in(
            &txn,
            &ChangedEntity::User {
                user_id: user_id.to_string(),
                org_id: org_id.to_string(),
            },
        )
        .await?;
        txn.commit().await?;

        info!(user_id, org_id, role_id, "Changed user role");
        self.notify(&delta).await;
        Ok(delta)
    }

    /// Delete a role, moving its members to `replacement_role_id`
    pub async fn delete_role(
        &self,
        role_id: i32,
        replacement_role_id: i32,
    ) -> ControlResult<AssociationDelta> {
        let txn = self.db.begin().await?;

        let doomed = role::Entity::find_by_id(role_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("role {}", role_id)))?;
        if doomed.is_admin {
            return Err(ControlError::InvalidInput(
                "cannot delete an admin role".to_string(),
            ));
        }
        if replacement_role_id == role_id {
            return Err(ControlError::InvalidInput(
                "replacement role must differ from the deleted role".to_string(),
            ));
        }
        require_role_in_org(&txn, replacement_role_id, &doomed.org_id).await?;

        let members = user_org::Entity::find()
            .filter(user_org::Column::RoleId.eq(role_id))
            .all(&txn)
            .await?;
        if members.iter().any(|m| m.is_owner) {
            return Err(ControlError::Forbidden(
                "role is held by an organization owner".to_string(),
            ));
        }

        user_org::Entity::update_many()
            .col_expr(user_org::Column::RoleId, Expr::value(replacement_role_id))
            .filter(user_org::Column::RoleId.eq(role_id))
            .exec(&txn)
            .await?;

        role_resource::Entity::delete_many()
            .filter(role_resource::Column::RoleId.eq(role_id))
            .exec(&txn)
            .await?;
        role_site_resource::Entity::delete_many()
            .filter(role_site_resource::Column::RoleId.eq(role_id))
            .exec(&txn)
            .await?;
        role_site::Entity::delete_many()
            .filter(role_site::Column::RoleId.eq(role_id))
            .exec(&txn)
            .await?;
        role_client::Entity::delete_many()
            .filter(role_client::Column::RoleId.eq(role_id))
            .exec(&txn)
            .await?;
        role::Entity::delete_by_id(role_id).exec(&txn).await?;

        let mut delta = AssociationDelta::default();
        for member in &members {
            delta.merge(
                rebuild_in(
                    &txn,
                    &ChangedEntity::User {
                        user_id: member.user_id.clone(),
                        org_id: member.org_id.clone(),
                    },
                )
                .await?,
            );
        }
        txn.commit().await?;

        info!(
            role_id,
            replacement_role_id,
            members = members.len(),
            "Deleted role"
        );
        self.notify(&delta).await;
        Ok(delta)
    }

    /// Recompute derived associations for `changed` in one transaction and push the result
    ///
    /// Running it twice without a grant change in between yields an empty delta.
    pub async fn rebuild_associations(
        &self,
        changed: ChangedEntity,
    ) -> ControlResult<AssociationDelta> {
        let txn = self.db.begin().await?;
        let delta = rebuild_in(&txn, &changed).await?;
        txn.commit().await?;

        if !delta.is_empty() {
            debug!(?changed, ?delta, "Rebuilt associations");
        }
        self.notify(&delta).await;
        Ok(delta)
    }

    /// Clients currently wired to a site resource
    pub async fn effective_clients(&self, site_resource_id: i32) -> ControlResult<Vec<i32>> {
        let mut ids: Vec<i32> = csr_assoc::Entity::find()
            .select_only()
            .column(csr_assoc::Column::ClientId)
            .filter(csr_assoc::Column::SiteResourceId.eq(site_resource_id))
            .into_tuple()
            .all(&self.db)
            .await?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Push a committed delta to the affected agents
    ///
    /// Delivery problems are logged and never surface to the caller.
    pub async fn notify(&self, delta: &AssociationDelta) {
        if delta.is_empty() {
            return;
        }

        let mut lookup = Lookup::default();

        for change in &delta.peers_added {
            if let Err(e) = self.push_peer_add(&mut lookup, change).await {
                warn!(client_id = change.client_id, site_id = change.site_id, "Failed to push peer add: {}", e);
            }
        }
        for change in &delta.targets_added {
            if let Err(e) = self
                .push_targets(&mut lookup, change, message_types::NEWT_TARGETS_ADD)
                .await
            {
                warn!(client_id = change.client_id, site_resource_id = change.site_resource_id, "Failed to push target add: {}", e);
            }
        }
        for change in &delta.targets_removed {
            if let Err(e) = self
                .push_targets(&mut lookup, change, message_types::NEWT_TARGETS_REMOVE)
                .await
            {
                warn!(client_id = change.client_id, site_resource_id = change.site_resource_id, "Failed to push target removal: {}", e);
            }
        }
        for change in &delta.peers_removed {
            if let Err(e) = self.push_peer_remove(&mut lookup, change).await {
                warn!(client_id = change.client_id, site_id = change.site_id, "Failed to push peer removal: {}", e);
            }
        }
    }

    async fn push_peer_add(&self, lookup: &mut Lookup, change: &PeerChange) -> ControlResult<()> {
        let client = lookup.client(&self.db, change.client_id).await?;
        let site = lookup.site(&self.db, change.site_id).await?;

        if let Some(client_key) = &client.pub_key {
            let peer = NewtPeer {
                public_key: client_key.clone(),
                allowed_ips: vec![format!("{}/32", client.address)],
            };
            self.send_to_site(change.site_id, message_types::NEWT_PEER_ADD, &peer)
                .await?;
        }

        let Some(peer) = olm_peer(&self.db, &site).await? else {
            debug!(site_id = change.site_id, "Site not registered yet, skipping Olm peer add");
            return Ok(());
        };
        self.send_to_client(change.client_id, message_types::OLM_PEER_ADD, &peer)
            .await
    }

    /// Swap a re-keyed client's peer entry on every site it is peered with
    pub async fn push_client_key_change(&self, client: &client::Model, previous_key: Option<&str>) {
        let Some(new_key) = &client.pub_key else {
            return;
        };
        let site_ids = match peered_sites(&self.db, client.client_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(client_id = client.client_id, "Failed to load peered sites: {}", e);
                return;
            }
        };

        for site_id in site_ids {
            if let Some(old_key) = previous_key {
                let removal = NewtPeerRemove {
                    public_key: old_key.to_string(),
                };
                if let Err(e) = self
                    .send_to_site(site_id, message_types::NEWT_PEER_REMOVE, &removal)
                    .await
                {
                    warn!(client_id = client.client_id, site_id, "Failed to push old key removal: {}", e);
                }
            }
            let peer = NewtPeer {
                public_key: new_key.clone(),
                allowed_ips: vec![format!("{}/32", client.address)],
            };
            if let Err(e) = self
                .send_to_site(site_id, message_types::NEWT_PEER_ADD, &peer)
                .await
            {
                warn!(client_id = client.client_id, site_id, "Failed to push new key: {}", e);
            }
        }
    }

    /// Re-announce a site to its peered clients after it moved or changed key
    pub async fn push_site_update(&self, site_id: i32) {
        if let Err(e) = self.announce_site(site_id).await {
            warn!(site_id, "Failed to push site update to clients: {}", e);
        }
    }

    async fn announce_site(&self, site_id: i32) -> ControlResult<()> {
        let Some(site) = site::Entity::find_by_id(site_id).one(&self.db).await? else {
            return Ok(());
        };
        let Some(peer) = olm_peer(&self.db, &site).await? else {
            return Ok(());
        };
        let client_ids: Vec<i32> = client_site_assoc::Entity::find()
            .select_only()
            .column(client_site_assoc::Column::ClientId)
            .filter(client_site_assoc::Column::SiteId.eq(site_id))
            .into_tuple()
            .all(&self.db)
            .await?;
        for client_id in client_ids {
            self.send_to_client(client_id, message_types::OLM_PEER_ADD, &peer)
                .await?;
        }
        Ok(())
    }

    async fn push_peer_remove(
        &self,
        lookup: &mut Lookup,
        change: &PeerChange,
    ) -> ControlResult<()> {
        let client = lookup.client(&self.db, change.client_id).await?;

        if let Some(client_key) = &client.pub_key {
            let removal = NewtPeerRemove {
                public_key: client_key.clone(),
            };
            self.send_to_site(change.site_id, message_types::NEWT_PEER_REMOVE, &removal)
                .await?;
        }

        let removal = OlmPeerRemove {
            site_id: change.site_id,
        };
        self.send_to_client(change.client_id, message_types::OLM_PEER_REMOVE, &removal)
            .await
    }

    async fn push_targets(
        &self,
        lookup: &mut Lookup,
        change: &TargetChange,
        message_type: &str,
    ) -> ControlResult<()> {
        let client = lookup.client(&self.db, change.client_id).await?;
        let Some(client_key) = &client.pub_key else {
            return Ok(());
        };
        let Some(target) = site_resource::Entity::find_by_id(change.site_resource_id)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };

        let targets = NewtTargets {
            public_key: client_key.clone(),
            targets: vec![target.target()],
        };
        self.send_to_site(change.site_id, message_type, &targets).await
    }

    async fn send_to_site<T: Serialize>(
        &self,
        site_id: i32,
        message_type: &str,
        payload: &T,
    ) -> ControlResult<()> {
        let Some(agent) = agent_for_site(&self.db, site_id).await? else {
            return Ok(());
        };
        let message = AgentMessage::new(message_type, payload)?;
        if !self.bus.publish(&agent.agent_id, message).await {
            debug!(site_id, message_type, "Newt not connected");
        }
        Ok(())
    }

    async fn send_to_client<T: Serialize>(
        &self,
        client_id: i32,
        message_type: &str,
        payload: &T,
    ) -> ControlResult<()> {
        let Some(agent) = agent_for_client(&self.db, client_id).await? else {
            return Ok(());
        };
        let message = AgentMessage::new(message_type, payload)?;
        if !self.bus.publish(&agent.agent_id, message).await {
            debug!(client_id, message_type, "Olm not connected");
        }
        Ok(())
    }
}

/// Everything a site's Newt must hold, rebuilt from the derived associations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteWiring {
    pub peers: Vec<NewtPeer>,
    pub targets: Vec<NewtTargets>,
}

/// Peers and per-client targets for a site, ordered by client id
///
/// Clients without a registered key are left out.
pub(crate) async fn site_wiring<C: ConnectionTrait>(
    conn: &C,
    site_id: i32,
) -> ControlResult<SiteWiring> {
    let peered: BTreeSet<i32> = client_site_assoc::Entity::find()
        .select_only()
        .column(client_site_assoc::Column::ClientId)
        .filter(client_site_assoc::Column::SiteId.eq(site_id))
        .into_tuple::<i32>()
        .all(conn)
        .await?
        .into_iter()
        .collect();

    let resource_targets: HashMap<i32, String> = site_resource::Entity::find()
        .filter(site_resource::Column::SiteId.eq(site_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| (r.site_resource_id, r.target()))
        .collect();

    let mut reachable: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    if !resource_targets.is_empty() {
        let rows = csr_assoc::Entity::find()
            .filter(csr_assoc::Column::SiteResourceId.is_in(resource_targets.keys().copied()))
            .all(conn)
            .await?;
        for row in rows {
            if let Some(target) = resource_targets.get(&row.site_resource_id) {
                reachable.entry(row.client_id).or_default().push(target.clone());
            }
        }
    }

    let client_ids: BTreeSet<i32> = peered.iter().chain(reachable.keys()).copied().collect();
    if client_ids.is_empty() {
        return Ok(SiteWiring::default());
    }
    let clients: HashMap<i32, client::Model> = client::Entity::find()
        .filter(client::Column::ClientId.is_in(client_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|c| (c.client_id, c))
        .collect();

    let key_of = |client_id: &i32| {
        clients
            .get(client_id)
            .and_then(|c| c.pub_key.clone().map(|key| (key, c.address.clone())))
    };

    let peers = peered
        .iter()
        .filter_map(|id| key_of(id))
        .map(|(public_key, address)| NewtPeer {
            public_key,
            allowed_ips: vec![format!("{}/32", address)],
        })
        .collect();

    let targets = reachable
        .into_iter()
        .filter_map(|(id, mut targets)| {
            let (public_key, _) = key_of(&id)?;
            targets.sort();
            Some(NewtTargets {
                public_key,
                targets,
            })
        })
        .collect();

    Ok(SiteWiring { peers, targets })
}

/// Sites a client is peered with, as the Olm sees them
pub(crate) async fn client_peers<C: ConnectionTrait>(
    conn: &C,
    client_id: i32,
) -> ControlResult<Vec<OlmPeer>> {
    let site_ids = peered_sites(conn, client_id).await?;
    if site_ids.is_empty() {
        return Ok(Vec::new());
    }

    let sites = site::Entity::find()
        .filter(site::Column::SiteId.is_in(site_ids))
        .order_by_asc(site::Column::SiteId)
        .all(conn)
        .await?;

    let mut peers = Vec::with_capacity(sites.len());
    for site in &sites {
        match olm_peer(conn, site).await? {
            Some(peer) => peers.push(peer),
            None => debug!(site_id = site.site_id, "Site not registered yet, leaving it out"),
        }
    }
    Ok(peers)
}

async fn peered_sites<C: ConnectionTrait>(conn: &C, client_id: i32) -> ControlResult<Vec<i32>> {
    Ok(client_site_assoc::Entity::find()
        .select_only()
        .column(client_site_assoc::Column::SiteId)
        .filter(client_site_assoc::Column::ClientId.eq(client_id))
        .into_tuple()
        .all(conn)
        .await?)
}

/// The Olm view of a site; `None` until the site has a key and an exit node
async fn olm_peer<C: ConnectionTrait>(conn: &C, site: &site::Model) -> ControlResult<Option<OlmPeer>> {
    let (Some(site_key), Some(exit_node_id)) = (&site.pub_key, site.exit_node_id) else {
        return Ok(None);
    };
    let Some(node) = exit_node::Entity::find_by_id(exit_node_id).one(conn).await? else {
        return Ok(None);
    };
    Ok(Some(OlmPeer {
        site_id: site.site_id,
        public_key: site_key.clone(),
        endpoint: node.endpoint,
        server_ip: site.address.clone().or(site.subnet.clone()).unwrap_or_default(),
    }))
}

/// Per-notification cache of rows that several messages need
#[derive(Default)]
struct Lookup {
    clients: HashMap<i32, client::Model>,
    sites: HashMap<i32, site::Model>,
}

impl Lookup {
    async fn client(&mut self, db: &DatabaseConnection, id: i32) -> ControlResult<client::Model> {
        if let Some(found) = self.clients.get(&id) {
            return Ok(found.clone());
        }
        let found = client::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("client {}", id)))?;
        self.clients.insert(id, found.clone());
        Ok(found)
    }

    async fn site(&mut self, db: &DatabaseConnection, id: i32) -> ControlResult<site::Model> {
        if let Some(found) = self.sites.get(&id) {
            return Ok(found.clone());
        }
        let found = site::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("site {}", id)))?;
        self.sites.insert(id, found.clone());
        Ok(found)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GranteeKind {
    Role,
    User,
    Client,
}

async fn membership<C: ConnectionTrait>(
    conn: &C,
    user_id: &str,
    org_id: &str,
) -> ControlResult<Option<user_org::Model>> {
    Ok(
        user_org::Entity::find_by_id((user_id.to_string(), org_id.to_string()))
            .one(conn)
            .await?,
    )
}

async fn require_role_in_org<C: ConnectionTrait>(
    conn: &C,
    role_id: i32,
    org_id: &str,
) -> ControlResult<role::Model> {
    let found = role::Entity::find_by_id(role_id)
        .one(conn)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("role {}", role_id)))?;
    if found.org_id != org_id {
        return Err(ControlError::InvalidInput(format!(
            "role {} does not belong to organization {}",
            role_id, org_id
        )));
    }
    Ok(found)
}

async fn access_target_org<C: ConnectionTrait>(
    conn: &C,
    target: AccessTarget,
) -> ControlResult<String> {
    let org_id = match target {
        AccessTarget::Resource(id) => resource::Entity::find_by_id(id)
            .one(conn)
            .await?
            .map(|r| r.org_id),
        AccessTarget::SiteResource(id) => site_resource::Entity::find_by_id(id)
            .one(conn)
            .await?
            .map(|r| r.org_id),
        AccessTarget::Site(id) => site::Entity::find_by_id(id)
            .one(conn)
            .await?
            .map(|s| s.org_id),
        AccessTarget::Client(id) => client::Entity::find_by_id(id)
            .one(conn)
            .await?
            .map(|c| c.org_id),
    };
    org_id.ok_or_else(|| ControlError::not_found(format!("{:?}", target)))
}

async fn grant_target_org<C: ConnectionTrait>(
    conn: &C,
    target: GrantTarget,
) -> ControlResult<String> {
    match target {
        GrantTarget::Resource(id) => access_target_org(conn, AccessTarget::Resource(id)).await,
        GrantTarget::SiteResource(id) => {
            access_target_org(conn, AccessTarget::SiteResource(id)).await
        }
    }
}

/// Reject grantees that are missing, foreign to the org, admin roles or user-bound clients
async fn validate_grantee<C: ConnectionTrait>(
    conn: &C,
    org_id: &str,
    target: GrantTarget,
    grantee: &Grantee,
) -> ControlResult<()> {
    match grantee {
        Grantee::Role(role_id) => {
            let found = require_role_in_org(conn, *role_id, org_id).await?;
            if found.is_admin {
                return Err(ControlError::InvalidInput(
                    "cannot modify admin-role grants".to_string(),
                ));
            }
        }
        Grantee::User(user_id) => {
            if user::Entity::find_by_id(user_id.clone())
                .one(conn)
                .await?
                .is_none()
            {
                return Err(ControlError::not_found(format!("user {}", user_id)));
            }
            if membership(conn, user_id, org_id).await?.is_none() {
                return Err(ControlError::InvalidInput(format!(
                    "user {} is not a member of organization {}",
                    user_id, org_id
                )));
            }
        }
        Grantee::Client(client_id) => {
            if matches!(target, GrantTarget::Resource(_)) {
                return Err(ControlError::InvalidInput(
                    "client grants apply only to site resources".to_string(),
                ));
            }
            let found = client::Entity::find_by_id(*client_id)
                .one(conn)
                .await?
                .ok_or_else(|| ControlError::not_found(format!("client {}", client_id)))?;
            if found.org_id != org_id {
                return Err(ControlError::InvalidInput(format!(
                    "client {} does not belong to organization {}",
                    client_id, org_id
                )));
            }
            if found.user_id.is_some() {
                return Err(ControlError::InvalidInput(
                    "user-bound clients get access through their user".to_string(),
                ));
            }
        }
    }
    Ok(())
}

async fn grant_exists<C: ConnectionTrait>(
    conn: &C,
    target: GrantTarget,
    grantee: &Grantee,
) -> ControlResult<bool> {
    let found = match (target, grantee) {
        (GrantTarget::Resource(id), Grantee::Role(role_id)) => {
            role_resource::Entity::find_by_id((*role_id, id))
                .one(conn)
                .await?
                .is_some()
        }
        (GrantTarget::Resource(id), Grantee::User(user_id)) => {
            user_resource::Entity::find_by_id((user_id.clone(), id))
                .one(conn)
                .await?
                .is_some()
        }
        (GrantTarget::SiteResource(id), Grantee::Role(role_id)) => {
            role_site_resource::Entity::find_by_id((*role_id, id))
                .one(conn)
                .await?
                .is_some()
        }
        (GrantTarget::SiteResource(id), Grantee::User(user_id)) => {
            user_site_resource::Entity::find_by_id((user_id.clone(), id))
                .one(conn)
                .await?
                .is_some()
        }
        (GrantTarget::SiteResource(id), Grantee::Client(client_id)) => {
            client_site_resource::Entity::find_by_id((*client_id, id))
                .one(conn)
                .await?
                .is_some()
        }
        (GrantTarget::Resource(_), Grantee::Client(_)) => false,
    };
    Ok(found)
}

async fn insert_grant<C: ConnectionTrait>(
    conn: &C,
    target: GrantTarget,
    grantee: &Grantee,
) -> ControlResult<()> {
    match (target, grantee) {
        (GrantTarget::Resource(id), Grantee::Role(role_id)) => {
            role_resource::Entity::insert(role_resource::ActiveModel {
                role_id: Set(*role_id),
                resource_id: Set(id),
            })
            .exec_without_returning(conn)
            .await?;
        }
        (GrantTarget::Resource(id), Grantee::User(user_id)) => {
            user_resource::Entity::insert(user_resource::ActiveModel {
                user_id: Set(user_id.clone()),
                resource_id: Set(id),
            })
            .exec_without_returning(conn)
            .await?;
        }
        (GrantTarget::SiteResource(id), Grantee::Role(role_id)) => {
            role_site_resource::Entity::insert(role_site_resource::ActiveModel {
                role_id: Set(*role_id),
                site_resource_id: Set(id),
            })
            .exec_without_returning(conn)
            .await?;
        }
        (GrantTarget::SiteResource(id), Grantee::User(user_id)) => {
            user_site_resource::Entity::insert(user_site_resource::ActiveModel {
                user_id: Set(user_id.clone()),
                site_resource_id: Set(id),
            })
            .exec_without_returning(conn)
            .await?;
        }
        (GrantTarget::SiteResource(id), Grantee::Client(client_id)) => {
            client_site_resource::Entity::insert(client_site_resource::ActiveModel {
                client_id: Set(*client_id),
                site_resource_id: Set(id),
            })
            .exec_without_returning(conn)
            .await?;
        }
        (GrantTarget::Resource(_), Grantee::Client(_)) => {
            return Err(ControlError::InvalidInput(
                "client grants apply only to site resources".to_string(),
            ));
        }
    }
    Ok(())
}

async fn delete_grant<C: ConnectionTrait>(
    conn: &C,
    target: GrantTarget,
    grantee: &Grantee,
) -> ControlResult<bool> {
    let result = match (target, grantee) {
        (GrantTarget::Resource(id), Grantee::Role(role_id)) => {
            role_resource::Entity::delete_by_id((*role_id, id))
                .exec(conn)
                .await?
        }
        (GrantTarget::Resource(id), Grantee::User(user_id)) => {
            user_resource::Entity::delete_by_id((user_id.clone(), id))
                .exec(conn)
                .await?
        }
        (GrantTarget::SiteResource(id), Grantee::Role(role_id)) => {
            role_site_resource::Entity::delete_by_id((*role_id, id))
                .exec(conn)
                .await?
        }
        (GrantTarget::SiteResource(id), Grantee::User(user_id)) => {
            user_site_resource::Entity::delete_by_id((user_id.clone(), id))
                .exec(conn)
                .await?
        }
        (GrantTarget::SiteResource(id), Grantee::Client(client_id)) => {
            client_site_resource::Entity::delete_by_id((*client_id, id))
                .exec(conn)
                .await?
        }
        (GrantTarget::Resource(_), Grantee::Client(_)) => return Ok(false),
    };
    Ok(result.rows_affected > 0)
}

/// Delete every grant of one kind on `target`
///
/// Admin roles never appear in grant tables, so clearing role grants cannot
/// revoke admin access.
async fn clear_grants<C: ConnectionTrait>(
    conn: &C,
    target: GrantTarget,
    kind: GranteeKind,
) -> ControlResult<()> {
    match (target, kind) {
        (GrantTarget::Resource(id), GranteeKind::Role) => {
            role_resource::Entity::delete_many()
                .filter(role_resource::Column::ResourceId.eq(id))
                .exec(conn)
                .await?;
        }
        (GrantTarget::Resource(id), GranteeKind::User) => {
            user_resource::Entity::delete_many()
                .filter(user_resource::Column::ResourceId.eq(id))
                .exec(conn)
                .await?;
        }
        (GrantTarget::SiteResource(id), GranteeKind::Role) => {
            role_site_resource::Entity::delete_many()
                .filter(role_site_resource::Column::SiteResourceId.eq(id))
                .exec(conn)
                .await?;
        }
        (GrantTarget::SiteResource(id), GranteeKind::User) => {
            user_site_resource::Entity::delete_many()
                .filter(user_site_resource::Column::SiteResourceId.eq(id))
                .exec(conn)
                .await?;
        }
        (GrantTarget::SiteResource(id), GranteeKind::Client) => {
            client_site_resource::Entity::delete_many()
                .filter(client_site_resource::Column::SiteResourceId.eq(id))
                .exec(conn)
                .await?;
        }
        (GrantTarget::Resource(_), GranteeKind::Client) => {}
    }
    Ok(())
}

/// Top-level resources have no derived associations; only site resources rebuild
async fn rebuild_for_target<C: ConnectionTrait>(
    conn: &C,
    target: GrantTarget,
) -> ControlResult<AssociationDelta> {
    match target {
        GrantTarget::Resource(_) => Ok(AssociationDelta::default()),
        GrantTarget::SiteResource(id) => rebuild_in(conn, &ChangedEntity::SiteResource(id)).await,
    }
}

/// Recompute the derived tables for `changed` on an open transaction
pub(crate) async fn rebuild_in<C: ConnectionTrait>(
    conn: &C,
    changed: &ChangedEntity,
) -> ControlResult<AssociationDelta> {
    match changed {
        ChangedEntity::SiteResource(id) => rebuild_site_resource(conn, *id).await,
        ChangedEntity::Client(id) => rebuild_client(conn, *id).await,
        ChangedEntity::User { user_id, org_id } => {
            let client_ids: Vec<i32> = client::Entity::find()
                .select_only()
                .column(client::Column::ClientId)
                .filter(client::Column::UserId.eq(user_id.as_str()))
                .filter(client::Column::OrgId.eq(org_id.as_str()))
                .into_tuple()
                .all(conn)
                .await?;

            let mut delta = AssociationDelta::default();
            for client_id in client_ids {
                delta.merge(rebuild_client(conn, client_id).await?);
            }
            Ok(delta)
        }
    }
}

async fn rebuild_site_resource<C: ConnectionTrait>(
    conn: &C,
    site_resource_id: i32,
) -> ControlResult<AssociationDelta> {
    let target = site_resource::Entity::find_by_id(site_resource_id)
        .one(conn)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("site resource {}", site_resource_id)))?;

    let mut desired: BTreeSet<i32> = client_site_resource::Entity::find()
        .select_only()
        .column(client_site_resource::Column::ClientId)
        .filter(client_site_resource::Column::SiteResourceId.eq(site_resource_id))
        .into_tuple::<i32>()
        .all(conn)
        .await?
        .into_iter()
        .collect();

    let mut users: BTreeSet<String> = user_site_resource::Entity::find()
        .select_only()
        .column(user_site_resource::Column::UserId)
        .filter(user_site_resource::Column::SiteResourceId.eq(site_resource_id))
        .into_tuple::<String>()
        .all(conn)
        .await?
        .into_iter()
        .collect();

    let roles: Vec<i32> = role_site_resource::Entity::find()
        .select_only()
        .column(role_site_resource::Column::RoleId)
        .filter(role_site_resource::Column::SiteResourceId.eq(site_resource_id))
        .into_tuple()
        .all(conn)
        .await?;

    if !roles.is_empty() {
        let role_members: Vec<String> = user_org::Entity::find()
            .select_only()
            .column(user_org::Column::UserId)
            .filter(user_org::Column::OrgId.eq(target.org_id.as_str()))
            .filter(user_org::Column::RoleId.is_in(roles))
            .into_tuple()
            .all(conn)
            .await?;
        users.extend(role_members);
    }

    if !users.is_empty() {
        let user_clients: Vec<i32> = client::Entity::find()
            .select_only()
            .column(client::Column::ClientId)
            .filter(client::Column::OrgId.eq(target.org_id.as_str()))
            .filter(client::Column::UserId.is_in(users))
            .into_tuple()
            .all(conn)
            .await?;
        desired.extend(user_clients);
    }

    let current: BTreeSet<i32> = csr_assoc::Entity::find()
        .select_only()
        .column(csr_assoc::Column::ClientId)
        .filter(csr_assoc::Column::SiteResourceId.eq(site_resource_id))
        .into_tuple::<i32>()
        .all(conn)
        .await?
        .into_iter()
        .collect();

    let added = desired
        .difference(&current)
        .map(|client_id| (*client_id, site_resource_id))
        .collect();
    let removed = current
        .difference(&desired)
        .map(|client_id| (*client_id, site_resource_id))
        .collect();

    apply_pairs(conn, added, removed).await
}

async fn rebuild_client<C: ConnectionTrait>(
    conn: &C,
    client_id: i32,
) -> ControlResult<AssociationDelta> {
    let found = client::Entity::find_by_id(client_id)
        .one(conn)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("client {}", client_id)))?;

    let mut granted: BTreeSet<i32> = client_site_resource::Entity::find()
        .select_only()
        .column(client_site_resource::Column::SiteResourceId)
        .filter(client_site_resource::Column::ClientId.eq(client_id))
        .into_tuple::<i32>()
        .all(conn)
        .await?
        .into_iter()
        .collect();

    if let Some(user_id) = &found.user_id {
        let direct: Vec<i32> = user_site_resource::Entity::find()
            .select_only()
            .column(user_site_resource::Column::SiteResourceId)
            .filter(user_site_resource::Column::UserId.eq(user_id.as_str()))
            .into_tuple()
            .all(conn)
            .await?;
        granted.extend(direct);

        if let Some(member) = membership(conn, user_id, &found.org_id).await? {
            let via_role: Vec<i32> = role_site_resource::Entity::find()
                .select_only()
                .column(role_site_resource::Column::SiteResourceId)
                .filter(role_site_resource::Column::RoleId.eq(member.role_id))
                .into_tuple()
                .all(conn)
                .await?;
            granted.extend(via_role);
        }
    }

    let desired: BTreeSet<i32> = if granted.is_empty() {
        BTreeSet::new()
    } else {
        site_resource::Entity::find()
            .select_only()
            .column(site_resource::Column::SiteResourceId)
            .filter(site_resource::Column::OrgId.eq(found.org_id.as_str()))
            .filter(site_resource::Column::SiteResourceId.is_in(granted))
            .into_tuple::<i32>()
            .all(conn)
            .await?
            .into_iter()
            .collect()
    };

    let current: BTreeSet<i32> = csr_assoc::Entity::find()
        .select_only()
        .column(csr_assoc::Column::SiteResourceId)
        .filter(csr_assoc::Column::ClientId.eq(client_id))
        .into_tuple::<i32>()
        .all(conn)
        .await?
        .into_iter()
        .collect();

    let added = desired
        .difference(&current)
        .map(|sr| (client_id, *sr))
        .collect();
    let removed = current
        .difference(&desired)
        .map(|sr| (client_id, *sr))
        .collect();

    apply_pairs(conn, added, removed).await
}

/// Write `(client_id, site_resource_id)` changes and bring client-site peering in line
async fn apply_pairs<C: ConnectionTrait>(
    conn: &C,
    added: Vec<(i32, i32)>,
    removed: Vec<(i32, i32)>,
) -> ControlResult<AssociationDelta> {
    let mut delta = AssociationDelta::default();
    if added.is_empty() && removed.is_empty() {
        return Ok(delta);
    }

    if !added.is_empty() {
        csr_assoc::Entity::insert_many(added.iter().map(|(client_id, sr)| {
            csr_assoc::ActiveModel {
                client_id: Set(*client_id),
                site_resource_id: Set(*sr),
            }
        }))
        .exec_without_returning(conn)
        .await?;
    }
    for (client_id, sr) in &removed {
        csr_assoc::Entity::delete_by_id((*client_id, *sr))
            .exec(conn)
            .await?;
    }

    let touched: BTreeSet<i32> = added.iter().chain(removed.iter()).map(|(_, sr)| *sr).collect();
    let site_of: HashMap<i32, i32> = site_resource::Entity::find()
        .select_only()
        .column(site_resource::Column::SiteResourceId)
        .column(site_resource::Column::SiteId)
        .filter(site_resource::Column::SiteResourceId.is_in(touched))
        .into_tuple::<(i32, i32)>()
        .all(conn)
        .await?
        .into_iter()
        .collect();

    let to_change = |pairs: &[(i32, i32)]| -> Vec<TargetChange> {
        pairs
            .iter()
            .filter_map(|(client_id, sr)| {
                site_of.get(sr).map(|site_id| TargetChange {
                    client_id: *client_id,
                    site_resource_id: *sr,
                    site_id: *site_id,
                })
            })
            .collect()
    };
    delta.targets_added = to_change(&added);
    delta.targets_removed = to_change(&removed);

    let peers: BTreeSet<PeerChange> = delta
        .targets_added
        .iter()
        .chain(delta.targets_removed.iter())
        .map(|t| PeerChange {
            client_id: t.client_id,
            site_id: t.site_id,
        })
        .collect();

    for peer in peers {
        let site_resources: Vec<i32> = site_resource::Entity::find()
            .select_only()
            .column(site_resource::Column::SiteResourceId)
            .filter(site_resource::Column::SiteId.eq(peer.site_id))
            .into_tuple()
            .all(conn)
            .await?;

        let still_reached = !site_resources.is_empty()
            && csr_assoc::Entity::find()
                .filter(csr_assoc::Column::ClientId.eq(peer.client_id))
                .filter(csr_assoc::Column::SiteResourceId.is_in(site_resources))
                .count(conn)
                .await?
                > 0;

        let peered = client_site_assoc::Entity::find_by_id((peer.client_id, peer.site_id))
            .one(conn)
            .await?
            .is_some();

        match (peered, still_reached) {
            (false, true) => {
                client_site_assoc::Entity::insert(client_site_assoc::ActiveModel {
                    client_id: Set(peer.client_id),
                    site_id: Set(peer.site_id),
                })
                .exec_without_returning(conn)
                .await?;
                delta.peers_added.push(peer);
            }
            (true, false) => {
                client_site_assoc::Entity::delete_by_id((peer.client_id, peer.site_id))
                    .exec(conn)
                    .await?;
                delta.peers_removed.push(peer);
            }
            _ => {}
        }
    }

    Ok(delta)
}
