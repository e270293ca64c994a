//! Site and client provisioning
//!
//! Allocation happens inside the transaction that inserts the row. Subnets
//! are guarded by the unique `(exit_node_id, subnet)` index. Org addresses are
//! shared by sites and clients, so both reserve theirs in `org_addresses`,
//! whose unique `(org_id, address)` index spans the two. A collision rolls
//! the transaction back and it is retried with a fresh allocation.

use std::net::Ipv4Addr;
use std::sync::Arc;

use burrow_auth::generate_id;
use burrow_db::entities::{
    client,
    exit_node::{self, ExitNodeType},
    exit_node_org, org, org_address, site, user_org,
};
use burrow_proto::{
    message_types, ConnectReply, NewtPeer, NewtPeerRemove, OlmConnectReply, OlmRegisterRequest,
    RegisterRequest,
};
use ipnet::Ipv4Net;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QuerySelect, Set, TransactionTrait,
};
use tracing::{debug, info, warn};

use crate::access::{client_peers, rebuild_in, site_wiring, AccessResolver, ChangedEntity};
use crate::clock::Clock;
use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};
use crate::exit_nodes::{select_best_exit_node, select_exit_node, ExitNodeClient};
use crate::ip::{next_client_address, next_site_subnet, parse_cidr};
use crate::session::{insert_agent, AgentBinding, AgentCredentials, AuthenticatedAgent};

const NICE_ID_LENGTH: usize = 10;

/// Where a registering site ended up, and where it was before
struct Placement {
    site: site::Model,
    node: exit_node::Model,
    previous_node: Option<exit_node::Model>,
    previous_key: Option<String>,
}

/// Bootstrap payload for a brand-new site
#[derive(Debug, Clone, PartialEq)]
pub struct SiteDefaults {
    pub exit_node_id: i32,
    /// Exit node anchor address
    pub address: String,
    pub public_key: String,
    pub name: String,
    pub listen_port: i32,
    pub endpoint: String,
    pub subnet: String,
    /// Next free address in the org subnet; `None` when the org has no subnet
    pub client_address: Option<String>,
    pub newt_id: String,
    pub newt_secret: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewSite {
    pub org_id: String,
    pub name: String,
    pub nice_id: Option<String>,
    /// Pin to a specific exit node instead of random placement
    pub exit_node_id: Option<i32>,
    pub newt_id: Option<String>,
    pub newt_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedSite {
    pub site: site::Model,
    pub newt: AgentCredentials,
}

#[derive(Debug, Clone, Default)]
pub struct NewClient {
    pub org_id: String,
    pub name: String,
    /// Set for a per-user client
    pub user_id: Option<String>,
    pub pub_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedClient {
    pub client: client::Model,
    pub olm: AgentCredentials,
}

pub struct Provisioner {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    access: Arc<AccessResolver>,
    exit_node_client: Arc<ExitNodeClient>,
    site_block_size: u8,
    allocation_attempts: u32,
}

impl Provisioner {
    pub fn new(
        db: DatabaseConnection,
        clock: Arc<dyn Clock>,
        access: Arc<AccessResolver>,
        exit_node_client: Arc<ExitNodeClient>,
        config: &ControlConfig,
    ) -> Self {
        Self {
            db,
            clock,
            access,
            exit_node_client,
            site_block_size: config.site_block_size,
            allocation_attempts: config.allocation_attempts.max(1),
        }
    }

    /// Everything a new site needs to configure itself, without persisting anything
    pub async fn pick_site_defaults(&self, org_id: &str) -> ControlResult<SiteDefaults> {
        let organization = require_org(&self.db, org_id).await?;
        let node = select_exit_node(&self.db, org_id, false).await?;
        let subnet = allocate_site_subnet(&self.db, &node, self.site_block_size).await?;
        let client_address = match &organization.subnet {
            Some(org_subnet) => Some(
                allocate_org_address(&self.db, org_id, parse_cidr(org_subnet)?)
                    .await?
                    .to_string(),
            ),
            None => None,
        };
        let credentials = AgentCredentials::generate();

        Ok(SiteDefaults {
            exit_node_id: node.exit_node_id,
            address: node.address,
            public_key: node.public_key,
            name: node.name,
            listen_port: node.listen_port,
            endpoint: node.endpoint,
            subnet: subnet.to_string(),
            client_address,
            newt_id: credentials.agent_id,
            newt_secret: credentials.secret,
        })
    }

    /// Create a site with its subnet and Newt agent
    pub async fn create_site(&self, request: NewSite) -> ControlResult<CreatedSite> {
        let mut attempt = 1;
        loop {
            let txn = self.db.begin().await?;
            match self.create_site_in(&txn, &request).await {
                Ok(created) => {
                    txn.commit().await?;
                    info!(
                        site_id = created.site.site_id,
                        org_id = %created.site.org_id,
                        subnet = ?created.site.subnet,
                        exit_node_id = ?created.site.exit_node_id,
                        "Created site"
                    );
                    return Ok(created);
                }
                Err(e) if e.is_unique_violation() && attempt < self.allocation_attempts => {
                    txn.rollback().await?;
                    debug!(attempt, "Site allocation collided, retrying: {}", e);
                    attempt += 1;
                }
                Err(e) => return Err(allocation_exhausted(e, attempt, "a unique subnet and address")),
            }
        }
    }

    async fn create_site_in(
        &self,
        txn: &DatabaseTransaction,
        request: &NewSite,
    ) -> ControlResult<CreatedSite> {
        let organization = require_org(txn, &request.org_id).await?;

        let node = match request.exit_node_id {
            Some(exit_node_id) => require_org_exit_node(txn, &request.org_id, exit_node_id).await?,
            None => select_exit_node(txn, &request.org_id, false).await?,
        };
        let subnet = allocate_site_subnet(txn, &node, self.site_block_size).await?;

        let address = match &organization.subnet {
            Some(org_subnet) => Some(
                allocate_org_address(txn, &request.org_id, parse_cidr(org_subnet)?)
                    .await?
                    .to_string(),
            ),
            None => None,
        };

        let nice_id = match &request.nice_id {
            Some(nice_id) => {
                let taken = site::Entity::find()
                    .filter(site::Column::OrgId.eq(request.org_id.as_str()))
                    .filter(site::Column::NiceId.eq(nice_id.as_str()))
                    .one(txn)
                    .await?
                    .is_some();
                if taken {
                    return Err(ControlError::Conflict(format!(
                        "site id {} is already used in {}",
                        nice_id, request.org_id
                    )));
                }
                nice_id.clone()
            }
            None => generate_id(NICE_ID_LENGTH),
        };

        let created = site::ActiveModel {
            org_id: Set(request.org_id.clone()),
            nice_id: Set(nice_id),
            name: Set(request.name.clone()),
            pub_key: Set(None),
            subnet: Set(Some(subnet.to_string())),
            address: Set(address),
            exit_node_id: Set(Some(node.exit_node_id)),
            online: Set(false),
            last_ping: Set(None),
            last_bandwidth_update: Set(None),
            bytes_in: Set(0),
            bytes_out: Set(0),
            ..Default::default()
        }
        .insert(txn)
        .await?;

        if let Some(address) = &created.address {
            reserve_org_address(txn, &request.org_id, address, AddressHolder::Site(created.site_id))
                .await?;
        }

        let credentials = match (&request.newt_id, &request.newt_secret) {
            (Some(agent_id), Some(secret)) => AgentCredentials {
                agent_id: agent_id.clone(),
                secret: secret.clone(),
            },
            (None, None) => AgentCredentials::generate(),
            _ => {
                return Err(ControlError::InvalidInput(
                    "newt id and secret must be given together".to_string(),
                ))
            }
        };
        let newt = insert_agent(
            txn,
            AgentBinding::Site(created.site_id),
            credentials,
            self.clock.now(),
        )
        .await?;

        Ok(CreatedSite {
            site: created,
            newt,
        })
    }

    /// Create a client with an org address and Olm agent, then wire its grants
    pub async fn create_client(&self, request: NewClient) -> ControlResult<CreatedClient> {
        let mut attempt = 1;
        loop {
            let txn = self.db.begin().await?;
            match self.create_client_in(&txn, &request).await {
                Ok(created) => {
                    let delta =
                        rebuild_in(&txn, &ChangedEntity::Client(created.client.client_id)).await?;
                    txn.commit().await?;
                    info!(
                        client_id = created.client.client_id,
                        org_id = %created.client.org_id,
                        address = %created.client.address,
                        "Created client"
                    );
                    self.access.notify(&delta).await;
                    return Ok(created);
                }
                Err(e) if e.is_unique_violation() && attempt < self.allocation_attempts => {
                    txn.rollback().await?;
                    debug!(attempt, "Client address collided, retrying: {}", e);
                    attempt += 1;
                }
                Err(e) => return Err(allocation_exhausted(e, attempt, "a unique client address")),
            }
        }
    }

    async fn create_client_in(
        &self,
        txn: &DatabaseTransaction,
        request: &NewClient,
    ) -> ControlResult<CreatedClient> {
        let organization = require_org(txn, &request.org_id).await?;
        let org_subnet = organization.subnet.as_deref().ok_or_else(|| {
            ControlError::InvalidInput(format!(
                "organization {} has no client subnet",
                request.org_id
            ))
        })?;

        if let Some(user_id) = &request.user_id {
            let member = user_org::Entity::find_by_id((user_id.clone(), request.org_id.clone()))
                .one(txn)
                .await?;
            if member.is_none() {
                return Err(ControlError::InvalidInput(format!(
                    "user {} is not a member of organization {}",
                    user_id, request.org_id
                )));
            }
        }

        let address = allocate_org_address(txn, &request.org_id, parse_cidr(org_subnet)?).await?;

        let created = client::ActiveModel {
            org_id: Set(request.org_id.clone()),
            user_id: Set(request.user_id.clone()),
            name: Set(request.name.clone()),
            pub_key: Set(request.pub_key.clone()),
            address: Set(address.to_string()),
            online: Set(false),
            last_ping: Set(None),
            last_bandwidth_update: Set(None),
            bytes_in: Set(0),
            bytes_out: Set(0),
            ..Default::default()
        }
        .insert(txn)
        .await?;

        reserve_org_address(
            txn,
            &request.org_id,
            &created.address,
            AddressHolder::Client(created.client_id),
        )
        .await?;

        let olm = insert_agent(
            txn,
            AgentBinding::Client(created.client_id),
            AgentCredentials::generate(),
            self.clock.now(),
        )
        .await?;

        Ok(CreatedClient {
            client: created,
            olm,
        })
    }

    /// Handle `newt/wg/register`: place the site, record its key, and describe the tunnel
    ///
    /// The exit node comes from the agent's ping results when it sent any,
    /// otherwise the site's current node, otherwise random placement. Moving
    /// to another node allocates a fresh subnet there.
    pub async fn register_newt(
        &self,
        agent: &AuthenticatedAgent,
        request: RegisterRequest,
    ) -> ControlResult<ConnectReply> {
        let site_id = agent.site_id.ok_or_else(|| {
            ControlError::InvalidInput(format!("agent {} is not a site agent", agent.agent_id))
        })?;
        if request.public_key.trim().is_empty() {
            return Err(ControlError::InvalidInput("public key is required".to_string()));
        }

        let mut attempt = 1;
        let placement = loop {
            let txn = self.db.begin().await?;
            match self.place_site(&txn, site_id, &request).await {
                Ok(placement) => {
                    txn.commit().await?;
                    break placement;
                }
                Err(e) if e.is_unique_violation() && attempt < self.allocation_attempts => {
                    txn.rollback().await?;
                    debug!(site_id, attempt, "Subnet collided during registration, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(allocation_exhausted(e, attempt, "a unique subnet")),
            }
        };

        let Placement {
            site,
            node,
            previous_node,
            previous_key,
        } = placement;
        let subnet = site
            .subnet
            .as_deref()
            .map(parse_cidr)
            .transpose()?
            .ok_or_else(|| ControlError::Internal(format!("site {} has no subnet", site_id)))?;

        let moved = previous_node
            .as_ref()
            .map_or(true, |old| old.exit_node_id != node.exit_node_id);
        let rekeyed = previous_key.as_deref() != Some(request.public_key.as_str());

        if moved || rekeyed {
            if let (Some(old_node), Some(old_key)) = (&previous_node, &previous_key) {
                let removal = NewtPeerRemove {
                    public_key: old_key.clone(),
                };
                self.exit_node_client
                    .notify(
                        old_node,
                        "/peer/remove",
                        message_types::EXIT_NODE_PEER_REMOVE,
                        &removal,
                    )
                    .await;
            }
            let peer = NewtPeer {
                public_key: request.public_key.clone(),
                allowed_ips: vec![subnet.to_string()],
            };
            self.exit_node_client
                .notify(&node, "/peer", message_types::EXIT_NODE_PEER_ADD, &peer)
                .await;
            self.access.push_site_update(site_id).await;
        }

        let wiring = site_wiring(&self.db, site_id).await?;

        info!(
            site_id,
            exit_node_id = node.exit_node_id,
            subnet = %subnet,
            moved,
            peers = wiring.peers.len(),
            "Site registered"
        );

        let server_ip = parse_cidr(&node.address)?.addr();
        Ok(ConnectReply {
            endpoint: node.endpoint,
            public_key: node.public_key,
            server_ip: server_ip.to_string(),
            tunnel_ip: subnet.addr().to_string(),
            peers: wiring.peers,
            targets: wiring.targets,
        })
    }

    /// Handle `olm/wg/register`: record the client's key and hand back its site peers
    ///
    /// A changed key is swapped on every site the client is already peered with.
    pub async fn register_olm(
        &self,
        agent: &AuthenticatedAgent,
        request: OlmRegisterRequest,
    ) -> ControlResult<OlmConnectReply> {
        let client_id = agent.client_id.ok_or_else(|| {
            ControlError::InvalidInput(format!("agent {} is not a client agent", agent.agent_id))
        })?;
        let public_key = request.public_key.trim();
        if public_key.is_empty() {
            return Err(ControlError::InvalidInput("public key is required".to_string()));
        }

        let current = client::Entity::find_by_id(client_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("client {}", client_id)))?;
        let previous_key = current.pub_key.clone();
        let rekeyed = previous_key.as_deref() != Some(public_key);

        if rekeyed {
            let mut active: client::ActiveModel = current.into();
            active.pub_key = Set(Some(public_key.to_string()));
            let updated = active.update(&self.db).await.map_err(|e| {
                let e = ControlError::from(e);
                if e.is_unique_violation() {
                    ControlError::Conflict("public key belongs to another client".to_string())
                } else {
                    e
                }
            })?;
            self.access
                .push_client_key_change(&updated, previous_key.as_deref())
                .await;
        }

        let sites = client_peers(&self.db, client_id).await?;
        info!(client_id, sites = sites.len(), rekeyed, "Client registered");
        Ok(OlmConnectReply { sites })
    }

    /// Pick the exit node for a registering site and persist the placement
    async fn place_site(
        &self,
        txn: &DatabaseTransaction,
        site_id: i32,
        request: &RegisterRequest,
    ) -> ControlResult<Placement> {
        let current = site::Entity::find_by_id(site_id)
            .one(txn)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("site {}", site_id)))?;

        let previous_node = match current.exit_node_id {
            Some(id) => exit_node::Entity::find_by_id(id).one(txn).await?,
            None => None,
        };

        // noCloud keeps the site off remote exit nodes
        let allowed = |node: &exit_node::Model| {
            !(request.no_cloud && node.node_type == ExitNodeType::RemoteExitNode)
        };

        let mut chosen = None;
        if let Some(best) = select_best_exit_node(&request.ping_results) {
            match require_org_exit_node(txn, &current.org_id, best.exit_node_id).await {
                Ok(node) if !node.online => {
                    debug!(site_id, exit_node_id = node.exit_node_id, "Pinged exit node is offline")
                }
                Ok(node) if !allowed(&node) => {
                    debug!(site_id, exit_node_id = node.exit_node_id, "Pinged exit node is remote, skipping")
                }
                Ok(node) => chosen = Some(node),
                Err(e) => {
                    warn!(site_id, exit_node_id = best.exit_node_id, "Ignoring pinged exit node: {}", e)
                }
            }
        }
        let node = match (chosen, &previous_node) {
            (Some(node), _) => node,
            (None, Some(node)) if allowed(node) => node.clone(),
            (None, _) => select_exit_node(txn, &current.org_id, request.no_cloud).await?,
        };

        let keep_subnet = current.exit_node_id == Some(node.exit_node_id) && current.subnet.is_some();
        let subnet = if keep_subnet {
            current.subnet.clone()
        } else {
            Some(allocate_site_subnet(txn, &node, self.site_block_size).await?.to_string())
        };

        let previous_key = current.pub_key.clone();

        let mut active: site::ActiveModel = current.into();
        active.pub_key = Set(Some(request.public_key.clone()));
        active.exit_node_id = Set(Some(node.exit_node_id));
        active.subnet = Set(subnet);
        let updated = active.update(txn).await?;

        Ok(Placement {
            site: updated,
            node,
            previous_node,
            previous_key,
        })
    }
}

async fn require_org<C: ConnectionTrait>(conn: &C, org_id: &str) -> ControlResult<org::Model> {
    org::Entity::find_by_id(org_id.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("organization {}", org_id)))
}

async fn require_org_exit_node<C: ConnectionTrait>(
    conn: &C,
    org_id: &str,
    exit_node_id: i32,
) -> ControlResult<exit_node::Model> {
    let node = exit_node::Entity::find_by_id(exit_node_id)
        .one(conn)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("exit node {}", exit_node_id)))?;

    let linked = exit_node_org::Entity::find_by_id((exit_node_id, org_id.to_string()))
        .one(conn)
        .await?
        .is_some();
    if !linked {
        return Err(ControlError::InvalidInput(format!(
            "exit node {} is not available to organization {}",
            exit_node_id, org_id
        )));
    }
    Ok(node)
}

/// A unique-index collision that survived every retry surfaces as `Conflict`
fn allocation_exhausted(err: ControlError, attempts: u32, what: &str) -> ControlError {
    if err.is_unique_violation() {
        ControlError::Conflict(format!("could not allocate {} after {} attempts", what, attempts))
    } else {
        err
    }
}

#[derive(Debug, Clone, Copy)]
enum AddressHolder {
    Site(i32),
    Client(i32),
}

/// Claim `address` in the org-wide reservation table
async fn reserve_org_address<C: ConnectionTrait>(
    conn: &C,
    org_id: &str,
    address: &str,
    holder: AddressHolder,
) -> ControlResult<()> {
    let (site_id, client_id) = match holder {
        AddressHolder::Site(id) => (Some(id), None),
        AddressHolder::Client(id) => (None, Some(id)),
    };
    org_address::Entity::insert(org_address::ActiveModel {
        org_id: Set(org_id.to_string()),
        address: Set(address.to_string()),
        site_id: Set(site_id),
        client_id: Set(client_id),
        ..Default::default()
    })
    .exec_without_returning(conn)
    .await?;
    Ok(())
}

/// Next free block on `node`, never overlapping its anchor or sibling sites
async fn allocate_site_subnet<C: ConnectionTrait>(
    conn: &C,
    node: &exit_node::Model,
    block_size: u8,
) -> ControlResult<Ipv4Net> {
    let anchor = parse_cidr(&node.address)?;

    let subnets: Vec<Option<String>> = site::Entity::find()
        .select_only()
        .column(site::Column::Subnet)
        .filter(site::Column::ExitNodeId.eq(node.exit_node_id))
        .into_tuple()
        .all(conn)
        .await?;

    let existing = subnets
        .iter()
        .flatten()
        .map(|s| parse_cidr(s))
        .collect::<ControlResult<Vec<_>>>()?;

    next_site_subnet(&existing, block_size, anchor)
}

/// Next free single address in the org subnet, shared by sites and clients
async fn allocate_org_address<C: ConnectionTrait>(
    conn: &C,
    org_id: &str,
    org_subnet: Ipv4Net,
) -> ControlResult<Ipv4Addr> {
    let site_addresses: Vec<Option<String>> = site::Entity::find()
        .select_only()
        .column(site::Column::Address)
        .filter(site::Column::OrgId.eq(org_id))
        .into_tuple()
        .all(conn)
        .await?;

    let client_addresses: Vec<String> = client::Entity::find()
        .select_only()
        .column(client::Column::Address)
        .filter(client::Column::OrgId.eq(org_id))
        .into_tuple()
        .all(conn)
        .await?;

    let existing = site_addresses
        .into_iter()
        .flatten()
        .chain(client_addresses)
        .map(|a| parse_cidr(&a).map(|net| net.addr()))
        .collect::<ControlResult<Vec<_>>>()?;

    next_client_address(&existing, org_subnet)
}
