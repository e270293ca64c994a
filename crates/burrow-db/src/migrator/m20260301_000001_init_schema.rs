//! Consolidated initial schema migration

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Organizations, users, roles and memberships
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Org::Table)
                    .if_not_exists()
                    .col(string(Org::OrgId).primary_key())
                    .col(string(Org::Name))
                    .col(string_null(Org::Subnet))
                    .col(
                        timestamp_with_time_zone(Org::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(string(User::UserId).primary_key())
                    .col(string_len(User::Email, 255).not_null().unique_key())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Role::Table)
                    .if_not_exists()
                    .col(pk_auto(Role::RoleId))
                    .col(string(Role::OrgId))
                    .col(string(Role::Name))
                    .col(boolean(Role::IsAdmin).not_null().default(false))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_roles_org_id")
                            .from(Role::Table, Role::OrgId)
                            .to(Org::Table, Org::OrgId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserOrg::Table)
                    .if_not_exists()
                    .col(string(UserOrg::UserId))
                    .col(string(UserOrg::OrgId))
                    .col(integer(UserOrg::RoleId))
                    .col(boolean(UserOrg::IsOwner).not_null().default(false))
                    .primary_key(Index::create().col(UserOrg::UserId).col(UserOrg::OrgId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_orgs_user_id")
                            .from(UserOrg::Table, UserOrg::UserId)
                            .to(User::Table, User::UserId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_orgs_org_id")
                            .from(UserOrg::Table, UserOrg::OrgId)
                            .to(Org::Table, Org::OrgId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_orgs_role_id")
                            .from(UserOrg::Table, UserOrg::RoleId)
                            .to(Role::Table, Role::RoleId)
                            .on_delete(ForeignKeyAction::Restrict)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_orgs_role_id")
                    .table(UserOrg::Table)
                    .col(UserOrg::RoleId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Exit nodes and their org associations
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ExitNode::Table)
                    .if_not_exists()
                    .col(pk_auto(ExitNode::ExitNodeId))
                    .col(string(ExitNode::Name))
                    .col(string(ExitNode::Address))
                    .col(string(ExitNode::Endpoint))
                    .col(string(ExitNode::PublicKey))
                    .col(integer(ExitNode::ListenPort))
                    .col(string_null(ExitNode::ReachableAt))
                    .col(integer_null(ExitNode::MaxConnections))
                    .col(boolean(ExitNode::Online).not_null().default(false))
                    .col(big_integer_null(ExitNode::LastPing))
                    .col(
                        string_len(ExitNode::NodeType, 32)
                            .not_null()
                            .default("gerbil"),
                    )
                    .col(string_null(ExitNode::Region))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ExitNodeOrg::Table)
                    .if_not_exists()
                    .col(integer(ExitNodeOrg::ExitNodeId))
                    .col(string(ExitNodeOrg::OrgId))
                    .primary_key(
                        Index::create()
                            .col(ExitNodeOrg::ExitNodeId)
                            .col(ExitNodeOrg::OrgId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_exit_node_orgs_exit_node_id")
                            .from(ExitNodeOrg::Table, ExitNodeOrg::ExitNodeId)
                            .to(ExitNode::Table, ExitNode::ExitNodeId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_exit_node_orgs_org_id")
                            .from(ExitNodeOrg::Table, ExitNodeOrg::OrgId)
                            .to(Org::Table, Org::OrgId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Sites, resources, site resources and clients
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Site::Table)
                    .if_not_exists()
                    .col(pk_auto(Site::SiteId))
                    .col(string(Site::OrgId))
                    .col(string(Site::NiceId))
                    .col(string(Site::Name))
                    .col(string_null(Site::PubKey))
                    .col(string_null(Site::Subnet))
                    .col(string_null(Site::Address))
                    .col(integer_null(Site::ExitNodeId))
                    .col(boolean(Site::Online).not_null().default(false))
                    .col(big_integer_null(Site::LastPing))
                    .col(timestamp_with_time_zone_null(Site::LastBandwidthUpdate))
                    .col(big_integer(Site::BytesIn).not_null().default(0))
                    .col(big_integer(Site::BytesOut).not_null().default(0))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sites_org_id")
                            .from(Site::Table, Site::OrgId)
                            .to(Org::Table, Org::OrgId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sites_exit_node_id")
                            .from(Site::Table, Site::ExitNodeId)
                            .to(ExitNode::Table, ExitNode::ExitNodeId)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Last-resort guard against two sites racing for the same block
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sites_exit_node_subnet")
                    .table(Site::Table)
                    .col(Site::ExitNodeId)
                    .col(Site::Subnet)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sites_org_nice_id")
                    .table(Site::Table)
                    .col(Site::OrgId)
                    .col(Site::NiceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sites_pub_key")
                    .table(Site::Table)
                    .col(Site::PubKey)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Resource::Table)
                    .if_not_exists()
                    .col(pk_auto(Resource::ResourceId))
                    .col(string(Resource::OrgId))
                    .col(string(Resource::Name))
                    .col(string_null(Resource::FullDomain))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_resources_org_id")
                            .from(Resource::Table, Resource::OrgId)
                            .to(Org::Table, Org::OrgId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SiteResource::Table)
                    .if_not_exists()
                    .col(pk_auto(SiteResource::SiteResourceId))
                    .col(integer(SiteResource::SiteId))
                    .col(string(SiteResource::OrgId))
                    .col(string(SiteResource::Name))
                    .col(string(SiteResource::Destination))
                    .col(integer_null(SiteResource::DestinationPort))
                    // A site cannot be deleted while resources still route through it
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_site_resources_site_id")
                            .from(SiteResource::Table, SiteResource::SiteId)
                            .to(Site::Table, Site::SiteId)
                            .on_delete(ForeignKeyAction::Restrict)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Client::Table)
                    .if_not_exists()
                    .col(pk_auto(Client::ClientId))
                    .col(string(Client::OrgId))
                    .col(string_null(Client::UserId))
                    .col(string(Client::Name))
                    .col(string_null(Client::PubKey).unique_key())
                    .col(string(Client::Address))
                    .col(boolean(Client::Online).not_null().default(false))
                    .col(big_integer_null(Client::LastPing))
                    .col(timestamp_with_time_zone_null(Client::LastBandwidthUpdate))
                    .col(big_integer(Client::BytesIn).not_null().default(0))
                    .col(big_integer(Client::BytesOut).not_null().default(0))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_clients_org_id")
                            .from(Client::Table, Client::OrgId)
                            .to(Org::Table, Org::OrgId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_clients_user_id")
                            .from(Client::Table, Client::UserId)
                            .to(User::Table, User::UserId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_clients_org_address")
                    .table(Client::Table)
                    .col(Client::OrgId)
                    .col(Client::Address)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Sites and clients share each org's address range; this index spans both
        manager
            .create_table(
                Table::create()
                    .table(OrgAddress::Table)
                    .if_not_exists()
                    .col(pk_auto(OrgAddress::OrgAddressId))
                    .col(string(OrgAddress::OrgId))
                    .col(string(OrgAddress::Address))
                    .col(integer_null(OrgAddress::SiteId))
                    .col(integer_null(OrgAddress::ClientId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_org_addresses_org_id")
                            .from(OrgAddress::Table, OrgAddress::OrgId)
                            .to(Org::Table, Org::OrgId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_org_addresses_site_id")
                            .from(OrgAddress::Table, OrgAddress::SiteId)
                            .to(Site::Table, Site::SiteId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_org_addresses_client_id")
                            .from(OrgAddress::Table, OrgAddress::ClientId)
                            .to(Client::Table, Client::ClientId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_org_addresses_org_address")
                    .table(OrgAddress::Table)
                    .col(OrgAddress::OrgId)
                    .col(OrgAddress::Address)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. Grant join tables
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(RoleResource::Table)
                    .if_not_exists()
                    .col(integer(RoleResource::RoleId))
                    .col(integer(RoleResource::ResourceId))
                    .primary_key(
                        Index::create()
                            .col(RoleResource::RoleId)
                            .col(RoleResource::ResourceId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_resources_role_id")
                            .from(RoleResource::Table, RoleResource::RoleId)
                            .to(Role::Table, Role::RoleId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_resources_resource_id")
                            .from(RoleResource::Table, RoleResource::ResourceId)
                            .to(Resource::Table, Resource::ResourceId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserResource::Table)
                    .if_not_exists()
                    .col(string(UserResource::UserId))
                    .col(integer(UserResource::ResourceId))
                    .primary_key(
                        Index::create()
                            .col(UserResource::UserId)
                            .col(UserResource::ResourceId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_resources_user_id")
                            .from(UserResource::Table, UserResource::UserId)
                            .to(User::Table, User::UserId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_resources_resource_id")
                            .from(UserResource::Table, UserResource::ResourceId)
                            .to(Resource::Table, Resource::ResourceId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RoleSiteResource::Table)
                    .if_not_exists()
                    .col(integer(RoleSiteResource::RoleId))
                    .col(integer(RoleSiteResource::SiteResourceId))
                    .primary_key(
                        Index::create()
                            .col(RoleSiteResource::RoleId)
                            .col(RoleSiteResource::SiteResourceId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_site_resources_role_id")
                            .from(RoleSiteResource::Table, RoleSiteResource::RoleId)
                            .to(Role::Table, Role::RoleId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_site_resources_site_resource_id")
                            .from(RoleSiteResource::Table, RoleSiteResource::SiteResourceId)
                            .to(SiteResource::Table, SiteResource::SiteResourceId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserSiteResource::Table)
                    .if_not_exists()
                    .col(string(UserSiteResource::UserId))
                    .col(integer(UserSiteResource::SiteResourceId))
                    .primary_key(
                        Index::create()
                            .col(UserSiteResource::UserId)
                            .col(UserSiteResource::SiteResourceId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_site_resources_user_id")
                            .from(UserSiteResource::Table, UserSiteResource::UserId)
                            .to(User::Table, User::UserId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_site_resources_site_resource_id")
                            .from(UserSiteResource::Table, UserSiteResource::SiteResourceId)
                            .to(SiteResource::Table, SiteResource::SiteResourceId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ClientSiteResource::Table)
                    .if_not_exists()
                    .col(integer(ClientSiteResource::ClientId))
                    .col(integer(ClientSiteResource::SiteResourceId))
                    .primary_key(
                        Index::create()
                            .col(ClientSiteResource::ClientId)
                            .col(ClientSiteResource::SiteResourceId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_client_site_resources_client_id")
                            .from(ClientSiteResource::Table, ClientSiteResource::ClientId)
                            .to(Client::Table, Client::ClientId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_client_site_resources_site_resource_id")
                            .from(ClientSiteResource::Table, ClientSiteResource::SiteResourceId)
                            .to(SiteResource::Table, SiteResource::SiteResourceId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RoleSite::Table)
                    .if_not_exists()
                    .col(integer(RoleSite::RoleId))
                    .col(integer(RoleSite::SiteId))
                    .primary_key(Index::create().col(RoleSite::RoleId).col(RoleSite::SiteId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_sites_role_id")
                            .from(RoleSite::Table, RoleSite::RoleId)
                            .to(Role::Table, Role::RoleId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_sites_site_id")
                            .from(RoleSite::Table, RoleSite::SiteId)
                            .to(Site::Table, Site::SiteId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserSite::Table)
                    .if_not_exists()
                    .col(string(UserSite::UserId))
                    .col(integer(UserSite::SiteId))
                    .primary_key(Index::create().col(UserSite::UserId).col(UserSite::SiteId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_sites_user_id")
                            .from(UserSite::Table, UserSite::UserId)
                            .to(User::Table, User::UserId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_sites_site_id")
                            .from(UserSite::Table, UserSite::SiteId)
                            .to(Site::Table, Site::SiteId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RoleClient::Table)
                    .if_not_exists()
                    .col(integer(RoleClient::RoleId))
                    .col(integer(RoleClient::ClientId))
                    .primary_key(
                        Index::create()
                            .col(RoleClient::RoleId)
                            .col(RoleClient::ClientId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_clients_role_id")
                            .from(RoleClient::Table, RoleClient::RoleId)
                            .to(Role::Table, Role::RoleId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_clients_client_id")
                            .from(RoleClient::Table, RoleClient::ClientId)
                            .to(Client::Table, Client::ClientId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserClient::Table)
                    .if_not_exists()
                    .col(string(UserClient::UserId))
                    .col(integer(UserClient::ClientId))
                    .primary_key(
                        Index::create()
                            .col(UserClient::UserId)
                            .col(UserClient::ClientId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_clients_user_id")
                            .from(UserClient::Table, UserClient::UserId)
                            .to(User::Table, User::UserId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_clients_client_id")
                            .from(UserClient::Table, UserClient::ClientId)
                            .to(Client::Table, Client::ClientId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 5. Derived association tables
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ClientSiteResourceAssociation::Table)
                    .if_not_exists()
                    .col(integer(ClientSiteResourceAssociation::ClientId))
                    .col(integer(ClientSiteResourceAssociation::SiteResourceId))
                    .primary_key(
                        Index::create()
                            .col(ClientSiteResourceAssociation::ClientId)
                            .col(ClientSiteResourceAssociation::SiteResourceId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_csr_assoc_client_id")
                            .from(
                                ClientSiteResourceAssociation::Table,
                                ClientSiteResourceAssociation::ClientId,
                            )
                            .to(Client::Table, Client::ClientId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_csr_assoc_site_resource_id")
                            .from(
                                ClientSiteResourceAssociation::Table,
                                ClientSiteResourceAssociation::SiteResourceId,
                            )
                            .to(SiteResource::Table, SiteResource::SiteResourceId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_csr_assoc_site_resource_id")
                    .table(ClientSiteResourceAssociation::Table)
                    .col(ClientSiteResourceAssociation::SiteResourceId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ClientSiteAssociation::Table)
                    .if_not_exists()
                    .col(integer(ClientSiteAssociation::ClientId))
                    .col(integer(ClientSiteAssociation::SiteId))
                    .primary_key(
                        Index::create()
                            .col(ClientSiteAssociation::ClientId)
                            .col(ClientSiteAssociation::SiteId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_cs_assoc_client_id")
                            .from(ClientSiteAssociation::Table, ClientSiteAssociation::ClientId)
                            .to(Client::Table, Client::ClientId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_cs_assoc_site_id")
                            .from(ClientSiteAssociation::Table, ClientSiteAssociation::SiteId)
                            .to(Site::Table, Site::SiteId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 6. Agents and sessions
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Agent::Table)
                    .if_not_exists()
                    .col(string(Agent::AgentId).primary_key())
                    .col(string_len(Agent::AgentType, 32).not_null())
                    .col(string(Agent::SecretHash))
                    .col(integer_null(Agent::SiteId))
                    .col(integer_null(Agent::ClientId))
                    .col(integer_null(Agent::ExitNodeId))
                    .col(
                        timestamp_with_time_zone(Agent::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_agents_site_id")
                            .from(Agent::Table, Agent::SiteId)
                            .to(Site::Table, Site::SiteId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_agents_client_id")
                            .from(Agent::Table, Agent::ClientId)
                            .to(Client::Table, Client::ClientId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_agents_exit_node_id")
                            .from(Agent::Table, Agent::ExitNodeId)
                            .to(ExitNode::Table, ExitNode::ExitNodeId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AgentSession::Table)
                    .if_not_exists()
                    .col(string(AgentSession::SessionId).primary_key())
                    .col(string(AgentSession::AgentId))
                    .col(timestamp_with_time_zone(AgentSession::ExpiresAt).not_null())
                    .col(
                        timestamp_with_time_zone(AgentSession::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_agent_sessions_agent_id")
                            .from(AgentSession::Table, AgentSession::AgentId)
                            .to(Agent::Table, Agent::AgentId)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_agent_sessions_agent_id")
                    .table(AgentSession::Table)
                    .col(AgentSession::AgentId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop tables in reverse order (respecting foreign keys)
        manager
            .drop_table(Table::drop().table(AgentSession::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Agent::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ClientSiteAssociation::Table).to_owned())
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(ClientSiteResourceAssociation::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(UserClient::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RoleClient::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserSite::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RoleSite::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ClientSiteResource::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserSiteResource::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RoleSiteResource::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserResource::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RoleResource::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(OrgAddress::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Client::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SiteResource::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Resource::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Site::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ExitNodeOrg::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ExitNode::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserOrg::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Role::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Org::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Org {
    #[sea_orm(iden = "orgs")]
    Table,
    OrgId,
    Name,
    Subnet,
    CreatedAt,
}

#[derive(DeriveIden)]
enum User {
    #[sea_orm(iden = "users")]
    Table,
    UserId,
    Email,
}

#[derive(DeriveIden)]
enum Role {
    #[sea_orm(iden = "roles")]
    Table,
    RoleId,
    OrgId,
    Name,
    IsAdmin,
}

#[derive(DeriveIden)]
enum UserOrg {
    #[sea_orm(iden = "user_orgs")]
    Table,
    UserId,
    OrgId,
    RoleId,
    IsOwner,
}

#[derive(DeriveIden)]
enum ExitNode {
    #[sea_orm(iden = "exit_nodes")]
    Table,
    ExitNodeId,
    Name,
    Address,
    Endpoint,
    PublicKey,
    ListenPort,
    ReachableAt,
    MaxConnections,
    Online,
    LastPing,
    NodeType,
    Region,
}

#[derive(DeriveIden)]
enum ExitNodeOrg {
    #[sea_orm(iden = "exit_node_orgs")]
    Table,
    ExitNodeId,
    OrgId,
}

#[derive(DeriveIden)]
enum Site {
    #[sea_orm(iden = "sites")]
    Table,
    SiteId,
    OrgId,
    NiceId,
    Name,
    PubKey,
    Subnet,
    Address,
    ExitNodeId,
    Online,
    LastPing,
    LastBandwidthUpdate,
    BytesIn,
    BytesOut,
}

#[derive(DeriveIden)]
enum OrgAddress {
    #[sea_orm(iden = "org_addresses")]
    Table,
    OrgAddressId,
    OrgId,
    Address,
    SiteId,
    ClientId,
}

#[derive(DeriveIden)]
enum Resource {
    #[sea_orm(iden = "resources")]
    Table,
    ResourceId,
    OrgId,
    Name,
    FullDomain,
}

#[derive(DeriveIden)]
enum SiteResource {
    #[sea_orm(iden = "site_resources")]
    Table,
    SiteResourceId,
    SiteId,
    OrgId,
    Name,
    Destination,
    DestinationPort,
}

#[derive(DeriveIden)]
enum Client {
    #[sea_orm(iden = "clients")]
    Table,
    ClientId,
    OrgId,
    UserId,
    Name,
    PubKey,
    Address,
    Online,
    LastPing,
    LastBandwidthUpdate,
    BytesIn,
    BytesOut,
}

#[derive(DeriveIden)]
enum RoleResource {
    #[sea_orm(iden = "role_resources")]
    Table,
    RoleId,
    ResourceId,
}

#[derive(DeriveIden)]
enum UserResource {
    #[sea_orm(iden = "user_resources")]
    Table,
    UserId,
    ResourceId,
}

#[derive(DeriveIden)]
enum RoleSiteResource {
    #[sea_orm(iden = "role_site_resources")]
    Table,
    RoleId,
    SiteResourceId,
}

#[derive(DeriveIden)]
enum UserSiteResource {
    #[sea_orm(iden = "user_site_resources")]
    Table,
    UserId,
    SiteResourceId,
}

#[derive(DeriveIden)]
enum ClientSiteResource {
    #[sea_orm(iden = "client_site_resources")]
    Table,
    ClientId,
    SiteResourceId,
}

#[derive(DeriveIden)]
enum RoleSite {
    #[sea_orm(iden = "role_sites")]
    Table,
    RoleId,
    SiteId,
}

#[derive(DeriveIden)]
enum UserSite {
    #[sea_orm(iden = "user_sites")]
    Table,
    UserId,
    SiteId,
}

#[derive(DeriveIden)]
enum RoleClient {
    #[sea_orm(iden = "role_clients")]
    Table,
    RoleId,
    ClientId,
}

#[derive(DeriveIden)]
enum UserClient {
    #[sea_orm(iden = "user_clients")]
    Table,
    UserId,
    ClientId,
}

#[derive(DeriveIden)]
enum ClientSiteResourceAssociation {
    #[sea_orm(iden = "client_site_resource_associations")]
    Table,
    ClientId,
    SiteResourceId,
}

#[derive(DeriveIden)]
enum ClientSiteAssociation {
    #[sea_orm(iden = "client_site_associations")]
    Table,
    ClientId,
    SiteId,
}

#[derive(DeriveIden)]
enum Agent {
    #[sea_orm(iden = "agents")]
    Table,
    AgentId,
    AgentType,
    SecretHash,
    SiteId,
    ClientId,
    ExitNodeId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AgentSession {
    #[sea_orm(iden = "agent_sessions")]
    Table,
    SessionId,
    AgentId,
    ExpiresAt,
    CreatedAt,
}
