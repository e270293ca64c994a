//! Database entities

pub mod agent;
pub mod agent_session;
pub mod associations;
pub mod client;
pub mod exit_node;
pub mod exit_node_org;
pub mod grants;
pub mod org;
pub mod org_address;
pub mod resource;
pub mod role;
pub mod site;
pub mod site_resource;
pub mod user;
pub mod user_org;

pub use agent::Entity as Agent;
pub use agent_session::Entity as AgentSession;
pub use client::Entity as Client;
pub use exit_node::Entity as ExitNode;
pub use exit_node_org::Entity as ExitNodeOrg;
pub use org::Entity as Org;
pub use org_address::Entity as OrgAddress;
pub use resource::Entity as Resource;
pub use role::Entity as Role;
pub use site::Entity as Site;
pub use site_resource::Entity as SiteResource;
pub use user::Entity as User;
pub use user_org::Entity as UserOrg;

pub mod prelude {
    pub use super::agent::{AgentType, Entity as Agent};
    pub use super::agent_session::Entity as AgentSession;
    pub use super::associations::client_site::Entity as ClientSiteAssociation;
    pub use super::associations::client_site_resource::Entity as ClientSiteResourceAssociation;
    pub use super::client::Entity as Client;
    pub use super::exit_node::{Entity as ExitNode, ExitNodeType};
    pub use super::exit_node_org::Entity as ExitNodeOrg;
    pub use super::grants::client_site_resource::Entity as ClientSiteResource;
    pub use super::grants::role_client::Entity as RoleClient;
    pub use super::grants::role_resource::Entity as RoleResource;
    pub use super::grants::role_site::Entity as RoleSite;
    pub use super::grants::role_site_resource::Entity as RoleSiteResource;
    pub use super::grants::user_client::Entity as UserClient;
    pub use super::grants::user_resource::Entity as UserResource;
    pub use super::grants::user_site::Entity as UserSite;
    pub use super::grants::user_site_resource::Entity as UserSiteResource;
    pub use super::org::Entity as Org;
    pub use super::org_address::Entity as OrgAddress;
    pub use super::resource::Entity as Resource;
    pub use super::role::Entity as Role;
    pub use super::site::Entity as Site;
    pub use super::site_resource::Entity as SiteResource;
    pub use super::user::Entity as User;
    pub use super::user_org::Entity as UserOrg;
}
