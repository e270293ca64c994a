//! Access resolution and association rebuild against SQLite

mod common;

use burrow_control::{
    AccessDecision, AccessTarget, AgentBinding, ChangedEntity, ControlError, GrantTarget, Grantee,
};
use burrow_db::entities::{associations::client_site, user_org};
use burrow_proto::message_types;
use common::*;
use sea_orm::{DatabaseConnection, EntityTrait};

struct World {
    admin_role: i32,
    member_role: i32,
    ops_role: i32,
    site_id: i32,
    other_site_id: i32,
    ssh: i32,
    web: i32,
    db_port: i32,
    bob_client: i32,
    carol_client: i32,
    machine_client: i32,
}

async fn seed_world(db: &DatabaseConnection) -> World {
    seed_org(db, ORG, Some(ORG_SUBNET)).await;
    seed_org(db, "globex", Some("100.91.0.0/24")).await;

    let admin_role = seed_role(db, ORG, "Admin", true).await;
    let member_role = seed_role(db, ORG, "Member", false).await;
    let ops_role = seed_role(db, ORG, "Ops", false).await;

    for user in ["alice", "bob", "carol", "dave"] {
        seed_user(db, user).await;
    }
    add_member(db, "alice", ORG, admin_role, true).await;
    add_member(db, "bob", ORG, member_role, false).await;
    add_member(db, "carol", ORG, ops_role, false).await;

    let node = seed_exit_node(db, ORG, NodeSpec::remote("fra", "100.89.128.1/24")).await;
    let site = seed_site(db, ORG, "hq", Some(node.exit_node_id), Some("100.89.128.4/30"), true).await;
    let other = seed_site(db, ORG, "lab", Some(node.exit_node_id), Some("100.89.128.8/30"), true).await;

    let ssh = seed_site_resource(db, &site, "ssh", 22).await;
    let web = seed_site_resource(db, &site, "web", 443).await;
    let db_port = seed_site_resource(db, &other, "postgres", 5432).await;

    let bob_client = seed_client(db, ORG, Some("bob"), "100.90.128.10", "bob-key").await;
    let carol_client = seed_client(db, ORG, Some("carol"), "100.90.128.11", "carol-key").await;
    let machine_client = seed_client(db, ORG, None, "100.90.128.12", "machine-key").await;

    World {
        admin_role,
        member_role,
        ops_role,
        site_id: site.site_id,
        other_site_id: other.site_id,
        ssh,
        web,
        db_port,
        bob_client: bob_client.client_id,
        carol_client: carol_client.client_id,
        machine_client: machine_client.client_id,
    }
}

#[tokio::test]
async fn test_admin_allowed_without_any_grant() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let resource_id = seed_resource(&t.db, ORG, "dashboard").await;

    for target in [
        AccessTarget::Resource(resource_id),
        AccessTarget::SiteResource(w.ssh),
        AccessTarget::Site(w.site_id),
        AccessTarget::Client(w.machine_client),
    ] {
        let decision = t.plane.access.can_access("alice", target).await.unwrap();
        assert_eq!(decision, AccessDecision::Allow, "{:?}", target);
    }
}

#[tokio::test]
async fn test_role_and_user_grants_allow() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;

    assert_eq!(
        access.can_access("bob", AccessTarget::SiteResource(w.ssh)).await.unwrap(),
        AccessDecision::Deny
    );

    access
        .add_grant(GrantTarget::SiteResource(w.ssh), Grantee::Role(w.member_role))
        .await
        .unwrap();
    access
        .add_grant(GrantTarget::SiteResource(w.web), Grantee::User("carol".to_string()))
        .await
        .unwrap();

    assert!(access
        .can_access("bob", AccessTarget::SiteResource(w.ssh))
        .await
        .unwrap()
        .is_allowed());
    assert!(access
        .can_access("carol", AccessTarget::SiteResource(w.web))
        .await
        .unwrap()
        .is_allowed());
    assert!(!access
        .can_access("carol", AccessTarget::SiteResource(w.ssh))
        .await
        .unwrap()
        .is_allowed());
}

#[tokio::test]
async fn test_top_level_resource_grants() {
    let t = setup_plane().await;
    let _w = seed_world(&t.db).await;
    let resource_id = seed_resource(&t.db, ORG, "grafana").await;
    let access = &t.plane.access;

    let delta = access
        .add_grant(GrantTarget::Resource(resource_id), Grantee::User("bob".to_string()))
        .await
        .unwrap();
    assert!(delta.is_empty());

    assert!(access
        .can_access("bob", AccessTarget::Resource(resource_id))
        .await
        .unwrap()
        .is_allowed());

    access
        .remove_grant(GrantTarget::Resource(resource_id), Grantee::User("bob".to_string()))
        .await
        .unwrap();
    assert!(!access
        .can_access("bob", AccessTarget::Resource(resource_id))
        .await
        .unwrap()
        .is_allowed());
}

#[tokio::test]
async fn test_non_member_denied_and_missing_target_not_found() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;

    assert_eq!(
        access.can_access("dave", AccessTarget::SiteResource(w.ssh)).await.unwrap(),
        AccessDecision::Deny
    );

    let err = access
        .can_access("bob", AccessTarget::SiteResource(9999))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

#[tokio::test]
async fn test_admin_role_grants_are_rejected() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;
    let target = GrantTarget::SiteResource(w.ssh);

    let err = access
        .add_grant(target, Grantee::Role(w.admin_role))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)));

    let err = access
        .remove_grant(target, Grantee::Role(w.admin_role))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)));

    let err = access
        .set_role_grants(target, vec![w.member_role, w.admin_role])
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)));

    // The rejected set left nothing behind
    assert!(access.effective_clients(w.ssh).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_grant_conflicts_and_missing_grant_not_found() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;
    let target = GrantTarget::SiteResource(w.ssh);

    access.add_grant(target, Grantee::Role(w.ops_role)).await.unwrap();
    let err = access
        .add_grant(target, Grantee::Role(w.ops_role))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));

    let err = access
        .remove_grant(target, Grantee::Role(w.member_role))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

#[tokio::test]
async fn test_grantee_validation() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;
    let target = GrantTarget::SiteResource(w.ssh);

    let err = access
        .add_grant(target, Grantee::Client(w.bob_client))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)), "user-bound client");

    let err = access
        .add_grant(target, Grantee::User("dave".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)), "non-member");

    let err = access
        .add_grant(target, Grantee::User("nobody".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));

    let foreign_role = seed_role(&t.db, "globex", "Guest", false).await;
    let err = access
        .add_grant(target, Grantee::Role(foreign_role))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)), "foreign role");

    let err = access
        .add_grant(GrantTarget::SiteResource(9999), Grantee::Role(w.ops_role))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

#[tokio::test]
async fn test_effective_clients_are_union_of_grant_paths() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;
    let target = GrantTarget::SiteResource(w.ssh);

    access.add_grant(target, Grantee::Role(w.member_role)).await.unwrap();
    access
        .add_grant(target, Grantee::User("carol".to_string()))
        .await
        .unwrap();
    access
        .add_grant(target, Grantee::Client(w.machine_client))
        .await
        .unwrap();

    let mut expected = vec![w.bob_client, w.carol_client, w.machine_client];
    expected.sort_unstable();
    assert_eq!(access.effective_clients(w.ssh).await.unwrap(), expected);

    access
        .remove_grant(target, Grantee::Role(w.member_role))
        .await
        .unwrap();
    let mut expected = vec![w.carol_client, w.machine_client];
    expected.sort_unstable();
    assert_eq!(access.effective_clients(w.ssh).await.unwrap(), expected);

    // Other resources are untouched
    assert!(access.effective_clients(w.web).await.unwrap().is_empty());
    assert!(access.effective_clients(w.db_port).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;

    access
        .set_role_grants(GrantTarget::SiteResource(w.ssh), vec![w.member_role, w.ops_role])
        .await
        .unwrap();
    let before = access.effective_clients(w.ssh).await.unwrap();

    let first = access
        .rebuild_associations(ChangedEntity::SiteResource(w.ssh))
        .await
        .unwrap();
    let second = access
        .rebuild_associations(ChangedEntity::SiteResource(w.ssh))
        .await
        .unwrap();

    assert!(first.is_empty());
    assert!(second.is_empty());
    assert_eq!(access.effective_clients(w.ssh).await.unwrap(), before);
}

#[tokio::test]
async fn test_client_site_peering_follows_last_resource() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;

    let delta = access
        .add_grant(GrantTarget::SiteResource(w.ssh), Grantee::Client(w.machine_client))
        .await
        .unwrap();
    assert_eq!(delta.peers_added.len(), 1);
    assert_eq!(delta.peers_added[0].site_id, w.site_id);

    // A second resource on the same site does not re-peer
    let delta = access
        .add_grant(GrantTarget::SiteResource(w.web), Grantee::Client(w.machine_client))
        .await
        .unwrap();
    assert!(delta.peers_added.is_empty());
    assert_eq!(delta.targets_added.len(), 1);

    let delta = access
        .remove_grant(GrantTarget::SiteResource(w.ssh), Grantee::Client(w.machine_client))
        .await
        .unwrap();
    assert!(delta.peers_removed.is_empty());

    let delta = access
        .remove_grant(GrantTarget::SiteResource(w.web), Grantee::Client(w.machine_client))
        .await
        .unwrap();
    assert_eq!(delta.peers_removed.len(), 1);

    let peered = client_site::Entity::find_by_id((w.machine_client, w.site_id))
        .one(&t.db)
        .await
        .unwrap();
    assert!(peered.is_none());
    let untouched = client_site::Entity::find_by_id((w.machine_client, w.other_site_id))
        .one(&t.db)
        .await
        .unwrap();
    assert!(untouched.is_none());
}

#[tokio::test]
async fn test_owner_role_cannot_change() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;

    let err = t
        .plane
        .access
        .set_user_role("alice", ORG, w.member_role)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Forbidden(_)));
}

#[tokio::test]
async fn test_role_change_rebuilds_user_clients() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;

    access
        .add_grant(GrantTarget::SiteResource(w.ssh), Grantee::Role(w.ops_role))
        .await
        .unwrap();
    assert_eq!(access.effective_clients(w.ssh).await.unwrap(), vec![w.carol_client]);

    let delta = access.set_user_role("bob", ORG, w.ops_role).await.unwrap();
    assert_eq!(delta.targets_added.len(), 1);

    let mut expected = vec![w.bob_client, w.carol_client];
    expected.sort_unstable();
    assert_eq!(access.effective_clients(w.ssh).await.unwrap(), expected);

    access.set_user_role("carol", ORG, w.member_role).await.unwrap();
    assert_eq!(access.effective_clients(w.ssh).await.unwrap(), vec![w.bob_client]);
}

#[tokio::test]
async fn test_delete_role_moves_members_and_drops_grants() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;
    let access = &t.plane.access;

    access
        .add_grant(GrantTarget::SiteResource(w.ssh), Grantee::Role(w.ops_role))
        .await
        .unwrap();

    let err = access.delete_role(w.admin_role, w.member_role).await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)));

    access.delete_role(w.ops_role, w.member_role).await.unwrap();

    let carol = user_org::Entity::find_by_id(("carol".to_string(), ORG.to_string()))
        .one(&t.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(carol.role_id, w.member_role);
    assert!(access.effective_clients(w.ssh).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_role_held_by_owner_is_forbidden() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;

    seed_user(&t.db, "erin").await;
    let founders = seed_role(&t.db, ORG, "Founders", false).await;
    add_member(&t.db, "erin", ORG, founders, true).await;

    let err = t
        .plane
        .access
        .delete_role(founders, w.member_role)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Forbidden(_)));
}

#[tokio::test]
async fn test_committed_grant_is_pushed_to_agents() {
    let t = setup_plane().await;
    let w = seed_world(&t.db).await;

    let newt = t
        .plane
        .sessions
        .register_agent(AgentBinding::Site(w.site_id))
        .await
        .unwrap();
    let olm = t
        .plane
        .sessions
        .register_agent(AgentBinding::Client(w.machine_client))
        .await
        .unwrap();
    let mut newt_rx = t.bus.register(&newt.agent_id).await;
    let mut olm_rx = t.bus.register(&olm.agent_id).await;

    t.plane
        .access
        .add_grant(GrantTarget::SiteResource(w.ssh), Grantee::Client(w.machine_client))
        .await
        .unwrap();

    let first = newt_rx.try_recv().unwrap();
    assert_eq!(first.message_type, message_types::NEWT_PEER_ADD);
    assert_eq!(first.data["publicKey"], "machine-key");
    assert_eq!(first.data["allowedIps"][0], "100.90.128.12/32");

    let second = newt_rx.try_recv().unwrap();
    assert_eq!(second.message_type, message_types::NEWT_TARGETS_ADD);
    assert_eq!(second.data["targets"][0], "ssh.internal:22");

    let olm_msg = olm_rx.try_recv().unwrap();
    assert_eq!(olm_msg.message_type, message_types::OLM_PEER_ADD);
    assert_eq!(olm_msg.data["siteId"], w.site_id);
    assert_eq!(olm_msg.data["endpoint"], "fra.example.com:51820");

    t.plane
        .access
        .remove_grant(GrantTarget::SiteResource(w.ssh), Grantee::Client(w.machine_client))
        .await
        .unwrap();

    let types: Vec<String> = std::iter::from_fn(|| newt_rx.try_recv().ok())
        .map(|m| m.message_type)
        .collect();
    assert_eq!(
        types,
        vec![
            message_types::NEWT_TARGETS_REMOVE.to_string(),
            message_types::NEWT_PEER_REMOVE.to_string()
        ]
    );
    assert_eq!(
        olm_rx.try_recv().unwrap().message_type,
        message_types::OLM_PEER_REMOVE
    );
}
