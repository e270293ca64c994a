//! Agent sessions: issue, sliding renewal, expiry and revocation

mod common;

use burrow_control::{AgentBinding, ControlConfig, ControlError, MAX_DURATION};
use burrow_db::entities::agent_session;
use common::*;
use sea_orm::{EntityTrait, PaginatorTrait};

const TTL_DAYS: i64 = 30;

async fn site_agent(t: &TestPlane) -> burrow_control::AgentCredentials {
    seed_org(&t.db, ORG, None).await;
    let site = seed_site(&t.db, ORG, "hq", None, None, false).await;
    t.plane
        .sessions
        .register_agent(AgentBinding::Site(site.site_id))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_token_is_stored_hashed() {
    let t = setup_plane().await;
    let creds = site_agent(&t).await;

    let issued = t
        .plane
        .sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();
    assert_eq!(issued.expires_at, start_time() + chrono::Duration::days(TTL_DAYS));

    let stored = agent_session::Entity::find().all(&t.db).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_ne!(stored[0].session_id, issued.token);
    assert_eq!(stored[0].session_id, burrow_auth::hash_token(&issued.token));
}

#[tokio::test]
async fn test_wrong_secret_or_agent_is_unauthorized() {
    let t = setup_plane().await;
    let creds = site_agent(&t).await;

    let err = t
        .plane
        .sessions
        .issue_token(&creds.agent_id, "not-the-secret")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Unauthorized(_)));

    let err = t
        .plane
        .sessions
        .issue_token("ghost", &creds.secret)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Unauthorized(_)));

    let err = t.plane.sessions.authenticate("garbage").await.unwrap_err();
    assert!(matches!(err, ControlError::Unauthorized(_)));
}

#[tokio::test]
async fn test_renewal_after_half_ttl_only() {
    let t = setup_plane().await;
    let creds = site_agent(&t).await;
    let sessions = &t.plane.sessions;
    let issued = sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();

    // 10% of the TTL: untouched
    t.clock.advance(chrono::Duration::days(3));
    let agent = sessions.authenticate(&issued.token).await.unwrap();
    assert_eq!(agent.expires_at, issued.expires_at);
    assert!(agent.site_id.is_some());

    // 60% of the TTL: a full TTL from now
    t.clock.advance(chrono::Duration::days(15));
    let now = start_time() + chrono::Duration::days(18);
    let agent = sessions.authenticate(&issued.token).await.unwrap();
    assert_eq!(agent.expires_at, now + chrono::Duration::days(TTL_DAYS));
}

#[tokio::test]
async fn test_continuous_use_never_expires() {
    let t = setup_plane().await;
    let creds = site_agent(&t).await;
    let sessions = &t.plane.sessions;
    let issued = sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();

    for _ in 0..6 {
        t.clock.advance(chrono::Duration::days(20));
        sessions.authenticate(&issued.token).await.unwrap();
    }
}

#[tokio::test]
async fn test_expired_session_is_deleted() {
    let t = setup_plane().await;
    let creds = site_agent(&t).await;
    let sessions = &t.plane.sessions;
    let issued = sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();

    t.clock.advance(chrono::Duration::days(TTL_DAYS + 1));
    let err = sessions.authenticate(&issued.token).await.unwrap_err();
    assert!(matches!(err, ControlError::Unauthorized(_)));
    assert_eq!(agent_session::Entity::find().count(&t.db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalidate_one_and_all() {
    let t = setup_plane().await;
    let creds = site_agent(&t).await;
    let sessions = &t.plane.sessions;

    let first = sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();
    let second = sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();
    let third = sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();

    let agent = sessions.authenticate(&first.token).await.unwrap();
    sessions.invalidate_session(&agent.session_id).await.unwrap();
    assert!(sessions.authenticate(&first.token).await.is_err());
    assert!(sessions.authenticate(&second.token).await.is_ok());

    assert_eq!(sessions.invalidate_all_sessions(&creds.agent_id).await.unwrap(), 2);
    assert!(sessions.authenticate(&second.token).await.is_err());
    assert!(sessions.authenticate(&third.token).await.is_err());
}

#[tokio::test]
async fn test_custom_ttl_is_honoured() {
    let config = ControlConfig {
        session_ttl: std::time::Duration::from_secs(3600),
        ..ControlConfig::default()
    };
    let t = setup_plane_with(config).await;
    let creds = site_agent(&t).await;

    let issued = t
        .plane
        .sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();
    assert_eq!(issued.expires_at, start_time() + chrono::Duration::hours(1));
}

#[tokio::test]
async fn test_oversized_ttl_is_clamped() {
    let config = ControlConfig {
        session_ttl: std::time::Duration::MAX,
        ..ControlConfig::default()
    };
    let t = setup_plane_with(config).await;
    let creds = site_agent(&t).await;

    let issued = t
        .plane
        .sessions
        .issue_token(&creds.agent_id, &creds.secret)
        .await
        .unwrap();
    assert_eq!(
        issued.expires_at,
        start_time() + chrono::Duration::from_std(MAX_DURATION).unwrap()
    );

    let agent = t.plane.sessions.authenticate(&issued.token).await.unwrap();
    assert_eq!(agent.expires_at, issued.expires_at);
}
