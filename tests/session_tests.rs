// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session issue, refresh rotation, revocation and account deactivation.

use authgate::db::AccountRepository;
use authgate::error::ErrorKind;
use authgate::models::{CodePurpose, Session, User};
use chrono::Duration;

mod common;
use common::{TestApp, PHONE};

async fn phone_login(app: &TestApp) -> (User, Session) {
    let auth = &app.state.auth;
    auth.send_code(PHONE, CodePurpose::Login).await.unwrap();
    let code = app.delivery.last_code(PHONE).unwrap();
    let login = auth.login_with_phone(PHONE, &code).await.unwrap();
    (login.user, login.session)
}

#[tokio::test]
async fn test_access_token_resolves_current_user() {
    let app = common::create_test_app();
    let (user, session) = phone_login(&app).await;

    let current = app
        .state
        .auth
        .get_current_user(&session.access_token)
        .await
        .unwrap();
    assert_eq!(current.id, user.id);
}

#[tokio::test]
async fn test_refresh_token_is_not_an_access_token() {
    let app = common::create_test_app();
    let (_, session) = phone_login(&app).await;

    let err = app
        .state
        .auth
        .get_current_user(&session.refresh_token)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Mismatch);

    let err = app
        .state
        .auth
        .refresh_token(&session.access_token)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Mismatch);
}

#[tokio::test]
async fn test_garbage_token_is_mismatch() {
    let app = common::create_test_app();

    for token in ["", "not-a-jwt", "a.b.c"] {
        let err = app.state.auth.get_current_user(token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Mismatch, "{:?}", token);
    }
}

#[tokio::test]
async fn test_access_token_expires() {
    let app = common::create_test_app();
    let (_, session) = phone_login(&app).await;

    app.clock.advance(Duration::days(7) + Duration::seconds(1));
    let err = app
        .state
        .auth
        .get_current_user(&session.access_token)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Expired);
}

#[tokio::test]
async fn test_refresh_rotates_and_is_single_use() {
    let app = common::create_test_app();
    let auth = &app.state.auth;
    let (user, session) = phone_login(&app).await;

    app.clock.advance(Duration::seconds(1));
    let rotated = auth.refresh_token(&session.refresh_token).await.unwrap();
    assert_eq!(rotated.user_id, user.id);
    assert_ne!(rotated.refresh_token, session.refresh_token);
    assert_eq!(app.repo.session_count(), 1);

    let err = auth.refresh_token(&session.refresh_token).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Mismatch);

    // The new pair keeps working
    auth.get_current_user(&rotated.access_token).await.unwrap();
    auth.refresh_token(&rotated.refresh_token).await.unwrap();
}

#[tokio::test]
async fn test_refresh_after_refresh_ttl_is_expired() {
    let app = common::create_test_app();
    let (_, session) = phone_login(&app).await;

    app.clock.advance(Duration::days(30) + Duration::seconds(1));
    let err = app
        .state
        .auth
        .refresh_token(&session.refresh_token)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Expired);
}

#[tokio::test]
async fn test_logout_revokes_refresh_and_is_idempotent() {
    let app = common::create_test_app();
    let auth = &app.state.auth;
    let (_, session) = phone_login(&app).await;
    assert_eq!(app.repo.session_count(), 1);

    auth.logout(&session.access_token).await.unwrap();
    assert_eq!(app.repo.session_count(), 0);
    auth.logout(&session.access_token).await.unwrap();
    auth.logout("not-a-jwt").await.unwrap();

    let err = auth.refresh_token(&session.refresh_token).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Mismatch);
}

#[tokio::test]
async fn test_deactivated_user_cannot_use_or_refresh_session() {
    let app = common::create_test_app();
    let auth = &app.state.auth;
    let (user, session) = phone_login(&app).await;

    app.repo.set_user_active(&user.id, false).await.unwrap();

    let err = auth
        .get_current_user(&session.access_token)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Mismatch);

    let err = auth.refresh_token(&session.refresh_token).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_sessions_from_separate_logins_are_independent() {
    let app = common::create_test_app();
    let auth = &app.state.auth;
    let (_, first) = phone_login(&app).await;
    app.clock.advance(Duration::seconds(1));
    let (_, second) = phone_login(&app).await;
    assert_eq!(app.repo.session_count(), 2);

    auth.logout(&first.access_token).await.unwrap();
    auth.refresh_token(&second.refresh_token).await.unwrap();
}
