// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Public authentication routes: phone login, OAuth handshake, refresh, logout.

use crate::error::Result;
use crate::middleware::auth::{extract_token, AUTH_COOKIE};
use crate::models::{CodePurpose, Session, User};
use crate::routes::{ok, ApiResponse};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/sms/send", post(send_code))
        .route("/auth/login/phone", post(login_phone))
        .route("/auth/oauth/{provider}", get(oauth_start))
        .route("/auth/oauth/{provider}/callback", get(oauth_callback))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/providers", get(providers))
}

// ─── Cookies and redirects ──────────────────────────────────

fn session_cookie(state: &AppState, session: &Session) -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE, session.access_token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.config.base_url.starts_with("https://"))
        .max_age(time::Duration::seconds(
            state.config.session.access_ttl.num_seconds(),
        ))
        .build()
}

fn removal_cookie(state: &AppState) -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE, ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.config.base_url.starts_with("https://"))
        .build()
}

/// 302 to `location`.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Accept only same-site absolute paths as post-login destinations.
fn safe_redirect_path(hint: Option<&str>) -> Option<String> {
    let hint = hint?.trim();
    if hint.starts_with('/') && !hint.starts_with("//") && !hint.contains('\\') {
        Some(hint.to_string())
    } else {
        None
    }
}

// ─── Phone login ────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SendCodeRequest {
    phone: String,
    #[serde(default)]
    purpose: CodePurpose,
}

#[derive(Serialize)]
pub struct SendCodeResponse {
    /// Seconds until the code expires
    pub expires_in: i64,
}

async fn send_code(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendCodeRequest>,
) -> Result<Json<ApiResponse<SendCodeResponse>>> {
    state.auth.send_code(body.phone.trim(), body.purpose).await?;
    Ok(ok(SendCodeResponse {
        expires_in: state.config.otp.code_ttl.num_seconds(),
    }))
}

#[derive(Deserialize)]
pub struct PhoneLoginRequest {
    phone: String,
    code: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub user: User,
    pub session: Session,
    pub is_new_user: bool,
}

async fn login_phone(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<PhoneLoginRequest>,
) -> Result<(CookieJar, Json<ApiResponse<LoginResponse>>)> {
    let login = state
        .auth
        .login_with_phone(body.phone.trim(), body.code.trim())
        .await?;

    let jar = jar.add(session_cookie(&state, &login.session));
    Ok((
        jar,
        ok(LoginResponse {
            user: login.user,
            session: login.session,
            is_new_user: login.is_new_user,
        }),
    ))
}

// ─── OAuth ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct OAuthStartParams {
    /// Frontend path to land on after the callback
    #[serde(default)]
    redirect: Option<String>,
}

/// Start OAuth flow - redirect to the provider's authorization page.
async fn oauth_start(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<OAuthStartParams>,
) -> Result<Response> {
    let hint = safe_redirect_path(params.redirect.as_deref());
    let url = state.auth.begin_oauth(&provider, hint)?;

    tracing::info!(provider = %provider, "Redirecting to OAuth provider");
    Ok(found(&url))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    /// Set by providers when the user declines
    #[serde(default)]
    error: Option<String>,
}

/// OAuth callback - finish the handshake, set the session cookie and send
/// the browser back to the frontend.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> (CookieJar, Response) {
    let frontend = state.config.frontend_url.trim_end_matches('/');
    let failed = |reason: &str| {
        found(&format!(
            "{}/login?error={}",
            frontend,
            urlencoding::encode(reason)
        ))
    };

    if let Some(error) = params.error {
        tracing::warn!(provider = %provider, error = %error, "OAuth denied by provider");
        return (jar, failed("access_denied"));
    }
    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return (jar, failed("invalid_request"));
    };

    match state.auth.complete_oauth(&provider, &code, &oauth_state).await {
        Ok(done) => {
            let path = done.redirect_hint.unwrap_or_else(|| "/".to_string());
            let jar = jar.add(session_cookie(&state, &done.session));
            (jar, found(&format!("{}{}", frontend, path)))
        }
        Err(e) => {
            let kind = serde_json::to_value(e.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "oauth_failed".to_string());
            (jar, failed(&kind))
        }
    }
}

// ─── Sessions ───────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<RefreshRequest>,
) -> Result<(CookieJar, Json<ApiResponse<Session>>)> {
    let session = state.auth.refresh_token(&body.refresh_token).await?;
    let jar = jar.add(session_cookie(&state, &session));
    Ok((jar, ok(session)))
}

/// Logout - revoke the session if a token is present and clear the cookie.
async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, StatusCode)> {
    if let Some(token) = extract_token(&jar, &headers) {
        state.auth.logout(&token).await?;
    }
    let jar = jar.remove(removal_cookie(&state));
    Ok((jar, StatusCode::NO_CONTENT))
}

#[derive(Serialize)]
pub struct ProvidersResponse {
    pub methods: Vec<String>,
}

async fn providers(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ProvidersResponse>> {
    ok(ProvidersResponse {
        methods: state.auth.providers(),
    })
}
