// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Routes for signed-in users.

use crate::error::Result;
use crate::middleware::auth::AuthUser;
use crate::models::{LoginHistoryEntry, ProfileUpdate, User};
use crate::routes::{ok, ApiResponse};
use crate::services::LinkedProvider;
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// API routes (require authentication).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/me", get(get_me))
        .route("/auth/profile", put(update_profile))
        .route("/auth/history", get(login_history))
        .route("/auth/oauth/{provider}/bind", post(bind))
        .route("/auth/oauth/{provider}/unbind", post(unbind))
}

// ─── User Profile ────────────────────────────────────────────

/// Current user response.
#[derive(Serialize)]
pub struct MeResponse {
    pub user: User,
    pub linked_providers: Vec<LinkedProvider>,
}

async fn get_me(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<ApiResponse<MeResponse>>> {
    let linked_providers = state.auth.linked_providers(&auth.user.id).await?;
    Ok(ok(MeResponse {
        user: auth.user,
        linked_providers,
    }))
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<ApiResponse<User>>> {
    let user = state.auth.update_profile(&auth.user.id, update).await?;
    Ok(ok(user))
}

async fn login_history(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<ApiResponse<Vec<LoginHistoryEntry>>>> {
    Ok(ok(state.auth.login_history(&auth.user.id).await?))
}

// ─── Account linking ─────────────────────────────────────────

#[derive(Deserialize)]
pub struct BindRequest {
    code: String,
    state: String,
}

async fn bind(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(provider): Path<String>,
    Json(body): Json<BindRequest>,
) -> Result<Json<ApiResponse<LinkedProvider>>> {
    let link = state
        .auth
        .bind_account(&auth.user.id, &provider, &body.code, &body.state)
        .await?;
    Ok(ok(link))
}

#[derive(Serialize)]
pub struct UnbindResponse {
    pub provider: String,
}

async fn unbind(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(provider): Path<String>,
) -> Result<Json<ApiResponse<UnbindResponse>>> {
    state.auth.unbind_account(&auth.user.id, &provider).await?;
    Ok(ok(UnbindResponse { provider }))
}
