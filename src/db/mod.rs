// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Account repository: the system of record for users, provider links,
//! sessions and login history.
//!
//! Two implementations sit behind [`AccountRepository`]: an in-process
//! [`MemoryRepository`] for development and tests, and [`FirestoreRepository`]
//! for deployments. Which one runs is decided once from configuration.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreRepository;
pub use memory::MemoryRepository;

use crate::models::{LoginHistoryEntry, Provider, ProviderAccountLink, SessionRecord, User};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    /// Phone number to user id, one document per phone (uniqueness guard)
    pub const PHONE_INDEX: &str = "phone_index";
    /// Keyed by `{provider}:{provider_user_id}`
    pub const PROVIDER_LINKS: &str = "provider_links";
    /// Keyed by `{user_id}:{provider}`, one link per provider per user
    pub const USER_PROVIDERS: &str = "user_providers";
    pub const LOGIN_HISTORY: &str = "login_history";
    /// Keyed by refresh token hash
    pub const SESSIONS: &str = "sessions";
}

/// Document id of the per-user provider guard.
pub fn user_provider_key(user_id: &str, provider: Provider) -> String {
    format!("{}:{}", user_id, provider)
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness guard rejected the write
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Persistence call timed out")]
    Timeout,

    #[error("Database error: {0}")]
    Backend(String),
}

/// Bound a persistence call by `limit`.
pub async fn timed<T, F>(limit: Duration, fut: F) -> Result<T, RepoError>
where
    F: Future<Output = Result<T, RepoError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RepoError::Timeout)?
}

/// Persistence contract for the auth core.
///
/// User lookups never return users with `is_active == false`. Inserts that
/// carry a uniqueness guard (phone number, provider identity, provider per
/// user, user id) fail with [`RepoError::Conflict`] instead of overwriting.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    // ─── Users ───────────────────────────────────────────────────

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, RepoError>;

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>, RepoError>;

    /// Insert a new user, claiming its phone number if it has one.
    async fn insert_user(&self, user: &User) -> Result<(), RepoError>;

    /// Insert a new user and its first provider link as one unit.
    async fn insert_user_with_link(
        &self,
        user: &User,
        link: &ProviderAccountLink,
    ) -> Result<(), RepoError>;

    /// Overwrite mutable user fields. The phone number is not re-indexed and
    /// the stored `is_active` flag is kept. A deactivated user is `NotFound`.
    async fn update_user(&self, user: &User) -> Result<(), RepoError>;

    /// Activate or deactivate a user. Deactivated users vanish from lookups.
    async fn set_user_active(&self, id: &str, active: bool) -> Result<(), RepoError>;

    // ─── Provider links ──────────────────────────────────────────

    async fn find_link(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Option<ProviderAccountLink>, RepoError>;

    async fn links_for_user(&self, user_id: &str) -> Result<Vec<ProviderAccountLink>, RepoError>;

    /// Conflicts when the identity is taken or the user already holds a
    /// link for the same provider.
    async fn insert_link(&self, link: &ProviderAccountLink) -> Result<(), RepoError>;

    async fn update_link(&self, link: &ProviderAccountLink) -> Result<(), RepoError>;

    /// Returns whether a link was removed.
    async fn delete_link(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<bool, RepoError>;

    // ─── Login history ───────────────────────────────────────────

    async fn record_login(&self, entry: &LoginHistoryEntry) -> Result<(), RepoError>;

    /// Most recent entries first.
    async fn login_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LoginHistoryEntry>, RepoError>;

    // ─── Sessions ────────────────────────────────────────────────

    async fn insert_session(&self, record: &SessionRecord) -> Result<(), RepoError>;

    /// Atomically remove and return the session with this refresh hash.
    /// Of two concurrent callers at most one gets `Some`.
    async fn take_session(&self, refresh_hash: &str) -> Result<Option<SessionRecord>, RepoError>;

    /// Delete every session issued with this access token id. Returns the count.
    async fn delete_sessions_by_access_jti(&self, access_jti: &str) -> Result<usize, RepoError>;
}
