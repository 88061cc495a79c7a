// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Auth facade: the operations the API layer calls.
//!
//! Every operation returns [`crate::error::Result`]. Component errors are
//! normalized into [`AuthError`], and a panic inside an operation is caught
//! and reported as a persistence failure instead of unwinding into the caller.

use crate::config::Config;
use crate::db::{AccountRepository, RepoError};
use crate::error::{AuthError, ErrorKind, Result};
use crate::models::{
    CodePurpose, LoginHistoryEntry, LoginMethod, Profile, ProfileUpdate, Provider, Session, User,
};
use crate::services::code_store::CodeStore;
use crate::services::oauth::{OAuthCompletion, OAuthOrchestrator, ProviderRegistry};
use crate::services::otp::{is_valid_phone, mask_phone, CodeGenerator, OtpManager};
use crate::services::rate_limit::RateLimiter;
use crate::services::session::SessionIssuer;
use crate::services::sms::CodeDelivery;
use crate::time_utils::Clock;
use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use regex::Regex;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};

static NICKNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[一-龥a-zA-Z0-9_-]+$").expect("nickname regex is valid")
});

const NICKNAME_MIN: usize = 2;
const NICKNAME_MAX: usize = 20;

/// Upper bound on login history rows returned to a user.
pub const MAX_HISTORY: usize = 50;

/// Run a facade operation, turning a panic into an ordinary failure.
async fn guarded<T, F>(op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(AuthError::internal(
            ErrorKind::PersistenceFailure,
            &format!("panic in {}", op),
        )),
    }
}

/// Synchronous counterpart of [`guarded`].
fn guarded_sync<T, F>(op: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => Err(AuthError::internal(
            ErrorKind::PersistenceFailure,
            &format!("panic in {}", op),
        )),
    }
}

/// A user write that finds no active account means it was deactivated or removed.
fn account_gone(err: RepoError) -> AuthError {
    match err {
        RepoError::NotFound(_) => {
            AuthError::new(ErrorKind::NotFound, "Account not found or disabled")
        }
        other => other.into(),
    }
}

fn validate_nickname(nickname: &str) -> Result<()> {
    let len = nickname.chars().count();
    if !(NICKNAME_MIN..=NICKNAME_MAX).contains(&len) {
        return Err(AuthError::invalid_input(format!(
            "Nickname must be {}-{} characters",
            NICKNAME_MIN, NICKNAME_MAX
        )));
    }
    if !NICKNAME_RE.is_match(nickname) {
        return Err(AuthError::invalid_input(
            "Nickname may only contain Chinese characters, letters, digits, _ and -",
        ));
    }
    Ok(())
}

/// Result of a phone login.
#[derive(Debug, Clone)]
pub struct PhoneLogin {
    pub user: User,
    pub session: Session,
    pub is_new_user: bool,
}

/// Provider link as shown to its owner. Provider tokens stay server-side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedProvider {
    pub provider: Provider,
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub is_primary: bool,
    pub linked_at: DateTime<Utc>,
}

/// Collaborators the facade cannot build from configuration alone.
pub struct AuthDeps {
    pub repo: Arc<dyn AccountRepository>,
    pub delivery: Arc<dyn CodeDelivery>,
    pub generator: Arc<dyn CodeGenerator>,
    pub registry: ProviderRegistry,
    pub clock: Arc<dyn Clock>,
}

pub struct AuthFacade {
    otp: OtpManager,
    oauth: OAuthOrchestrator,
    sessions: Arc<SessionIssuer>,
    repo: Arc<dyn AccountRepository>,
    store: Arc<CodeStore>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    signup_credits: u32,
}

impl AuthFacade {
    /// Wire every component from `config` and the injected collaborators.
    pub fn new(config: &Config, deps: AuthDeps) -> Self {
        let store = Arc::new(CodeStore::new(deps.clock.clone()));
        let limiter = Arc::new(RateLimiter::new(deps.clock.clone()));
        let sessions = Arc::new(SessionIssuer::new(
            &config.jwt_signing_key,
            deps.repo.clone(),
            deps.clock.clone(),
            config.session.clone(),
        ));
        let otp = OtpManager::new(
            store.clone(),
            limiter.clone(),
            deps.delivery,
            deps.generator,
            config.otp.clone(),
            deps.clock.clone(),
        );
        let oauth = OAuthOrchestrator::new(
            deps.registry,
            store.clone(),
            deps.repo.clone(),
            sessions.clone(),
            deps.clock.clone(),
            config.oauth_state_ttl,
            config.signup_credits,
        );

        Self {
            otp,
            oauth,
            sessions,
            repo: deps.repo,
            store,
            limiter,
            clock: deps.clock,
            signup_credits: config.signup_credits,
        }
    }

    // ─── Phone login ─────────────────────────────────────────────

    pub async fn send_code(&self, phone: &str, purpose: CodePurpose) -> Result<()> {
        guarded("send_code", async {
            self.otp.request_code(phone, purpose).await?;
            Ok(())
        })
        .await
    }

    pub async fn login_with_phone(&self, phone: &str, code: &str) -> Result<PhoneLogin> {
        guarded("login_with_phone", async {
            if !is_valid_phone(phone) {
                return Err(AuthError::invalid_input("Invalid phone number"));
            }
            if !self.otp.is_valid_code_format(code) {
                return Err(AuthError::invalid_input("Invalid verification code format"));
            }

            let decision = self.limiter.allow(
                &format!("login:{}", phone),
                Duration::minutes(1),
                self.otp.policy().login_attempts_per_minute,
            );
            if !decision.allowed {
                tracing::warn!(phone = %mask_phone(phone), "Phone login rate limited");
                return Err(AuthError::new(
                    ErrorKind::RateLimited,
                    "Too many login attempts, please try again later",
                ));
            }

            if let Err(e) = self.otp.verify_code(phone, code, CodePurpose::Login).await {
                let entry = LoginHistoryEntry::failure(
                    None,
                    LoginMethod::Phone,
                    e.to_string(),
                    self.clock.now(),
                );
                self.record_history(&entry).await;
                return Err(e.into());
            }

            let (user, session, is_new_user) = match self.open_phone_session(phone).await {
                Ok(done) => done,
                Err(e) => {
                    let entry = LoginHistoryEntry::failure(
                        None,
                        LoginMethod::Phone,
                        e.message.clone(),
                        self.clock.now(),
                    );
                    self.record_history(&entry).await;
                    return Err(e);
                }
            };

            tracing::info!(
                user_id = %user.id,
                phone = %mask_phone(phone),
                is_new_user,
                "Phone login completed"
            );
            Ok(PhoneLogin {
                user,
                session,
                is_new_user,
            })
        })
        .await
    }

    /// Resolve the verified phone to a user and issue a session. History
    /// records success only once the session exists.
    async fn open_phone_session(&self, phone: &str) -> Result<(User, Session, bool)> {
        let (mut user, is_new_user) = self.find_or_create_phone_user(phone).await?;

        let now = self.clock.now();
        user.last_login_at = now;
        user.updated_at = now;
        self.repo.update_user(&user).await.map_err(account_gone)?;

        let session = self.sessions.issue(&user, LoginMethod::Phone).await?;
        self.record_history(&LoginHistoryEntry::success(&user.id, LoginMethod::Phone, now))
            .await;
        Ok((user, session, is_new_user))
    }

    async fn find_or_create_phone_user(&self, phone: &str) -> Result<(User, bool)> {
        if let Some(user) = self.repo.find_user_by_phone(phone).await? {
            return Ok((user, false));
        }

        let user = User::from_phone(phone, self.signup_credits, self.clock.now());
        match self.repo.insert_user(&user).await {
            Ok(()) => {
                tracing::info!(user_id = %user.id, phone = %mask_phone(phone), "Created user from phone");
                Ok((user, true))
            }
            // Lost a race with a concurrent first login, or the phone belongs
            // to a deactivated account.
            Err(RepoError::Conflict(_)) => self
                .repo
                .find_user_by_phone(phone)
                .await?
                .map(|u| (u, false))
                .ok_or_else(|| {
                    AuthError::new(ErrorKind::NotFound, "Account not found or disabled")
                }),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_history(&self, entry: &LoginHistoryEntry) {
        if let Err(e) = self.repo.record_login(entry).await {
            tracing::warn!(error = %e, method = %entry.login_method, "Failed to record login history");
        }
    }

    // ─── OAuth ───────────────────────────────────────────────────

    pub fn begin_oauth(&self, provider: &str, redirect_hint: Option<String>) -> Result<String> {
        guarded_sync("begin_oauth", || {
            Ok(self.oauth.begin_auth(provider, redirect_hint)?)
        })
    }

    pub async fn complete_oauth(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<OAuthCompletion> {
        guarded("complete_oauth", async {
            Ok(self.oauth.complete_auth(provider, code, state).await?)
        })
        .await
    }

    pub async fn bind_account(
        &self,
        user_id: &str,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<LinkedProvider> {
        guarded("bind_account", async {
            let link = self
                .oauth
                .complete_bind(user_id, provider, code, state)
                .await?;
            Ok(LinkedProvider {
                provider: link.provider,
                username: link.username,
                avatar: link.avatar,
                is_primary: link.is_primary,
                linked_at: link.created_at,
            })
        })
        .await
    }

    pub async fn unbind_account(&self, user_id: &str, provider: &str) -> Result<()> {
        guarded("unbind_account", async {
            Ok(self.oauth.unbind_account(user_id, provider).await?)
        })
        .await
    }

    pub async fn linked_providers(&self, user_id: &str) -> Result<Vec<LinkedProvider>> {
        guarded("linked_providers", async {
            let links = self.oauth.linked_accounts(user_id).await?;
            Ok(links
                .into_iter()
                .map(|l| LinkedProvider {
                    provider: l.provider,
                    username: l.username,
                    avatar: l.avatar,
                    is_primary: l.is_primary,
                    linked_at: l.created_at,
                })
                .collect())
        })
        .await
    }

    /// Enabled login methods: `phone` plus every configured provider.
    pub fn providers(&self) -> Vec<String> {
        std::iter::once("phone".to_string())
            .chain(
                self.oauth
                    .registry()
                    .providers()
                    .into_iter()
                    .map(|p| p.to_string()),
            )
            .collect()
    }

    // ─── Sessions and profile ────────────────────────────────────

    /// Resolve the user behind an access token. The account is re-read on
    /// every call so deactivation takes effect immediately.
    pub async fn get_current_user(&self, access_token: &str) -> Result<User> {
        guarded("get_current_user", async {
            let claims = self.sessions.verify_access_token(access_token)?;
            self.repo
                .find_user_by_id(&claims.sub)
                .await?
                .ok_or_else(|| AuthError::new(ErrorKind::Mismatch, "Account not found or disabled"))
        })
        .await
    }

    pub async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> Result<User> {
        guarded("update_profile", async {
            if update.is_empty() {
                return Err(AuthError::invalid_input("No profile fields to update"));
            }
            if let Some(nickname) = &update.nickname {
                validate_nickname(nickname)?;
            }

            let mut user = self
                .repo
                .find_user_by_id(user_id)
                .await?
                .ok_or_else(|| AuthError::new(ErrorKind::NotFound, "User not found"))?;

            let now = self.clock.now();
            let profile = user
                .profile
                .get_or_insert_with(|| Profile::with_defaults(&user.display_name, now));
            update.apply(profile, now);
            if let Some(nickname) = &update.nickname {
                user.display_name = nickname.clone();
            }
            user.updated_at = now;
            self.repo.update_user(&user).await.map_err(account_gone)?;

            tracing::info!(user_id, "Profile updated");
            Ok(user)
        })
        .await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Session> {
        guarded("refresh_token", async {
            let (session, _) = self.sessions.refresh(refresh_token).await?;
            Ok(session)
        })
        .await
    }

    /// Always succeeds for well-behaved storage; an unknown token is not an error.
    pub async fn logout(&self, access_token: &str) -> Result<()> {
        guarded("logout", async {
            self.sessions.revoke(access_token).await?;
            Ok(())
        })
        .await
    }

    pub async fn login_history(&self, user_id: &str) -> Result<Vec<LoginHistoryEntry>> {
        guarded("login_history", async {
            Ok(self.repo.login_history(user_id, MAX_HISTORY).await?)
        })
        .await
    }

    // ─── Maintenance ─────────────────────────────────────────────

    /// Drop expired codes and states and idle rate-limit buckets.
    pub fn purge_expired(&self) -> (usize, usize) {
        let entries = self.store.purge_expired();
        let buckets = self.limiter.sweep();
        if entries > 0 || buckets > 0 {
            tracing::debug!(entries, buckets, "Purged expired auth state");
        }
        (entries, buckets)
    }
}
