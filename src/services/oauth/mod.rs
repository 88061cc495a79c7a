// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth handshake, provider reconciliation and account linking.
//!
//! A handshake starts with [`OAuthOrchestrator::begin_auth`], which stores a
//! single-use state token, and ends with [`OAuthOrchestrator::complete_auth`],
//! which consumes it before contacting the provider. Provider identities map
//! to local users through [`ProviderAccountLink`] records.

pub mod alipay;
pub mod provider;
pub mod wechat;

pub use alipay::AlipayAdapter;
pub use provider::{OAuthProviderAdapter, ProviderError, ProviderRegistry};
pub use wechat::WechatAdapter;

use crate::db::{AccountRepository, RepoError};
use crate::models::{
    LoginHistoryEntry, LoginMethod, OAuthHandshakeState, Provider, ProviderAccountLink,
    ProviderProfile, ProviderTokens, Session, User,
};
use crate::services::code_store::CodeStore;
use crate::services::session::{SessionError, SessionIssuer};
use crate::time_utils::Clock;
use chrono::Duration;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;

const STATE_LEN: usize = 32;
const NONCE_LEN: usize = 16;

/// OAuth errors
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Provider {0} is not configured")]
    NotConfigured(Provider),

    /// Unknown, expired, replayed, or issued for another provider
    #[error("Invalid or expired OAuth state")]
    InvalidState,

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(ProviderError),

    #[error("Profile fetch failed: {0}")]
    ProfileFetchFailed(ProviderError),

    #[error("Provider account already bound")]
    AlreadyBound,

    #[error("Cannot remove the last login method")]
    LastCredentialStanding,

    #[error("No {0} account linked")]
    NotLinked(Provider),

    #[error("Account not found or disabled")]
    UserNotFound,

    #[error(transparent)]
    Persistence(#[from] RepoError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl OAuthError {
    /// Short reason recorded in login history.
    fn history_reason(&self) -> &'static str {
        match self {
            OAuthError::TokenExchangeFailed(_) => "token_exchange_failed",
            OAuthError::ProfileFetchFailed(_) => "profile_fetch_failed",
            OAuthError::UserNotFound => "user_not_found",
            OAuthError::Persistence(_) => "persistence_failed",
            OAuthError::Session(_) => "session_failed",
            _ => "oauth_failed",
        }
    }
}

/// Successful callback outcome.
#[derive(Debug, Clone)]
pub struct OAuthCompletion {
    pub user: User,
    pub link: ProviderAccountLink,
    pub session: Session,
    pub redirect_hint: Option<String>,
    pub is_new_user: bool,
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub struct OAuthOrchestrator {
    registry: ProviderRegistry,
    store: Arc<CodeStore>,
    repo: Arc<dyn AccountRepository>,
    sessions: Arc<SessionIssuer>,
    clock: Arc<dyn Clock>,
    state_ttl: Duration,
    signup_credits: u32,
}

impl OAuthOrchestrator {
    pub fn new(
        registry: ProviderRegistry,
        store: Arc<CodeStore>,
        repo: Arc<dyn AccountRepository>,
        sessions: Arc<SessionIssuer>,
        clock: Arc<dyn Clock>,
        state_ttl: Duration,
        signup_credits: u32,
    ) -> Self {
        Self {
            registry,
            store,
            repo,
            sessions,
            clock,
            state_ttl,
            signup_credits,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn adapter(
        &self,
        provider: &str,
    ) -> Result<(Provider, Arc<dyn OAuthProviderAdapter>), OAuthError> {
        let provider: Provider = provider
            .parse()
            .map_err(|e: crate::models::UnsupportedProvider| OAuthError::UnsupportedProvider(e.0))?;
        let adapter = self
            .registry
            .get(provider)
            .ok_or(OAuthError::NotConfigured(provider))?;
        Ok((provider, adapter))
    }

    // ─── Handshake ───────────────────────────────────────────────

    /// Store a fresh state token and return the provider's authorization URL.
    pub fn begin_auth(
        &self,
        provider: &str,
        redirect_hint: Option<String>,
    ) -> Result<String, OAuthError> {
        let (provider, adapter) = self.adapter(provider)?;
        let now = self.clock.now();

        let state = OAuthHandshakeState {
            state: random_token(STATE_LEN),
            nonce: random_token(NONCE_LEN),
            provider,
            redirect_hint,
            created_at: now,
            expires_at: now + self.state_ttl,
        };
        let url = adapter.authorize_url(&state.state);
        self.store.put_state(state);

        tracing::debug!(provider = %provider, "OAuth handshake started");
        Ok(url)
    }

    /// Consume the state token, then exchange the code and fetch the profile.
    async fn finish_handshake(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<(Provider, OAuthHandshakeState, ProviderTokens, ProviderProfile), OAuthError> {
        let (provider, adapter) = self.adapter(provider)?;

        let handshake = self
            .store
            .take_state(state, provider)
            .ok_or(OAuthError::InvalidState)?;

        let tokens = adapter
            .exchange_code(code)
            .await
            .map_err(OAuthError::TokenExchangeFailed)?;
        let profile = adapter
            .fetch_profile(&tokens)
            .await
            .map_err(OAuthError::ProfileFetchFailed)?;

        if profile.provider != provider {
            return Err(OAuthError::ProfileFetchFailed(ProviderError::InvalidResponse(
                format!("{} adapter returned a {} profile", provider, profile.provider),
            )));
        }
        Ok((provider, handshake, tokens, profile))
    }

    /// Finish a login handshake: resolve or create the user and open a session.
    pub async fn complete_auth(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<OAuthCompletion, OAuthError> {
        let (provider, handshake, tokens, profile) = match self
            .finish_handshake(provider, code, state)
            .await
        {
            Ok(parts) => parts,
            Err(e @ (OAuthError::TokenExchangeFailed(_) | OAuthError::ProfileFetchFailed(_))) => {
                if let Ok(p) = provider.parse::<Provider>() {
                    self.record_failure(p, &e).await;
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        match self.login(provider, &tokens, &profile).await {
            Ok((user, link, session, is_new_user)) => Ok(OAuthCompletion {
                user,
                link,
                session,
                redirect_hint: handshake.redirect_hint,
                is_new_user,
            }),
            Err(e) => {
                self.record_failure(provider, &e).await;
                Err(e)
            }
        }
    }

    async fn login(
        &self,
        provider: Provider,
        tokens: &ProviderTokens,
        profile: &ProviderProfile,
    ) -> Result<(User, ProviderAccountLink, Session, bool), OAuthError> {
        let (mut user, link, is_new_user) = self.reconcile(tokens, profile).await?;

        let now = self.clock.now();
        let method = LoginMethod::OAuth(provider);
        user.last_login_at = now;
        user.updated_at = now;
        // A deactivation since `reconcile` read the user surfaces here.
        self.repo.update_user(&user).await.map_err(|e| match e {
            RepoError::NotFound(_) => OAuthError::UserNotFound,
            other => other.into(),
        })?;

        let session = self.sessions.issue(&user, method).await?;

        if let Err(e) = self
            .repo
            .record_login(&LoginHistoryEntry::success(&user.id, method, now))
            .await
        {
            tracing::warn!(user_id = %user.id, error = %e, "Failed to record login history");
        }

        tracing::info!(
            user_id = %user.id,
            provider = %provider,
            is_new_user,
            "OAuth login completed"
        );
        Ok((user, link, session, is_new_user))
    }

    /// Map a provider identity to a local user, creating both on first sight.
    async fn reconcile(
        &self,
        tokens: &ProviderTokens,
        profile: &ProviderProfile,
    ) -> Result<(User, ProviderAccountLink, bool), OAuthError> {
        let now = self.clock.now();

        if let Some(mut link) = self
            .repo
            .find_link(profile.provider, &profile.provider_user_id)
            .await?
        {
            link.refresh_snapshot(profile, tokens, now);
            self.repo.update_link(&link).await?;

            let user = self
                .repo
                .find_user_by_id(&link.user_id)
                .await?
                .ok_or(OAuthError::UserNotFound)?;
            return Ok((user, link, false));
        }

        let display_name = profile.username.clone().unwrap_or_else(|| {
            match profile.provider {
                Provider::Wechat => "微信用户",
                Provider::Alipay => "支付宝用户",
            }
            .to_string()
        });
        let mut user = User::new(
            display_name,
            LoginMethod::OAuth(profile.provider),
            self.signup_credits,
            now,
        );
        user.email = profile.email.clone();
        if profile.avatar.is_some() {
            user.avatar_url = profile.avatar.clone();
        }
        let link = ProviderAccountLink::new(&user.id, profile, tokens, true, now);

        // A conflict here means a concurrent first login claimed this identity.
        self.repo.insert_user_with_link(&user, &link).await?;

        tracing::info!(
            user_id = %user.id,
            provider = %profile.provider,
            "Created user from provider identity"
        );
        Ok((user, link, true))
    }

    async fn record_failure(&self, provider: Provider, err: &OAuthError) {
        let entry = LoginHistoryEntry::failure(
            None,
            LoginMethod::OAuth(provider),
            err.history_reason(),
            self.clock.now(),
        );
        if let Err(e) = self.repo.record_login(&entry).await {
            tracing::warn!(provider = %provider, error = %e, "Failed to record login history");
        }
    }

    // ─── Linking ─────────────────────────────────────────────────

    /// Attach a provider identity to an existing user.
    pub async fn bind_account(
        &self,
        user_id: &str,
        profile: &ProviderProfile,
        tokens: &ProviderTokens,
    ) -> Result<ProviderAccountLink, OAuthError> {
        self.repo
            .find_user_by_id(user_id)
            .await?
            .ok_or(OAuthError::UserNotFound)?;

        let existing = self.repo.links_for_user(user_id).await?;
        if existing.iter().any(|l| l.provider == profile.provider) {
            return Err(OAuthError::AlreadyBound);
        }
        if self
            .repo
            .find_link(profile.provider, &profile.provider_user_id)
            .await?
            .is_some()
        {
            return Err(OAuthError::AlreadyBound);
        }

        let link = ProviderAccountLink::new(user_id, profile, tokens, false, self.clock.now());
        self.repo.insert_link(&link).await.map_err(|e| match e {
            RepoError::Conflict(_) => OAuthError::AlreadyBound,
            other => other.into(),
        })?;

        tracing::info!(user_id, provider = %profile.provider, "Provider account bound");
        Ok(link)
    }

    /// Run a handshake on behalf of a signed-in user and bind the result.
    pub async fn complete_bind(
        &self,
        user_id: &str,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<ProviderAccountLink, OAuthError> {
        let (_, _, tokens, profile) = self.finish_handshake(provider, code, state).await?;
        self.bind_account(user_id, &profile, &tokens).await
    }

    /// Remove a provider link, refusing to strand the user without a login method.
    pub async fn unbind_account(&self, user_id: &str, provider: &str) -> Result<(), OAuthError> {
        let provider: Provider = provider
            .parse()
            .map_err(|e: crate::models::UnsupportedProvider| OAuthError::UnsupportedProvider(e.0))?;

        let user = self
            .repo
            .find_user_by_id(user_id)
            .await?
            .ok_or(OAuthError::UserNotFound)?;
        let links = self.repo.links_for_user(user_id).await?;

        let target = links
            .iter()
            .find(|l| l.provider == provider)
            .ok_or(OAuthError::NotLinked(provider))?;

        let others = links.iter().filter(|l| l.provider != provider).count();
        if user.phone.is_none() && others == 0 {
            return Err(OAuthError::LastCredentialStanding);
        }

        self.repo
            .delete_link(provider, &target.provider_user_id)
            .await?;

        tracing::info!(user_id, provider = %provider, "Provider account unbound");
        Ok(())
    }

    /// Links held by a user, for display.
    pub async fn linked_accounts(
        &self,
        user_id: &str,
    ) -> Result<Vec<ProviderAccountLink>, OAuthError> {
        Ok(self.repo.links_for_user(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPolicy;
    use crate::db::MemoryRepository;
    use crate::time_utils::ManualClock;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &[u8] = b"test_jwt_key_32_bytes_minimum!!!";

    /// Provider double: the authorization code doubles as the provider user id.
    struct FakeProvider {
        provider: Provider,
        exchanges: AtomicUsize,
        fail_exchange: bool,
    }

    impl FakeProvider {
        fn new(provider: Provider) -> Self {
            Self {
                provider,
                exchanges: AtomicUsize::new(0),
                fail_exchange: false,
            }
        }
    }

    #[async_trait]
    impl OAuthProviderAdapter for FakeProvider {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn authorize_url(&self, state: &str) -> String {
            format!("https://provider.test/authorize?state={}", state)
        }

        async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ProviderError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.fail_exchange {
                return Err(ProviderError::Api {
                    code: "40029".to_string(),
                    message: "invalid code".to_string(),
                });
            }
            Ok(ProviderTokens {
                access_token: format!("at-{}", code),
                refresh_token: None,
                expires_in: Some(7200),
                provider_user_id: Some(code.to_string()),
                raw: serde_json::Value::Null,
            })
        }

        async fn fetch_profile(
            &self,
            tokens: &ProviderTokens,
        ) -> Result<ProviderProfile, ProviderError> {
            let id = tokens.provider_user_id.clone().unwrap_or_default();
            Ok(ProviderProfile {
                provider: self.provider,
                username: Some(format!("nick-{}", id)),
                provider_user_id: id,
                avatar: None,
                email: None,
                raw: serde_json::Value::Null,
            })
        }
    }

    struct Harness {
        oauth: OAuthOrchestrator,
        repo: Arc<MemoryRepository>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(adapter: FakeProvider) -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(CodeStore::new(clock.clone()));
        let sessions = Arc::new(SessionIssuer::new(
            KEY,
            repo.clone(),
            clock.clone(),
            SessionPolicy::default(),
        ));
        let oauth = OAuthOrchestrator::new(
            ProviderRegistry::new().with(Arc::new(adapter)),
            store,
            repo.clone(),
            sessions,
            clock.clone(),
            Duration::minutes(10),
            30,
        );
        Harness { oauth, repo, clock }
    }

    fn harness() -> Harness {
        harness_with(FakeProvider::new(Provider::Wechat))
    }

    fn state_of(url: &str) -> String {
        url.split("state=").nth(1).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_begin_auth_rejects_unknown_and_unconfigured() {
        let h = harness();
        assert!(matches!(
            h.oauth.begin_auth("github", None),
            Err(OAuthError::UnsupportedProvider(p)) if p == "github"
        ));
        assert!(matches!(
            h.oauth.begin_auth("alipay", None),
            Err(OAuthError::NotConfigured(Provider::Alipay))
        ));
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let h = harness();
        let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());
        assert_eq!(state.len(), STATE_LEN);

        let done = h.oauth.complete_auth("wechat", "openid-1", &state).await.unwrap();
        assert!(done.is_new_user);
        assert_eq!(done.user.credits, 30);
        assert!(done.link.is_primary);
        assert!(!done.session.access_token.is_empty());

        let err = h.oauth.complete_auth("wechat", "openid-1", &state).await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidState));
    }

    #[tokio::test]
    async fn test_expired_state() {
        let h = harness();
        let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());
        h.clock.advance(Duration::minutes(11));

        let err = h.oauth.complete_auth("wechat", "openid-1", &state).await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidState));
    }

    #[tokio::test]
    async fn test_returning_identity_resolves_same_user() {
        let h = harness();
        let first = {
            let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());
            h.oauth.complete_auth("wechat", "openid-1", &state).await.unwrap()
        };
        let second = {
            let state = state_of(&h.oauth.begin_auth("wechat", Some("/works".into())).unwrap());
            h.oauth.complete_auth("wechat", "openid-1", &state).await.unwrap()
        };

        assert_eq!(first.user.id, second.user.id);
        assert!(!second.is_new_user);
        assert_eq!(second.redirect_hint.as_deref(), Some("/works"));
        assert_eq!(second.user.display_name, "nick-openid-1");
    }

    #[tokio::test]
    async fn test_exchange_failure_is_recorded() {
        let mut adapter = FakeProvider::new(Provider::Wechat);
        adapter.fail_exchange = true;
        let h = harness_with(adapter);
        let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());

        let err = h.oauth.complete_auth("wechat", "x", &state).await.unwrap_err();
        assert!(matches!(err, OAuthError::TokenExchangeFailed(_)));
        assert_eq!(h.repo.history_len(), 1);
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let h = harness();
        let now = h.clock.now();
        let user = User::from_phone("13800000000", 30, now);
        h.repo.insert_user(&user).await.unwrap();

        let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());
        let link = h
            .oauth
            .complete_bind(&user.id, "wechat", "openid-9", &state)
            .await
            .unwrap();
        assert!(!link.is_primary);

        // Same provider twice is refused
        let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());
        let err = h
            .oauth
            .complete_bind(&user.id, "wechat", "openid-10", &state)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::AlreadyBound));

        // User still has a phone, so the link can go
        h.oauth.unbind_account(&user.id, "wechat").await.unwrap();
        assert!(matches!(
            h.oauth.unbind_account(&user.id, "wechat").await,
            Err(OAuthError::NotLinked(Provider::Wechat))
        ));
    }

    #[tokio::test]
    async fn test_identity_linked_elsewhere_cannot_be_bound() {
        let h = harness();
        let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());
        h.oauth.complete_auth("wechat", "openid-1", &state).await.unwrap();

        let other = User::from_phone("13900000000", 30, h.clock.now());
        h.repo.insert_user(&other).await.unwrap();

        let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());
        let err = h
            .oauth
            .complete_bind(&other.id, "wechat", "openid-1", &state)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::AlreadyBound));
    }

    #[tokio::test]
    async fn test_unbind_last_credential() {
        let h = harness();
        let state = state_of(&h.oauth.begin_auth("wechat", None).unwrap());
        let done = h.oauth.complete_auth("wechat", "openid-1", &state).await.unwrap();

        let err = h
            .oauth
            .unbind_account(&done.user.id, "wechat")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::LastCredentialStanding));
        assert_eq!(h.oauth.linked_accounts(&done.user.id).await.unwrap().len(), 1);
    }
}
