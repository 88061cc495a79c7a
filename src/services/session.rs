// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session token issuance, verification, rotation and revocation.
//!
//! Access and refresh tokens are HS256 JWTs signed with the configured key.
//! Access tokens are checked by signature and expiry only. Refresh tokens are
//! also recorded in the repository under an HMAC of the token, and each
//! refresh consumes that record before a new pair is issued.

use crate::config::SessionPolicy;
use crate::db::{AccountRepository, RepoError};
use crate::models::{LoginMethod, Session, SessionRecord, User};
use crate::time_utils::Clock;
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Malformed token")]
    Malformed,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    /// Unknown, already rotated, or wrong kind of token
    #[error("Invalid or revoked token")]
    InvalidToken,

    #[error("Account not found or disabled")]
    UserNotFound,

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Persistence(#[from] RepoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claims structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Login method the session was opened with
    pub provider: LoginMethod,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Unique token id
    pub jti: String,
}

pub struct SessionIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    hash_key: Vec<u8>,
    repo: Arc<dyn AccountRepository>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
}

impl SessionIssuer {
    pub fn new(
        signing_key: &[u8],
        repo: Arc<dyn AccountRepository>,
        clock: Arc<dyn Clock>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(signing_key),
            decoding_key: DecodingKey::from_secret(signing_key),
            hash_key: signing_key.to_vec(),
            repo,
            clock,
            policy,
        }
    }

    /// Mint a fresh access/refresh pair for `user` and record the refresh half.
    pub async fn issue(&self, user: &User, method: LoginMethod) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let access_exp = now + self.policy.access_ttl;
        let refresh_exp = now + self.policy.refresh_ttl;
        let access_jti = uuid::Uuid::new_v4().to_string();

        let access_token = self.sign(&Claims {
            sub: user.id.clone(),
            provider: method,
            token_type: TokenType::Access,
            iat: now.timestamp(),
            exp: access_exp.timestamp(),
            jti: access_jti.clone(),
        })?;
        let refresh_token = self.sign(&Claims {
            sub: user.id.clone(),
            provider: method,
            token_type: TokenType::Refresh,
            iat: now.timestamp(),
            exp: refresh_exp.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        })?;

        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            access_jti,
            refresh_hash: self.refresh_hash(&refresh_token)?,
            expires_at: refresh_exp,
            created_at: now,
        };
        self.repo.insert_session(&record).await?;

        tracing::debug!(user_id = %user.id, method = %method, "Session issued");

        Ok(Session {
            user_id: user.id.clone(),
            access_token,
            refresh_token,
            expires_at: access_exp,
            refresh_expires_at: refresh_exp,
        })
    }

    /// Check an access token's signature and expiry. No store lookup.
    pub fn verify_access_token(&self, token: &str) -> Result<Claims, SessionError> {
        let claims = self.decode_unchecked_expiry(token)?;
        if claims.token_type != TokenType::Access {
            return Err(SessionError::InvalidToken);
        }
        if claims.exp <= self.clock.now().timestamp() {
            return Err(SessionError::Expired);
        }
        Ok(claims)
    }

    /// Exchange a refresh token for a new session. The old refresh token is
    /// consumed whatever the outcome.
    pub async fn refresh(&self, refresh_token: &str) -> Result<(Session, User), SessionError> {
        let claims = self.decode_unchecked_expiry(refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(SessionError::InvalidToken);
        }

        let record = self
            .repo
            .take_session(&self.refresh_hash(refresh_token)?)
            .await?
            .ok_or(SessionError::InvalidToken)?;

        let now = self.clock.now();
        if record.expires_at <= now || claims.exp <= now.timestamp() {
            return Err(SessionError::Expired);
        }

        let user = self
            .repo
            .find_user_by_id(&record.user_id)
            .await?
            .ok_or(SessionError::UserNotFound)?;

        let session = self.issue(&user, claims.provider).await?;
        tracing::info!(user_id = %user.id, "Session refreshed");
        Ok((session, user))
    }

    /// Delete the persisted half of the session this access token belongs to.
    /// Succeeds whether or not anything matched.
    pub async fn revoke(&self, access_token: &str) -> Result<(), SessionError> {
        let claims = match self.decode_unchecked_expiry(access_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "Logout with unusable token");
                return Ok(());
            }
        };

        match self.repo.delete_sessions_by_access_jti(&claims.jti).await {
            Ok(removed) => {
                tracing::info!(user_id = %claims.sub, removed, "Session revoked");
            }
            Err(e) => {
                tracing::warn!(user_id = %claims.sub, error = %e, "Failed to delete session record");
            }
        }
        Ok(())
    }

    fn sign(&self, claims: &Claims) -> Result<String, SessionError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| SessionError::Signing(e.to_string()))
    }

    /// Verify signature and shape; expiry is checked against the injected clock by callers.
    fn decode_unchecked_expiry(&self, token: &str) -> Result<Claims, SessionError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => SessionError::InvalidSignature,
                _ => SessionError::Malformed,
            })
    }

    fn refresh_hash(&self, token: &str) -> Result<String, SessionError> {
        let mut mac = HmacSha256::new_from_slice(&self.hash_key)
            .map_err(|e| SessionError::Signing(format!("HMAC init failed: {}", e)))?;
        mac.update(token.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;
    use crate::time_utils::ManualClock;
    use chrono::{Duration, Utc};

    const KEY: &[u8] = b"test_jwt_key_32_bytes_minimum!!!";

    struct Harness {
        issuer: SessionIssuer,
        repo: Arc<MemoryRepository>,
        clock: Arc<ManualClock>,
        user: User,
    }

    async fn harness() -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let user = User::from_phone("13800000000", 30, clock.now());
        repo.insert_user(&user).await.unwrap();
        let issuer = SessionIssuer::new(KEY, repo.clone(), clock.clone(), SessionPolicy::default());
        Harness {
            issuer,
            repo,
            clock,
            user,
        }
    }

    #[tokio::test]
    async fn test_issue_and_verify() {
        let h = harness().await;
        let session = h.issuer.issue(&h.user, LoginMethod::Phone).await.unwrap();

        assert_eq!(session.expires_at, h.clock.now() + Duration::days(7));
        assert_eq!(session.refresh_expires_at, h.clock.now() + Duration::days(30));

        let claims = h.issuer.verify_access_token(&session.access_token).unwrap();
        assert_eq!(claims.sub, h.user.id);
        assert_eq!(claims.provider, LoginMethod::Phone);
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(h.repo.session_count(), 1);
    }

    #[tokio::test]
    async fn test_access_token_expires() {
        let h = harness().await;
        let session = h.issuer.issue(&h.user, LoginMethod::Phone).await.unwrap();

        h.clock.advance(Duration::days(7) + Duration::seconds(1));

        let err = h.issuer.verify_access_token(&session.access_token).unwrap_err();
        assert!(matches!(err, SessionError::Expired));
    }

    #[tokio::test]
    async fn test_tampered_and_foreign_tokens() {
        let h = harness().await;
        let session = h.issuer.issue(&h.user, LoginMethod::Phone).await.unwrap();

        let other = SessionIssuer::new(
            b"another_key_that_is_32_bytes_long",
            h.repo.clone(),
            h.clock.clone(),
            SessionPolicy::default(),
        );
        assert!(matches!(
            other.verify_access_token(&session.access_token),
            Err(SessionError::InvalidSignature)
        ));
        assert!(matches!(
            h.issuer.verify_access_token("not-a-jwt"),
            Err(SessionError::Malformed)
        ));
        // A refresh token is not an access token
        assert!(matches!(
            h.issuer.verify_access_token(&session.refresh_token),
            Err(SessionError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates() {
        let h = harness().await;
        let first = h.issuer.issue(&h.user, LoginMethod::Phone).await.unwrap();

        let (second, user) = h.issuer.refresh(&first.refresh_token).await.unwrap();
        assert_eq!(user.id, h.user.id);
        assert_ne!(second.refresh_token, first.refresh_token);

        let err = h.issuer.refresh(&first.refresh_token).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidToken));
        assert_eq!(h.repo.session_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_inactive_user() {
        let h = harness().await;
        let session = h.issuer.issue(&h.user, LoginMethod::Phone).await.unwrap();
        h.repo.set_user_active(&h.user.id, false).await.unwrap();

        let err = h.issuer.refresh(&session.refresh_token).await.unwrap_err();
        assert!(matches!(err, SessionError::UserNotFound));
    }

    #[tokio::test]
    async fn test_refresh_after_expiry() {
        let h = harness().await;
        let session = h.issuer.issue(&h.user, LoginMethod::Phone).await.unwrap();

        h.clock.advance(Duration::days(31));

        let err = h.issuer.refresh(&session.refresh_token).await.unwrap_err();
        assert!(matches!(err, SessionError::Expired));
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let h = harness().await;
        let session = h.issuer.issue(&h.user, LoginMethod::Phone).await.unwrap();

        h.issuer.revoke(&session.access_token).await.unwrap();
        assert_eq!(h.repo.session_count(), 0);
        h.issuer.revoke(&session.access_token).await.unwrap();
        h.issuer.revoke("garbage").await.unwrap();

        let err = h.issuer.refresh(&session.refresh_token).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidToken));
    }
}
