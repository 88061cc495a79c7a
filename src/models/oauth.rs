// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Federated login models: providers, handshake state and account links.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of supported OAuth providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Wechat,
    Alipay,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Wechat, Provider::Alipay];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Wechat => "wechat",
            Provider::Alipay => "alipay",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported provider: {0}")]
pub struct UnsupportedProvider(pub String);

impl FromStr for Provider {
    type Err = UnsupportedProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wechat" => Ok(Provider::Wechat),
            "alipay" => Ok(Provider::Alipay),
            other => Err(UnsupportedProvider(other.to_string())),
        }
    }
}

/// Pending authorization request, keyed by its state token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthHandshakeState {
    pub state: String,
    pub nonce: String,
    pub provider: Provider,
    /// Where the caller wants to land after the callback
    pub redirect_hint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthHandshakeState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Result of a provider code exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds as reported by the provider
    pub expires_in: Option<i64>,
    /// Some providers return the user id with the token (WeChat openid, Alipay user_id)
    pub provider_user_id: Option<String>,
    pub raw: serde_json::Value,
}

/// Normalized user info fetched from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider: Provider,
    pub provider_user_id: String,
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub raw: serde_json::Value,
}

/// Durable association between a local user and a provider identity.
///
/// `(provider, provider_user_id)` resolves to at most one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAccountLink {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub provider_user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provider_data: serde_json::Value,
    pub is_verified: bool,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderAccountLink {
    /// Deterministic document id, used to enforce uniqueness in storage.
    pub fn key(provider: Provider, provider_user_id: &str) -> String {
        format!("{}:{}", provider, provider_user_id)
    }

    pub fn new(
        user_id: &str,
        profile: &ProviderProfile,
        tokens: &ProviderTokens,
        is_primary: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut link = Self {
            id: Self::key(profile.provider, &profile.provider_user_id),
            user_id: user_id.to_string(),
            provider: profile.provider,
            provider_user_id: profile.provider_user_id.clone(),
            username: None,
            email: None,
            avatar: None,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            provider_data: serde_json::Value::Null,
            is_verified: true,
            is_primary,
            created_at: now,
            updated_at: now,
        };
        link.refresh_snapshot(profile, tokens, now);
        link
    }

    /// Overwrite the stored provider tokens and profile snapshot.
    pub fn refresh_snapshot(
        &mut self,
        profile: &ProviderProfile,
        tokens: &ProviderTokens,
        now: DateTime<Utc>,
    ) {
        self.username = profile.username.clone();
        self.email = profile.email.clone();
        self.avatar = profile.avatar.clone();
        self.access_token = Some(tokens.access_token.clone());
        self.refresh_token = tokens.refresh_token.clone();
        self.token_expires_at = tokens
            .expires_in
            .map(|secs| now + chrono::Duration::seconds(secs));
        self.provider_data = profile.raw.clone();
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse() {
        assert_eq!("wechat".parse::<Provider>().unwrap(), Provider::Wechat);
        assert_eq!("alipay".parse::<Provider>().unwrap(), Provider::Alipay);
        let err = "github".parse::<Provider>().unwrap_err();
        assert_eq!(err.0, "github");
    }

    #[test]
    fn test_link_snapshot_sets_token_expiry() {
        let now = Utc::now();
        let profile = ProviderProfile {
            provider: Provider::Wechat,
            provider_user_id: "openid-1".to_string(),
            username: Some("Nick".to_string()),
            avatar: None,
            email: None,
            raw: serde_json::json!({"openid": "openid-1"}),
        };
        let tokens = ProviderTokens {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_in: Some(7200),
            provider_user_id: Some("openid-1".to_string()),
            raw: serde_json::Value::Null,
        };

        let link = ProviderAccountLink::new("u1", &profile, &tokens, true, now);

        assert_eq!(link.id, "wechat:openid-1");
        assert_eq!(link.username.as_deref(), Some("Nick"));
        assert_eq!(
            link.token_expires_at,
            Some(now + chrono::Duration::seconds(7200))
        );
        assert!(link.is_verified);
        assert!(link.is_primary);
    }
}
