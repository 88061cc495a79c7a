// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Everything is read and validated once at startup. Provider sections are
//! only present when all of their credentials are set, so "is this login
//! method enabled" is a single check on the typed config.

use crate::models::Provider;
use chrono::Duration;
use std::env;

/// Minimum length of the session signing key.
pub const MIN_SIGNING_KEY_LEN: usize = 32;

/// Where users, links, sessions and login history are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process maps, lost on restart. Development and tests.
    Memory,
    Firestore,
}

/// One-time code and login throttling policy.
#[derive(Debug, Clone, PartialEq)]
pub struct OtpPolicy {
    pub code_length: usize,
    pub code_ttl: Duration,
    pub max_attempts: u32,
    /// Codes a single phone may request per hour
    pub hourly_send_limit: usize,
    /// Login attempts a single phone may make per minute
    pub login_attempts_per_minute: usize,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            code_length: 6,
            code_ttl: Duration::minutes(5),
            max_attempts: 3,
            hourly_send_limit: 10,
            login_attempts_per_minute: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            access_ttl: Duration::days(7),
            refresh_ttl: Duration::days(30),
        }
    }
}

/// Aliyun Dysms credentials.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub sign_name: String,
    pub template_code: String,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct WechatConfig {
    pub app_id: String,
    pub app_secret: String,
}

#[derive(Debug, Clone)]
pub struct AlipayConfig {
    pub app_id: String,
    /// Application RSA private key, PEM or bare base64 DER (PKCS#8 or PKCS#1)
    pub private_key: String,
    /// Alipay's RSA public key, used to verify response signatures
    pub alipay_public_key: Option<String>,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// Public base URL of this deployment; OAuth redirect URIs hang off it
    pub base_url: String,
    /// Frontend URL for CORS and post-login redirects
    pub frontend_url: String,
    /// JWT signing key for session tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,
    pub storage: StorageBackend,
    /// GCP project ID (Firestore)
    pub gcp_project_id: String,
    pub otp: OtpPolicy,
    pub session: SessionPolicy,
    pub oauth_state_ttl: Duration,
    /// Credits granted to every newly created user
    pub signup_credits: u32,
    /// Bound on every outbound provider or SMS call
    pub http_timeout: std::time::Duration,
    /// Bound on every repository call
    pub persistence_timeout: std::time::Duration,

    pub sms: Option<SmsConfig>,
    pub wechat: Option<WechatConfig>,
    pub alipay: Option<AlipayConfig>,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let jwt_signing_key = env::var("JWT_SIGNING_KEY")
            .map_err(|_| ConfigError::Missing("JWT_SIGNING_KEY"))?
            .into_bytes();
        if jwt_signing_key.len() < MIN_SIGNING_KEY_LEN {
            return Err(ConfigError::Invalid {
                name: "JWT_SIGNING_KEY",
                reason: format!("must be at least {} bytes", MIN_SIGNING_KEY_LEN),
            });
        }

        let storage = match env::var("AUTH_STORAGE")
            .unwrap_or_else(|_| "memory".to_string())
            .as_str()
        {
            "memory" => StorageBackend::Memory,
            "firestore" => StorageBackend::Firestore,
            other => {
                return Err(ConfigError::Invalid {
                    name: "AUTH_STORAGE",
                    reason: format!("expected memory or firestore, got {}", other),
                })
            }
        };

        let gcp_project_id = match storage {
            StorageBackend::Firestore => {
                env::var("GCP_PROJECT_ID").map_err(|_| ConfigError::Missing("GCP_PROJECT_ID"))?
            }
            StorageBackend::Memory => {
                env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string())
            }
        };

        let port = parse_or("PORT", 8080)?;
        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            port,
            base_url,
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            jwt_signing_key,
            storage,
            gcp_project_id,
            otp: OtpPolicy::default(),
            session: SessionPolicy::default(),
            oauth_state_ttl: Duration::minutes(10),
            signup_credits: parse_or("SIGNUP_CREDITS", 30)?,
            http_timeout: std::time::Duration::from_secs(parse_or("HTTP_TIMEOUT_SECS", 10)?),
            persistence_timeout: std::time::Duration::from_secs(parse_or(
                "PERSISTENCE_TIMEOUT_SECS",
                5,
            )?),
            sms: sms_from_env(),
            wechat: wechat_from_env(),
            alipay: alipay_from_env(),
        })
    }

    /// Whether the provider has a complete credential set.
    pub fn provider_configured(&self, provider: Provider) -> bool {
        match provider {
            Provider::Wechat => self.wechat.is_some(),
            Provider::Alipay => self.alipay.is_some(),
        }
    }

    /// OAuth callback URI registered with the provider.
    pub fn redirect_uri(&self, provider: Provider) -> String {
        format!("{}/auth/oauth/{}/callback", self.base_url, provider)
    }

    /// Deterministic config for tests. WeChat has dummy credentials; Alipay
    /// needs a real RSA key so tests that want it fill it in themselves.
    pub fn test_default() -> Self {
        Self {
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!!".to_vec(),
            storage: StorageBackend::Memory,
            gcp_project_id: "test-project".to_string(),
            otp: OtpPolicy::default(),
            session: SessionPolicy::default(),
            oauth_state_ttl: Duration::minutes(10),
            signup_credits: 30,
            http_timeout: std::time::Duration::from_secs(10),
            persistence_timeout: std::time::Duration::from_secs(5),
            sms: None,
            wechat: Some(WechatConfig {
                app_id: "wx_test_app".to_string(),
                app_secret: "wx_test_secret".to_string(),
            }),
            alipay: None,
        }
    }
}

fn non_blank(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match non_blank(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("cannot parse {:?}", raw),
        }),
    }
}

fn sms_from_env() -> Option<SmsConfig> {
    Some(SmsConfig {
        access_key_id: non_blank("ALIYUN_ACCESS_KEY_ID")?,
        access_key_secret: non_blank("ALIYUN_ACCESS_KEY_SECRET")?,
        sign_name: non_blank("ALIYUN_SMS_SIGN_NAME")?,
        template_code: non_blank("ALIYUN_SMS_TEMPLATE_CODE")?,
        endpoint: non_blank("ALIYUN_SMS_ENDPOINT")
            .unwrap_or_else(|| "https://dysmsapi.aliyuncs.com".to_string()),
    })
}

fn wechat_from_env() -> Option<WechatConfig> {
    Some(WechatConfig {
        app_id: non_blank("WECHAT_APP_ID")?,
        app_secret: non_blank("WECHAT_APP_SECRET")?,
    })
}

fn alipay_from_env() -> Option<AlipayConfig> {
    Some(AlipayConfig {
        app_id: non_blank("ALIPAY_APP_ID")?,
        private_key: non_blank("ALIPAY_PRIVATE_KEY")?,
        alipay_public_key: non_blank("ALIPAY_PUBLIC_KEY"),
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        env::set_var("JWT_SIGNING_KEY", "test_jwt_key_32_bytes_minimum!!!");
        env::set_var("WECHAT_APP_ID", "wx123");
        env::set_var("WECHAT_APP_SECRET", "  ");
        env::remove_var("ALIPAY_APP_ID");

        let config = Config::from_env().expect("Config should load");

        assert_eq!(config.port, 8080);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.otp.max_attempts, 3);
        assert_eq!(config.session.access_ttl, Duration::days(7));
        // Blank secret means the provider is not configured
        assert!(!config.provider_configured(Provider::Wechat));
        assert!(!config.provider_configured(Provider::Alipay));
    }

    #[test]
    fn test_redirect_uri() {
        let config = Config::test_default();
        assert_eq!(
            config.redirect_uri(Provider::Wechat),
            "http://localhost:8080/auth/oauth/wechat/callback"
        );
    }
}
