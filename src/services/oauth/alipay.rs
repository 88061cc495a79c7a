// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Alipay OpenAPI web login.
//!
//! Every gateway call is a form POST signed with RSA2 (SHA256withRSA over the
//! sorted `k=v` parameter string). When the Alipay public key is configured,
//! the `sign` attached to each response is checked over the exact response
//! node text before anything in it is trusted.

use crate::config::AlipayConfig;
use crate::models::{Provider, ProviderProfile, ProviderTokens};
use crate::services::oauth::provider::{
    http_client, read_body, OAuthProviderAdapter, ProviderError,
};
use async_trait::async_trait;
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use serde_json::value::RawValue;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

const AUTHORIZE_URL: &str = "https://openauth.alipay.com/oauth2/publicAppAuthorize.htm";
const GATEWAY: &str = "https://openapi.alipay.com/gateway.do";
const SCOPE: &str = "auth_user";

const TOKEN_METHOD: &str = "alipay.system.oauth.token";
const USER_INFO_METHOD: &str = "alipay.user.info.share";

/// Business success code on Alipay response nodes
const SUCCESS_CODE: &str = "10000";

// ─── Keys and signing ───────────────────────────────────────────────────────

fn base64_body(key: &str) -> Result<Vec<u8>, ProviderError> {
    let compact: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| ProviderError::Config(format!("key is not base64: {}", e)))
}

/// Accepts PEM or bare base64 DER, PKCS#8 or PKCS#1.
fn parse_private_key(key: &str) -> Result<RsaPrivateKey, ProviderError> {
    let key = key.trim();
    let parsed = if key.starts_with("-----BEGIN") {
        RsaPrivateKey::from_pkcs8_pem(key)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(key))
            .map_err(|e| e.to_string())
    } else {
        let der = base64_body(key)?;
        RsaPrivateKey::from_pkcs8_der(&der)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der))
            .map_err(|e| e.to_string())
    };
    parsed.map_err(|e| ProviderError::Config(format!("Alipay private key: {}", e)))
}

/// Accepts PEM or bare base64 DER, SubjectPublicKeyInfo or PKCS#1.
fn parse_public_key(key: &str) -> Result<RsaPublicKey, ProviderError> {
    let key = key.trim();
    let parsed = if key.starts_with("-----BEGIN") {
        RsaPublicKey::from_public_key_pem(key)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(key))
            .map_err(|e| e.to_string())
    } else {
        let der = base64_body(key)?;
        RsaPublicKey::from_public_key_der(&der)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
            .map_err(|e| e.to_string())
    };
    parsed.map_err(|e| ProviderError::Config(format!("Alipay public key: {}", e)))
}

/// `k=v` pairs in key order, empty values and `sign` left out.
fn sign_content(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(k, v)| k.as_str() != "sign" && !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Gateway timestamp, Beijing time.
fn gateway_timestamp(now: chrono::DateTime<chrono::Utc>) -> String {
    (now.naive_utc() + chrono::Duration::hours(8))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

// ─── Responses ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AlipayErrorBody {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    sub_code: Option<String>,
    #[serde(default)]
    sub_msg: Option<String>,
}

impl From<AlipayErrorBody> for ProviderError {
    fn from(e: AlipayErrorBody) -> Self {
        ProviderError::Api {
            code: e.sub_code.unwrap_or(e.code),
            message: e.sub_msg.or(e.msg).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlipayTokenResponse {
    access_token: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    open_id: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlipayUserInfo {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    open_id: Option<String>,
    #[serde(default)]
    nick_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

fn invalid(e: impl std::fmt::Display) -> ProviderError {
    ProviderError::InvalidResponse(e.to_string())
}

// ─── Adapter ────────────────────────────────────────────────────────────────

pub struct AlipayAdapter {
    http: reqwest::Client,
    app_id: String,
    redirect_uri: String,
    signing_key: SigningKey<Sha256>,
    verifying_key: Option<VerifyingKey<Sha256>>,
    gateway: String,
}

impl AlipayAdapter {
    pub fn new(
        config: AlipayConfig,
        redirect_uri: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let signing_key = SigningKey::<Sha256>::new(parse_private_key(&config.private_key)?);
        let verifying_key = match config.alipay_public_key.as_deref() {
            Some(key) => Some(VerifyingKey::<Sha256>::new(parse_public_key(key)?)),
            None => {
                tracing::warn!("ALIPAY_PUBLIC_KEY not set, gateway responses are not verified");
                None
            }
        };

        Ok(Self {
            http: http_client(timeout)?,
            app_id: config.app_id,
            redirect_uri,
            signing_key,
            verifying_key,
            gateway: GATEWAY.to_string(),
        })
    }

    /// Point gateway calls somewhere else (tests).
    pub fn with_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = gateway.into();
        self
    }

    fn sign(&self, content: &str) -> Result<String, ProviderError> {
        let signature = self
            .signing_key
            .try_sign(content.as_bytes())
            .map_err(|e| ProviderError::Config(format!("RSA signing failed: {}", e)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()))
    }

    fn verify(&self, content: &str, sign: &str) -> Result<(), ProviderError> {
        let Some(key) = &self.verifying_key else {
            return Ok(());
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(sign)
            .map_err(invalid)?;
        let signature = Signature::try_from(bytes.as_slice()).map_err(invalid)?;
        key.verify(content.as_bytes(), &signature)
            .map_err(|_| ProviderError::InvalidResponse("response signature mismatch".to_string()))
    }

    /// Call a gateway method and return its response node, checked and parsed.
    async fn call(
        &self,
        method: &str,
        biz: &[(&str, &str)],
    ) -> Result<serde_json::Value, ProviderError> {
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.app_id.clone());
        params.insert("method".to_string(), method.to_string());
        params.insert("format".to_string(), "JSON".to_string());
        params.insert("charset".to_string(), "utf-8".to_string());
        params.insert("sign_type".to_string(), "RSA2".to_string());
        params.insert("timestamp".to_string(), gateway_timestamp(chrono::Utc::now()));
        params.insert("version".to_string(), "1.0".to_string());
        for (k, v) in biz {
            params.insert(k.to_string(), v.to_string());
        }
        let sign = self.sign(&sign_content(&params))?;
        params.insert("sign".to_string(), sign);

        let response = self.http.post(&self.gateway).form(&params).send().await?;
        let body = read_body(response).await?;

        let nodes: HashMap<String, Box<RawValue>> = serde_json::from_str(&body).map_err(invalid)?;

        if let Some(err) = nodes.get("error_response") {
            let err: AlipayErrorBody = serde_json::from_str(err.get()).map_err(invalid)?;
            return Err(err.into());
        }

        let node_key = format!("{}_response", method.replace('.', "_"));
        let node = nodes
            .get(&node_key)
            .ok_or_else(|| invalid(format!("missing {}", node_key)))?;

        if self.verifying_key.is_some() {
            let sign: String = nodes
                .get("sign")
                .ok_or_else(|| invalid("unsigned gateway response"))
                .and_then(|s| serde_json::from_str(s.get()).map_err(invalid))?;
            self.verify(node.get(), &sign)?;
        }

        let value: serde_json::Value = serde_json::from_str(node.get()).map_err(invalid)?;
        if let Some(code) = value.get("code").and_then(|c| c.as_str()) {
            if code != SUCCESS_CODE {
                let err: AlipayErrorBody = serde_json::from_value(value.clone()).map_err(invalid)?;
                return Err(err.into());
            }
        }
        Ok(value)
    }
}

#[async_trait]
impl OAuthProviderAdapter for AlipayAdapter {
    fn provider(&self) -> Provider {
        Provider::Alipay
    }

    fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}?app_id={}&scope={}&redirect_uri={}&state={}",
            AUTHORIZE_URL,
            urlencoding::encode(&self.app_id),
            SCOPE,
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(state)
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ProviderError> {
        let raw = self
            .call(
                TOKEN_METHOD,
                &[("grant_type", "authorization_code"), ("code", code)],
            )
            .await?;
        let token: AlipayTokenResponse = serde_json::from_value(raw.clone()).map_err(invalid)?;

        let provider_user_id = token.user_id.or(token.open_id);
        tracing::debug!(user_id = ?provider_user_id, "Alipay code exchanged");

        Ok(ProviderTokens {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
            provider_user_id,
            raw,
        })
    }

    async fn fetch_profile(
        &self,
        tokens: &ProviderTokens,
    ) -> Result<ProviderProfile, ProviderError> {
        let raw = self
            .call(USER_INFO_METHOD, &[("auth_token", tokens.access_token.as_str())])
            .await?;
        let info: AlipayUserInfo = serde_json::from_value(raw.clone()).map_err(invalid)?;

        let provider_user_id = info
            .user_id
            .or(info.open_id)
            .or_else(|| tokens.provider_user_id.clone())
            .ok_or_else(|| invalid("user info carried no user id"))?;

        Ok(ProviderProfile {
            provider: Provider::Alipay,
            provider_user_id,
            username: info.nick_name.filter(|n| !n.is_empty()),
            avatar: info.avatar.filter(|a| !a.is_empty()),
            email: None,
            raw,
        })
    }
}
