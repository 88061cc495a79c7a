// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Uniform provider capability and the lookup table of enabled providers.

use crate::config::Config;
use crate::models::{Provider, ProviderProfile, ProviderTokens};
use crate::services::oauth::alipay::AlipayAdapter;
use crate::services::oauth::wechat::WechatAdapter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Provider adapter errors
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider request timed out")]
    Timeout,

    #[error("Provider request failed: {0}")]
    Transport(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Well-formed error reply from the provider API
    #[error("Provider error {code}: {message}")]
    Api { code: String, message: String },

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),

    #[error("Provider misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

/// What every OAuth provider can do.
#[async_trait]
pub trait OAuthProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Authorization page URL for the given state token.
    fn authorize_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ProviderError>;

    async fn fetch_profile(&self, tokens: &ProviderTokens)
        -> Result<ProviderProfile, ProviderError>;
}

/// Read a response body, turning non-2xx statuses into [`ProviderError::Http`].
pub(crate) async fn read_body(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Config(format!("HTTP client: {}", e)))
}

/// Enabled providers, keyed by tag.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn OAuthProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same provider.
    pub fn with(mut self, adapter: Arc<dyn OAuthProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    /// Build adapters for every provider the configuration enables.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let mut registry = Self::new();

        if let Some(wechat) = &config.wechat {
            registry = registry.with(Arc::new(WechatAdapter::new(
                wechat.clone(),
                config.redirect_uri(Provider::Wechat),
                config.http_timeout,
            )?));
        }
        if let Some(alipay) = &config.alipay {
            registry = registry.with(Arc::new(AlipayAdapter::new(
                alipay.clone(),
                config.redirect_uri(Provider::Alipay),
                config.http_timeout,
            )?));
        }

        for provider in Provider::ALL {
            tracing::info!(
                provider = %provider,
                enabled = config.provider_configured(provider),
                "OAuth provider"
            );
        }
        Ok(registry)
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn OAuthProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    /// Enabled providers in a stable order.
    pub fn providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.adapters.contains_key(p))
            .collect()
    }
}
