// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! WeChat Open Platform website login (QR connect).

use crate::config::WechatConfig;
use crate::models::{Provider, ProviderProfile, ProviderTokens};
use crate::services::oauth::provider::{
    http_client, read_body, OAuthProviderAdapter, ProviderError,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const AUTHORIZE_URL: &str = "https://open.weixin.qq.com/connect/qrconnect";
const API_BASE: &str = "https://api.weixin.qq.com";
const SCOPE: &str = "snsapi_login";

/// Every WeChat reply may carry `errcode`/`errmsg` instead of data.
#[derive(Debug, Deserialize)]
struct WechatErrorBody {
    #[serde(default)]
    errcode: Option<i64>,
    #[serde(default)]
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WechatTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    openid: String,
}

#[derive(Debug, Deserialize)]
struct WechatUserInfo {
    openid: String,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    headimgurl: Option<String>,
}

/// Parse a WeChat JSON body, surfacing `errcode` replies as API errors.
fn parse_wechat<T: for<'de> Deserialize<'de>>(body: &str) -> Result<(T, serde_json::Value), ProviderError> {
    let raw: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::InvalidResponse(format!("JSON parse error: {}", e)))?;

    let err: WechatErrorBody = serde_json::from_value(raw.clone())
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    if let Some(code) = err.errcode.filter(|c| *c != 0) {
        return Err(ProviderError::Api {
            code: code.to_string(),
            message: err.errmsg.unwrap_or_default(),
        });
    }

    let parsed = serde_json::from_value(raw.clone())
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    Ok((parsed, raw))
}

pub struct WechatAdapter {
    http: reqwest::Client,
    config: WechatConfig,
    redirect_uri: String,
    authorize_url: String,
    api_base: String,
}

impl WechatAdapter {
    pub fn new(
        config: WechatConfig,
        redirect_uri: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            http: http_client(timeout)?,
            config,
            redirect_uri,
            authorize_url: AUTHORIZE_URL.to_string(),
            api_base: API_BASE.to_string(),
        })
    }

    /// Point API calls somewhere else (tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl OAuthProviderAdapter for WechatAdapter {
    fn provider(&self) -> Provider {
        Provider::Wechat
    }

    fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}?appid={}&redirect_uri={}&response_type=code&scope={}&state={}#wechat_redirect",
            self.authorize_url,
            urlencoding::encode(&self.config.app_id),
            urlencoding::encode(&self.redirect_uri),
            SCOPE,
            urlencoding::encode(state)
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ProviderError> {
        let response = self
            .http
            .get(format!("{}/sns/oauth2/access_token", self.api_base))
            .query(&[
                ("appid", self.config.app_id.as_str()),
                ("secret", self.config.app_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;

        let body = read_body(response).await?;
        let (token, raw): (WechatTokenResponse, _) = parse_wechat(&body)?;

        tracing::debug!(openid = %token.openid, "WeChat code exchanged");

        Ok(ProviderTokens {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
            provider_user_id: Some(token.openid),
            raw,
        })
    }

    async fn fetch_profile(
        &self,
        tokens: &ProviderTokens,
    ) -> Result<ProviderProfile, ProviderError> {
        let openid = tokens.provider_user_id.as_deref().ok_or_else(|| {
            ProviderError::InvalidResponse("token response carried no openid".to_string())
        })?;

        let response = self
            .http
            .get(format!("{}/sns/userinfo", self.api_base))
            .query(&[
                ("access_token", tokens.access_token.as_str()),
                ("openid", openid),
                ("lang", "zh_CN"),
            ])
            .send()
            .await?;

        let body = read_body(response).await?;
        let (info, raw): (WechatUserInfo, _) = parse_wechat(&body)?;

        Ok(ProviderProfile {
            provider: Provider::Wechat,
            provider_user_id: info.openid,
            username: info.nickname.filter(|n| !n.is_empty()),
            avatar: info.headimgurl.filter(|u| !u.is_empty()),
            email: None,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(api_base: &str, timeout: Duration) -> WechatAdapter {
        WechatAdapter::new(
            WechatConfig {
                app_id: "wxappid".to_string(),
                app_secret: "wxsecret".to_string(),
            },
            "http://localhost:8080/auth/oauth/wechat/callback".to_string(),
            timeout,
        )
        .unwrap()
        .with_api_base(api_base)
    }

    #[test]
    fn test_authorize_url() {
        let url = adapter(API_BASE, Duration::from_secs(1)).authorize_url("abc123");
        assert!(url.starts_with("https://open.weixin.qq.com/connect/qrconnect?appid=wxappid"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fauth%2Foauth%2Fwechat%2Fcallback"));
        assert!(url.contains("scope=snsapi_login"));
        assert!(url.contains("state=abc123"));
        assert!(url.ends_with("#wechat_redirect"));
    }

    #[tokio::test]
    async fn test_exchange_and_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sns/oauth2/access_token"))
            .and(query_param("code", "the-code"))
            .and(query_param("appid", "wxappid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ACCESS",
                "expires_in": 7200,
                "refresh_token": "REFRESH",
                "openid": "OPENID",
                "scope": "snsapi_login"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sns/userinfo"))
            .and(query_param("openid", "OPENID"))
            .and(query_param("access_token", "ACCESS"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "openid": "OPENID",
                "nickname": "微信昵称",
                "headimgurl": "https://thirdwx.qlogo.cn/x.png",
                "sex": 1
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri(), Duration::from_secs(5));
        let tokens = adapter.exchange_code("the-code").await.unwrap();
        assert_eq!(tokens.provider_user_id.as_deref(), Some("OPENID"));
        assert_eq!(tokens.expires_in, Some(7200));

        let profile = adapter.fetch_profile(&tokens).await.unwrap();
        assert_eq!(profile.provider_user_id, "OPENID");
        assert_eq!(profile.username.as_deref(), Some("微信昵称"));
        assert_eq!(profile.avatar.as_deref(), Some("https://thirdwx.qlogo.cn/x.png"));
    }

    #[tokio::test]
    async fn test_errcode_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sns/oauth2/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 40029,
                "errmsg": "invalid code"
            })))
            .mount(&server)
            .await;

        let err = adapter(&server.uri(), Duration::from_secs(5))
            .exchange_code("bad")
            .await
            .unwrap_err();

        match err {
            ProviderError::Api { code, message } => {
                assert_eq!(code, "40029");
                assert_eq!(message, "invalid code");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = adapter(&server.uri(), Duration::from_millis(50))
            .exchange_code("code")
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Timeout));
    }
}
