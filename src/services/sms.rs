// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! One-time code delivery channels.
//!
//! - [`AliyunSmsClient`] calls the Aliyun Dysms `SendSms` RPC API
//! - [`LogDelivery`] writes the code to the log, for local development

use crate::config::SmsConfig;
use crate::services::otp::mask_phone;
use crate::time_utils::format_utc_rfc3339;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Delivery errors
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Gateway answered but refused to send
    #[error("SMS gateway rejected message ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("SMS gateway timed out")]
    Timeout,

    #[error("SMS gateway request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Transport(e.to_string())
        }
    }
}

/// Deliver code C to destination D.
#[async_trait]
pub trait CodeDelivery: Send + Sync {
    async fn send(&self, phone: &str, code: &str) -> Result<(), DeliveryError>;
}

// ─── Aliyun Dysms ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendSmsResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    biz_id: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

/// Human-readable message for a Dysms error code.
fn describe_sms_error(code: &str) -> &'static str {
    match code {
        "isv.BUSINESS_LIMIT_CONTROL" => "Sending too frequently, please try again later",
        "isv.MOBILE_NUMBER_ILLEGAL" => "Invalid phone number",
        "isv.AMOUNT_NOT_ENOUGH" => "SMS account balance exhausted",
        "isv.TEMPLATE_MISSING_PARAMETERS" => "SMS template parameters missing",
        "isv.INVALID_PARAMETERS" => "Invalid SMS request parameters",
        "isv.SMS_SIGNATURE_ILLEGAL" => "SMS signature not approved",
        "isv.SMS_TEMPLATE_ILLEGAL" => "SMS template not approved",
        "isv.DAY_LIMIT_CONTROL" => "Daily SMS limit reached for this number",
        _ => "SMS delivery failed",
    }
}

/// RFC 3986 percent-encoding as Aliyun's RPC signature expects it.
fn percent_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Aliyun RPC signature (HMAC-SHA1, signature version 1.0) over sorted parameters.
fn sign_rpc(params: &BTreeMap<String, String>, access_key_secret: &str) -> String {
    let canonical = params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let string_to_sign = format!("POST&{}&{}", percent_encode("/"), percent_encode(&canonical));

    let key = ring::hmac::Key::new(
        ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        format!("{}&", access_key_secret).as_bytes(),
    );
    let tag = ring::hmac::sign(&key, string_to_sign.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(tag.as_ref())
}

/// Aliyun Dysms client.
#[derive(Clone)]
pub struct AliyunSmsClient {
    http: reqwest::Client,
    config: SmsConfig,
}

impl AliyunSmsClient {
    pub fn new(config: SmsConfig, timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn signed_params(&self, phone: &str, code: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            params.insert(k.to_string(), v);
        };
        put("AccessKeyId", self.config.access_key_id.clone());
        put("Action", "SendSms".to_string());
        put("Format", "JSON".to_string());
        put("PhoneNumbers", phone.to_string());
        put("SignName", self.config.sign_name.clone());
        put("TemplateCode", self.config.template_code.clone());
        put("TemplateParam", serde_json::json!({ "code": code }).to_string());
        put("Version", "2017-05-25".to_string());
        put("SignatureMethod", "HMAC-SHA1".to_string());
        put("SignatureVersion", "1.0".to_string());
        put("SignatureNonce", uuid::Uuid::new_v4().to_string());
        put("Timestamp", format_utc_rfc3339(chrono::Utc::now()));

        let signature = sign_rpc(&params, &self.config.access_key_secret);
        params.insert("Signature".to_string(), signature);
        params
    }
}

#[async_trait]
impl CodeDelivery for AliyunSmsClient {
    async fn send(&self, phone: &str, code: &str) -> Result<(), DeliveryError> {
        let params = self.signed_params(phone, code);

        let response = self
            .http
            .post(format!("{}/", self.config.endpoint.trim_end_matches('/')))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let parsed: SendSmsResponse = serde_json::from_str(&body).map_err(|e| {
            DeliveryError::Transport(format!("HTTP {}: unparseable body ({}): {}", status, e, body))
        })?;

        if parsed.code != "OK" {
            tracing::error!(
                phone = %mask_phone(phone),
                code = %parsed.code,
                message = ?parsed.message,
                request_id = ?parsed.request_id,
                "SMS gateway rejected message"
            );
            return Err(DeliveryError::Rejected {
                message: describe_sms_error(&parsed.code).to_string(),
                code: parsed.code,
            });
        }

        tracing::info!(
            phone = %mask_phone(phone),
            biz_id = ?parsed.biz_id,
            "SMS sent"
        );
        Ok(())
    }
}

// ─── Development channel ────────────────────────────────────────────────────

/// Logs the code instead of sending it. Never wire this up in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl CodeDelivery for LogDelivery {
    async fn send(&self, phone: &str, code: &str) -> Result<(), DeliveryError> {
        tracing::warn!(phone = %mask_phone(phone), code, "Development SMS channel, code not sent");
        Ok(())
    }
}
