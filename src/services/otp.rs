// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Phone one-time code issuance and verification.
//!
//! Issuance order: validate, rate-limit, generate, deliver, store. A code is
//! only stored once delivery succeeded, so a failed send leaves whatever code
//! was issued before it authoritative. The failed attempt still counts
//! against the hourly window.

use crate::config::OtpPolicy;
use crate::models::{CodePurpose, OneTimeCode};
use crate::services::code_store::CodeStore;
use crate::services::rate_limit::RateLimiter;
use crate::services::sms::{CodeDelivery, DeliveryError};
use crate::time_utils::Clock;
use chrono::Duration;
use rand::Rng;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use subtle::ConstantTimeEq;

/// Mainland China mobile number.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^1[3-9]\d{9}$").expect("phone regex"));

pub fn is_valid_phone(phone: &str) -> bool {
    PHONE_RE.is_match(phone)
}

/// `13812345678` -> `138****5678`, for logs.
pub fn mask_phone(phone: &str) -> String {
    if phone.len() == 11 && phone.is_ascii() {
        format!("{}****{}", &phone[..3], &phone[7..])
    } else {
        "****".to_string()
    }
}

/// OTP errors
#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("Invalid phone number")]
    InvalidPhone,

    #[error("Invalid verification code format")]
    InvalidCode,

    #[error("Too many requests, please try again later")]
    RateLimited,

    #[error("No verification code found, please request one")]
    NotFound,

    #[error("Verification code expired, please request a new one")]
    Expired,

    #[error("Too many failed attempts, please request a new code")]
    AttemptsExceeded,

    #[error("Incorrect verification code")]
    Mismatch,

    #[error("Verification code already used")]
    AlreadyUsed,

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Source of numeric codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, length: usize) -> String;
}

/// Uniformly random digits from the thread RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self, length: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }
}

/// Always yields the same code. For tests and demos.
#[derive(Debug, Clone)]
pub struct FixedCodeGenerator(pub String);

impl CodeGenerator for FixedCodeGenerator {
    fn generate(&self, _length: usize) -> String {
        self.0.clone()
    }
}

pub struct OtpManager {
    store: Arc<CodeStore>,
    limiter: Arc<RateLimiter>,
    delivery: Arc<dyn CodeDelivery>,
    generator: Arc<dyn CodeGenerator>,
    policy: OtpPolicy,
    clock: Arc<dyn Clock>,
}

impl OtpManager {
    pub fn new(
        store: Arc<CodeStore>,
        limiter: Arc<RateLimiter>,
        delivery: Arc<dyn CodeDelivery>,
        generator: Arc<dyn CodeGenerator>,
        policy: OtpPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            limiter,
            delivery,
            generator,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &OtpPolicy {
        &self.policy
    }

    /// Whether `code` has the shape of an issued code.
    pub fn is_valid_code_format(&self, code: &str) -> bool {
        code.len() == self.policy.code_length && code.bytes().all(|b| b.is_ascii_digit())
    }

    /// Issue a code for `(phone, purpose)` and deliver it.
    pub async fn request_code(&self, phone: &str, purpose: CodePurpose) -> Result<(), OtpError> {
        if !is_valid_phone(phone) {
            return Err(OtpError::InvalidPhone);
        }

        let decision = self.limiter.allow(
            &format!("sms:{}", phone),
            Duration::hours(1),
            self.policy.hourly_send_limit,
        );
        if !decision.allowed {
            tracing::warn!(phone = %mask_phone(phone), "Code request rate limited");
            return Err(OtpError::RateLimited);
        }

        let code = self.generator.generate(self.policy.code_length);
        self.delivery.send(phone, &code).await?;

        let now = self.clock.now();
        self.store.put_code(OneTimeCode {
            phone: phone.to_string(),
            code,
            purpose,
            created_at: now,
            expires_at: now + self.policy.code_ttl,
            attempts: 0,
            used: false,
        });

        tracing::info!(
            phone = %mask_phone(phone),
            purpose = ?purpose,
            remaining = decision.remaining,
            "Verification code issued"
        );
        Ok(())
    }

    /// Check `code` against the current code for `(phone, purpose)`. One-shot.
    pub async fn verify_code(
        &self,
        phone: &str,
        code: &str,
        purpose: CodePurpose,
    ) -> Result<(), OtpError> {
        if !is_valid_phone(phone) {
            return Err(OtpError::InvalidPhone);
        }
        if !self.is_valid_code_format(code) {
            return Err(OtpError::InvalidCode);
        }

        let now = self.clock.now();
        let max_attempts = self.policy.max_attempts;

        let outcome = self
            .store
            .with_code(phone, purpose, |record| {
                if record.used {
                    return Err(OtpError::AlreadyUsed);
                }
                if record.is_expired(now) {
                    record.used = true;
                    return Err(OtpError::Expired);
                }
                if record.attempts >= max_attempts {
                    record.used = true;
                    return Err(OtpError::AttemptsExceeded);
                }
                if !bool::from(record.code.as_bytes().ct_eq(code.as_bytes())) {
                    record.attempts += 1;
                    return Err(OtpError::Mismatch);
                }
                record.used = true;
                Ok(())
            })
            .unwrap_or(Err(OtpError::NotFound));

        match &outcome {
            Ok(()) => tracing::info!(phone = %mask_phone(phone), "Verification code accepted"),
            Err(e) => tracing::info!(phone = %mask_phone(phone), reason = %e, "Verification code rejected"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_utils::ManualClock;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl CodeDelivery for Recorder {
        async fn send(&self, phone: &str, code: &str) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Transport("down".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((phone.to_string(), code.to_string()));
            Ok(())
        }
    }

    struct Harness {
        otp: OtpManager,
        clock: Arc<ManualClock>,
        delivery: Arc<Recorder>,
    }

    fn harness_with(delivery: Recorder) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let delivery = Arc::new(delivery);
        let otp = OtpManager::new(
            Arc::new(CodeStore::new(clock.clone())),
            Arc::new(RateLimiter::new(clock.clone())),
            delivery.clone(),
            Arc::new(RandomCodeGenerator),
            OtpPolicy::default(),
            clock.clone(),
        );
        Harness {
            otp,
            clock,
            delivery,
        }
    }

    fn harness() -> Harness {
        harness_with(Recorder::default())
    }

    impl Harness {
        fn last_code(&self) -> String {
            self.delivery.sent.lock().unwrap().last().unwrap().1.clone()
        }
    }

    const PHONE: &str = "13800000000";

    #[test]
    fn test_phone_validation() {
        assert!(is_valid_phone("13800000000"));
        assert!(is_valid_phone("19912345678"));
        assert!(!is_valid_phone("12800000000"));
        assert!(!is_valid_phone("1380000000"));
        assert!(!is_valid_phone("+8613800000000"));
    }

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_phone("13812345678"), "138****5678");
        assert_eq!(mask_phone("123"), "****");
    }

    #[test]
    fn test_random_code_shape() {
        let code = RandomCodeGenerator.generate(6);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_issue_then_verify_once() {
        let h = harness();
        h.otp.request_code(PHONE, CodePurpose::Login).await.unwrap();
        let code = h.last_code();

        h.otp.verify_code(PHONE, &code, CodePurpose::Login).await.unwrap();
        let again = h.otp.verify_code(PHONE, &code, CodePurpose::Login).await;
        assert!(matches!(again, Err(OtpError::AlreadyUsed)));
    }

    #[tokio::test]
    async fn test_purposes_do_not_collide() {
        let h = harness();
        h.otp.request_code(PHONE, CodePurpose::Login).await.unwrap();
        let code = h.last_code();

        let err = h
            .otp
            .verify_code(PHONE, &code, CodePurpose::BindPhone)
            .await
            .unwrap_err();
        assert!(matches!(err, OtpError::NotFound));
    }

    #[tokio::test]
    async fn test_attempt_cap() {
        let h = harness();
        h.otp.request_code(PHONE, CodePurpose::Login).await.unwrap();
        let code = h.last_code();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..3 {
            let err = h.otp.verify_code(PHONE, wrong, CodePurpose::Login).await;
            assert!(matches!(err, Err(OtpError::Mismatch)));
        }
        let err = h.otp.verify_code(PHONE, &code, CodePurpose::Login).await;
        assert!(matches!(err, Err(OtpError::AttemptsExceeded)));
        let err = h.otp.verify_code(PHONE, &code, CodePurpose::Login).await;
        assert!(matches!(err, Err(OtpError::AlreadyUsed)));
    }

    #[tokio::test]
    async fn test_expired_code_rejected() {
        let h = harness();
        h.otp.request_code(PHONE, CodePurpose::Login).await.unwrap();
        let code = h.last_code();

        h.clock.advance(Duration::minutes(5) + Duration::seconds(1));

        let err = h.otp.verify_code(PHONE, &code, CodePurpose::Login).await;
        assert!(matches!(err, Err(OtpError::Expired)));
    }

    #[tokio::test]
    async fn test_bad_format_rejected_before_lookup() {
        let h = harness();
        h.otp.request_code(PHONE, CodePurpose::Login).await.unwrap();

        let err = h.otp.verify_code(PHONE, "12ab56", CodePurpose::Login).await;
        assert!(matches!(err, Err(OtpError::InvalidCode)));

        // The malformed attempt must not have burned an attempt
        let code = h.last_code();
        h.otp.verify_code(PHONE, &code, CodePurpose::Login).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_previous_code() {
        let h = harness();
        h.otp.request_code(PHONE, CodePurpose::Login).await.unwrap();
        let first = h.last_code();

        let failing = OtpManager::new(
            h.otp.store.clone(),
            h.otp.limiter.clone(),
            Arc::new(Recorder {
                fail: true,
                ..Default::default()
            }),
            Arc::new(RandomCodeGenerator),
            OtpPolicy::default(),
            h.clock.clone(),
        );
        let err = failing.request_code(PHONE, CodePurpose::Login).await;
        assert!(matches!(err, Err(OtpError::Delivery(_))));

        h.otp.verify_code(PHONE, &first, CodePurpose::Login).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_delivery_counts_against_window() {
        let h = harness_with(Recorder {
            fail: true,
            ..Default::default()
        });
        for _ in 0..10 {
            let err = h.otp.request_code(PHONE, CodePurpose::Login).await;
            assert!(matches!(err, Err(OtpError::Delivery(_))));
        }
        let err = h.otp.request_code(PHONE, CodePurpose::Login).await;
        assert!(matches!(err, Err(OtpError::RateLimited)));
    }
}
