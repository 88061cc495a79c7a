// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use async_trait::async_trait;
use authgate::config::Config;
use authgate::db::MemoryRepository;
use authgate::models::{Provider, ProviderProfile, ProviderTokens};
use authgate::routes::create_router;
use authgate::services::{
    CodeDelivery, CodeGenerator, DeliveryError, FixedCodeGenerator, OAuthProviderAdapter,
    ProviderError, ProviderRegistry, RandomCodeGenerator,
};
use authgate::services::AuthDeps;
use authgate::time_utils::ManualClock;
use authgate::AppState;
use std::sync::{Arc, Mutex};

pub const PHONE: &str = "13800000000";

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

// ─── Test doubles ────────────────────────────────────────────

/// Delivery channel that remembers every code it was asked to send.
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<(String, String)>>,
}

#[allow(dead_code)]
impl RecordingDelivery {
    pub fn last_code(&self, phone: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == phone)
            .map(|(_, c)| c.clone())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl CodeDelivery for RecordingDelivery {
    async fn send(&self, phone: &str, code: &str) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((phone.to_string(), code.to_string()));
        Ok(())
    }
}

/// Provider double. The authorization code is used as the provider user id;
/// the code `"fail"` makes the token exchange fail.
pub struct FakeProvider(pub Provider);

#[async_trait]
impl OAuthProviderAdapter for FakeProvider {
    fn provider(&self) -> Provider {
        self.0
    }

    fn authorize_url(&self, state: &str) -> String {
        format!("https://{}.provider.test/authorize?state={}", self.0, state)
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, ProviderError> {
        if code == "fail" {
            return Err(ProviderError::Api {
                code: "40029".to_string(),
                message: "invalid code".to_string(),
            });
        }
        Ok(ProviderTokens {
            access_token: format!("provider-token-{}", code),
            refresh_token: None,
            expires_in: Some(7200),
            provider_user_id: Some(code.to_string()),
            raw: serde_json::Value::Null,
        })
    }

    async fn fetch_profile(&self, tokens: &ProviderTokens) -> Result<ProviderProfile, ProviderError> {
        let id = tokens.provider_user_id.clone().unwrap_or_default();
        Ok(ProviderProfile {
            provider: self.0,
            username: Some(format!("{}-{}", self.0, id)),
            avatar: Some(format!("https://img.provider.test/{}.png", id)),
            provider_user_id: id,
            email: None,
            raw: serde_json::Value::Null,
        })
    }
}

/// Pull the `state` query parameter out of an authorization URL.
#[allow(dead_code)]
pub fn state_param(url: &str) -> String {
    url.split("state=")
        .nth(1)
        .and_then(|rest| rest.split(|c: char| c == '&' || c == '#').next())
        .expect("authorization URL carries a state")
        .to_string()
}

// ─── App wiring ──────────────────────────────────────────────

/// Everything a test needs to drive and inspect the app.
#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub repo: Arc<MemoryRepository>,
    pub delivery: Arc<RecordingDelivery>,
    pub clock: Arc<ManualClock>,
}

fn build(generator: Arc<dyn CodeGenerator>, registry: ProviderRegistry) -> TestApp {
    let repo = Arc::new(MemoryRepository::new());
    let delivery = Arc::new(RecordingDelivery::default());
    let clock = Arc::new(ManualClock::default());

    let state = Arc::new(AppState::new(
        Config::test_default(),
        AuthDeps {
            repo: repo.clone(),
            delivery: delivery.clone(),
            generator,
            registry,
            clock: clock.clone(),
        },
    ));

    TestApp {
        router: create_router(state.clone()),
        state,
        repo,
        delivery,
        clock,
    }
}

fn fake_registry() -> ProviderRegistry {
    ProviderRegistry::new()
        .with(Arc::new(FakeProvider(Provider::Wechat)))
        .with(Arc::new(FakeProvider(Provider::Alipay)))
}

/// App with random codes and fake WeChat/Alipay adapters.
#[allow(dead_code)]
pub fn create_test_app() -> TestApp {
    build(Arc::new(RandomCodeGenerator), fake_registry())
}

/// App whose code generator always yields `code`.
#[allow(dead_code)]
pub fn create_test_app_with_code(code: &str) -> TestApp {
    build(Arc::new(FixedCodeGenerator(code.to_string())), fake_registry())
}

/// App with a caller-supplied provider registry.
#[allow(dead_code)]
pub fn create_test_app_with_registry(registry: ProviderRegistry) -> TestApp {
    build(Arc::new(RandomCodeGenerator), registry)
}
