// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod auth;
pub mod code_store;
pub mod oauth;
pub mod otp;
pub mod rate_limit;
pub mod session;
pub mod sms;

pub use auth::{AuthDeps, AuthFacade, LinkedProvider, PhoneLogin};
pub use code_store::CodeStore;
pub use oauth::{
    AlipayAdapter, OAuthCompletion, OAuthError, OAuthOrchestrator, OAuthProviderAdapter,
    ProviderError, ProviderRegistry, WechatAdapter,
};
pub use otp::{CodeGenerator, FixedCodeGenerator, OtpError, OtpManager, RandomCodeGenerator};
pub use rate_limit::{RateDecision, RateLimiter};
pub use session::{Claims, SessionError, SessionIssuer, TokenType};
pub use sms::{AliyunSmsClient, CodeDelivery, DeliveryError, LogDelivery};
