// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod history;
pub mod oauth;
pub mod otp;
pub mod session;
pub mod user;

pub use history::LoginHistoryEntry;
pub use oauth::{
    OAuthHandshakeState, Provider, ProviderAccountLink, ProviderProfile, ProviderTokens,
    UnsupportedProvider,
};
pub use otp::{CodePurpose, OneTimeCode};
pub use session::{Session, SessionRecord};
pub use user::{Gender, LoginMethod, Preferences, Profile, ProfileUpdate, User};
