// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User and profile models for storage and API.

use crate::models::oauth::Provider;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Palette used for generated avatars, picked by a hash of the display name.
const AVATAR_COLORS: [&str; 10] = [
    "FF6B6B", "4ECDC4", "45B7D1", "96CEB4", "FFEAA7", "DDA0DD", "FFB6C1", "87CEEB", "F0E68C",
    "FFA07A",
];

/// How a user first signed in. Serialized as `phone` or `oauth:<provider>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum LoginMethod {
    Phone,
    OAuth(Provider),
}

impl fmt::Display for LoginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginMethod::Phone => f.write_str("phone"),
            LoginMethod::OAuth(provider) => write!(f, "oauth:{}", provider),
        }
    }
}

impl From<LoginMethod> for String {
    fn from(method: LoginMethod) -> Self {
        method.to_string()
    }
}

impl TryFrom<String> for LoginMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "phone" {
            return Ok(LoginMethod::Phone);
        }
        value
            .strip_prefix("oauth:")
            .and_then(|p| p.parse::<Provider>().ok())
            .map(LoginMethod::OAuth)
            .ok_or_else(|| format!("unknown login method: {}", value))
    }
}

/// User identity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Opaque id (UUID v4), immutable once assigned
    pub id: String,
    /// Mainland China mobile number, if the user signed in by phone
    pub phone: Option<String>,
    pub email: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub primary_provider: LoginMethod,
    pub is_active: bool,
    /// Generation credits granted at signup
    pub credits: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
    pub profile: Option<Profile>,
}

impl User {
    /// Build a fresh, active user with a default profile.
    pub fn new(
        display_name: String,
        primary_provider: LoginMethod,
        credits: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let profile = Profile::with_defaults(&display_name, now);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            phone: None,
            email: None,
            avatar_url: Some(default_avatar_url(&display_name)),
            display_name,
            primary_provider,
            is_active: true,
            credits,
            created_at: now,
            updated_at: now,
            last_login_at: now,
            profile: Some(profile),
        }
    }

    /// New user created by a first successful phone login.
    pub fn from_phone(phone: &str, credits: u32, now: DateTime<Utc>) -> Self {
        let suffix = &phone[phone.len().saturating_sub(4)..];
        let mut user = Self::new(format!("用户{}", suffix), LoginMethod::Phone, credits, now);
        user.phone = Some(phone.to_string());
        user
    }
}

/// Generated avatar URL for users without a provider avatar.
pub fn default_avatar_url(name: &str) -> String {
    let hash: u32 = name.chars().map(|c| c as u32).fold(0u32, u32::wrapping_add);
    let color = AVATAR_COLORS[(hash as usize) % AVATAR_COLORS.len()];
    let initial: String = name
        .chars()
        .next()
        .map(|c| c.to_uppercase().collect())
        .unwrap_or_default();
    format!(
        "https://ui-avatars.com/api/?name={}&background={}&color=fff&size=100",
        urlencoding::encode(&initial),
        color
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "zh-CN")]
    ZhCn,
    #[serde(rename = "en-US")]
    EnUs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub email: bool,
    pub sms: bool,
    pub push: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            email: false,
            sms: true,
            push: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyPreferences {
    pub profile_public: bool,
    pub works_public: bool,
}

impl Default for PrivacyPreferences {
    fn default() -> Self {
        Self {
            profile_public: false,
            works_public: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub language: Language,
    pub theme: Theme,
    pub notifications: NotificationPreferences,
    pub privacy: PrivacyPreferences,
}

/// Profile owned 1:1 by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub nickname: Option<String>,
    pub gender: Gender,
    pub birthday: Option<NaiveDate>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn with_defaults(nickname: &str, now: DateTime<Utc>) -> Self {
        Self {
            nickname: Some(nickname.to_string()),
            gender: Gender::Unknown,
            birthday: None,
            location: None,
            bio: None,
            preferences: Preferences::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial profile update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub preferences: Option<Preferences>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ProfileUpdate::default()
    }

    /// Apply onto `profile`, stamping `updated_at`.
    pub fn apply(&self, profile: &mut Profile, now: DateTime<Utc>) {
        if let Some(nickname) = &self.nickname {
            profile.nickname = Some(nickname.clone());
        }
        if let Some(gender) = self.gender {
            profile.gender = gender;
        }
        if let Some(birthday) = self.birthday {
            profile.birthday = Some(birthday);
        }
        if let Some(location) = &self.location {
            profile.location = Some(location.clone());
        }
        if let Some(bio) = &self.bio {
            profile.bio = Some(bio.clone());
        }
        if let Some(preferences) = self.preferences {
            profile.preferences = preferences;
        }
        profile.updated_at = now;
    }
}
