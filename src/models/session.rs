// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token pair handed back to the caller after a successful login or refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Persisted half of a session. Only a keyed hash of the refresh token is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    /// `jti` of the access token issued alongside, used for logout
    pub access_jti: String,
    pub refresh_hash: String,
    /// Refresh token expiry
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
