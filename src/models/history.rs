// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use crate::models::user::LoginMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One login attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginHistoryEntry {
    pub id: String,
    /// `None` when the attempt failed before a user was resolved
    pub user_id: Option<String>,
    pub login_method: LoginMethod,
    pub is_successful: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LoginHistoryEntry {
    pub fn success(user_id: &str, login_method: LoginMethod, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: Some(user_id.to_string()),
            login_method,
            is_successful: true,
            failure_reason: None,
            created_at: now,
        }
    }

    pub fn failure(
        user_id: Option<String>,
        login_method: LoginMethod,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            login_method,
            is_successful: false,
            failure_reason: Some(reason.into()),
            created_at: now,
        }
    }
}
