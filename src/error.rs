// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Error taxonomy shared by every facade operation, with consistent API responses.
//!
//! Components keep their own error enums. At the facade boundary each of them
//! collapses into an [`AuthError`] carrying a stable [`ErrorKind`]. Upstream and
//! persistence failures are logged with full detail here and replaced with a
//! generic message so provider bodies and database errors never reach callers.

use crate::db::RepoError;
use crate::services::oauth::{OAuthError, ProviderError};
use crate::services::otp::OtpError;
use crate::services::session::SessionError;
use crate::services::sms::DeliveryError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const TRY_AGAIN: &str = "Service temporarily unavailable, please try again";

/// Stable, caller-visible failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    RateLimited,
    NotFound,
    Expired,
    AttemptsExceeded,
    Mismatch,
    Conflict,
    UpstreamFailure,
    PersistenceFailure,
    Timeout,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Expired => StatusCode::GONE,
            ErrorKind::AttemptsExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Mismatch => StatusCode::UNAUTHORIZED,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::UpstreamFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::PersistenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Normalized failure returned by every facade operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct AuthError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AuthError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// No or unusable credentials on the request.
    pub fn unauthenticated() -> Self {
        Self::new(ErrorKind::Mismatch, "Authentication required")
    }

    /// Log the real cause and hide it behind a generic message.
    pub(crate) fn internal(kind: ErrorKind, detail: &dyn fmt::Display) -> Self {
        tracing::error!(kind = ?kind, error = %detail, "Auth operation failed");
        Self::new(kind, TRY_AGAIN)
    }
}

/// Result type alias for facade operations and handlers
pub type Result<T> = std::result::Result<T, AuthError>;

// ─── Component error conversions ────────────────────────────────────────────

impl From<RepoError> for AuthError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Timeout => AuthError::internal(ErrorKind::Timeout, &err),
            RepoError::NotFound(ref what) => {
                AuthError::new(ErrorKind::NotFound, format!("{} not found", what))
            }
            RepoError::Conflict(_) | RepoError::Backend(_) => {
                AuthError::internal(ErrorKind::PersistenceFailure, &err)
            }
        }
    }
}

impl From<DeliveryError> for AuthError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Timeout => AuthError::internal(ErrorKind::Timeout, &err),
            DeliveryError::Rejected { .. } | DeliveryError::Transport(_) => {
                AuthError::internal(ErrorKind::UpstreamFailure, &err)
            }
        }
    }
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => AuthError::internal(ErrorKind::Timeout, &err),
            _ => AuthError::internal(ErrorKind::UpstreamFailure, &err),
        }
    }
}

impl From<OtpError> for AuthError {
    fn from(err: OtpError) -> Self {
        let kind = match err {
            OtpError::Delivery(inner) => return inner.into(),
            OtpError::InvalidPhone | OtpError::InvalidCode => ErrorKind::InvalidInput,
            OtpError::RateLimited => ErrorKind::RateLimited,
            OtpError::NotFound => ErrorKind::NotFound,
            OtpError::Expired => ErrorKind::Expired,
            OtpError::AttemptsExceeded => ErrorKind::AttemptsExceeded,
            OtpError::Mismatch | OtpError::AlreadyUsed => ErrorKind::Mismatch,
        };
        AuthError::new(kind, err.to_string())
    }
}

impl From<SessionError> for AuthError {
    fn from(err: SessionError) -> Self {
        let kind = match err {
            SessionError::Persistence(inner) => return inner.into(),
            SessionError::Signing(_) => {
                return AuthError::internal(ErrorKind::PersistenceFailure, &err)
            }
            SessionError::Malformed | SessionError::InvalidSignature | SessionError::InvalidToken => {
                ErrorKind::Mismatch
            }
            SessionError::Expired => ErrorKind::Expired,
            SessionError::UserNotFound => ErrorKind::NotFound,
        };
        AuthError::new(kind, err.to_string())
    }
}

impl From<OAuthError> for AuthError {
    fn from(err: OAuthError) -> Self {
        let kind = match err {
            OAuthError::TokenExchangeFailed(inner) | OAuthError::ProfileFetchFailed(inner) => {
                return inner.into()
            }
            OAuthError::Persistence(inner) => return inner.into(),
            OAuthError::Session(inner) => return inner.into(),
            OAuthError::UnsupportedProvider(_) | OAuthError::NotConfigured(_) => {
                ErrorKind::InvalidInput
            }
            OAuthError::InvalidState => ErrorKind::Mismatch,
            OAuthError::AlreadyBound | OAuthError::LastCredentialStanding => ErrorKind::Conflict,
            OAuthError::UserNotFound | OAuthError::NotLinked(_) => ErrorKind::NotFound,
        };
        AuthError::new(kind, err.to_string())
    }
}

// ─── HTTP mapping ───────────────────────────────────────────────────────────

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse<'a> {
    success: bool,
    error: &'a AuthError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ErrorResponse {
            success: false,
            error: &self,
        };
        (status, Json(body)).into_response()
    }
}
