// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Transient storage for one-time codes and OAuth handshake state.
//!
//! Codes are keyed by `(phone, purpose)`; storing a new code replaces the old
//! one. States are keyed by the state token and can only be taken once.
//! Expiry is checked on read; [`CodeStore::purge_expired`] only reclaims memory.

use crate::models::{CodePurpose, OAuthHandshakeState, OneTimeCode, Provider};
use crate::time_utils::Clock;
use dashmap::DashMap;
use std::sync::Arc;

pub struct CodeStore {
    codes: DashMap<(String, CodePurpose), OneTimeCode>,
    states: DashMap<String, OAuthHandshakeState>,
    clock: Arc<dyn Clock>,
}

impl CodeStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            codes: DashMap::new(),
            states: DashMap::new(),
            clock,
        }
    }

    // ─── One-time codes ──────────────────────────────────────────

    /// Store `code`, superseding any previous code for the same phone and purpose.
    pub fn put_code(&self, code: OneTimeCode) {
        self.codes.insert((code.phone.clone(), code.purpose), code);
    }

    /// Run `f` on the current code for `(phone, purpose)` while holding its lock.
    ///
    /// Returns `None` if there is no code. Issuance and verification of the
    /// same key are serialized through this lock.
    pub fn with_code<R>(
        &self,
        phone: &str,
        purpose: CodePurpose,
        f: impl FnOnce(&mut OneTimeCode) -> R,
    ) -> Option<R> {
        self.codes
            .get_mut(&(phone.to_string(), purpose))
            .map(|mut entry| f(entry.value_mut()))
    }

    // ─── OAuth handshake state ───────────────────────────────────

    pub fn put_state(&self, state: OAuthHandshakeState) {
        self.states.insert(state.state.clone(), state);
    }

    /// Remove the state token and return it if it belongs to `provider` and is
    /// unexpired. The token is consumed even when the checks fail.
    pub fn take_state(&self, state: &str, provider: Provider) -> Option<OAuthHandshakeState> {
        let (_, record) = self.states.remove(state)?;
        if record.provider != provider {
            tracing::warn!(
                expected = %record.provider,
                got = %provider,
                "OAuth state presented for wrong provider"
            );
            return None;
        }
        if record.is_expired(self.clock.now()) {
            tracing::info!(provider = %provider, "OAuth state expired");
            return None;
        }
        Some(record)
    }

    // ─── Maintenance ─────────────────────────────────────────────

    /// Drop expired codes and states. Returns how many entries were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.codes.len() + self.states.len();
        self.codes.retain(|_, code| !code.is_expired(now));
        self.states.retain(|_, state| !state.is_expired(now));
        before.saturating_sub(self.codes.len() + self.states.len())
    }

    pub fn pending_states(&self) -> usize {
        self.states.len()
    }
}
