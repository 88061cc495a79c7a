// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! authgate: phone one-time-code and WeChat/Alipay OAuth login with
//! rotating JWT sessions.
//!
//! The [`services::AuthFacade`] is the entry point for everything the API
//! layer does. [`routes::create_router`] exposes it over HTTP.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use services::{AuthDeps, AuthFacade};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub auth: AuthFacade,
}

impl AppState {
    pub fn new(config: Config, deps: AuthDeps) -> Self {
        let auth = AuthFacade::new(&config, deps);
        Self { config, auth }
    }
}
