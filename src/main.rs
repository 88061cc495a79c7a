// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! authgate API server
//!
//! Phone one-time-code and WeChat/Alipay OAuth login with rotating JWT
//! sessions.

use anyhow::{bail, Context};
use authgate::{
    config::{Config, StorageBackend},
    db::{AccountRepository, FirestoreRepository, MemoryRepository},
    services::{
        AliyunSmsClient, AuthDeps, CodeDelivery, LogDelivery, ProviderRegistry,
        RandomCodeGenerator,
    },
    time_utils::SystemClock,
    AppState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired codes, states and idle rate-limit buckets are dropped.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured JSON logging for GCP
    init_logging()?;

    // Load configuration from environment
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(port = config.port, storage = ?config.storage, "Starting authgate");

    let repo: Arc<dyn AccountRepository> = match config.storage {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, accounts are lost on restart");
            Arc::new(MemoryRepository::new())
        }
        StorageBackend::Firestore => Arc::new(
            FirestoreRepository::new(&config.gcp_project_id, config.persistence_timeout)
                .await
                .context("Failed to connect to Firestore")?,
        ),
    };

    let delivery: Arc<dyn CodeDelivery> = match (&config.sms, config.storage) {
        (Some(sms), _) => Arc::new(
            AliyunSmsClient::new(sms.clone(), config.http_timeout)
                .context("Failed to initialize SMS client")?,
        ),
        (None, StorageBackend::Memory) => {
            tracing::warn!("No SMS gateway configured, codes are written to the log");
            Arc::new(LogDelivery)
        }
        (None, StorageBackend::Firestore) => {
            bail!("ALIYUN_* SMS settings are required with firestore storage")
        }
    };

    let registry =
        ProviderRegistry::from_config(&config).context("Failed to initialize OAuth providers")?;

    // Build shared state
    let state = Arc::new(AppState::new(
        config.clone(),
        AuthDeps {
            repo,
            delivery,
            generator: Arc::new(RandomCodeGenerator),
            registry,
            clock: Arc::new(SystemClock),
        },
    ));

    spawn_purge_task(state.clone());

    // Build router
    let app = authgate::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_purge_task(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            state.auth.purge_expired();
        }
    });
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() -> anyhow::Result<()> {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("authgate=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .with(format)
        .init();
    Ok(())
}
