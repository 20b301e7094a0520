//! Partyline - notification engine entry point

use anyhow::{bail, Result};
use chrono::Utc;
use partyline_api::AppState;
use partyline_common::config::{Config, LoggingConfig};
use partyline_core::{transport, Deliverer, MiniJinjaRenderer, QueueWorker};
use partyline_storage::{models::SeedCelebration, DatabasePool, Store};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Partyline...");

    // Initialize store
    let store = connect_store(&config).await?;
    seed_store(&store, &config).await?;

    // Renderer, transport and the shared deliverer
    let renderer = Arc::new(MiniJinjaRenderer::new()?);
    let mail_transport = transport::from_config(&config.mail)?;
    info!("Mail transport: {}", mail_transport.name());
    let deliverer = Arc::new(
        Deliverer::new(renderer, mail_transport)
            .with_default("site_url", config.server.site_url.as_str()),
    );

    let state = AppState::build(store, deliverer, &config);

    // Start queue worker with batch recovery and the daily retention sweep
    let queue_handle = {
        let worker = QueueWorker::new(state.queue.clone())
            .with_batch_recovery(state.dispatcher.clone())
            .with_event_retention(state.ingestor.clone());
        tokio::spawn(async move {
            worker.run().await;
        })
    };

    // Start in-process trigger poller if enabled
    let trigger_handle = if config.trigger.poll_interval_secs > 0 {
        let trigger = state.trigger.clone();
        let interval_secs = config.trigger.poll_interval_secs;
        Some(tokio::spawn(async move {
            trigger.run(interval_secs).await;
        }))
    } else {
        info!("In-process trigger poller disabled, waiting for the external scheduler");
        None
    };

    // Start API server
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let api_handle = {
        let app = partyline_api::create_router(state);
        info!("Starting API server on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("API server error: {}", e);
            }
        })
    };

    info!("Partyline started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    api_handle.abort();
    queue_handle.abort();
    if let Some(handle) = trigger_handle {
        handle.abort();
    }

    info!("Partyline shutdown complete");

    Ok(())
}

async fn connect_store(config: &Config) -> Result<Store> {
    match config.database.backend.as_str() {
        "postgres" => {
            let db_pool = DatabasePool::new(&config.database).await?;
            info!("Database connection established");

            db_pool.migrate().await?;
            info!("Database migrations completed");

            Ok(Store::postgres(db_pool))
        }
        "memory" => {
            warn!("Using the in-memory store, state is lost on restart");
            Ok(Store::memory())
        }
        other => bail!("Unknown database backend: {}", other),
    }
}

/// Insert the configured celebration and contributors when absent
async fn seed_store(store: &Store, config: &Config) -> Result<()> {
    let Some(seed) = &config.celebration else {
        return Ok(());
    };

    let created = store
        .celebration
        .seed(
            SeedCelebration {
                instant: seed.instant,
                timezone: seed.timezone.clone(),
                celebrant_email: seed.celebrant_email.clone(),
                celebrant_name: seed.celebrant_name.clone(),
            },
            Utc::now(),
        )
        .await?;
    if created {
        info!(celebration_instant = %seed.instant, "Celebration seeded from configuration");
    }

    let mut added = 0;
    for address in &seed.contributors {
        if store.contributors.add(address, true).await? {
            added += 1;
        }
    }
    if added > 0 {
        info!(added, "Contributors seeded from configuration");
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
