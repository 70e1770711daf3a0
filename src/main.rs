//! Payment gateway HTTP entrypoint.
//!
//! Boots the composition root: configuration, the relational store (with
//! migrations), provider adapters, queue workers, background sweeps, and the
//! Axum server. Shared state is constructed once here and passed down;
//! there are no global singletons.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the bind address
//! - `DATABASE_URL` plus per-provider credentials (see `config`)
//! - `RUST_LOG` controls tracing verbosity

use axum::http::Method;
use clap::Parser;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use dhecash_gateway::cache::TtlCache;
use dhecash_gateway::config::{CliArgs, Config};
use dhecash_gateway::handlers::{self, AppState};
use dhecash_gateway::lifecycle::{DispatchWorker, PaymentFlows};
use dhecash_gateway::notify::{DeliveryWorker, EventBus};
use dhecash_gateway::provider::ProviderRegistry;
use dhecash_gateway::provider::token::TokenCache;
use dhecash_gateway::queue::runner::JobRunner;
use dhecash_gateway::queue::{JobQueue, VISIBILITY_TIMEOUT, WEBHOOKS};
use dhecash_gateway::reconcile::Reconciler;
use dhecash_gateway::store::Store;
use dhecash_gateway::types::Channel;

/// Parallel jobs per payment channel worker.
const PAYMENT_WORKER_CONCURRENCY: usize = 5;
/// Parallel jobs for the webhook delivery worker.
const WEBHOOK_WORKER_CONCURRENCY: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli_args = CliArgs::parse();
    let config = Config::from_env()?;
    let store = Store::connect(&config.database_url).await?;
    tracing::info!("database connected, schema up to date");

    let http = reqwest::Client::new();
    let tokens = Arc::new(TokenCache::new(http.clone()));
    let registry = ProviderRegistry::from_config(&config, http.clone(), tokens);
    let queue = JobQueue::new(store.pool().clone());
    let bus = EventBus;
    let flows = PaymentFlows::new(store.clone(), queue.clone(), registry.clone(), bus);
    let reconciler = Reconciler::new(registry, store.clone(), flows.clone());

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    for channel in Channel::ALL {
        JobRunner::new(channel.queue_name(), queue.clone(), PAYMENT_WORKER_CONCURRENCY).spawn(
            Arc::new(DispatchWorker::new(flows.clone(), queue.clone())),
            cancel.clone(),
            &tracker,
        );
    }
    JobRunner::new(WEBHOOKS, queue.clone(), WEBHOOK_WORKER_CONCURRENCY).spawn(
        Arc::new(DeliveryWorker::new(
            store.clone(),
            http,
            config.webhook_signing_secret.clone(),
        )),
        cancel.clone(),
        &tracker,
    );

    let state = Arc::new(AppState {
        store,
        flows: flows.clone(),
        reconciler,
        idempotency: TtlCache::new(),
    });
    spawn_sweeps(&tracker, cancel.clone(), flows, queue, state.clone());

    let cors_layer = if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any)
    };
    let app = handlers::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    let addr = SocketAddr::new(cli_args.host, cli_args.port);
    tracing::info!("starting server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    spawn_signal_listener(cancel.clone());
    let shutdown_token = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    // Let workers drain their in-flight jobs before exiting.
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    Ok(())
}

/// Cancel everything on SIGTERM or SIGINT.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                tracing::error!(%error, "could not register SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}

/// Periodic maintenance: expiry of stale pending payments, release of
/// stalled jobs, provider status reconciliation, cache hygiene.
fn spawn_sweeps(
    tracker: &TaskTracker,
    cancel: CancellationToken,
    flows: PaymentFlows,
    queue: JobQueue,
    state: Arc<AppState>,
) {
    {
        let flows = flows.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                }
                if let Err(error) = flows.expire_pending().await {
                    tracing::error!(%error, "expiry sweep failed");
                }
            }
        });
    }
    {
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                }
                match queue.release_stalled(VISIBILITY_TIMEOUT).await {
                    Ok(0) => {}
                    Ok(released) => tracing::warn!(released, "released stalled jobs"),
                    Err(error) => tracing::error!(%error, "stalled-job sweep failed"),
                }
            }
        });
    }
    {
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(300)) => {}
                }
                flows
                    .sync_stale_processing(Duration::from_secs(600), 50)
                    .await;
            }
        });
    }
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            }
            state.idempotency.purge_expired();
        }
    });
}
