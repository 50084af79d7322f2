/*
This file contains the placement webhook entrypoint.
It builds the workload cache, waits for it to sync
with the cluster and then serves the admission endpoints.
*/

use std::sync::Arc;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
    prelude::*
};
use anyhow::Result;

mod error;
use error::WebhookError;

mod utils;
use utils::configuration::WebhookConfig;

mod components;
use components::decision::DecisionEngine;
use components::informer::run_cache;
use components::webhook_server::{
    serve,
    webhook_router,
    WebhookState
};
use components::workload_cache::WorkloadCache;



#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    /*
    We must first retrieve the webhook configuration.
    */
    let config = WebhookConfig::parse();
    println!("{}", config);

    /*
    Ctrl-C cancels the initial sync if it is still
    running and then drains the admission server.
    */
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Cannot listen for shutdown signal"),
        }
        on_signal.cancel();
    });

    /*
    We create the client to interact with
    the Kubernetes API Server.
    */
    let client = Client::try_default().await.map_err(WebhookError::from)?;

    /*
    The cache is shared by the informers, which keep it
    up to date, and the decision engine, which reads it.
    A partial sync is logged and does not stop start-up.
    */
    let cache = Arc::new(WorkloadCache::new());
    let informers = run_cache(client, cache.clone(), config.cache_sync_timeout(), &cancel).await;
    if cancel.is_cancelled() {
        info!("Cancelled before serving");
        return Ok(());
    }

    let engine = DecisionEngine::new(cache, config.decision_retry_policy());
    let router = webhook_router(Arc::new(WebhookState::new(engine)));
    let served = serve(&config, router, cancel.clone()).await;

    /*
    The informers stop with the token: make sure they
    do even when the server failed on its own.
    */
    cancel.cancel();
    for handle in informers.handles() {
        let _ = handle.await;
    }

    served?;
    info!("Webhook stopped");
    Ok(())
}
