//! tagflow gateway binary.
//!
//! Authenticates against the remote document store, keeps the location
//! configuration snapshot live, drains the staging queue, and serves the
//! control API.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tagflow_core::{logging, AppConfig, LocationConfig};
use tagflow_gateway::api::{self, AppState};
use tagflow_gateway::store::location_document_path;
use tagflow_gateway::{AuthManager, ConfigSubscriber, DocumentStore, Forwarder, HttpDocumentStore};
use tagflow_queue::{CapacityConfig, StagingQueue, ValkeyStaging};

/// Everything must be down within this budget.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

fn main() {
    logging::init("hyper=warn,reqwest=warn");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime start failed");
            std::process::exit(1);
        }
    };

    if let Err(code) = runtime.block_on(run()) {
        std::process::exit(code);
    }
}

async fn run() -> Result<(), i32> {
    info!("tagflow gateway starting");

    let config = AppConfig::load().map_err(|e| {
        error!(error = %e, "configuration load failed");
        1
    })?;
    config.validate_identity().map_err(|e| {
        error!(error = %e, "configuration invalid");
        1
    })?;

    // Credential first: an auth rejection is a startup failure.
    let auth = Arc::new(AuthManager::new(&config.auth).map_err(|e| {
        error!(error = %e, "auth manager build failed");
        1
    })?);
    auth.bootstrap(config.auth.invitation_code.as_deref())
        .await
        .map_err(|e| {
            error!(error = %e, "authentication failed at startup");
            1
        })?;

    let capacity = CapacityConfig {
        max_queue_size: config.staging.max_queue_size,
        max_memory_mb: config.staging.max_memory_mb,
        item_ttl: chrono::Duration::seconds(config.staging.item_ttl_secs as i64),
    };
    let durable = ValkeyStaging::new(&config.staging.url(), capacity)
        .await
        .map_err(|e| {
            error!(error = %e, "durable staging store unreachable");
            1
        })?;
    let queue = Arc::new(StagingQueue::new(durable, capacity));
    info!(host = %config.staging.host, port = config.staging.port, "staging store connected");

    let store: Arc<dyn DocumentStore> = Arc::new(
        HttpDocumentStore::new(
            &config.store.base_url,
            Arc::clone(&auth) as Arc<dyn tagflow_gateway::TokenSource>,
            Duration::from_secs(config.store.request_timeout_secs),
            Duration::from_secs(config.store.watch_interval_secs),
        )
        .map_err(|e| {
            error!(error = %e, "store client build failed");
            1
        })?,
    );

    let config_sub = Arc::new(ConfigSubscriber::new(LocationConfig::default()));
    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&auth),
        config.forwarder.clone(),
    ));

    let cancel = CancellationToken::new();

    // Credential refresh every 45 minutes.
    let refresh_auth = Arc::clone(&auth);
    let refresh_interval = config.auth.refresh_interval();
    let refresh_cancel = cancel.clone();
    tokio::spawn(async move {
        refresh_auth
            .run_refresh_loop(refresh_interval, refresh_cancel)
            .await;
    });

    // Snapshot stream on our location document.
    let sub = Arc::clone(&config_sub);
    let sub_store = Arc::clone(&store);
    let sub_path = location_document_path(&config.process.company_id, &config.process.location);
    let sub_cancel = cancel.clone();
    tokio::spawn(async move {
        sub.run(sub_store, sub_path, sub_cancel).await;
    });

    // Queue drain.
    let forwarder_task = tokio::spawn(Arc::clone(&forwarder).run(cancel.clone()));

    // Control API.
    let state = Arc::new(AppState {
        auth: Arc::clone(&auth),
        queue: Arc::clone(&queue),
        config_sub: Arc::clone(&config_sub),
        store: Arc::clone(&store),
        forwarder: Arc::clone(&forwarder),
        location: config.process.location.clone(),
        company_id: config.process.company_id.clone(),
        update_status_path: config.api.update_status_path.clone(),
    });
    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.api.listen_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.api.listen_addr, "control API bind failed");
            1
        })?;
    info!(addr = %config.api.listen_addr, "control API listening");

    let serve_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "control API server error");
        }
    });

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_cancel.cancel();
        }
    });

    cancel.cancelled().await;

    let shutdown = async {
        // The forwarder resolves its current lease before exiting; the
        // fallback is flushed so nothing rides on process memory.
        let _ = forwarder_task.await;
        let flushed = queue.flush_fallback().await;
        if flushed > 0 {
            info!(flushed, "flushed fallback items at shutdown");
        }
        let _ = server_task.await;
        info!("signed out");
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, shutdown).await.is_err() {
        error!("graceful shutdown budget exceeded, exiting");
    }

    info!("tagflow gateway stopped");
    Ok(())
}
