//! tagflow ingestor binary.
//!
//! Subscribes to the reader broker, deduplicates tag observations, and
//! stages accepted documents in the durable queue for the gateway.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tagflow_core::{logging, AppConfig, GroupMap, LocationConfig};
use tagflow_dedup::Deduplicator;
use tagflow_ingestor::{broker, config_feed, pipeline::Pipeline};
use tagflow_queue::{CapacityConfig, StagingQueue, ValkeyStaging};

/// Bound on the delayed-report drain at shutdown.
const DEDUP_DRAIN_DEADLINE: Duration = Duration::from_secs(5);
/// Everything must be down within this budget.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

fn main() {
    logging::init("rumqttc=warn");

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
    info!("tagflow ingestor starting");

    let config = AppConfig::load().map_err(|e| {
        error!(error = %e, "configuration load failed");
        1
    })?;
    config.validate_identity().map_err(|e| {
        error!(error = %e, "configuration invalid");
        1
    })?;

    info!(
        location = %config.process.location,
        company_id = %config.process.company_id,
        mobile = config.process.mobile,
        "configuration loaded"
    );

    let groups = match &config.groups.file {
        Some(path) => GroupMap::load(path).map_err(|e| {
            error!(error = %e, "host-group file load failed");
            1
        })?,
        None => GroupMap::hostname_mode(),
    };

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

    let location_config = Arc::new(ArcSwap::from_pointee(LocationConfig::default()));
    let dedup = Deduplicator::new(
        location_config
            .load()
            .effective_interval_minutes(config.process.mobile),
    );

    let pipeline = Arc::new(Pipeline::new(
        config.process.context(),
        groups,
        dedup.clone(),
        Arc::clone(&queue),
        Arc::clone(&location_config),
    ));

    let cancel = CancellationToken::new();

    // Best-effort config refresh from the gateway.
    tokio::spawn(config_feed::run(
        config.api.gateway_url.clone(),
        config.process.location.clone(),
        config.process.company_id.clone(),
        Duration::from_secs(config.api.config_refresh_secs),
        Arc::clone(&location_config),
        dedup.clone(),
        cancel.clone(),
    ));

    tokio::spawn(stats_loop(Arc::clone(&pipeline), cancel.clone()));

    let broker_task = tokio::spawn(broker::run(
        config.broker.clone(),
        config.process.mobile,
        Arc::clone(&pipeline),
        cancel.clone(),
    ));

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_cancel.cancel();
        }
    });

    cancel.cancelled().await;

    let shutdown = async {
        // Intake has stopped; owed delayed reports fire once, then the
        // fallback drains into the durable store.
        let _ = broker_task.await;
        dedup.drain(DEDUP_DRAIN_DEADLINE).await;
        let flushed = queue.flush_fallback().await;
        if flushed > 0 {
            info!(flushed, "flushed fallback items at shutdown");
        }
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, shutdown).await.is_err() {
        error!("graceful shutdown budget exceeded, exiting");
    }

    info!("tagflow ingestor stopped");
    Ok(())
}

/// Periodic intake stats line.
async fn stats_loop(pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let counters = pipeline.counters().snapshot();
        let dedup = pipeline.dedup().stats();
        let queue = pipeline.queue().stats().await;
        info!(
            processed = counters.processed,
            suppressed = counters.suppressed,
            delayed_reports = counters.delayed_reports,
            parse_failures = counters.parse_failures,
            dropped_missing_tid = counters.dropped_missing_tid,
            active_keys = dedup.active_keys,
            queue_size = queue.size,
            capacity_drops = pipeline.queue().capacity_drops(),
            "intake stats"
        );
    }
}
