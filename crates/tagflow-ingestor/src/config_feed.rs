//! Best-effort location-config refresh.
//!
//! The gateway owns the live snapshot of the remote location configuration
//! and serves it on its control API; the ingestor pulls it from there on an
//! interval. A failed refresh keeps the last known snapshot — it never
//! blocks or fails message processing.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tagflow_core::LocationConfig;
use tagflow_dedup::Deduplicator;

#[derive(Deserialize)]
struct ConfigResponse {
    success: bool,
    config: Option<LocationConfig>,
}

/// Poll the gateway's control API and keep the snapshot current.
pub async fn run(
    gateway_url: String,
    location: String,
    company_id: String,
    refresh_interval: Duration,
    snapshot: Arc<ArcSwap<LocationConfig>>,
    dedup: Deduplicator,
    cancel: CancellationToken,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "config feed disabled: HTTP client build failed");
            return;
        }
    };

    let url = format!(
        "{}/api/config/location/{}?companyId={}",
        gateway_url.trim_end_matches('/'),
        location,
        company_id
    );

    let mut ticker = tokio::time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match fetch(&client, &url).await {
            Ok(Some(fresh)) => apply(&snapshot, &dedup, fresh),
            Ok(None) => debug!("config refresh returned no config"),
            Err(e) => debug!(error = %e, "config refresh failed, keeping last snapshot"),
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Option<LocationConfig>, reqwest::Error> {
    let response: ConfigResponse = client.get(url).send().await?.json().await?;
    Ok(response.success.then_some(response.config).flatten())
}

fn apply(snapshot: &ArcSwap<LocationConfig>, dedup: &Deduplicator, fresh: LocationConfig) {
    let current = snapshot.load_full();
    if current.relevant_eq(&fresh) {
        return;
    }

    info!(
        deduplicate = fresh.deduplicate,
        interval_minutes = fresh.deduplicate_interval_minutes,
        reporting = fresh.reporting,
        "location configuration changed"
    );

    if current.deduplicate_interval_minutes != fresh.deduplicate_interval_minutes
        || current.mobile_deduplicate_interval_minutes != fresh.mobile_deduplicate_interval_minutes
    {
        // New windows pick this up; live windows keep their fire time.
        dedup.set_interval(fresh.deduplicate_interval_minutes);
    }

    snapshot.store(Arc::new(fresh));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_swaps_on_relevant_change() {
        let snapshot = Arc::new(ArcSwap::from_pointee(LocationConfig::default()));
        let dedup = Deduplicator::new(1);

        let mut fresh = LocationConfig::default();
        fresh.deduplicate_interval_minutes = 7;
        apply(&snapshot, &dedup, fresh);

        assert_eq!(snapshot.load().deduplicate_interval_minutes, 7);
    }

    #[tokio::test]
    async fn apply_skips_irrelevant_change() {
        let snapshot = Arc::new(ArcSwap::from_pointee(LocationConfig::default()));
        let dedup = Deduplicator::new(1);

        let mut fresh = LocationConfig::default();
        fresh
            .extra
            .insert("displayName".to_owned(), serde_json::json!("Dock 4"));
        apply(&snapshot, &dedup, fresh);

        // The swap is skipped entirely, extra fields included.
        assert!(snapshot.load().extra.is_empty());
    }
}
