//! Broker subscription loop.
//!
//! QoS-2 subscription with clean session: the broker replays nothing, so
//! the subscription is re-issued on every connection acknowledgement. Poll
//! errors back off for the configured reconnect delay and the loop carries
//! on; only cancellation ends it.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, NetworkOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tagflow_core::config::BrokerConfig;

use crate::pipeline::Pipeline;

/// Client identifier: `<6-char-random>-<fixed|mobile>`.
#[must_use]
pub fn client_id(mobile: bool) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let mode = if mobile { "mobile" } else { "fixed" };
    format!("{suffix}-{mode}")
}

/// Run the subscription loop until cancelled.
pub async fn run(config: BrokerConfig, mobile: bool, pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    let id = client_id(mobile);
    let mut options = MqttOptions::new(&id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let mut network_options = NetworkOptions::new();
    network_options.set_connection_timeout(config.connect_timeout_secs);
    eventloop.set_network_options(network_options);

    info!(
        client_id = %id,
        host = %config.host,
        port = config.port,
        topic = %config.topic,
        "connecting to broker"
    );

    let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("broker loop stopping");
                let _ = client.disconnect().await;
                return;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %config.topic, "broker connected, subscribing");
                    if let Err(e) = client.subscribe(&config.topic, QoS::ExactlyOnce).await {
                        warn!(error = %e, "subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    pipeline.handle_message(&publish.topic, &publish.payload).await;
                }
                Ok(event) => debug!(?event, "broker event"),
                Err(e) => {
                    warn!(error = %e, "broker connection lost, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_shape() {
        let fixed = client_id(false);
        let mobile = client_id(true);

        assert!(fixed.ends_with("-fixed"));
        assert!(mobile.ends_with("-mobile"));
        assert_eq!(fixed.split('-').next().unwrap().len(), 6);
    }

    #[test]
    fn client_ids_are_distinct() {
        assert_ne!(client_id(false), client_id(false));
    }
}
