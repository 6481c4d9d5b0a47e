//! Bus supervision: connection, last-will presence, subscriptions, and the
//! pump that turns publishes into decoded records on bounded queues.
//!
//! The event loop reconnects on its own; this module only paces the retries
//! (1 s doubling to 30 s, reset on a successful connect).  Queue overflow
//! drops the message with a warning — the bus is lossy already, so no
//! back-pressure is propagated upstream.

use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rtls_protocol::{BusRecord, EventRecord, IngestorStatus, ScanRecord, StatusRecord,
    INGESTOR_STATUS_TOPIC};

use crate::config::Config;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Senders for the three kind queues the main loop drains.
pub struct BusQueues {
    pub scan_tx: mpsc::Sender<ScanRecord>,
    pub status_tx: mpsc::Sender<StatusRecord>,
    pub event_tx: mpsc::Sender<EventRecord>,
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Build the client and spawn the event-loop pump.
///
/// The returned client is used by the caller to disconnect on shutdown.
pub fn start(cfg: &Config, queues: BusQueues) -> (AsyncClient, JoinHandle<()>) {
    let mut options = MqttOptions::new(
        cfg.mqtt_client_id.clone(),
        cfg.mqtt_host.clone(),
        cfg.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_session(true);
    let will = serde_json::to_vec(&IngestorStatus::offline(&cfg.mqtt_client_id))
        .unwrap_or_default();
    options.set_last_will(LastWill::new(
        INGESTOR_STATUS_TOPIC,
        will,
        QoS::AtLeastOnce,
        true,
    ));

    let (client, eventloop) = AsyncClient::new(options, 64);
    let pump = tokio::spawn(run_event_loop(eventloop, client.clone(), cfg.clone(), queues));
    (client, pump)
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    cfg: Config,
    queues: BusQueues,
) {
    let mut backoff = RECONNECT_MIN;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff = RECONNECT_MIN;
                info!(host = %cfg.mqtt_host, port = cfg.mqtt_port, "connected to MQTT broker");
                on_connected(&client, &cfg).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatch(&publish.topic, &publish.payload, &cfg, &queues);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_s = backoff.as_secs(),
                    "MQTT connection error; will reconnect"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        }
    }
}

/// Publish retained online presence and (re-)subscribe after every connect.
async fn on_connected(client: &AsyncClient, cfg: &Config) {
    let online = serde_json::to_vec(&IngestorStatus::online(&cfg.mqtt_client_id))
        .unwrap_or_default();
    if let Err(e) = client
        .publish(INGESTOR_STATUS_TOPIC, QoS::AtLeastOnce, true, online)
        .await
    {
        warn!(error = %e, "failed to publish online status");
    }
    let qos = qos_from(cfg.mqtt_qos);
    for topic in [
        &cfg.sub_topic_scan,
        &cfg.sub_topic_status,
        &cfg.sub_topic_events,
    ] {
        if let Err(e) = client.subscribe(topic.clone(), qos).await {
            warn!(error = %e, topic = %topic, "subscribe failed");
        }
    }
}

fn dispatch(topic: &str, payload: &[u8], cfg: &Config, queues: &BusQueues) {
    let now_ms = Utc::now().timestamp_millis();
    match rtls_protocol::decode(topic, payload, now_ms, &cfg.ts_policy) {
        Ok(Some(BusRecord::Scan(rec))) => {
            if queues.scan_tx.try_send(rec).is_err() {
                warn!(topic = %topic, "scan queue full; dropping message");
            }
        }
        Ok(Some(BusRecord::Status(rec))) => {
            if queues.status_tx.try_send(rec).is_err() {
                warn!(topic = %topic, "status queue full; dropping message");
            }
        }
        Ok(Some(BusRecord::Event(rec))) => {
            if queues.event_tx.try_send(rec).is_err() {
                warn!(topic = %topic, "event queue full; dropping message");
            }
        }
        Ok(None) => debug!(topic = %topic, "ignored topic"),
        Err(e) => warn!(topic = %topic, error = %e, "invalid payload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels_map_to_mqtt_qos() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        // Out-of-range values degrade to the at-least-once default.
        assert_eq!(qos_from(7), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn dispatch_routes_by_topic_and_drops_on_full_queue() {
        let cfg = test_config();
        let (scan_tx, mut scan_rx) = mpsc::channel(1);
        let (status_tx, mut status_rx) = mpsc::channel(1);
        let (event_tx, _event_rx) = mpsc::channel(1);
        let queues = BusQueues {
            scan_tx,
            status_tx,
            event_tx,
        };

        dispatch(
            "rtls/anchor/A-01/scan",
            br#"{"anchor_id":"A-01","uid":"W-01","rssi":-70}"#,
            &cfg,
            &queues,
        );
        assert_eq!(scan_rx.try_recv().unwrap().uid, "W-01");

        dispatch(
            "rtls/anchor/A-01/status",
            br#"{"anchor_id":"A-01","uptime_s":10}"#,
            &cfg,
            &queues,
        );
        assert_eq!(status_rx.try_recv().unwrap().anchor_id, "A-01");

        // Fill the scan queue, then overflow: the second message is dropped.
        dispatch(
            "rtls/anchor/A-01/scan",
            br#"{"anchor_id":"A-01","uid":"W-01","rssi":-70}"#,
            &cfg,
            &queues,
        );
        dispatch(
            "rtls/anchor/A-01/scan",
            br#"{"anchor_id":"A-01","uid":"W-02","rssi":-70}"#,
            &cfg,
            &queues,
        );
        assert_eq!(scan_rx.try_recv().unwrap().uid, "W-01");
        assert!(scan_rx.try_recv().is_err());
    }

    fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".to_owned(),
            mqtt_host: "localhost".to_owned(),
            mqtt_port: 1883,
            mqtt_qos: 1,
            mqtt_client_id: "rtls-ingestor-test".to_owned(),
            sub_topic_scan: "rtls/anchor/+/scan".to_owned(),
            sub_topic_status: "rtls/anchor/+/status".to_owned(),
            sub_topic_events: "rtls/events".to_owned(),
            batch_max_size: 200,
            batch_max_age: Duration::from_secs(1),
            ids_refresh: Duration::from_secs(60),
            ts_policy: rtls_protocol::TsPolicy::default(),
        }
    }
}
