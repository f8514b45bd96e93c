//! MQTT transport over `rumqttc`.
//!
//! The event loop runs in its own task and forwards what the control loop
//! cares about through a channel, which keeps [`MqttLink::next_event`] cancel
//! safe. The channel is unbounded so a busy control loop never stalls
//! polling, which a flush relies on.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};

use crate::bus::{BusError, CommandLink, LinkEvent, Publisher, Qos, Topics};
use crate::config_store::DeviceConfig;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 32;
/// Largest packet in either direction; the config dump is the biggest
/// outbound message.
const MAX_PACKET_SIZE: usize = 4096;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub server: String,
    pub port: u16,
    pub client_id: String,
    pub retry_delay: Duration,
}

impl LinkSettings {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            server: config.mqtt_server.clone(),
            port: config.mqtt_port,
            client_id: config.mqtt_client_id.clone(),
            retry_delay: RETRY_DELAY,
        }
    }
}

/// Inbound half of an MQTT session.
pub struct MqttLink {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    sent: watch::Receiver<u64>,
    enqueued: Arc<AtomicU64>,
}

/// Outbound half of an MQTT session.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    enqueued: Arc<AtomicU64>,
}

impl MqttLink {
    /// Start the session. Connection happens in the background; the link
    /// reports [`LinkEvent::Connected`] once the broker accepted it.
    pub fn start(settings: &LinkSettings, topics: &Topics) -> (MqttLink, MqttPublisher) {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.server.clone(),
            settings.port,
        );
        options.set_keep_alive(KEEP_ALIVE);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = watch::channel(0u64);
        let enqueued = Arc::new(AtomicU64::new(0));

        tracing::info!(
            server = %settings.server,
            port = settings.port,
            client_id = %settings.client_id,
            "Connecting to MQTT broker"
        );

        tokio::spawn(drive(
            eventloop,
            client.clone(),
            topics.cmd.clone(),
            events_tx,
            sent_tx,
            settings.retry_delay,
        ));

        let link = MqttLink {
            client: client.clone(),
            events: events_rx,
            sent: sent_rx,
            enqueued: Arc::clone(&enqueued),
        };
        let publisher = MqttPublisher { client, enqueued };
        (link, publisher)
    }
}

impl CommandLink for MqttLink {
    async fn next_event(&mut self) -> LinkEvent {
        self.events.recv().await.unwrap_or(LinkEvent::Closed)
    }

    async fn flush(&mut self, timeout: Duration) {
        let target = self.enqueued.load(Ordering::SeqCst);
        let drained = tokio::time::timeout(timeout, self.sent.wait_for(|sent| *sent >= target))
            .await
            .is_ok_and(|r| r.is_ok());
        if !drained {
            tracing::warn!(pending = target, "Outbound queue not drained before timeout");
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        let _ = self.client.try_disconnect();
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), BusError> {
        let qos = match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        };
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| BusError::Rejected(e.to_string()))?;
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts publishes written to the socket once each.
///
/// A QoS 1 publish keeps its packet id until the broker acks it; a resend
/// under the same id after a reconnect is not a new publish.
#[derive(Debug, Default)]
struct SentTally {
    unacked: HashSet<u16>,
}

impl SentTally {
    /// Returns whether this outgoing publish is new.
    fn on_publish(&mut self, pkid: u16) -> bool {
        pkid == 0 || self.unacked.insert(pkid)
    }

    fn on_ack(&mut self, pkid: u16) {
        self.unacked.remove(&pkid);
    }
}

/// Poll the event loop until the link is dropped.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    cmd_topic: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    sent: watch::Sender<u64>,
    retry_delay: Duration,
) {
    let mut tally = SentTally::default();

    loop {
        let polled = tokio::select! {
            _ = events.closed() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // A fresh session has no subscriptions.
                if let Err(e) = client.try_subscribe(cmd_topic.clone(), QoS::AtLeastOnce) {
                    tracing::warn!(error = %e, topic = %cmd_topic, "Failed to subscribe");
                }
                Some(LinkEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == cmd_topic => {
                Some(LinkEvent::Command(publish.payload))
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if tally.on_publish(pkid) {
                    sent.send_modify(|n| *n += 1);
                }
                None
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                tally.on_ack(ack.pkid);
                None
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, retry_in = ?retry_delay, "MQTT connection error");
                if events.send(LinkEvent::Disconnected).is_err() {
                    break;
                }
                tokio::select! {
                    _ = events.closed() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                break;
            }
        }
    }

    tracing::debug!("MQTT event loop stopped");
}
