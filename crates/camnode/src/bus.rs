//! Pub/sub transport capabilities.
//!
//! [`Publisher`] is the outbound half, shared by everything that reports;
//! [`CommandLink`] is the inbound half, owned by the control loop.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("message not accepted by transport: {0}")]
    Rejected(String),

    #[error("transport closed")]
    Closed,
}

/// Delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// Topic names for one node, all under `cam/{clientId}/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub cmd: String,
    pub result: String,
    pub status: String,
    pub config: String,
    pub dht: String,
}

impl Topics {
    pub fn for_client(client_id: &str) -> Self {
        let base = format!("cam/{client_id}");
        Self {
            cmd: format!("{base}/cmd"),
            result: format!("{base}/result"),
            status: format!("{base}/status"),
            config: format!("{base}/config"),
            dht: format!("{base}/dht"),
        }
    }
}

/// Outbound messages. Publishing only enqueues; it never waits on the
/// network.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), BusError>;
}

/// What the inbound side of the link observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Session (re)established and the command topic subscribed.
    Connected,
    /// Raw payload received on the command topic.
    Command(Bytes),
    /// Session lost; the link keeps retrying.
    Disconnected,
    /// The link is gone for good.
    Closed,
}

/// Inbound command stream.
pub trait CommandLink: Send {
    /// Next event. Must be cancel safe.
    fn next_event(&mut self) -> impl Future<Output = LinkEvent> + Send;

    /// Wait until everything published so far was handed to the network,
    /// or `timeout` elapsed.
    fn flush(&mut self, timeout: Duration) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_for_client() {
        let topics = Topics::for_client("esp32cam");
        assert_eq!(topics.cmd, "cam/esp32cam/cmd");
        assert_eq!(topics.result, "cam/esp32cam/result");
        assert_eq!(topics.status, "cam/esp32cam/status");
        assert_eq!(topics.config, "cam/esp32cam/config");
        assert_eq!(topics.dht, "cam/esp32cam/dht");
    }
}
