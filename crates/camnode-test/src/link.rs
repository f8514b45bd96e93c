//! A command link driven by the test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use camnode_lib::bus::{CommandLink, LinkEvent};

/// Link side, handed to the control loop.
pub struct ScriptedLink {
    events: mpsc::UnboundedReceiver<LinkEvent>,
    flushes: Arc<AtomicUsize>,
}

/// Test side of a [`ScriptedLink`]. Dropping it closes the link.
#[derive(Clone)]
pub struct LinkHandle {
    events: mpsc::UnboundedSender<LinkEvent>,
    flushes: Arc<AtomicUsize>,
}

impl ScriptedLink {
    pub fn new() -> (ScriptedLink, LinkHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flushes = Arc::new(AtomicUsize::new(0));
        let link = ScriptedLink {
            events: rx,
            flushes: Arc::clone(&flushes),
        };
        (link, LinkHandle { events: tx, flushes })
    }
}

impl CommandLink for ScriptedLink {
    async fn next_event(&mut self) -> LinkEvent {
        self.events.recv().await.unwrap_or(LinkEvent::Closed)
    }

    async fn flush(&mut self, _timeout: Duration) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

impl LinkHandle {
    pub fn connect(&self) {
        let _ = self.events.send(LinkEvent::Connected);
    }

    pub fn disconnect(&self) {
        let _ = self.events.send(LinkEvent::Disconnected);
    }

    pub fn command(&self, payload: &str) {
        let _ = self
            .events
            .send(LinkEvent::Command(Bytes::from(payload.to_string())));
    }

    pub fn close(&self) {
        let _ = self.events.send(LinkEvent::Closed);
    }

    /// Number of flushes the loop performed.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}
