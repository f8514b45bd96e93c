//! The control loop: one task that owns the router and serves the command
//! link, the voice channel and the telemetry timers.

use std::time::Duration;

use camnode_telemetry::log_link_connected;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::bus::{CommandLink, LinkEvent};
use crate::router::{CommandRouter, Directive};
use crate::voice::VoiceCommand;

/// Bound on the flush between a restarting command's result and the restart.
pub const RESTART_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the control loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A config change was persisted; reload and start over.
    Restart,
    Shutdown,
    /// The command link closed for good.
    LinkClosed,
}

pub struct ControlLoop<L> {
    router: CommandRouter,
    link: L,
    voice: Option<mpsc::Receiver<VoiceCommand>>,
    shutdown: watch::Receiver<bool>,
}

impl<L: CommandLink> ControlLoop<L> {
    pub fn new(router: CommandRouter, link: L, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            router,
            link,
            voice: None,
            shutdown,
        }
    }

    /// Also serve commands from a voice channel.
    pub fn with_voice(mut self, voice: mpsc::Receiver<VoiceCommand>) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Hand the voice receiver back so the next loop can keep it.
    pub fn into_voice(self) -> Option<mpsc::Receiver<VoiceCommand>> {
        self.voice
    }

    /// Run until a restart, a shutdown or the end of the link.
    ///
    /// Each command runs to completion before the next event is looked at.
    pub async fn run(&mut self) -> ExitReason {
        let mut last_status = Instant::now();
        let mut last_climate = Instant::now();

        loop {
            let intervals = self.router.state().intervals;
            let status_at = last_status + intervals.status();
            let climate_at = last_climate + intervals.dht();

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return ExitReason::Shutdown;
                    }
                }

                event = self.link.next_event() => match event {
                    LinkEvent::Connected => {
                        log_link_connected!("Command link connected");
                        self.router.publish_status();
                    }
                    LinkEvent::Command(payload) => {
                        if self.router.handle_payload(&payload).await == Directive::Restart {
                            self.link.flush(RESTART_FLUSH_TIMEOUT).await;
                            return ExitReason::Restart;
                        }
                    }
                    LinkEvent::Disconnected => {
                        tracing::warn!("Command link lost, waiting for reconnect");
                    }
                    LinkEvent::Closed => return ExitReason::LinkClosed,
                },

                command = next_voice(&mut self.voice) => match command {
                    Some(command) => self.router.handle_voice(command).await,
                    None => self.voice = None,
                },

                _ = sleep_until(status_at) => {
                    self.router.publish_status();
                    last_status = Instant::now();
                }

                _ = sleep_until(climate_at) => {
                    self.router.sample_climate();
                    self.router.publish_climate();
                    last_climate = Instant::now();
                }
            }
        }
    }
}

async fn next_voice(voice: &mut Option<mpsc::Receiver<VoiceCommand>>) -> Option<VoiceCommand> {
    match voice {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
