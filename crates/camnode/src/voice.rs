//! Local voice trigger channel.
//!
//! A voice module writes `CMD:<NAME>` lines on a serial port. Lines end with
//! CR or LF and anything past 63 bytes is dropped.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Longest line kept, in bytes. Extra bytes are discarded until the next
/// terminator.
pub const MAX_LINE_BYTES: usize = 63;

const PREFIX: &str = "CMD:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCommand {
    LedOn,
    LedOff,
    LedMax,
    LedMid,
    RedLedOn,
    RedLedOff,
    WindowOpen,
    WindowClose,
    FanOn,
    FanOff,
    Capture,
}

impl VoiceCommand {
    pub fn from_name(name: &str) -> Option<Self> {
        let command = match name {
            "LED_ON" => VoiceCommand::LedOn,
            "LED_OFF" => VoiceCommand::LedOff,
            "LED_MAX" => VoiceCommand::LedMax,
            "LED_MID" => VoiceCommand::LedMid,
            "RLED_ON" => VoiceCommand::RedLedOn,
            "RLED_OFF" => VoiceCommand::RedLedOff,
            "WIN_OPEN" => VoiceCommand::WindowOpen,
            "WIN_CLOSE" => VoiceCommand::WindowClose,
            "FAN_ON" => VoiceCommand::FanOn,
            "FAN_OFF" => VoiceCommand::FanOff,
            "CAPTURE" => VoiceCommand::Capture,
            _ => return None,
        };
        Some(command)
    }

    /// Parse one complete line. Lines without the `CMD:` prefix and unknown
    /// names are logged and ignored.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Some(name) = line.strip_prefix(PREFIX) else {
            tracing::debug!(line = %line, "Ignoring voice line without command prefix");
            return None;
        };

        let command = Self::from_name(name.trim());
        if command.is_none() {
            tracing::warn!(name = %name, "Unknown voice command");
        }
        command
    }
}

/// Splits a byte stream into bounded lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_LINE_BYTES + 1),
        }
    }

    /// Feed one byte; returns a line when a terminator completes one.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        match byte {
            b'\r' | b'\n' => {
                if self.buf.is_empty() {
                    return None;
                }
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Some(line)
            }
            _ => {
                if self.buf.len() < MAX_LINE_BYTES {
                    self.buf.push(byte);
                }
                None
            }
        }
    }
}

/// Read voice lines from `reader` and forward parsed commands until the
/// reader hits EOF or the receiver is gone.
pub fn spawn_reader<R>(mut reader: R, tx: mpsc::Sender<VoiceCommand>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framer = LineFramer::new();
        let mut chunk = [0u8; 64];

        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "Voice channel read failed");
                    break;
                }
            };

            for &byte in &chunk[..n] {
                let Some(line) = framer.push(byte) else {
                    continue;
                };
                if let Some(command) = VoiceCommand::parse_line(&line) {
                    tracing::info!(command = ?command, "Voice command received");
                    if tx.send(command).await.is_err() {
                        return;
                    }
                }
            }
        }

        tracing::info!("Voice channel closed");
    })
}
