//! Event system for presentation decoupling.
//!
//! Long-running operations (connect, download, flash, backup) publish
//! structured events to a [`LinkObserver`] so a CLI or progress display can
//! follow along without depending on the engine's internals.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of a hub operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Scanning,
    Connecting,
    Negotiating,
    Downloading,
    Running,
    RebootingToBootloader,
    /// Flasher phases
    Erasing,
    Programming,
    Verifying,
    BackingUp,
    Restoring,
    Complete,
    Error,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkPhase::Scanning => write!(f, "Scanning"),
            LinkPhase::Connecting => write!(f, "Connecting"),
            LinkPhase::Negotiating => write!(f, "Negotiating"),
            LinkPhase::Downloading => write!(f, "Downloading"),
            LinkPhase::Running => write!(f, "Running"),
            LinkPhase::RebootingToBootloader => write!(f, "Rebooting to Bootloader"),
            LinkPhase::Erasing => write!(f, "Erasing"),
            LinkPhase::Programming => write!(f, "Programming"),
            LinkPhase::Verifying => write!(f, "Verifying"),
            LinkPhase::BackingUp => write!(f, "Backing Up"),
            LinkPhase::Restoring => write!(f, "Restoring"),
            LinkPhase::Complete => write!(f, "Complete"),
            LinkPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by hub operations.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A hub matched the scan filter.
    HubFound {
        address: String,
        name: Option<String>,
    },
    HubConnected {
        address: String,
    },
    HubDisconnected {
        address: String,
    },
    PhaseChanged {
        from: LinkPhase,
        to: LinkPhase,
    },
    /// Progress after an acknowledged chunk or block.
    Progress {
        phase: LinkPhase,
        current: u64,
        total: u64,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    /// A chunk checksum mismatch caused a resend.
    Retry {
        offset: u32,
        attempt: u32,
    },
    Error {
        message: String,
    },
    /// Frame written to or received from a transport.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    Complete,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Hub
    Rx, // Hub -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving link events.
pub trait LinkObserver: Send + Sync {
    fn on_event(&self, event: &LinkEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl LinkObserver for NullObserver {
    fn on_event(&self, _event: &LinkEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl LinkObserver for TracingObserver {
    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::HubFound { address, name } => {
                tracing::info!(address = %address, name = ?name, "Hub found");
            }
            LinkEvent::HubConnected { address } => {
                tracing::info!(address = %address, "Hub connected");
            }
            LinkEvent::HubDisconnected { address } => {
                tracing::info!(address = %address, "Hub disconnected");
            }
            LinkEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            LinkEvent::Progress {
                phase,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(phase = %phase, progress = %format!("{}%", pct), "Progress");
            }
            LinkEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            LinkEvent::Retry { offset, attempt } => {
                tracing::warn!(offset, attempt, "Checksum mismatch, resending chunk");
            }
            LinkEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            LinkEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "Frame");
            }
            LinkEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Observer that records every event for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<LinkEvent>>,
    }

    impl LinkObserver for RecordingObserver {
        fn on_event(&self, event: &LinkEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event.clone());
            }
        }
    }

    impl RecordingObserver {
        pub fn progress(&self) -> Vec<(u64, u64)> {
            self.events
                .lock()
                .map(|events| {
                    events
                        .iter()
                        .filter_map(|e| match e {
                            LinkEvent::Progress { current, total, .. } => Some((*current, *total)),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        }
    }
}
