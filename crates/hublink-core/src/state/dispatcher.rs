//! Inbound frame dispatcher.
//!
//! One task per connection decodes frames in wire order and routes them:
//! status reports to the status watch, stdout to subscribers, chunk acks to
//! the active transfer. Subscriber overflow spills into a bounded pending
//! buffer before the dispatcher applies backpressure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::machine::{ConnectionState, StateHandle};
use crate::protocol::{Event, StatusFlags};

/// Events delivered to a connection's subscriber, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// Bytes the program wrote to stdout.
    Output(Vec<u8>),
    Status(StatusFlags),
    ProgramStarted,
    ProgramCompleted,
    Error(String),
    /// Always the last event of a connection.
    Disconnected,
}

/// Acknowledgement of one transferred chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub offset: u32,
    pub checksum: u32,
}

pub(crate) type AckSlot = Arc<Mutex<Option<mpsc::Sender<AckFrame>>>>;
pub(crate) type PendingOutput = Arc<Mutex<VecDeque<HubEvent>>>;

pub(crate) enum Control {
    /// Process every frame already received, flush pending output, then reply.
    Drain(oneshot::Sender<()>),
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct Dispatcher {
    pub state: StateHandle,
    pub status: watch::Sender<StatusFlags>,
    pub events: mpsc::Sender<HubEvent>,
    pub pending: PendingOutput,
    pub pending_capacity: usize,
    pub acks: AckSlot,
    /// A running flag has been seen since the program was started.
    pub armed: bool,
}

impl Dispatcher {
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut control: mpsc::Receiver<Control>,
    ) {
        let mut frames_open = true;
        loop {
            self.flush_ready();
            let has_pending = !lock(&self.pending).is_empty();
            let events = self.events.clone();
            tokio::select! {
                biased;
                ctrl = control.recv() => match ctrl {
                    Some(Control::Drain(done)) => {
                        while let Ok(frame) = frames.try_recv() {
                            self.handle_frame(&frame).await;
                        }
                        self.flush_pending().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                frame = frames.recv(), if frames_open => match frame {
                    Some(frame) => self.handle_frame(&frame).await,
                    None => {
                        frames_open = false;
                        self.link_lost().await;
                    }
                },
                permit = events.reserve(), if has_pending => match permit {
                    Ok(permit) => {
                        if let Some(event) = lock(&self.pending).pop_front() {
                            permit.send(event);
                        }
                    }
                    Err(_) => lock(&self.pending).clear(),
                },
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        let event = match Event::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed frame from hub");
                self.state.fault(format!("protocol error: {}", e));
                self.emit(HubEvent::Error(e.to_string())).await;
                return;
            }
        };
        match event {
            Event::StatusReport(flags) => self.handle_status(flags).await,
            Event::WriteStdout(data) => self.emit(HubEvent::Output(data)).await,
            Event::ChunkAck { offset, checksum } => {
                let sender = lock(&self.acks).clone();
                match sender {
                    Some(sender) => {
                        let _ = sender.send(AckFrame { offset, checksum }).await;
                    }
                    None => debug!(offset, "Ack with no transfer in progress"),
                }
            }
        }
    }

    async fn handle_status(&mut self, flags: StatusFlags) {
        let was_running = self.status.borrow().program_running();
        self.status.send_replace(flags);
        self.emit(HubEvent::Status(flags)).await;

        let running = flags.program_running();
        let state = self.state.get();
        if running && !was_running {
            // Programs may also be started with the hub button.
            if state == ConnectionState::Ready {
                let _ = self.state.goto(ConnectionState::Running);
            }
            if self.state.get() == ConnectionState::Running {
                self.armed = true;
                self.emit(HubEvent::ProgramStarted).await;
            }
        } else if running && state == ConnectionState::Running {
            self.armed = true;
        } else if !running && self.armed && state == ConnectionState::Running {
            self.armed = false;
            let _ = self.state.goto(ConnectionState::Ready);
            self.emit(HubEvent::ProgramCompleted).await;
        }
    }

    async fn link_lost(&mut self) {
        match self.state.get() {
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {}
            _ => {
                warn!("Hub link lost");
                self.state.fault("link lost");
                self.emit(HubEvent::Error("link lost".into())).await;
            }
        }
        // wake a transfer waiting for acks
        lock(&self.acks).take();
    }

    /// Deliver in order: straight to the channel when nothing is spilled,
    /// otherwise behind the spilled events.
    async fn emit(&mut self, event: HubEvent) {
        let overflow = {
            let mut pending = lock(&self.pending);
            let event = if pending.is_empty() {
                match self.events.try_send(event) {
                    Ok(()) => return,
                    Err(mpsc::error::TrySendError::Full(event)) => event,
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            } else {
                event
            };
            if pending.len() < self.pending_capacity {
                pending.push_back(event);
                return;
            }
            event
        };
        self.make_room().await;
        lock(&self.pending).push_back(overflow);
    }

    /// Move spilled events into the channel while it has room.
    fn flush_ready(&mut self) {
        let mut pending = lock(&self.pending);
        while let Some(event) = pending.pop_front() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    pending.push_front(event);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    pending.clear();
                    break;
                }
            }
        }
    }

    /// Wait until the subscriber takes the oldest spilled event.
    async fn make_room(&mut self) {
        match self.events.reserve().await {
            Ok(permit) => {
                if let Some(oldest) = lock(&self.pending).pop_front() {
                    permit.send(oldest);
                }
            }
            Err(_) => lock(&self.pending).clear(),
        }
    }

    async fn flush_pending(&mut self) {
        while !lock(&self.pending).is_empty() {
            self.make_room().await;
        }
    }
}
