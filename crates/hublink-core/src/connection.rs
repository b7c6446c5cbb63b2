//! Live session with one hub.
//!
//! A [`Connection`] owns the transport, the negotiated [`Capabilities`] and
//! the dispatcher task that routes inbound frames. It walks the
//! [`ConnectionState`] machine: connect, negotiate, then downloads and
//! program runs from `Ready`, and finally a disconnect that drains every
//! buffered notification before the transport is closed.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::HubConfig;
use crate::discovery::HubDescriptor;
use crate::error::HubError;
use crate::events::{LinkEvent, LinkObserver, LinkPhase, NullObserver};
use crate::protocol::constants::CAPABILITIES_PROTOCOL_VERSION;
use crate::protocol::frame::parse_protocol_version;
use crate::protocol::{Capabilities, Command, PnpId, StatusFlags};
use crate::state::dispatcher::{AckSlot, Control, Dispatcher, PendingOutput, lock};
use crate::state::{AckFrame, ConnectionState, HubEvent, StateHandle};
use crate::transfer::{
    ChunkAck, ChunkSink, TransferConfig, TransferError, TransferReport, TransferSession,
};
use crate::transport::{Attribute, LinkParams, Transport, TransportError};

const ACK_CAPACITY: usize = 4;

/// Process-wide set of hub addresses with a live connection.
#[derive(Debug, Clone, Default)]
pub struct HubRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static HubRegistry {
        static REGISTRY: OnceLock<HubRegistry> = OnceLock::new();
        REGISTRY.get_or_init(HubRegistry::new)
    }

    /// Claim `address`. Fails when another connection holds it.
    pub fn acquire(&self, address: &str) -> Result<Lease, HubError> {
        if !lock(&self.held).insert(address.to_string()) {
            return Err(HubError::AlreadyConnected(address.to_string()));
        }
        Ok(Lease {
            registry: self.clone(),
            address: address.to_string(),
        })
    }

    pub fn is_held(&self, address: &str) -> bool {
        lock(&self.held).contains(address)
    }
}

/// Exclusive claim on a hub address, released on drop.
#[derive(Debug)]
pub struct Lease {
    registry: HubRegistry,
    address: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        lock(&self.registry.held).remove(&self.address);
    }
}

/// Sends program chunks as `WriteUserRam` commands and waits for the hub's echo.
struct ProgramSink<'a, T: Transport> {
    transport: &'a T,
    acks: mpsc::Receiver<AckFrame>,
    max_write_size: usize,
}

impl<T: Transport> ChunkSink for ProgramSink<'_, T> {
    async fn send_chunk(
        &mut self,
        offset: u32,
        chunk: &[u8],
        _last: bool,
    ) -> Result<ChunkAck, TransferError> {
        // acks for an abandoned attempt
        while self.acks.try_recv().is_ok() {}

        let frame = Command::WriteUserRam {
            offset,
            payload: chunk.to_vec(),
        }
        .encode(self.max_write_size)?;
        self.transport.write(&frame).await?;

        let ack = self.acks.recv().await.ok_or(TransferError::AckStreamClosed)?;
        Ok(ChunkAck {
            offset: ack.offset,
            checksum: Some(ack.checksum),
        })
    }
}

/// A session with one hub over transport `T`.
pub struct Connection<T: Transport> {
    hub: HubDescriptor,
    config: HubConfig,
    transport: T,
    state: StateHandle,
    registry: HubRegistry,
    lease: Option<Lease>,
    link: LinkParams,
    capabilities: Option<Capabilities>,
    firmware_version: Option<String>,
    status: watch::Receiver<StatusFlags>,
    events_tx: mpsc::Sender<HubEvent>,
    events_rx: Option<mpsc::Receiver<HubEvent>>,
    pending: PendingOutput,
    acks: AckSlot,
    control: Option<mpsc::Sender<Control>>,
    dispatcher: Option<JoinHandle<()>>,
    last_error: Option<String>,
    observer: Arc<dyn LinkObserver>,
}

impl<T: Transport> Connection<T> {
    /// Claim `hub` in the process-wide registry.
    pub fn new(hub: HubDescriptor, transport: T, config: HubConfig) -> Result<Self, HubError> {
        Self::with_registry(hub, transport, config, HubRegistry::global())
    }

    pub fn with_registry(
        hub: HubDescriptor,
        transport: T,
        config: HubConfig,
        registry: &HubRegistry,
    ) -> Result<Self, HubError> {
        let lease = registry.acquire(&hub.address)?;
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (_, status) = watch::channel(StatusFlags::default());
        Ok(Self {
            hub,
            transport,
            state: StateHandle::new(),
            registry: registry.clone(),
            lease: Some(lease),
            link: LinkParams::default(),
            capabilities: None,
            firmware_version: None,
            status,
            events_tx,
            events_rx: Some(events_rx),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            acks: Arc::new(Mutex::new(None)),
            control: None,
            dispatcher: None,
            last_error: None,
            observer: Arc::new(NullObserver),
            config,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn hub(&self) -> &HubDescriptor {
        &self.hub
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Observable state stream.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Take the subscriber end of the event channel.
    ///
    /// Must be called before [`connect`](Self::connect); a connection whose
    /// events were never taken discards them instead of stalling.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<HubEvent>> {
        self.events_rx.take()
    }

    /// Last status report from the hub.
    pub fn status(&self) -> StatusFlags {
        *self.status.borrow()
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    pub fn link(&self) -> LinkParams {
        self.link
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Largest frame a command may occupy: transport and hub limits combined.
    pub fn max_write_size(&self) -> usize {
        match &self.capabilities {
            Some(caps) => self.link.max_write_size.min(caps.max_write_size),
            None => self.link.max_write_size,
        }
    }

    /// Open the transport and start dispatching inbound frames.
    ///
    /// Leaves the connection in `Negotiating`. An unreachable hub returns
    /// the connection to `Disconnected`.
    #[instrument(skip(self), fields(address = %self.hub.address))]
    pub async fn connect(&mut self) -> Result<(), HubError> {
        let current = self.state.get();
        if current != ConnectionState::Disconnected {
            return Err(HubError::InvalidState {
                operation: "connect",
                state: current.to_string(),
            });
        }
        if self.lease.is_none() {
            self.lease = Some(self.registry.acquire(&self.hub.address)?);
        }
        self.goto(ConnectionState::Connecting)?;
        self.last_error = None;

        let timeout = self.config.connect_timeout();
        let link = match tokio::time::timeout(timeout, self.transport.open(&self.hub)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(self.abort_connect(e.to_string()).await),
            Err(_) => {
                let reason = format!("timed out after {}ms", timeout.as_millis());
                return Err(self.abort_connect(reason).await);
            }
        };
        self.link = link;

        let frames = match self.transport.subscribe().await {
            Ok(frames) => frames,
            Err(e) => return Err(self.abort_connect(e.to_string()).await),
        };
        self.spawn_dispatcher(frames);
        self.goto(ConnectionState::Negotiating)?;

        info!(max_write_size = link.max_write_size, "Transport open");
        self.observer.on_event(&LinkEvent::HubConnected {
            address: self.hub.address.clone(),
        });
        Ok(())
    }

    /// Read protocol version, identity and capabilities. `Negotiating` to `Ready`.
    #[instrument(skip(self), fields(address = %self.hub.address))]
    pub async fn negotiate(&mut self) -> Result<Capabilities, HubError> {
        self.require(&[ConnectionState::Negotiating], "negotiate")?;
        match self.negotiate_inner().await {
            Ok(caps) => {
                self.capabilities = Some(caps.clone());
                self.goto(ConnectionState::Ready)?;
                Ok(caps)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn negotiate_inner(&mut self) -> Result<Capabilities, HubError> {
        let raw = self.read_attribute(Attribute::ProtocolVersion).await?;
        let version = parse_protocol_version(&raw)?;
        let (min, max) = (&self.config.min_protocol, &self.config.max_protocol);
        if version < *min || version >= *max {
            return Err(HubError::IncompatibleProtocol {
                found: version,
                min: min.clone(),
                max: max.clone(),
            });
        }
        debug!(%version, "Protocol version accepted");
        self.hub.protocol_version = Some(version.clone());

        match self.read_attribute(Attribute::PnpId).await {
            Ok(raw) => {
                let pnp = PnpId::decode(&raw)?;
                self.hub.hub_kind = pnp.hub_kind;
                self.hub.revision = Some(pnp.revision);
            }
            Err(HubError::Transport(TransportError::AttributeUnavailable(_))) => {
                debug!("No PnP id, keeping advertised hub kind");
            }
            Err(e) => return Err(e),
        }

        match self.read_attribute(Attribute::FirmwareVersion).await {
            Ok(raw) => {
                self.firmware_version = Some(String::from_utf8_lossy(&raw).trim().to_string());
            }
            Err(HubError::Transport(TransportError::AttributeUnavailable(_))) => {}
            Err(e) => return Err(e),
        }

        let caps = if version >= CAPABILITIES_PROTOCOL_VERSION {
            let raw = self.read_attribute(Attribute::HubCapabilities).await?;
            Capabilities::decode(version, &raw)?
        } else {
            Capabilities::legacy(version, self.link.max_write_size)
        };
        info!(
            hub_kind = %self.hub.hub_kind,
            max_write_size = caps.max_write_size,
            features = caps.features.0,
            "Negotiated capabilities"
        );
        Ok(caps)
    }

    /// Connect and negotiate in one step.
    pub async fn establish(&mut self) -> Result<Capabilities, HubError> {
        self.connect().await?;
        self.negotiate().await
    }

    /// Transfer a compiled program into the hub's user RAM.
    #[instrument(skip(self, program), fields(address = %self.hub.address, size = program.len()))]
    pub async fn download(&mut self, program: &[u8]) -> Result<TransferReport, HubError> {
        match self.state.get() {
            ConnectionState::Ready => {}
            ConnectionState::Downloading => return Err(HubError::TransferInProgress),
            other => {
                return Err(HubError::InvalidState {
                    operation: "download",
                    state: other.to_string(),
                });
            }
        }
        if let Some(max) = self.capabilities.as_ref().and_then(|c| c.max_program_size)
            && program.len() > max
        {
            return Err(HubError::SizeMismatch {
                image: program.len(),
                region: max,
            });
        }

        self.goto(ConnectionState::Downloading)?;
        let result = self.download_inner(program).await;
        lock(&self.acks).take();
        match result {
            Ok(report) => {
                self.goto(ConnectionState::Ready)?;
                info!(
                    bytes = report.bytes,
                    retries = report.retries,
                    "Program downloaded"
                );
                Ok(report)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn download_inner(&mut self, program: &[u8]) -> Result<TransferReport, HubError> {
        let max_write_size = self.max_write_size();
        let chunk_size = max_write_size.saturating_sub(Command::WRITE_USER_RAM_HEADER);
        let transfer = TransferConfig {
            chunk_size,
            max_retries: self.config.max_chunk_retries,
            ack_timeout: self.config.ack_timeout(),
            min_write_interval: self.link.min_write_interval,
        };
        let mut session = TransferSession::new(program.len(), transfer)?;

        // A zero size invalidates any previous program while RAM is rewritten.
        self.send(Command::WriteUserProgramMeta { size: 0 }).await?;

        let (tx, rx) = mpsc::channel(ACK_CAPACITY);
        *lock(&self.acks) = Some(tx);
        let mut sink = ProgramSink {
            transport: &self.transport,
            acks: rx,
            max_write_size,
        };
        let report = session
            .run(program, &mut sink, self.observer.as_ref(), LinkPhase::Downloading)
            .await?;

        self.send(Command::WriteUserProgramMeta {
            size: program.len() as u32,
        })
        .await?;
        Ok(report)
    }

    /// Download `program` and start it.
    pub async fn run(&mut self, program: &[u8]) -> Result<TransferReport, HubError> {
        let report = self.download(program).await?;
        self.start_program().await?;
        Ok(report)
    }

    pub async fn start_program(&mut self) -> Result<(), HubError> {
        self.start(Command::StartUserProgram, "start program").await
    }

    pub async fn start_repl(&mut self) -> Result<(), HubError> {
        self.start(Command::StartRepl, "start REPL").await
    }

    async fn start(&mut self, command: Command, operation: &'static str) -> Result<(), HubError> {
        self.require(&[ConnectionState::Ready], operation)?;
        if let Some(caps) = &self.capabilities
            && !caps.program_commands
        {
            return Err(HubError::UnsupportedHub(format!(
                "protocol {} cannot {}",
                caps.protocol_version, operation
            )));
        }
        // Running before the write, so the hub's first status report finds it.
        self.goto(ConnectionState::Running)?;
        self.observer.on_event(&LinkEvent::PhaseChanged {
            from: LinkPhase::Downloading,
            to: LinkPhase::Running,
        });
        if let Err(e) = self.send(command).await {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Ask the hub to stop the running program and wait for it to report stopped.
    pub async fn stop_program(&mut self) -> Result<(), HubError> {
        self.require(&[ConnectionState::Ready, ConnectionState::Running], "stop program")?;
        if let Err(e) = self.send(Command::StopUserProgram).await {
            return Err(self.fail(e));
        }
        let timeout = self.config.negotiate_timeout();
        let mut states = self.state.subscribe();
        let stopped =
            tokio::time::timeout(timeout, states.wait_for(|s| *s != ConnectionState::Running))
                .await
                .is_ok();
        if !stopped {
            // never saw the program running, so no falling edge will come
            if self.status().program_running() {
                return Err(HubError::Timeout(format!(
                    "hub still running after {}ms",
                    timeout.as_millis()
                )));
            }
            self.goto(ConnectionState::Ready)?;
        }
        Ok(())
    }

    /// Forward bytes to the program's stdin, split to the write size.
    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<(), HubError> {
        self.require(&[ConnectionState::Ready, ConnectionState::Running], "write stdin")?;
        let room = self.max_write_size().saturating_sub(1).max(1);
        for piece in data.chunks(room) {
            if let Err(e) = self
                .send(Command::WriteStdin {
                    payload: piece.to_vec(),
                })
                .await
            {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    /// Reboot the hub into its firmware update mode and disconnect.
    pub async fn reboot_to_bootloader(&mut self) -> Result<(), HubError> {
        self.require(&[ConnectionState::Ready], "reboot to bootloader")?;
        self.observer.on_event(&LinkEvent::PhaseChanged {
            from: LinkPhase::Running,
            to: LinkPhase::RebootingToBootloader,
        });
        // The hub drops the link right after this command.
        let _ = self.goto(ConnectionState::Disconnecting);
        if let Err(e) = self.send(Command::RebootToUpdateMode).await {
            warn!(error = %e, "Reboot command not confirmed");
        }
        self.disconnect().await
    }

    /// Tear down the session. Accepted in every state.
    ///
    /// Every notification received before this call is delivered to the
    /// subscriber before the transport closes, bounded by the disconnect
    /// timeout. [`HubEvent::Disconnected`] is the last event published.
    #[instrument(skip(self), fields(address = %self.hub.address))]
    pub async fn disconnect(&mut self) -> Result<(), HubError> {
        let current = self.state.get();
        if current == ConnectionState::Disconnected {
            self.lease.take();
            return Ok(());
        }
        if !current.is_faulted() {
            let _ = self.state.goto(ConnectionState::Disconnecting);
        }
        let deadline = Instant::now() + self.config.disconnect_timeout();

        if let Some(control) = self.control.take() {
            let (done, drained) = oneshot::channel();
            if control.send(Control::Drain(done)).await.is_ok()
                && tokio::time::timeout_at(deadline, drained).await.is_err()
            {
                warn!("Timed out draining hub output");
            }
        }
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
        lock(&self.acks).take();

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing transport");
        }

        let leftover: Vec<HubEvent> = lock(&self.pending).drain(..).collect();
        for event in leftover.into_iter().chain(std::iter::once(HubEvent::Disconnected)) {
            if tokio::time::timeout_at(deadline, self.events_tx.send(event))
                .await
                .is_err()
            {
                warn!("Subscriber stalled during disconnect");
                break;
            }
        }

        let _ = self.state.goto(ConnectionState::Disconnected);
        self.lease.take();
        self.observer.on_event(&LinkEvent::HubDisconnected {
            address: self.hub.address.clone(),
        });
        Ok(())
    }

    fn spawn_dispatcher(&mut self, frames: mpsc::Receiver<Vec<u8>>) {
        let (status_tx, status_rx) = watch::channel(StatusFlags::default());
        self.status = status_rx;
        // nobody subscribed: closing the channel makes the dispatcher discard
        if let Some(rx) = self.events_rx.take() {
            debug!("No event subscriber, hub events are discarded");
            drop(rx);
        }
        let (control_tx, control_rx) = mpsc::channel(1);
        self.control = Some(control_tx);
        let dispatcher = Dispatcher {
            state: self.state.clone(),
            status: status_tx,
            events: self.events_tx.clone(),
            pending: self.pending.clone(),
            pending_capacity: self.config.pending_output_capacity,
            acks: self.acks.clone(),
            armed: false,
        };
        self.dispatcher = Some(tokio::spawn(dispatcher.run(frames, control_rx)));
    }

    async fn abort_connect(&mut self, reason: String) -> HubError {
        warn!(%reason, "Connect failed");
        let _ = self.transport.close().await;
        let _ = self.state.goto(ConnectionState::Disconnected);
        self.lease.take();
        self.last_error = Some(reason.clone());
        HubError::Connect {
            address: self.hub.address.clone(),
            reason,
        }
    }

    async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, HubError> {
        let timeout = self.config.negotiate_timeout();
        match tokio::time::timeout(timeout, self.transport.read_attribute(attribute)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HubError::Timeout(format!(
                "reading {:?} took longer than {}ms",
                attribute,
                timeout.as_millis()
            ))),
        }
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        let frame = command.encode(self.max_write_size())?;
        self.transport.write(&frame).await?;
        Ok(())
    }

    /// Record `err`, move to `Faulted` and tell the subscriber.
    fn fail(&mut self, err: HubError) -> HubError {
        let reason = err.to_string();
        warn!(error = %reason, "Connection faulted");
        self.last_error = Some(reason.clone());
        if self.state.fault(reason.clone()) {
            self.publish(HubEvent::Error(reason.clone()));
            self.observer.on_event(&LinkEvent::Error { message: reason });
        }
        err
    }

    /// Queue behind any spilled output so wire order is kept.
    fn publish(&self, event: HubEvent) {
        let mut pending = lock(&self.pending);
        if pending.is_empty() {
            match self.events_tx.try_send(event) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(event)) => pending.push_back(event),
            }
        } else {
            pending.push_back(event);
        }
    }

    fn require(
        &self,
        allowed: &[ConnectionState],
        operation: &'static str,
    ) -> Result<(), HubError> {
        let current = self.state.get();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(HubError::InvalidState {
                operation,
                state: current.to_string(),
            })
        }
    }

    fn goto(&self, next: ConnectionState) -> Result<(), HubError> {
        let target = next.to_string();
        self.state.goto(next).map_err(|current| HubError::InvalidState {
            operation: "change state",
            state: format!("{} (wanted {})", current, target),
        })
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::testing::RecordingObserver;
    use crate::protocol::Event;
    use crate::protocol::checksum::crc32;
    use crate::transport::MockTransport;

    fn hub(address: &str) -> HubDescriptor {
        HubDescriptor::mock(address)
    }

    fn connection(address: &str, mock: &MockTransport) -> Connection<MockTransport> {
        Connection::with_registry(
            hub(address),
            mock.clone(),
            HubConfig::default(),
            &HubRegistry::new(),
        )
        .unwrap()
    }

    async fn next_until_disconnected(rx: &mut mpsc::Receiver<HubEvent>) -> Vec<HubEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = event == HubEvent::Disconnected;
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_connect_negotiate_reaches_ready() {
        let mock = MockTransport::new("1.3.0");
        let mut conn = connection("hub-a", &mock);
        let caps = conn.establish().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(caps.max_write_size, 64);
        assert_eq!(caps.max_program_size, Some(32768));
        assert_eq!(conn.hub().protocol_version, Some(semver::Version::new(1, 3, 0)));
        assert_eq!(conn.firmware_version(), Some("3.3.0"));
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_old_protocol_is_incompatible() {
        let mock = MockTransport::new("0.9.0");
        let mut conn = connection("hub-b", &mock);
        let mut states = conn.watch_state();
        conn.connect().await.unwrap();
        let err = conn.negotiate().await.unwrap_err();

        assert!(matches!(err, HubError::IncompatibleProtocol { .. }));
        assert!(!err.is_retryable());
        assert!(conn.state().is_faulted());
        assert!(*states.borrow_and_update() != ConnectionState::Ready);
        assert!(matches!(
            conn.download(b"x").await,
            Err(HubError::InvalidState { .. })
        ));
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_legacy_protocol_skips_capabilities() {
        let mock = MockTransport::new("1.1.0");
        mock.remove_attribute(Attribute::HubCapabilities);
        let mut conn = connection("hub-c", &mock);
        let caps = conn.establish().await.unwrap();
        assert!(!caps.program_commands);
        assert_eq!(caps.max_program_size, None);
        assert!(matches!(
            conn.start_program().await,
            Err(HubError::UnsupportedHub(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_hub_returns_to_disconnected() {
        let mock = MockTransport::new("1.2.0").unreachable(Duration::from_secs(60));
        let registry = HubRegistry::new();
        let mut conn = Connection::with_registry(
            hub("hub-d"),
            mock,
            HubConfig::default(),
            &registry,
        )
        .unwrap();
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, HubError::Connect { .. }));
        assert!(err.is_retryable());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!registry.is_held("hub-d"));
    }

    #[test]
    fn test_second_connection_to_same_address_rejected() {
        let registry = HubRegistry::new();
        let mock = MockTransport::new("1.2.0");
        let first =
            Connection::with_registry(hub("hub-e"), mock.clone(), HubConfig::default(), &registry)
                .unwrap();
        let second =
            Connection::with_registry(hub("hub-e"), mock.clone(), HubConfig::default(), &registry);
        assert!(matches!(second, Err(HubError::AlreadyConnected(_))));

        let other =
            Connection::with_registry(hub("hub-f"), mock.clone(), HubConfig::default(), &registry);
        assert!(other.is_ok());

        drop(first);
        assert!(
            Connection::with_registry(hub("hub-e"), mock, HubConfig::default(), &registry).is_ok()
        );
    }

    #[tokio::test]
    async fn test_download_writes_program_and_meta() {
        let mock = MockTransport::new("1.2.0");
        mock.corrupt_ack_once(59);
        let observer = Arc::new(RecordingObserver::default());
        let mut conn = connection("hub-g", &mock).with_observer(observer.clone());
        conn.establish().await.unwrap();

        let program: Vec<u8> = (0..200u32).map(|i| (i * 7) as u8).collect();
        let report = conn.download(&program).await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(mock.ram(), program);
        assert_eq!(report.bytes, 200);
        assert_eq!(report.retries, 1);

        let writes = mock.writes();
        assert_eq!(
            Command::decode(&writes[0]).unwrap(),
            Command::WriteUserProgramMeta { size: 0 }
        );
        assert_eq!(
            Command::decode(writes.last().unwrap()).unwrap(),
            Command::WriteUserProgramMeta { size: 200 }
        );
        assert!(writes.iter().all(|w| w.len() <= 64));
        assert_eq!(observer.progress().last(), Some(&(200, 200)));
    }

    #[tokio::test]
    async fn test_program_larger_than_hub_limit_rejected() {
        let mock = MockTransport::new("1.2.0");
        let mut conn = connection("hub-h", &mock);
        conn.establish().await.unwrap();
        let err = conn.download(&vec![0u8; 40_000]).await.unwrap_err();
        assert!(matches!(err, HubError::SizeMismatch { image: 40_000, region: 32768 }));
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_transfer_rejected_while_active() {
        let mock = MockTransport::new("1.2.0");
        mock.drop_acks();
        let mut conn = connection("hub-i", &mock);
        conn.establish().await.unwrap();

        let first =
            tokio::time::timeout(Duration::from_millis(10), conn.download(&[1u8; 100])).await;
        assert!(first.is_err());
        assert_eq!(conn.state(), ConnectionState::Downloading);

        assert!(matches!(
            conn.download(&[2u8; 10]).await,
            Err(HubError::TransferInProgress)
        ));
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_faults_connection() {
        let mock = MockTransport::new("1.2.0");
        mock.drop_acks();
        let mut conn = connection("hub-j", &mock);
        let mut events = conn.take_events().unwrap();
        conn.establish().await.unwrap();

        let err = conn.download(&[1u8; 10]).await.unwrap_err();
        assert!(matches!(err, HubError::Timeout(_)));
        assert!(conn.state().is_faulted());
        assert!(conn.last_error().is_some());
        assert!(matches!(events.recv().await, Some(HubEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_disconnect_delivers_inflight_output_first() {
        let mock = MockTransport::new("1.2.0");
        mock.script_output(&[b"one\r\n", b"two\r\n", b"three\r\n"], false);
        let mut conn = connection("hub-k", &mock);
        let mut events = conn.take_events().unwrap();
        let mut states = conn.watch_state();
        conn.establish().await.unwrap();

        conn.run(b"print('hi')").await.unwrap();
        conn.disconnect().await.unwrap();

        let received = next_until_disconnected(&mut events).await;
        let outputs: Vec<_> = received
            .iter()
            .filter_map(|e| match e {
                HubEvent::Output(data) => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            outputs,
            vec![b"one\r\n".to_vec(), b"two\r\n".to_vec(), b"three\r\n".to_vec()]
        );
        assert_eq!(received.last(), Some(&HubEvent::Disconnected));
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn test_program_completion_returns_to_ready() {
        let mock = MockTransport::new("1.2.0");
        mock.script_output(&[b"done\r\n"], true);
        let mut conn = connection("hub-l", &mock);
        let mut events = conn.take_events().unwrap();
        let mut states = conn.watch_state();
        conn.establish().await.unwrap();

        conn.run(b"pass").await.unwrap();
        states
            .wait_for(|s| *s == ConnectionState::Ready)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let started = seen.iter().position(|e| *e == HubEvent::ProgramStarted);
        let output = seen.iter().position(|e| *e == HubEvent::Output(b"done\r\n".to_vec()));
        let completed = seen.iter().position(|e| *e == HubEvent::ProgramCompleted);
        assert!(started < output && output < completed, "{:?}", seen);
    }

    #[tokio::test]
    async fn test_stop_program_returns_to_ready() {
        let mock = MockTransport::new("1.2.0");
        let mut conn = connection("hub-m", &mock);
        conn.establish().await.unwrap();
        conn.run(b"loop").await.unwrap();
        conn.stop_program().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(!conn.status().program_running());
    }

    #[tokio::test]
    async fn test_write_stdin_splits_to_write_size() {
        let mock = MockTransport::new("1.2.0").with_link(LinkParams {
            max_write_size: 20,
            min_write_interval: None,
        });
        let mut conn = connection("hub-n", &mock);
        conn.establish().await.unwrap();
        mock.clear_writes();

        conn.write_stdin(&[b'a'; 50]).await.unwrap();
        let writes = mock.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.len() <= 20 && w[0] == Command::WRITE_STDIN));
    }

    #[tokio::test]
    async fn test_malformed_frame_faults_connection() {
        let mock = MockTransport::new("1.2.0");
        let mut conn = connection("hub-o", &mock);
        let mut events = conn.take_events().unwrap();
        let mut states = conn.watch_state();
        conn.establish().await.unwrap();

        mock.inject(vec![0x7F, 1, 2]).await;
        states.wait_for(|s| s.is_faulted()).await.unwrap();
        assert!(matches!(events.recv().await, Some(HubEvent::Error(_))));

        let ack = Event::ChunkAck {
            offset: 0,
            checksum: crc32(b""),
        };
        mock.inject(ack.encode()).await;
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reboot_to_bootloader_disconnects() {
        let mock = MockTransport::new("1.2.0");
        let mut conn = connection("hub-p", &mock);
        conn.establish().await.unwrap();
        conn.reboot_to_bootloader().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(mock.writes().iter().any(|w| w[0] == Command::REBOOT_TO_UPDATE_MODE));
    }
}
