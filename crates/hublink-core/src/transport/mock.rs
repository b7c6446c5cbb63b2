//! Mock transport simulating a hub running Pybricks firmware.
//!
//! Records every written frame, answers attribute reads, acknowledges
//! `WriteUserRam` chunks with their CRC32 and plays scripted program output.
//! Cloning yields another handle onto the same simulated hub.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use super::traits::{Attribute, LinkParams, Transport, TransportError, check_frame};
use crate::discovery::HubDescriptor;
use crate::protocol::checksum::crc32;
use crate::protocol::{Command, Event, HubKind, PnpId, StatusFlags};

const NOTIFY_CAPACITY: usize = 64;

#[derive(Default)]
struct MockState {
    writes: Vec<Vec<u8>>,
    attributes: HashMap<Attribute, Vec<u8>>,
    queued: VecDeque<Vec<u8>>,
    sender: Option<mpsc::Sender<Vec<u8>>>,
    /// Chunk offsets whose next ack carries a wrong checksum.
    corrupt_once: Vec<u32>,
    drop_acks: bool,
    program_output: Vec<Vec<u8>>,
    finish_after_output: bool,
    ram: Vec<u8>,
    program_size: u32,
    opens: u32,
}

/// Mock transport for unit and integration tests.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    link: LinkParams,
    open: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    unreachable: bool,
    open_delay: Option<Duration>,
}

impl MockTransport {
    /// A hub speaking the given protocol version with a capabilities characteristic.
    pub fn new(protocol_version: &str) -> Self {
        let mock = Self {
            state: Arc::new(Mutex::new(MockState::default())),
            link: LinkParams {
                max_write_size: 64,
                min_write_interval: None,
            },
            open: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            unreachable: false,
            open_delay: None,
        };
        let pnp = PnpId {
            bluetooth_vendor: true,
            vendor_id: crate::protocol::constants::LEGO_CID,
            hub_kind: HubKind::TechnicLarge,
            revision: 0,
        };
        let mut caps = Vec::new();
        caps.extend_from_slice(&64u16.to_le_bytes());
        caps.extend_from_slice(&0u32.to_le_bytes());
        caps.extend_from_slice(&32768u32.to_le_bytes());
        {
            let mut state = mock.lock();
            state
                .attributes
                .insert(Attribute::ProtocolVersion, protocol_version.as_bytes().to_vec());
            state.attributes.insert(Attribute::PnpId, pnp.encode());
            state.attributes.insert(Attribute::HubCapabilities, caps);
            state
                .attributes
                .insert(Attribute::FirmwareVersion, b"3.3.0".to_vec());
        }
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_link(mut self, link: LinkParams) -> Self {
        self.link = link;
        self
    }

    /// Simulate a device that never answers the connection attempt.
    pub fn unreachable(mut self, delay: Duration) -> Self {
        self.unreachable = true;
        self.open_delay = Some(delay);
        self
    }

    pub fn set_attribute(&self, attribute: Attribute, value: &[u8]) {
        self.lock().attributes.insert(attribute, value.to_vec());
    }

    pub fn remove_attribute(&self, attribute: Attribute) {
        self.lock().attributes.remove(&attribute);
    }

    /// Next ack for the chunk at `offset` echoes a corrupted checksum.
    pub fn corrupt_ack_once(&self, offset: u32) {
        self.lock().corrupt_once.push(offset);
    }

    /// Stop acknowledging chunks.
    pub fn drop_acks(&self) {
        self.lock().drop_acks = true;
    }

    /// Frames the hub sends as stdout once a program starts.
    pub fn script_output(&self, lines: &[&[u8]], finish: bool) {
        let mut state = self.lock();
        state.program_output = lines
            .iter()
            .map(|l| Event::WriteStdout(l.to_vec()).encode())
            .collect();
        state.finish_after_output = finish;
    }

    /// Deliver a raw frame as if the hub sent it.
    pub async fn inject(&self, frame: Vec<u8>) {
        let sender = {
            let mut state = self.lock();
            match state.sender.clone() {
                Some(sender) => sender,
                None => {
                    state.queued.push_back(frame);
                    return;
                }
            }
        };
        self.deliver(&sender, frame).await;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Program bytes written into simulated user RAM.
    pub fn ram(&self) -> Vec<u8> {
        let state = self.lock();
        state.ram[..state.program_size as usize].to_vec()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn deliver(&self, sender: &mpsc::Sender<Vec<u8>>, frame: Vec<u8>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = sender.send(frame).await;
    }

    fn respond(&self, command: Command) -> Vec<Vec<u8>> {
        let mut state = self.lock();
        match command {
            Command::WriteUserProgramMeta { size } => {
                state.program_size = size;
                if state.ram.len() < size as usize {
                    state.ram.resize(size as usize, 0);
                }
                Vec::new()
            }
            Command::WriteUserRam { offset, payload } => {
                let end = offset as usize + payload.len();
                if state.ram.len() < end {
                    state.ram.resize(end, 0);
                }
                state.ram[offset as usize..end].copy_from_slice(&payload);
                if state.drop_acks {
                    return Vec::new();
                }
                let mut checksum = crc32(&payload);
                if let Some(pos) = state.corrupt_once.iter().position(|&o| o == offset) {
                    state.corrupt_once.remove(pos);
                    checksum ^= 0xFFFF_FFFF;
                }
                vec![Event::ChunkAck { offset, checksum }.encode()]
            }
            Command::StartUserProgram | Command::StartRepl => {
                let mut frames = vec![
                    Event::StatusReport(StatusFlags(StatusFlags::USER_PROGRAM_RUNNING)).encode(),
                ];
                frames.extend(state.program_output.iter().cloned());
                if state.finish_after_output {
                    frames.push(Event::StatusReport(StatusFlags::default()).encode());
                }
                frames
            }
            Command::StopUserProgram => {
                vec![Event::StatusReport(StatusFlags::default()).encode()]
            }
            Command::RebootToUpdateMode | Command::WriteStdin { .. } => Vec::new(),
        }
    }
}

impl Transport for MockTransport {
    async fn open(&mut self, _hub: &HubDescriptor) -> Result<LinkParams, TransportError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable {
            return Err(TransportError::DeviceNotFound("mock hub unreachable".into()));
        }
        self.lock().opens += 1;
        self.closed.store(false, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(self.link)
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        check_frame(frame, &self.link)?;
        self.lock().writes.push(frame.to_vec());

        let replies = match Command::decode(frame) {
            Ok(command) => self.respond(command),
            Err(_) => Vec::new(),
        };
        let sender = self.lock().sender.clone();
        if let Some(sender) = sender {
            for reply in replies {
                self.deliver(&sender, reply).await;
            }
        }
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        let queued: Vec<_> = {
            let mut state = self.lock();
            state.sender = Some(tx.clone());
            state.queued.drain(..).collect()
        };
        for frame in queued {
            self.deliver(&tx, frame).await;
        }
        Ok(rx)
    }

    async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.lock()
            .attributes
            .get(&attribute)
            .cloned()
            .ok_or(TransportError::AttributeUnavailable(attribute))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        self.lock().sender = None;
        Ok(())
    }

    fn link(&self) -> LinkParams {
        self.link
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_write_capture_and_ack() {
        let mut mock = MockTransport::new("1.2.0");
        mock.open(&HubDescriptor::mock("hub")).await.unwrap();
        let mut rx = mock.subscribe().await.unwrap();

        let frame = Command::WriteUserRam {
            offset: 0,
            payload: b"abc".to_vec(),
        }
        .encode(64)
        .unwrap();
        mock.write(&frame).await.unwrap();

        assert_eq!(mock.writes(), vec![frame]);
        let ack = Event::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            ack,
            Event::ChunkAck {
                offset: 0,
                checksum: crc32(b"abc")
            }
        );
    }

    #[tokio::test]
    async fn test_mock_oversized_write_rejected() {
        let mut mock = MockTransport::new("1.2.0");
        mock.open(&HubDescriptor::mock("hub")).await.unwrap();
        assert!(mock.write(&[0u8; 65]).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_no_delivery_after_close() {
        let mut mock = MockTransport::new("1.2.0");
        mock.open(&HubDescriptor::mock("hub")).await.unwrap();
        let mut rx = mock.subscribe().await.unwrap();
        mock.close().await.unwrap();
        mock.inject(vec![0x01, b'x']).await;
        assert!(rx.recv().await.is_none());
        assert!(mock.write(&[0x00]).await.is_err());
    }
}
