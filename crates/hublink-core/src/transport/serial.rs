//! tokio-serial transport carrying SLIP-framed application frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, instrument, warn};

use super::traits::{Attribute, LinkParams, Transport, TransportError, check_frame};
use crate::discovery::HubDescriptor;
use crate::protocol::slip::{self, SlipDecoder};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
const NOTIFY_CAPACITY: usize = 256;
const READ_BUFFER: usize = 256;

/// Serial transport. The descriptor address is the port path.
pub struct SerialTransport {
    baud_rate: u32,
    link: LinkParams,
    attributes: HashMap<Attribute, Vec<u8>>,
    writer: Option<Mutex<WriteHalf<SerialStream>>>,
    reader: Option<ReadHalf<SerialStream>>,
    closed: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            link: LinkParams {
                max_write_size: slip::MAX_SLIP_FRAME_SIZE / 2,
                // no hardware handshake on the UART
                min_write_interval: Some(Duration::from_millis(2)),
            },
            attributes: HashMap::new(),
            writer: None,
            reader: None,
            closed: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// Serial hubs have no GATT table; identity values are supplied up front.
    pub fn with_attribute(mut self, attribute: Attribute, value: &[u8]) -> Self {
        self.attributes.insert(attribute, value.to_vec());
        self
    }
}

impl Transport for SerialTransport {
    #[instrument(skip(self, hub), fields(port = %hub.address))]
    async fn open(&mut self, hub: &HubDescriptor) -> Result<LinkParams, TransportError> {
        let stream = tokio_serial::new(&hub.address, self.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let (reader, writer) = tokio::io::split(stream);
        self.reader = Some(reader);
        self.writer = Some(Mutex::new(writer));
        self.closed.store(false, Ordering::SeqCst);
        info!(baud = self.baud_rate, "Serial port open");
        Ok(self.link)
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        check_frame(frame, &self.link)?;
        let writer = self.writer.as_ref().ok_or(TransportError::NotOpen)?;
        let mut writer = writer.lock().await;
        writer.write_all(&slip::encode(frame)).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut reader = self.reader.take().ok_or(TransportError::NotOpen)?;
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        let closed = self.closed.clone();
        self.pump = Some(tokio::spawn(async move {
            let mut decoder = SlipDecoder::new();
            let mut buf = [0u8; READ_BUFFER];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "Serial read ended");
                        break;
                    }
                };
                for frame in decoder.feed_all(&buf[..n]) {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    match frame {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed SLIP frame"),
                    }
                }
            }
        }));
        Ok(rx)
    }

    async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
        self.attributes
            .get(&attribute)
            .cloned()
            .ok_or(TransportError::AttributeUnavailable(attribute))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.reader = None;
        self.writer = None;
        Ok(())
    }

    fn link(&self) -> LinkParams {
        self.link
    }

    fn is_open(&self) -> bool {
        self.writer.is_some() && !self.closed.load(Ordering::SeqCst)
    }
}

/// Serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    Ok(tokio_serial::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}
