//! Chunked transfer engine.
//!
//! Moves a payload to the hub in chunks of at most `chunk_size` bytes. Each
//! chunk is checksummed with CRC32; a mismatching echo resends the same chunk
//! up to `max_retries` times. Progress is reported only after a chunk is
//! acknowledged. When the medium asks for it, writes are spaced by
//! `min_write_interval`, which is the only backpressure available without a
//! hardware handshake.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::events::{LinkEvent, LinkObserver, LinkPhase};
use crate::protocol::CodecError;
use crate::protocol::checksum::crc32;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Chunk at offset {offset} failed after {attempts} attempts")]
    Failed { offset: u32, attempts: u32 },

    #[error("Acknowledged offset {actual}, expected {expected}")]
    WrongOffset { expected: u32, actual: u32 },

    #[error("Transfer ended after {acknowledged} of {total} bytes")]
    Short { acknowledged: usize, total: usize },

    #[error("No acknowledgement for offset {offset} within {timeout_ms}ms")]
    Timeout { offset: u32, timeout_ms: u64 },

    #[error("Chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("Acknowledgement stream closed")]
    AckStreamClosed,

    #[error("Payload of {len} bytes exceeds the addressable range")]
    TooLarge { len: usize },

    #[error("Sink rejected chunk: {0}")]
    Rejected(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The receiver's answer to one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub offset: u32,
    /// CRC32 the receiver computed, when it echoes one.
    pub checksum: Option<u32>,
}

/// Destination for chunks: the application download or a bootloader.
pub trait ChunkSink: Send {
    /// Send one chunk and wait for its acknowledgement. `last` marks the final chunk.
    fn send_chunk(
        &mut self,
        offset: u32,
        chunk: &[u8],
        last: bool,
    ) -> impl Future<Output = Result<ChunkAck, TransferError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub ack_timeout: Duration,
    pub min_write_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    pub bytes: usize,
    pub chunks_sent: u32,
    pub retries: u32,
}

/// Split `payload` into `(offset, chunk)` pairs of at most `size` bytes.
pub fn chunks(payload: &[u8], size: usize) -> impl Iterator<Item = (u32, &[u8])> {
    payload
        .chunks(size.max(1))
        .scan(0u32, |offset, chunk| {
            let at = *offset;
            *offset += chunk.len() as u32;
            Some((at, chunk))
        })
}

/// State of one in-flight transfer.
#[derive(Debug)]
pub struct TransferSession {
    total: usize,
    offset: usize,
    config: TransferConfig,
    last_checksum: Option<u32>,
    retries: u32,
    chunks_sent: u32,
}

impl TransferSession {
    pub fn new(total: usize, config: TransferConfig) -> Result<Self, TransferError> {
        if config.chunk_size == 0 {
            return Err(TransferError::ZeroChunkSize);
        }
        if u32::try_from(total).is_err() {
            return Err(TransferError::TooLarge { len: total });
        }
        Ok(Self {
            total,
            offset: 0,
            config,
            last_checksum: None,
            retries: 0,
            chunks_sent: 0,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// CRC32 of the most recently acknowledged chunk.
    pub fn last_checksum(&self) -> Option<u32> {
        self.last_checksum
    }

    #[instrument(skip_all, fields(total = self.total, chunk_size = self.config.chunk_size))]
    pub async fn run<S: ChunkSink>(
        &mut self,
        payload: &[u8],
        sink: &mut S,
        observer: &dyn LinkObserver,
        phase: LinkPhase,
    ) -> Result<TransferReport, TransferError> {
        if payload.len() != self.total {
            return Err(TransferError::Short {
                acknowledged: payload.len(),
                total: self.total,
            });
        }
        let mut last_write: Option<Instant> = None;
        let count = payload.len().div_ceil(self.config.chunk_size);

        for (index, (offset, chunk)) in chunks(payload, self.config.chunk_size).enumerate() {
            let expected = crc32(chunk);
            let last = index + 1 == count;
            let mut attempts = 0u32;
            loop {
                if let (Some(interval), Some(at)) = (self.config.min_write_interval, last_write) {
                    tokio::time::sleep_until(at + interval).await;
                }
                last_write = Some(Instant::now());
                attempts += 1;
                self.chunks_sent += 1;

                let ack = tokio::time::timeout(
                    self.config.ack_timeout,
                    sink.send_chunk(offset, chunk, last),
                )
                .await
                .map_err(|_| TransferError::Timeout {
                    offset,
                    timeout_ms: self.config.ack_timeout.as_millis() as u64,
                })??;

                if ack.offset != offset {
                    return Err(TransferError::WrongOffset {
                        expected: offset,
                        actual: ack.offset,
                    });
                }
                match ack.checksum {
                    Some(actual) if actual != expected => {
                        debug!(
                            offset,
                            expected = %format!("0x{:08X}", expected),
                            actual = %format!("0x{:08X}", actual),
                            "Checksum mismatch"
                        );
                        if attempts > self.config.max_retries {
                            return Err(TransferError::Failed { offset, attempts });
                        }
                        self.retries += 1;
                        observer.on_event(&LinkEvent::Retry {
                            offset,
                            attempt: attempts,
                        });
                    }
                    _ => break,
                }
            }
            self.offset = offset as usize + chunk.len();
            self.last_checksum = Some(expected);
            observer.on_event(&LinkEvent::Progress {
                phase,
                current: self.offset as u64,
                total: self.total as u64,
            });
        }

        if self.offset != self.total {
            return Err(TransferError::Short {
                acknowledged: self.offset,
                total: self.total,
            });
        }
        Ok(TransferReport {
            bytes: self.offset,
            chunks_sent: self.chunks_sent,
            retries: self.retries,
        })
    }
}
