//! Transport wrapper that emits packet events.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::traits::{Attribute, LinkParams, Transport, TransportError};
use crate::discovery::HubDescriptor;
use crate::events::{LinkEvent, LinkObserver, PacketDirection};

const PREVIEW_LEN: usize = 32;

/// Reports every frame written and received to an observer.
pub struct ObservedTransport<T: Transport> {
    inner: T,
    observer: Arc<dyn LinkObserver>,
}

impl<T: Transport> ObservedTransport<T> {
    pub fn new(inner: T, observer: Arc<dyn LinkObserver>) -> Self {
        Self { inner, observer }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn packet(direction: PacketDirection, data: &[u8]) -> LinkEvent {
    LinkEvent::Packet {
        direction,
        length: data.len(),
        data: Some(data.iter().take(PREVIEW_LEN).cloned().collect()),
    }
}

impl<T: Transport> Transport for ObservedTransport<T> {
    async fn open(&mut self, hub: &HubDescriptor) -> Result<LinkParams, TransportError> {
        self.inner.open(hub).await
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write(frame).await;
        if res.is_ok() {
            self.observer.on_event(&packet(PacketDirection::Tx, frame));
        }
        res
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut inner_rx = self.inner.subscribe().await?;
        let (tx, rx) = mpsc::channel(inner_rx.max_capacity());
        let observer = self.observer.clone();
        tokio::spawn(async move {
            while let Some(frame) = inner_rx.recv().await {
                observer.on_event(&packet(PacketDirection::Rx, &frame));
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read_attribute(attribute).await;
        if let Ok(data) = &res {
            self.observer.on_event(&packet(PacketDirection::Rx, data));
        }
        res
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn link(&self) -> LinkParams {
        self.inner.link()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingObserver;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn test_observed_reports_tx_and_rx() {
        let observer = Arc::new(RecordingObserver::default());
        let mock = MockTransport::new("1.2.0");
        let mut transport = ObservedTransport::new(mock, observer.clone());
        transport.open(&HubDescriptor::mock("hub")).await.unwrap();
        let mut rx = transport.subscribe().await.unwrap();

        transport.write(&[0x04, 0, 0, 0, 0, 0xAA]).await.unwrap();
        rx.recv().await.unwrap();

        let events = observer.events.lock().unwrap();
        let directions: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Packet { direction, .. } => Some(*direction),
                _ => None,
            })
            .collect();
        assert_eq!(directions, vec![PacketDirection::Tx, PacketDirection::Rx]);
    }
}
