use crate::error::TransportError;
use crate::protocol::{InboundEvent, OutboundMessage};
use std::future::Future;
use tokio::sync::mpsc;

/// Outbound half of the channel to the OCR backend.
///
/// Delivery is best-effort: a successful `send` only means the message was
/// handed off. Inbound events travel separately over an
/// `mpsc::UnboundedReceiver<InboundEvent>` given to the orchestrator.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// In-process transport that forwards every outbound message into a channel.
///
/// Used to embed a backend in the same process and to drive the
/// orchestrator from tests.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }
}

/// Creates the inbound event channel shared by a transport and the orchestrator
pub fn inbound_channel() -> (
    mpsc::UnboundedSender<InboundEvent>,
    mpsc::UnboundedReceiver<InboundEvent>,
) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Geometry, JobId};

    #[tokio::test]
    async fn test_channel_transport_forwards() {
        let (transport, mut rx) = ChannelTransport::channel();
        let msg = OutboundMessage::RecognizeRequest {
            job_id: JobId::from("j"),
            region_id: 7,
            engine: "ocrad".to_string(),
            geometry: Geometry::new(0.0, 0.0, 5.0, 5.0),
            scale: 1.0,
        };
        transport.send(msg.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(msg));
    }

    #[tokio::test]
    async fn test_channel_transport_reports_closed() {
        let (transport, rx) = ChannelTransport::channel();
        drop(rx);
        let msg = OutboundMessage::RecognizeRequest {
            job_id: JobId::from("j"),
            region_id: 1,
            engine: "ocrad".to_string(),
            geometry: Geometry::default(),
            scale: 1.0,
        };
        assert!(matches!(transport.send(msg).await, Err(TransportError::Closed)));
    }
}
