//! Paced delivery of outbound backend requests.

use crate::error::{OcrError, Result, TransportError};
use crate::metrics;
use crate::protocol::OutboundMessage;
use crate::transport::Transport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Paced FIFO of outbound protocol messages.
///
/// A background task sends one message at a time and waits at least
/// `interval` between the start of two consecutive sends. Failed sends are
/// logged and counted; the queue keeps draining.
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    depth: Arc<AtomicUsize>,
    drain: JoinHandle<()>,
}

impl OutboundQueue {
    /// Spawn the drain task on the current tokio runtime
    pub fn spawn<T: Transport>(transport: Arc<T>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let drain = tokio::spawn(drain(transport, rx, depth.clone(), interval));
        Self { tx, depth, drain }
    }

    /// Append a message to the tail. Fails only if the drain task has stopped.
    pub fn push(&self, message: OutboundMessage) -> Result<()> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(message).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            OcrError::Transport(TransportError::Closed)
        })
    }

    /// Messages pushed but not yet handed to the transport
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

async fn drain<T: Transport>(
    transport: Arc<T>,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    depth: Arc<AtomicUsize>,
    interval: Duration,
) {
    let mut last_send: Option<Instant> = None;

    while let Some(message) = rx.recv().await {
        if let Some(last) = last_send {
            sleep_until(last + interval).await;
        }
        last_send = Some(Instant::now());
        depth.fetch_sub(1, Ordering::Relaxed);

        let kind = message.kind();
        let job_id = message.job_id().clone();
        match transport.send(message).await {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, kind, "Sent outbound message");
                metrics::OUTBOUND_SENT.with_label_values(&[kind]).inc();
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, kind, "Outbound send failed: {}", e);
                metrics::OUTBOUND_SEND_ERRORS.inc();
            }
        }
    }

    tracing::debug!("Outbound queue drained and closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Geometry, JobId};
    use crate::transport::ChannelTransport;
    use std::sync::Mutex;

    fn recognize(region_id: u64) -> OutboundMessage {
        OutboundMessage::RecognizeRequest {
            job_id: JobId::from("job"),
            region_id,
            engine: "ocrad".to_string(),
            geometry: Geometry::new(0.0, 0.0, 10.0, 10.0),
            scale: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_and_pacing() {
        let (transport, mut rx) = ChannelTransport::channel();
        let queue = OutboundQueue::spawn(Arc::new(transport), Duration::from_millis(500));

        for id in 0..3 {
            queue.push(recognize(id)).unwrap();
        }

        let mut arrivals = Vec::new();
        for _ in 0..3 {
            let msg = rx.recv().await.unwrap();
            arrivals.push((msg, Instant::now()));
        }

        let ids: Vec<u64> = arrivals
            .iter()
            .map(|(m, _)| match m {
                OutboundMessage::RecognizeRequest { region_id, .. } => *region_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        for pair in arrivals.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(500));
        }
        assert_eq!(queue.depth(), 0);
    }

    /// Fails every other send
    struct FlakyTransport {
        calls: Mutex<u32>,
        delivered: Mutex<Vec<OutboundMessage>>,
    }

    impl Transport for FlakyTransport {
        async fn send(&self, message: OutboundMessage) -> std::result::Result<(), TransportError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call % 2 == 1 {
                return Err(TransportError::Closed);
            }
            self.delivered.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_errors_do_not_stop_draining() {
        let transport = Arc::new(FlakyTransport {
            calls: Mutex::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let queue = OutboundQueue::spawn(transport.clone(), Duration::from_millis(100));

        for id in 0..4 {
            queue.push(recognize(id)).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*transport.calls.lock().unwrap(), 4);
        assert_eq!(transport.delivered.lock().unwrap().len(), 2);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_push_after_drain_stopped_is_a_transport_error() {
        let (transport, _rx) = ChannelTransport::channel();
        let queue = OutboundQueue::spawn(Arc::new(transport), Duration::from_millis(10));
        queue.drain.abort();
        while !queue.drain.is_finished() {
            tokio::task::yield_now().await;
        }

        let err = queue.push(recognize(1)).unwrap_err();
        assert!(matches!(err, OcrError::Transport(TransportError::Closed)));
        assert_eq!(queue.depth(), 0);
    }
}
