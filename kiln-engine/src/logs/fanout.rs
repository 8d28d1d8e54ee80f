// Live log fan-out
// Bounded per-subscriber buffers; a slow subscriber is dropped from the tail
// and handed a resync marker instead of back-pressuring ingest.

use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::mpsc;

use bytes::Bytes;

/// Events delivered to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Chunk { seq: u64, data: Bytes },
    Gap { from: u64, to: u64 },
    /// Stream sealed; no more events follow.
    Sealed,
    /// The subscriber fell behind and was dropped; it should re-read the
    /// archive from this byte offset and re-subscribe.
    Resync { archived_offset: u64 },
}

/// Sender half held by the pipeline.
#[derive(Debug)]
pub struct SubscriberHandle {
    tx: mpsc::Sender<LogEvent>,
    resync: Arc<OnceLock<u64>>,
}

/// Receiver half held by the consumer.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<LogEvent>,
    resync: Arc<OnceLock<u64>>,
    resync_emitted: bool,
}

/// Create a connected handle/subscription pair with the given buffer depth.
pub fn channel(capacity: usize) -> (SubscriberHandle, Subscription) {
    let (tx, rx) = mpsc::channel(capacity);
    let resync = Arc::new(OnceLock::new());
    (
        SubscriberHandle {
            tx,
            resync: Arc::clone(&resync),
        },
        Subscription {
            rx,
            resync,
            resync_emitted: false,
        },
    )
}

impl SubscriberHandle {
    /// Try to deliver; returns false when the subscriber must be dropped
    /// (buffer full or receiver gone). Never blocks.
    pub fn offer(&self, event: LogEvent, archived_offset: u64) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.resync.set(archived_offset);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl Subscription {
    /// Receive the next event. After the channel closes, a pending resync
    /// marker is delivered once, then `None`.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        if let Some(event) = self.rx.recv().await {
            return Some(event);
        }
        self.pending_resync()
    }

    fn pending_resync(&mut self) -> Option<LogEvent> {
        if self.resync_emitted {
            return None;
        }
        self.resync_emitted = true;
        self.resync.get().map(|&offset| LogEvent::Resync {
            archived_offset: offset,
        })
    }
}

impl tokio_stream::Stream for Subscription {
    type Item = LogEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            std::task::Poll::Ready(Some(event)) => std::task::Poll::Ready(Some(event)),
            std::task::Poll::Ready(None) => std::task::Poll::Ready(self.pending_resync()),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_in_order() {
        let (handle, mut sub) = channel(8);
        assert!(handle.offer(
            LogEvent::Chunk {
                seq: 0,
                data: Bytes::from("a")
            },
            0
        ));
        assert!(handle.offer(LogEvent::Sealed, 1));
        drop(handle);

        assert_eq!(
            sub.recv().await,
            Some(LogEvent::Chunk {
                seq: 0,
                data: Bytes::from("a")
            })
        );
        assert_eq!(sub.recv().await, Some(LogEvent::Sealed));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        use tokio_stream::StreamExt;

        let (handle, sub) = channel(8);
        handle.offer(
            LogEvent::Chunk {
                seq: 0,
                data: Bytes::from("a"),
            },
            0,
        );
        handle.offer(LogEvent::Sealed, 1);
        drop(handle);

        let events: Vec<LogEvent> = sub.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], LogEvent::Sealed);
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_resync() {
        let (handle, mut sub) = channel(1);
        assert!(handle.offer(
            LogEvent::Chunk {
                seq: 0,
                data: Bytes::from("a")
            },
            1
        ));
        // Buffer full: the offer fails and pins the resync offset.
        assert!(!handle.offer(
            LogEvent::Chunk {
                seq: 1,
                data: Bytes::from("b")
            },
            2
        ));
        drop(handle);

        // The buffered chunk drains, then the resync marker, then the end.
        assert!(matches!(sub.recv().await, Some(LogEvent::Chunk { seq: 0, .. })));
        assert_eq!(sub.recv().await, Some(LogEvent::Resync { archived_offset: 2 }));
        assert_eq!(sub.recv().await, None);
    }
}
