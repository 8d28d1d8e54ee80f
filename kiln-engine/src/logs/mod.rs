// Log pipeline
// Ordered ingest per step, secret masking, live fan-out, and seal/archive of
// terminal streams. Ingest never waits on subscribers.

pub mod fanout;
pub mod mask;
pub mod stream;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ProtocolError;
use crate::model::JobId;

pub use fanout::{LogEvent, Subscription};
pub use mask::MaskSet;
pub use stream::{Appended, StepLog, StoredChunk};

type StreamKey = (JobId, u32);

/// The engine's log pipeline: one ordered stream per (job, step ordinal).
pub struct LogPipeline {
    mask_token: String,
    streams: DashMap<StreamKey, Mutex<StreamState>>,
    /// Secrets registered per job, masked across all its steps.
    masks: DashMap<JobId, MaskSet>,
    subscriber_buffer: usize,
}

struct StreamState {
    log: StepLog,
    subscribers: Vec<fanout::SubscriberHandle>,
}

impl LogPipeline {
    pub fn new(mask_token: impl Into<String>) -> Self {
        Self {
            mask_token: mask_token.into(),
            streams: DashMap::new(),
            masks: DashMap::new(),
            subscriber_buffer: 256,
        }
    }

    /// Register a secret value for a job; every stream of that job masks it
    /// from this point on.
    pub fn register_secret(&self, job: JobId, literal: impl Into<String>) {
        self.masks
            .entry(job)
            .or_insert_with(|| MaskSet::new(self.mask_token.clone()))
            .add(literal);
    }

    /// Append a chunk. Duplicate seqs are idempotent; gaps yield a marker.
    pub fn append(
        &self,
        job: JobId,
        ordinal: u32,
        seq: u64,
        data: Bytes,
    ) -> Result<(), ProtocolError> {
        let data = self.masked(job, data);

        let state = self
            .streams
            .entry((job, ordinal))
            .or_insert_with(|| Mutex::new(StreamState::new()));
        let mut state = state.lock();

        let outcome = state
            .log
            .append(seq, data.clone())
            .map_err(|_| ProtocolError::StreamSealed { job, ordinal })?;

        match outcome {
            Appended::Duplicate => {}
            Appended::Accepted => {
                state.fan_out(LogEvent::Chunk { seq, data });
            }
            Appended::AcceptedWithGap { from, to } => {
                debug!(job = %job, ordinal, from, to, "log gap recorded");
                state.fan_out(LogEvent::Gap { from, to });
                state.fan_out(LogEvent::Chunk { seq, data });
            }
        }
        Ok(())
    }

    /// Subscribe to a live stream. Past chunks are replayed into the new
    /// subscription first, so a fresh subscriber starts from offset zero.
    pub fn subscribe(&self, job: JobId, ordinal: u32) -> Subscription {
        let state = self
            .streams
            .entry((job, ordinal))
            .or_insert_with(|| Mutex::new(StreamState::new()));
        let mut state = state.lock();

        let (handle, subscription) = fanout::channel(self.subscriber_buffer.max(
            // Leave room for the replay plus a margin of live chunks.
            state.log.chunks().len() + 16,
        ));

        let archived = state.log.byte_len();
        for chunk in state.log.chunks() {
            let event = match chunk {
                StoredChunk::Data { seq, data } => LogEvent::Chunk {
                    seq: *seq,
                    data: data.clone(),
                },
                StoredChunk::Gap { from, to } => LogEvent::Gap {
                    from: *from,
                    to: *to,
                },
            };
            if !handle.offer(event, archived) {
                return subscription;
            }
        }
        if state.log.is_sealed() {
            let _ = handle.offer(LogEvent::Sealed, archived);
            return subscription;
        }

        state.subscribers.push(handle);
        subscription
    }

    /// Seal a stream and return its rendered archive form.
    ///
    /// Idempotent: sealing twice returns the same bytes.
    pub fn seal(&self, job: JobId, ordinal: u32) -> Bytes {
        let state = self
            .streams
            .entry((job, ordinal))
            .or_insert_with(|| Mutex::new(StreamState::new()));
        let mut state = state.lock();

        if !state.log.is_sealed() {
            state.log.seal();
            state.fan_out(LogEvent::Sealed);
            state.subscribers.clear();
        }
        state.log.render()
    }

    /// Whether the stream exists and is sealed.
    pub fn is_sealed(&self, job: JobId, ordinal: u32) -> bool {
        self.streams
            .get(&(job, ordinal))
            .map(|s| s.lock().log.is_sealed())
            .unwrap_or(false)
    }

    /// Drop all stream state for a job (after archival).
    pub fn forget_job(&self, job: JobId) {
        self.streams.retain(|(j, _), _| *j != job);
        self.masks.remove(&job);
    }

    fn masked(&self, job: JobId, data: Bytes) -> Bytes {
        let Some(masks) = self.masks.get(&job) else {
            return data;
        };
        if masks.is_empty() {
            return data;
        }
        let text = String::from_utf8_lossy(&data);
        let masked = masks.apply(&text);
        if masked.as_str() == text {
            data
        } else {
            Bytes::from(masked.into_bytes())
        }
    }
}

impl StreamState {
    fn new() -> Self {
        Self {
            log: StepLog::new(),
            subscribers: Vec::new(),
        }
    }

    /// Deliver to every live subscriber; slow ones are dropped with their
    /// resync offset already pinned by the failed offer.
    fn fan_out(&mut self, event: LogEvent) {
        let archived = self.log.byte_len();
        self.subscribers
            .retain(|handle| handle.offer(event.clone(), archived));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_subscribe_seal_roundtrip() {
        let pipeline = LogPipeline::new("***");
        let job = JobId::new();

        pipeline.append(job, 0, 0, Bytes::from("hello ")).unwrap();
        let mut sub = pipeline.subscribe(job, 0);
        pipeline.append(job, 0, 1, Bytes::from("world\n")).unwrap();
        let archived = pipeline.seal(job, 0);

        // Replay of the first chunk, live second chunk, then the seal.
        assert!(matches!(sub.recv().await, Some(LogEvent::Chunk { seq: 0, .. })));
        assert!(matches!(sub.recv().await, Some(LogEvent::Chunk { seq: 1, .. })));
        assert_eq!(sub.recv().await, Some(LogEvent::Sealed));

        assert_eq!(archived, Bytes::from("hello world\n"));
    }

    #[tokio::test]
    async fn test_gap_is_explicit_for_subscribers_and_archive() {
        let pipeline = LogPipeline::new("***");
        let job = JobId::new();
        let mut sub = pipeline.subscribe(job, 0);

        pipeline.append(job, 0, 0, Bytes::from("a\n")).unwrap();
        pipeline.append(job, 0, 2, Bytes::from("c\n")).unwrap();

        assert!(matches!(sub.recv().await, Some(LogEvent::Chunk { seq: 0, .. })));
        assert_eq!(sub.recv().await, Some(LogEvent::Gap { from: 1, to: 2 }));
        assert!(matches!(sub.recv().await, Some(LogEvent::Chunk { seq: 2, .. })));

        let archived = pipeline.seal(job, 0);
        let text = String::from_utf8(archived.to_vec()).unwrap();
        assert_eq!(text, "a\n[log gap: chunks 1..2 missing]\nc\n");
    }

    #[test]
    fn test_sealed_stream_rejects_appends() {
        let pipeline = LogPipeline::new("***");
        let job = JobId::new();
        pipeline.append(job, 0, 0, Bytes::from("a")).unwrap();
        pipeline.seal(job, 0);

        let err = pipeline.append(job, 0, 1, Bytes::from("b")).unwrap_err();
        assert!(matches!(err, ProtocolError::StreamSealed { .. }));
    }

    #[test]
    fn test_secret_masking_on_ingest() {
        let pipeline = LogPipeline::new("***");
        let job = JobId::new();
        pipeline.register_secret(job, "s3cr3t-value");

        pipeline
            .append(job, 0, 0, Bytes::from("token=s3cr3t-value done\n"))
            .unwrap();
        let archived = pipeline.seal(job, 0);
        assert_eq!(archived, Bytes::from("token=*** done\n"));
    }

    #[tokio::test]
    async fn test_duplicate_seq_not_fanned_out_twice() {
        let pipeline = LogPipeline::new("***");
        let job = JobId::new();
        let mut sub = pipeline.subscribe(job, 0);

        pipeline.append(job, 0, 0, Bytes::from("once")).unwrap();
        pipeline.append(job, 0, 0, Bytes::from("again")).unwrap();
        pipeline.seal(job, 0);

        assert!(matches!(sub.recv().await, Some(LogEvent::Chunk { seq: 0, .. })));
        assert_eq!(sub.recv().await, Some(LogEvent::Sealed));
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_streams_are_per_step() {
        let pipeline = LogPipeline::new("***");
        let job = JobId::new();
        pipeline.append(job, 0, 0, Bytes::from("step0")).unwrap();
        pipeline.append(job, 1, 0, Bytes::from("step1")).unwrap();

        assert_eq!(pipeline.seal(job, 0), Bytes::from("step0"));
        assert_eq!(pipeline.seal(job, 1), Bytes::from("step1"));
    }
}
