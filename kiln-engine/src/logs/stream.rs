// Step log streams
// Append-only chunk log per (job, step ordinal): monotonic seq, idempotent
// duplicates, explicit gap markers, sealed on step terminal.

use bytes::Bytes;

/// One stored element of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredChunk {
    Data { seq: u64, data: Bytes },
    /// Chunks [from, to) never arrived; recorded in place, never rewritten.
    Gap { from: u64, to: u64 },
}

/// Outcome of an append, for fan-out decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    /// Chunk accepted at the expected seq.
    Accepted,
    /// Chunk accepted after recording a gap marker.
    AcceptedWithGap { from: u64, to: u64 },
    /// Duplicate seq; ignored idempotently.
    Duplicate,
}

/// The ordered chunk log of a single step.
#[derive(Debug, Default)]
pub struct StepLog {
    chunks: Vec<StoredChunk>,
    next_seq: u64,
    sealed: bool,
    /// Total data bytes stored, used as the archived offset for resync.
    bytes: u64,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn byte_len(&self) -> u64 {
        self.bytes
    }

    /// Append a chunk. Duplicates (seq below the watermark) are idempotent;
    /// a skipped-ahead seq records a gap marker first.
    pub fn append(&mut self, seq: u64, data: Bytes) -> Result<Appended, Sealed> {
        if self.sealed {
            return Err(Sealed);
        }
        if seq < self.next_seq {
            return Ok(Appended::Duplicate);
        }

        let outcome = if seq > self.next_seq {
            let gap = StoredChunk::Gap {
                from: self.next_seq,
                to: seq,
            };
            self.chunks.push(gap);
            Appended::AcceptedWithGap {
                from: self.next_seq,
                to: seq,
            }
        } else {
            Appended::Accepted
        };

        self.bytes += data.len() as u64;
        self.chunks.push(StoredChunk::Data { seq, data });
        self.next_seq = seq + 1;
        Ok(outcome)
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn chunks(&self) -> &[StoredChunk] {
        &self.chunks
    }

    /// Render the archived form: data chunks concatenated, gaps explicit.
    pub fn render(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.bytes as usize + 64);
        for chunk in &self.chunks {
            match chunk {
                StoredChunk::Data { data, .. } => out.extend_from_slice(data),
                StoredChunk::Gap { from, to } => {
                    out.extend_from_slice(
                        format!("[log gap: chunks {from}..{to} missing]\n").as_bytes(),
                    );
                }
            }
        }
        Bytes::from(out)
    }
}

/// Appending to a sealed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sealed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_appends() {
        let mut log = StepLog::new();
        assert_eq!(log.append(0, Bytes::from("a")).unwrap(), Appended::Accepted);
        assert_eq!(log.append(1, Bytes::from("b")).unwrap(), Appended::Accepted);
        assert_eq!(log.next_seq(), 2);
        assert_eq!(log.render(), Bytes::from("ab"));
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut log = StepLog::new();
        log.append(0, Bytes::from("a")).unwrap();
        assert_eq!(
            log.append(0, Bytes::from("a-again")).unwrap(),
            Appended::Duplicate
        );
        assert_eq!(log.render(), Bytes::from("a"));
        assert_eq!(log.byte_len(), 1);
    }

    #[test]
    fn test_gap_marker_recorded_in_place() {
        let mut log = StepLog::new();
        log.append(0, Bytes::from("a\n")).unwrap();
        let outcome = log.append(3, Bytes::from("d\n")).unwrap();
        assert_eq!(outcome, Appended::AcceptedWithGap { from: 1, to: 3 });

        let rendered = String::from_utf8(log.render().to_vec()).unwrap();
        assert_eq!(rendered, "a\n[log gap: chunks 1..3 missing]\nd\n");

        // A late chunk for the gap range is treated as a duplicate, never a
        // rewrite.
        assert_eq!(
            log.append(1, Bytes::from("b\n")).unwrap(),
            Appended::Duplicate
        );
    }

    #[test]
    fn test_sealed_rejects_appends() {
        let mut log = StepLog::new();
        log.append(0, Bytes::from("a")).unwrap();
        log.seal();
        assert!(log.is_sealed());
        assert_eq!(log.append(1, Bytes::from("b")), Err(Sealed));
        assert_eq!(log.render(), Bytes::from("a"));
    }
}
