// Job queue
// Priority queue partitioned by required-label signature. Claims are atomic:
// the partition lock is held across the store transition, so exactly one
// caller wins a given entry.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{JobId, RunnerId};
use crate::store::StateStore;

/// One queued job awaiting a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    /// Sorted label requirement; also the partition key.
    pub required_labels: Vec<String>,
    /// Higher dispatches first among same-time entries.
    pub priority: i32,
    /// Entries are invisible to claims before this instant.
    pub earliest_dispatch_time: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Ordering: earliest dispatch time, then priority (higher first),
    /// then FIFO on enqueue time.
    fn sort_key(&self) -> (DateTime<Utc>, i32, DateTime<Utc>) {
        (self.earliest_dispatch_time, -self.priority, self.enqueued_at)
    }
}

/// Label-partitioned queue with lease-based claims.
#[derive(Debug)]
pub struct JobQueue {
    partitions: Mutex<BTreeMap<String, Vec<QueueEntry>>>,
    lease_ttl: Duration,
}

fn signature(labels: &[String]) -> String {
    let mut sorted: Vec<&str> = labels.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

impl JobQueue {
    pub fn new(lease_ttl: std::time::Duration) -> Self {
        Self {
            partitions: Mutex::new(BTreeMap::new()),
            lease_ttl: Duration::from_std(lease_ttl).unwrap_or_else(|_| Duration::seconds(60)),
        }
    }

    /// Add an entry; enqueueing an already-queued job is a no-op.
    pub fn enqueue(&self, mut entry: QueueEntry) {
        entry.required_labels.sort_unstable();
        let key = signature(&entry.required_labels);
        let mut partitions = self.partitions.lock();
        let partition = partitions.entry(key).or_default();
        if partition.iter().any(|e| e.job_id == entry.job_id) {
            return;
        }
        partition.push(entry);
        partition.sort_by_key(QueueEntry::sort_key);
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.partitions
            .lock()
            .values()
            .any(|p| p.iter().any(|e| e.job_id == job_id))
    }

    /// Drop an entry (cancelled or skipped before dispatch).
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut partitions = self.partitions.lock();
        for partition in partitions.values_mut() {
            if let Some(pos) = partition.iter().position(|e| e.job_id == job_id) {
                partition.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.partitions.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the oldest eligible entry whose requirement is a subset of the
    /// runner's labels. The winning job transitions to claimed with a lease
    /// before the lock is released; losers observe the entry gone.
    pub fn claim(
        &self,
        runner: RunnerId,
        runner_labels: &[String],
        store: &Arc<StateStore>,
        now: DateTime<Utc>,
    ) -> Option<JobId> {
        let mut partitions = self.partitions.lock();

        loop {
            // Best candidate across all satisfiable partitions.
            let mut best: Option<(String, usize, (DateTime<Utc>, i32, DateTime<Utc>))> = None;
            for (key, partition) in partitions.iter() {
                for (idx, entry) in partition.iter().enumerate() {
                    if entry.earliest_dispatch_time > now {
                        continue;
                    }
                    if !entry
                        .required_labels
                        .iter()
                        .all(|l| runner_labels.contains(l))
                    {
                        break; // whole partition shares the requirement
                    }
                    let key_tuple = entry.sort_key();
                    let better = match &best {
                        None => true,
                        Some((_, _, current)) => key_tuple < *current,
                    };
                    if better {
                        best = Some((key.clone(), idx, key_tuple));
                    }
                    break; // partition is sorted; first visible entry is its best
                }
            }

            let (key, idx, _) = best?;
            let Some(entry) = partitions.get_mut(&key).map(|p| p.remove(idx)) else {
                return None;
            };

            let lease_until = now + self.lease_ttl;
            match store.claim_job(entry.job_id, runner, lease_until) {
                Ok(()) => return Some(entry.job_id),
                // The job moved on (cancelled, timed out) while queued;
                // discard the stale entry and keep looking.
                Err(_) => continue,
            }
        }
    }

    /// Entries waiting longer than `wait` with no successful dispatch.
    pub fn waiting_longer_than(&self, wait: std::time::Duration, now: DateTime<Utc>) -> Vec<JobId> {
        let wait = Duration::from_std(wait).unwrap_or_else(|_| Duration::seconds(0));
        self.partitions
            .lock()
            .values()
            .flatten()
            .filter(|e| now - e.enqueued_at > wait)
            .map(|e| e.job_id)
            .collect()
    }

    /// All queued job ids, for diagnostics.
    pub fn queued_jobs(&self) -> Vec<JobId> {
        self.partitions
            .lock()
            .values()
            .flatten()
            .map(|e| e.job_id)
            .collect()
    }
}
