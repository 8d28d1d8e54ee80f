// Concurrency groups
// A named mutual-exclusion domain: at most one job of a group may hold the
// claimed/running slot at any time.

use dashmap::DashMap;

use crate::model::JobId;

/// Result of asking a group to admit a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The slot was free (or already ours); proceed to enqueue.
    Admitted,
    /// The slot is held and the group does not cancel; hold the job back.
    Blocked,
    /// The slot holder must be cancelled; the new job takes the slot.
    AdmittedCancelling(JobId),
}

#[derive(Debug, Default)]
struct GroupState {
    active: Option<JobId>,
}

/// Group table. Admission and release are each atomic per group entry.
#[derive(Debug, Default)]
pub struct ConcurrencyGroups {
    groups: DashMap<String, GroupState>,
}

impl ConcurrencyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the group slot for a job.
    pub fn admit(&self, group: &str, job: JobId, cancel_in_progress: bool) -> Admission {
        let mut state = self.groups.entry(group.to_string()).or_default();
        match state.active {
            None => {
                state.active = Some(job);
                Admission::Admitted
            }
            Some(active) if active == job => Admission::Admitted,
            Some(active) => {
                if cancel_in_progress {
                    state.active = Some(job);
                    Admission::AdmittedCancelling(active)
                } else {
                    Admission::Blocked
                }
            }
        }
    }

    /// Release the slot when its holder goes terminal.
    ///
    /// Returns true when the job actually held the slot, which is the signal
    /// to re-examine held jobs.
    pub fn release(&self, group: &str, job: JobId) -> bool {
        let Some(mut state) = self.groups.get_mut(group) else {
            return false;
        };
        if state.active == Some(job) {
            state.active = None;
            true
        } else {
            false
        }
    }

    pub fn holder(&self, group: &str) -> Option<JobId> {
        self.groups.get(group).and_then(|s| s.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_free_slot() {
        let groups = ConcurrencyGroups::new();
        let job = JobId::new();
        assert_eq!(groups.admit("deploy", job, false), Admission::Admitted);
        assert_eq!(groups.holder("deploy"), Some(job));
        // Re-admission of the holder is a no-op.
        assert_eq!(groups.admit("deploy", job, false), Admission::Admitted);
    }

    #[test]
    fn test_blocked_without_cancel() {
        let groups = ConcurrencyGroups::new();
        let first = JobId::new();
        let second = JobId::new();
        groups.admit("deploy", first, false);
        assert_eq!(groups.admit("deploy", second, false), Admission::Blocked);
        assert_eq!(groups.holder("deploy"), Some(first));
    }

    #[test]
    fn test_cancel_in_progress_steals_slot() {
        let groups = ConcurrencyGroups::new();
        let first = JobId::new();
        let second = JobId::new();
        groups.admit("deploy", first, true);
        assert_eq!(
            groups.admit("deploy", second, true),
            Admission::AdmittedCancelling(first)
        );
        assert_eq!(groups.holder("deploy"), Some(second));
    }

    #[test]
    fn test_release() {
        let groups = ConcurrencyGroups::new();
        let first = JobId::new();
        let stranger = JobId::new();
        groups.admit("deploy", first, false);

        assert!(!groups.release("deploy", stranger));
        assert!(groups.release("deploy", first));
        assert_eq!(groups.holder("deploy"), None);
        assert!(!groups.release("deploy", first));

        // Slot is free again.
        assert_eq!(groups.admit("deploy", stranger, false), Admission::Admitted);
    }

    #[test]
    fn test_groups_are_independent() {
        let groups = ConcurrencyGroups::new();
        let a = JobId::new();
        let b = JobId::new();
        assert_eq!(groups.admit("one", a, false), Admission::Admitted);
        assert_eq!(groups.admit("two", b, false), Admission::Admitted);
    }
}
