// Runner manager
// Registration tokens, heartbeat health, lease recovery, scope resolution,
// and ephemeral environment lifecycle.

pub mod provision;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Heartbeat, LeaseConfig, QueueConfig};
use crate::model::{
    FailureReason, Job, JobConclusion, JobId, Runner, RunnerId, RunnerKind, RunnerMetadata,
    RunnerScope, RunnerStatus,
};
use crate::queue::{JobQueue, QueueEntry};
use crate::scheduler::SchedulerEvent;
use crate::store::{StateStore, StoreError};

pub use provision::{
    DockerProvisioner, NullProvisioner, ProvisionError, ProvisionSpec, ProvisionedEnv, Provisioner,
    PullPolicy,
};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("registration token is invalid or already used")]
    InvalidToken,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

/// What a one-shot registration token authorizes.
#[derive(Debug, Clone)]
struct TokenGrant {
    scope: RunnerScope,
    /// Labels stamped onto the runner in addition to what it reports.
    labels: Vec<String>,
    kind: RunnerKind,
    issued_at: DateTime<Utc>,
}

/// Runner lifecycle and capacity manager.
pub struct RunnerManager {
    store: Arc<StateStore>,
    queue: Arc<JobQueue>,
    lease: LeaseConfig,
    heartbeat: Heartbeat,
    queue_config: QueueConfig,
    tokens: DashMap<String, TokenGrant>,
    provisioner: Option<Arc<dyn Provisioner>>,
    envs: DashMap<JobId, ProvisionedEnv>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl RunnerManager {
    pub fn new(
        store: Arc<StateStore>,
        queue: Arc<JobQueue>,
        lease: LeaseConfig,
        heartbeat: Heartbeat,
        queue_config: QueueConfig,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            store,
            queue,
            lease,
            heartbeat,
            queue_config,
            tokens: DashMap::new(),
            provisioner: None,
            envs: DashMap::new(),
            events,
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Issue a one-shot registration token bound to a scope and label set.
    pub fn issue_token(&self, scope: RunnerScope, labels: Vec<String>, kind: RunnerKind) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        self.tokens.insert(
            token.clone(),
            TokenGrant {
                scope,
                labels,
                kind,
                issued_at: Utc::now(),
            },
        );
        token
    }

    /// Redeem a token and register the runner. The token is consumed even
    /// when registration subsequently fails.
    pub fn register(
        &self,
        token: &str,
        name: impl Into<String>,
        mut labels: Vec<String>,
        metadata: RunnerMetadata,
    ) -> Result<Runner, RunnerError> {
        let (_, grant) = self.tokens.remove(token).ok_or(RunnerError::InvalidToken)?;

        for label in &grant.labels {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }

        let now = Utc::now();
        let runner = Runner {
            id: RunnerId::new(),
            name: name.into(),
            scope: grant.scope,
            labels,
            kind: grant.kind,
            status: RunnerStatus::Online,
            metadata,
            registered_at: now,
            last_heartbeat: now,
        };
        self.store.insert_runner(runner.clone());
        info!(runner = %runner.id, name = %runner.name, "runner registered");
        let _ = self.events.send(SchedulerEvent::RunnerChanged);
        Ok(runner)
    }

    /// Record a heartbeat and renew the listed leases.
    ///
    /// Returns the subset of leases flagged for cooperative cancellation.
    pub fn heartbeat(
        &self,
        runner: RunnerId,
        status: RunnerStatus,
        active_leases: &[JobId],
    ) -> Result<Vec<JobId>, RunnerError> {
        let now = Utc::now();
        self.store.record_heartbeat(runner, status, now)?;

        let lease_until = now + lease_duration(&self.lease);
        let mut cancelled = Vec::new();
        for &job_id in active_leases {
            let Some(job) = self.store.job(job_id) else {
                continue;
            };
            // Only the lease holder renews.
            if job.runner != Some(runner) || job.is_terminal() {
                continue;
            }
            self.store.renew_lease(job_id, lease_until)?;
            if job.cancel_requested {
                cancelled.push(job_id);
            }
        }
        Ok(cancelled)
    }

    /// Mark the runner offline and return its leases to the queue.
    pub fn deregister(&self, runner: RunnerId) -> Result<(), RunnerError> {
        let leases = self.store.jobs_leased_to(runner);
        for job_id in leases {
            self.recover_lost_lease(job_id);
        }
        self.store.remove_runner(runner);
        info!(runner = %runner, "runner deregistered");
        let _ = self.events.send(SchedulerEvent::RunnerChanged);
        Ok(())
    }

    /// Health sweep: runners silent past the grace window go offline and
    /// their leases return to the queue. Separately, any expired lease is
    /// recovered even when its runner still claims to be alive.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let grace = Duration::from_std(self.heartbeat.grace())
            .unwrap_or_else(|_| Duration::seconds(30));

        for runner in self.store.all_runners() {
            if runner.status != RunnerStatus::Offline && now - runner.last_heartbeat > grace {
                warn!(runner = %runner.id, "runner missed heartbeats, marking offline");
                let _ = self.store.set_runner_status(runner.id, RunnerStatus::Offline);
                for job_id in self.store.jobs_leased_to(runner.id) {
                    self.recover_lost_lease(job_id);
                }
                let _ = self.events.send(SchedulerEvent::RunnerChanged);
            }
        }

        for job_id in self.store.jobs_with_expired_leases(now) {
            self.recover_lost_lease(job_id);
        }
    }

    /// Lease-loss policy: requeue with the attempt counter already bumped by
    /// the original claim, or fail with `runner_lost` past the ceiling.
    fn recover_lost_lease(&self, job_id: JobId) {
        let Some(job) = self.store.job(job_id) else {
            return;
        };
        if job.is_terminal() {
            return;
        }

        if job.attempt >= self.queue_config.max_attempts {
            warn!(job = %job_id, attempts = job.attempt, "lease lost past attempt ceiling");
            let _ = self.store.complete_job(
                job_id,
                JobConclusion::Failed,
                Some(FailureReason::RunnerLost(format!(
                    "lease expired after {} attempt(s)",
                    job.attempt
                ))),
                Utc::now(),
            );
            let _ = self.events.send(SchedulerEvent::JobTerminal(job_id));
        } else {
            info!(job = %job_id, attempt = job.attempt, "lease lost, returning job to queue");
            if self.store.requeue_job(job_id).is_ok() {
                self.queue.enqueue(queue_entry_for(&job, Utc::now()));
                let _ = self.events.send(SchedulerEvent::RunnerChanged);
            }
        }
    }

    /// Whether any known runner could ever satisfy the labels for a repo,
    /// walking repo then org then global scope.
    pub fn has_capable_runner(&self, repo: &str, labels: &[String]) -> bool {
        self.capable_runners(repo, labels).next().is_some()
    }

    /// Runners able to serve a job, in scope-precedence order.
    pub fn capable_runners<'a>(
        &self,
        repo: &'a str,
        labels: &'a [String],
    ) -> impl Iterator<Item = Runner> + 'a {
        let mut runners: Vec<Runner> = self
            .store
            .all_runners()
            .into_iter()
            .filter(|r| r.status != RunnerStatus::Offline)
            .filter(|r| r.scope.covers(repo))
            .filter(|r| r.satisfies(labels))
            .collect();
        runners.sort_by_key(|r| r.scope.precedence());
        runners.into_iter()
    }

    /// Launch an ephemeral environment for a queued job, when a provisioner
    /// is configured and no standing runner can take it.
    pub async fn provision(&self, job: &Job, repo: &str) -> Result<(), RunnerError> {
        let Some(provisioner) = &self.provisioner else {
            return Ok(());
        };
        if self.envs.contains_key(&job.id) {
            return Ok(());
        }

        let token = self.issue_token(
            RunnerScope::Repo(repo.to_string()),
            job.labels.clone(),
            RunnerKind::EphemeralContainer,
        );
        let spec = ProvisionSpec {
            job: job.id,
            labels: job.labels.clone(),
            registration_token: token,
        };
        let env = provisioner.launch(&spec).await?;
        self.envs.insert(job.id, env);
        Ok(())
    }

    /// Tear down the job's ephemeral environment, if one was launched.
    pub async fn reclaim(&self, job_id: JobId) {
        let Some((_, env)) = self.envs.remove(&job_id) else {
            return;
        };
        let Some(provisioner) = &self.provisioner else {
            return;
        };
        if let Err(err) = provisioner.teardown(&env).await {
            warn!(job = %job_id, error = %err, "ephemeral teardown failed");
        }
    }

    /// Expire stale registration tokens (housekeeping; tokens are one-shot
    /// either way).
    pub fn prune_tokens(&self, older_than: Duration, now: DateTime<Utc>) {
        self.tokens.retain(|_, grant| now - grant.issued_at <= older_than);
    }
}

fn lease_duration(config: &LeaseConfig) -> Duration {
    Duration::from_std(config.ttl()).unwrap_or_else(|_| Duration::seconds(60))
}

/// Rebuild a queue entry for a job re-entering the queue.
pub fn queue_entry_for(job: &Job, now: DateTime<Utc>) -> QueueEntry {
    QueueEntry {
        job_id: job.id,
        required_labels: job.labels.clone(),
        priority: 0,
        earliest_dispatch_time: now,
        enqueued_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, RunId};
    use std::collections::HashMap;

    fn manager() -> (
        RunnerManager,
        Arc<StateStore>,
        Arc<JobQueue>,
        mpsc::UnboundedReceiver<SchedulerEvent>,
    ) {
        let store = Arc::new(StateStore::new());
        let queue = Arc::new(JobQueue::new(std::time::Duration::from_secs(60)));
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = RunnerManager::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            LeaseConfig::default(),
            Heartbeat::default(),
            QueueConfig::default(),
            tx,
        );
        (manager, store, queue, rx)
    }

    fn seed_job(store: &StateStore, labels: &[&str]) -> Job {
        let id = JobId::new();
        let job = Job {
            id,
            run_id: RunId::new(),
            name: "build".into(),
            display_name: "build".into(),
            matrix: None,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            needs: vec![],
            if_expr: None,
            env: HashMap::new(),
            concurrency: None,
            environment: None,
            output_exprs: HashMap::new(),
            timeout_minutes: 360,
            fail_fast: true,
            max_parallel: None,
            status: JobStatus::Queued,
            conclusion: None,
            failure: None,
            cancel_requested: false,
            runner: None,
            lease_expires_at: None,
            attempt: 0,
            deadline: None,
            started_at: None,
            completed_at: None,
            outputs: HashMap::new(),
            steps: vec![],
        };
        store.insert_job(job.clone());
        job
    }

    #[test]
    fn test_token_is_one_shot() {
        let (manager, _, _, _rx) = manager();
        let token = manager.issue_token(RunnerScope::Global, vec!["linux".into()], RunnerKind::SelfHosted);

        let first = manager.register(&token, "r1", vec![], RunnerMetadata::default());
        assert!(first.is_ok());
        let second = manager.register(&token, "r2", vec![], RunnerMetadata::default());
        assert!(matches!(second, Err(RunnerError::InvalidToken)));

        // Token labels are stamped onto the runner.
        assert_eq!(first.unwrap().labels, vec!["linux"]);
    }

    #[test]
    fn test_offline_sweep_recovers_lease() {
        let (manager, store, queue, _rx) = manager();
        let token = manager.issue_token(RunnerScope::Global, vec![], RunnerKind::SelfHosted);
        let runner = manager
            .register(&token, "r1", vec!["linux".into()], RunnerMetadata::default())
            .unwrap();

        let job = seed_job(&store, &["linux"]);
        store
            .claim_job(job.id, runner.id, Utc::now() + Duration::seconds(60))
            .unwrap();

        // Two attempts allowed so the first loss requeues.
        let (tx, _rx2) = mpsc::unbounded_channel();
        let manager = RunnerManager::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            LeaseConfig::default(),
            Heartbeat::default(),
            QueueConfig {
                max_attempts: 2,
                ..QueueConfig::default()
            },
            tx,
        );

        // Well past the grace window.
        manager.sweep(Utc::now() + Duration::seconds(3600));

        let runner = store.runner(runner.id).unwrap();
        assert_eq!(runner.status, RunnerStatus::Offline);

        let job = store.job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 1);
        assert!(queue.contains(job.id));
    }

    #[test]
    fn test_lease_loss_past_ceiling_fails_runner_lost() {
        let (manager, store, _queue, mut rx) = manager();
        let token = manager.issue_token(RunnerScope::Global, vec![], RunnerKind::SelfHosted);
        let runner = manager
            .register(&token, "r1", vec!["linux".into()], RunnerMetadata::default())
            .unwrap();

        let job = seed_job(&store, &["linux"]);
        // Expired lease, default max_attempts = 1.
        store
            .claim_job(job.id, runner.id, Utc::now() - Duration::seconds(5))
            .unwrap();

        manager.sweep(Utc::now());

        let job = store.job(job.id).unwrap();
        assert_eq!(job.conclusion, Some(JobConclusion::Failed));
        assert!(matches!(job.failure, Some(FailureReason::RunnerLost(_))));

        // RunnerChanged from registration, then the terminal notification.
        let mut saw_terminal = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SchedulerEvent::JobTerminal(id) if id == job.id) {
                saw_terminal = true;
            }
        }
        assert!(saw_terminal);
    }

    #[test]
    fn test_heartbeat_renews_and_reports_cancel() {
        let (manager, store, _queue, _rx) = manager();
        let token = manager.issue_token(RunnerScope::Global, vec![], RunnerKind::SelfHosted);
        let runner = manager
            .register(&token, "r1", vec!["linux".into()], RunnerMetadata::default())
            .unwrap();

        let job = seed_job(&store, &["linux"]);
        let short_lease = Utc::now() + Duration::seconds(5);
        store.claim_job(job.id, runner.id, short_lease).unwrap();
        store.request_cancel(job.id).unwrap();

        let cancelled = manager
            .heartbeat(runner.id, RunnerStatus::Busy, &[job.id])
            .unwrap();
        assert_eq!(cancelled, vec![job.id]);

        let job = store.job(job.id).unwrap();
        assert!(job.lease_expires_at.unwrap() > short_lease);
    }

    #[test]
    fn test_scope_resolution_order() {
        let (manager, _store, _queue, _rx) = manager();
        for (scope, name) in [
            (RunnerScope::Global, "global"),
            (RunnerScope::Org("acme".into()), "org"),
            (RunnerScope::Repo("acme/widgets".into()), "repo"),
        ] {
            let token = manager.issue_token(scope, vec![], RunnerKind::SelfHosted);
            manager
                .register(&token, name, vec!["linux".into()], RunnerMetadata::default())
                .unwrap();
        }

        let labels = vec!["linux".to_string()];
        let order: Vec<String> = manager
            .capable_runners("acme/widgets", &labels)
            .map(|r| r.name)
            .collect();
        assert_eq!(order, vec!["repo", "org", "global"]);

        assert!(manager.has_capable_runner("other/repo", &labels));
        assert!(!manager.has_capable_runner("acme/widgets", &["gpu".to_string()]));
    }

    #[tokio::test]
    async fn test_provision_and_reclaim() {
        let (manager, store, _queue, _rx) = manager();
        let provisioner = Arc::new(NullProvisioner::new());
        let manager = manager.with_provisioner(Arc::clone(&provisioner) as Arc<dyn Provisioner>);

        let job = seed_job(&store, &["linux", "ephemeral"]);
        manager.provision(&job, "acme/widgets").await.unwrap();
        assert_eq!(provisioner.launched().len(), 1);
        assert_eq!(provisioner.launched()[0].labels, job.labels);

        // Idempotent while the environment lives.
        manager.provision(&job, "acme/widgets").await.unwrap();
        assert_eq!(provisioner.launched().len(), 1);

        manager.reclaim(job.id).await;
        assert_eq!(provisioner.torn_down().len(), 1);
    }
}
