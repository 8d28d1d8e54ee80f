// Engine wiring
// Builds every component from configuration and runs the event loop that
// turns scheduler effects into async work (provisioning, teardown, sweeps).

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::error::EngineError;
use crate::exec::ExecutorService;
use crate::logs::LogPipeline;
use crate::model::{JobId, Run, RunId, TriggerEvent};
use crate::queue::JobQueue;
use crate::runner::{Provisioner, RunnerManager};
use crate::scheduler::{Effect, Scheduler, SchedulerEvent};
use crate::secrets::SecretProvider;
use crate::store::StateStore;
use crate::trigger::TriggerMatcher;

/// Everything wired together. Components hold `Arc`s of each other's
/// boundaries; nothing is process-global.
pub struct Engine {
    pub config: Config,
    pub store: Arc<StateStore>,
    pub queue: Arc<JobQueue>,
    pub logs: Arc<LogPipeline>,
    pub artifacts: Arc<ArtifactStore>,
    pub trigger: Arc<TriggerMatcher>,
    pub scheduler: Arc<Scheduler>,
    pub runners: Arc<RunnerManager>,
    pub executor: Arc<ExecutorService>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SchedulerEvent>>,
}

impl Engine {
    pub fn new(config: Config, secrets: Arc<dyn SecretProvider>) -> Self {
        Self::with_provisioner(config, secrets, None)
    }

    pub fn with_provisioner(
        config: Config,
        secrets: Arc<dyn SecretProvider>,
        provisioner: Option<Arc<dyn Provisioner>>,
    ) -> Self {
        let store = Arc::new(StateStore::new());
        let queue = Arc::new(JobQueue::new(config.lease.ttl()));
        let logs = Arc::new(LogPipeline::new(config.secrets.mask_token.clone()));
        let artifacts = Arc::new(ArtifactStore::from_config(
            &config.storage,
            config.limits.clone(),
            config.retention.clone(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut runners = RunnerManager::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.lease.clone(),
            config.heartbeat.clone(),
            config.queue.clone(),
            events_tx.clone(),
        );
        if let Some(provisioner) = provisioner {
            runners = runners.with_provisioner(provisioner);
        }
        let runners = Arc::new(runners);

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.queue.clone(),
        ));

        let trigger = Arc::new(TriggerMatcher::new(
            Arc::clone(&store),
            config.limits.clone(),
        ));

        let executor = Arc::new(ExecutorService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&logs),
            Arc::clone(&artifacts),
            secrets,
            config.lease.clone(),
            config.retention.clone(),
            events_tx.clone(),
        ));

        Self {
            config,
            store,
            queue,
            logs,
            artifacts,
            trigger,
            scheduler,
            runners,
            executor,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Feed a trigger event in; matched runs are scheduled immediately.
    pub fn submit_event(&self, event: &TriggerEvent) -> Result<Vec<Run>, EngineError> {
        let runs = self.trigger.match_event(event)?;
        for run in &runs {
            let _ = self.events_tx.send(SchedulerEvent::RunCreated(run.id));
        }
        Ok(runs)
    }

    pub fn cancel_run(&self, run_id: RunId) {
        let _ = self.events_tx.send(SchedulerEvent::CancelRun(run_id));
    }

    pub fn cancel_job(&self, job_id: JobId) {
        self.executor.cancel(job_id);
    }

    /// Drain pending scheduler events and execute their effects. The CLI and
    /// tests drive the engine with this; a daemon wraps it in `run_worker`.
    pub async fn drain_events(&self) {
        loop {
            let event = {
                let mut rx = self.events_rx.lock().await;
                match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            };
            debug!(?event, "scheduler wake");
            let effects = self.scheduler.handle(event);
            self.apply_effects(effects).await;
        }
    }

    /// Periodic housekeeping: deadlines, heartbeat sweeps, retention.
    pub async fn tick(&self) {
        let now = Utc::now();
        self.runners.sweep(now);
        let effects = self.scheduler.handle(SchedulerEvent::Tick);
        self.apply_effects(effects).await;
        self.artifacts.sweep(now).await;
        self.drain_events().await;
    }

    /// Long-running worker: event loop plus the periodic tick.
    pub async fn run_worker(&self) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.heartbeat.interval_secs));
        loop {
            let event = {
                let mut rx = self.events_rx.lock().await;
                tokio::select! {
                    event = rx.recv() => event,
                    _ = interval.tick() => Some(SchedulerEvent::Tick),
                }
            };
            let Some(event) = event else {
                return; // all senders gone
            };
            if event == SchedulerEvent::Tick {
                self.runners.sweep(Utc::now());
                self.artifacts.sweep(Utc::now()).await;
            }
            let effects = self.scheduler.handle(event);
            self.apply_effects(effects).await;
        }
    }

    async fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Reclaim(job_id) => self.runners.reclaim(job_id).await,
                Effect::ProvisionCheck => self.provision_pending().await,
            }
        }
    }

    /// Launch ephemeral capacity for queued jobs no standing runner covers.
    async fn provision_pending(&self) {
        for job_id in self.queue.queued_jobs() {
            let Some(job) = self.store.job(job_id) else {
                continue;
            };
            let Some(run) = self.store.run(job.run_id) else {
                continue;
            };
            if self.runners.has_capable_runner(&run.repo, &job.labels) {
                continue;
            }
            if let Err(err) = self.runners.provision(&job, &run.repo).await {
                tracing::warn!(job = %job_id, error = %err, "ephemeral provisioning failed");
            }
        }
    }
}
