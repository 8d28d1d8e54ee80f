// Trigger matcher
// Event records in, run drafts out: filter matching for push/pr/release,
// cron ticks for schedules, typed input validation for manual dispatch.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Limits;
use crate::error::EngineError;
use crate::model::{
    EventKind, FailureReason, Run, RunConclusion, RunId, RunStatus, TriggerEvent,
};
use crate::planner;
use crate::store::StateStore;
use crate::workflow::glob::PatternList;
use crate::workflow::models::{DispatchInput, EventFilter, EventSpec, InputType, Workflow};
use crate::workflow::{CronSchedule, ParseError, WorkflowParser};

/// A registered workflow source for a repository.
#[derive(Debug, Clone)]
pub struct RegisteredWorkflow {
    pub repo: String,
    /// Name: explicit `name:` or the source path.
    pub name: String,
    pub path: String,
    pub workflow: Workflow,
    pub enabled: bool,
}

/// Workflow registry plus the event matching logic.
pub struct TriggerMatcher {
    store: Arc<StateStore>,
    limits: Limits,
    workflows: parking_lot::RwLock<Vec<RegisteredWorkflow>>,
}

impl TriggerMatcher {
    pub fn new(store: Arc<StateStore>, limits: Limits) -> Self {
        Self {
            store,
            limits,
            workflows: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Register or replace a workflow source. Replacing never touches
    /// existing runs; they hold their own snapshot.
    pub fn upsert_workflow(
        &self,
        repo: &str,
        path: &str,
        source: &str,
    ) -> Result<(), EngineError> {
        let workflow = WorkflowParser::parse_and_validate(source, &self.limits)?;
        let name = workflow
            .name
            .clone()
            .unwrap_or_else(|| path.to_string());

        let mut workflows = self.workflows.write();
        workflows.retain(|w| !(w.repo == repo && w.path == path));
        workflows.push(RegisteredWorkflow {
            repo: repo.to_string(),
            name,
            path: path.to_string(),
            workflow,
            enabled: true,
        });
        Ok(())
    }

    pub fn set_enabled(&self, repo: &str, path: &str, enabled: bool) {
        let mut workflows = self.workflows.write();
        for w in workflows.iter_mut() {
            if w.repo == repo && w.path == path {
                w.enabled = enabled;
            }
        }
    }

    pub fn workflows_for(&self, repo: &str) -> Vec<RegisteredWorkflow> {
        self.workflows
            .read()
            .iter()
            .filter(|w| w.repo == repo)
            .cloned()
            .collect()
    }

    /// Match an event against the repo's enabled workflows and materialize
    /// one run per match. Planning failures conclude the run failed with no
    /// jobs; dispatch input validation failures reject the whole event.
    pub fn match_event(&self, event: &TriggerEvent) -> Result<Vec<Run>, EngineError> {
        let mut runs = Vec::new();

        for registered in self.workflows_for(&event.repo) {
            if !registered.enabled {
                continue;
            }
            let Some(spec) = registered.workflow.on.event(event.kind.as_str()) else {
                continue;
            };

            let mut event = event.clone();
            if event.kind == EventKind::WorkflowDispatch {
                if let Some(target) = &event.workflow {
                    if target != &registered.name && target != &registered.path {
                        continue;
                    }
                }
                let inputs = spec.and_then(|s| s.inputs());
                event.inputs = validate_dispatch_inputs(inputs, &event.inputs)?;
            } else if !matches(&event, spec) {
                continue;
            }

            debug!(repo = %event.repo, workflow = %registered.name, "event matched workflow");
            runs.push(self.materialize(&registered, event));
        }

        Ok(runs
            .into_iter()
            .filter_map(|id| self.store.run(id))
            .collect())
    }

    /// Freeze the snapshot, allocate the run number, plan the jobs.
    fn materialize(&self, registered: &RegisteredWorkflow, event: TriggerEvent) -> RunId {
        let now = Utc::now();
        let run = Run {
            id: RunId::new(),
            repo: registered.repo.clone(),
            number: self.store.next_run_number(&registered.repo),
            workflow_name: registered.name.clone(),
            snapshot: registered.workflow.clone(),
            actor: event.actor.clone(),
            event,
            status: RunStatus::Queued,
            conclusion: None,
            failure: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            jobs: vec![],
        };
        let run_id = run.id;

        match planner::plan(&run, &self.limits) {
            Ok(jobs) => {
                info!(run = %run_id, number = run.number, workflow = %run.workflow_name, "run created");
                self.store.insert_run(run);
                for job in jobs {
                    self.store.insert_job(job);
                }
            }
            Err(err) => {
                // The run concludes failed before any job exists.
                let mut failed = run;
                failed.status = RunStatus::Completed;
                failed.conclusion = Some(RunConclusion::Failure);
                failed.failure = Some(FailureReason::SetupFailed(err.to_string()));
                failed.completed_at = Some(now);
                info!(run = %run_id, error = %err, "run failed at planning");
                self.store.insert_run(failed);
            }
        }

        run_id
    }
}

/// Filter matching for push / pull_request / release / schedule.
fn matches(event: &TriggerEvent, spec: Option<&EventSpec>) -> bool {
    let Some(spec) = spec else {
        // Bare subscription matches every event of its kind; schedules
        // always need cron entries.
        return event.kind != EventKind::Schedule;
    };

    match event.kind {
        EventKind::Push | EventKind::PullRequest => {
            let Some(filter) = spec.filter() else {
                return true;
            };
            ref_matches(event, filter) && paths_match(event, filter)
        }
        EventKind::Release => true,
        EventKind::Schedule => spec.cron_entries().iter().any(|entry| {
            CronSchedule::parse(&entry.cron)
                .map(|schedule| schedule.matches(event.occurred_at))
                .unwrap_or(false)
        }),
        EventKind::WorkflowDispatch => true,
    }
}

fn ref_matches(event: &TriggerEvent, filter: &EventFilter) -> bool {
    let branch_filters = !filter.branches.is_empty() || !filter.branches_ignore.is_empty();
    let tag_filters = !filter.tags.is_empty() || !filter.tags_ignore.is_empty();

    if let Some(branch) = event.branch() {
        if branch_filters {
            return combined(&filter.branches, &filter.branches_ignore).matches(branch);
        }
        // Only tag filters present: branch refs don't trigger.
        return !tag_filters;
    }
    if let Some(tag) = event.tag() {
        if tag_filters {
            return combined(&filter.tags, &filter.tags_ignore).matches(tag);
        }
        return !branch_filters;
    }
    // Unrecognized ref shape: only unfiltered subscriptions take it.
    !branch_filters && !tag_filters
}

fn paths_match(event: &TriggerEvent, filter: &EventFilter) -> bool {
    if filter.paths.is_empty() && filter.paths_ignore.is_empty() {
        return true;
    }
    let list = combined(&filter.paths, &filter.paths_ignore);
    event.changed_paths.iter().any(|p| list.matches(p))
}

/// Merge a positive list with its `-ignore` twin into one pattern list.
fn combined(positive: &[String], ignored: &[String]) -> PatternList {
    PatternList::new(
        positive
            .iter()
            .cloned()
            .chain(ignored.iter().map(|p| format!("!{p}"))),
    )
}

/// Validate dispatch inputs against their declarations: required presence,
/// choice membership, and scalar types; defaults fill the gaps.
fn validate_dispatch_inputs(
    declared: Option<&HashMap<String, DispatchInput>>,
    supplied: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, EngineError> {
    let empty = HashMap::new();
    let declared = declared.unwrap_or(&empty);

    for name in supplied.keys() {
        if !declared.contains_key(name) {
            return Err(parse_error(format!("undeclared dispatch input '{name}'")));
        }
    }

    let mut resolved = HashMap::new();
    for (name, input) in declared {
        let value = match supplied.get(name) {
            Some(value) => value.clone(),
            None => match &input.default {
                Some(default) => default.clone(),
                None if input.required => {
                    return Err(parse_error(format!(
                        "missing required dispatch input '{name}'"
                    )));
                }
                None => continue,
            },
        };

        match input.input_type {
            InputType::String => {
                if !value.is_string() {
                    return Err(parse_error(format!("input '{name}' must be a string")));
                }
            }
            InputType::Boolean => {
                if !value.is_boolean() {
                    return Err(parse_error(format!("input '{name}' must be a boolean")));
                }
            }
            InputType::Number => {
                if !value.is_number() {
                    return Err(parse_error(format!("input '{name}' must be a number")));
                }
            }
            InputType::Choice => {
                let as_str = value.as_str().unwrap_or_default();
                if !input.options.iter().any(|o| o == as_str) {
                    return Err(parse_error(format!(
                        "input '{name}' value '{as_str}' is not one of {:?}",
                        input.options
                    )));
                }
            }
        }
        resolved.insert(name.clone(), value);
    }

    Ok(resolved)
}

fn parse_error(message: String) -> EngineError {
    EngineError::Parse(ParseError::input(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn matcher() -> TriggerMatcher {
        TriggerMatcher::new(Arc::new(StateStore::new()), Limits::default())
    }

    fn push_event(git_ref: &str, paths: &[&str]) -> TriggerEvent {
        TriggerEvent {
            kind: EventKind::Push,
            repo: "acme/widgets".into(),
            git_ref: git_ref.into(),
            sha: "abc".into(),
            actor: "alice".into(),
            changed_paths: paths.iter().map(|p| p.to_string()).collect(),
            workflow: None,
            inputs: HashMap::new(),
            payload: Value::Null,
            occurred_at: Utc::now(),
        }
    }

    const CI: &str = r#"
name: CI
on:
  push:
    branches: [main, 'releases/**']
    paths: ['src/**', Cargo.toml]
jobs:
  build:
    runs-on: linux
    steps: [{run: echo hi}]
"#;

    #[test]
    fn test_branch_and_path_filters() {
        let matcher = matcher();
        matcher
            .upsert_workflow("acme/widgets", ".kiln/workflows/ci.yml", CI)
            .unwrap();

        // Branch and path both match.
        let runs = matcher
            .match_event(&push_event("refs/heads/main", &["src/lib.rs"]))
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].workflow_name, "CI");
        assert_eq!(runs[0].number, 1);

        // Wrong branch.
        let runs = matcher
            .match_event(&push_event("refs/heads/feature", &["src/lib.rs"]))
            .unwrap();
        assert!(runs.is_empty());

        // Right branch, wrong paths.
        let runs = matcher
            .match_event(&push_event("refs/heads/main", &["README.md"]))
            .unwrap();
        assert!(runs.is_empty());

        // Glob branch.
        let runs = matcher
            .match_event(&push_event("refs/heads/releases/v2", &["Cargo.toml"]))
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].number, 2);
    }

    #[test]
    fn test_run_numbers_are_monotonic_per_repo() {
        let matcher = matcher();
        matcher
            .upsert_workflow("acme/widgets", "ci.yml", CI)
            .unwrap();
        let event = push_event("refs/heads/main", &["src/lib.rs"]);
        let first = matcher.match_event(&event).unwrap();
        let second = matcher.match_event(&event).unwrap();
        assert!(second[0].number > first[0].number);
    }

    #[test]
    fn test_tag_filters() {
        let matcher = matcher();
        matcher
            .upsert_workflow(
                "acme/widgets",
                "release.yml",
                r#"
on:
  push:
    tags: ['v*', '!v*-rc*']
jobs:
  publish:
    runs-on: linux
    steps: [{run: echo pub}]
"#,
            )
            .unwrap();

        assert_eq!(
            matcher
                .match_event(&push_event("refs/tags/v1.2.0", &[]))
                .unwrap()
                .len(),
            1
        );
        assert!(matcher
            .match_event(&push_event("refs/tags/v1.2.0-rc1", &[]))
            .unwrap()
            .is_empty());
        // Branch pushes don't hit a tags-only workflow.
        assert!(matcher
            .match_event(&push_event("refs/heads/main", &[]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ignore_filters() {
        let matcher = matcher();
        matcher
            .upsert_workflow(
                "acme/widgets",
                "ci.yml",
                r#"
on:
  push:
    branches-ignore: [gh-pages]
jobs:
  build:
    runs-on: linux
    steps: [{run: echo hi}]
"#,
            )
            .unwrap();

        assert_eq!(
            matcher
                .match_event(&push_event("refs/heads/main", &[]))
                .unwrap()
                .len(),
            1
        );
        assert!(matcher
            .match_event(&push_event("refs/heads/gh-pages", &[]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_schedule_tick() {
        let matcher = matcher();
        matcher
            .upsert_workflow(
                "acme/widgets",
                "nightly.yml",
                r#"
on:
  schedule:
    - cron: '0 4 * * *'
jobs:
  nightly:
    runs-on: linux
    steps: [{run: echo night}]
"#,
            )
            .unwrap();

        let mut tick = push_event("refs/heads/main", &[]);
        tick.kind = EventKind::Schedule;
        tick.occurred_at = Utc.with_ymd_and_hms(2026, 3, 10, 4, 0, 0).unwrap();
        assert_eq!(matcher.match_event(&tick).unwrap().len(), 1);

        tick.occurred_at = Utc.with_ymd_and_hms(2026, 3, 10, 5, 0, 0).unwrap();
        assert!(matcher.match_event(&tick).unwrap().is_empty());
    }

    #[test]
    fn test_multiple_workflows_yield_multiple_runs() {
        let matcher = matcher();
        matcher.upsert_workflow("acme/widgets", "a.yml", CI).unwrap();
        matcher
            .upsert_workflow(
                "acme/widgets",
                "b.yml",
                "on: push\njobs:\n  b:\n    runs-on: linux\n    steps: [{run: echo b}]\n",
            )
            .unwrap();

        let runs = matcher
            .match_event(&push_event("refs/heads/main", &["src/lib.rs"]))
            .unwrap();
        assert_eq!(runs.len(), 2);
        // Each run got its own number.
        assert_ne!(runs[0].number, runs[1].number);
    }

    #[test]
    fn test_disabled_workflow_ignored() {
        let matcher = matcher();
        matcher.upsert_workflow("acme/widgets", "ci.yml", CI).unwrap();
        matcher.set_enabled("acme/widgets", "ci.yml", false);
        assert!(matcher
            .match_event(&push_event("refs/heads/main", &["src/lib.rs"]))
            .unwrap()
            .is_empty());
    }

    const DISPATCHABLE: &str = r#"
name: Deploy
on:
  workflow_dispatch:
    inputs:
      target:
        type: choice
        required: true
        options: [staging, production]
      dry-run:
        type: boolean
        default: true
jobs:
  deploy:
    runs-on: linux
    steps: [{run: echo deploy}]
"#;

    fn dispatch_event(inputs: &[(&str, Value)]) -> TriggerEvent {
        let mut event = push_event("refs/heads/main", &[]);
        event.kind = EventKind::WorkflowDispatch;
        event.workflow = Some("Deploy".into());
        event.inputs = inputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        event
    }

    #[test]
    fn test_dispatch_with_valid_inputs() {
        let matcher = matcher();
        matcher
            .upsert_workflow("acme/widgets", "deploy.yml", DISPATCHABLE)
            .unwrap();

        let runs = matcher
            .match_event(&dispatch_event(&[("target", Value::String("staging".into()))]))
            .unwrap();
        assert_eq!(runs.len(), 1);
        // The boolean default was applied into the frozen event.
        assert_eq!(runs[0].event.inputs.get("dry-run"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_dispatch_input_validation_failures() {
        let matcher = matcher();
        matcher
            .upsert_workflow("acme/widgets", "deploy.yml", DISPATCHABLE)
            .unwrap();

        // Missing required input.
        assert!(matcher.match_event(&dispatch_event(&[])).is_err());

        // Choice outside options.
        assert!(matcher
            .match_event(&dispatch_event(&[("target", Value::String("moon".into()))]))
            .is_err());

        // Type mismatch on the boolean.
        assert!(matcher
            .match_event(&dispatch_event(&[
                ("target", Value::String("staging".into())),
                ("dry-run", Value::String("yes".into())),
            ]))
            .is_err());

        // Undeclared input.
        assert!(matcher
            .match_event(&dispatch_event(&[
                ("target", Value::String("staging".into())),
                ("surprise", Value::Bool(true)),
            ]))
            .is_err());

        // No runs were created by any of the rejected dispatches.
        let store_runs = matcher.store.runs_for_repo("acme/widgets");
        assert!(store_runs.is_empty());
    }

    #[test]
    fn test_plan_failure_concludes_run_without_jobs() {
        let matcher = matcher();
        // Parses fine, but the matrix explodes past the limit at plan time.
        let axis: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let axis = axis.join(", ");
        let yaml = format!(
            "on: push\njobs:\n  big:\n    runs-on: linux\n    strategy:\n      matrix:\n        a: [{axis}]\n        b: [{axis}]\n    steps: [{{run: echo hi}}]\n"
        );
        matcher.upsert_workflow("acme/widgets", "big.yml", &yaml).unwrap();

        let runs = matcher
            .match_event(&push_event("refs/heads/main", &[]))
            .unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.conclusion, Some(RunConclusion::Failure));
        assert!(matches!(run.failure, Some(FailureReason::SetupFailed(_))));
        assert!(run.jobs.is_empty());
    }
}
