// Workflow YAML schema
// Serde model for the supported action-syntax subset. Normalization and
// semantic validation live in parser.rs; this file is shape only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// A workflow definition as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Display name; the source path stands in when absent.
    pub name: Option<String>,

    /// Trigger configuration.
    #[serde(rename = "on")]
    pub on: Trigger,

    /// Workflow-level environment, merged under job and step env.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Workflow-level concurrency group.
    #[serde(default)]
    pub concurrency: Option<Concurrency>,

    /// Jobs keyed by logical name, in declaration order.
    pub jobs: JobMap,
}

/// Job table that preserves YAML declaration order.
///
/// Planning instantiates jobs in the order they were written, so a plain
/// HashMap would lose information here.
#[derive(Debug, Clone, Default)]
pub struct JobMap(Vec<(String, JobSpec)>);

impl Serialize for JobMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, job) in &self.0 {
            map.serialize_entry(name, job)?;
        }
        map.end()
    }
}

impl JobMap {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&JobSpec> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, j)| j)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobSpec)> {
        self.0.iter().map(|(n, j)| (n.as_str(), j))
    }
}

impl FromIterator<(String, JobSpec)> for JobMap {
    fn from_iter<T: IntoIterator<Item = (String, JobSpec)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'de> serde::Deserialize<'de> for JobMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct JobMapVisitor;

        impl<'de> serde::de::Visitor<'de> for JobMapVisitor {
            type Value = JobMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of job name to job definition")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut jobs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, job)) = access.next_entry::<String, JobSpec>()? {
                    if jobs.iter().any(|(n, _)| *n == name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate job '{name}'"
                        )));
                    }
                    jobs.push((name, job));
                }
                Ok(JobMap(jobs))
            }
        }

        deserializer.deserialize_map(JobMapVisitor)
    }
}

/// Trigger configuration. Accepts the three source forms:
/// `on: push`, `on: [push, pull_request]`, and the detailed map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    Single(String),
    Multiple(Vec<String>),
    Detailed(HashMap<String, Option<EventSpec>>),
}

impl Trigger {
    /// Event config for a key, if the workflow subscribes to it.
    ///
    /// Returns `Some(None)` for a bare subscription with no configuration.
    pub fn event(&self, key: &str) -> Option<Option<&EventSpec>> {
        match self {
            Trigger::Single(s) => (s == key).then_some(None),
            Trigger::Multiple(keys) => keys.iter().any(|k| k == key).then_some(None),
            Trigger::Detailed(map) => map.get(key).map(|f| f.as_ref()),
        }
    }

    /// All event keys this workflow subscribes to.
    pub fn event_keys(&self) -> Vec<&str> {
        match self {
            Trigger::Single(s) => vec![s.as_str()],
            Trigger::Multiple(keys) => keys.iter().map(String::as_str).collect(),
            Trigger::Detailed(map) => map.keys().map(String::as_str).collect(),
        }
    }
}

/// The value under one `on.<event>` key.
///
/// `schedule:` carries a sequence of cron entries; everything else carries
/// the filter mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventSpec {
    Schedule(Vec<CronEntry>),
    Filter(EventFilter),
}

impl EventSpec {
    pub fn filter(&self) -> Option<&EventFilter> {
        match self {
            EventSpec::Filter(filter) => Some(filter),
            EventSpec::Schedule(_) => None,
        }
    }

    pub fn cron_entries(&self) -> &[CronEntry] {
        match self {
            EventSpec::Schedule(entries) => entries,
            EventSpec::Filter(_) => &[],
        }
    }

    pub fn inputs(&self) -> Option<&HashMap<String, DispatchInput>> {
        self.filter().map(|f| &f.inputs)
    }
}

/// Per-event filters: branch/path/tag globs (with `!` negation and the
/// `-ignore` shorthand), cron schedules, and dispatch inputs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventFilter {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, rename = "tags-ignore")]
    pub tags_ignore: Vec<String>,

    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default, rename = "paths-ignore")]
    pub paths_ignore: Vec<String>,

    /// Typed inputs for `workflow_dispatch:`.
    #[serde(default)]
    pub inputs: HashMap<String, DispatchInput>,
}

/// One `- cron: "..."` schedule entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntry {
    pub cron: String,
}

/// Input declared under `workflow_dispatch.inputs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchInput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default, rename = "type")]
    pub input_type: InputType,

    /// Allowed values for `choice` inputs.
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Boolean,
    Choice,
    Number,
}

/// Concurrency group: plain string or {group, cancel-in-progress}.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Concurrency {
    Group(String),
    Detailed {
        group: String,
        #[serde(default, rename = "cancel-in-progress")]
        cancel_in_progress: bool,
    },
}

impl Concurrency {
    pub fn group(&self) -> &str {
        match self {
            Concurrency::Group(g) => g,
            Concurrency::Detailed { group, .. } => group,
        }
    }

    pub fn cancel_in_progress(&self) -> bool {
        match self {
            Concurrency::Group(_) => false,
            Concurrency::Detailed {
                cancel_in_progress, ..
            } => *cancel_in_progress,
        }
    }
}

/// A job as written in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub name: Option<String>,

    /// Required runner label set: a single token or a list.
    #[serde(default, rename = "runs-on")]
    pub runs_on: Option<RunsOn>,

    #[serde(default)]
    pub needs: Needs,

    #[serde(default, rename = "if")]
    pub if_expr: Option<String>,

    #[serde(default)]
    pub strategy: Option<Strategy>,

    #[serde(default)]
    pub environment: Option<Environment>,

    #[serde(default)]
    pub concurrency: Option<Concurrency>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Job outputs mapped from step outputs via expressions.
    #[serde(default)]
    pub outputs: HashMap<String, String>,

    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u32>,

    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// `runs-on`: a single label or a label list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunsOn {
    Label(String),
    Labels(Vec<String>),
}

impl RunsOn {
    pub fn labels(&self) -> Vec<String> {
        match self {
            RunsOn::Label(l) => vec![l.clone()],
            RunsOn::Labels(ls) => ls.clone(),
        }
    }
}

/// `needs`: a single job name or a list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Needs {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl Needs {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Needs::None => vec![],
            Needs::Single(s) => vec![s.clone()],
            Needs::Multiple(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Needs::None) || matches!(self, Needs::Multiple(v) if v.is_empty())
    }
}

/// Matrix strategy block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: Option<Matrix>,

    #[serde(default = "default_fail_fast", rename = "fail-fast")]
    pub fail_fast: bool,

    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<u32>,
}

fn default_fail_fast() -> bool {
    true
}

/// Matrix axes plus include/exclude adjustments.
///
/// Axis keys are free-form; `include` and `exclude` are claimed as named
/// fields so the flatten only collects real axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matrix {
    #[serde(flatten)]
    pub axes: HashMap<String, Vec<Value>>,

    #[serde(default)]
    pub include: Vec<HashMap<String, Value>>,

    #[serde(default)]
    pub exclude: Vec<HashMap<String, Value>>,
}

/// Deployment environment: plain name or {name, url}.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        url: Option<String>,
    },
}

impl Environment {
    pub fn name(&self) -> &str {
        match self {
            Environment::Name(n) => n,
            Environment::Detailed { name, .. } => name,
        }
    }
}

/// A step as written in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepSpec {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, rename = "if")]
    pub if_expr: Option<String>,

    /// Action reference: `owner/name@ref` or `./local`.
    #[serde(default)]
    pub uses: Option<String>,

    #[serde(default)]
    pub with: HashMap<String, Value>,

    #[serde(default)]
    pub run: Option<String>,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,

    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u32>,
}

impl StepSpec {
    /// Display name: explicit name, else derived from the action or script.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(uses) = &self.uses {
            return format!("Run {uses}");
        }
        if let Some(run) = &self.run {
            let first = run.lines().next().unwrap_or(run);
            if first.chars().count() > 50 {
                let head: String = first.chars().take(47).collect();
                return format!("Run {head}...");
            }
            return format!("Run {first}");
        }
        "Unnamed step".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_forms() {
        let single: Trigger = serde_yaml::from_str("push").unwrap();
        assert!(single.event("push").is_some());
        assert!(single.event("release").is_none());

        let multi: Trigger = serde_yaml::from_str("[push, pull_request]").unwrap();
        assert!(multi.event("pull_request").is_some());

        let detailed: Trigger = serde_yaml::from_str(
            r#"
push:
  branches: [main, 'releases/**']
pull_request:
"#,
        )
        .unwrap();
        let filter = detailed
            .event("push")
            .unwrap()
            .unwrap()
            .filter()
            .unwrap();
        assert_eq!(filter.branches, vec!["main", "releases/**"]);
        // Bare subscription parses as no configuration at all.
        assert!(detailed.event("pull_request").unwrap().is_none());
    }

    #[test]
    fn test_schedule_entries() {
        let trigger: Trigger = serde_yaml::from_str(
            r#"
schedule:
  - cron: '0 4 * * *'
  - cron: '30 12 * * 1-5'
"#,
        )
        .unwrap();
        let spec = trigger.event("schedule").unwrap().unwrap();
        assert_eq!(spec.cron_entries().len(), 2);
        assert_eq!(spec.cron_entries()[0].cron, "0 4 * * *");
        assert!(spec.filter().is_none());
    }

    #[test]
    fn test_dispatch_inputs() {
        let trigger: Trigger = serde_yaml::from_str(
            r#"
workflow_dispatch:
  inputs:
    level:
      type: choice
      required: true
      options: [debug, release]
    dry-run:
      type: boolean
      default: false
"#,
        )
        .unwrap();
        let filter = trigger
            .event("workflow_dispatch")
            .unwrap()
            .unwrap()
            .filter()
            .unwrap();
        let level = filter.inputs.get("level").unwrap();
        assert_eq!(level.input_type, InputType::Choice);
        assert!(level.required);
        assert_eq!(level.options, vec!["debug", "release"]);

        let dry = filter.inputs.get("dry-run").unwrap();
        assert_eq!(dry.input_type, InputType::Boolean);
        assert_eq!(dry.default, Some(Value::Bool(false)));
    }

    #[test]
    fn test_concurrency_forms() {
        let simple: Concurrency = serde_yaml::from_str("deploy-prod").unwrap();
        assert_eq!(simple.group(), "deploy-prod");
        assert!(!simple.cancel_in_progress());

        let detailed: Concurrency = serde_yaml::from_str(
            r#"
group: deploy-prod
cancel-in-progress: true
"#,
        )
        .unwrap();
        assert_eq!(detailed.group(), "deploy-prod");
        assert!(detailed.cancel_in_progress());
    }

    #[test]
    fn test_runs_on_forms() {
        let single: RunsOn = serde_yaml::from_str("linux-x64").unwrap();
        assert_eq!(single.labels(), vec!["linux-x64"]);

        let multi: RunsOn = serde_yaml::from_str("[self-hosted, linux, gpu]").unwrap();
        assert_eq!(multi.labels(), vec!["self-hosted", "linux", "gpu"]);
    }

    #[test]
    fn test_matrix_axes_flatten() {
        let matrix: Matrix = serde_yaml::from_str(
            r#"
os: [linux, macos]
rust: ["1.75", "1.76"]
exclude:
  - os: macos
    rust: "1.75"
"#,
        )
        .unwrap();
        assert_eq!(matrix.axes.len(), 2);
        assert_eq!(matrix.exclude.len(), 1);
        assert!(matrix.include.is_empty());
    }

    #[test]
    fn test_step_display_name() {
        let uses = StepSpec {
            uses: Some("actions/checkout@v4".into()),
            ..Default::default()
        };
        assert_eq!(uses.display_name(), "Run actions/checkout@v4");

        let run = StepSpec {
            run: Some("echo ok".into()),
            ..Default::default()
        };
        assert_eq!(run.display_name(), "Run echo ok");
    }

    #[test]
    fn test_full_workflow_parse() {
        let yaml = r#"
name: CI
on:
  push:
    branches: [main]
env:
  CARGO_TERM_COLOR: always
concurrency:
  group: ci-${{ github.ref }}
  cancel-in-progress: true
jobs:
  build:
    runs-on: linux-x64
    steps:
      - uses: actions/checkout@v4
      - run: cargo build
  test:
    needs: build
    runs-on: [self-hosted, linux]
    timeout-minutes: 30
    strategy:
      matrix:
        rust: [stable, beta]
      fail-fast: true
      max-parallel: 2
    steps:
      - run: cargo test
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.name, Some("CI".to_string()));
        assert_eq!(workflow.jobs.len(), 2);

        let test = workflow.jobs.get("test").unwrap();
        assert_eq!(test.needs.to_vec(), vec!["build"]);
        assert_eq!(test.timeout_minutes, Some(30));
        let strategy = test.strategy.as_ref().unwrap();
        assert!(strategy.fail_fast);
        assert_eq!(strategy.max_parallel, Some(2));
    }
}
