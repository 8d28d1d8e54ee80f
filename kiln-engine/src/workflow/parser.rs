// Workflow parsing and validation
// YAML text -> normalized model, with structured line/column errors and
// resource-limit enforcement. Cycle detection happens later, in the planner.

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use crate::config::Limits;
use crate::expression;
use crate::workflow::cron::CronSchedule;
use crate::workflow::models::{InputType, Workflow};

/// Result type for parser operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Structured parse error with source location.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    /// Line number (1-indexed, 0 when unknown).
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown).
    pub column: usize,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error.
    YamlSyntax,
    /// Wrong types or missing fields.
    InvalidSchema,
    /// Semantic validation failure.
    Validation,
    /// Resource limit exceeded.
    Limit,
    /// Embedded expression does not parse.
    Expression,
    /// Dispatch input validation failure.
    Input,
}

impl ParseError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            kind: ParseErrorKind::Validation,
        }
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            kind: ParseErrorKind::Limit,
        }
    }

    pub fn expression(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            kind: ParseErrorKind::Expression,
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            kind: ParseErrorKind::Input,
        }
    }

    fn from_yaml(err: &serde_yaml::Error) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));
        Self {
            message: err.to_string(),
            line,
            column,
            kind: ParseErrorKind::YamlSyntax,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(
                f,
                "parse error at line {}:{}: {}",
                self.line, self.column, self.message
            )
        } else {
            write!(f, "parse error: {}", self.message)
        }
    }
}

impl std::error::Error for ParseError {}

/// Parser for workflow YAML.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse without semantic validation.
    pub fn parse(source: &str) -> ParseResult<Workflow> {
        serde_yaml::from_str(source).map_err(|e| ParseError::from_yaml(&e))
    }

    /// Parse and fully validate against the configured limits.
    pub fn parse_and_validate(source: &str, limits: &Limits) -> ParseResult<Workflow> {
        if source.len() > limits.max_workflow_source_bytes {
            return Err(ParseError::limit(format!(
                "workflow source is {} bytes, limit is {}",
                source.len(),
                limits.max_workflow_source_bytes
            )));
        }

        let workflow = Self::parse(source)?;
        Self::validate(&workflow, limits)?;
        Ok(workflow)
    }

    /// Semantic validation of a parsed workflow.
    pub fn validate(workflow: &Workflow, limits: &Limits) -> ParseResult<()> {
        if workflow.jobs.is_empty() {
            return Err(ParseError::validation("workflow has no jobs"));
        }
        if workflow.jobs.len() > limits.max_jobs_per_run {
            return Err(ParseError::limit(format!(
                "workflow declares {} jobs, limit is {}",
                workflow.jobs.len(),
                limits.max_jobs_per_run
            )));
        }

        Self::validate_triggers(workflow)?;

        let job_names: HashSet<&str> = workflow.jobs.names().collect();

        for (job_name, job) in workflow.jobs.iter() {
            for needed in job.needs.to_vec() {
                if !job_names.contains(needed.as_str()) {
                    return Err(ParseError::validation(format!(
                        "job '{job_name}' needs unknown job '{needed}'"
                    )));
                }
            }

            if job.steps.is_empty() {
                return Err(ParseError::validation(format!(
                    "job '{job_name}' has no steps"
                )));
            }
            if job.steps.len() > limits.max_steps_per_job {
                return Err(ParseError::limit(format!(
                    "job '{job_name}' declares {} steps, limit is {}",
                    job.steps.len(),
                    limits.max_steps_per_job
                )));
            }

            if let Some(strategy) = &job.strategy {
                if let Some(matrix) = &strategy.matrix {
                    if matrix.axes.len() > limits.max_matrix_axes {
                        return Err(ParseError::limit(format!(
                            "job '{job_name}' matrix has {} axes, limit is {}",
                            matrix.axes.len(),
                            limits.max_matrix_axes
                        )));
                    }
                    for (axis, values) in &matrix.axes {
                        for value in values {
                            if !is_json_scalar(value) {
                                return Err(ParseError::validation(format!(
                                    "matrix axis '{axis}' of job '{job_name}' has a non-scalar value"
                                )));
                            }
                        }
                    }
                }
            }

            Self::check_expr(job.if_expr.as_deref(), &format!("jobs.{job_name}.if"))?;
            for (key, value) in &job.env {
                Self::check_interpolations(value, &format!("jobs.{job_name}.env.{key}"))?;
            }
            for (key, value) in &job.outputs {
                Self::check_interpolations(value, &format!("jobs.{job_name}.outputs.{key}"))?;
            }
            if let Some(concurrency) = &job.concurrency {
                Self::check_interpolations(
                    concurrency.group(),
                    &format!("jobs.{job_name}.concurrency"),
                )?;
            }

            for (idx, step) in job.steps.iter().enumerate() {
                let at = format!("jobs.{job_name}.steps[{idx}]");

                match (&step.uses, &step.run) {
                    (Some(_), Some(_)) => {
                        return Err(ParseError::validation(format!(
                            "{at}: a step cannot have both 'uses' and 'run'"
                        )));
                    }
                    (None, None) => {
                        return Err(ParseError::validation(format!(
                            "{at}: a step needs either 'uses' or 'run'"
                        )));
                    }
                    _ => {}
                }

                Self::check_expr(step.if_expr.as_deref(), &format!("{at}.if"))?;
                if let Some(run) = &step.run {
                    Self::check_interpolations(run, &format!("{at}.run"))?;
                }
                for (key, value) in &step.env {
                    Self::check_interpolations(value, &format!("{at}.env.{key}"))?;
                }
                for (key, value) in &step.with {
                    if let Value::String(s) = value {
                        Self::check_interpolations(s, &format!("{at}.with.{key}"))?;
                    }
                }
            }
        }

        if let Some(concurrency) = &workflow.concurrency {
            Self::check_interpolations(concurrency.group(), "concurrency")?;
        }
        for value in workflow.env.values() {
            Self::check_interpolations(value, "env")?;
        }

        Ok(())
    }

    fn validate_triggers(workflow: &Workflow) -> ParseResult<()> {
        let known = [
            "push",
            "pull_request",
            "release",
            "schedule",
            "workflow_dispatch",
        ];
        for key in workflow.on.event_keys() {
            if !known.contains(&key) {
                return Err(ParseError::validation(format!(
                    "unsupported trigger event '{key}'"
                )));
            }
        }

        match workflow.on.event("schedule") {
            Some(Some(spec)) => {
                if spec.cron_entries().is_empty() {
                    return Err(ParseError::validation(
                        "schedule trigger declares no cron entries",
                    ));
                }
                for entry in spec.cron_entries() {
                    CronSchedule::parse(&entry.cron)
                        .map_err(|e| ParseError::validation(e.to_string()))?;
                }
            }
            Some(None) => {
                return Err(ParseError::validation(
                    "schedule trigger declares no cron entries",
                ));
            }
            None => {}
        }

        if let Some(Some(inputs)) = workflow
            .on
            .event("workflow_dispatch")
            .map(|spec| spec.and_then(|s| s.inputs()))
        {
            for (name, input) in inputs {
                if input.input_type == InputType::Choice && input.options.is_empty() {
                    return Err(ParseError::validation(format!(
                        "choice input '{name}' declares no options"
                    )));
                }
                if let (Some(default), InputType::Choice) = (&input.default, input.input_type) {
                    let as_str = default.as_str().unwrap_or_default();
                    if !input.options.iter().any(|o| o == as_str) {
                        return Err(ParseError::validation(format!(
                            "default for choice input '{name}' is not one of its options"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn check_expr(expr: Option<&str>, at: &str) -> ParseResult<()> {
        if let Some(expr) = expr {
            expression::parse(expression::strip_delimiters(expr))
                .map_err(|e| ParseError::expression(format!("{at}: {e}")))?;
        }
        Ok(())
    }

    fn check_interpolations(text: &str, at: &str) -> ParseResult<()> {
        for expr in expression::interpolations(text) {
            expression::parse(&expr)
                .map_err(|e| ParseError::expression(format!("{at}: {e}")))?;
        }
        Ok(())
    }
}

fn is_json_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}
