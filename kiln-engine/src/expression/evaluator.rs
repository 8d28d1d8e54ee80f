// Expression evaluator
// Total evaluation over the run context. Undefined paths yield null; runtime
// type errors come back as EvalError, never a panic.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::expression::functions;
use crate::expression::parser::{Accessor, BinaryOp, Expr};

/// Evaluation error with a structured reason string.
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

/// Outcome flags backing the `success()` / `failure()` / `cancelled()`
/// status functions, relative to the entity owning the expression.
#[derive(Debug, Clone, Copy)]
pub struct StatusFlags {
    pub success: bool,
    pub failure: bool,
    pub cancelled: bool,
}

impl Default for StatusFlags {
    fn default() -> Self {
        // Nothing has failed yet at the point of a fresh evaluation.
        Self {
            success: true,
            failure: false,
            cancelled: false,
        }
    }
}

/// The context tree expressions evaluate against.
///
/// Roots: `event`/`github`, `env`, `vars`, `matrix`, `needs`, `steps`,
/// `job`, `runner`, `secrets`, and `inputs` (dispatch inputs). Unknown roots
/// resolve to null.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Frozen event context; also exposed under the `github` alias.
    pub event: Value,
    pub env: HashMap<String, String>,
    pub vars: HashMap<String, String>,
    pub matrix: HashMap<String, Value>,
    /// `{ "<job>": { "result": ..., "outputs": {...} } }`
    pub needs: Value,
    /// `{ "<step id>": { "conclusion": ..., "outputs": {...} } }`
    pub steps: Value,
    pub job: Value,
    pub runner: Value,
    pub secrets: HashMap<String, String>,
    pub status: StatusFlags,
    /// Workspace root for `hashFiles`; empty result when unset.
    pub workspace: Option<PathBuf>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(mut self, event: Value) -> Self {
        self.event = event;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_matrix(mut self, matrix: HashMap<String, Value>) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn with_needs(mut self, needs: Value) -> Self {
        self.needs = needs;
        self
    }

    pub fn with_steps(mut self, steps: Value) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_status(mut self, status: StatusFlags) -> Self {
        self.status = status;
        self
    }

    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = Some(workspace);
        self
    }

    fn root(&self, name: &str) -> Value {
        match name {
            "event" | "github" => self.event.clone(),
            "env" => string_map_to_value(&self.env),
            "vars" => string_map_to_value(&self.vars),
            "matrix" => {
                let map: Map<String, Value> = self
                    .matrix
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(map)
            }
            "needs" => self.needs.clone(),
            "steps" => self.steps.clone(),
            "job" => self.job.clone(),
            "runner" => self.runner.clone(),
            "secrets" => string_map_to_value(&self.secrets),
            "inputs" => self.event.get("inputs").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

fn string_map_to_value(map: &HashMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Evaluate an expression against a context.
pub fn evaluate(expr: &Expr, ctx: &EvalContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(number(*n)),
        Expr::String(s) => Ok(Value::String(s.clone())),

        Expr::Reference { root, path } => {
            let mut current = ctx.root(root);
            for accessor in path {
                current = match accessor {
                    Accessor::Property(name) => lookup(&current, name),
                    Accessor::Index(index_expr) => {
                        let index = evaluate(index_expr, ctx)?;
                        match index {
                            Value::String(key) => lookup(&current, &key),
                            Value::Number(n) => match n.as_u64() {
                                Some(i) => current
                                    .get(i as usize)
                                    .cloned()
                                    .unwrap_or(Value::Null),
                                None => Value::Null,
                            },
                            _ => Value::Null,
                        }
                    }
                };
            }
            Ok(current)
        }

        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, ctx)?);
            }
            functions::call(name, values, ctx)
        }

        Expr::Not(inner) => {
            let value = evaluate(inner, ctx)?;
            Ok(Value::Bool(!truthy(&value)))
        }

        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                let l = evaluate(left, ctx)?;
                if truthy(&l) {
                    evaluate(right, ctx)
                } else {
                    Ok(l)
                }
            }
            BinaryOp::Or => {
                let l = evaluate(left, ctx)?;
                if truthy(&l) {
                    Ok(l)
                } else {
                    evaluate(right, ctx)
                }
            }
            BinaryOp::Eq => {
                let l = evaluate(left, ctx)?;
                let r = evaluate(right, ctx)?;
                Ok(Value::Bool(loosely_equal(&l, &r)))
            }
            BinaryOp::Ne => {
                let l = evaluate(left, ctx)?;
                let r = evaluate(right, ctx)?;
                Ok(Value::Bool(!loosely_equal(&l, &r)))
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let l = evaluate(left, ctx)?;
                let r = evaluate(right, ctx)?;
                // Ordered comparison against null is always false.
                if l.is_null() || r.is_null() {
                    return Ok(Value::Bool(false));
                }
                let (a, b) = (coerce_number(&l), coerce_number(&r));
                if a.is_nan() || b.is_nan() {
                    return Ok(Value::Bool(false));
                }
                let result = match op {
                    BinaryOp::Lt => a < b,
                    BinaryOp::Le => a <= b,
                    BinaryOp::Gt => a > b,
                    BinaryOp::Ge => a >= b,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
        },
    }
}

fn lookup(value: &Value, key: &str) -> Value {
    match value {
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Falsy values: null, false, 0, and the empty string.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Loose equality: null equals only null, same-type compares directly
/// (strings case-insensitively), mixed scalars compare numerically.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN) == y.as_f64().unwrap_or(f64::NAN)
        }
        (Value::Array(x), Value::Array(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => x == y,
        _ => {
            let (x, y) = (coerce_number(a), coerce_number(b));
            !x.is_nan() && !y.is_nan() && x == y
        }
    }
}

/// Numeric coercion used by ordered comparison and mixed-type equality.
pub fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(true) => 1.0,
        Value::Bool(false) => 0.0,
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// The string form used by `${{ }}` interpolation and `format`.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                n.to_string()
            }
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::ExprParser;

    fn eval(input: &str, ctx: &EvalContext) -> Value {
        let expr = ExprParser::parse_str(input).unwrap();
        evaluate(&expr, ctx).unwrap()
    }

    fn ctx_with_ref(git_ref: &str) -> EvalContext {
        EvalContext::new().with_event(serde_json::json!({ "ref": git_ref }))
    }

    #[test]
    fn test_undefined_paths_yield_null() {
        let ctx = EvalContext::new();
        assert_eq!(eval("github.nope.deeper", &ctx), Value::Null);
        assert_eq!(eval("nonsense.root", &ctx), Value::Null);
    }

    #[test]
    fn test_ref_comparison() {
        let ctx = ctx_with_ref("refs/heads/main");
        assert_eq!(eval("github.ref == 'refs/heads/main'", &ctx), Value::Bool(true));
        assert_eq!(eval("github.ref == 'refs/heads/dev'", &ctx), Value::Bool(false));
        // `event` is an alias of the same context.
        assert_eq!(eval("event.ref == 'refs/heads/main'", &ctx), Value::Bool(true));
    }

    #[test]
    fn test_null_semantics() {
        let ctx = EvalContext::new();
        assert_eq!(eval("null == null", &ctx), Value::Bool(true));
        assert_eq!(eval("github.missing == null", &ctx), Value::Bool(true));
        assert_eq!(eval("null < 1", &ctx), Value::Bool(false));
        assert_eq!(eval("null > -1", &ctx), Value::Bool(false));
    }

    #[test]
    fn test_string_equality_ignores_case() {
        let ctx = EvalContext::new();
        assert_eq!(eval("'Main' == 'main'", &ctx), Value::Bool(true));
    }

    #[test]
    fn test_boolean_operators_return_operands() {
        let ctx = ctx_with_ref("refs/heads/main");
        assert_eq!(
            eval("github.ref && 'fallback'", &ctx),
            Value::String("fallback".to_string())
        );
        assert_eq!(
            eval("github.missing || 'fallback'", &ctx),
            Value::String("fallback".to_string())
        );
    }

    #[test]
    fn test_numeric_comparison_with_coercion() {
        let ctx = EvalContext::new();
        assert_eq!(eval("3 > 2", &ctx), Value::Bool(true));
        assert_eq!(eval("'10' > 9", &ctx), Value::Bool(true));
        assert_eq!(eval("true == 1", &ctx), Value::Bool(true));
        assert_eq!(eval("'abc' > 1", &ctx), Value::Bool(false));
    }

    #[test]
    fn test_matrix_and_index_access() {
        let mut matrix = HashMap::new();
        matrix.insert("os".to_string(), Value::String("linux".to_string()));
        let ctx = EvalContext::new().with_matrix(matrix);

        assert_eq!(eval("matrix.os", &ctx), Value::String("linux".to_string()));
        assert_eq!(eval("matrix['os']", &ctx), Value::String("linux".to_string()));
    }

    #[test]
    fn test_needs_outputs() {
        let needs = serde_json::json!({
            "build": { "result": "success", "outputs": { "version": "1.2.3" } }
        });
        let ctx = EvalContext::new().with_needs(needs);
        assert_eq!(
            eval("needs.build.outputs.version", &ctx),
            Value::String("1.2.3".to_string())
        );
        assert_eq!(
            eval("needs.build.result == 'success'", &ctx),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&Value::Bool(false)));
        assert!(!truthy(&Value::String(String::new())));
        assert!(!truthy(&serde_json::json!(0)));
        assert!(truthy(&serde_json::json!(0.5)));
        assert!(truthy(&Value::String("x".to_string())));
        assert!(truthy(&serde_json::json!([])));
    }

    #[test]
    fn test_display_string() {
        assert_eq!(display_string(&Value::Null), "");
        assert_eq!(display_string(&serde_json::json!(3)), "3");
        assert_eq!(display_string(&serde_json::json!(3.5)), "3.5");
        assert_eq!(display_string(&Value::Bool(true)), "true");
        assert_eq!(display_string(&serde_json::json!(["a", "b"])), r#"["a","b"]"#);
    }
}
