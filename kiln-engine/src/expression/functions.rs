// Builtin expression functions
// The fixed vocabulary: contains, startsWith, endsWith, format, join,
// toJSON, fromJSON, hashFiles, always, success, failure, cancelled.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::expression::evaluator::{display_string, loosely_equal, EvalContext, EvalError};
use crate::workflow::glob::Glob;

/// Dispatch a call by (case-insensitive) function name.
pub fn call(name: &str, args: Vec<Value>, ctx: &EvalContext) -> Result<Value, EvalError> {
    match name.to_ascii_lowercase().as_str() {
        "contains" => fn_contains(args),
        "startswith" => fn_starts_with(args),
        "endswith" => fn_ends_with(args),
        "format" => fn_format(args),
        "join" => fn_join(args),
        "tojson" => fn_to_json(args),
        "fromjson" => fn_from_json(args),
        "hashfiles" => fn_hash_files(args, ctx),
        "always" => Ok(Value::Bool(true)),
        "success" => Ok(Value::Bool(ctx.status.success)),
        "failure" => Ok(Value::Bool(ctx.status.failure)),
        "cancelled" => Ok(Value::Bool(ctx.status.cancelled)),
        other => Err(EvalError::new(format!("unknown function '{other}'"))),
    }
}

fn require(args: &[Value], count: usize, name: &str) -> Result<(), EvalError> {
    if args.len() != count {
        return Err(EvalError::new(format!(
            "{name}() takes {count} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn fn_contains(args: Vec<Value>) -> Result<Value, EvalError> {
    require(&args, 2, "contains")?;
    match &args[0] {
        Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| loosely_equal(i, &args[1])))),
        haystack => {
            let haystack = display_string(haystack).to_ascii_lowercase();
            let needle = display_string(&args[1]).to_ascii_lowercase();
            Ok(Value::Bool(haystack.contains(&needle)))
        }
    }
}

fn fn_starts_with(args: Vec<Value>) -> Result<Value, EvalError> {
    require(&args, 2, "startsWith")?;
    let text = display_string(&args[0]).to_ascii_lowercase();
    let prefix = display_string(&args[1]).to_ascii_lowercase();
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn fn_ends_with(args: Vec<Value>) -> Result<Value, EvalError> {
    require(&args, 2, "endsWith")?;
    let text = display_string(&args[0]).to_ascii_lowercase();
    let suffix = display_string(&args[1]).to_ascii_lowercase();
    Ok(Value::Bool(text.ends_with(&suffix)))
}

/// `format('{0} on {1}', a, b)` with `{{`/`}}` escapes.
fn fn_format(args: Vec<Value>) -> Result<Value, EvalError> {
    let Some((template, rest)) = args.split_first() else {
        return Err(EvalError::new("format() needs a template argument"));
    };
    let template = display_string(template);

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut index_text = String::new();
                for digit in chars.by_ref() {
                    if digit == '}' {
                        break;
                    }
                    index_text.push(digit);
                }
                let index: usize = index_text
                    .trim()
                    .parse()
                    .map_err(|_| EvalError::new(format!("bad format placeholder '{{{index_text}}}'")))?;
                let value = rest
                    .get(index)
                    .ok_or_else(|| EvalError::new(format!("format() has no argument {index}")))?;
                out.push_str(&display_string(value));
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                }
                out.push('}');
            }
            c => out.push(c),
        }
    }

    Ok(Value::String(out))
}

/// `join(array, separator?)`, separator defaults to a comma.
fn fn_join(mut args: Vec<Value>) -> Result<Value, EvalError> {
    if args.is_empty() || args.len() > 2 {
        return Err(EvalError::new("join() takes 1 or 2 arguments"));
    }
    let separator = if args.len() == 2 {
        display_string(&args.pop().unwrap_or(Value::Null))
    } else {
        ",".to_string()
    };
    let joined = match &args[0] {
        Value::Array(items) => items
            .iter()
            .map(display_string)
            .collect::<Vec<_>>()
            .join(&separator),
        single => display_string(single),
    };
    Ok(Value::String(joined))
}

fn fn_to_json(args: Vec<Value>) -> Result<Value, EvalError> {
    require(&args, 1, "toJSON")?;
    serde_json::to_string_pretty(&args[0])
        .map(Value::String)
        .map_err(|e| EvalError::new(format!("toJSON() failed: {e}")))
}

fn fn_from_json(args: Vec<Value>) -> Result<Value, EvalError> {
    require(&args, 1, "fromJSON")?;
    let text = display_string(&args[0]);
    serde_json::from_str(&text).map_err(|e| EvalError::new(format!("fromJSON() failed: {e}")))
}

/// Hash workspace files matching the glob arguments.
///
/// Returns the hex sha-256 over the per-file digests in sorted path order,
/// or the empty string when nothing matches or no workspace is attached.
fn fn_hash_files(args: Vec<Value>, ctx: &EvalContext) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::new("hashFiles() needs at least one pattern"));
    }
    let Some(root) = &ctx.workspace else {
        return Ok(Value::String(String::new()));
    };

    let globs: Vec<Glob> = args.iter().map(|a| Glob::new(&display_string(a))).collect();

    let mut paths = Vec::new();
    collect_files(root, root, &mut paths);
    paths.sort();

    let mut matched = false;
    let mut outer = Sha256::new();
    for path in paths {
        if globs.iter().any(|g| g.matches(&path)) {
            let full = root.join(&path);
            let bytes = std::fs::read(&full)
                .map_err(|e| EvalError::new(format!("hashFiles() read {path}: {e}")))?;
            let mut inner = Sha256::new();
            inner.update(&bytes);
            outer.update(inner.finalize());
            matched = true;
        }
    }

    if matched {
        Ok(Value::String(format!("{:x}", outer.finalize())))
    } else {
        Ok(Value::String(String::new()))
    }
}

fn collect_files(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}
