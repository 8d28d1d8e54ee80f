// Expression engine
// Lexer, parser, builtin functions, and the context evaluator, plus the
// `${{ }}` interpolation helpers used everywhere strings carry expressions.

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{
    display_string, evaluate, truthy, EvalContext, EvalError, StatusFlags,
};
pub use parser::{Expr, ExprError, ExprParser};

/// Parse a bare expression.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    ExprParser::parse_str(input)
}

/// Strip a single outer `${{ }}` wrapper when present.
///
/// `if:` values may be written either bare or wrapped; both mean the same.
pub fn strip_delimiters(input: &str) -> &str {
    let trimmed = input.trim();
    trimmed
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Extract the bodies of every `${{ }}` occurrence in a string.
pub fn interpolations(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("${{") {
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            break;
        };
        out.push(after[..end].trim().to_string());
        rest = &after[end + 2..];
    }
    out
}

/// Evaluate an expression to a boolean using the truthiness rules.
pub fn evaluate_bool(input: &str, ctx: &EvalContext) -> Result<bool, EvalError> {
    let expr = parse(strip_delimiters(input)).map_err(|e| EvalError::new(e.to_string()))?;
    let value = evaluate(&expr, ctx)?;
    Ok(truthy(&value))
}

/// Substitute every `${{ expr }}` in a string with its evaluated string form.
pub fn interpolate(text: &str, ctx: &EvalContext) -> Result<String, EvalError> {
    if !text.contains("${{") {
        return Ok(text.to_string());
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            // Unterminated marker passes through verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let body = after[..end].trim();
        let expr = parse(body).map_err(|e| EvalError::new(e.to_string()))?;
        let value = evaluate(&expr, ctx)?;
        out.push_str(&display_string(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
