//! Restricted boolean expression evaluator for step `condition` strings.
//!
//! The grammar is closed: literals (quoted strings, numbers, `true`/`false`,
//! `null`/`undefined`, JSON arrays and objects), the comparison operators,
//! `&&`, `||`, `!` and parentheses. Variables reach an expression only
//! through `${name}` substitution, which renders them as literals, so there
//! is no identifier lookup and nothing that could execute.
//!
//! Evaluation is recursive descent over string slices, splitting at the
//! lowest-binding operator that appears at bracket depth zero and outside
//! string literals.

use checkflow_types::error::WorkflowError;
use checkflow_types::value::{Value, Variables, parse_numeric};

use super::substitute::substitute_variables;

/// Default bound on recursive descent.
pub const DEFAULT_MAX_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates condition expressions against a variable context.
#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    max_depth: usize,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl ConditionEvaluator {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Evaluate `expression`, resolving to `false` on anything malformed.
    pub fn evaluate(&self, expression: &str, context: &Variables) -> bool {
        match self.try_evaluate(expression, context) {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(expression, error = %e, "condition evaluated to false");
                false
            }
        }
    }

    /// Evaluate `expression`, reporting structural problems (unbalanced
    /// brackets, unterminated strings, empty operands, excessive nesting).
    ///
    /// Unrecognized bare tokens are not errors. On their own they evaluate
    /// to `false`; as comparison operands they compare as strings.
    pub fn try_evaluate(&self, expression: &str, context: &Variables) -> Result<bool, WorkflowError> {
        let substituted = substitute_variables(expression, context);
        self.eval(&substituted, 0)
            .map_err(|reason| WorkflowError::ConditionEvaluation {
                expression: expression.to_string(),
                reason,
            })
    }

    fn eval(&self, expr: &str, depth: usize) -> Result<bool, String> {
        if depth > self.max_depth {
            return Err(format!("nesting exceeds {} levels", self.max_depth));
        }
        let expr = expr.trim();
        if expr.is_empty() {
            return Err("empty expression".to_string());
        }

        let disjuncts = split_top_level(expr, "||")?;
        if disjuncts.len() > 1 {
            for part in disjuncts {
                if self.eval(part, depth + 1)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        let conjuncts = split_top_level(expr, "&&")?;
        if conjuncts.len() > 1 {
            for part in conjuncts {
                if !self.eval(part, depth + 1)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        if let Some(rest) = expr.strip_prefix('!') {
            if !rest.starts_with('=') {
                return Ok(!self.eval(rest, depth + 1)?);
            }
        }

        if let Some(inner) = strip_outer_parens(expr) {
            return self.eval(inner, depth + 1);
        }

        if let Some((left, op, right)) = split_comparison(expr)? {
            return Ok(compare(left, op, right));
        }

        match parse_literal(expr) {
            Some(value) => Ok(value.is_truthy()),
            None => {
                tracing::debug!(token = expr, "unrecognized token in condition");
                Ok(false)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
    Less,
}

/// Operators in match order; longer forms come before their prefixes.
const COMPARISONS: [(&str, Comparison); 8] = [
    ("===", Comparison::Equal),
    ("!==", Comparison::NotEqual),
    ("==", Comparison::Equal),
    ("!=", Comparison::NotEqual),
    (">=", Comparison::GreaterOrEqual),
    ("<=", Comparison::LessOrEqual),
    (">", Comparison::Greater),
    ("<", Comparison::Less),
];

fn split_comparison(expr: &str) -> Result<Option<(&str, Comparison, &str)>, String> {
    let offsets = top_level_offsets(expr)?;
    for (symbol, op) in COMPARISONS {
        if let Some(i) = find_at(expr, &offsets, symbol) {
            return Ok(Some((&expr[..i], op, &expr[i + symbol.len()..])));
        }
    }
    Ok(None)
}

/// `==` and `!=` compare without coercion, exactly like `===` and `!==`.
/// Relational operators coerce both sides to numbers; `NaN` compares false.
///
/// An operand that is not a literal takes part as its trimmed text, so
/// `${env} === prod` compares two strings. A missing operand is false.
fn compare(left: &str, op: Comparison, right: &str) -> bool {
    let (Some(lhs), Some(rhs)) = (comparison_operand(left), comparison_operand(right)) else {
        tracing::debug!(left, right, "comparison is missing an operand");
        return false;
    };
    match op {
        Comparison::Equal => lhs.strict_equals(&rhs),
        Comparison::NotEqual => !lhs.strict_equals(&rhs),
        Comparison::GreaterOrEqual => lhs.as_number() >= rhs.as_number(),
        Comparison::LessOrEqual => lhs.as_number() <= rhs.as_number(),
        Comparison::Greater => lhs.as_number() > rhs.as_number(),
        Comparison::Less => lhs.as_number() < rhs.as_number(),
    }
}

// ---------------------------------------------------------------------------
// Literals
// ---------------------------------------------------------------------------

fn comparison_operand(token: &str) -> Option<Value> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(parse_literal(token).unwrap_or_else(|| Value::String(token.to_string())))
}

fn parse_literal(token: &str) -> Option<Value> {
    let token = token.trim();
    match token {
        "" => return None,
        "true" => return Some(Value::Boolean(true)),
        "false" => return Some(Value::Boolean(false)),
        "null" => return Some(Value::Null),
        "undefined" => return Some(Value::Undefined),
        "NaN" => return Some(Value::Number(f64::NAN)),
        "Infinity" => return Some(Value::Number(f64::INFINITY)),
        "-Infinity" => return Some(Value::Number(f64::NEG_INFINITY)),
        _ => {}
    }

    if token.starts_with('"') {
        return serde_json::from_str::<String>(token).ok().map(Value::String);
    }
    if token.starts_with('\'') {
        return parse_single_quoted(token).map(Value::String);
    }
    if token.starts_with('[') || token.starts_with('{') {
        return serde_json::from_str::<serde_json::Value>(token)
            .ok()
            .map(Value::from);
    }
    parse_numeric(token).map(Value::Number)
}

fn parse_single_quoted(token: &str) -> Option<String> {
    let inner = token.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '\'' => return None,
            other => out.push(other),
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Byte offsets of `expr` that lie outside string literals and at bracket
/// depth zero. Fails on unbalanced brackets or an unterminated string.
fn top_level_offsets(expr: &str) -> Result<Vec<usize>, String> {
    let bytes = expr.as_bytes();
    let mut offsets = Vec::new();
    let mut depth: usize = 0;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced closing bracket".to_string())?;
            }
            _ if depth == 0 => offsets.push(i),
            _ => {}
        }
        i += 1;
    }

    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    if depth != 0 {
        return Err("unbalanced brackets".to_string());
    }
    Ok(offsets)
}

fn find_at(expr: &str, offsets: &[usize], op: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    offsets
        .iter()
        .copied()
        .find(|&i| bytes[i..].starts_with(op.as_bytes()))
}

/// Split `expr` at every top-level occurrence of `op`.
fn split_top_level<'a>(expr: &'a str, op: &str) -> Result<Vec<&'a str>, String> {
    let offsets = top_level_offsets(expr)?;
    let bytes = expr.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;

    for i in offsets {
        if i < start {
            continue;
        }
        if bytes[i..].starts_with(op.as_bytes()) {
            parts.push(&expr[start..i]);
            start = i + op.len();
        }
    }
    parts.push(&expr[start..]);
    Ok(parts)
}

/// Strip one pair of parentheses when the first `(` closes at the very end.
fn strip_outer_parens(expr: &str) -> Option<&str> {
    if !expr.starts_with('(') || !expr.ends_with(')') {
        return None;
    }
    let bytes = expr.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
        } else {
            match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' => depth += 1,
                b')' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return (i == bytes.len() - 1).then(|| &expr[1..i]);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}
