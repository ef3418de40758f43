use std::collections::BTreeMap;

use gauntlet_core::config::GateCondition;
use gauntlet_core::types::StageOutcome;

use crate::context::WorkflowContext;
use crate::memory::WorkflowMemory;

/// Result of evaluating a gate condition.
#[derive(Debug, Clone, PartialEq)]
pub struct GateEvaluation {
    pub passed: bool,
    /// Numeric score when the condition computes one.
    pub score: Option<f64>,
}

impl GateEvaluation {
    fn pass(passed: bool) -> Self {
        Self {
            passed,
            score: None,
        }
    }
}

/// Text and structured views of a gate's source stage.
struct SourceView {
    raw: String,
    derived: serde_json::Value,
    skipped: bool,
}

/// Resolve `source` to its latest result in the context, falling back to memory.
fn resolve_source(source: &str, ctx: &WorkflowContext, memory: &WorkflowMemory) -> Option<SourceView> {
    if let Some(result) = ctx.latest(source) {
        return Some(SourceView {
            raw: result.raw.clone(),
            derived: result.derived.clone(),
            skipped: result.outcome == StageOutcome::Skipped,
        });
    }
    memory.get(source).map(|value| SourceView {
        raw: value.raw(),
        derived: value.derived().clone(),
        skipped: false,
    })
}

/// Evaluate `condition` against the run context and workflow memory.
pub fn evaluate_gate(
    condition: &GateCondition,
    ctx: &WorkflowContext,
    memory: &WorkflowMemory,
) -> GateEvaluation {
    match condition {
        GateCondition::Always => GateEvaluation::pass(true),
        GateCondition::Expr { expr } => GateEvaluation::pass(evaluate_expr(expr, ctx.scratch())),
        GateCondition::ScoreAtLeast {
            source,
            field,
            threshold,
        } => {
            let score = resolve_source(source, ctx, memory)
                .and_then(|s| lookup_path(&s.derived, field).and_then(as_number));
            GateEvaluation {
                passed: score.is_some_and(|s| s >= *threshold),
                score,
            }
        }
        GateCondition::ContainsTerms {
            source,
            terms,
            min_ratio,
        } => {
            let Some(view) = resolve_source(source, ctx, memory) else {
                return GateEvaluation {
                    passed: false,
                    score: Some(0.0),
                };
            };
            let ratio = term_ratio(&view.raw, terms);
            GateEvaluation {
                passed: ratio >= *min_ratio,
                score: Some(ratio),
            }
        }
        GateCondition::NotEmpty { source } => GateEvaluation::pass(
            resolve_source(source, ctx, memory).is_some_and(|v| !v.skipped && !is_empty(&v)),
        ),
        GateCondition::MemoryHit { key } => GateEvaluation::pass(memory.get(key).is_some()),
    }
}

/// Fraction of `terms` found case-insensitively in `text`. No terms counts as 1.0.
pub fn term_ratio(text: &str, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 1.0;
    }
    let haystack = text.to_lowercase();
    let found = terms
        .iter()
        .filter(|t| haystack.contains(&t.to_lowercase()))
        .count();
    found as f64 / terms.len() as f64
}

fn is_empty(view: &SourceView) -> bool {
    let derived_empty = match &view.derived {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    };
    derived_empty && view.raw.trim().is_empty()
}

fn as_number(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Index into nested objects with a dotted path (`verdict`, `review.score`).
fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .try_fold(value, |v, segment| v.as_object().and_then(|o| o.get(segment)))
}

/// Evaluate a simple conditional expression against stage outputs.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Dotted keys index into a stage's derived object (`analysis.verdict`).
/// Numbers and booleans compare by their JSON text. Returns `false` for
/// unparseable expressions or missing keys.
pub fn evaluate_expr(expr: &str, scratch: &BTreeMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    let resolve = |key: &str| -> Option<String> {
        let (head, rest) = match key.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (key, None),
        };
        let root = scratch.get(head)?;
        let value = match rest {
            Some(path) => lookup_path(root, path)?,
            None => root,
        };
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    };

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return resolve(key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return resolve(key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return resolve(key).is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}
