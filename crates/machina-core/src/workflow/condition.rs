//! Edge and node condition evaluation.
//!
//! `key_equals` and `key_present` read the context directly. `expression`
//! conditions are JEXL evaluated against
//! [`ExecutionContext::to_expression_context`]; context values are passed
//! as data and never spliced into the expression text. `predicate` looks up
//! a registered capability.

use std::sync::Arc;

use jexl_eval::error::EvaluationError;
use serde_json::{Value, json};

use machina_types::graph::EdgeCondition;

use super::context::ExecutionContext;
use super::registry::Registry;

/// Registered condition capability.
pub type Predicate = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("expression '{expr}' failed: {reason}")]
    Expression { expr: String, reason: String },

    #[error("unknown predicate '{0}'")]
    UnknownPredicate(String),
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluates [`EdgeCondition`]s.
pub struct ConditionEvaluator {
    jexl: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let jexl = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
            .with_transform("contains", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(items)) => items.len(),
                    Some(Value::Object(map)) => map.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });
        Self { jexl }
    }

    /// Evaluate `condition` against `ctx`.
    pub fn evaluate(
        &self,
        condition: &EdgeCondition,
        ctx: &ExecutionContext,
        registry: &Registry,
    ) -> Result<bool, ConditionError> {
        match condition {
            EdgeCondition::KeyEquals { key, value } => Ok(ctx.get(key) == Some(value)),
            EdgeCondition::KeyPresent { key } => {
                Ok(ctx.get(key).is_some_and(|v| !v.is_null()))
            }
            EdgeCondition::Expression { expr } => {
                let scope = ctx.to_expression_context();
                self.jexl
                    .eval_in_context(expr, &scope)
                    .map(|v| truthy(&v))
                    .map_err(|e| ConditionError::Expression {
                        expr: expr.clone(),
                        reason: e.to_string(),
                    })
            }
            EdgeCondition::Predicate { name } => registry
                .predicate(name)
                .map(|predicate| predicate(ctx))
                .ok_or_else(|| ConditionError::UnknownPredicate(name.clone())),
        }
    }

    /// Reject expressions that do not parse. Runtime type errors against
    /// an empty scope are accepted; they depend on run data.
    pub fn check_syntax(&self, expr: &str) -> Result<(), String> {
        match self.jexl.eval_in_context(expr, json!({})) {
            Err(e @ EvaluationError::ParseError(_)) => Err(e.to_string()),
            _ => Ok(()),
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionEvaluator").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("g")
            .with_value("review", json!({ "verdict": "approve", "score": 7 }))
            .with_value("title", json!("Weekly Digest"))
            .with_value("empty", Value::Null)
    }

    #[test]
    fn key_equals_and_present() {
        let eval = ConditionEvaluator::new();
        let registry = Registry::new();
        let c = ctx();

        let approved = EdgeCondition::KeyEquals {
            key: "review.verdict".into(),
            value: json!("approve"),
        };
        assert!(eval.evaluate(&approved, &c, &registry).unwrap());

        let rejected = EdgeCondition::KeyEquals {
            key: "review.verdict".into(),
            value: json!("reject"),
        };
        assert!(!eval.evaluate(&rejected, &c, &registry).unwrap());

        let present = |key: &str| EdgeCondition::KeyPresent { key: key.into() };
        assert!(eval.evaluate(&present("title"), &c, &registry).unwrap());
        assert!(!eval.evaluate(&present("empty"), &c, &registry).unwrap());
        assert!(!eval.evaluate(&present("missing"), &c, &registry).unwrap());
    }

    #[test]
    fn expressions_with_transforms() {
        let eval = ConditionEvaluator::new();
        let registry = Registry::new();
        let c = ctx();

        let cases = [
            ("review.score > 5", true),
            ("review.verdict == 'approve' && review.score < 5", false),
            ("title|lower|contains('digest')", true),
            ("title|length == 13", true),
            ("run.graph == 'g'", true),
        ];
        for (expr, expected) in cases {
            let cond = EdgeCondition::Expression { expr: expr.into() };
            assert_eq!(eval.evaluate(&cond, &c, &registry).unwrap(), expected, "{expr}");
        }
    }

    #[test]
    fn predicates_from_registry() {
        let eval = ConditionEvaluator::new();
        let registry = Registry::new().register_predicate("high_score", |ctx: &ExecutionContext| {
            ctx.get("review.score").and_then(Value::as_i64).unwrap_or(0) > 5
        });

        let cond = EdgeCondition::Predicate { name: "high_score".into() };
        assert!(eval.evaluate(&cond, &ctx(), &registry).unwrap());

        let unknown = EdgeCondition::Predicate { name: "nope".into() };
        assert_eq!(
            eval.evaluate(&unknown, &ctx(), &registry),
            Err(ConditionError::UnknownPredicate("nope".into()))
        );
    }

    #[test]
    fn syntax_check() {
        let eval = ConditionEvaluator::new();
        assert!(eval.check_syntax("review.score > 5").is_ok());
        // Runtime failures against the empty scope depend on run data.
        assert!(eval.check_syntax("missing + 1").is_ok());
        assert!(eval.check_syntax("'parse' == review.status").is_ok());

        for broken in ["review.score >", "(a == 1", "a === 1 ]"] {
            let reason = eval.check_syntax(broken).unwrap_err();
            assert!(reason.starts_with("Parsing error"), "{broken}: {reason}");
        }
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([])));
    }
}
