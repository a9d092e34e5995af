//! Guard check capability and the short-circuit inspection pipeline.
//!
//! A [`GuardSet`] is an ordered list of named checks. [`GuardInspector`]
//! evaluates them in order and stops at the first BLOCK. A check that
//! errors or times out counts as BLOCK: content is never let through because
//! an inspector malfunctioned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use machina_types::guardrail::{GuardClass, GuardrailResult, Verdict};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A guard could not reach a verdict.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardError {
    #[error("guard backend unavailable: {0}")]
    Unavailable(String),

    #[error("guard configuration invalid: {0}")]
    InvalidConfig(String),

    #[error("guard failed: {0}")]
    Internal(String),
}

/// A BLOCK verdict surfaced as a node failure. Never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{class} guard '{guard}' blocked: {reason}")]
pub struct GuardrailViolation {
    pub class: GuardClass,
    pub guard: String,
    pub reason: String,
}

impl GuardrailViolation {
    /// Build a violation from a blocking pipeline result.
    pub fn from_result(class: GuardClass, result: &GuardrailResult) -> Self {
        Self {
            class,
            guard: result.guard.clone().unwrap_or_else(|| "unknown".to_string()),
            reason: result
                .reason
                .clone()
                .unwrap_or_else(|| "blocked".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// GuardCheck
// ---------------------------------------------------------------------------

/// A single content check (moderation, PII, allow/deny list, ...).
pub trait GuardCheck: Send + Sync + 'static {
    fn evaluate(
        &self,
        content: &str,
    ) -> impl Future<Output = Result<GuardrailResult, GuardError>> + Send;
}

/// Object-safe version of [`GuardCheck`] with boxed futures.
pub trait GuardCheckDyn: Send + Sync {
    fn evaluate_boxed<'a>(
        &'a self,
        content: &'a str,
    ) -> BoxFuture<'a, Result<GuardrailResult, GuardError>>;
}

impl<T: GuardCheck> GuardCheckDyn for T {
    fn evaluate_boxed<'a>(
        &'a self,
        content: &'a str,
    ) -> BoxFuture<'a, Result<GuardrailResult, GuardError>> {
        Box::pin(self.evaluate(content))
    }
}

/// Type-erased guard stored in registries and guard sets.
pub type BoxGuard = Arc<dyn GuardCheckDyn>;

/// Adapter turning a synchronous closure into a [`GuardCheck`].
pub struct FnGuard<F>(F);

pub fn guard_fn<F>(f: F) -> FnGuard<F>
where
    F: Fn(&str) -> Result<GuardrailResult, GuardError> + Send + Sync + 'static,
{
    FnGuard(f)
}

impl<F> GuardCheck for FnGuard<F>
where
    F: Fn(&str) -> Result<GuardrailResult, GuardError> + Send + Sync + 'static,
{
    fn evaluate(
        &self,
        content: &str,
    ) -> impl Future<Output = Result<GuardrailResult, GuardError>> + Send {
        std::future::ready((self.0)(content))
    }
}

// ---------------------------------------------------------------------------
// GuardSet
// ---------------------------------------------------------------------------

/// Ordered sequence of named guards.
#[derive(Clone, Default)]
pub struct GuardSet {
    guards: Vec<(String, BoxGuard)>,
}

impl GuardSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, guard: BoxGuard) {
        self.guards.push((name.into(), guard));
    }

    pub fn with(mut self, name: impl Into<String>, guard: impl GuardCheck) -> Self {
        self.push(name, Arc::new(guard));
        self
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.guards.iter().map(|(name, _)| name.as_str())
    }
}

impl std::fmt::Debug for GuardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ---------------------------------------------------------------------------
// GuardInspector
// ---------------------------------------------------------------------------

/// Evaluates guard sets. Stateless between calls.
#[derive(Debug, Clone, Default)]
pub struct GuardInspector {
    /// Upper bound for a single check; exceeding it blocks.
    check_timeout: Option<Duration>,
}

impl GuardInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = Some(timeout);
        self
    }

    /// Evaluate `content` against `set`.
    ///
    /// Returns the first BLOCK (with the guard's name) or ALLOW. When guards
    /// redacted the content, later guards inspect the redacted text and the
    /// final ALLOW carries it.
    pub async fn check(&self, content: &str, set: &GuardSet) -> GuardrailResult {
        let mut current = content.to_string();
        let mut redaction: Option<String> = None;

        for (name, guard) in &set.guards {
            let outcome = match self.check_timeout {
                Some(limit) => tokio::time::timeout(limit, guard.evaluate_boxed(&current))
                    .await
                    .unwrap_or_else(|_| {
                        Err(GuardError::Unavailable(format!("timed out after {limit:?}")))
                    }),
                None => guard.evaluate_boxed(&current).await,
            };

            match outcome {
                Ok(result) if result.verdict == Verdict::Block => {
                    tracing::debug!(guard = %name, reason = ?result.reason, "Guard blocked content");
                    return result.with_guard(name.clone());
                }
                Ok(result) => {
                    if let Some(rewritten) = result.redacted {
                        tracing::debug!(guard = %name, "Guard redacted content");
                        redaction = result.reason.or(redaction);
                        current = rewritten;
                    }
                }
                Err(e) => {
                    tracing::warn!(guard = %name, error = %e, "Guard check failed, blocking");
                    return GuardrailResult::block(format!("guard check failed: {e}"))
                        .with_guard(name.clone());
                }
            }
        }

        if current != content {
            GuardrailResult::redact(current, redaction.unwrap_or_else(|| "redacted".to_string()))
        } else {
            GuardrailResult::allow()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
