//! Guardrail verdicts and built-in guard specifications.

use serde::{Deserialize, Serialize};

/// Outcome of a single guard check or a whole guard set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Block,
}

/// Result of evaluating content against a guard or guard set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub verdict: Verdict,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Name of the guard that produced the verdict (set by the pipeline).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    /// Rewritten content, present when a guard redacted rather than blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted: Option<String>,
}

impl GuardrailResult {
    pub fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: None,
            guard: None,
            redacted: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Block,
            reason: Some(reason.into()),
            guard: None,
            redacted: None,
        }
    }

    /// Allow, but replace the inspected content.
    pub fn redact(content: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: Some(reason.into()),
            guard: None,
            redacted: Some(content.into()),
        }
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn is_blocked(&self) -> bool {
        self.verdict == Verdict::Block
    }
}

/// Pipeline point a guard is applied at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardClass {
    /// Before execution, on the node's resolved inputs.
    Input,
    /// After execution, on the task's result.
    Output,
    /// Before execution, on the node's declared external effect.
    Action,
}

impl std::fmt::Display for GuardClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Action => write!(f, "action"),
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in guard specs
// ---------------------------------------------------------------------------

/// What a matching guard does with the content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    #[default]
    Block,
    Redact,
}

/// PII categories recognised by the built-in detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Email,
    Phone,
    Ssn,
    CreditCard,
}

impl PiiKind {
    pub fn all() -> Vec<PiiKind> {
        vec![Self::Email, Self::Phone, Self::Ssn, Self::CreditCard]
    }
}

/// Configuration of a built-in guard, registered under a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardSpec {
    /// Case-insensitive deny-list of terms.
    Keywords {
        terms: Vec<String>,
        #[serde(default)]
        mode: GuardMode,
    },
    /// Regex-based PII detection.
    Pii {
        #[serde(default = "PiiKind::all")]
        kinds: Vec<PiiKind>,
        #[serde(default)]
        mode: GuardMode,
    },
    /// Known prompt-injection phrasings.
    PromptInjection,
    /// Upper bound on content length in characters.
    Length { max_chars: usize },
    /// Content must parse as JSON.
    JsonFormat,
    /// Allow/deny list of domains found in the content.
    DomainPolicy {
        #[serde(default)]
        allowed: Vec<String>,
        #[serde(default)]
        denied: Vec<String>,
    },
}
