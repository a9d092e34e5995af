//! Named capabilities a graph binds to: task handlers, guards, predicates.
//!
//! Bindings are resolved once at validation; a graph referencing an
//! unregistered name is rejected before any node runs.

use std::collections::HashMap;
use std::sync::Arc;

use machina_types::guardrail::GuardSpec;

use crate::guardrail::{BoxGuard, GuardCheck, GuardError, GuardSet, build_guard};
use crate::task::{BoxTaskHandler, TaskHandler};

use super::context::ExecutionContext;
use super::condition::Predicate;

#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, BoxTaskHandler>,
    guards: HashMap<String, BoxGuard>,
    predicates: HashMap<String, Predicate>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: impl TaskHandler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn register_guard(mut self, name: impl Into<String>, guard: impl GuardCheck) -> Self {
        self.guards.insert(name.into(), Arc::new(guard));
        self
    }

    pub fn register_predicate<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
        self
    }

    /// Build and register the built-in guards declared in config.
    pub fn with_guard_specs(mut self, specs: &HashMap<String, GuardSpec>) -> Result<Self, GuardError> {
        for (name, spec) in specs {
            self.guards.insert(name.clone(), build_guard(spec)?);
        }
        Ok(self)
    }

    pub fn handler(&self, name: &str) -> Option<&BoxTaskHandler> {
        self.handlers.get(name)
    }

    pub fn guard(&self, name: &str) -> Option<&BoxGuard> {
        self.guards.get(name)
    }

    pub fn predicate(&self, name: &str) -> Option<&Predicate> {
        self.predicates.get(name)
    }

    /// Ordered guard set for `names`. Unknown names are skipped; validation
    /// has already rejected them.
    pub fn guard_set(&self, names: &[String]) -> GuardSet {
        let mut set = GuardSet::new();
        for name in names {
            if let Some(guard) = self.guards.get(name) {
                set.push(name.clone(), Arc::clone(guard));
            }
        }
        set
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        let mut guards: Vec<_> = self.guards.keys().collect();
        guards.sort();
        f.debug_struct("Registry")
            .field("handlers", &handlers)
            .field("guards", &guards)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::guard_fn;
    use crate::task::handler_fn;
    use machina_types::guardrail::{GuardMode, GuardrailResult};
    use serde_json::json;

    #[test]
    fn guard_set_preserves_declared_order() {
        let registry = Registry::new()
            .register_guard("a", guard_fn(|_| Ok(GuardrailResult::allow())))
            .register_guard("b", guard_fn(|_| Ok(GuardrailResult::allow())));

        let set = registry.guard_set(&["b".to_string(), "a".to_string()]);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn specs_become_guards() {
        let mut specs = HashMap::new();
        specs.insert(
            "profanity".to_string(),
            GuardSpec::Keywords {
                terms: vec!["darn".into()],
                mode: GuardMode::Block,
            },
        );
        let registry = Registry::new().with_guard_specs(&specs).unwrap();
        assert!(registry.guard("profanity").is_some());
        assert!(registry.guard("other").is_none());
    }

    #[test]
    fn handlers_are_looked_up_by_name() {
        let registry = Registry::new()
            .register_handler("echo", handler_fn(|inputs, _| async move { Ok(json!(inputs)) }));
        assert!(registry.handler("echo").is_some());
        assert!(registry.handler("missing").is_none());
    }
}
