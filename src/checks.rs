//! Named pass/fail assertions evaluated against every iteration.
//!
//! A failing check is data, not control flow: predicates never abort the
//! iteration or the run. A predicate that cannot be evaluated (missing field,
//! wrong type, panic) counts as a failure.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{CheckError, LoadError, Result};
use crate::models::IterationResult;

type Predicate = Arc<dyn Fn(&IterationResult) -> std::result::Result<bool, CheckError> + Send + Sync>;

struct Check {
    name: String,
    predicate: Predicate,
}

/// Ordered set of uniquely named checks
#[derive(Clone, Default)]
pub struct CheckSet {
    checks: Vec<Arc<Check>>,
}

impl CheckSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check. Fails if the name is already taken.
    pub fn add<F>(&mut self, name: impl Into<String>, predicate: F) -> Result<()>
    where
        F: Fn(&IterationResult) -> std::result::Result<bool, CheckError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.checks.iter().any(|c| c.name == name) {
            return Err(LoadError::InvalidCheckSet(format!("duplicate check: {}", name)));
        }
        self.checks.push(Arc::new(Check {
            name,
            predicate: Arc::new(predicate),
        }));
        Ok(())
    }

    /// Chaining form of [`CheckSet::add`]
    pub fn with<F>(mut self, name: impl Into<String>, predicate: F) -> Result<Self>
    where
        F: Fn(&IterationResult) -> std::result::Result<bool, CheckError> + Send + Sync + 'static,
    {
        self.add(name, predicate)?;
        Ok(self)
    }

    /// Check names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every predicate against `result`. Total: always yields one
    /// boolean per check.
    pub fn evaluate(&self, result: &IterationResult) -> Evaluation<'_> {
        let outcomes = self
            .checks
            .iter()
            .map(|check| CheckOutcome {
                name: &check.name,
                passed: run_predicate(check, result),
            })
            .collect();
        Evaluation(outcomes)
    }

    /// Outcome used when the executor produced no result at all
    pub fn fail_all(&self) -> Evaluation<'_> {
        Evaluation(
            self.checks
                .iter()
                .map(|check| CheckOutcome {
                    name: &check.name,
                    passed: false,
                })
                .collect(),
        )
    }
}

impl std::fmt::Debug for CheckSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn run_predicate(check: &Check, result: &IterationResult) -> bool {
    let outcome = catch_unwind(AssertUnwindSafe(|| (check.predicate)(result)))
        .unwrap_or_else(|payload| Err(CheckError::Panicked(panic_message(payload.as_ref()))));

    match outcome {
        Ok(passed) => passed,
        Err(e) => {
            tracing::debug!(check = %check.name, error = %e, "Check could not be evaluated");
            false
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One check's result for one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome<'a> {
    pub name: &'a str,
    pub passed: bool,
}

/// Per-iteration outcomes, in check registration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation<'a>(Vec<CheckOutcome<'a>>);

impl<'a> Evaluation<'a> {
    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.iter().find(|o| o.name == name).map(|o| o.passed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CheckOutcome<'a>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn all_passed(&self) -> bool {
        self.0.iter().all(|o| o.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use serde_json::json;
    use std::time::Duration;

    fn ok_result(body: serde_json::Value) -> IterationResult {
        IterationResult::completed(200, body, Duration::from_millis(5))
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut checks = CheckSet::new();
        checks.add("status", |_| Ok(true)).unwrap();
        let err = checks.add("status", |_| Ok(false)).unwrap_err();
        assert!(matches!(err, LoadError::InvalidCheckSet(_)));
        assert_eq!(checks.len(), 1);
    }

    #[test]
    fn test_evaluation_preserves_order() {
        let checks = CheckSet::new()
            .with("b", |_| Ok(true))
            .unwrap()
            .with("a", |_| Ok(false))
            .unwrap();

        let evaluation = checks.evaluate(&ok_result(json!({})));
        let names: Vec<_> = evaluation.iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(evaluation.get("b"), Some(true));
        assert_eq!(evaluation.get("a"), Some(false));
        assert!(!evaluation.all_passed());
    }

    #[test]
    fn test_erroring_predicate_is_false_and_others_still_run() {
        let checks = CheckSet::new()
            .with("missing", |r| Ok(r.field("nope")?.is_null()))
            .unwrap()
            .with("present", |r| Ok(r.field("data")?.is_object()))
            .unwrap();

        let evaluation = checks.evaluate(&ok_result(json!({"data": {}})));
        assert_eq!(evaluation.get("missing"), Some(false));
        assert_eq!(evaluation.get("present"), Some(true));
    }

    #[test]
    fn test_panicking_predicate_is_false() {
        let checks = CheckSet::new()
            .with("explodes", |_| panic!("boom"))
            .unwrap()
            .with("fine", |_| Ok(true))
            .unwrap();

        let evaluation = checks.evaluate(&ok_result(json!(null)));
        assert_eq!(evaluation.get("explodes"), Some(false));
        assert_eq!(evaluation.get("fine"), Some(true));
    }

    #[test]
    fn test_evaluate_is_total_on_transport_failure() {
        let checks = CheckSet::new()
            .with("body", |r| Ok(r.json()?.is_object()))
            .unwrap()
            .with("status", |r| Ok(r.status == Some(200)))
            .unwrap();

        let failed = IterationResult::failed(TransportError::timeout("slow"), Duration::ZERO);
        let evaluation = checks.evaluate(&failed);
        assert_eq!(evaluation.len(), 2);
        assert!(evaluation.iter().all(|o| !o.passed));
    }

    #[test]
    fn test_fail_all() {
        let checks = CheckSet::new()
            .with("always", |_| Ok(true))
            .unwrap();
        let evaluation = checks.fail_all();
        assert_eq!(evaluation.get("always"), Some(false));
        assert_eq!(evaluation.get("unknown"), None);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
