//! A task: a future specialised to a rule invocation.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::future::Future;
use crate::hash::Hash;
use crate::rule::{Rule, RuleBody};
use crate::value::Value;

const LABEL_ARGS_MAX: usize = 50;

pub(crate) struct Task {
    pub fingerprint: Hash,
    pub rule_id: std::sync::Arc<str>,
    pub body: RuleBody,
    /// Canonicalised arguments; may embed future references.
    pub input: Value,
    pub input_hash: Hash,
    pub label: String,
    pub future: Future,
    /// Whether the body has been invoked (or skipped via the cache).
    pub has_run: bool,
    /// Return value still embedding unresolved futures; substituted and
    /// promoted to the result once they are all done.
    pub pending_result: Option<Value>,
    /// Tasks created by this task's body, in creation order.
    pub side_tasks: Vec<Hash>,
    /// Plugin-attached metadata.
    pub meta: BTreeMap<String, String>,
    /// Plugin override: run the body even when a cached result exists.
    pub force_run: bool,
    /// This session holds the cache claim for the fingerprint.
    pub claim_held: bool,
    /// Set at run start; drives the optional per-task budget.
    pub started: Option<Instant>,
}

impl Task {
    pub fn new(rule: &Rule, input: Value, input_hash: Hash, fingerprint: Hash) -> Self {
        let label = render_label(rule.name(), &input);
        Task {
            fingerprint,
            rule_id: rule.identity_arc(),
            body: rule.body(),
            input,
            input_hash,
            label,
            future: Future::new(),
            has_run: false,
            pending_result: None,
            side_tasks: Vec::new(),
            meta: BTreeMap::new(),
            force_run: false,
            claim_held: false,
            started: None,
        }
    }
}

/// Human-readable `rule(args…)` string for logs and errors.
fn render_label(name: &str, input: &Value) -> String {
    let args = match input {
        Value::Seq(items) => {
            let rendered = items
                .iter()
                .map(|item| item.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            if rendered.len() < LABEL_ARGS_MAX {
                rendered
            } else {
                "...".to_string()
            }
        }
        other => other.to_string(),
    };
    format!("{name}({args})")
}
