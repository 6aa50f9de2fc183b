//! Rule declaration.
//!
//! A rule is a value carrying a stable string identity plus a body closure.
//! Calling a rule inside a session does not run the body; it creates (or
//! dedups to) a task whose fingerprint combines the rule identity with the
//! fingerprint of its canonicalised arguments. Changing the identity —
//! name or version — invalidates every cache entry recorded under it.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::session::TaskCtx;
use crate::value::Value;

pub(crate) type RuleBody =
    Arc<dyn Fn(&mut TaskCtx<'_>, &[Value]) -> anyhow::Result<Value> + Send + Sync>;

pub struct Rule {
    name: Cow<'static, str>,
    version: u32,
    identity: Arc<str>,
    body: RuleBody,
}

impl Rule {
    /// Declare a rule at version 0.
    pub fn new<F>(name: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: Fn(&mut TaskCtx<'_>, &[Value]) -> anyhow::Result<Value>
            + Send
            + Sync
            + 'static,
    {
        Self::versioned(name, 0, body)
    }

    /// Declare a rule with an explicit version tag.
    ///
    /// Bump the version whenever the body's observable behaviour changes;
    /// identical identity across deployments is the caller's contract.
    pub fn versioned<F>(name: impl Into<Cow<'static, str>>, version: u32, body: F) -> Self
    where
        F: Fn(&mut TaskCtx<'_>, &[Value]) -> anyhow::Result<Value>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let identity = format!("{name}@v{version}").into();
        Rule {
            name,
            version,
            identity,
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The stable identity string entering every task fingerprint.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn identity_arc(&self) -> Arc<str> {
        self.identity.clone()
    }

    pub(crate) fn body(&self) -> RuleBody {
        self.body.clone()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_combines_name_and_version() {
        let rule = Rule::versioned("fib", 3, |_, _| Ok(Value::Null));
        assert_eq!(rule.identity(), "fib@v3");
        assert_eq!(rule.name(), "fib");
        assert_eq!(rule.version(), 3);

        let rule = Rule::new("fib", |_, _| Ok(Value::Null));
        assert_eq!(rule.identity(), "fib@v0");
    }
}
