//! Per-execution context and parameter resolution.
//!
//! An [`ExecutionContext`] is created when a run starts and is owned by that
//! run until it finishes. It carries the variable bag that step parameters
//! are resolved against: `${name}` references are replaced by variables,
//! and every completed step publishes its output as `<step_id>.output`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use toolflow_core::{ExecutionId, Parameters, StepId, Value};

/// Caller identity attached to a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub principal: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl SecurityContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Caller-supplied settings for one run.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    pub variables: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, String>,
    pub security: Option<SecurityContext>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a variable visible to `${name}` references.
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn security(mut self, security: SecurityContext) -> Self {
        self.security = Some(security);
        self
    }
}

/// Mutable state of one run.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub started_at: DateTime<Utc>,
    pub variables: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, String>,
    pub security: Option<SecurityContext>,
}

impl ExecutionContext {
    pub fn new(
        workflow_id: impl Into<String>,
        execution_id: ExecutionId,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            started_at: Utc::now(),
            variables: options.variables,
            metadata: options.metadata,
            security: options.security,
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Publishes a step's output as `<step_id>.output`.
    pub fn set_step_output(&mut self, step_id: &StepId, output: Value) {
        self.variables.insert(output_key(step_id), output);
    }

    pub fn step_output(&self, step_id: &StepId) -> Option<&Value> {
        self.variables.get(&output_key(step_id))
    }

    /// Resolves `${name}` references in `parameters`.
    ///
    /// A string that is exactly one reference takes the variable's value,
    /// whatever its type. References inside longer strings are replaced by
    /// the variable's display form. Unknown references stay as written.
    /// Lists and maps are resolved recursively.
    pub fn resolve(&self, parameters: &Parameters) -> Parameters {
        parameters
            .iter()
            .map(|(key, value)| (key.clone(), self.resolve_value(value)))
            .collect()
    }

    fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::List(items) => Value::List(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_string(&self, s: &str) -> Value {
        if let Some(name) = whole_reference(s) {
            if let Some(value) = self.variables.get(name) {
                return value.clone();
            }
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.variables.get(name) {
                        Some(value) => out.push_str(&value.to_string()),
                        None => out.push_str(&rest[start..start + 2 + end + 1]),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Value::String(out)
    }
}

fn output_key(step_id: &StepId) -> String {
    format!("{}.output", step_id)
}

/// Returns `name` if `s` is exactly `${name}`.
fn whole_reference(s: &str) -> Option<&str> {
    let name = s.strip_prefix("${")?.strip_suffix('}')?;
    (!name.is_empty() && !name.contains('}')).then_some(name)
}
