//! YAML workflow definition and parsing.
//!
//! Workflows can be written as YAML documents and converted into the
//! immutable [`Workflow`] model. Conversion only checks field-level rules;
//! structural checks (cycles, dangling dependencies) stay with the validator.
//!
//! ```yaml
//! id: ingest
//! name: Nightly ingest
//! steps:
//!   - id: fetch
//!     tool: http_get
//!     params:
//!       url: "https://example.com/feed"
//!     retry:
//!       max_attempts: 3
//!       initial_delay_ms: 500
//!     timeout_ms: 10000
//!   - id: parse
//!     tool: json_parse
//!     depends_on: [fetch]
//!     params:
//!       input: "${fetch.output}"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use toolflow_core::{ExecutionMode, Parameters, RetryPolicy, Step, Workflow};

/// Workflow definition from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlWorkflow {
    /// Workflow id; a random id is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub steps: Vec<YamlStep>,
}

/// Step definition from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlStep {
    pub id: String,
    /// Tool invoked by the step
    pub tool: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: Parameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<YamlRetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Retry settings from YAML. Unset fields take [`RetryPolicy::new`] defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlRetry {
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: bool,
}

/// Errors that can occur during YAML workflow parsing.
#[derive(Error, Debug)]
pub enum YamlWorkflowError {
    /// Field-level rule violated
    #[error("Invalid workflow schema: {0}")]
    InvalidSchema(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

impl YamlRetry {
    fn to_policy(&self, step_id: &str) -> Result<RetryPolicy, YamlWorkflowError> {
        if self.max_attempts == 0 {
            return Err(YamlWorkflowError::InvalidSchema(format!(
                "step '{}': retry.max_attempts must be at least 1",
                step_id
            )));
        }

        let mut policy = RetryPolicy::new(self.max_attempts).with_jitter(self.jitter);
        if let Some(ms) = self.initial_delay_ms {
            policy = policy.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(factor) = self.backoff_factor {
            if !factor.is_finite() || factor < 1.0 {
                return Err(YamlWorkflowError::InvalidSchema(format!(
                    "step '{}': retry.backoff_factor must be >= 1.0, got {}",
                    step_id, factor
                )));
            }
            policy = policy.with_backoff_factor(factor);
        }
        if let Some(ms) = self.max_delay_ms {
            policy = policy.with_max_delay(Duration::from_millis(ms));
        }
        Ok(policy)
    }
}

impl From<&RetryPolicy> for YamlRetry {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: Some(millis(policy.initial_delay)),
            backoff_factor: Some(policy.backoff_factor),
            max_delay_ms: Some(millis(policy.max_delay)),
            jitter: policy.jitter,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TryFrom<YamlStep> for Step {
    type Error = YamlWorkflowError;

    fn try_from(yaml_step: YamlStep) -> Result<Self, Self::Error> {
        if yaml_step.id.trim().is_empty() {
            return Err(YamlWorkflowError::InvalidSchema(
                "step id must not be empty".to_string(),
            ));
        }
        if yaml_step.tool.trim().is_empty() {
            return Err(YamlWorkflowError::InvalidSchema(format!(
                "step '{}': tool must not be empty",
                yaml_step.id
            )));
        }

        let retry = yaml_step
            .retry
            .as_ref()
            .map(|retry| retry.to_policy(&yaml_step.id))
            .transpose()?;

        let mut step = Step::new(yaml_step.id, yaml_step.tool)
            .with_parameters(yaml_step.params)
            .with_dependencies(yaml_step.depends_on)
            .with_execution_mode(yaml_step.mode);
        if let Some(policy) = retry {
            step = step.with_retry(policy);
        }
        if let Some(ms) = yaml_step.timeout_ms {
            step = step.with_timeout(Duration::from_millis(ms));
        }
        for (key, value) in yaml_step.metadata {
            step = step.with_metadata(key, value);
        }
        Ok(step)
    }
}

impl TryFrom<YamlWorkflow> for Workflow {
    type Error = YamlWorkflowError;

    fn try_from(yaml_workflow: YamlWorkflow) -> Result<Self, Self::Error> {
        let mut builder = Workflow::builder(yaml_workflow.name);
        if let Some(id) = yaml_workflow.id {
            builder = builder.id(id);
        }
        if let Some(description) = yaml_workflow.description {
            builder = builder.description(description);
        }
        for (key, value) in yaml_workflow.metadata {
            builder = builder.metadata(key, value);
        }
        for yaml_step in yaml_workflow.steps {
            builder = builder.step(Step::try_from(yaml_step)?);
        }
        Ok(builder.build())
    }
}

impl From<&Workflow> for YamlWorkflow {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: Some(workflow.id().to_string()),
            name: workflow.name().to_string(),
            description: (!workflow.description().is_empty())
                .then(|| workflow.description().to_string()),
            metadata: workflow.metadata().clone(),
            steps: workflow
                .steps()
                .iter()
                .map(|step| YamlStep {
                    id: step.id().to_string(),
                    tool: step.tool_id().to_string(),
                    params: step.parameters().clone(),
                    depends_on: step.dependencies().iter().map(ToString::to_string).collect(),
                    mode: step.execution_mode(),
                    retry: step.retry_policy().map(YamlRetry::from),
                    timeout_ms: step.timeout().map(millis),
                    metadata: step.metadata().clone(),
                })
                .collect(),
        }
    }
}

/// Loads a workflow from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the YAML file
///
/// # Returns
///
/// - `Ok(Workflow)` - If workflow loaded and converted successfully
/// - `Err(YamlWorkflowError)` - If file cannot be read or YAML is invalid
///
/// # Example
///
/// ```ignore
/// use toolflow_agent::yaml::load_workflow_from_file;
///
/// let workflow = load_workflow_from_file(Path::new("workflow.yaml")).await?;
/// ```
pub async fn load_workflow_from_file(path: &Path) -> Result<Workflow, YamlWorkflowError> {
    let content = tokio::fs::read_to_string(path).await?;
    load_workflow_from_string(&content)
}

/// Loads a workflow from a YAML string.
pub fn load_workflow_from_string(yaml: &str) -> Result<Workflow, YamlWorkflowError> {
    let yaml_workflow: YamlWorkflow = serde_yaml::from_str(yaml)?;
    yaml_workflow.try_into()
}

/// Serializes a workflow to YAML.
pub fn workflow_to_yaml(workflow: &Workflow) -> Result<String, YamlWorkflowError> {
    Ok(serde_yaml::to_string(&YamlWorkflow::from(workflow))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use toolflow_core::{StepId, Value};

    const INGEST: &str = r#"
id: ingest
name: Nightly ingest
description: Pulls and parses the feed
metadata:
  owner: data
steps:
  - id: fetch
    tool: http_get
    params:
      url: "https://example.com/feed"
      retries: 3
      headers:
        accept: application/json
    retry:
      max_attempts: 3
      initial_delay_ms: 500
      jitter: true
    timeout_ms: 10000
  - id: parse
    tool: json_parse
    depends_on: [fetch]
    mode: parallel
    params:
      input: "${fetch.output}"
"#;

    #[test]
    fn test_yaml_to_workflow() {
        let workflow = load_workflow_from_string(INGEST).unwrap();

        assert_eq!(workflow.id(), "ingest");
        assert_eq!(workflow.name(), "Nightly ingest");
        assert_eq!(workflow.metadata()["owner"], "data");
        assert_eq!(workflow.step_count(), 2);

        let fetch = workflow.step(&StepId::new("fetch")).unwrap();
        assert_eq!(fetch.tool_id(), "http_get");
        assert_eq!(fetch.parameters()["retries"], Value::from(3));
        assert!(fetch.parameters()["headers"].as_map().is_some());
        assert_eq!(fetch.timeout(), Some(Duration::from_secs(10)));
        let retry = fetch.retry_policy().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert!(retry.jitter);

        let parse = workflow.step(&StepId::new("parse")).unwrap();
        assert_eq!(parse.dependencies(), &[StepId::new("fetch")]);
        assert!(parse.is_parallel());
    }

    #[test]
    fn test_missing_id_generates_one() {
        let yaml = "name: adhoc\nsteps:\n  - id: a\n    tool: noop\n";
        let workflow = load_workflow_from_string(yaml).unwrap();
        assert!(!workflow.id().is_empty());
        assert_eq!(workflow.step(&StepId::new("a")).unwrap().retry_policy(), None);
    }

    #[test]
    fn test_yaml_parse_invalid_schema() {
        let unknown_field = "name: w\nsteps:\n  - id: a\n    tool: t\n    tool_id: t\n";
        assert!(matches!(
            load_workflow_from_string(unknown_field),
            Err(YamlWorkflowError::YamlParse(_))
        ));

        let bad_mode = "name: w\nsteps:\n  - id: a\n    tool: t\n    mode: eventually\n";
        assert!(matches!(
            load_workflow_from_string(bad_mode),
            Err(YamlWorkflowError::YamlParse(_))
        ));
    }

    #[test]
    fn test_field_rules() {
        let empty_tool = "name: w\nsteps:\n  - id: a\n    tool: ''\n";
        let err = load_workflow_from_string(empty_tool).unwrap_err();
        assert!(err.to_string().contains("tool must not be empty"));

        let zero_attempts = "name: w\nsteps:\n  - id: a\n    tool: t\n    retry:\n      max_attempts: 0\n";
        assert!(matches!(
            load_workflow_from_string(zero_attempts),
            Err(YamlWorkflowError::InvalidSchema(_))
        ));

        let shrinking = "name: w\nsteps:\n  - id: a\n    tool: t\n    retry:\n      max_attempts: 2\n      backoff_factor: 0.5\n";
        assert!(matches!(
            load_workflow_from_string(shrinking),
            Err(YamlWorkflowError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_structure_is_left_to_validator() {
        let dangling = "name: w\nsteps:\n  - id: a\n    tool: t\n    depends_on: [ghost]\n";
        let workflow = load_workflow_from_string(dangling).unwrap();
        assert_eq!(workflow.steps()[0].dependencies(), &[StepId::new("ghost")]);
    }

    #[test]
    fn test_export_preserves_definition() {
        let workflow = load_workflow_from_string(INGEST).unwrap();
        let yaml = workflow_to_yaml(&workflow).unwrap();

        assert_eq!(load_workflow_from_string(&yaml).unwrap(), workflow);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ingest.yaml");
        tokio::fs::write(&path, INGEST).await.unwrap();

        let workflow = load_workflow_from_file(&path).await.unwrap();
        assert_eq!(workflow.id(), "ingest");

        let missing = load_workflow_from_file(&temp_dir.path().join("nope.yaml")).await;
        assert!(matches!(missing, Err(YamlWorkflowError::Io(_))));
    }
}
