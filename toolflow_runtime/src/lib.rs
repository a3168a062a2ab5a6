//! Toolflow runtime layer - configuration, metrics and monitoring.
//!
//! This crate provides the shared runtime services the orchestrator and
//! scheduler are built on:
//!
//! - [`RuntimeConfig`]: engine settings from YAML and `TOOLFLOW_*` variables
//! - [`RuntimeMetrics`]: lock-free counters for dispatch and outcomes
//! - [`Monitor`]: live progress subscriptions and bounded execution history
//!
//! # Examples
//!
//! ```rust
//! use toolflow_runtime::{Monitor, RuntimeConfig, TimeRange};
//!
//! let config = RuntimeConfig::from_yaml_str("history_capacity: 20\n").unwrap();
//! let monitor = Monitor::from_config(&config);
//!
//! let metrics = monitor.metrics(TimeRange::all());
//! assert_eq!(metrics.total_executions, 0);
//! ```

pub mod config;
pub mod metrics;
pub mod monitor;

pub use config::{ConfigError, RuntimeConfig};
pub use metrics::{MetricKind, MetricsSummary, RuntimeMetrics};
pub use monitor::{
    AggregateMetrics, Monitor, ProgressHandler, Subscription, TimeRange, WorkflowCount,
    WorkflowLatency,
};
