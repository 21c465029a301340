//! Domain models for Shipline.
//!
//! Canonical definitions for the core entities:
//! - `PipelineConfiguration`: generated, versioned plan for a project
//! - `PipelineExecution` / `StageRecord`: one run of that plan
//! - `TestExecution`: an automated run of a project's test suites
//! - `DeploymentRequest`: approval-gated deployment of a version
//! - `HealthSession`: post-deploy monitoring state
//! - `Snapshot`: verified rollback target

pub mod actor;
pub mod config;
pub mod deployment;
pub mod error;
pub mod events;
pub mod health;
pub mod pipeline;
pub mod snapshot;
pub mod testing;

pub use actor::{Actor, Role};
pub use config::{
    DeploymentPolicy, DeploymentStrategy, EnvironmentDefinition, Language, PipelineConfiguration,
    PipelineSettings, Platform, StageKind, StageTemplate, TestPolicy,
};
pub use deployment::{DeploymentRequest, DeploymentStatus};
pub use error::{ConfigError, PipelineError, Result, ShiplineError, SourceControlError, StageError};
pub use events::{AuditAction, AuditEntry, PipelineEvent, StepOutcome};
pub use health::{CheckResult, CheckState, HealthCheckSpec, HealthObservation, HealthSession};
pub use pipeline::{PipelineExecution, PipelineStatus, PipelineTrigger, StageRecord, StageStatus};
pub use snapshot::Snapshot;
pub use testing::{
    SuiteKind, SuiteResult, SuiteStatus, TestExecution, TestExecutionStatus, TestSuite,
    TestTrigger,
};
