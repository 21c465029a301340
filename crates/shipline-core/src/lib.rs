//! Shipline Core Library
//!
//! Domain model, collaborator ports, deployment gating, health monitoring
//! and rollback for the Shipline pipeline orchestrator.

pub mod bus;
pub mod deploy;
pub mod domain;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod ports;
pub mod retry;
pub mod telemetry;

pub use bus::{BroadcastEventBus, TracingAuditRecorder};

pub use deploy::{
    AutoRollback, DeployError, DeployOutcome, DeployStageReached, DeploymentDispatcher,
    DeploymentListener, DeploymentMonitor, DeploymentTrigger, HealthProbe, HttpHealthProbe,
    MonitorError, MonitorLauncher, PollingOutcome, PollingPlan, ProbeOutcome,
    RollbackController, RollbackDisposition, RollbackError, RollbackResult, RollbackStep,
};

pub use domain::{
    Actor, AuditAction, AuditEntry, CheckResult, ConfigError, DeploymentPolicy,
    DeploymentRequest, DeploymentStatus, DeploymentStrategy, EnvironmentDefinition,
    HealthCheckSpec, HealthObservation, HealthSession, Language, PipelineConfiguration,
    PipelineError, PipelineEvent, PipelineExecution, PipelineSettings, PipelineStatus,
    PipelineTrigger, Platform, Result, Role, ShiplineError, Snapshot, SourceControlError,
    StageError, StageKind, StageRecord, StageStatus, StageTemplate, StepOutcome, SuiteKind,
    SuiteResult, SuiteStatus, TestExecution, TestExecutionStatus, TestPolicy, TestSuite,
    TestTrigger,
};

pub use ports::{
    AuditRecorder, DeploymentExecutor, EnvironmentCatalog, EventBus, ExecutionHistory, Issue,
    ProjectProfile, ProjectStore, SnapshotStore, SourceControlProvider, StorageError,
    StorageResult,
};

pub use retry::{retry_with_backoff, Retried, RetryPolicy};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
