//! Shipline CI - pipeline planning and execution
//!
//! Provides the pipeline side of Shipline:
//! - Generates versioned pipeline configurations from a language profile
//! - Executes stages as shell commands with timeouts and retries
//! - Runs test suites on commits and pull requests, gating merges
//! - Orchestrates executions and hands deploy stages to the deployment layer

pub mod config;
pub mod deploy_executor;
pub mod fakes;
pub mod gate;
pub mod pipeline;
pub mod runner;
pub mod stage;
pub mod test_trigger;
pub mod webhook;

// Re-export key types
pub use config::{compute_stages_digest, ConfigurationGenerator, ConfigurationRegistry};
pub use deploy_executor::StageDeploymentExecutor;
pub use gate::{GateVerdict, MergeGate};
pub use pipeline::{ExecutionHandle, PipelineOrchestrator};
pub use runner::{CommandStageExecutor, StageContext, StageExecutor, StageResult};
pub use test_trigger::AutomatedTestTrigger;
pub use webhook::{WebhookDispatch, WebhookEvent, WebhookRoute, WebhookRouter};
