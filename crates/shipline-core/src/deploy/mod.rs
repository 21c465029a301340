//! Deployment gating, post-deploy monitoring and rollback.

pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod probe;
pub mod rollback;
pub mod trigger;

pub use dispatcher::{DeployOutcome, DeployStageReached, DeploymentDispatcher};
pub use error::{DeployError, DeployResult, MonitorError, MonitorResult, RollbackError};
pub use monitor::{
    AutoRollback, DeploymentMonitor, MonitorLauncher, PollingOutcome, PollingPlan,
    RollbackDisposition,
};
pub use probe::{HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use rollback::{RollbackController, RollbackResult, RollbackStep};
pub use trigger::{DeploymentListener, DeploymentTrigger};
