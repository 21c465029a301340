//! In-memory fakes for collaborator traits (testing and local runs)
//!
//! Provides recorders, stores, a scriptable source control provider, a
//! scriptable deployment executor and a scriptable health probe that satisfy
//! the trait contracts without any external dependencies.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::deploy::probe::{HealthProbe, ProbeOutcome};
use crate::domain::{
    AuditAction, AuditEntry, DeploymentPolicy, DeploymentRequest, EnvironmentDefinition,
    HealthCheckSpec, PipelineEvent, PipelineExecution, Snapshot, SourceControlError,
};
use crate::ports::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryAuditRecorder / RecordingEventBus
// ---------------------------------------------------------------------------

/// Audit recorder that keeps every entry in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditRecorder {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

impl AuditRecorder for MemoryAuditRecorder {
    fn record(&self, entry: AuditEntry) {
        lock(&self.entries).push(entry);
    }
}

/// Event bus that keeps every broadcast in order.
#[derive(Debug, Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        lock(&self.events).clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<PipelineEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.topic() == topic)
            .cloned()
            .collect()
    }
}

impl EventBus for RecordingEventBus {
    fn broadcast(&self, event: PipelineEvent) {
        lock(&self.events).push(event);
    }
}

// ---------------------------------------------------------------------------
// MemoryProjectStore / MemoryEnvironmentCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: Mutex<HashMap<String, ProjectProfile>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: ProjectProfile) {
        lock(&self.projects).insert(profile.project_id.clone(), profile);
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn project(&self, project_id: &str) -> StorageResult<Option<ProjectProfile>> {
        Ok(lock(&self.projects).get(project_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEnvironmentCatalog {
    environments: Mutex<HashMap<(String, String), EnvironmentDefinition>>,
    policies: Mutex<HashMap<String, DeploymentPolicy>>,
}

impl MemoryEnvironmentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_environment(&self, project_id: &str, env: EnvironmentDefinition) {
        lock(&self.environments).insert((project_id.to_string(), env.name.clone()), env);
    }

    pub fn insert_policy(&self, project_id: &str, policy: DeploymentPolicy) {
        lock(&self.policies).insert(project_id.to_string(), policy);
    }
}

#[async_trait]
impl EnvironmentCatalog for MemoryEnvironmentCatalog {
    async fn environment(
        &self,
        project_id: &str,
        name: &str,
    ) -> StorageResult<Option<EnvironmentDefinition>> {
        Ok(lock(&self.environments)
            .get(&(project_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn deployment_policy(&self, project_id: &str) -> StorageResult<Option<DeploymentPolicy>> {
        Ok(lock(&self.policies).get(project_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryExecutionHistory
// ---------------------------------------------------------------------------

/// In-memory execution history keyed by project, in append order.
#[derive(Debug, Default)]
pub struct MemoryExecutionHistory {
    by_project: Mutex<HashMap<String, Vec<PipelineExecution>>>,
}

impl MemoryExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionHistory for MemoryExecutionHistory {
    async fn append(&self, execution: &PipelineExecution) -> StorageResult<()> {
        let mut map = lock(&self.by_project);
        let list = map.entry(execution.project_id.clone()).or_default();
        if list.iter().any(|e| e.id == execution.id) {
            return Err(StorageError::Duplicate(execution.id.to_string()));
        }
        list.push(execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &PipelineExecution) -> StorageResult<()> {
        let mut map = lock(&self.by_project);
        let slot = map
            .get_mut(&execution.project_id)
            .and_then(|list| list.iter_mut().find(|e| e.id == execution.id))
            .ok_or_else(|| StorageError::NotFound(execution.id.to_string()))?;
        *slot = execution.clone();
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> StorageResult<PipelineExecution> {
        lock(&self.by_project)
            .values()
            .flatten()
            .find(|e| e.id == execution_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(execution_id.to_string()))
    }

    async fn list(&self, project_id: &str) -> StorageResult<Vec<PipelineExecution>> {
        Ok(lock(&self.by_project)
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshotStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<Vec<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Snapshot> {
        lock(&self.snapshots).clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> StorageResult<()> {
        let mut snapshots = lock(&self.snapshots);
        if snapshots.iter().any(|s| s.id == snapshot.id) {
            return Err(StorageError::Duplicate(snapshot.id.to_string()));
        }
        snapshots.push(snapshot);
        Ok(())
    }

    async fn get(&self, snapshot_id: Uuid) -> StorageResult<Option<Snapshot>> {
        Ok(lock(&self.snapshots)
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned())
    }

    async fn latest_verified(
        &self,
        project_id: &str,
        environment: &str,
    ) -> StorageResult<Option<Snapshot>> {
        Ok(lock(&self.snapshots)
            .iter()
            .filter(|s| s.verified && s.project_id == project_id && s.environment == environment)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }

    async fn for_deployment(&self, deployment_id: Uuid) -> StorageResult<Option<Snapshot>> {
        Ok(lock(&self.snapshots)
            .iter()
            .find(|s| s.deployment_id == Some(deployment_id))
            .cloned())
    }

    async fn mark_verified(&self, snapshot_id: Uuid) -> StorageResult<()> {
        let mut snapshots = lock(&self.snapshots);
        let snap = snapshots
            .iter_mut()
            .find(|s| s.id == snapshot_id)
            .ok_or_else(|| StorageError::NotFound(snapshot_id.to_string()))?;
        snap.verified = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySourceControl
// ---------------------------------------------------------------------------

/// Every call made against [`MemorySourceControl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceControlCall {
    CreateBranch {
        branch: String,
        from_commit: String,
    },
    CreateCommit {
        branch: String,
        message: String,
        files: BTreeMap<String, String>,
    },
    CreatePullRequest {
        source_branch: String,
        target_branch: String,
        title: String,
    },
    CreateIssue {
        title: String,
    },
}

/// In-memory source control provider.
///
/// `fail_transiently(n)` makes the next `n` write calls return
/// `SourceControlError::Transient`.
#[derive(Debug, Default)]
pub struct MemorySourceControl {
    calls: Mutex<Vec<SourceControlCall>>,
    issues: Mutex<Vec<Issue>>,
    transient_failures: Mutex<u32>,
    next_number: Mutex<u64>,
}

impl MemorySourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transiently(&self, times: u32) {
        *lock(&self.transient_failures) = times;
    }

    pub fn calls(&self) -> Vec<SourceControlCall> {
        lock(&self.calls).clone()
    }

    fn check_available(&self) -> Result<(), SourceControlError> {
        let mut remaining = lock(&self.transient_failures);
        if *remaining > 0 {
            *remaining -= 1;
            return Err(SourceControlError::Transient("simulated outage".into()));
        }
        Ok(())
    }

    fn next(&self) -> u64 {
        let mut n = lock(&self.next_number);
        *n += 1;
        *n
    }
}

#[async_trait]
impl SourceControlProvider for MemorySourceControl {
    async fn create_branch(
        &self,
        _project_id: &str,
        branch: &str,
        from_commit: &str,
    ) -> Result<String, SourceControlError> {
        self.check_available()?;
        lock(&self.calls).push(SourceControlCall::CreateBranch {
            branch: branch.to_string(),
            from_commit: from_commit.to_string(),
        });
        Ok(format!("refs/heads/{branch}"))
    }

    async fn create_commit(
        &self,
        _project_id: &str,
        branch: &str,
        message: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<String, SourceControlError> {
        self.check_available()?;
        lock(&self.calls).push(SourceControlCall::CreateCommit {
            branch: branch.to_string(),
            message: message.to_string(),
            files: files.clone(),
        });
        Ok(format!("{:040x}", self.next()))
    }

    async fn create_pull_request(
        &self,
        _project_id: &str,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        _body: &str,
    ) -> Result<u64, SourceControlError> {
        self.check_available()?;
        lock(&self.calls).push(SourceControlCall::CreatePullRequest {
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            title: title.to_string(),
        });
        Ok(self.next())
    }

    async fn create_issue(
        &self,
        _project_id: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<u64, SourceControlError> {
        self.check_available()?;
        let number = self.next();
        lock(&self.calls).push(SourceControlCall::CreateIssue {
            title: title.to_string(),
        });
        lock(&self.issues).push(Issue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            labels: labels.to_vec(),
            open: true,
        });
        Ok(number)
    }

    async fn get_issues(
        &self,
        _project_id: &str,
        open_only: bool,
    ) -> Result<Vec<Issue>, SourceControlError> {
        Ok(lock(&self.issues)
            .iter()
            .filter(|i| !open_only || i.open)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedDeploymentExecutor
// ---------------------------------------------------------------------------

/// Deployment executor returning queued outcomes, then success.
#[derive(Debug, Default)]
pub struct ScriptedDeploymentExecutor {
    deploy_outcomes: Mutex<VecDeque<Result<String, String>>>,
    redeploy_outcomes: Mutex<VecDeque<Result<String, String>>>,
    deployed: Mutex<Vec<Uuid>>,
    redeployed: Mutex<Vec<String>>,
    deploy_delay: Duration,
}

impl ScriptedDeploymentExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `deploy` call sleeps for `delay` before answering.
    pub fn with_deploy_delay(mut self, delay: Duration) -> Self {
        self.deploy_delay = delay;
        self
    }

    pub fn push_deploy(&self, outcome: Result<String, String>) {
        lock(&self.deploy_outcomes).push_back(outcome);
    }

    pub fn push_redeploy(&self, outcome: Result<String, String>) {
        lock(&self.redeploy_outcomes).push_back(outcome);
    }

    /// Request ids passed to `deploy`, in call order.
    pub fn deployed(&self) -> Vec<Uuid> {
        lock(&self.deployed).clone()
    }

    /// Commits passed to `redeploy`, in call order.
    pub fn redeployed(&self) -> Vec<String> {
        lock(&self.redeployed).clone()
    }
}

#[async_trait]
impl DeploymentExecutor for ScriptedDeploymentExecutor {
    async fn deploy(&self, request: &DeploymentRequest) -> anyhow::Result<String> {
        lock(&self.deployed).push(request.id);
        if !self.deploy_delay.is_zero() {
            tokio::time::sleep(self.deploy_delay).await;
        }
        let outcome = lock(&self.deploy_outcomes)
            .pop_front()
            .unwrap_or_else(|| Ok(format!("deployed {} to {}", request.version, request.environment)));
        outcome.map_err(anyhow::Error::msg)
    }

    async fn redeploy(&self, snapshot: &Snapshot) -> anyhow::Result<String> {
        lock(&self.redeployed).push(snapshot.commit_id.clone());
        let outcome = lock(&self.redeploy_outcomes)
            .pop_front()
            .unwrap_or_else(|| Ok(format!("redeployed {}", snapshot.commit_id)));
        outcome.map_err(anyhow::Error::msg)
    }
}

// ---------------------------------------------------------------------------
// ScriptedHealthProbe
// ---------------------------------------------------------------------------

/// Health probe returning queued results per check id, then `default_pass`.
#[derive(Debug)]
pub struct ScriptedHealthProbe {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    default_pass: bool,
    probes: Mutex<Vec<String>>,
}

impl ScriptedHealthProbe {
    pub fn new(default_pass: bool) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_pass,
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, check_id: &str, results: impl IntoIterator<Item = bool>) {
        lock(&self.scripts)
            .entry(check_id.to_string())
            .or_default()
            .extend(results);
    }

    /// Check ids probed, in call order.
    pub fn probed(&self) -> Vec<String> {
        lock(&self.probes).clone()
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealthProbe {
    async fn probe(&self, check: &HealthCheckSpec) -> ProbeOutcome {
        lock(&self.probes).push(check.id.clone());
        let passed = lock(&self.scripts)
            .get_mut(&check.id)
            .and_then(|q| q.pop_front())
            .unwrap_or(self.default_pass);
        ProbeOutcome {
            passed,
            message: if passed {
                None
            } else {
                Some(format!("{} unhealthy", check.id))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_control_transient_failures_are_consumed() {
        let scm = MemorySourceControl::new();
        scm.fail_transiently(2);
        assert!(scm.create_branch("p", "b", "c").await.is_err());
        assert!(scm.create_branch("p", "b", "c").await.is_err());
        assert!(scm.create_branch("p", "b", "c").await.is_ok());
        assert_eq!(scm.calls().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_store_latest_verified_ignores_unverified() {
        let store = MemorySnapshotStore::new();
        let old = Snapshot::new("p", "production", "aaa").verified();
        store.save(old.clone()).await.unwrap();
        store
            .save(Snapshot::new("p", "production", "bbb"))
            .await
            .unwrap();
        let latest = store.latest_verified("p", "production").await.unwrap().unwrap();
        assert_eq!(latest.id, old.id);
    }

    #[tokio::test]
    async fn history_rejects_duplicate_append() {
        use crate::domain::{Actor, Role};
        let history = MemoryExecutionHistory::new();
        let cfg = crate::domain::PipelineConfiguration {
            id: Uuid::new_v4(),
            project_id: "p".into(),
            language: crate::domain::Language::Go,
            platforms: vec![],
            stages: vec![],
            environments: vec![],
            test_policy: crate::domain::TestPolicy {
                suites: vec![],
                parallel_execution: false,
                max_concurrent_suites: 1,
                fail_fast: false,
                require_passing_for_merge: false,
            },
            deployment_policy: crate::domain::DeploymentPolicy {
                strategy: crate::domain::DeploymentStrategy::Rolling,
                rollback_on_failure: false,
                health_check_interval_secs: 1,
                monitoring_window_secs: 1,
                failure_threshold: 1,
            },
            settings: Default::default(),
            created_at: chrono::Utc::now(),
            version: "1.0.0".into(),
            stages_digest: String::new(),
        };
        let exec = PipelineExecution::new(
            crate::domain::PipelineTrigger::new("p", "c", "main", Actor::new("a", Role::Admin), "development"),
            &cfg,
        );
        history.append(&exec).await.unwrap();
        assert!(matches!(
            history.append(&exec).await,
            Err(StorageError::Duplicate(_))
        ));
        assert_eq!(history.list("p").await.unwrap().len(), 1);
    }
}
