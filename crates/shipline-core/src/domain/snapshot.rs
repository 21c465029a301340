//! Restorable environment snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A captured state of an environment: git commit, config files and a data
/// backup reference. Only `verified` snapshots are valid rollback targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub project_id: String,
    pub environment: String,
    pub commit_id: String,
    /// Config file path → contents.
    pub config_files: BTreeMap<String, String>,
    pub data_backup_ref: Option<String>,
    pub verified: bool,
    /// Deployment that produced this state, if known.
    pub deployment_id: Option<Uuid>,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        project_id: impl Into<String>,
        environment: impl Into<String>,
        commit_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            environment: environment.into(),
            commit_id: commit_id.into(),
            config_files: BTreeMap::new(),
            data_backup_ref: None,
            verified: false,
            deployment_id: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_config_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.config_files.insert(path.into(), contents.into());
        self
    }

    pub fn verified(mut self) -> Self {
        self.verified = true;
        self
    }

    /// First 8 characters of the commit id.
    pub fn short_commit(&self) -> &str {
        &self.commit_id[..8.min(self.commit_id.len())]
    }
}
