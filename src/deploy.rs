use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};
use tracing::{debug, error, info};

use crate::config::RepositoryConfig;

pub mod audit;
pub use audit::AuditLog;

pub mod executor;
pub use executor::Executor;

/// A deployment the webhook handler decided to run.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Registry key of the repository
    pub identifier: String,
    /// Repository name as reported by the hosting service
    pub repo_name: String,
    pub branch: String,
    pub commit_id: Option<String>,
    pub commit_message: Option<String>,
    pub config: Arc<RepositoryConfig>,
}

impl DeployRequest {
    /// Variables added to our own environment when running the deploy script.
    pub fn environment(&self) -> Vec<(&'static str, String)> {
        vec![
            ("REPO_NAME", self.repo_name.clone()),
            ("BRANCH", self.branch.clone()),
            ("PROJECT_NAME", self.config.project_name.clone()),
            ("DEPLOY_TIMESTAMP", Utc::now().timestamp_millis().to_string()),
            (
                "COMMIT_ID",
                self.commit_id.clone().unwrap_or_else(|| "unknown".to_owned()),
            ),
            (
                "COMMIT_MESSAGE",
                self.commit_message
                    .clone()
                    .unwrap_or_else(|| "No message".to_owned()),
            ),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Success,
    Failed,
    Error,
}

impl Display for DeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcome of one deployment attempt, as written to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub timestamp: DateTime<Utc>,
    pub repository: String,
    pub branch: String,
    pub status: DeployStatus,
    pub message: String,
}

impl DeploymentRecord {
    pub fn now(
        repository: impl Into<String>,
        branch: impl Into<String>,
        status: DeployStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            repository: repository.into(),
            branch: branch.into(),
            status,
            message: message.into(),
        }
    }
}

/// Runs deployments handed over by the webhook handlers and records their outcome.
pub struct Deployer {
    executor: Executor,
    audit: AuditLog,
    serialize_per_repository: bool,
    // one lock per repository identifier, created on first use
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Deployer {
    pub fn new(executor: Executor, audit: AuditLog, serialize_per_repository: bool) -> Self {
        Self {
            executor,
            audit,
            serialize_per_repository,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Start receiving deploy requests.
    ///
    /// Every request gets its own task, so a long deployment never delays the others. Returns
    /// once all senders are dropped.
    pub async fn run(self: Arc<Self>, mut requests: UnboundedReceiver<DeployRequest>) {
        debug!("running...");

        loop {
            let request = match requests.recv().await {
                Some(request) => request,
                None => {
                    info!("all channel senders were dropped, exiting receive loop");
                    break;
                }
            };
            debug!("received deploy request: {:?}", request.identifier);

            self.spawn(request);
        }
    }

    pub fn spawn(self: &Arc<Self>, request: DeployRequest) -> JoinHandle<DeploymentRecord> {
        let deployer = Arc::clone(self);
        tokio::spawn(async move { deployer.deploy(request).await })
    }

    /// Runs one deployment and appends its record to the audit log. An audit failure is only
    /// logged, it doesn't change the outcome.
    pub async fn deploy(&self, request: DeployRequest) -> DeploymentRecord {
        let _guard = match self.repository_lock(&request.identifier) {
            Some(lock) => {
                debug!("waiting for previous deployments of {}", request.identifier);
                Some(lock.lock_owned().await)
            }
            None => None,
        };

        info!(
            "starting deployment for {} ({} on {})",
            request.config.project_name, request.repo_name, request.branch
        );
        let record = self.executor.execute(&request).await;

        if let Err(e) = self.audit.append(&record).await {
            error!("failed to write deployment log: {}", e);
        }

        record
    }

    fn repository_lock(&self, identifier: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        if !self.serialize_per_repository {
            return None;
        }

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Some(Arc::clone(locks.entry(identifier.to_owned()).or_default()))
    }
}
