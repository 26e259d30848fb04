//! Remote worker dispatch.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::json;
use tracing::info;

use crate::config::WorkerDispatchConfig;
use crate::utils::http_client::ThrottledClient;
use crate::{Error, Result};

/// Starts a worker process for a group somewhere else. Fire-and-forget: a
/// successful call only means the trigger was accepted.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, group: &str) -> Result<()>;
}

/// Triggers a GitHub Actions `workflow_dispatch` whose workflow runs
/// `scheduler worker <group>`.
pub struct GithubWorkerSpawner {
    client: ThrottledClient,
    target: WorkerDispatchConfig,
}

impl GithubWorkerSpawner {
    pub fn new(client: ThrottledClient, target: WorkerDispatchConfig) -> Self {
        Self { client, target }
    }

    fn dispatch_path(&self) -> String {
        format!(
            "repos/{}/{}/actions/workflows/{}/dispatches",
            self.target.owner, self.target.repo, self.target.workflow_id
        )
    }
}

#[async_trait]
impl WorkerSpawner for GithubWorkerSpawner {
    async fn spawn(&self, group: &str) -> Result<()> {
        let request = self
            .client
            .request(Method::POST, &self.dispatch_path())
            .json(&json!({
                "ref": self.target.git_ref,
                "inputs": { "group": group },
            }));

        let response = self
            .client
            .send("dispatch worker workflow", request)
            .await
            .map_err(|e| Error::Dispatch(format!("group {group}: {e}")))?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Dispatch(format!(
                "group {group}: expected 204, got {status}: {body}"
            )));
        }

        info!(
            group,
            workflow = %self.target.workflow_id,
            repository = %format!("{}/{}", self.target.owner, self.target.repo),
            "Dispatched remote worker"
        );
        Ok(())
    }
}
