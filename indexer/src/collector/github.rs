//! `github-commits`: commit events for tracked GitHub repositories.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use date_range::Range;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Collector, CollectorContext, CollectorDescriptor, Schedule};
use crate::cache::TimeSeriesCache;
use crate::domain::{
    Artifact, ArtifactKey, ArtifactNamespace, ArtifactType, EventType, IncompleteEvent,
};
use crate::recorder::{EventRecorder, GenericEventTypeStrategy};
use crate::utils::http_client::ThrottledClient;
use crate::{Error, Result};

pub const COLLECTOR_NAME: &str = "github-commits";
pub const COLLECTOR_GROUP: &str = "github";

const PER_PAGE: usize = 100;

pub fn commit_code_event_type() -> EventType {
    EventType::new("COMMIT_CODE", 1)
}

/// Descriptor for registration with the scheduler.
pub fn descriptor() -> CollectorDescriptor {
    CollectorDescriptor::new(COLLECTOR_NAME, COLLECTOR_GROUP, Schedule::Daily, |context| {
        let client = ThrottledClient::from_token(
            context.config.github_token.as_deref(),
            context.config.github_api_url.clone(),
            context.config.rate_limit.clone(),
        )?;
        Ok(Box::new(GithubCommitCollector::new(client, context)))
    })
    .with_description("Collects github commits")
    .with_scope(
        [ArtifactNamespace::Github],
        [
            ArtifactType::GithubUser,
            ArtifactType::GitEmail,
            ArtifactType::GitName,
            ArtifactType::GitRepository,
        ],
    )
}

/// A commit as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: String,
    /// Committer date, or the author date when the committer is missing.
    /// The commits API filters `since`/`until` on this date.
    pub committed_at: DateTime<Utc>,
    pub author_login: Option<String>,
    pub author_email: Option<String>,
    pub author_name: Option<String>,
}

impl CommitSummary {
    /// The artifact credited with the commit: the GitHub login when the
    /// commit is linked to an account, otherwise the git email or name.
    pub fn author(&self) -> Option<ArtifactKey> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        };
        if let Some(login) = non_empty(&self.author_login) {
            return Some(ArtifactKey::new(
                ArtifactNamespace::Github,
                ArtifactType::GithubUser,
                login,
            ));
        }
        if let Some(email) = non_empty(&self.author_email) {
            return Some(ArtifactKey::new(
                ArtifactNamespace::Github,
                ArtifactType::GitEmail,
                email,
            ));
        }
        non_empty(&self.author_name)
            .map(|name| ArtifactKey::new(ArtifactNamespace::Github, ArtifactType::GitName, name))
    }
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    sha: String,
    commit: ApiCommitDetail,
    author: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiCommitDetail {
    author: Option<ApiGitActor>,
    committer: Option<ApiGitActor>,
}

#[derive(Debug, Deserialize)]
struct ApiGitActor {
    name: Option<String>,
    email: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

impl ApiCommit {
    fn into_summary(self) -> Option<CommitSummary> {
        let committed_at = self
            .commit
            .committer
            .as_ref()
            .and_then(|c| c.date)
            .or_else(|| self.commit.author.as_ref().and_then(|a| a.date))?;
        let git_author = self.commit.author;
        Some(CommitSummary {
            sha: self.sha,
            committed_at,
            author_login: self.author.map(|u| u.login),
            author_email: git_author.as_ref().and_then(|a| a.email.clone()),
            author_name: git_author.and_then(|a| a.name),
        })
    }
}

pub struct GithubCommitCollector {
    client: ThrottledClient,
    recorder: EventRecorder,
    cache: Arc<TimeSeriesCache>,
}

impl GithubCommitCollector {
    pub fn new(client: ThrottledClient, context: CollectorContext) -> Self {
        context
            .recorder
            .register_event_type(GenericEventTypeStrategy::new(commit_code_event_type()));
        Self {
            client,
            recorder: context.recorder,
            cache: context.cache,
        }
    }

    async fn fetch_commits(
        &self,
        owner: &str,
        repo: &str,
        range: Range,
    ) -> Result<Vec<CommitSummary>> {
        let operation = format!("list commits of {owner}/{repo}");
        let since = range.start().to_rfc3339_opts(SecondsFormat::Secs, true);
        let until = range.end().to_rfc3339_opts(SecondsFormat::Secs, true);
        let per_page = PER_PAGE.to_string();
        let mut commits = Vec::new();

        for page in 1u32.. {
            let page_param = page.to_string();
            let request = self
                .client
                .request(Method::GET, &format!("repos/{owner}/{repo}/commits"))
                .query(&[
                    ("since", since.as_str()),
                    ("until", until.as_str()),
                    ("per_page", per_page.as_str()),
                    ("page", page_param.as_str()),
                ]);
            let response = self.client.send(&operation, request).await?;

            match response.status() {
                // Empty repository
                StatusCode::CONFLICT => return Ok(commits),
                status if !status.is_success() => {
                    return Err(Error::HttpStatus {
                        operation,
                        status: status.as_u16(),
                        body: response.text().await.unwrap_or_default(),
                    });
                }
                _ => {}
            }

            let batch: Vec<ApiCommit> = response.json().await?;
            let fetched = batch.len();
            commits.extend(batch.into_iter().filter_map(ApiCommit::into_summary));
            debug!(owner, repo, page, fetched, "Fetched commit page");

            if fetched < PER_PAGE {
                break;
            }
        }

        Ok(commits)
    }

    async fn collect_repository(&self, artifact: &Artifact, range: &Range) -> Result<usize> {
        let Some((owner, repo)) = artifact.name.split_once('/') else {
            warn!(artifact = %artifact.name, "Repository name is not owner/repo, skipping");
            return Ok(0);
        };

        let to = artifact.key();
        let bucket = format!("{COLLECTOR_NAME}/{}", artifact.name);
        let mut recorded = 0;

        for day in range.split_by_day() {
            let entries = self
                .cache
                .load_cached_or_retrieve(&bucket, &day, |gap| {
                    self.fetch_commits(owner, repo, gap)
                })
                .await?;

            for commit in entries.into_iter().flat_map(|entry| entry.payload) {
                if !day.contains_instant(commit.committed_at) {
                    debug!(sha = %commit.sha, %day, "Commit outside the queried day, skipping");
                    continue;
                }
                let mut event = IncompleteEvent::new(
                    commit.committed_at,
                    commit_code_event_type(),
                    commit.sha.clone(),
                    to.clone(),
                    1.0,
                );
                if let Some(author) = commit.author() {
                    event = event.with_from(author);
                }
                self.recorder.record(event)?;
                recorded += 1;
            }
        }

        Ok(recorded)
    }
}

#[async_trait]
impl Collector for GithubCommitCollector {
    async fn collect(&self, artifacts: &[Artifact], range: &Range) -> Result<()> {
        for artifact in artifacts {
            if artifact.artifact_type != ArtifactType::GitRepository {
                debug!(
                    artifact = %artifact.name,
                    artifact_type = %artifact.artifact_type,
                    "Not a repository, skipping"
                );
                continue;
            }

            let recorded = self
                .collect_repository(artifact, range)
                .await
                .map_err(|e| match e {
                    Error::RateLimited { .. } | Error::Collector { .. } => e,
                    other => Error::collector(COLLECTOR_NAME, format!("{}: {other}", artifact.name)),
                })?;
            info!(repository = %artifact.name, %range, recorded, "Collected commits");
        }
        Ok(())
    }
}
