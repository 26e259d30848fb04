//! Outbound HTTP: client construction and the rate-limit aware wrapper used
//! for every GitHub call (collectors and the worker spawner).

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::utils::rate_limit::{RateLimitKind, RateLimitPolicy, classify};
use crate::{Error, Result};

const USER_AGENT: &str = concat!("oso-indexer/", env!("CARGO_PKG_VERSION"));
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared `reqwest::Client`.
pub fn build_client(token: Option<&str>) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/vnd.github+json"),
    );
    headers.insert(
        "x-github-api-version",
        HeaderValue::from_static("2022-11-28"),
    );
    if let Some(token) = token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Error::config("GITHUB_TOKEN contains invalid header characters"))?;
        value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()?)
}

/// A client that transparently waits out rate limits.
///
/// 403/429 responses are classified; limited requests are retried after the
/// advertised wait until the policy budget for that kind is exhausted, which
/// yields [`Error::RateLimited`]. A 403/429 that is not a rate limit is
/// returned as [`Error::HttpStatus`]. All other responses are handed back
/// untouched.
#[derive(Clone)]
pub struct ThrottledClient {
    client: reqwest::Client,
    base_url: String,
    policy: RateLimitPolicy,
}

impl ThrottledClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, policy: RateLimitPolicy) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy,
        }
    }

    pub fn from_token(
        token: Option<&str>,
        base_url: impl Into<String>,
        policy: RateLimitPolicy,
    ) -> Result<Self> {
        Ok(Self::new(build_client(token)?, base_url, policy))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Start a request against `path`, relative to the base URL.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')))
    }

    pub async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let mut retries: HashMap<RateLimitKind, u32> = HashMap::new();

        loop {
            let attempt = request.try_clone().ok_or_else(|| {
                Error::Other(format!("{operation}: request body cannot be retried"))
            })?;
            let response = attempt.send().await?;
            let status = response.status();

            if status != reqwest::StatusCode::FORBIDDEN
                && status != reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                return Ok(response);
            }

            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            let Some(limit) = classify(status, &headers, &body, chrono::Utc::now(), &self.policy)
            else {
                return Err(Error::HttpStatus {
                    operation: operation.to_string(),
                    status: status.as_u16(),
                    body,
                });
            };

            let used = retries.entry(limit.kind).or_insert(0);
            if *used >= self.policy.max_retries(limit.kind) {
                warn!(operation, kind = %limit.kind, attempts = *used, "Rate limit retries exhausted");
                return Err(Error::RateLimited {
                    operation: operation.to_string(),
                    kind: limit.kind.to_string(),
                    attempts: *used,
                });
            }
            *used += 1;

            warn!(
                operation,
                kind = %limit.kind,
                attempt = *used,
                wait_secs = limit.wait.as_secs_f64(),
                "Rate limited, retrying"
            );
            tokio::time::sleep(limit.wait).await;
        }
    }
}
