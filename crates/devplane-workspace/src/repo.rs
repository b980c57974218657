//! Repository access collaborator
//!
//! The orchestrator never talks to the Git host directly. It asks a
//! [`RepositoryAccess`] whether the caller may read a repository, which URL
//! the clone init container should use, and which branch to default to.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// Username placed in clone URLs; the Git host authenticates on the token
const CLONE_URL_USER: &str = "oauth2";

/// Default timeout for Git host API calls
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Authenticated caller as handed over by the API layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Raw identity (user name or email); sanitized for resource names
    pub identity: String,
    /// Bearer token forwarded to the Git host; empty for anonymous access
    pub credential: String,
}

impl CallerIdentity {
    /// Create a caller identity
    pub fn new(identity: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            credential: credential.into(),
        }
    }
}

/// Git host failures
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The request never got a response
    #[error("request to {url} failed: {message}")]
    Request {
        /// Request URL
        url: String,
        /// Transport error
        message: String,
    },

    /// The host answered with an unexpected status
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Request URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The body could not be decoded or used
    #[error("invalid response from {url}: {message}")]
    InvalidResponse {
        /// Request or clone URL
        url: String,
        /// Decoding error
        message: String,
    },

    /// The repository is missing or hidden from the caller
    #[error("repository {repository} not found or not readable")]
    NotFound {
        /// `owner/name`
        repository: String,
    },

    /// The configured base URL is unusable
    #[error("invalid base URL {url}: {message}")]
    Config {
        /// Base URL as configured
        url: String,
        /// Parse error
        message: String,
    },
}

impl RepositoryError {
    /// Transport failures and server errors may clear up on their own
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Repository access and clone URL resolution
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepositoryAccess: Send + Sync {
    /// Whether `owner` may read `repo_owner/repo_name`
    async fn validate_access(
        &self,
        owner: &str,
        repo_owner: &str,
        repo_name: &str,
        credential: &str,
    ) -> Result<bool, RepositoryError>;

    /// URL the workspace clones from; private repositories get the
    /// credential embedded as user-info
    async fn resolve_clone_url(
        &self,
        owner: &str,
        repo_owner: &str,
        repo_name: &str,
        credential: &str,
    ) -> Result<String, RepositoryError>;

    /// The repository's default branch, if the host reports one
    async fn default_branch(
        &self,
        repo_owner: &str,
        repo_name: &str,
        credential: &str,
    ) -> Result<Option<String>, RepositoryError>;
}

#[derive(Debug, Clone, Deserialize)]
struct RepoInfo {
    clone_url: String,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    permissions: Option<RepoPermissions>,
}

#[derive(Debug, Clone, Deserialize)]
struct RepoPermissions {
    #[serde(default)]
    pull: bool,
}

/// [`RepositoryAccess`] over a Gitea-compatible REST API
#[derive(Debug, Clone)]
pub struct GitServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl GitServiceClient {
    /// Create a client for the Git host at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self, RepositoryError> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RepositoryError::Config {
                url: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self::with_client(base_url, client))
    }

    /// Create a client with a custom HTTP client
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// `{base}/api/v1/repos/{owner}/{name}` with each part percent-encoded
    /// as a single path segment
    fn repo_api_url(&self, repo_owner: &str, repo_name: &str) -> Result<Url, RepositoryError> {
        let config_err = |message: String| RepositoryError::Config {
            url: self.base_url.clone(),
            message,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| config_err(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| config_err("URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "v1", "repos", repo_owner, repo_name]);
        Ok(url)
    }

    /// Fetch repository info; `None` when the caller cannot see it
    async fn fetch_repo(
        &self,
        repo_owner: &str,
        repo_name: &str,
        credential: &str,
    ) -> Result<Option<RepoInfo>, RepositoryError> {
        let endpoint = self.repo_api_url(repo_owner, repo_name)?;
        let url = endpoint.to_string();
        debug!(url = %url, "fetching repository");

        let mut request = self.client.get(endpoint);
        if !credential.is_empty() {
            request = request.bearer_auth(credential);
        }
        let response = request.send().await.map_err(|e| RepositoryError::Request {
            url: url.clone(),
            message: e.to_string(),
        })?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                return Ok(None)
            }
            s if !s.is_success() => {
                return Err(RepositoryError::Status {
                    url,
                    status: s.as_u16(),
                })
            }
            _ => {}
        }

        response
            .json::<RepoInfo>()
            .await
            .map(Some)
            .map_err(|e| RepositoryError::InvalidResponse {
                url,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl RepositoryAccess for GitServiceClient {
    async fn validate_access(
        &self,
        owner: &str,
        repo_owner: &str,
        repo_name: &str,
        credential: &str,
    ) -> Result<bool, RepositoryError> {
        let allowed = match self.fetch_repo(repo_owner, repo_name, credential).await? {
            // Hosts that omit permissions only return repos the caller can read
            Some(info) => info.permissions.map_or(true, |p| p.pull),
            None => false,
        };
        if !allowed {
            warn!(owner, repository = %format!("{repo_owner}/{repo_name}"), "repository access denied");
        }
        Ok(allowed)
    }

    async fn resolve_clone_url(
        &self,
        owner: &str,
        repo_owner: &str,
        repo_name: &str,
        credential: &str,
    ) -> Result<String, RepositoryError> {
        let repository = format!("{repo_owner}/{repo_name}");
        let info = self
            .fetch_repo(repo_owner, repo_name, credential)
            .await?
            .ok_or_else(|| RepositoryError::NotFound {
                repository: repository.clone(),
            })?;

        if !info.private || credential.is_empty() {
            return Ok(info.clone_url);
        }

        let clone_url = embed_credential(&info.clone_url, credential).map_err(|message| {
            RepositoryError::InvalidResponse {
                url: info.clone_url.clone(),
                message,
            }
        })?;
        info!(owner, repository = %repository, "resolved authenticated clone URL");
        Ok(clone_url)
    }

    async fn default_branch(
        &self,
        repo_owner: &str,
        repo_name: &str,
        credential: &str,
    ) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .fetch_repo(repo_owner, repo_name, credential)
            .await?
            .and_then(|info| info.default_branch)
            .filter(|b| !b.is_empty()))
    }
}

/// Put the token into the URL's user-info
fn embed_credential(clone_url: &str, credential: &str) -> Result<String, String> {
    let mut url = Url::parse(clone_url).map_err(|e| e.to_string())?;
    url.set_username(CLONE_URL_USER)
        .and_then(|_| url.set_password(Some(credential)))
        .map_err(|_| format!("cannot carry credentials: {clone_url}"))?;
    Ok(url.to_string())
}
