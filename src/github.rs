//! The repository-hosting service that published backups live on.
//!
//! The sync engine only needs two operations from the host, expressed by the
//! [`RepoHost`] trait; the GitHub implementation lives behind it so that
//! tests can substitute a recording stub.
use crate::consts::USER_AGENT;
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// An `owner/name` pair on the hosting service
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct GHRepo {
    pub(crate) owner: String,
    pub(crate) name: String,
}

impl GHRepo {
    pub(crate) fn new(owner: &str, name: &str) -> GHRepo {
        GHRepo {
            owner: owner.to_owned(),
            name: name.to_owned(),
        }
    }

    /// Parse a GitHub remote URL in either HTTPS or SSH form
    pub(crate) fn parse_url(url: &str) -> Result<GHRepo, ParseGHRepoError> {
        static RGX: OnceLock<Regex> = OnceLock::new();
        let rgx = RGX.get_or_init(|| {
            Regex::new(
                r"^(?:https://(?:www\.)?github\.com/|git@github\.com:|ssh://git@github\.com/)([^/]+)/(.+?)(?:\.git)?/?$",
            )
            .expect("GHRepo URL regex should be valid")
        });
        let caps = rgx
            .captures(url)
            .ok_or_else(|| ParseGHRepoError(url.to_owned()))?;
        Ok(GHRepo {
            owner: caps[1].to_owned(),
            name: caps[2].to_owned(),
        })
    }
}

impl fmt::Display for GHRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("not a GitHub repository URL: {0:?}")]
pub(crate) struct ParseGHRepoError(String);

/// Settings to apply to a hosted repository
#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct RepoEdits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) homepage: Option<String>,
}

/// The operations syncing needs from the hosting service
#[async_trait]
pub(crate) trait RepoHost: fmt::Debug + Send + Sync {
    /// Create the repository if it does not already exist
    async fn create_repository(&self, repo: &GHRepo, private: bool) -> anyhow::Result<()>;

    /// Apply the given settings to an existing repository
    async fn edit_repository(&self, repo: &GHRepo, edits: &RepoEdits) -> anyhow::Result<()>;
}

/// Minimal GitHub REST client
#[derive(Clone, Debug)]
pub(crate) struct GitHubClient {
    inner: reqwest::Client,
}

impl GitHubClient {
    pub(crate) fn new(token: &str) -> anyhow::Result<GitHubClient> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("GitHub token is not usable as a header value")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        let inner = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .context("failed to initialize GitHub client")?;
        Ok(GitHubClient { inner })
    }
}

#[async_trait]
impl RepoHost for GitHubClient {
    async fn create_repository(&self, repo: &GHRepo, private: bool) -> anyhow::Result<()> {
        let r = self
            .inner
            .post(format!("https://api.github.com/orgs/{}/repos", repo.owner))
            .json(&serde_json::json!({"name": repo.name, "private": private}))
            .send()
            .await
            .with_context(|| format!("failed to create repository {repo}"))?;
        // 422 means the repository already exists
        if r.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            tracing::debug!(%repo, "Repository already exists");
            return Ok(());
        }
        r.error_for_status()
            .with_context(|| format!("failed to create repository {repo}"))?;
        Ok(())
    }

    async fn edit_repository(&self, repo: &GHRepo, edits: &RepoEdits) -> anyhow::Result<()> {
        self.inner
            .patch(format!("https://api.github.com/repos/{repo}"))
            .json(edits)
            .send()
            .await
            .with_context(|| format!("failed to edit repository {repo}"))?
            .error_for_status()
            .with_context(|| format!("failed to edit repository {repo}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://github.com/dandizarrs/7e10ceaf", "dandizarrs", "7e10ceaf")]
    #[case("https://github.com/dandizarrs/7e10ceaf.git", "dandizarrs", "7e10ceaf")]
    #[case("git@github.com:dandisets/000027", "dandisets", "000027")]
    #[case("git@github.com:dandisets/000027.git", "dandisets", "000027")]
    #[case("ssh://git@github.com/dandisets/000027", "dandisets", "000027")]
    fn parse_urls(#[case] url: &str, #[case] owner: &str, #[case] name: &str) {
        assert_eq!(GHRepo::parse_url(url).unwrap(), GHRepo::new(owner, name));
    }

    #[rstest]
    #[case("https://gitlab.com/foo/bar")]
    #[case("/local/path/7e10ceaf")]
    fn parse_bad_urls(#[case] url: &str) {
        assert!(GHRepo::parse_url(url).is_err());
    }

    #[test]
    fn serialize_edits_skips_unset() {
        let edits = RepoEdits {
            private: Some(false),
            ..RepoEdits::default()
        };
        assert_eq!(
            serde_json::to_string(&edits).unwrap(),
            r#"{"private":false}"#
        );
    }
}
