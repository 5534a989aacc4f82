//! Hugging Face Hub repository client.
//!
//! Account and repository management goes through the Hub HTTP API; file
//! uploads run the `huggingface-cli upload` command through the stage runner
//! so large transfers get the CLI's chunking and their output is logged like
//! any other stage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::PipelineDefaults;
use crate::runner::{CommandLine, StageRunner};
use crate::upload::{PathOutcome, RepoType, RepositoryClient};
use crate::{QuantsmithError, Result};

/// Token environment variables, checked in order.
const TOKEN_ENV_VARS: &[&str] = &["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"];

/// Resolve a Hub token from the environment or the Hugging Face CLI cache.
///
/// Checks in order:
/// 1. `HF_TOKEN`
/// 2. `HUGGING_FACE_HUB_TOKEN`
/// 3. `~/.cache/huggingface/token`
///
/// Returns the token and a label identifying its source.
pub fn resolve_token() -> Option<(String, &'static str)> {
    for var in TOKEN_ENV_VARS {
        if let Ok(token) = std::env::var(var) {
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Some((token, "env_var"));
            }
        }
    }

    let home = dirs::home_dir()?;
    let cached = home.join(".cache").join("huggingface").join("token");
    let token = std::fs::read_to_string(cached).ok()?;
    let token = token.trim().to_string();
    (!token.is_empty()).then_some((token, "hf_cache"))
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RepoListing {
    id: String,
}

#[derive(Debug, Default)]
struct Auth {
    token: Option<String>,
    user: Option<String>,
}

/// [`RepositoryClient`] for the Hugging Face Hub.
pub struct HfHubClient {
    http: Client,
    endpoint: String,
    cli: PathBuf,
    runner: StageRunner,
    auth: RwLock<Auth>,
}

impl std::fmt::Debug for HfHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfHubClient")
            .field("endpoint", &self.endpoint)
            .field("cli", &self.cli)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

impl HfHubClient {
    pub fn new(runner: StageRunner) -> Result<Self> {
        let http = Client::builder()
            .timeout(PipelineDefaults::HTTP_TIMEOUT)
            .user_agent(concat!("quantsmith/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| QuantsmithError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;
        Ok(Self {
            http,
            endpoint: PipelineDefaults::HUB_ENDPOINT.to_string(),
            cli: PathBuf::from(PipelineDefaults::UPLOAD_CLI),
            runner,
            auth: RwLock::new(Auth::default()),
        })
    }

    /// Point at a different Hub deployment.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_cli(mut self, cli: impl Into<PathBuf>) -> Self {
        self.cli = cli.into();
        self
    }

    async fn token(&self) -> Result<String> {
        self.auth
            .read()
            .await
            .token
            .clone()
            .ok_or_else(|| QuantsmithError::config("not logged in to the Hub"))
    }

    fn list_url(&self, repo_type: RepoType) -> String {
        let kind = match repo_type {
            RepoType::Model => "models",
            RepoType::Dataset => "datasets",
            RepoType::Space => "spaces",
        };
        format!("{}/api/{}", self.endpoint, kind)
    }

    /// `huggingface-cli upload REPO PATH PATH_IN_REPO --repo-type TYPE`
    pub fn upload_command(
        &self,
        repo_id: &str,
        repo_type: RepoType,
        path: &Path,
        dest_folder: &str,
        token: &str,
    ) -> CommandLine {
        CommandLine::new("upload", &self.cli)
            .arg("upload")
            .arg(repo_id)
            .arg(path)
            .arg(path_in_repo(path, dest_folder))
            .arg("--repo-type")
            .arg(repo_type.as_str())
            .env("HF_TOKEN", token)
    }
}

/// Remote path of a local file under `dest_folder`.
pub fn path_in_repo(path: &Path, dest_folder: &str) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let folder = dest_folder.trim_matches('/');
    if folder.is_empty() {
        name
    } else {
        format!("{folder}/{name}")
    }
}

fn status_error(what: &str, status: StatusCode) -> QuantsmithError {
    QuantsmithError::Network {
        message: format!("{what} returned HTTP {status}"),
        cause: None,
    }
}

#[async_trait]
impl RepositoryClient for HfHubClient {
    async fn login(&self, token: Option<&str>) -> Result<String> {
        let token = match token {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => {
                let (token, source) = resolve_token()
                    .ok_or_else(|| QuantsmithError::config("no Hugging Face token found"))?;
                info!("Hugging Face token found from {}", source);
                token
            }
        };

        let resp = self
            .http
            .get(format!("{}/api/whoami-v2", self.endpoint))
            .bearer_auth(&token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error("whoami", resp.status()));
        }
        let who: WhoAmI = resp.json().await?;

        let mut auth = self.auth.write().await;
        auth.token = Some(token);
        auth.user = Some(who.name.clone());
        Ok(who.name)
    }

    async fn list_repositories(&self, owner: &str, repo_type: RepoType) -> Result<Vec<String>> {
        let token = self.token().await?;
        let resp = self
            .http
            .get(self.list_url(repo_type))
            .query(&[("author", owner), ("limit", "1000")])
            .bearer_auth(&token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error("repository listing", resp.status()));
        }
        let repos: Vec<RepoListing> = resp.json().await?;
        Ok(repos.into_iter().map(|r| r.id).collect())
    }

    async fn create_repository(
        &self,
        repo_id: &str,
        private: bool,
        repo_type: RepoType,
    ) -> Result<()> {
        let token = self.token().await?;
        let user = self.auth.read().await.user.clone();
        let (owner, name) = repo_id.split_once('/').unwrap_or(("", repo_id));

        let mut body = serde_json::json!({
            "name": name,
            "private": private,
            "type": repo_type.as_str(),
        });
        if !owner.is_empty() && user.as_deref() != Some(owner) {
            body["organization"] = serde_json::Value::String(owner.to_string());
        }

        let resp = self
            .http
            .post(format!("{}/api/repos/create", self.endpoint))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                info!("Repository {} already exists", repo_id);
                Ok(())
            }
            s => Err(QuantsmithError::Repository {
                repo_id: repo_id.to_string(),
                message: format!("create returned HTTP {s}"),
            }),
        }
    }

    async fn upload_paths(
        &self,
        repo_id: &str,
        repo_type: RepoType,
        paths: &[PathBuf],
        dest_folder: &str,
    ) -> Result<Vec<PathOutcome>> {
        let token = self.token().await?;
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            let cmd = self.upload_command(repo_id, repo_type, path, dest_folder, &token);
            let outcome = match self.runner.run_checked(&cmd).await {
                Ok(()) => PathOutcome {
                    path: path.clone(),
                    success: true,
                    message: None,
                },
                Err(QuantsmithError::Cancelled) => return Err(QuantsmithError::Cancelled),
                Err(e) => {
                    warn!("Upload of {} failed: {}", path.display(), e);
                    PathOutcome {
                        path: path.clone(),
                        success: false,
                        message: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;

    fn client() -> HfHubClient {
        HfHubClient::new(StageRunner::with_tracing(CancellationToken::new()))
            .unwrap()
            .with_endpoint("https://hub.example/")
    }

    #[test]
    fn test_path_in_repo() {
        assert_eq!(path_in_repo(Path::new("/o/a-Q4_K_M.gguf"), ""), "a-Q4_K_M.gguf");
        assert_eq!(
            path_in_repo(Path::new("/o/a-Q4_K_M.gguf"), "/quants/a/"),
            "quants/a/a-Q4_K_M.gguf"
        );
    }

    #[test]
    fn test_upload_command() {
        let cmd = client().upload_command(
            "me/wan-gguf",
            RepoType::Model,
            Path::new("/o/wan-Q8_0.gguf"),
            "wan",
            "hf_secret",
        );
        assert_eq!(cmd.program, PathBuf::from("huggingface-cli"));
        assert_eq!(
            cmd.to_string(),
            "huggingface-cli upload me/wan-gguf /o/wan-Q8_0.gguf wan/wan-Q8_0.gguf --repo-type model"
        );
        assert_eq!(cmd.envs, vec![("HF_TOKEN".to_string(), "hf_secret".to_string())]);
    }

    #[test]
    fn test_list_url_per_repo_type() {
        let c = client();
        assert_eq!(c.list_url(RepoType::Model), "https://hub.example/api/models");
        assert_eq!(c.list_url(RepoType::Space), "https://hub.example/api/spaces");
    }

    #[tokio::test]
    async fn test_calls_before_login_fail() {
        let c = client();
        assert!(c.list_repositories("me", RepoType::Model).await.is_err());
        assert!(c
            .upload_paths("me/x", RepoType::Model, &[PathBuf::from("/a")], "")
            .await
            .is_err());
    }
}
