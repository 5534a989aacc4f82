//! Upload coordination.
//!
//! Final artifacts are grouped by target family into at most one request per
//! (family, repository, destination folder), de-duplicated, and handed to a
//! [`RepositoryClient`]. One login is shared by every call on a coordinator.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::{QuantTarget, TargetFamily, TargetOutcome};
use crate::{QuantsmithError, Result};

/// Kind of remote repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    #[default]
    Model,
    Dataset,
    Space,
}

impl RepoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Model => "model",
            RepoType::Dataset => "dataset",
            RepoType::Space => "space",
        }
    }
}

/// Outcome of uploading one local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOutcome {
    pub path: PathBuf,
    pub success: bool,
    pub message: Option<String>,
}

/// Remote artifact repository.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Authenticate and return the account name.
    async fn login(&self, token: Option<&str>) -> Result<String>;

    /// Full ids (`owner/name`) of the owner's repositories.
    async fn list_repositories(&self, owner: &str, repo_type: RepoType) -> Result<Vec<String>>;

    async fn create_repository(&self, repo_id: &str, private: bool, repo_type: RepoType)
        -> Result<()>;

    /// Upload files into `dest_folder` (empty for the repository root).
    async fn upload_paths(
        &self,
        repo_id: &str,
        repo_type: RepoType,
        paths: &[PathBuf],
        dest_folder: &str,
    ) -> Result<Vec<PathOutcome>>;
}

/// Destination for one target family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRoute {
    /// `owner/name`, or just `name` for the logged-in account.
    pub repo_id: String,
    #[serde(default)]
    pub dest_folder: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub repo_type: RepoType,
    #[serde(default)]
    pub create_if_missing: bool,
}

/// Per-family repository routing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub block_quant: Option<RepoRoute>,
    pub low_bit_float: Option<RepoRoute>,
    /// Explicit token. When absent the client resolves one itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl RoutingConfig {
    pub fn route(&self, family: TargetFamily) -> Option<&RepoRoute> {
        match family {
            TargetFamily::BlockQuant => self.block_quant.as_ref(),
            TargetFamily::LowBitFloat => self.low_bit_float.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block_quant.is_none() && self.low_bit_float.is_none()
    }
}

/// One target's result, as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCandidate {
    /// Caller's key for the owning model, copied onto its record. Base names
    /// can repeat within a batch; this cannot.
    pub owner: usize,
    /// Model base name.
    pub model: String,
    pub target: QuantTarget,
    /// `None` if the target was never attempted.
    pub outcome: Option<TargetOutcome>,
}

/// Why a target was not uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotRequested,
    NotGenerated,
    TargetFailed,
    NoRepository,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub owner: usize,
    pub model: String,
    pub target: String,
    pub path: PathBuf,
}

/// One repository call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub family: TargetFamily,
    pub route: RepoRoute,
    pub dest_folder: String,
    /// Unique paths.
    pub items: Vec<UploadItem>,
}

impl UploadRequest {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.items.iter().map(|i| i.path.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedUpload {
    pub owner: usize,
    pub model: String,
    pub target: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPlan {
    pub requests: Vec<UploadRequest>,
    pub skipped: Vec<SkippedUpload>,
}

fn dest_folder(route: &RepoRoute, model: &str, per_model: bool) -> String {
    let root = route.dest_folder.trim_matches('/');
    match (per_model, root.is_empty()) {
        (false, _) => root.to_string(),
        (true, true) => model.to_string(),
        (true, false) => format!("{root}/{model}"),
    }
}

/// Decide what to upload where. `per_model` namespaces destination folders
/// by model base name.
pub fn plan_uploads(
    candidates: &[UploadCandidate],
    routing: &RoutingConfig,
    per_model: bool,
) -> UploadPlan {
    let mut plan = UploadPlan::default();
    let mut index: HashMap<(TargetFamily, String, String), usize> = HashMap::new();

    for c in candidates {
        let skip = |reason| SkippedUpload {
            owner: c.owner,
            model: c.model.clone(),
            target: c.target.name.clone(),
            reason,
        };
        if !c.target.upload {
            plan.skipped.push(skip(SkipReason::NotRequested));
            continue;
        }
        if !c.target.generate {
            plan.skipped.push(skip(SkipReason::NotGenerated));
            continue;
        }
        let final_path = match &c.outcome {
            Some(TargetOutcome::Completed { final_path }) => final_path.clone(),
            Some(_) => {
                plan.skipped.push(skip(SkipReason::TargetFailed));
                continue;
            }
            None => {
                plan.skipped.push(skip(SkipReason::NotGenerated));
                continue;
            }
        };
        let Some(route) = routing.route(c.target.family) else {
            plan.skipped.push(skip(SkipReason::NoRepository));
            continue;
        };

        let folder = dest_folder(route, &c.model, per_model);
        let key = (c.target.family, route.repo_id.clone(), folder.clone());
        let slot = *index.entry(key).or_insert_with(|| {
            plan.requests.push(UploadRequest {
                family: c.target.family,
                route: route.clone(),
                dest_folder: folder,
                items: Vec::new(),
            });
            plan.requests.len() - 1
        });

        let request = &mut plan.requests[slot];
        if request.items.iter().all(|i| i.path != final_path) {
            request.items.push(UploadItem {
                owner: c.owner,
                model: c.model.clone(),
                target: c.target.name.clone(),
                path: final_path,
            });
        }
    }
    plan
}

/// Result of one target's upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum UploadStatus {
    Uploaded { repo_id: String, path: PathBuf },
    Failed { repo_id: String, path: PathBuf, reason: String },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    #[serde(skip)]
    pub owner: usize,
    pub model: String,
    pub target: String,
    #[serde(flatten)]
    pub status: UploadStatus,
}

#[derive(Debug, Default)]
struct Session {
    user: Option<String>,
    login_error: Option<String>,
    ready_repos: HashSet<String>,
}

/// Runs upload plans against a repository client, sharing one login.
pub struct UploadCoordinator {
    client: Arc<dyn RepositoryClient>,
    routing: RoutingConfig,
    session: Mutex<Session>,
}

impl std::fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadCoordinator")
            .field("block_quant", &self.routing.block_quant.as_ref().map(|r| &r.repo_id))
            .field("low_bit_float", &self.routing.low_bit_float.as_ref().map(|r| &r.repo_id))
            .finish()
    }
}

fn qualify(repo_id: &str, user: &str) -> String {
    if repo_id.contains('/') {
        repo_id.to_string()
    } else {
        format!("{user}/{repo_id}")
    }
}

impl UploadCoordinator {
    pub fn new(client: Arc<dyn RepositoryClient>, routing: RoutingConfig) -> Self {
        Self {
            client,
            routing,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    /// Plan and perform uploads. Every candidate gets exactly one record.
    pub async fn upload(&self, candidates: &[UploadCandidate], per_model: bool) -> Vec<UploadRecord> {
        let plan = plan_uploads(candidates, &self.routing, per_model);
        let mut records: Vec<UploadRecord> = plan
            .skipped
            .iter()
            .map(|s| UploadRecord {
                owner: s.owner,
                model: s.model.clone(),
                target: s.target.clone(),
                status: UploadStatus::Skipped { reason: s.reason },
            })
            .collect();

        if plan.requests.is_empty() {
            return records;
        }

        let mut session = self.session.lock().await;
        let user = match self.login(&mut session).await {
            Ok(user) => user,
            Err(reason) => {
                for request in &plan.requests {
                    records.extend(failed(request, &request.route.repo_id, &reason));
                }
                return records;
            }
        };

        for request in &plan.requests {
            let repo_id = qualify(&request.route.repo_id, &user);
            if let Err(e) = self.ensure_repository(&mut session, &request.route, &repo_id).await {
                warn!("Repository {} unavailable: {}", repo_id, e);
                records.extend(failed(request, &repo_id, &e.to_string()));
                continue;
            }
            records.extend(self.send(request, &repo_id).await);
        }
        records
    }

    async fn login(&self, session: &mut Session) -> std::result::Result<String, String> {
        if let Some(user) = &session.user {
            return Ok(user.clone());
        }
        if let Some(reason) = &session.login_error {
            return Err(reason.clone());
        }
        match self.client.login(self.routing.token.as_deref()).await {
            Ok(user) => {
                info!("Logged in to repository host as {}", user);
                session.user = Some(user.clone());
                Ok(user)
            }
            Err(e) => {
                warn!("Repository login failed: {}", e);
                let reason = format!("login failed: {e}");
                session.login_error = Some(reason.clone());
                Err(reason)
            }
        }
    }

    async fn ensure_repository(
        &self,
        session: &mut Session,
        route: &RepoRoute,
        repo_id: &str,
    ) -> Result<()> {
        if session.ready_repos.contains(repo_id) {
            return Ok(());
        }
        let owner = repo_id.split('/').next().unwrap_or(repo_id);
        let existing = self.client.list_repositories(owner, route.repo_type).await?;
        if !existing.iter().any(|r| r == repo_id) {
            if !route.create_if_missing {
                return Err(QuantsmithError::Repository {
                    repo_id: repo_id.to_string(),
                    message: "repository does not exist".into(),
                });
            }
            info!(
                "Creating {} {} repository {}",
                if route.private { "private" } else { "public" },
                route.repo_type.as_str(),
                repo_id
            );
            self.client
                .create_repository(repo_id, route.private, route.repo_type)
                .await?;
        }
        session.ready_repos.insert(repo_id.to_string());
        Ok(())
    }

    async fn send(&self, request: &UploadRequest, repo_id: &str) -> Vec<UploadRecord> {
        info!(
            "Uploading {} {} file(s) to {}/{}",
            request.items.len(),
            request.family,
            repo_id,
            request.dest_folder
        );
        let outcomes = match self
            .client
            .upload_paths(repo_id, request.route.repo_type, &request.paths(), &request.dest_folder)
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!("Upload to {} failed: {}", repo_id, e);
                return failed(request, repo_id, &e.to_string());
            }
        };

        request
            .items
            .iter()
            .map(|item| {
                let outcome = outcomes.iter().find(|o| o.path == item.path);
                let status = match outcome {
                    Some(o) if o.success => UploadStatus::Uploaded {
                        repo_id: repo_id.to_string(),
                        path: item.path.clone(),
                    },
                    Some(o) => UploadStatus::Failed {
                        repo_id: repo_id.to_string(),
                        path: item.path.clone(),
                        reason: o.message.clone().unwrap_or_else(|| "upload failed".into()),
                    },
                    None => UploadStatus::Failed {
                        repo_id: repo_id.to_string(),
                        path: item.path.clone(),
                        reason: "no result reported".into(),
                    },
                };
                UploadRecord {
                    owner: item.owner,
                    model: item.model.clone(),
                    target: item.target.clone(),
                    status,
                }
            })
            .collect()
    }
}

fn failed(request: &UploadRequest, repo_id: &str, reason: &str) -> Vec<UploadRecord> {
    request
        .items
        .iter()
        .map(|item| UploadRecord {
            owner: item.owner,
            model: item.model.clone(),
            target: item.target.clone(),
            status: UploadStatus::Failed {
                repo_id: repo_id.to_string(),
                path: item.path.clone(),
                reason: reason.to_string(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetScope;
    use std::sync::Mutex as StdMutex;

    fn target(name: &str, family: TargetFamily, upload: bool) -> QuantTarget {
        QuantTarget {
            name: name.into(),
            family,
            scope: TargetScope::Full,
            low_bit_format: None,
            generate: true,
            upload,
            retain: false,
        }
    }

    fn completed(model: &str, t: QuantTarget, path: &str) -> UploadCandidate {
        UploadCandidate {
            owner: 0,
            model: model.into(),
            target: t,
            outcome: Some(TargetOutcome::Completed {
                final_path: PathBuf::from(path),
            }),
        }
    }

    fn route(repo: &str, folder: &str) -> RepoRoute {
        RepoRoute {
            repo_id: repo.into(),
            dest_folder: folder.into(),
            private: false,
            repo_type: RepoType::Model,
            create_if_missing: true,
        }
    }

    fn routing() -> RoutingConfig {
        RoutingConfig {
            block_quant: Some(route("me/gguf", "quants")),
            low_bit_float: Some(route("me/fp8", "")),
            token: None,
        }
    }

    #[test]
    fn test_plan_partitions_by_family_and_skips() {
        let candidates = vec![
            completed("a", target("Q4_K_M", TargetFamily::BlockQuant, true), "/o/a-Q4_K_M.gguf"),
            completed("a", target("F16", TargetFamily::BlockQuant, false), "/o/a-F16.gguf"),
            completed("a", target("FP8_E5M2", TargetFamily::LowBitFloat, true), "/o/a-FP8_E5M2.safetensors"),
            UploadCandidate {
                owner: 0,
                model: "a".into(),
                target: target("Q8_0", TargetFamily::BlockQuant, true),
                outcome: Some(TargetOutcome::Failed {
                    stage: crate::types::Stage::Quantize,
                    reason: "exit 1".into(),
                }),
            },
        ];

        let plan = plan_uploads(&candidates, &routing(), false);

        assert_eq!(plan.requests.len(), 2);
        assert_eq!(plan.requests[0].route.repo_id, "me/gguf");
        assert_eq!(plan.requests[0].dest_folder, "quants");
        assert_eq!(plan.requests[0].paths(), vec![PathBuf::from("/o/a-Q4_K_M.gguf")]);
        assert_eq!(plan.requests[1].route.repo_id, "me/fp8");
        assert_eq!(plan.skipped.len(), 2);
        assert_eq!(plan.skipped[0].reason, SkipReason::NotRequested);
        assert_eq!(plan.skipped[1].reason, SkipReason::TargetFailed);
    }

    #[test]
    fn test_plan_dedups_and_namespaces_per_model() {
        let t = target("Q4_K_M", TargetFamily::BlockQuant, true);
        let candidates = vec![
            completed("a", t.clone(), "/o/a/a-Q4_K_M.gguf"),
            completed("a", t.clone(), "/o/a/a-Q4_K_M.gguf"),
            completed("b", t, "/o/b/b-Q4_K_M.gguf"),
        ];

        let plan = plan_uploads(&candidates, &routing(), true);

        assert_eq!(plan.requests.len(), 2);
        assert_eq!(plan.requests[0].dest_folder, "quants/a");
        assert_eq!(plan.requests[0].items.len(), 1);
        assert_eq!(plan.requests[1].dest_folder, "quants/b");
    }

    #[tokio::test]
    async fn test_records_carry_candidate_owner() {
        let client = Arc::new(FakeClient::default());
        let coordinator = UploadCoordinator::new(client, routing());
        let t = target("Q4_K_M", TargetFamily::BlockQuant, true);
        let mut first = completed("a", t.clone(), "/o/a-Q4_K_M.gguf");
        first.owner = 3;
        let second = UploadCandidate {
            owner: 7,
            model: "a".into(),
            target: t,
            outcome: Some(TargetOutcome::Collision {
                kept: PathBuf::from("/o/a-Q4_K_M-UnFixed.gguf"),
                existing: PathBuf::from("/o/a-Q4_K_M.gguf"),
            }),
        };

        let records = coordinator.upload(&[first, second], false).await;

        let owned = |owner: usize| records.iter().find(|r| r.owner == owner).unwrap();
        assert!(matches!(owned(3).status, UploadStatus::Uploaded { .. }));
        assert_eq!(
            owned(7).status,
            UploadStatus::Skipped {
                reason: SkipReason::TargetFailed
            }
        );
    }

    #[test]
    fn test_missing_route_is_a_clean_skip() {
        let routing = RoutingConfig {
            block_quant: Some(route("me/gguf", "")),
            ..RoutingConfig::default()
        };
        let candidates = vec![completed(
            "a",
            target("FP8_E4M3", TargetFamily::LowBitFloat, true),
            "/o/a-FP8_E4M3.safetensors",
        )];
        let plan = plan_uploads(&candidates, &routing, false);
        assert!(plan.requests.is_empty());
        assert_eq!(plan.skipped[0].reason, SkipReason::NoRepository);
    }

    #[derive(Default)]
    struct FakeClient {
        logins: StdMutex<u32>,
        created: StdMutex<Vec<String>>,
        uploads: StdMutex<Vec<(String, Vec<PathBuf>, String)>>,
    }

    #[async_trait]
    impl RepositoryClient for FakeClient {
        async fn login(&self, _token: Option<&str>) -> Result<String> {
            *self.logins.lock().unwrap() += 1;
            Ok("me".into())
        }

        async fn list_repositories(&self, _owner: &str, _t: RepoType) -> Result<Vec<String>> {
            Ok(vec!["me/gguf".into()])
        }

        async fn create_repository(&self, repo_id: &str, _p: bool, _t: RepoType) -> Result<()> {
            self.created.lock().unwrap().push(repo_id.into());
            Ok(())
        }

        async fn upload_paths(
            &self,
            repo_id: &str,
            _t: RepoType,
            paths: &[PathBuf],
            dest_folder: &str,
        ) -> Result<Vec<PathOutcome>> {
            self.uploads
                .lock()
                .unwrap()
                .push((repo_id.into(), paths.to_vec(), dest_folder.into()));
            Ok(paths
                .iter()
                .map(|p| PathOutcome {
                    path: p.clone(),
                    success: true,
                    message: None,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_coordinator_logs_in_once_and_creates_missing_repo() {
        let client = Arc::new(FakeClient::default());
        let mut routing = routing();
        routing.low_bit_float = Some(route("fp8", ""));
        let coordinator = UploadCoordinator::new(client.clone(), routing);

        let first = vec![completed(
            "a",
            target("Q4_K_M", TargetFamily::BlockQuant, true),
            "/o/a-Q4_K_M.gguf",
        )];
        let second = vec![completed(
            "b",
            target("FP8_E4M3", TargetFamily::LowBitFloat, true),
            "/o/b-FP8_E4M3.safetensors",
        )];

        let r1 = coordinator.upload(&first, false).await;
        let r2 = coordinator.upload(&second, false).await;

        assert_eq!(*client.logins.lock().unwrap(), 1);
        assert_eq!(*client.created.lock().unwrap(), vec!["me/fp8".to_string()]);
        assert!(matches!(r1[0].status, UploadStatus::Uploaded { .. }));
        match &r2[0].status {
            UploadStatus::Uploaded { repo_id, .. } => assert_eq!(repo_id, "me/fp8"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.uploads.lock().unwrap().len(), 2);
    }
}
