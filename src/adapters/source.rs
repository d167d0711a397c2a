//! Git source collaborator
//!
//! `GitRepository` keeps one bare mirror per repository URL under the cache
//! directory and reads it with libgit2. All reads after
//! [`SourceRepository::resolve`] address a full commit id, so a push that
//! lands mid-cycle cannot produce a torn read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::{
    AutotagOption, Cred, CredentialType, FetchOptions, FetchPrune, ObjectType, RemoteCallbacks,
    Repository, TreeWalkMode, TreeWalkResult,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::SourceRef;

/// Refs mirrored from the remote
const MIRROR_REFSPECS: &[&str] = &["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];

/// Credential callbacks give up after this many rejected attempts
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Read access to a versioned manifest source
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Resolve the source's revision selector to a full commit id
    async fn resolve(&self, source: &SourceRef) -> Result<String>;

    /// Files under `source.path` at `revision`, repository-relative and sorted
    async fn list_files(&self, source: &SourceRef, revision: &str) -> Result<Vec<String>>;

    /// Content of one file at `revision`
    async fn get(&self, source: &SourceRef, revision: &str, path: &str) -> Result<Vec<u8>>;
}

/// Normalize a manifest directory: `.`, `./` and empty mean the repository root
pub fn normalize_source_path(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches("./").trim_matches('/');
    if trimmed == "." {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// Git collaborator backed by libgit2
pub struct GitRepository {
    cache_dir: PathBuf,
    /// One lock per repository URL so fetches never overlap
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GitRepository {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Mirror directory for a repository URL.
    ///
    /// The readable part is lossy, so a digest of the full URL keeps
    /// distinct repositories apart.
    pub fn mirror_dir(&self, repo_url: &str) -> PathBuf {
        let readable: String = repo_url
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let digest = hex::encode(Sha256::digest(repo_url.as_bytes()));
        self.cache_dir
            .join(format!("{}-{}", readable, &digest[..12]))
    }

    async fn repo_lock(&self, repo_url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(repo_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl SourceRepository for GitRepository {
    async fn resolve(&self, source: &SourceRef) -> Result<String> {
        let lock = self.repo_lock(&source.repo_url).await;
        let _guard = lock.lock().await;

        let dir = self.mirror_dir(&source.repo_url);
        let repo_url = source.repo_url.clone();
        let revision = source.target_revision.clone();
        let commit = blocking(move || {
            let repo = sync_mirror(&dir, &repo_url)?;
            let commit = repo
                .revparse_single(&revision)
                .and_then(|object| object.peel_to_commit())
                .map_err(|_| {
                    Error::source_unavailable(format!(
                        "revision '{}' not found in {}",
                        revision, repo_url
                    ))
                })?;
            Ok(commit.id().to_string())
        })
        .await?;

        debug!(repo = %source.repo_url, revision = %source.target_revision, commit = %commit, "Resolved revision");
        Ok(commit)
    }

    async fn list_files(&self, source: &SourceRef, revision: &str) -> Result<Vec<String>> {
        let dir = self.mirror_dir(&source.repo_url);
        let root = normalize_source_path(&source.path);
        let revision = revision.to_string();
        blocking(move || {
            let repo = Repository::open_bare(&dir).map_err(git_error)?;
            let tree = repo
                .revparse_single(&revision)
                .and_then(|object| object.peel_to_tree())
                .map_err(git_error)?;

            let mut files = Vec::new();
            tree.walk(TreeWalkMode::PreOrder, |parent, entry| {
                if entry.kind() == Some(ObjectType::Blob) {
                    if let Some(name) = entry.name() {
                        files.push(format!("{}{}", parent, name));
                    }
                }
                TreeWalkResult::Ok
            })
            .map_err(git_error)?;

            files.retain(|path| {
                root.is_empty()
                    || path
                        .strip_prefix(root.as_str())
                        .map(|rest| rest.starts_with('/'))
                        .unwrap_or(false)
            });
            files.sort();
            Ok(files)
        })
        .await
    }

    async fn get(&self, source: &SourceRef, revision: &str, path: &str) -> Result<Vec<u8>> {
        let dir = self.mirror_dir(&source.repo_url);
        let revision = revision.to_string();
        let path = path.to_string();
        blocking(move || {
            let repo = Repository::open_bare(&dir).map_err(git_error)?;
            let tree = repo
                .revparse_single(&revision)
                .and_then(|object| object.peel_to_tree())
                .map_err(git_error)?;
            let entry = tree.get_path(Path::new(&path)).map_err(|_| {
                Error::source_unavailable(format!("{} not found at {}", path, revision))
            })?;
            let blob = repo.find_blob(entry.id()).map_err(git_error)?;
            Ok(blob.content().to_vec())
        })
        .await
    }
}

/// Open or create the bare mirror and fetch every branch and tag
fn sync_mirror(dir: &Path, repo_url: &str) -> Result<Repository> {
    let repo = match Repository::open_bare(dir) {
        Ok(repo) => {
            debug!(repo = %repo_url, "Fetching mirror");
            repo
        }
        Err(_) => {
            info!(repo = %repo_url, dir = %dir.display(), "Creating mirror");
            std::fs::create_dir_all(dir)?;
            Repository::init_bare(dir).map_err(git_error)?
        }
    };

    {
        let mut remote = repo.remote_anonymous(repo_url).map_err(git_error)?;
        let mut options = FetchOptions::new();
        options
            .remote_callbacks(remote_callbacks())
            .prune(FetchPrune::On)
            .download_tags(AutotagOption::All);
        remote
            .fetch(MIRROR_REFSPECS, Some(&mut options), None)
            .map_err(git_error)?;

        // Follow the remote's default branch so `HEAD` resolves
        if let Ok(branch) = remote.default_branch() {
            if let Some(name) = branch.as_str() {
                repo.set_head(name).map_err(git_error)?;
            }
        }
    }
    Ok(repo)
}

fn remote_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut attempts = 0;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed_types| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        let username = username_from_url.unwrap_or("git");
        if allowed_types.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username);
        }
        if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if let Ok(config) = git2::Config::open_default() {
                return Cred::credential_helper(&config, url, username_from_url);
            }
        }
        Cred::default()
    });
    callbacks
}

fn git_error(e: git2::Error) -> Error {
    Error::source_unavailable(e.message().to_string())
}

/// Run libgit2 work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::source_unavailable(format!("git task failed: {}", e)))?
}
