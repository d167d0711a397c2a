//! Integration tests for the git-backed source repository
//!
//! Each test builds a throwaway upstream repository with libgit2.

use std::path::Path;

use git2::{IndexAddOption, Repository, Signature};
use tempfile::TempDir;

use gitops_sync_operator::adapters::{GitRepository, SourceRepository};
use gitops_sync_operator::error::Error;
use gitops_sync_operator::model::SourceRef;

// ============================================================================
// Test Helpers
// ============================================================================

fn write(dir: &Path, path: &str, content: &str) {
    let file = dir.join(path);
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(file, content).unwrap();
}

fn commit_all(dir: &Path, message: &str) -> String {
    let repo = Repository::open(dir).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("ci", "ci@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
        .to_string()
}

fn tag_head(dir: &Path, name: &str) {
    let repo = Repository::open(dir).unwrap();
    let head = repo.head().unwrap().peel(git2::ObjectType::Commit).unwrap();
    let sig = Signature::now("ci", "ci@example.com").unwrap();
    repo.tag(name, &head, &sig, "release", false).unwrap();
}

/// Repository with manifests under `deploy/` and one unrelated file
fn init_repo() -> (TempDir, String) {
    let upstream = TempDir::new().unwrap();
    let repo = Repository::init(upstream.path()).unwrap();
    repo.set_head("refs/heads/main").unwrap();
    write(
        upstream.path(),
        "deploy/app.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n",
    );
    write(upstream.path(), "deploy/base/svc.yaml", "kind: Service\n");
    write(upstream.path(), "README.md", "# deploy\n");
    let commit = commit_all(upstream.path(), "initial");
    (upstream, commit)
}

fn source(upstream: &TempDir, path: &str, revision: &str) -> SourceRef {
    SourceRef {
        repo_url: upstream.path().to_string_lossy().to_string(),
        path: path.to_string(),
        target_revision: revision.to_string(),
    }
}

// ============================================================================
// Resolve Tests
// ============================================================================

#[tokio::test]
async fn resolves_branch_to_full_commit() {
    let (upstream, commit) = init_repo();
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());

    let src = source(&upstream, "deploy", "main");
    let resolved = repo.resolve(&src).await.unwrap();
    assert_eq!(resolved, commit);
    assert_eq!(resolved.len(), 40);
    assert!(repo.mirror_dir(&src.repo_url).join("HEAD").exists());
}

#[tokio::test]
async fn resolve_fetches_new_commits() {
    let (upstream, first) = init_repo();
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());
    let src = source(&upstream, "deploy", "main");

    assert_eq!(repo.resolve(&src).await.unwrap(), first);

    write(upstream.path(), "deploy/extra.yaml", "kind: Secret\n");
    let second = commit_all(upstream.path(), "add secret");
    assert_ne!(first, second);
    assert_eq!(repo.resolve(&src).await.unwrap(), second);

    // Reads at the old commit still see the old tree
    let old_files = repo.list_files(&src, &first).await.unwrap();
    assert!(!old_files.contains(&"deploy/extra.yaml".to_string()));
}

#[tokio::test]
async fn resolves_tags() {
    let (upstream, commit) = init_repo();
    tag_head(upstream.path(), "v1.0.0");
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());

    let resolved = repo
        .resolve(&source(&upstream, "deploy", "v1.0.0"))
        .await
        .unwrap();
    assert_eq!(resolved, commit);
}

#[tokio::test]
async fn unknown_revision_is_source_unavailable() {
    let (upstream, _) = init_repo();
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());

    let err = repo
        .resolve(&source(&upstream, "deploy", "does-not-exist"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable(_)));
    assert!(err.to_string().contains("does-not-exist"));
}

#[tokio::test]
async fn missing_repository_is_source_unavailable() {
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());
    let src = SourceRef {
        repo_url: cache.path().join("nowhere").to_string_lossy().to_string(),
        path: ".".to_string(),
        target_revision: "main".to_string(),
    };
    let err = repo.resolve(&src).await.unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable(_)));
}

// ============================================================================
// Read Tests
// ============================================================================

#[tokio::test]
async fn lists_files_under_path_recursively() {
    let (upstream, _) = init_repo();
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());

    let src = source(&upstream, "./deploy/", "main");
    let commit = repo.resolve(&src).await.unwrap();
    let files = repo.list_files(&src, &commit).await.unwrap();
    assert_eq!(files, vec!["deploy/app.yaml", "deploy/base/svc.yaml"]);
}

#[tokio::test]
async fn root_path_lists_whole_repository() {
    let (upstream, _) = init_repo();
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());

    let src = source(&upstream, ".", "main");
    let commit = repo.resolve(&src).await.unwrap();
    let files = repo.list_files(&src, &commit).await.unwrap();
    assert_eq!(
        files,
        vec!["README.md", "deploy/app.yaml", "deploy/base/svc.yaml"]
    );
}

#[tokio::test]
async fn gets_file_content_at_commit() {
    let (upstream, first) = init_repo();
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());
    let src = source(&upstream, "deploy", "main");
    repo.resolve(&src).await.unwrap();

    write(upstream.path(), "deploy/app.yaml", "kind: ConfigMap\n");
    let second = commit_all(upstream.path(), "rewrite");
    repo.resolve(&src).await.unwrap();

    let old = repo.get(&src, &first, "deploy/app.yaml").await.unwrap();
    assert!(String::from_utf8(old).unwrap().contains("name: settings"));
    let new = repo.get(&src, &second, "deploy/app.yaml").await.unwrap();
    assert_eq!(new, b"kind: ConfigMap\n");
}

#[tokio::test]
async fn get_missing_file_fails() {
    let (upstream, _) = init_repo();
    let cache = TempDir::new().unwrap();
    let repo = GitRepository::new(cache.path());
    let src = source(&upstream, "deploy", "main");
    let commit = repo.resolve(&src).await.unwrap();

    assert!(repo.get(&src, &commit, "deploy/missing.yaml").await.is_err());
}
