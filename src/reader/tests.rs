use std::{
    cell::Cell,
    path::{Path, PathBuf},
};

use git2::{Oid, Repository, RepositoryInitOptions, Signature};
use mockall::predicate::eq;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::*;
use crate::{
    git::{PullOutcome, RemoteRefs},
    model::artifact::Credentials,
    secret::MockSecretProvider,
};

/// Repository playing the part of the remote.
struct Upstream {
    dir: TempDir,
    repo: Repository,
}

impl Upstream {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut options = RepositoryInitOptions::new();
        options.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &options).unwrap();
        Self { dir, repo }
    }

    fn url(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    fn commit(&self, path: &str, content: &str) -> Oid {
        let file = self.dir.path().join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&file, content).unwrap();
        self.commit_path(path, Some("HEAD"))
    }

    #[cfg(unix)]
    fn commit_symlink(&self, path: &str, target: &Path) -> Oid {
        std::os::unix::fs::symlink(target, self.dir.path().join(path)).unwrap();
        self.commit_path(path, Some("HEAD"))
    }

    /// Commits `content` on a root commit that no branch points to.
    fn commit_unreachable(&self, path: &str, content: &str) -> Oid {
        std::fs::write(self.dir.path().join(path), content).unwrap();
        self.commit_path(path, None)
    }

    fn commit_path(&self, path: &str, update_ref: Option<&str>) -> Oid {
        let mut index = self.repo.index().unwrap();
        index.add_path(Path::new(path)).unwrap();
        index.write().unwrap();
        let tree = self.repo.find_tree(index.write_tree().unwrap()).unwrap();
        let signature = Signature::now("test", "test@example.com").unwrap();
        let parent = update_ref
            .and_then(|_| self.repo.head().ok())
            .and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<_> = parent.iter().collect();
        self.repo
            .commit(
                update_ref,
                &signature,
                &signature,
                &format!("update {path}"),
                &tree,
                &parents,
            )
            .unwrap()
    }

    fn tag(&self, name: &str, oid: Oid) {
        let object = self.repo.find_object(oid, None).unwrap();
        self.repo.tag_lightweight(name, &object, false).unwrap();
    }

    /// Points `main` at a commit unrelated to its current history.
    fn rewrite_main(&self) {
        let tree = self.repo.head().unwrap().peel_to_tree().unwrap();
        let signature = Signature::now("test", "test@example.com").unwrap();
        let orphan = self
            .repo
            .commit(None, &signature, &signature, "rewrite", &tree, &[])
            .unwrap();
        self.repo
            .reference("refs/heads/main", orphan, true, "rewrite main")
            .unwrap();
    }
}

#[derive(Default)]
struct CountingTransport {
    inner: Git2Transport,
    listings: Cell<usize>,
    clones: Cell<usize>,
    pulls: Cell<usize>,
}

impl CountingTransport {
    fn new() -> Self {
        Self {
            inner: Git2Transport::with_known_hosts(vec![]),
            ..Default::default()
        }
    }

    fn counts(&self) -> (usize, usize) {
        (self.clones.get(), self.pulls.get())
    }
}

impl GitTransport for CountingTransport {
    type Repository = Repository;

    fn open(&self, path: &Path) -> Result<Repository, OpenError> {
        self.inner.open(path)
    }

    fn list_remote(&self, url: &str, auth: &ResolvedAuth) -> Result<RemoteRefs, TransportError> {
        self.listings.set(self.listings.get() + 1);
        self.inner.list_remote(url, auth)
    }

    fn clone_repository(
        &self,
        path: &Path,
        options: &CloneOptions<'_>,
    ) -> Result<Repository, TransportError> {
        self.clones.set(self.clones.get() + 1);
        self.inner.clone_repository(path, options)
    }

    fn worktree(&self, repository: &Repository) -> Option<PathBuf> {
        self.inner.worktree(repository)
    }

    fn pull(
        &self,
        repository: &Repository,
        options: &PullOptions<'_>,
    ) -> Result<PullOutcome, TransportError> {
        self.pulls.set(self.pulls.get() + 1);
        self.inner.pull(repository, options)
    }
}

fn artifact(upstream: &Upstream, clone_directory: &Path) -> ArtifactSpec {
    ArtifactSpec {
        url: upstream.url(),
        clone_directory: clone_directory.to_path_buf(),
        branch: Some("main".to_owned()),
        tag: None,
        file_path: PathBuf::from("config.yaml"),
        namespace: "default".to_owned(),
        credentials: Credentials::None,
    }
}

fn reader(
    transport: &CountingTransport,
) -> GitArtifactReader<MockSecretProvider, &CountingTransport> {
    GitArtifactReader::with_transport(MockSecretProvider::new(), transport)
}

#[test]
fn fresh_directory_is_cloned_then_pulled() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let clone_directory = workspace.path().join("c1");

    let transport = CountingTransport::new();
    let content = reader(&transport)
        .read(&artifact(&upstream, &clone_directory))
        .unwrap();

    assert_eq!(content, b"replicas: 1\n".to_vec());
    assert_eq!(transport.counts(), (1, 1));
    assert!(clone_directory.join(".git").exists());
}

#[test]
fn existing_clone_is_only_pulled() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let spec = artifact(&upstream, &workspace.path().join("c1"));

    let transport = CountingTransport::new();
    let reader = reader(&transport);
    let first = reader.read(&spec).unwrap();
    let second = reader.read(&spec).unwrap();

    assert_eq!(first, second);
    assert_eq!(transport.counts(), (1, 2));
}

#[test]
fn pull_picks_up_new_commits() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let spec = artifact(&upstream, &workspace.path().join("c1"));

    let transport = CountingTransport::new();
    let reader = reader(&transport);
    reader.read(&spec).unwrap();

    upstream.commit("config.yaml", "replicas: 3\n");
    assert_eq!(reader.read(&spec).unwrap(), b"replicas: 3\n".to_vec());
}

#[test]
fn default_reference_follows_remote_head() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));
    spec.branch = None;

    let transport = CountingTransport::new();
    let reader = reader(&transport);
    assert_eq!(reader.read(&spec).unwrap(), b"replicas: 1\n".to_vec());
    assert_eq!(transport.listings.get(), 0);

    upstream.commit("config.yaml", "replicas: 2\n");
    assert_eq!(reader.read(&spec).unwrap(), b"replicas: 2\n".to_vec());
}

#[test]
fn read_tag() {
    let upstream = Upstream::new();
    let tagged = upstream.commit("config.yaml", "version: 1\n");
    upstream.tag("v1", tagged);
    upstream.commit("config.yaml", "version: 2\n");
    let workspace = tempfile::tempdir().unwrap();
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));
    spec.branch = None;
    spec.tag = Some("v1".to_owned());

    let transport = CountingTransport::new();
    let reader = reader(&transport);
    assert_eq!(reader.read(&spec).unwrap(), b"version: 1\n".to_vec());
    assert_eq!(reader.read(&spec).unwrap(), b"version: 1\n".to_vec());
    assert_eq!(transport.counts(), (1, 2));
}

#[test]
fn branch_wins_over_tag() {
    let upstream = Upstream::new();
    let tagged = upstream.commit("config.yaml", "version: 1\n");
    upstream.tag("v1", tagged);
    upstream.commit("config.yaml", "version: 2\n");
    let workspace = tempfile::tempdir().unwrap();
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));
    spec.tag = Some("v1".to_owned());

    let transport = CountingTransport::new();
    assert_eq!(
        reader(&transport).read(&spec).unwrap(),
        b"version: 2\n".to_vec()
    );
}

#[test]
fn missing_branch_is_reported_before_cloning() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let clone_directory = workspace.path().join("c1");
    let mut spec = artifact(&upstream, &clone_directory);
    spec.branch = Some("does-not-exist".to_owned());

    let transport = CountingTransport::new();
    let error = reader(&transport).read(&spec).unwrap_err();

    assert!(matches!(error, ReadError::BranchNotFound { branch, .. } if branch == "does-not-exist"));
    assert_eq!(transport.counts(), (0, 0));
    assert!(!clone_directory.exists());
}

#[test]
fn missing_branch_in_existing_clone() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));

    let transport = CountingTransport::new();
    let reader = reader(&transport);
    reader.read(&spec).unwrap();

    spec.branch = Some("does-not-exist".to_owned());
    let error = reader.read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::BranchNotFound { .. }));
    assert_eq!(transport.counts(), (1, 1));
}

#[test]
fn missing_tag() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));
    spec.branch = None;
    spec.tag = Some("v9".to_owned());

    let transport = CountingTransport::new();
    let error = reader(&transport).read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::TagNotFound { tag, .. } if tag == "v9"));
    assert_eq!(transport.counts(), (0, 0));
}

#[test]
fn missing_file() {
    let upstream = Upstream::new();
    upstream.commit("sensors/webhook.yaml", "kind: Sensor\n");
    let workspace = tempfile::tempdir().unwrap();
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));

    let transport = CountingTransport::new();
    let reader = reader(&transport);
    let error = reader.read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::FileOpenFailed { .. }));

    spec.file_path = PathBuf::from("sensors");
    let error = reader.read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::FileOpenFailed { .. }));

    spec.file_path = PathBuf::from("sensors/webhook.yaml");
    assert_eq!(reader.read(&spec).unwrap(), b"kind: Sensor\n".to_vec());
}

#[test]
fn file_path_stays_inside_worktree() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let outside = workspace.path().join("outside.txt");
    std::fs::write(&outside, "SECRET").unwrap();
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));

    let transport = CountingTransport::new();
    let reader = reader(&transport);

    spec.file_path = PathBuf::from("../outside.txt");
    let error = reader.read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::FileOpenFailed { .. }));

    spec.file_path = PathBuf::from("sub/../../outside.txt");
    let error = reader.read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::FileOpenFailed { .. }));

    // Absolute paths are rooted at the worktree
    spec.file_path = outside.clone();
    let error = reader.read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::FileOpenFailed { .. }));

    spec.file_path = PathBuf::from("/config.yaml");
    assert_eq!(reader.read(&spec).unwrap(), b"replicas: 1\n".to_vec());

    spec.file_path = PathBuf::from("./nested/../config.yaml");
    assert_eq!(reader.read(&spec).unwrap(), b"replicas: 1\n".to_vec());
}

#[cfg(unix)]
#[test]
fn symlink_out_of_worktree_is_rejected() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let outside = workspace.path().join("outside.txt");
    std::fs::write(&outside, "SECRET").unwrap();
    upstream.commit_symlink("link.txt", &outside);
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));
    spec.file_path = PathBuf::from("link.txt");

    let transport = CountingTransport::new();
    let clone_directory = spec.clone_directory.clone();
    let error = reader(&transport).read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::FileOpenFailed { .. }));
    assert!(clone_directory.join("link.txt").is_symlink());
}

#[test]
fn tag_on_commit_outside_any_branch() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "version: main\n");
    let detached = upstream.commit_unreachable("config.yaml", "version: detached\n");
    upstream.tag("detached", detached);
    let workspace = tempfile::tempdir().unwrap();
    let mut spec = artifact(&upstream, &workspace.path().join("c1"));
    spec.branch = None;
    spec.tag = Some("detached".to_owned());

    let transport = CountingTransport::new();
    let reader = reader(&transport);
    assert_eq!(reader.read(&spec).unwrap(), b"version: detached\n".to_vec());
    assert_eq!(reader.read(&spec).unwrap(), b"version: detached\n".to_vec());
    assert_eq!(transport.counts(), (1, 2));
}

#[test]
fn password_lookup_failure_prevents_clone() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let clone_directory = workspace.path().join("c1");
    let mut spec = artifact(&upstream, &clone_directory);
    spec.credentials = Credentials::BasicAuth {
        username: SecretRef::new("git-creds", "username"),
        password: SecretRef::new("git-creds", "password"),
    };

    let mut secrets = MockSecretProvider::new();
    secrets
        .expect_get_secret()
        .with(eq("default"), eq("git-creds"), eq("username"))
        .returning(|_, _, _| Ok(b"robot".to_vec()));
    secrets
        .expect_get_secret()
        .with(eq("default"), eq("git-creds"), eq("password"))
        .returning(|_, _, _| Err(SecretError::Other("forbidden".to_owned())));

    let transport = CountingTransport::new();
    let error = GitArtifactReader::with_transport(secrets, &transport)
        .read(&spec)
        .unwrap_err();

    assert!(matches!(error, ReadError::SecretLookupFailed { .. }));
    assert_eq!(transport.counts(), (0, 0));
    assert_eq!(transport.listings.get(), 0);
    assert!(!clone_directory.exists());
}

#[test]
fn diverged_remote_fails_pull() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let spec = artifact(&upstream, &workspace.path().join("c1"));

    let transport = CountingTransport::new();
    let reader = reader(&transport);
    reader.read(&spec).unwrap();

    upstream.rewrite_main();
    let error = reader.read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::PullFailed { .. }));
}

#[test]
fn bare_repository_has_no_worktree() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let clone_directory = workspace.path().join("c1");
    Repository::init_bare(&clone_directory).unwrap();

    let transport = CountingTransport::new();
    let error = reader(&transport)
        .read(&artifact(&upstream, &clone_directory))
        .unwrap_err();
    assert!(matches!(error, ReadError::WorktreeUnavailable { .. }));
    assert_eq!(transport.counts(), (0, 0));
}

#[test]
fn broken_repository_is_not_recloned() {
    let upstream = Upstream::new();
    upstream.commit("config.yaml", "replicas: 1\n");
    let workspace = tempfile::tempdir().unwrap();
    let clone_directory = workspace.path().join("c1");
    std::fs::create_dir_all(&clone_directory).unwrap();
    std::fs::write(clone_directory.join(".git"), "not a gitdir").unwrap();

    let transport = CountingTransport::new();
    let error = reader(&transport)
        .read(&artifact(&upstream, &clone_directory))
        .unwrap_err();
    assert!(matches!(error, ReadError::RepositoryOpenFailed { .. }));
    assert_eq!(transport.counts(), (0, 0));
}

#[test]
fn reference_precedence() {
    let refs = RemoteRefs::new(vec![
        "refs/heads/main".to_owned(),
        "refs/tags/v1".to_owned(),
    ]);
    assert_eq!(
        resolve_reference(&refs, Some("main"), Some("v1")).unwrap(),
        ResolvedRef::Branch {
            name: "main".to_owned(),
            merge: "refs/heads/main".to_owned(),
        }
    );
    assert_eq!(
        resolve_reference(&refs, None, Some("v1")).unwrap(),
        ResolvedRef::Tag {
            reference: "refs/tags/v1".to_owned()
        }
    );
    assert_eq!(
        resolve_reference(&refs, Some(""), None).unwrap(),
        ResolvedRef::Default
    );
    assert!(matches!(
        resolve_reference(&refs, Some("v1"), Some("v1")),
        Err(ReadError::BranchNotFound { .. })
    ));
}

#[test]
fn resolve_ssh_key_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let path = crate::auth::write_test_ssh_key(dir.path());
    let spec = ArtifactSpec {
        url: "ssh://git@example.com/org/repo.git".to_owned(),
        clone_directory: dir.path().join("c1"),
        branch: None,
        tag: None,
        file_path: PathBuf::from("config.yaml"),
        namespace: "default".to_owned(),
        credentials: Credentials::SshKey { path },
    };
    let reader = GitArtifactReader::new(MockSecretProvider::new());
    assert!(matches!(
        reader.resolve_auth(&spec).unwrap(),
        ResolvedAuth::SshKey { .. }
    ));
}

#[test]
fn unreachable_remote_fails_clone() {
    let workspace = tempfile::tempdir().unwrap();
    let spec = ArtifactSpec {
        url: workspace
            .path()
            .join("no-such-remote")
            .to_string_lossy()
            .to_string(),
        clone_directory: workspace.path().join("c1"),
        branch: None,
        tag: None,
        file_path: PathBuf::from("config.yaml"),
        namespace: "default".to_owned(),
        credentials: Credentials::None,
    };

    let transport = CountingTransport::new();
    let error = reader(&transport).read(&spec).unwrap_err();
    assert!(matches!(error, ReadError::CloneFailed { .. }));
    assert_eq!(transport.counts(), (1, 0));
}
