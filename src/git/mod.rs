use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::auth::ResolvedAuth;

pub mod repository;
pub mod transport;

pub use transport::Git2Transport;

pub const ORIGIN: &str = "origin";
pub const DEFAULT_SUBMODULE_RECURSION_DEPTH: usize = 10;

const BRANCH_PREFIX: &str = "refs/heads/";
const TAG_PREFIX: &str = "refs/tags/";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("Branch {branch} cannot be fast-forwarded to {reference}")]
    NonFastForward { branch: String, reference: String },
    #[error("Reference {reference} was not fetched from {remote}")]
    MissingFetchedRef { reference: String, remote: String },
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("No repository found at {0}")]
    NotFound(PathBuf),
    #[error(transparent)]
    Other(TransportError),
}

/// Reference a clone or pull should target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResolvedRef {
    /// Whatever the remote (on clone) or the checked out branch (on pull) tracks.
    #[default]
    Default,
    /// A local branch and the upstream reference it merges from.
    Branch { name: String, merge: String },
    Tag { reference: String },
}

impl ResolvedRef {
    pub fn reference_name(&self) -> Option<&str> {
        match self {
            ResolvedRef::Default => None,
            ResolvedRef::Branch { merge, .. } => Some(merge),
            ResolvedRef::Tag { reference } => Some(reference),
        }
    }
}

/// Where branch and tag names are looked up.
pub trait ReferenceSource {
    /// Upstream merge reference configured for a branch, if the branch is known.
    fn branch_merge(&self, name: &str) -> Result<Option<String>, TransportError>;

    /// Full reference name of a tag, if it exists.
    fn tag_reference(&self, name: &str) -> Result<Option<String>, TransportError>;
}

/// References advertised by a remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRefs {
    pub references: Vec<String>,
}

impl RemoteRefs {
    pub fn new(references: Vec<String>) -> Self {
        Self { references }
    }

    fn contains(&self, reference: &str) -> bool {
        self.references.iter().any(|r| r == reference)
    }
}

impl ReferenceSource for RemoteRefs {
    fn branch_merge(&self, name: &str) -> Result<Option<String>, TransportError> {
        let reference = format!("{BRANCH_PREFIX}{name}");
        Ok(self.contains(&reference).then_some(reference))
    }

    fn tag_reference(&self, name: &str) -> Result<Option<String>, TransportError> {
        let reference = format!("{TAG_PREFIX}{name}");
        Ok(self.contains(&reference).then_some(reference))
    }
}

pub struct CloneOptions<'a> {
    pub url: &'a str,
    pub auth: &'a ResolvedAuth,
    pub reference: &'a ResolvedRef,
    pub submodule_depth: usize,
}

pub struct PullOptions<'a> {
    pub remote: &'a str,
    pub auth: &'a ResolvedAuth,
    pub reference: &'a ResolvedRef,
    pub submodule_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForwarded,
    CheckedOut,
}

/// Clone, open and pull operations against git repositories.
pub trait GitTransport {
    type Repository: ReferenceSource;

    fn open(&self, path: &Path) -> Result<Self::Repository, OpenError>;

    fn list_remote(&self, url: &str, auth: &ResolvedAuth) -> Result<RemoteRefs, TransportError>;

    fn clone_repository(
        &self,
        path: &Path,
        options: &CloneOptions<'_>,
    ) -> Result<Self::Repository, TransportError>;

    /// Checked out working tree of the repository, `None` for bare repositories.
    fn worktree(&self, repository: &Self::Repository) -> Option<PathBuf>;

    fn pull(
        &self,
        repository: &Self::Repository,
        options: &PullOptions<'_>,
    ) -> Result<PullOutcome, TransportError>;
}

impl<T: GitTransport + ?Sized> GitTransport for &T {
    type Repository = T::Repository;

    fn open(&self, path: &Path) -> Result<Self::Repository, OpenError> {
        (**self).open(path)
    }

    fn list_remote(&self, url: &str, auth: &ResolvedAuth) -> Result<RemoteRefs, TransportError> {
        (**self).list_remote(url, auth)
    }

    fn clone_repository(
        &self,
        path: &Path,
        options: &CloneOptions<'_>,
    ) -> Result<Self::Repository, TransportError> {
        (**self).clone_repository(path, options)
    }

    fn worktree(&self, repository: &Self::Repository) -> Option<PathBuf> {
        (**self).worktree(repository)
    }

    fn pull(
        &self,
        repository: &Self::Repository,
        options: &PullOptions<'_>,
    ) -> Result<PullOutcome, TransportError> {
        (**self).pull(repository, options)
    }
}
