use std::path::{Component, Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::{
    auth::{resolve_auth, ResolvedAuth, SshKeyError},
    git::{
        CloneOptions, Git2Transport, GitTransport, OpenError, PullOptions, ReferenceSource,
        ResolvedRef, TransportError, DEFAULT_SUBMODULE_RECURSION_DEPTH, ORIGIN,
    },
    model::artifact::{ArtifactSpec, SecretRef},
    secret::{SecretError, SecretProvider},
};

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Failed to open repository at {path}: {source}")]
    RepositoryOpenFailed {
        path: PathBuf,
        source: TransportError,
    },
    #[error("Failed to clone {url} into {path}: {source}")]
    CloneFailed {
        url: String,
        path: PathBuf,
        source: TransportError,
    },
    #[error("Failed to retrieve secret {secret}: {source}")]
    SecretLookupFailed {
        secret: SecretRef,
        source: SecretError,
    },
    #[error("Invalid ssh key {path}: {source}")]
    SshKeyInvalid { path: PathBuf, source: SshKeyError },
    #[error("Branch {branch} not found")]
    BranchNotFound {
        branch: String,
        #[source]
        source: Option<TransportError>,
    },
    #[error("Tag {tag} not found")]
    TagNotFound {
        tag: String,
        #[source]
        source: Option<TransportError>,
    },
    #[error("Repository at {path} has no working tree")]
    WorktreeUnavailable { path: PathBuf },
    #[error("Failed to pull latest updates into {path}: {source}")]
    PullFailed {
        path: PathBuf,
        source: TransportError,
    },
    #[error("Failed to open resource file {path}: {source}")]
    FileOpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Reads single files out of git repositories, cloning them on first use and
/// pulling them on every read.
pub struct GitArtifactReader<S, T = Git2Transport> {
    secrets: S,
    transport: T,
    submodule_depth: usize,
}

impl<S: SecretProvider> GitArtifactReader<S> {
    pub fn new(secrets: S) -> Self {
        Self::with_transport(secrets, Git2Transport::new())
    }
}

impl<S: SecretProvider, T: GitTransport> GitArtifactReader<S, T> {
    pub fn with_transport(secrets: S, transport: T) -> Self {
        Self {
            secrets,
            transport,
            submodule_depth: DEFAULT_SUBMODULE_RECURSION_DEPTH,
        }
    }

    /// Maximum depth of nested submodules followed on clone and pull.
    pub fn submodule_depth(mut self, depth: usize) -> Self {
        self.submodule_depth = depth;
        self
    }

    /// Returns the contents of `spec.file_path` at the latest commit of the requested ref.
    pub fn read(&self, spec: &ArtifactSpec) -> Result<Vec<u8>, ReadError> {
        let repo = match self.transport.open(&spec.clone_directory) {
            Ok(repo) => {
                debug!(
                    "Found existing repository at {}",
                    spec.clone_directory.display()
                );
                repo
            }
            Err(OpenError::NotFound(_)) => self.clone_repository(spec)?,
            Err(OpenError::Other(source)) => {
                return Err(ReadError::RepositoryOpenFailed {
                    path: spec.clone_directory.clone(),
                    source,
                })
            }
        };
        self.read_from_repository(spec, &repo)
    }

    fn clone_repository(&self, spec: &ArtifactSpec) -> Result<T::Repository, ReadError> {
        let clone_failed = |source| ReadError::CloneFailed {
            url: spec.url.clone(),
            path: spec.clone_directory.clone(),
            source,
        };

        let auth = self.resolve_auth(spec)?;
        let reference = if spec.branch.is_some() || spec.tag.is_some() {
            let remote_refs = self
                .transport
                .list_remote(&spec.url, &auth)
                .map_err(clone_failed)?;
            resolve_reference(&remote_refs, spec.branch.as_deref(), spec.tag.as_deref())?
        } else {
            ResolvedRef::Default
        };

        let options = CloneOptions {
            url: &spec.url,
            auth: &auth,
            reference: &reference,
            submodule_depth: self.submodule_depth,
        };
        self.transport
            .clone_repository(&spec.clone_directory, &options)
            .map_err(clone_failed)
    }

    fn read_from_repository(
        &self,
        spec: &ArtifactSpec,
        repo: &T::Repository,
    ) -> Result<Vec<u8>, ReadError> {
        let worktree =
            self.transport
                .worktree(repo)
                .ok_or_else(|| ReadError::WorktreeUnavailable {
                    path: spec.clone_directory.clone(),
                })?;

        let auth = self.resolve_auth(spec)?;
        let reference = resolve_reference(repo, spec.branch.as_deref(), spec.tag.as_deref())?;

        let options = PullOptions {
            remote: ORIGIN,
            auth: &auth,
            reference: &reference,
            submodule_depth: self.submodule_depth,
        };
        let outcome =
            self.transport
                .pull(repo, &options)
                .map_err(|source| ReadError::PullFailed {
                    path: spec.clone_directory.clone(),
                    source,
                })?;
        info!(
            "Pulled {} ({:?}) into {}",
            reference.reference_name().unwrap_or("tracked branch"),
            outcome,
            spec.clone_directory.display()
        );

        read_file(&worktree, &spec.file_path)
    }

    fn resolve_auth(&self, spec: &ArtifactSpec) -> Result<ResolvedAuth, ReadError> {
        resolve_auth(&self.secrets, &spec.namespace, &spec.credentials)
    }
}

/// Branch takes precedence over tag; neither means the default reference.
pub fn resolve_reference<R: ReferenceSource + ?Sized>(
    source: &R,
    branch: Option<&str>,
    tag: Option<&str>,
) -> Result<ResolvedRef, ReadError> {
    if let Some(branch) = branch.filter(|b| !b.is_empty()) {
        return match source.branch_merge(branch) {
            Ok(Some(merge)) => Ok(ResolvedRef::Branch {
                name: branch.to_owned(),
                merge,
            }),
            Ok(None) => Err(ReadError::BranchNotFound {
                branch: branch.to_owned(),
                source: None,
            }),
            Err(e) => Err(ReadError::BranchNotFound {
                branch: branch.to_owned(),
                source: Some(e),
            }),
        };
    }
    if let Some(tag) = tag.filter(|t| !t.is_empty()) {
        return match source.tag_reference(tag) {
            Ok(Some(reference)) => Ok(ResolvedRef::Tag { reference }),
            Ok(None) => Err(ReadError::TagNotFound {
                tag: tag.to_owned(),
                source: None,
            }),
            Err(e) => Err(ReadError::TagNotFound {
                tag: tag.to_owned(),
                source: Some(e),
            }),
        };
    }
    Ok(ResolvedRef::Default)
}

/// Joins `file_path` onto the worktree like a chrooted filesystem would: a leading
/// root is taken relative to the worktree and `..` may not climb above it.
fn worktree_path(worktree: &Path, file_path: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in file_path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return None;
                }
            }
            Component::Normal(part) => relative.push(part),
        }
    }
    Some(worktree.join(relative))
}

fn read_file(worktree: &Path, file_path: &Path) -> Result<Vec<u8>, ReadError> {
    let outside_worktree = |path: PathBuf| ReadError::FileOpenFailed {
        path,
        source: std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "path leaves the working tree",
        ),
    };
    let path = worktree_path(worktree, file_path)
        .ok_or_else(|| outside_worktree(worktree.join(file_path)))?;
    let file_open_failed = |source| ReadError::FileOpenFailed {
        path: path.clone(),
        source,
    };

    // Symlinks in the checkout must not point out of it either
    let resolved = path.canonicalize().map_err(file_open_failed)?;
    let root = worktree.canonicalize().map_err(file_open_failed)?;
    if !resolved.starts_with(&root) {
        return Err(outside_worktree(path.clone()));
    }

    let metadata = std::fs::metadata(&resolved).map_err(file_open_failed)?;
    if !metadata.is_file() {
        return Err(file_open_failed(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    std::fs::read(&resolved).map_err(file_open_failed)
}

#[cfg(test)]
mod tests;
