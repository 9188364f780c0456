use std::path::{Path, PathBuf};

use git2::{
    build::RepoBuilder, cert::Cert, AutotagOption, CertificateCheckStatus, Cred, CredentialType,
    Direction, ErrorCode, FetchOptions, Remote, RemoteCallbacks, Repository,
    SubmoduleUpdateOptions,
};
use hmac::{Hmac, Mac};
use home::home_dir;
use log::{debug, info, trace};
use sha1::Sha1;
use ssh_key::{known_hosts::HostPatterns, KnownHosts};

use crate::auth::ResolvedAuth;

use super::{
    repository::{checked_out_branch, checkout_tag, fast_forward, tracking_ref},
    CloneOptions, GitTransport, OpenError, PullOptions, PullOutcome, RemoteRefs, ResolvedRef,
    TransportError, BRANCH_PREFIX, ORIGIN,
};

const GLOBAL_KNOWN_HOSTS: &str = "/etc/ssh/ssh_known_hosts";
const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// Transport backed by libgit2.
pub struct Git2Transport {
    known_hosts: Vec<PathBuf>,
}

impl Default for Git2Transport {
    fn default() -> Self {
        let mut known_hosts = vec![PathBuf::from(GLOBAL_KNOWN_HOSTS)];
        if let Some(home) = home_dir() {
            known_hosts.push(home.join(".ssh").join("known_hosts"));
        }
        Self { known_hosts }
    }
}

impl Git2Transport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_hosts(known_hosts: Vec<PathBuf>) -> Self {
        Self { known_hosts }
    }

    fn remote_callbacks<'a>(&'a self, auth: &'a ResolvedAuth) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        let mut attempts = 0;
        callbacks.credentials(move |url, username, allowed_types| {
            trace!(
                "Requested credentials for {}, username {:?}, allowed types {:?}",
                url,
                username,
                allowed_types
            );
            // libgit2 keeps asking as long as we keep answering
            attempts += 1;
            if attempts > MAX_CREDENTIAL_ATTEMPTS {
                return Err(git2::Error::from_str("authentication rejected"));
            }
            credentials(auth, allowed_types)
        });
        callbacks
            .certificate_check(move |certificate, host| self.check_certificate(certificate, host));
        callbacks
    }

    fn fetch_options<'a>(&'a self, auth: &'a ResolvedAuth) -> FetchOptions<'a> {
        let mut fetch_options = FetchOptions::new();
        fetch_options
            .remote_callbacks(self.remote_callbacks(auth))
            .download_tags(AutotagOption::Auto);
        fetch_options
    }

    fn fetch(
        &self,
        remote: &mut Remote<'_>,
        refspecs: &[String],
        auth: &ResolvedAuth,
    ) -> Result<(), TransportError> {
        debug!("Fetching {:?} from {}", refspecs, remote.name().unwrap_or(""));
        remote.fetch(refspecs, Some(&mut self.fetch_options(auth)), None)?;
        Ok(())
    }

    fn pull_branch(
        &self,
        repo: &Repository,
        remote: &mut Remote<'_>,
        branch: &str,
        merge: &str,
        options: &PullOptions<'_>,
    ) -> Result<PullOutcome, TransportError> {
        let tracking = tracking_ref(options.remote, merge);
        self.fetch(remote, &[format!("+{merge}:{tracking}")], options.auth)?;
        fast_forward(repo, branch, &tracking, options.remote)
    }

    fn update_submodules(
        &self,
        repo: &Repository,
        auth: &ResolvedAuth,
        depth: usize,
    ) -> Result<(), TransportError> {
        if depth == 0 {
            return Ok(());
        }
        for mut submodule in repo.submodules()? {
            debug!("Updating submodule {}", submodule.path().display());
            let mut options = SubmoduleUpdateOptions::new();
            options.fetch(self.fetch_options(auth));
            submodule.update(true, Some(&mut options))?;
            let nested = submodule.open()?;
            self.update_submodules(&nested, auth, depth - 1)?;
        }
        Ok(())
    }

    fn check_certificate(
        &self,
        certificate: &Cert<'_>,
        host: &str,
    ) -> Result<CertificateCheckStatus, git2::Error> {
        if let Some(hostkey) = certificate.as_hostkey().and_then(|h| h.hostkey()) {
            for known_hosts in &self.known_hosts {
                trace!("Loading {}", known_hosts.display());
                let entries = match KnownHosts::read_file(known_hosts) {
                    Ok(entries) => entries,
                    Err(error) => {
                        trace!("Could not load {}: {}", known_hosts.display(), error);
                        continue;
                    }
                };
                let matched = entries.iter().any(|entry| {
                    host_matches_patterns(host, entry.host_patterns())
                        && entry.public_key().to_bytes().as_deref() == Ok(hostkey)
                });
                if matched {
                    trace!("Host key of {} found in {}", host, known_hosts.display());
                    return Ok(CertificateCheckStatus::CertificateOk);
                }
            }
            trace!("No known host entry matched the host key of {}", host);
        }
        Ok(CertificateCheckStatus::CertificatePassthrough)
    }
}

impl GitTransport for Git2Transport {
    type Repository = Repository;

    fn open(&self, path: &Path) -> Result<Repository, OpenError> {
        trace!("Opening existing repository at {}", path.display());
        match Repository::open(path) {
            Ok(repo) => Ok(repo),
            Err(e) if e.code() == ErrorCode::NotFound => {
                Err(OpenError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(OpenError::Other(e.into())),
        }
    }

    fn list_remote(&self, url: &str, auth: &ResolvedAuth) -> Result<RemoteRefs, TransportError> {
        trace!("Listing references of {}", url);
        let mut remote = Remote::create_detached(url)?;
        let connection =
            remote.connect_auth(Direction::Fetch, Some(self.remote_callbacks(auth)), None)?;
        let references = connection
            .list()?
            .iter()
            .map(|head| head.name().to_owned())
            .collect();
        Ok(RemoteRefs::new(references))
    }

    fn clone_repository(
        &self,
        path: &Path,
        options: &CloneOptions<'_>,
    ) -> Result<Repository, TransportError> {
        let mut builder = RepoBuilder::new();
        builder.fetch_options(self.fetch_options(options.auth));
        if let ResolvedRef::Branch { merge, .. } = options.reference {
            builder.branch(merge.strip_prefix(BRANCH_PREFIX).unwrap_or(merge));
        }

        info!("Cloning {} into {}", options.url, path.display());
        let repo = builder.clone(options.url, path)?;
        if let ResolvedRef::Tag { reference } = options.reference {
            // Tags are only auto-followed when a cloned branch reaches them
            let mut remote = repo.find_remote(ORIGIN)?;
            self.fetch(
                &mut remote,
                &[format!("+{reference}:{reference}")],
                options.auth,
            )?;
        }
        self.update_submodules(&repo, options.auth, options.submodule_depth)?;
        Ok(repo)
    }

    fn worktree(&self, repository: &Repository) -> Option<PathBuf> {
        repository.workdir().map(Path::to_path_buf)
    }

    fn pull(
        &self,
        repo: &Repository,
        options: &PullOptions<'_>,
    ) -> Result<PullOutcome, TransportError> {
        let mut remote = repo.find_remote(options.remote)?;

        let outcome = match options.reference {
            ResolvedRef::Branch { name, merge } => {
                self.pull_branch(repo, &mut remote, name, merge, options)?
            }
            ResolvedRef::Tag { reference } => {
                self.fetch(
                    &mut remote,
                    &[format!("+{reference}:{reference}")],
                    options.auth,
                )?;
                checkout_tag(repo, reference)?
            }
            ResolvedRef::Default => match checked_out_branch(repo)? {
                Some((name, merge)) => {
                    self.pull_branch(repo, &mut remote, &name, &merge, options)?
                }
                None => {
                    debug!("HEAD does not track a branch, only fetching");
                    let refspecs: Vec<String> = remote
                        .fetch_refspecs()?
                        .iter()
                        .flatten()
                        .map(str::to_owned)
                        .collect();
                    self.fetch(&mut remote, &refspecs, options.auth)?;
                    PullOutcome::UpToDate
                }
            },
        };

        self.update_submodules(repo, options.auth, options.submodule_depth)?;
        Ok(outcome)
    }
}

fn credentials(auth: &ResolvedAuth, allowed_types: CredentialType) -> Result<Cred, git2::Error> {
    match auth {
        ResolvedAuth::Basic { username, password }
            if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) =>
        {
            Cred::userpass_plaintext(username, password)
        }
        // Asking for ssh username
        ResolvedAuth::SshKey { username, .. }
            if allowed_types.contains(CredentialType::USERNAME) =>
        {
            Cred::username(username)
        }
        ResolvedAuth::SshKey {
            username,
            private_key,
            ..
        } if allowed_types.contains(CredentialType::SSH_KEY) => {
            Cred::ssh_key_from_memory(username, None, private_key, None)
        }
        _ => Err(git2::Error::from_str("no valid authentication available")),
    }
}

/// Matches a host against a known_hosts pattern list. Plain patterns may use `*` and
/// `?` wildcards and `!` negation, hashed names are compared by their HMAC-SHA1.
fn host_matches_patterns(host: &str, patterns: &HostPatterns) -> bool {
    let host = host.to_lowercase();
    match patterns {
        HostPatterns::Patterns(patterns) => {
            let mut matched = false;
            for pattern in patterns {
                let pattern = pattern.to_lowercase();
                match pattern.strip_prefix('!') {
                    Some(negated) if wildcard_match(negated.as_bytes(), host.as_bytes()) => {
                        return false
                    }
                    Some(_) => {}
                    None => matched |= wildcard_match(pattern.as_bytes(), host.as_bytes()),
                }
            }
            matched
        }
        HostPatterns::HashedName { salt, hash } => {
            let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(salt) else {
                return false;
            };
            mac.update(host.as_bytes());
            mac.verify_slice(hash).is_ok()
        }
    }
}

fn wildcard_match(pattern: &[u8], host: &[u8]) -> bool {
    match (pattern.split_first(), host.split_first()) {
        (None, None) => true,
        (Some((&b'*', rest)), _) => {
            wildcard_match(rest, host)
                || host
                    .split_first()
                    .is_some_and(|(_, host_rest)| wildcard_match(pattern, host_rest))
        }
        (Some((&b'?', rest)), Some((_, host_rest))) => wildcard_match(rest, host_rest),
        (Some((p, rest)), Some((h, host_rest))) if p == h => wildcard_match(rest, host_rest),
        _ => false,
    }
}
