use git2::{build::CheckoutBuilder, ErrorCode, Repository};
use log::{debug, info, trace};

use super::{PullOutcome, ReferenceSource, TransportError, BRANCH_PREFIX, TAG_PREFIX};

impl ReferenceSource for Repository {
    fn branch_merge(&self, name: &str) -> Result<Option<String>, TransportError> {
        let key = format!("branch.{name}.merge");
        match self.config()?.get_string(&key) {
            Ok(merge) if !merge.is_empty() => Ok(Some(merge)),
            Ok(_) => Ok(None),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn tag_reference(&self, name: &str) -> Result<Option<String>, TransportError> {
        let reference = format!("{TAG_PREFIX}{name}");
        match self.find_reference(&reference) {
            Ok(_) => Ok(Some(reference)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Remote tracking reference a merge reference is fetched into, e.g.
/// `refs/heads/main` becomes `refs/remotes/origin/main`.
pub(crate) fn tracking_ref(remote: &str, merge: &str) -> String {
    let branch = merge.strip_prefix(BRANCH_PREFIX).unwrap_or(merge);
    format!("refs/remotes/{remote}/{branch}")
}

/// Branch currently checked out together with its configured merge reference.
pub(crate) fn checked_out_branch(
    repo: &Repository,
) -> Result<Option<(String, String)>, TransportError> {
    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !head.is_branch() {
        return Ok(None);
    }
    let Some(name) = head.shorthand() else {
        return Ok(None);
    };
    Ok(repo
        .branch_merge(name)?
        .map(|merge| (name.to_owned(), merge)))
}

/// Moves the local `branch` to the fetched reference when that is a fast-forward,
/// and makes sure the branch is the one checked out.
pub(crate) fn fast_forward(
    repo: &Repository,
    branch: &str,
    fetched: &str,
    remote: &str,
) -> Result<PullOutcome, TransportError> {
    let fetched_ref = match repo.find_reference(fetched) {
        Ok(reference) => reference,
        Err(e) if e.code() == ErrorCode::NotFound => {
            return Err(TransportError::MissingFetchedRef {
                reference: fetched.to_owned(),
                remote: remote.to_owned(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let fetched_commit = repo.reference_to_annotated_commit(&fetched_ref)?;
    let local_name = format!("{BRANCH_PREFIX}{branch}");

    let mut outcome = match repo.find_reference(&local_name) {
        Ok(mut local) => {
            let (analysis, _) = repo.merge_analysis_for_ref(&local, &[&fetched_commit])?;
            if analysis.is_up_to_date() {
                trace!("{} is up to date with {}", local_name, fetched);
                PullOutcome::UpToDate
            } else if analysis.is_fast_forward() {
                info!(
                    "Fast-forwarding {} to {}",
                    local_name,
                    fetched_commit.id()
                );
                local.set_target(
                    fetched_commit.id(),
                    &format!("pull: fast-forward to {fetched}"),
                )?;
                PullOutcome::FastForwarded
            } else {
                return Err(TransportError::NonFastForward {
                    branch: branch.to_owned(),
                    reference: fetched.to_owned(),
                });
            }
        }
        Err(e) if e.code() == ErrorCode::NotFound => {
            debug!("Creating local branch {} at {}", branch, fetched_commit.id());
            repo.reference(
                &local_name,
                fetched_commit.id(),
                false,
                &format!("pull: create from {fetched}"),
            )?;
            PullOutcome::CheckedOut
        }
        Err(e) => return Err(e.into()),
    };

    let head_name = repo
        .head()
        .ok()
        .and_then(|head| head.name().map(str::to_owned));
    if head_name.as_deref() != Some(local_name.as_str()) {
        debug!("Switching HEAD to {}", local_name);
        repo.set_head(&local_name)?;
        outcome = PullOutcome::CheckedOut;
    }

    if outcome != PullOutcome::UpToDate {
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    }

    Ok(outcome)
}

/// Detaches HEAD at the commit a tag points to.
pub(crate) fn checkout_tag(
    repo: &Repository,
    reference: &str,
) -> Result<PullOutcome, TransportError> {
    let commit = repo.find_reference(reference)?.peel_to_commit()?;
    let head_commit = repo.head().ok().and_then(|head| head.target());
    if repo.head_detached().unwrap_or(false) && head_commit == Some(commit.id()) {
        trace!("{} is already checked out", reference);
        return Ok(PullOutcome::UpToDate);
    }

    info!("Checking out {} at {}", reference, commit.id());
    repo.set_head_detached(commit.id())?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    Ok(PullOutcome::CheckedOut)
}
