//! Updater (spec §4.10): given an [`AvailableUpdate`](crate::scanner::AvailableUpdate)
//! for one [`UpdateInstruction`], rewrites the source file in the project's
//! Git work directory and lands the change on the base branch, either by
//! pushing directly or by opening a pull request on a side branch.
//!
//! Grounded on the teacher's `git.rs` commit/push plumbing (this codebase
//! otherwise only ever fetches); the rewrite-in-place + commit + push
//! sequence below is the write-side complement of [`crate::git`].

use crate::builder::{Integration, UpdateInstruction, UpdateTarget};
use crate::errors::{CommandError, CoreError};
use crate::git::CredentialProvider;
use async_trait::async_trait;
use git2::{
    CertificateCheckStatus, PushOptions, Remote, RemoteCallbacks, Repository, Signature,
};
use std::path::Path;

/// Result of a successful update write-back.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub commit_hash: String,
    pub branch: String,
}

/// The provider API surface the `PR` integration needs (spec §4.10,
/// §6 "Wire"). A thin seam: the concrete implementation speaks whichever
/// REST dialect the hosting provider (GitHub, GitLab, ...) exposes.
#[async_trait]
pub trait PullRequestProvider: Send + Sync {
    /// Opens a pull request from `head` onto `base`. Implementations must
    /// treat a "pull request already exists for this head" response as
    /// success, per spec §4.10 and the PR-version-bump end-to-end
    /// scenario (§8).
    async fn open_pull_request(&self, base: &str, head: &str, title: &str) -> Result<(), CoreError>;
}

/// Used when a project's `vcs-auth-{name}` secret carries no `token` key:
/// `Direct` updates work fine without one, but a `PR`-integration
/// instruction has nothing to open a pull request with. Surfaced as a
/// `Permanent` error rather than silently downgrading to `Direct`, since
/// doing the latter would land on the base branch without the operator's
/// requested review step.
pub struct UnconfiguredPullRequestProvider;

#[async_trait]
impl PullRequestProvider for UnconfiguredPullRequestProvider {
    async fn open_pull_request(&self, _base: &str, _head: &str, _title: &str) -> Result<(), CoreError> {
        Err(CoreError::permanent(
            "PullRequestProviderNotConfigured",
            CommandError::new_from_safe_message("project carries no VCS token; cannot open a pull request for a PR-integration update".to_string()),
        ))
    }
}

pub struct GitHubPullRequestProvider {
    pub client: reqwest::Client,
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub token: String,
}

#[async_trait]
impl PullRequestProvider for GitHubPullRequestProvider {
    async fn open_pull_request(&self, base: &str, head: &str, title: &str) -> Result<(), CoreError> {
        let url = format!("{}/repos/{}/{}/pulls", self.api_base, self.owner, self.repo);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({"title": title, "head": head, "base": base}))
            .send()
            .await
            .map_err(CoreError::from)?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            if body.contains("already exists") {
                return Ok(());
            }
            return Err(CoreError::permanent("PullRequestCreateFailed", CommandError::new_from_safe_message(body)));
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(CoreError::transient(
            "PullRequestCreateFailed",
            CommandError::new(format!("provider returned {status}"), Some(body)),
        ))
    }
}

pub struct Updater {
    pull_request_provider: std::sync::Arc<dyn PullRequestProvider>,
    credentials: std::sync::Arc<dyn CredentialProvider>,
    base_branch: String,
    committer: Signature<'static>,
}

impl Updater {
    pub fn new(
        pull_request_provider: std::sync::Arc<dyn PullRequestProvider>,
        credentials: std::sync::Arc<dyn CredentialProvider>,
        base_branch: String,
    ) -> Result<Self, CoreError> {
        let committer = Signature::now("navecd", "navecd@users.noreply.github.com")
            .map_err(|err| CoreError::permanent("InvalidCommitterSignature", err))?;
        Ok(Updater { pull_request_provider, credentials, base_branch, committer })
    }

    /// Applies `update` to `instruction` in `work_dir` and lands it on the
    /// base branch per `instruction.integration`.
    pub async fn apply(&self, work_dir: &Path, instruction: &UpdateInstruction, update: &crate::scanner::AvailableUpdate) -> Result<UpdateOutcome, CoreError> {
        let work_dir = work_dir.to_path_buf();
        let instruction = instruction.clone();
        let update = update.clone();
        let base_branch = self.base_branch.clone();
        let pull_request_provider = self.pull_request_provider.clone();
        let credentials = self.credentials.clone();
        let committer = self.committer.clone();

        let landing = tokio::task::spawn_blocking(move || Self::apply_blocking(&work_dir, &instruction, &update, &base_branch, credentials.as_ref(), &committer))
            .await
            .map_err(|err| CoreError::permanent("UpdaterTaskPanicked", CommandError::new_from_safe_message(err.to_string())))??;

        match landing {
            PendingLanding::Done(outcome) => Ok(outcome),
            PendingLanding::NeedsPullRequest { outcome, base, head, title } => {
                pull_request_provider.open_pull_request(&base, &head, &title).await?;
                Ok(outcome)
            }
        }
    }

    fn apply_blocking(
        work_dir: &Path,
        instruction: &UpdateInstruction,
        update: &crate::scanner::AvailableUpdate,
        base_branch: &str,
        credentials: &dyn CredentialProvider,
        committer: &Signature<'static>,
    ) -> Result<PendingLanding, CoreError> {
        let repo = Repository::open(work_dir).map_err(CoreError::from)?;
        let work_branch = match instruction.integration {
            Integration::Direct => base_branch.to_string(),
            Integration::Pr => crate::scanner::update_branch_name(&instruction.target),
        };

        checkout_branch(&repo, base_branch, &work_branch, matches!(instruction.integration, Integration::Pr)).map_err(CoreError::from)?;
        rewrite_file(work_dir, instruction, update)?;
        let commit_hash = commit_all(&repo, committer, &crate::scanner::commit_message(&instruction.target, &update.new_version)).map_err(CoreError::from)?;
        push_branch(&repo, &work_branch, credentials).map_err(CoreError::from)?;

        if matches!(instruction.integration, Integration::Direct) {
            return Ok(PendingLanding::Done(UpdateOutcome { commit_hash, branch: work_branch }));
        }

        checkout_branch(&repo, base_branch, base_branch, false).map_err(CoreError::from)?;
        Ok(PendingLanding::NeedsPullRequest {
            outcome: UpdateOutcome { commit_hash, branch: work_branch.clone() },
            base: base_branch.to_string(),
            head: work_branch,
            title: crate::scanner::commit_message(&instruction.target, &update.new_version),
        })
    }
}

enum PendingLanding {
    Done(UpdateOutcome),
    NeedsPullRequest { outcome: UpdateOutcome, base: String, head: String, title: String },
}

fn checkout_branch(repo: &Repository, base_branch: &str, target_branch: &str, create_if_absent: bool) -> Result<(), git2::Error> {
    let remote_ref = format!("refs/remotes/origin/{target_branch}");
    let local_exists = repo.find_branch(target_branch, git2::BranchType::Local).is_ok();

    if !local_exists {
        let start_point = match repo.find_reference(&remote_ref) {
            Ok(reference) => reference.peel_to_commit()?,
            Err(_) if create_if_absent => repo.find_branch(base_branch, git2::BranchType::Local)?.get().peel_to_commit()?,
            Err(err) => return Err(err),
        };
        repo.branch(target_branch, &start_point, false)?;
    }

    let object = repo.revparse_single(&format!("refs/heads/{target_branch}"))?;
    repo.checkout_tree(&object, None)?;
    repo.set_head(&format!("refs/heads/{target_branch}"))?;
    Ok(())
}

fn rewrite_file(work_dir: &Path, instruction: &UpdateInstruction, update: &crate::scanner::AvailableUpdate) -> Result<(), CoreError> {
    let path = work_dir.join(&instruction.file);
    let original = std::fs::read_to_string(&path)?;

    let current_version = match &instruction.target {
        UpdateTarget::Container { image, .. } => crate::scanner::split_image_reference(image).1,
        UpdateTarget::Chart { chart } => chart.version.clone(),
    };

    let rewritten = replace_on_line(&original, instruction.line, &current_version, &update.new_version).ok_or_else(|| {
        CoreError::permanent(
            "UpdateTargetNotFound",
            CommandError::new_from_safe_message(format!("could not find version {current_version} on line {} of {}", instruction.line, path.display())),
        )
    })?;

    std::fs::write(&path, rewritten)?;
    Ok(())
}

/// Replaces the first occurrence of `needle` on line `line_number`
/// (0-indexed; `0` means "search the whole file" — the builder does not
/// always know the exact line for annotation-harvested instructions).
fn replace_on_line(content: &str, line_number: usize, needle: &str, replacement: &str) -> Option<String> {
    if line_number == 0 {
        return content.contains(needle).then(|| content.replacen(needle, replacement, 1));
    }
    let mut lines: Vec<&str> = content.lines().collect();
    let target = lines.get(line_number.saturating_sub(1))?;
    if !target.contains(needle) {
        return None;
    }
    let rewritten_line = target.replacen(needle, replacement, 1);
    let owned = rewritten_line;
    lines[line_number - 1] = &owned;
    let mut joined = lines.join("\n");
    if content.ends_with('\n') {
        joined.push('\n');
    }
    Some(joined)
}

fn commit_all(repo: &Repository, committer: &Signature<'static>, message: &str) -> Result<String, git2::Error> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo.head()?.peel_to_commit()?;
    let commit_id = repo.commit(Some("HEAD"), committer, committer, message, &tree, &[&parent])?;
    Ok(commit_id.to_string())
}

fn push_branch(repo: &Repository, branch: &str, credentials: &dyn CredentialProvider) -> Result<(), git2::Error> {
    let mut remote: Remote = repo.find_remote("origin")?;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(crate::git::authentication_callback(credentials));
    callbacks.certificate_check(|_, _| Ok(CertificateCheckStatus::CertificateOk));

    let mut push_opts = PushOptions::new();
    push_opts.remote_callbacks(callbacks);
    remote.push(&[format!("refs/heads/{branch}:refs/heads/{branch}")], Some(&mut push_opts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_on_line_zero_searches_whole_file() {
        let content = "image: myimage:1.15.0\nother: line\n";
        let rewritten = replace_on_line(content, 0, "1.15.0", "1.16.5").unwrap();
        assert_eq!(rewritten, "image: myimage:1.16.5\nother: line\n");
    }

    #[test]
    fn replace_on_line_targets_specific_line_only() {
        let content = "version: 1.15.0\nversion: 1.15.0\n";
        let rewritten = replace_on_line(content, 2, "1.15.0", "1.16.5").unwrap();
        assert_eq!(rewritten, "version: 1.15.0\nversion: 1.16.5\n");
    }

    #[test]
    fn replace_on_line_returns_none_when_needle_absent() {
        let content = "version: 1.15.0\n";
        assert!(replace_on_line(content, 1, "9.9.9", "1.16.5").is_none());
    }

    #[tokio::test]
    async fn unconfigured_pull_request_provider_fails_permanently() {
        let provider = UnconfiguredPullRequestProvider;
        let err = provider.open_pull_request("main", "navecd/update-x", "chore(update): bump x").await.unwrap_err();
        assert_eq!(err.reason, "PullRequestProviderNotConfigured");
    }
}
