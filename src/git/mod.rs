//! Project Fetcher (spec §2 item 1, §4.8 step 1): clones or fast-forwards
//! a project's Git repository into its work directory and returns the
//! commit the requested branch tip resolved to.
//!
//! Grounded on the teacher's `git.rs` fetch/checkout/credential-callback
//! trio, generalized from a pinned-commit clone (used for a CI build
//! context) into an idempotent branch-tip pull: re-opens `into_dir` if it
//! is already a repository, clones it otherwise, and always leaves the
//! worktree reset hard to the branch's current remote tip.

use crate::errors::{CommandError, CoreError};
use git2::build::CheckoutBuilder;
use git2::{AutotagOption, CertificateCheckStatus, Cred, CredentialType, FetchOptions, RemoteCallbacks, Repository, ResetType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Git fetch suspension-point deadline (spec §5).
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Supplies credentials for the libgit2 credentials callback, given the
/// username the remote reports. Implementations are expected to hold
/// already-fetched secret material (spec's `vcs-auth-{project}` keys);
/// no I/O happens inside `credentials` itself.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, username: &str) -> Vec<(CredentialType, Cred)>;
}

/// `auth=ssh` — an identity file plus optional passphrase, as stored
/// under the `identity`/`identity.pub` keys of `vcs-auth-{project}`.
pub struct SshKeyCredentialProvider {
    pub identity_pem: Vec<u8>,
    pub identity_pub: Option<Vec<u8>>,
    pub passphrase: Option<String>,
}

impl CredentialProvider for SshKeyCredentialProvider {
    fn credentials(&self, username: &str) -> Vec<(CredentialType, Cred)> {
        let identity = match std::str::from_utf8(&self.identity_pem) {
            Ok(identity) => identity,
            Err(_) => return vec![],
        };
        let public = self.identity_pub.as_deref().and_then(|bytes| std::str::from_utf8(bytes).ok());
        match Cred::ssh_key_from_memory(username, public, identity, self.passphrase.as_deref()) {
            Ok(cred) => vec![(CredentialType::SSH_MEMORY, cred)],
            Err(_) => vec![],
        }
    }
}

/// HTTPS token auth, for providers that front Git over HTTPS with a
/// personal access token instead of a deploy key.
pub struct TokenCredentialProvider {
    pub token: String,
}

impl CredentialProvider for TokenCredentialProvider {
    fn credentials(&self, _username: &str) -> Vec<(CredentialType, Cred)> {
        match Cred::userpass_plaintext("x-access-token", &self.token) {
            Ok(cred) => vec![(CredentialType::USER_PASS_PLAINTEXT, cred)],
            Err(_) => vec![],
        }
    }
}

/// Credentials callback is invoked repeatedly by libgit2 until the
/// server returns Ok (or a definitive error). If auth is denied it is up
/// to us to offer a different method or give up.
pub(crate) fn authentication_callback<'a>(
    provider: &'a dyn CredentialProvider,
) -> impl FnMut(&str, Option<&str>, CredentialType) -> Result<Cred, git2::Error> + 'a {
    let mut current: (String, Vec<(CredentialType, Cred)>) = (String::new(), vec![]);

    move |remote_url, username_from_url, allowed_types| {
        if remote_url != current.0 {
            current = (remote_url.to_string(), provider.credentials(username_from_url.unwrap_or("git")));
        }
        let methods = &mut current.1;
        loop {
            let (cred_type, credential) = match methods.pop() {
                Some(entry) => entry,
                None => {
                    let msg = format!("exhausted all available auth methods to fetch repository {remote_url}");
                    let mut error = git2::Error::from_str(&msg);
                    error.set_code(git2::ErrorCode::Auth);
                    return Err(error);
                }
            };
            if allowed_types.contains(cred_type) {
                return Ok(credential);
            }
        }
    }
}

fn remote_fetch(repository_url: &Url, branch: &str, provider: &dyn CredentialProvider, repo: &Repository) -> Result<(), git2::Error> {
    let remote_url_str = repository_url.as_str();
    let mut remote = match repo.find_remote("origin") {
        Ok(remote) => remote,
        Err(_) => repo.remote("origin", remote_url_str)?,
    };
    if remote.url() != Some(remote_url_str) {
        repo.remote_set_url("origin", remote_url_str)?;
        remote = repo.find_remote("origin")?;
    }

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(authentication_callback(provider));
    callbacks.certificate_check(|_, _| Ok(CertificateCheckStatus::CertificateOk));

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(callbacks);
    fo.download_tags(AutotagOption::None);
    fo.update_fetchhead(true);

    remote.fetch(&[branch], Some(&mut fo), None)?;
    remote.disconnect()?;
    Ok(())
}

fn checkout_fetch_head(repo: &Repository) -> Result<String, git2::Error> {
    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let commit = fetch_head.peel_to_commit()?;

    let mut checkout_opts = CheckoutBuilder::new();
    checkout_opts.force().remove_ignored(true).remove_untracked(true);
    repo.reset(commit.as_object(), ResetType::Hard, Some(&mut checkout_opts))?;

    Ok(commit.id().to_string())
}

/// Idempotent: re-opens `into_dir` if it already holds a repository,
/// clones into it otherwise. Always leaves the worktree at `branch`'s
/// current remote tip and returns that commit's hash.
fn fetch_and_checkout(
    repository_url: &Url,
    branch: &str,
    into_dir: &Path,
    provider: &dyn CredentialProvider,
) -> Result<String, CoreError> {
    if !matches!(repository_url.scheme(), "https" | "ssh") {
        return Err(CoreError::permanent(
            "InvalidRepositoryUrl",
            CommandError::new_from_safe_message("repository URL must use https:// or ssh://".to_string()),
        ));
    }

    let repo = match Repository::open(into_dir) {
        Ok(repo) => repo,
        Err(_) => {
            std::fs::create_dir_all(into_dir)?;
            Repository::init(into_dir).map_err(CoreError::from)?
        }
    };

    remote_fetch(repository_url, branch, provider, &repo).map_err(CoreError::from)?;
    checkout_fetch_head(&repo).map_err(CoreError::from)
}

/// Fetches/opens `project_work_dir` on a blocking thread and enforces
/// the spec's 5-minute Git fetch deadline. The underlying libgit2 call
/// keeps running on its thread past a timeout (spawn_blocking tasks are
/// not cancellable); the timeout only stops the caller from waiting on
/// it, and the next reconcile pass reopens the same directory.
pub async fn fetch_project(
    repository_url: Url,
    branch: String,
    project_work_dir: PathBuf,
    provider: Arc<dyn CredentialProvider>,
) -> Result<String, CoreError> {
    let join = tokio::task::spawn_blocking(move || fetch_and_checkout(&repository_url, &branch, &project_work_dir, provider.as_ref()));

    match tokio::time::timeout(FETCH_TIMEOUT, join).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(CoreError::permanent("GitFetchTaskPanicked", CommandError::new_from_safe_message(join_err.to_string()))),
        Err(_) => Err(CoreError::transient("GitFetchTimeout", CommandError::new_from_safe_message("git fetch exceeded the 5 minute deadline".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCredentials;
    impl CredentialProvider for NoCredentials {
        fn credentials(&self, _username: &str) -> Vec<(CredentialType, Cred)> {
            vec![]
        }
    }

    #[test]
    fn rejects_non_https_non_ssh_urls() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse("file:///tmp/repo").unwrap();
        let err = fetch_and_checkout(&url, "main", dir.path(), &NoCredentials).unwrap_err();
        assert_eq!(err.reason, "InvalidRepositoryUrl");
    }

    #[test]
    fn ssh_key_provider_yields_no_credentials_on_invalid_key_bytes() {
        let provider = SshKeyCredentialProvider { identity_pem: vec![0xff, 0xfe], identity_pub: None, passphrase: None };
        assert!(provider.credentials("git").is_empty());
    }
}
