//! Version Scanner (spec §4.9): given one harvested `UpdateInstruction`,
//! lists the versions available upstream (container registry tags, OCI
//! chart tags, or an HTTP chart repository index), applies the semver
//! constraint, and reports the best update if one exists.

use crate::builder::{Integration, UpdateInstruction, UpdateTarget};
use crate::errors::{CommandError, CoreError};
use crate::graph::ChartAuth;
use crate::helmchart::RegistryAuthProvider;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AvailableUpdate {
    pub new_version: String,
    pub new_digest: Option<String>,
    pub info_url: Option<String>,
}

#[async_trait]
pub trait RemoteVersionLister: Send + Sync {
    /// Lists every tag/version the remote advertises for `target`,
    /// unfiltered — the scanner itself applies the semver constraint.
    async fn list_versions(&self, target: &UpdateTarget, auth: Option<&ChartAuth>) -> Result<Vec<String>, CoreError>;

    /// Resolves the digest (for containers/OCI charts) or an info URL
    /// (for HTTP charts) of a version already known to satisfy the
    /// constraint.
    async fn resolve(&self, target: &UpdateTarget, version: &str, auth: Option<&ChartAuth>) -> Result<(Option<String>, Option<String>), CoreError>;
}

/// Splits `repo:tag[@digest]` into `(repository, tag, digest)`. The
/// registry host, if present, is left attached to `repository` — a bare
/// `image` without a host is assumed to live on the default registry the
/// `RemoteVersionLister` implementation targets.
pub fn split_image_reference(image: &str) -> (String, String, Option<String>) {
    let (without_digest, digest) = match image.split_once('@') {
        Some((left, right)) => (left, Some(right.to_string())),
        None => (image, None),
    };

    match without_digest.rsplit_once(':') {
        // Guard against mistaking a registry port (`host:5000/repo`) for a tag separator.
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string(), digest),
        _ => (without_digest.to_string(), "latest".to_string(), digest),
    }
}

fn parse_semver(tag: &str) -> Option<semver::Version> {
    semver::Version::parse(tag.trim_start_matches('v')).ok()
}

pub struct DockerRegistryLister {
    pub client: reqwest::Client,
    pub auth: Arc<dyn RegistryAuthProvider>,
}

#[derive(Deserialize)]
struct TagsList {
    tags: Vec<String>,
}

impl DockerRegistryLister {
    fn registry_and_repo(repo: &str) -> (String, String) {
        match repo.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') => (host.to_string(), rest.to_string()),
            _ => ("registry-1.docker.io".to_string(), repo.to_string()),
        }
    }
}

#[async_trait]
impl RemoteVersionLister for DockerRegistryLister {
    async fn list_versions(&self, target: &UpdateTarget, auth: Option<&ChartAuth>) -> Result<Vec<String>, CoreError> {
        let repo = match target {
            UpdateTarget::Container { image, .. } => split_image_reference(image).0,
            UpdateTarget::Chart { chart } => chart.repo_url.trim_start_matches("oci://").to_string() + "/" + &chart.name,
        };
        let (registry, repo) = Self::registry_and_repo(&repo);

        let mut request = self.client.get(format!("https://{registry}/v2/{repo}/tags/list"));
        if let Some(auth) = auth {
            if let Some(token) = self.auth.bearer_token(auth).await? {
                request = request.bearer_auth(token);
            }
        }
        let list: TagsList = request.send().await.map_err(CoreError::from)?.error_for_status().map_err(CoreError::from)?.json().await.map_err(CoreError::from)?;
        Ok(list.tags)
    }

    async fn resolve(&self, target: &UpdateTarget, version: &str, auth: Option<&ChartAuth>) -> Result<(Option<String>, Option<String>), CoreError> {
        let repo = match target {
            UpdateTarget::Container { image, .. } => split_image_reference(image).0,
            UpdateTarget::Chart { chart } => chart.repo_url.trim_start_matches("oci://").to_string() + "/" + &chart.name,
        };
        let (registry, repo) = Self::registry_and_repo(&repo);

        let mut request = self
            .client
            .head(format!("https://{registry}/v2/{repo}/manifests/{version}"))
            .header("Accept", "application/vnd.oci.image.manifest.v1+json");
        if let Some(auth) = auth {
            if let Some(token) = self.auth.bearer_token(auth).await? {
                request = request.bearer_auth(token);
            }
        }
        let response = request.send().await.map_err(CoreError::from)?;
        let digest = response.headers().get("Docker-Content-Digest").and_then(|v| v.to_str().ok()).map(str::to_string);
        Ok((digest, None))
    }
}

pub struct HttpChartIndexLister {
    pub client: reqwest::Client,
}

#[derive(Deserialize)]
struct HttpIndex {
    entries: HashMap<String, Vec<HttpIndexEntry>>,
}

#[derive(Deserialize)]
struct HttpIndexEntry {
    version: String,
    #[serde(default)]
    urls: Vec<String>,
}

#[async_trait]
impl RemoteVersionLister for HttpChartIndexLister {
    async fn list_versions(&self, target: &UpdateTarget, _auth: Option<&ChartAuth>) -> Result<Vec<String>, CoreError> {
        let UpdateTarget::Chart { chart } = target else {
            return Err(CoreError::permanent("UnsupportedTarget", CommandError::new_from_safe_message("HttpChartIndexLister only supports Chart targets".to_string())));
        };
        let index_url = format!("{}/index.yaml", chart.repo_url.trim_end_matches('/'));
        let text = self.client.get(&index_url).send().await.map_err(CoreError::from)?.error_for_status().map_err(CoreError::from)?.text().await.map_err(CoreError::from)?;
        let index: HttpIndex = serde_yaml::from_str(&text).map_err(|err| CoreError::permanent("InvalidChartIndex", CommandError::new_from_safe_message(err.to_string())))?;
        Ok(index.entries.get(&chart.name).map(|entries| entries.iter().map(|e| e.version.clone()).collect()).unwrap_or_default())
    }

    async fn resolve(&self, target: &UpdateTarget, version: &str, auth: Option<&ChartAuth>) -> Result<(Option<String>, Option<String>), CoreError> {
        let UpdateTarget::Chart { chart } = target else {
            return Err(CoreError::permanent("UnsupportedTarget", CommandError::new_from_safe_message("HttpChartIndexLister only supports Chart targets".to_string())));
        };
        let index_url = format!("{}/index.yaml", chart.repo_url.trim_end_matches('/'));
        let text = self.client.get(&index_url).send().await.map_err(CoreError::from)?.error_for_status().map_err(CoreError::from)?.text().await.map_err(CoreError::from)?;
        let index: HttpIndex = serde_yaml::from_str(&text).map_err(|err| CoreError::permanent("InvalidChartIndex", CommandError::new_from_safe_message(err.to_string())))?;
        let _ = auth;
        let url = index
            .entries
            .get(&chart.name)
            .and_then(|entries| entries.iter().find(|e| e.version == version))
            .and_then(|entry| entry.urls.first().cloned());
        Ok((None, url))
    }
}

pub struct VersionScanner {
    docker: Arc<dyn RemoteVersionLister>,
    http_chart: Arc<dyn RemoteVersionLister>,
}

impl VersionScanner {
    pub fn new(docker: Arc<dyn RemoteVersionLister>, http_chart: Arc<dyn RemoteVersionLister>) -> Self {
        VersionScanner { docker, http_chart }
    }

    fn lister_for(&self, target: &UpdateTarget) -> &dyn RemoteVersionLister {
        match target {
            UpdateTarget::Container { .. } => self.docker.as_ref(),
            UpdateTarget::Chart { chart } if chart.repo_url.starts_with("oci://") => self.docker.as_ref(),
            UpdateTarget::Chart { .. } => self.http_chart.as_ref(),
        }
    }

    fn current_version(target: &UpdateTarget) -> String {
        match target {
            UpdateTarget::Container { image, .. } => split_image_reference(image).1,
            // Chart versions may carry a `tag@digest` suffix (spec §3); only the tag is a semver.
            UpdateTarget::Chart { chart } => chart.version.split_once('@').map(|(tag, _)| tag).unwrap_or(&chart.version).to_string(),
        }
    }

    /// Implements property 5: among remote versions that parse as semver
    /// and satisfy `instruction.constraint`, picks the greatest; returns
    /// `None` unless it strictly exceeds the current version.
    pub async fn scan(&self, instruction: &UpdateInstruction) -> Result<Option<AvailableUpdate>, CoreError> {
        let lister = self.lister_for(&instruction.target);
        let remote_versions = lister.list_versions(&instruction.target, instruction.auth.as_ref()).await?;

        let current = Self::current_version(&instruction.target);
        let current_semver = parse_semver(&current);

        let best = remote_versions
            .iter()
            .filter_map(|tag| parse_semver(tag).map(|version| (tag, version)))
            .filter(|(_, version)| instruction.constraint.matches(version))
            .max_by(|(_, a), (_, b)| a.cmp(b));

        let Some((best_tag, best_version)) = best else {
            return Ok(None);
        };

        if let Some(current) = &current_semver {
            if best_version <= *current {
                return Ok(None);
            }
        }

        let (digest, info_url) = lister.resolve(&instruction.target, best_tag, instruction.auth.as_ref()).await?;
        Ok(Some(AvailableUpdate { new_version: best_tag.clone(), new_digest: digest, info_url }))
    }
}

pub fn commit_message(target: &UpdateTarget, new_version: &str) -> String {
    let name = match target {
        UpdateTarget::Container { image, .. } => split_image_reference(image).0,
        UpdateTarget::Chart { chart } => chart.name.clone(),
    };
    format!("chore(update): bump {name} to {new_version}")
}

pub fn update_branch_name(target: &UpdateTarget) -> String {
    let name = match target {
        UpdateTarget::Container { image, .. } => split_image_reference(image).0,
        UpdateTarget::Chart { chart } => chart.name.clone(),
    };
    format!("navecd/update-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ChartReference;
    use std::sync::Mutex;

    struct FakeLister {
        versions: Vec<String>,
        resolved: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteVersionLister for FakeLister {
        async fn list_versions(&self, _target: &UpdateTarget, _auth: Option<&ChartAuth>) -> Result<Vec<String>, CoreError> {
            Ok(self.versions.clone())
        }

        async fn resolve(&self, _target: &UpdateTarget, version: &str, _auth: Option<&ChartAuth>) -> Result<(Option<String>, Option<String>), CoreError> {
            self.resolved.lock().unwrap().push(version.to_string());
            Ok((Some(format!("sha256:{version}")), None))
        }
    }

    fn container_instruction(constraint: &str) -> UpdateInstruction {
        UpdateInstruction {
            constraint: semver::VersionReq::parse(constraint).unwrap(),
            auth: None,
            file: "apps/a".into(),
            line: 0,
            schedule: "0 */15 * * * *".to_string(),
            integration: Integration::Direct,
            target: UpdateTarget::Container { image: "myimage:1.15.0".to_string(), struct_ref: "spec.image".to_string(), key: "app".to_string() },
        }
    }

    fn chart_instruction(version: &str, constraint: &str) -> UpdateInstruction {
        UpdateInstruction {
            constraint: semver::VersionReq::parse(constraint).unwrap(),
            auth: None,
            file: "apps/a".into(),
            line: 0,
            schedule: "0 */15 * * * *".to_string(),
            integration: Integration::Direct,
            target: UpdateTarget::Chart {
                chart: ChartReference { name: "mychart".to_string(), repo_url: "oci://registry.example.com/charts".to_string(), version: version.to_string(), auth: None },
            },
        }
    }

    #[tokio::test]
    async fn digest_pinned_chart_version_still_compares_by_tag() {
        let docker = Arc::new(FakeLister { versions: vec!["1.0.0".to_string(), "1.1.0".to_string()], resolved: Mutex::new(vec![]) });
        let scanner = VersionScanner::new(docker, Arc::new(FakeLister { versions: vec![], resolved: Mutex::new(vec![]) }));

        let update = scanner.scan(&chart_instruction("1.0.0@sha256:abcabcabcabcabcabcabcabcabcabcabcabcabcabcabcabcabcabcabcabcabc", "*")).await.unwrap().unwrap();
        assert_eq!(update.new_version, "1.1.0");
    }

    #[tokio::test]
    async fn selects_the_greatest_version_satisfying_the_constraint() {
        let docker = Arc::new(FakeLister {
            versions: vec!["1.14.0".to_string(), "1.15.1".to_string(), "1.16.5".to_string(), "other".to_string(), "latest".to_string()],
            resolved: Mutex::new(vec![]),
        });
        let scanner = VersionScanner::new(docker, Arc::new(FakeLister { versions: vec![], resolved: Mutex::new(vec![]) }));

        let update = scanner.scan(&container_instruction("<1.17.0")).await.unwrap().unwrap();
        assert_eq!(update.new_version, "1.16.5");
    }

    #[tokio::test]
    async fn no_update_when_nothing_exceeds_current() {
        let docker = Arc::new(FakeLister { versions: vec!["1.15.0".to_string(), "1.14.0".to_string()], resolved: Mutex::new(vec![]) });
        let scanner = VersionScanner::new(docker, Arc::new(FakeLister { versions: vec![], resolved: Mutex::new(vec![]) }));

        let update = scanner.scan(&container_instruction("*")).await.unwrap();
        assert!(update.is_none());
    }

    #[test]
    fn split_image_reference_separates_tag_from_digest() {
        let (repo, tag, digest) = split_image_reference("myregistry.example.com:5000/myimage:1.15.0@sha256:abc");
        assert_eq!(repo, "myregistry.example.com:5000/myimage");
        assert_eq!(tag, "1.15.0");
        assert_eq!(digest.as_deref(), Some("sha256:abc"));
    }
}
