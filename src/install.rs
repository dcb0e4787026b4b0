//! Install bootstrap (spec §6, SPEC_FULL §2 stage 12): materializes one
//! shard's own Kubernetes footprint plus the bootstrap artifacts for one
//! managed project.
//!
//! Every cluster object here is the same unstructured `serde_json::Value`
//! the reconciliation engine applies (`crate::kube_apply::apply_manifest`),
//! so installing is the reconciler's own apply path run once, by hand,
//! before any `GitopsProject` exists to trigger it. Every apply is
//! server-side with the controller's field manager, so re-running install
//! with identical `InstallOptions` reapplies byte-identical content
//! (testable property 6, spec §8).
//!
//! The cluster role below grants `verbs=["*"]` on `resources=["*"]`
//! cluster-wide, matching the Open Question recorded in DESIGN.md: the
//! controller applies whatever GVKs a project's manifests declare and
//! cannot enumerate them ahead of time, so the breadth is carried over
//! as specified rather than narrowed.

use crate::errors::{CommandError, CoreError};
use base64::Engine;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

/// Spec §5's install-bootstrap deadline: the freshly applied CRD must
/// become `Established` before anything tries to create a
/// `GitopsProject` against it.
pub const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);
pub const CRD_ESTABLISH_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub repository_url: String,
    pub branch: String,
    pub stage: String,
    pub pull_interval_seconds: u32,
    pub deploy_key_identity: Vec<u8>,
    pub deploy_key_identity_pub: Vec<u8>,
    pub decryption_key: Vec<u8>,
    pub known_hosts: String,
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn namespace_manifest(opts: &InstallOptions) -> Value {
    json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": opts.namespace}})
}

fn service_account_manifest(opts: &InstallOptions) -> Value {
    json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": {"name": opts.name, "namespace": opts.namespace}})
}

fn cluster_role_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRole",
        "metadata": {"name": format!("{}-manager", opts.name)},
        "rules": [{"apiGroups": ["*"], "resources": ["*"], "verbs": ["*"]}],
    })
}

fn cluster_role_binding_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": {"name": format!("{}-manager", opts.name)},
        "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": format!("{}-manager", opts.name)},
        "subjects": [{"kind": "ServiceAccount", "name": opts.name, "namespace": opts.namespace}],
    })
}

fn leader_role_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": {"name": format!("{}-leader-election", opts.name), "namespace": opts.namespace},
        "rules": [
            {"apiGroups": ["coordination.k8s.io"], "resources": ["leases"], "verbs": ["get", "list", "watch", "create", "update", "patch", "delete"]},
            {"apiGroups": [""], "resources": ["events"], "verbs": ["create", "patch"]},
        ],
    })
}

fn leader_role_binding_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": {"name": format!("{}-leader-election", opts.name), "namespace": opts.namespace},
        "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "Role", "name": format!("{}-leader-election", opts.name)},
        "subjects": [{"kind": "ServiceAccount", "name": opts.name, "namespace": opts.namespace}],
    })
}

fn service_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": opts.name, "namespace": opts.namespace},
        "spec": {"selector": {"app": opts.name}, "ports": [{"name": "metrics", "port": 8080, "targetPort": 8080}]},
    })
}

fn statefulset_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {"name": opts.name, "namespace": opts.namespace},
        "spec": {
            "replicas": 1,
            "serviceName": opts.name,
            "selector": {"matchLabels": {"app": opts.name}},
            "template": {
                "metadata": {"labels": {"app": opts.name}},
                "spec": {
                    "serviceAccountName": opts.name,
                    "containers": [{
                        "name": opts.name,
                        "image": opts.image,
                        "command": ["/controller"],
                        "args": ["run", "--shard-podinfo-path=/podinfo/shard"],
                    }],
                },
            },
        },
    })
}

fn project_cr_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "gitops.navecd.io/v1",
        "kind": "GitopsProject",
        "metadata": {"name": opts.name, "namespace": opts.namespace},
        "spec": {
            "url": opts.repository_url,
            "branch": opts.branch,
            "pullIntervalSeconds": opts.pull_interval_seconds,
            "stage": opts.stage,
        },
    })
}

fn vcs_auth_secret_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": format!("vcs-auth-{}", opts.name), "namespace": opts.namespace},
        "type": "Opaque",
        "data": {"identity": b64(&opts.deploy_key_identity), "identity.pub": b64(&opts.deploy_key_identity_pub), "auth": b64(b"ssh")},
    })
}

fn decryption_key_secret_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": "dec-key", "namespace": opts.namespace},
        "type": "Opaque",
        "data": {"priv": b64(&opts.decryption_key)},
    })
}

fn known_hosts_configmap_manifest(opts: &InstallOptions) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": format!("{}-known-hosts", opts.name), "namespace": opts.namespace},
        "data": {"known_hosts": opts.known_hosts},
    })
}

/// Applies every cluster object for one shard + managed project, in
/// dependency order (namespace and RBAC before the workload and secrets
/// that need them), and writes the project's bootstrap `.cue` file to
/// `project_root/navecd/{name}_project.cue`.
pub async fn run_install(client: &kube::Client, opts: &InstallOptions, project_root: &Path) -> Result<(), CoreError> {
    use kube::core::CustomResourceExt;

    let crd_name = crate::crd::GitopsProject::crd_name().to_string();
    let crd = serde_json::to_value(crate::crd::GitopsProject::crd())
        .map_err(|err| CoreError::permanent("InvalidManifest", CommandError::new_from_safe_message(err.to_string())))?;

    crate::kube_apply::apply_manifest(client, &namespace_manifest(opts)).await?;
    crate::kube_apply::apply_manifest(client, &crd).await?;
    wait_for_crd_established(client, &crd_name).await?;

    let manifests = [
        service_account_manifest(opts),
        cluster_role_manifest(opts),
        cluster_role_binding_manifest(opts),
        leader_role_manifest(opts),
        leader_role_binding_manifest(opts),
        vcs_auth_secret_manifest(opts),
        decryption_key_secret_manifest(opts),
        known_hosts_configmap_manifest(opts),
        service_manifest(opts),
        statefulset_manifest(opts),
        project_cr_manifest(opts),
    ];
    for manifest in &manifests {
        crate::kube_apply::apply_manifest(client, manifest).await?;
    }

    write_project_cue(project_root, opts).await
}

/// Polls the CRD's `Established` condition at
/// [`CRD_ESTABLISH_POLL_INTERVAL`] up to [`CRD_ESTABLISH_TIMEOUT`],
/// matching spec §5's install-bootstrap deadline.
async fn wait_for_crd_established(client: &kube::Client, name: &str) -> Result<(), CoreError> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let deadline = tokio::time::Instant::now() + CRD_ESTABLISH_TIMEOUT;

    loop {
        let crd = api.get(name).await?;
        let established = crd
            .status
            .and_then(|status| status.conditions)
            .unwrap_or_default()
            .into_iter()
            .any(|condition| condition.type_ == "Established" && condition.status == "True");
        if established {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CoreError::transient("CrdNotEstablished", CommandError::new_from_safe_message(format!("{name} did not become Established within {CRD_ESTABLISH_TIMEOUT:?}"))));
        }
        tokio::time::sleep(CRD_ESTABLISH_POLL_INTERVAL).await;
    }
}

async fn write_project_cue(project_root: &Path, opts: &InstallOptions) -> Result<(), CoreError> {
    let dir = project_root.join("navecd");
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("{}_project.cue", opts.name));
    tokio::fs::write(&path, project_cue_body(opts)).await?;
    Ok(())
}

fn project_cue_body(opts: &InstallOptions) -> String {
    format!(
        "project: {{\n\tname: \"{}\"\n\turl: \"{}\"\n\tbranch: \"{}\"\n\tstage: \"{}\"\n\tpullIntervalSeconds: {}\n}}\n",
        opts.name, opts.repository_url, opts.branch, opts.stage, opts.pull_interval_seconds,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_opts() -> InstallOptions {
        InstallOptions {
            name: "payments".to_string(),
            namespace: "navecd-system".to_string(),
            image: "ghcr.io/example/navecd:1.0.0".to_string(),
            repository_url: "git@example.com:org/payments-gitops.git".to_string(),
            branch: "main".to_string(),
            stage: "prod".to_string(),
            pull_interval_seconds: 60,
            deploy_key_identity: b"fake-private-key".to_vec(),
            deploy_key_identity_pub: b"fake-public-key".to_vec(),
            decryption_key: b"fake-age-identity".to_vec(),
            known_hosts: "example.com ssh-ed25519 AAAA...".to_string(),
        }
    }

    #[test]
    fn secret_data_is_base64_encoded() {
        let opts = sample_opts();
        let secret = vcs_auth_secret_manifest(&opts);
        assert_eq!(secret["data"]["identity"], b64(b"fake-private-key"));
    }

    #[test]
    fn cluster_role_grants_full_breadth() {
        let opts = sample_opts();
        let role = cluster_role_manifest(&opts);
        assert_eq!(role["rules"][0]["resources"], json!(["*"]));
        assert_eq!(role["rules"][0]["verbs"], json!(["*"]));
    }

    #[test]
    fn project_cue_body_is_deterministic() {
        let opts = sample_opts();
        assert_eq!(project_cue_body(&opts), project_cue_body(&opts));
        assert!(project_cue_body(&opts).contains("payments-gitops.git"));
    }

    #[tokio::test]
    async fn project_cue_is_written_under_navecd_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_project_cue(dir.path(), &sample_opts()).await.unwrap();
        let written = tokio::fs::read_to_string(dir.path().join("navecd/payments_project.cue")).await.unwrap();
        assert!(written.contains("\"main\""));
    }
}
