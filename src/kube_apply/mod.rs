//! Server-side apply and delete for the unstructured manifests that flow
//! out of the builder as bare `serde_json::Value` content (spec §4.5,
//! §4.7). The GVK is resolved against the live API via discovery so the
//! core never needs a compiled-in type for every resource a project
//! might declare — the same reason the teacher's own Kubernetes call
//! sites (`kubernetes::kubectl_exec_*` in `cmd/kubectl_utils.rs`) shell
//! out rather than link a generated client per CRD.

use crate::errors::{CommandError, CoreError};
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery;
use serde_json::Value;

pub const FIELD_MANAGER: &str = "navecd";

fn gvk_of(content: &Value) -> Result<kube::core::GroupVersionKind, CoreError> {
    let api_version = content
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::permanent("InvalidManifest", CommandError::new_from_safe_message("manifest is missing apiVersion".to_string())))?;
    let kind = content
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::permanent("InvalidManifest", CommandError::new_from_safe_message("manifest is missing kind".to_string())))?;
    Ok(parse_api_version(api_version, kind))
}

fn parse_api_version(api_version: &str, kind: &str) -> kube::core::GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => kube::core::GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() },
        None => kube::core::GroupVersionKind { group: String::new(), version: api_version.to_string(), kind: kind.to_string() },
    }
}

fn name_and_namespace(content: &Value) -> Result<(String, Option<String>), CoreError> {
    let metadata = content
        .get("metadata")
        .ok_or_else(|| CoreError::permanent("InvalidManifest", CommandError::new_from_safe_message("manifest is missing metadata".to_string())))?;
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::permanent("InvalidManifest", CommandError::new_from_safe_message("manifest is missing metadata.name".to_string())))?
        .to_string();
    let namespace = metadata.get("namespace").and_then(Value::as_str).map(str::to_string);
    Ok((name, namespace))
}

async fn api_for(client: &kube::Client, content: &Value) -> Result<Api<DynamicObject>, CoreError> {
    let gvk = gvk_of(content)?;
    let (api_resource, api_capabilities) = discovery::pinned_kind(client, &gvk).await?;
    let (_, namespace) = name_and_namespace(content)?;
    let api = if api_capabilities.scope == discovery::Scope::Namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), &ns, &api_resource),
            None => Api::default_namespaced_with(client.clone(), &api_resource),
        }
    } else {
        Api::all_with(client.clone(), &api_resource)
    };
    Ok(api)
}

/// Server-side applies `content`, force-conflicting in this controller's
/// favor — the same posture the reconciler's single writer assumes for
/// every component it owns.
pub async fn apply_manifest(client: &kube::Client, content: &Value) -> Result<DynamicObject, CoreError> {
    let (name, _) = name_and_namespace(content)?;
    let api = api_for(client, content).await?;
    let object: DynamicObject = serde_json::from_value(content.clone())
        .map_err(|err| CoreError::permanent("InvalidManifest", CommandError::new_from_safe_message(err.to_string())))?;
    let applied = api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&object)).await?;
    Ok(applied)
}

/// Deletes the object named by `content`. A 404 is treated as success:
/// the desired end state (absence) already holds.
pub async fn delete_manifest(client: &kube::Client, content: &Value) -> Result<(), CoreError> {
    let (name, _) = name_and_namespace(content)?;
    let api = api_for(client, content).await?;
    match api.delete(&name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_splits_group_and_core_api_version() {
        let manifest = serde_json::json!({"apiVersion": "apps/v1", "kind": "Deployment"});
        let gvk = parse_api_version("apps/v1", "Deployment");
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        let _ = gvk_of(&manifest);
    }

    #[test]
    fn core_api_version_has_empty_group() {
        let gvk = parse_api_version("v1", "ConfigMap");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn name_and_namespace_reads_metadata() {
        let manifest = serde_json::json!({"metadata": {"name": "cm", "namespace": "ns"}});
        let (name, namespace) = name_and_namespace(&manifest).unwrap();
        assert_eq!(name, "cm");
        assert_eq!(namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn missing_name_is_an_error() {
        let manifest = serde_json::json!({"metadata": {}});
        assert!(name_and_namespace(&manifest).is_err());
    }
}
