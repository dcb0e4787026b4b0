//! Inventory Store (spec §3, §6): a filesystem-backed key-value set
//! recording what the controller previously applied, mirrored as
//! `/inventory/{ns}/{name}/{kind}` for manifests (last-applied JSON,
//! used by the three-way merge server-side apply performs) and
//! `/inventory/releases/{ns}/{name}` for Helm releases (a two-field
//! marker). Every write is temp-file + rename so a concurrent reader —
//! or a crash mid-write — never observes a torn entry.
//!
//! Mutated only by the reconciler and the garbage collector; shared
//! read / exclusive write, scoped to the single active leader's pod via
//! a mounted volume (spec's ownership rule).

use crate::errors::{CommandError, CoreError};
use crate::graph::ComponentId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Sentinel directory name for cluster-scoped objects, whose `ID`
/// namespace segment collapses to `""` — filesystems don't allow an
/// empty path component.
const CLUSTER_SCOPED_DIR: &str = "_cluster";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMeta {
    pub api_version: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestItem {
    pub id: ComponentId,
    pub type_meta: TypeMeta,
    pub name: String,
    pub namespace: Option<String>,
    pub last_applied: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HelmReleaseItem {
    pub id: ComponentId,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InventoryItem {
    Manifest(ManifestItem),
    HelmRelease(HelmReleaseItem),
}

impl InventoryItem {
    pub fn id(&self) -> &ComponentId {
        match self {
            InventoryItem::Manifest(item) => &item.id,
            InventoryItem::HelmRelease(item) => &item.id,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestRecord {
    id: String,
    api_version: String,
    kind: String,
    name: String,
    namespace: Option<String>,
    last_applied: Value,
}

#[derive(Serialize, Deserialize)]
struct ReleaseRecord {
    id: String,
    name: String,
    namespace: String,
}

#[derive(Clone)]
pub struct Inventory {
    root: PathBuf,
}

impl Inventory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Inventory { root: root.into() }
    }

    fn manifest_dir(&self, namespace: Option<&str>, name: &str) -> PathBuf {
        let ns_dir = namespace.filter(|ns| !ns.is_empty()).unwrap_or(CLUSTER_SCOPED_DIR);
        self.root.join(ns_dir).join(name)
    }

    fn manifest_path(&self, namespace: Option<&str>, name: &str, kind: &str) -> PathBuf {
        self.manifest_dir(namespace, name).join(kind)
    }

    fn release_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join("releases").join(namespace).join(name)
    }

    pub async fn put_manifest(&self, item: &ManifestItem) -> Result<(), CoreError> {
        let record = ManifestRecord {
            id: item.id.as_str().to_string(),
            api_version: item.type_meta.api_version.clone(),
            kind: item.type_meta.kind.clone(),
            name: item.name.clone(),
            namespace: item.namespace.clone(),
            last_applied: item.last_applied.clone(),
        };
        let path = self.manifest_path(item.namespace.as_deref(), &item.name, &item.type_meta.kind);
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|err| CoreError::permanent("InventoryEncode", CommandError::new_from_safe_message(err.to_string())))?;
        write_atomic(&path, &body).await
    }

    pub async fn put_release(&self, item: &HelmReleaseItem) -> Result<(), CoreError> {
        let record = ReleaseRecord { id: item.id.as_str().to_string(), name: item.name.clone(), namespace: item.namespace.clone() };
        let path = self.release_path(&item.namespace, &item.name);
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|err| CoreError::permanent("InventoryEncode", CommandError::new_from_safe_message(err.to_string())))?;
        write_atomic(&path, &body).await
    }

    pub async fn remove_manifest(&self, namespace: Option<&str>, name: &str, kind: &str) -> Result<(), CoreError> {
        let path = self.manifest_path(namespace, name, kind);
        remove_if_present(&path).await
    }

    pub async fn remove_release(&self, namespace: &str, name: &str) -> Result<(), CoreError> {
        let path = self.release_path(namespace, name);
        remove_if_present(&path).await
    }

    /// Loads every entry currently on disk. Used by the garbage
    /// collector to compute `InventoryBefore`.
    pub async fn load_all(&self) -> Result<Vec<InventoryItem>, CoreError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || load_all_blocking(&root)).await.expect("inventory scan task panicked")
    }
}

fn load_all_blocking(root: &Path) -> Result<Vec<InventoryItem>, CoreError> {
    let mut items = Vec::new();
    if !root.exists() {
        return Ok(items);
    }

    let releases_dir = root.join("releases");
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|err| CoreError::partial("InventoryScanFailed", CommandError::new_from_safe_message(err.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let body = std::fs::read(entry.path())?;
        if entry.path().starts_with(&releases_dir) {
            let record: ReleaseRecord = serde_json::from_slice(&body)
                .map_err(|err| CoreError::partial("InventoryDecode", CommandError::new_from_safe_message(err.to_string())))?;
            items.push(InventoryItem::HelmRelease(HelmReleaseItem {
                id: ComponentId::from(record.id),
                name: record.name,
                namespace: record.namespace,
            }));
        } else {
            let record: ManifestRecord = serde_json::from_slice(&body)
                .map_err(|err| CoreError::partial("InventoryDecode", CommandError::new_from_safe_message(err.to_string())))?;
            items.push(InventoryItem::Manifest(ManifestItem {
                id: ComponentId::from(record.id),
                type_meta: TypeMeta { api_version: record.api_version, kind: record.kind },
                name: record.name,
                namespace: record.namespace,
                last_applied: record.last_applied,
            }));
        }
    }
    Ok(items)
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<(), CoreError> {
    let parent = path.parent().expect("inventory paths always have a parent");
    tokio::fs::create_dir_all(parent).await?;
    let tmp_path = parent.join(format!(".{}.tmp-{}", path.file_name().unwrap().to_string_lossy(), uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp_path, body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<(), CoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manifest_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path());
        let item = ManifestItem {
            id: ComponentId::new("mysubcomponent", "mynamespace", "Deployment"),
            type_meta: TypeMeta { api_version: "apps/v1".to_string(), kind: "Deployment".to_string() },
            name: "mysubcomponent".to_string(),
            namespace: Some("mynamespace".to_string()),
            last_applied: serde_json::json!({"apiVersion": "apps/v1"}),
        };
        inventory.put_manifest(&item).await.unwrap();

        let loaded = inventory.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), &item.id);

        inventory.remove_manifest(Some("mynamespace"), "mysubcomponent", "Deployment").await.unwrap();
        assert!(inventory.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cluster_scoped_manifest_uses_sentinel_directory() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path());
        let item = ManifestItem {
            id: ComponentId::new("mynamespace", "", "Namespace"),
            type_meta: TypeMeta { api_version: "v1".to_string(), kind: "Namespace".to_string() },
            name: "mynamespace".to_string(),
            namespace: None,
            last_applied: serde_json::json!({}),
        };
        inventory.put_manifest(&item).await.unwrap();
        assert!(dir.path().join(CLUSTER_SCOPED_DIR).join("mynamespace").join("Namespace").exists());
    }

    #[tokio::test]
    async fn release_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path());
        let item = HelmReleaseItem {
            id: ComponentId::new("myrelease", "myns", "HelmRelease"),
            name: "myrelease".to_string(),
            namespace: "myns".to_string(),
        };
        inventory.put_release(&item).await.unwrap();
        let loaded = inventory.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        inventory.remove_release("myns", "myrelease").await.unwrap();
        assert!(inventory.load_all().await.unwrap().is_empty());
    }
}
