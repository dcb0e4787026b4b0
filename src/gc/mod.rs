//! Garbage Collector (spec §4.7): after a reconcile pass builds the new
//! [`DependencyGraph`], anything the previous pass recorded in the
//! [`Inventory`] that is no longer present in the new graph has fallen
//! out of the desired state and must be deleted from the cluster.
//!
//! Deletion order mirrors apply order in reverse for one case only:
//! `Namespace` manifests are deleted last, so a namespaced object never
//! outlives — or gets orphaned ahead of — the namespace that scoped it.
//! Every other stale item is deleted in one bounded-concurrency phase.
//! Failures are logged and skipped, not escalated: one undeletable
//! leftover must not block collection of everything else. The inventory
//! entry for an item is only pruned once its cluster delete actually
//! succeeds (spec's `InventoryAfter = GraphNow ∩ AppliedSuccessfully`).

use crate::errors::CoreError;
use crate::graph::{ComponentId, DependencyGraph};
use crate::inventory::{Inventory, InventoryItem};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

#[async_trait]
pub trait ManifestDeleter: Send + Sync {
    async fn delete(&self, last_applied: &serde_json::Value) -> Result<(), CoreError>;
}

#[async_trait]
pub trait ReleaseUninstaller: Send + Sync {
    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), CoreError>;
}

pub struct KubeManifestDeleter {
    pub client: kube::Client,
}

#[async_trait]
impl ManifestDeleter for KubeManifestDeleter {
    async fn delete(&self, last_applied: &serde_json::Value) -> Result<(), CoreError> {
        crate::kube_apply::delete_manifest(&self.client, last_applied).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GarbageCollectorConfig {
    pub worker_pool_size: usize,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub deleted: Vec<ComponentId>,
    pub failed: Vec<(ComponentId, CoreError)>,
}

pub struct GarbageCollector {
    inventory: Inventory,
    manifest_deleter: Arc<dyn ManifestDeleter>,
    release_uninstaller: Arc<dyn ReleaseUninstaller>,
    config: GarbageCollectorConfig,
}

impl GarbageCollector {
    pub fn new(
        inventory: Inventory,
        manifest_deleter: Arc<dyn ManifestDeleter>,
        release_uninstaller: Arc<dyn ReleaseUninstaller>,
        config: GarbageCollectorConfig,
    ) -> Self {
        GarbageCollector { inventory, manifest_deleter, release_uninstaller, config }
    }

    /// Computes `InventoryBefore \ GraphNow` and deletes each item,
    /// namespaces last. Never returns an error for a single failed
    /// delete; the returned [`GcReport`] records what happened.
    pub async fn collect(&self, graph: &DependencyGraph) -> Result<GcReport, CoreError> {
        let previous = self.inventory.load_all().await?;
        let stale: Vec<InventoryItem> = previous.into_iter().filter(|item| graph.get(item.id()).is_none()).collect();

        let (namespaces, rest): (Vec<_>, Vec<_>) = stale.into_iter().partition(|item| {
            matches!(item, InventoryItem::Manifest(m) if m.type_meta.kind == "Namespace")
        });

        let mut report = GcReport::default();
        self.delete_phase(rest, &mut report).await;
        self.delete_phase(namespaces, &mut report).await;
        Ok(report)
    }

    async fn delete_phase(&self, items: Vec<InventoryItem>, report: &mut GcReport) {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));
        let mut tasks = JoinSet::new();
        for item in items {
            let semaphore = semaphore.clone();
            let manifest_deleter = self.manifest_deleter.clone();
            let release_uninstaller = self.release_uninstaller.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let id = item.id().clone();
                let outcome = match &item {
                    InventoryItem::Manifest(m) => manifest_deleter.delete(&m.last_applied).await,
                    InventoryItem::HelmRelease(r) => release_uninstaller.uninstall(&r.namespace, &r.name).await,
                };
                (id, item, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, item, outcome) = match joined {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(error = %join_err, "garbage collection task panicked");
                    continue;
                }
            };
            match outcome {
                Ok(()) => {
                    if let Err(err) = self.prune_inventory(&item).await {
                        warn!(%id, error = %err, "deleted from cluster but failed to prune inventory entry");
                    }
                    report.deleted.push(id);
                }
                Err(err) => {
                    warn!(%id, error = %err, "garbage collection delete failed, leaving inventory entry in place");
                    report.failed.push((id, err));
                }
            }
        }
    }

    async fn prune_inventory(&self, item: &InventoryItem) -> Result<(), CoreError> {
        match item {
            InventoryItem::Manifest(m) => {
                self.inventory.remove_manifest(m.namespace.as_deref(), &m.name, &m.type_meta.kind).await
            }
            InventoryItem::HelmRelease(r) => self.inventory.remove_release(&r.namespace, &r.name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Component, ComponentId as Cid};
    use crate::inventory::{ManifestItem, TypeMeta};
    use std::sync::Mutex;

    struct FakeDeleter {
        calls: Mutex<Vec<serde_json::Value>>,
        fail_kind: Option<&'static str>,
    }

    #[async_trait]
    impl ManifestDeleter for FakeDeleter {
        async fn delete(&self, last_applied: &serde_json::Value) -> Result<(), CoreError> {
            self.calls.lock().unwrap().push(last_applied.clone());
            if let Some(kind) = self.fail_kind {
                if last_applied.get("kind").and_then(serde_json::Value::as_str) == Some(kind) {
                    return Err(CoreError::transient("DeleteFailed", crate::errors::CommandError::new_from_safe_message("boom".to_string())));
                }
            }
            Ok(())
        }
    }

    struct NoReleases;

    #[async_trait]
    impl ReleaseUninstaller for NoReleases {
        async fn uninstall(&self, _namespace: &str, _name: &str) -> Result<(), CoreError> {
            panic!("no releases expected in this test")
        }
    }

    fn manifest_item(name: &str, kind: &str) -> ManifestItem {
        ManifestItem {
            id: Cid::new(name, "ns", kind),
            type_meta: TypeMeta { api_version: "v1".to_string(), kind: kind.to_string() },
            name: name.to_string(),
            namespace: Some("ns".to_string()),
            last_applied: serde_json::json!({"apiVersion": "v1", "kind": kind, "metadata": {"name": name, "namespace": "ns"}}),
        }
    }

    #[tokio::test]
    async fn deletes_items_absent_from_the_new_graph_and_prunes_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path());
        inventory.put_manifest(&manifest_item("stale", "ConfigMap")).await.unwrap();
        inventory.put_manifest(&manifest_item("kept", "ConfigMap")).await.unwrap();

        let mut graph = DependencyGraph::new();
        graph
            .insert(Component::Manifest {
                id: Cid::new("kept", "ns", "ConfigMap"),
                dependencies: vec![],
                content: serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "kept", "namespace": "ns"}}),
            })
            .unwrap();

        let deleter = Arc::new(FakeDeleter { calls: Mutex::new(Vec::new()), fail_kind: None });
        let gc = GarbageCollector::new(
            inventory.clone(),
            deleter.clone(),
            Arc::new(NoReleases),
            GarbageCollectorConfig { worker_pool_size: 2 },
        );

        let report = gc.collect(&graph).await.unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0], Cid::new("stale", "ns", "ConfigMap"));
        assert_eq!(deleter.calls.lock().unwrap().len(), 1);

        let remaining = inventory.load_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), &Cid::new("kept", "ns", "ConfigMap"));
    }

    #[tokio::test]
    async fn failed_delete_keeps_inventory_entry_and_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path());
        inventory.put_manifest(&manifest_item("stale", "ConfigMap")).await.unwrap();

        let graph = DependencyGraph::new();
        let deleter = Arc::new(FakeDeleter { calls: Mutex::new(Vec::new()), fail_kind: Some("ConfigMap") });
        let gc = GarbageCollector::new(inventory.clone(), deleter, Arc::new(NoReleases), GarbageCollectorConfig { worker_pool_size: 1 });

        let report = gc.collect(&graph).await.unwrap();
        assert_eq!(report.deleted.len(), 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(inventory.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn namespaces_are_deleted_after_other_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path());
        let ns_item = ManifestItem {
            id: Cid::new("ns", "", "Namespace"),
            type_meta: TypeMeta { api_version: "v1".to_string(), kind: "Namespace".to_string() },
            name: "ns".to_string(),
            namespace: None,
            last_applied: serde_json::json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns"}}),
        };
        inventory.put_manifest(&ns_item).await.unwrap();
        inventory.put_manifest(&manifest_item("cm", "ConfigMap")).await.unwrap();

        let graph = DependencyGraph::new();
        let deleter = Arc::new(FakeDeleter { calls: Mutex::new(Vec::new()), fail_kind: None });
        let gc = GarbageCollector::new(inventory, deleter.clone(), Arc::new(NoReleases), GarbageCollectorConfig { worker_pool_size: 4 });

        gc.collect(&graph).await.unwrap();
        let calls = deleter.calls.lock().unwrap();
        let ns_pos = calls.iter().position(|c| c.get("kind").and_then(serde_json::Value::as_str) == Some("Namespace")).unwrap();
        let cm_pos = calls.iter().position(|c| c.get("kind").and_then(serde_json::Value::as_str) == Some("ConfigMap")).unwrap();
        assert!(cm_pos < ns_pos);
    }
}
