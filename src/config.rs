//! Configuration layer (SPEC_FULL §4.12): one `Config` record assembled
//! once at process start from CLI flags, environment variables and
//! pod-info files, handed down into a plain, documented-default struct
//! per subsystem. No variadic option functions (DESIGN NOTES "Options
//! style") — every field is named and every default lives here, not
//! scattered across constructors.

use std::path::{Path, PathBuf};

/// Reads a pod-info downward-API file (one value per file, as the
/// `--namespace-podinfo-path`/`--name-podinfo-path`/`--shard-podinfo-path`
/// flags describe) and trims the trailing newline Kubernetes writes.
pub fn read_podinfo_value(path: &Path) -> std::io::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

pub fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub metrics_bind_address: String,
    pub health_probe_bind_address: String,
    pub log_level: String,
    pub insecure_skip_tls_verify: bool,
    pub plain_http: bool,
    pub worker_pool_size: usize,
    pub inventory_path: PathBuf,
    pub controller_namespace: String,
    pub shard_identity: String,
    pub base_branch: String,
    pub field_manager: String,
}

impl Config {
    pub fn reconciler_config(&self) -> crate::reconcile::ReconcilerConfig {
        crate::reconcile::ReconcilerConfig {
            worker_pool_size: self.worker_pool_size,
            field_manager: self.field_manager.clone(),
            base_branch: self.base_branch.clone(),
        }
    }

    pub fn manifest_reconciler_config(&self) -> crate::reconcile::ManifestReconcilerConfig {
        crate::reconcile::ManifestReconcilerConfig { field_manager: self.field_manager.clone() }
    }

    pub fn chart_reconciler_config(&self) -> crate::helmchart::HelmChartReconcilerConfig {
        crate::helmchart::HelmChartReconcilerConfig { field_manager: self.field_manager.clone() }
    }

    pub fn secret_decrypter_config(&self) -> crate::secrets::SecretDecrypterConfig {
        crate::secrets::SecretDecrypterConfig { controller_namespace: self.controller_namespace.clone(), worker_pool_size: self.worker_pool_size }
    }

    pub fn garbage_collector_config(&self) -> crate::gc::GarbageCollectorConfig {
        crate::gc::GarbageCollectorConfig { worker_pool_size: self.worker_pool_size }
    }

    pub fn project_manager_config(&self) -> crate::project_manager::ProjectManagerConfig {
        crate::project_manager::ProjectManagerConfig { worker_pool_size: self.worker_pool_size }
    }

    pub fn leader_election_config(&self) -> crate::leader::LeaderElectionConfig {
        crate::leader::LeaderElectionConfig {
            lease_name: self.shard_identity.clone(),
            lease_namespace: self.controller_namespace.clone(),
            identity: gethostname::gethostname().to_string_lossy().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn podinfo_value_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("namespace");
        std::fs::write(&path, "my-namespace\n").unwrap();
        assert_eq!(read_podinfo_value(&path).unwrap(), "my-namespace");
    }

    #[test]
    fn reconciler_config_carries_field_manager_through() {
        let config = Config {
            metrics_bind_address: "0.0.0.0:8080".to_string(),
            health_probe_bind_address: "0.0.0.0:8081".to_string(),
            log_level: "info".to_string(),
            insecure_skip_tls_verify: false,
            plain_http: false,
            worker_pool_size: 4,
            inventory_path: PathBuf::from("/inventory"),
            controller_namespace: "navecd-system".to_string(),
            shard_identity: "default".to_string(),
            base_branch: "main".to_string(),
            field_manager: "navecd".to_string(),
        };
        assert_eq!(config.reconciler_config().field_manager, "navecd");
        assert_eq!(config.chart_reconciler_config().field_manager, "navecd");
    }
}
