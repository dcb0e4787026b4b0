//! Component Builder (spec §4.2) and the `UpdateInstruction` harvesting
//! that rides along with it.
//!
//! The configuration-language compiler itself is an external
//! collaborator (DESIGN NOTES: "Configuration language"); this module
//! only needs a [`ComponentCompiler`] that turns a package path into a
//! list of [`RawComponent`] records. [`YamlPackageCompiler`] is a
//! pragmatic default (and the one the test suite drives); a real
//! deployment can plug in a CUE-shelling compiler behind the same
//! trait without the builder or anything downstream noticing.

use crate::errors::{CommandError, CoreError};
use crate::graph::{ChartAuth, ChartReference, Component, ComponentId, CrdPolicy, HelmReleaseContent, Patch};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// The internal record the compiler is expected to decode its top-level
/// package fields into (spec §4.2): `{ID, Type, Dependencies, Name?,
/// Namespace?, Chart?, Values?, Content?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawComponent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub chart: Option<ChartReference>,
    #[serde(default)]
    pub values: Value,
    pub content: Option<Value>,
    pub crds: Option<CrdPolicy>,
    #[serde(default)]
    pub patches: Vec<Patch>,
}

#[async_trait]
pub trait ComponentCompiler: Send + Sync {
    /// Compiles the package rooted at `project_root.join(package_path)`
    /// and returns its top-level component declarations. No other I/O
    /// is expected; the builder stays pure given this trait's contract.
    async fn compile_package(&self, project_root: &Path, package_path: &Path) -> Result<Vec<RawComponent>, CoreError>;

    /// Whether `dir` holds at least one file this compiler takes as
    /// input — used by [`crate::project_manager`] to decide which
    /// directories are packages worth building (spec §4.3).
    fn is_package_dir(&self, dir: &Path) -> bool;
}

/// Reads every `*.yaml`/`*.yml` file directly inside the package
/// directory (non-recursively — recursion into subpackages is the
/// [`crate::project_manager`]'s job) as a YAML sequence of
/// [`RawComponent`] documents.
pub struct YamlPackageCompiler;

#[async_trait]
impl ComponentCompiler for YamlPackageCompiler {
    async fn compile_package(&self, project_root: &Path, package_path: &Path) -> Result<Vec<RawComponent>, CoreError> {
        let dir = project_root.join(package_path);
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut components = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
            if !is_yaml {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            for doc in serde_yaml::Deserializer::from_str(&text) {
                let raw = RawComponent::deserialize(doc).map_err(|err| {
                    CoreError::permanent(
                        "PackageDecodeFailed",
                        CommandError::new(
                            format!("failed to decode component in {}", path.display()),
                            Some(err.to_string()),
                        ),
                    )
                })?;
                components.push(raw);
            }
        }
        Ok(components)
    }

    fn is_package_dir(&self, dir: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else { return false };
        entries.filter_map(Result::ok).any(|entry| {
            matches!(entry.path().extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Integration {
    Direct,
    Pr,
}

#[derive(Debug, Clone)]
pub enum UpdateTarget {
    Container { image: String, struct_ref: String, key: String },
    Chart { chart: ChartReference },
}

/// A version field the controller is allowed to update (spec §3, §4.2,
/// §4.9).
#[derive(Debug, Clone)]
pub struct UpdateInstruction {
    pub constraint: semver::VersionReq,
    pub auth: Option<ChartAuth>,
    pub file: PathBuf,
    pub line: usize,
    pub schedule: String,
    pub integration: Integration,
    pub target: UpdateTarget,
}

/// Defaults applied to `UpdateInstruction`s harvested automatically
/// (every `HelmRelease.Chart`) for fields the data model does not carry
/// on `HelmReleaseContent` itself. The spec is silent on where a Helm
/// release's update schedule/constraint come from; resolved in
/// DESIGN.md as "inherit the builder's defaults, same as Flux's image
/// automation defaults a float constraint when none is pinned".
#[derive(Debug, Clone)]
pub struct UpdatePolicyDefaults {
    pub chart_constraint: semver::VersionReq,
    pub schedule: String,
    pub integration: Integration,
}

impl Default for UpdatePolicyDefaults {
    fn default() -> Self {
        UpdatePolicyDefaults {
            chart_constraint: semver::VersionReq::STAR,
            schedule: "0 */15 * * * *".to_string(),
            integration: Integration::Direct,
        }
    }
}

/// Annotation prefix carried by manifests that opt an image field into
/// version scanning. Suffix is the instruction's `Key`; value is a
/// `;`-separated `field=value` list (`image`, `struct_ref`,
/// `constraint`, `schedule`, `integration`).
pub const UPDATE_ANNOTATION_PREFIX: &str = "update.navecd.io/";

pub struct ComponentBuilder {
    pub compiler: std::sync::Arc<dyn ComponentCompiler>,
    pub update_defaults: UpdatePolicyDefaults,
}

impl ComponentBuilder {
    pub fn new(compiler: std::sync::Arc<dyn ComponentCompiler>) -> Self {
        ComponentBuilder { compiler, update_defaults: UpdatePolicyDefaults::default() }
    }

    /// Compiles one package and decodes it into `Component`s plus the
    /// `UpdateInstruction`s harvested from it. Pure apart from the
    /// delegate compiler's own I/O, and safe to call concurrently on
    /// distinct packages (spec §4.2).
    pub async fn build_package(
        &self,
        project_root: &Path,
        package_path: &Path,
    ) -> Result<(Vec<Component>, Vec<UpdateInstruction>), CoreError> {
        let raw_components = self.compiler.compile_package(project_root, package_path).await?;

        let mut components = Vec::with_capacity(raw_components.len());
        let mut instructions = Vec::new();

        for raw in raw_components {
            let id = ComponentId::from(raw.id.clone());
            let dependencies = raw.dependencies.iter().cloned().map(ComponentId::from).collect();

            match raw.kind.as_str() {
                "Manifest" => {
                    let content = raw.content.ok_or_else(|| missing_field(&raw.id, "content"))?;
                    validate_manifest(&raw.id, &content)?;
                    instructions.extend(self.harvest_image_instructions(&content, package_path));
                    components.push(Component::Manifest { id, dependencies, content });
                }
                "HelmRelease" => {
                    let chart = raw.chart.ok_or_else(|| missing_field(&raw.id, "chart"))?;
                    let name = raw.name.ok_or_else(|| missing_field(&raw.id, "name"))?;
                    let namespace = raw.namespace.ok_or_else(|| missing_field(&raw.id, "namespace"))?;
                    let crds = raw.crds.unwrap_or(CrdPolicy { allow_upgrade: false });

                    instructions.push(self.chart_update_instruction(&chart, package_path));

                    components.push(Component::HelmRelease {
                        id,
                        dependencies,
                        content: HelmReleaseContent {
                            name,
                            namespace,
                            chart,
                            values: raw.values,
                            crds,
                            patches: raw.patches,
                        },
                    });
                }
                other => {
                    return Err(CoreError::permanent(
                        "UnknownComponentType",
                        CommandError::new_from_safe_message(format!("component {} has unknown type {other}", raw.id)),
                    ));
                }
            }
        }

        Ok((components, instructions))
    }

    fn chart_update_instruction(&self, chart: &ChartReference, package_path: &Path) -> UpdateInstruction {
        UpdateInstruction {
            constraint: self.update_defaults.chart_constraint.clone(),
            auth: chart.auth.clone(),
            file: package_path.to_path_buf(),
            line: 0,
            schedule: self.update_defaults.schedule.clone(),
            integration: self.update_defaults.integration,
            target: UpdateTarget::Chart { chart: chart.clone() },
        }
    }

    fn harvest_image_instructions(&self, content: &Value, package_path: &Path) -> Vec<UpdateInstruction> {
        let mut out = Vec::new();
        let Some(annotations) = content.pointer("/metadata/annotations").and_then(Value::as_object) else {
            return out;
        };

        for (key, value) in annotations {
            let Some(target_key) = key.strip_prefix(UPDATE_ANNOTATION_PREFIX) else { continue };
            let Some(value) = value.as_str() else { continue };
            let fields = parse_annotation_fields(value);

            let Some(image) = fields.get("image") else { continue };
            let struct_ref = fields.get("struct_ref").cloned().unwrap_or_default();
            let constraint = fields
                .get("constraint")
                .and_then(|c| semver::VersionReq::parse(c).ok())
                .unwrap_or(semver::VersionReq::STAR);
            let schedule = fields.get("schedule").cloned().unwrap_or_else(|| self.update_defaults.schedule.clone());
            let integration = match fields.get("integration").map(String::as_str) {
                Some("pr") => Integration::Pr,
                _ => Integration::Direct,
            };

            out.push(UpdateInstruction {
                constraint,
                auth: None,
                file: package_path.to_path_buf(),
                line: 0,
                schedule,
                integration,
                target: UpdateTarget::Container {
                    image: image.clone(),
                    struct_ref,
                    key: target_key.to_string(),
                },
            });
        }

        out
    }
}

fn parse_annotation_fields(value: &str) -> std::collections::HashMap<String, String> {
    value
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn missing_field(component_id: &str, field: &str) -> CoreError {
    CoreError::permanent(
        "MissingField",
        CommandError::new_from_safe_message(format!("component {component_id} is missing required field `{field}`")),
    )
}

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PersistentVolume",
];

fn validate_manifest(component_id: &str, content: &Value) -> Result<(), CoreError> {
    if content.pointer("/apiVersion").and_then(Value::as_str).is_none() {
        return Err(missing_field(component_id, "apiVersion"));
    }
    let kind = content.pointer("/kind").and_then(Value::as_str).ok_or_else(|| missing_field(component_id, "kind"))?;
    if content.pointer("/metadata/name").and_then(Value::as_str).is_none() {
        return Err(missing_field(component_id, "metadata.name"));
    }
    let namespace_present = content.pointer("/metadata/namespace").and_then(Value::as_str).is_some();
    if !namespace_present && !CLUSTER_SCOPED_KINDS.contains(&kind) {
        return Err(missing_field(component_id, "metadata.namespace"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manifest_yaml() -> &'static str {
        r#"
id: "mysubcomponent_mynamespace_Deployment"
type: Manifest
dependencies: ["mynamespace__Namespace"]
content:
  apiVersion: apps/v1
  kind: Deployment
  metadata:
    name: mysubcomponent
    namespace: mynamespace
    annotations:
      update.navecd.io/app: "image=myimage:1.15.0;struct_ref=spec.template.spec.containers[0].image;constraint=<1.17;integration=direct"
"#
    }

    #[tokio::test]
    async fn builds_manifest_and_harvests_image_update_instruction() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deployment.yaml"), manifest_yaml()).unwrap();

        let builder = ComponentBuilder::new(Arc::new(YamlPackageCompiler));
        let (components, instructions) = builder.build_package(dir.path(), Path::new(".")).await.unwrap();

        assert_eq!(components.len(), 1);
        assert_eq!(instructions.len(), 1);
        match &instructions[0].target {
            UpdateTarget::Container { image, .. } => assert_eq!(image, "myimage:1.15.0"),
            other => panic!("expected Container target, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_namespace_on_namespaced_kind_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.yaml"),
            r#"
id: "x_y_Deployment"
type: Manifest
content:
  apiVersion: apps/v1
  kind: Deployment
  metadata:
    name: x
"#,
        )
        .unwrap();

        let builder = ComponentBuilder::new(Arc::new(YamlPackageCompiler));
        let err = builder.build_package(dir.path(), Path::new(".")).await.unwrap_err();
        assert_eq!(err.reason, "MissingField");
    }
}
