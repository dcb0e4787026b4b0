//! The `GitopsProject` custom resource (spec §6): the one external
//! interface this crate defines rather than consumes. One project = one
//! Git repository tracked at one branch, reconciled on its own
//! `pullIntervalSeconds` cadence.
//!
//! `Condition` intentionally does not reuse
//! `k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition` — that
//! type has no `JsonSchema` impl under this workspace's `k8s-openapi`
//! feature set, and `kube::CustomResource` needs one on every field of
//! the status it derives. The shape here matches the standard condition
//! fields byte for byte.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gitops.navecd.io",
    version = "v1",
    kind = "GitopsProject",
    plural = "gitopsprojects",
    namespaced,
    status = "GitopsProjectStatus",
    shortname = "gp"
)]
#[serde(rename_all = "camelCase")]
pub struct GitopsProjectSpec {
    /// Git URL the project is fetched from (spec §3 Project Spec).
    pub url: String,
    pub branch: String,
    #[serde(default)]
    pub pull_interval_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    pub stage: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Set to `True` while a reconcile pass is in flight for this project, per
/// the e2e scenario's "`Conditions` contains `Running` then
/// `Finished=True,reason=Success`" progression.
pub const CONDITION_TYPE_RUNNING: &str = "Running";
/// Terminal state of the most recent reconcile pass: `True,reason=Success`
/// or `False,reason=<Kind>` where `<Kind>` is the error's
/// `Transient`/`Permanent`/`Partial` classification, not the specific
/// machine-readable reason a leaf component reported.
pub const CONDITION_TYPE_FINISHED: &str = "Finished";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub commit_hash: String,
    pub reconcile_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitopsProjectStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

impl GitopsProjectStatus {
    /// Replaces the condition named `type_`, updating `lastTransitionTime`
    /// only when its `status` actually changed, matching the
    /// `observedGeneration` convention standard K8s conditions use to let
    /// watchers distinguish a repeated failure from a fresh one.
    pub fn set_condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str, observed_generation: i64, now: &str) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.last_transition_time = now.to_string();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = Some(observed_generation);
            return;
        }
        self.conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now.to_string(),
            observed_generation: Some(observed_generation),
        });
    }

    /// Marks a reconcile pass as in flight (spec §8 "Conditions contains
    /// `Running` then `Finished=True,reason=Success`").
    pub fn mark_running(&mut self, observed_generation: i64, now: &str) {
        self.set_condition(CONDITION_TYPE_RUNNING, ConditionStatus::True, "Reconciling", "reconcile pass in progress", observed_generation, now);
    }

    /// Marks the most recent reconcile pass finished, successfully or not.
    /// `reason` is `"Success"` on success (spec §4.8 step 6) or the
    /// error's `Transient`/`Permanent`/`Partial` kind on failure (spec §7).
    pub fn mark_finished(&mut self, status: ConditionStatus, reason: &str, message: &str, observed_generation: i64, now: &str) {
        self.set_condition(CONDITION_TYPE_RUNNING, ConditionStatus::False, "Idle", "reconcile pass finished", observed_generation, now);
        self.set_condition(CONDITION_TYPE_FINISHED, status, reason, message, observed_generation, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_condition_is_inserted_once() {
        let mut status = GitopsProjectStatus::default();
        status.set_condition(CONDITION_TYPE_FINISHED, ConditionStatus::True, "Success", "applied 4 manifests", 1, "2026-01-01T00:00:00Z");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let mut status = GitopsProjectStatus::default();
        status.set_condition(CONDITION_TYPE_FINISHED, ConditionStatus::True, "Success", "ok", 1, "t0");
        status.set_condition(CONDITION_TYPE_FINISHED, ConditionStatus::True, "Success", "ok again", 2, "t1");
        assert_eq!(status.conditions[0].last_transition_time, "t0");

        status.set_condition(CONDITION_TYPE_FINISHED, ConditionStatus::False, "Transient", "network error", 3, "t2");
        assert_eq!(status.conditions[0].last_transition_time, "t2");
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn mark_running_then_mark_finished_leaves_both_conditions_present() {
        let mut status = GitopsProjectStatus::default();
        status.mark_running(1, "t0");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].type_, CONDITION_TYPE_RUNNING);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);

        status.mark_finished(ConditionStatus::True, "Success", "reconcile pass applied successfully", 1, "t1");
        assert_eq!(status.conditions.len(), 2);
        let running = status.conditions.iter().find(|c| c.type_ == CONDITION_TYPE_RUNNING).unwrap();
        assert_eq!(running.status, ConditionStatus::False);
        let finished = status.conditions.iter().find(|c| c.type_ == CONDITION_TYPE_FINISHED).unwrap();
        assert_eq!(finished.status, ConditionStatus::True);
        assert_eq!(finished.reason, "Success");
    }

    #[test]
    fn mark_finished_failure_uses_error_kind_as_reason() {
        let mut status = GitopsProjectStatus::default();
        status.mark_finished(ConditionStatus::False, "Transient", "fetch failed", 2, "t0");
        let finished = status.conditions.iter().find(|c| c.type_ == CONDITION_TYPE_FINISHED).unwrap();
        assert_eq!(finished.reason, "Transient");
        assert_eq!(finished.status, ConditionStatus::False);
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = GitopsProjectSpec {
            url: "git@example.com:org/repo.git".to_string(),
            branch: "main".to_string(),
            pull_interval_seconds: 60,
            suspend: None,
            stage: "prod".to_string(),
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["pullIntervalSeconds"], 60);
        assert!(value.get("suspend").is_none());
    }
}
