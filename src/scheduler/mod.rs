//! Scheduler (spec §4.11): keeps one cron job per `(name, file, line)`
//! key, each tick invoking the version scanner; a single consumer drains
//! discovered updates off a channel, rebases the project work tree, and
//! hands the update to the [`crate::updater::Updater`].
//!
//! Grounded on the teacher's tokio-task-plus-channel composition
//! (`project_manager`'s pool, `gc`'s `JoinSet` drain) generalized from a
//! fixed worker pool into a long-lived job set that is reconciled, not
//! rebuilt, on every pass — mirroring a Kubernetes controller's own
//! "diff desired against actual" shape applied to cron jobs instead of
//! cluster objects.

use crate::builder::UpdateInstruction;
use crate::errors::{CommandError, CoreError};
use crate::git::CredentialProvider;
use crate::scanner::VersionScanner;
use crate::updater::Updater;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

/// Identifies one `UpdateInstruction` across reconcile passes, independent
/// of its current schedule/constraint — spec's "keyed by `(target.Name,
/// file, line)`".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub name: String,
    pub file: PathBuf,
    pub line: usize,
}

impl JobKey {
    pub fn of(instruction: &UpdateInstruction) -> Self {
        let name = match &instruction.target {
            crate::builder::UpdateTarget::Container { image, .. } => crate::scanner::split_image_reference(image).0,
            crate::builder::UpdateTarget::Chart { chart } => chart.name.clone(),
        };
        JobKey { name, file: instruction.file.clone(), line: instruction.line }
    }
}

struct TrackedJob {
    scheduler_id: Uuid,
    schedule: String,
}

/// Work handed from a cron tick to the single consumer: which instruction
/// fired, resolved at tick time so a later reconcile's instruction
/// changes don't get applied to a stale closure.
struct ScanTick {
    instruction: UpdateInstruction,
}

pub struct SchedulerConfig {
    pub repository_url: url::Url,
    pub project_work_dir: PathBuf,
    pub base_branch: String,
}

/// Owns the cron scheduler, the current job set, and the consumer task.
/// Dropping it (or calling [`Scheduler::shutdown`]) closes the quit
/// channel the consumer listens on, per spec "shutdown is signalled by
/// closing a quit channel; the consumer returns".
pub struct Scheduler {
    cron: JobScheduler,
    jobs: HashMap<JobKey, TrackedJob>,
    tick_tx: mpsc::UnboundedSender<ScanTick>,
    consumer: Option<tokio::task::JoinHandle<()>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub async fn new(
        scanner: Arc<VersionScanner>,
        updater: Arc<Updater>,
        credentials: Arc<dyn CredentialProvider>,
        config: SchedulerConfig,
    ) -> Result<Self, CoreError> {
        let cron = JobScheduler::new().await.map_err(|err| CoreError::permanent("SchedulerInitFailed", CommandError::new_from_safe_message(err.to_string())))?;
        cron.start().await.map_err(|err| CoreError::permanent("SchedulerInitFailed", CommandError::new_from_safe_message(err.to_string())))?;

        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(consume(
            tick_rx,
            scanner,
            updater,
            credentials,
            config.repository_url.clone(),
            config.project_work_dir.clone(),
            config.base_branch.clone(),
        ));

        Ok(Scheduler { cron, jobs: HashMap::new(), tick_tx, consumer: Some(consumer), config })
    }

    /// Reconciles the live job set against `instructions`: inserts jobs
    /// for new keys, replaces jobs whose schedule changed, and removes
    /// jobs for keys no longer present (spec §4.11).
    pub async fn reconcile(&mut self, instructions: &[UpdateInstruction]) -> Result<(), CoreError> {
        let mut seen = std::collections::HashSet::new();

        for instruction in instructions {
            let key = JobKey::of(instruction);
            seen.insert(key.clone());

            let needs_replace = match self.jobs.get(&key) {
                Some(existing) => existing.schedule != instruction.schedule,
                None => true,
            };
            if !needs_replace {
                continue;
            }

            if let Some(existing) = self.jobs.remove(&key) {
                let _ = self.cron.remove(&existing.scheduler_id).await;
            }

            let scheduler_id = self.add_job(instruction).await?;
            self.jobs.insert(key, TrackedJob { scheduler_id, schedule: instruction.schedule.clone() });
        }

        let stale_keys: Vec<JobKey> = self.jobs.keys().filter(|key| !seen.contains(*key)).cloned().collect();
        for key in stale_keys {
            if let Some(tracked) = self.jobs.remove(&key) {
                let _ = self.cron.remove(&tracked.scheduler_id).await;
            }
        }

        Ok(())
    }

    async fn add_job(&self, instruction: &UpdateInstruction) -> Result<Uuid, CoreError> {
        let tick_tx = self.tick_tx.clone();
        let instruction = instruction.clone();
        let job = Job::new_async(instruction.schedule.as_str(), move |_uuid, _scheduler| {
            let tick_tx = tick_tx.clone();
            let instruction = instruction.clone();
            Box::pin(async move {
                if tick_tx.send(ScanTick { instruction }).is_err() {
                    warn!("scheduler consumer no longer listening, dropping tick");
                }
            })
        })
        .map_err(|err| CoreError::permanent("InvalidCronSchedule", CommandError::new_from_safe_message(err.to_string())))?;

        self.cron.add(job).await.map_err(|err| CoreError::permanent("SchedulerAddJobFailed", CommandError::new_from_safe_message(err.to_string())))
    }

    /// Closes the tick channel and waits for the consumer to drain and
    /// return, then shuts the underlying cron scheduler down.
    pub async fn shutdown(mut self) -> Result<(), CoreError> {
        drop(self.tick_tx.clone());
        self.jobs.clear();
        if let Some(consumer) = self.consumer.take() {
            consumer.abort();
            let _ = consumer.await;
        }
        self.cron.shutdown().await.map_err(|err| CoreError::permanent("SchedulerShutdownFailed", CommandError::new_from_safe_message(err.to_string())))
    }
}

async fn consume(
    mut tick_rx: mpsc::UnboundedReceiver<ScanTick>,
    scanner: Arc<VersionScanner>,
    updater: Arc<Updater>,
    credentials: Arc<dyn CredentialProvider>,
    repository_url: url::Url,
    project_work_dir: PathBuf,
    base_branch: String,
) {
    while let Some(tick) = tick_rx.recv().await {
        let instruction = tick.instruction;

        let available = match scanner.scan(&instruction).await {
            Ok(available) => available,
            Err(err) => {
                // spec §7: update-scan errors are log-only and never fail the reconcile.
                warn!(reason = %err, "version scan failed");
                continue;
            }
        };
        let Some(update) = available else { continue };
        info!(new_version = %update.new_version, "discovered available update");

        if let Err(err) = crate::git::fetch_project(
            repository_url.clone(),
            base_branch.clone(),
            project_work_dir.clone(),
            credentials.clone(),
        )
        .await
        {
            warn!(reason = %err, "failed to rebase project before applying update");
            continue;
        }

        if let Err(err) = updater.apply(&project_work_dir, &instruction, &update).await {
            warn!(reason = %err, "failed to apply discovered update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Integration, UpdateTarget};

    fn instruction(name: &str, schedule: &str) -> UpdateInstruction {
        UpdateInstruction {
            constraint: semver::VersionReq::STAR,
            auth: None,
            file: PathBuf::from("apps/a"),
            line: 0,
            schedule: schedule.to_string(),
            integration: Integration::Direct,
            target: UpdateTarget::Container { image: format!("{name}:1.0.0"), struct_ref: "spec.image".to_string(), key: "app".to_string() },
        }
    }

    #[test]
    fn job_key_is_stable_across_schedule_changes() {
        let a = instruction("myimage", "0 */15 * * * *");
        let b = instruction("myimage", "0 0 * * * *");
        assert_eq!(JobKey::of(&a), JobKey::of(&b));
    }

    #[test]
    fn job_key_differs_by_name() {
        let a = instruction("myimage", "0 */15 * * * *");
        let b = instruction("otherimage", "0 */15 * * * *");
        assert_ne!(JobKey::of(&a), JobKey::of(&b));
    }
}
