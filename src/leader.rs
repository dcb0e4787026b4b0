//! Leader election (SPEC_FULL §2 stage 11, §5): one `coordination.k8s.io/v1`
//! `Lease` per shard. Only the holder runs reconcile passes for that
//! shard's projects; losing the lease cancels a
//! [`tokio_util::sync::CancellationToken`] so in-flight work observes it
//! at its next suspension point (spec §5's cooperative-cancellation
//! requirement), the same token [`crate::reconcile::Reconciler`]'s
//! caller is expected to race against `select!` around every fetch/apply
//! call.

use crate::errors::CoreError;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::Api;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    pub identity: String,
}

/// Runs the acquire/renew loop for one shard. `leadership()` reports the
/// current state; `cancellation_token()` is cancelled the moment this
/// process observes it has lost (or failed to renew) the lease.
pub struct LeaderElector {
    client: kube::Client,
    config: LeaderElectionConfig,
    is_leader: watch::Sender<bool>,
    cancellation: CancellationToken,
}

impl LeaderElector {
    pub fn new(client: kube::Client, config: LeaderElectionConfig) -> (Self, watch::Receiver<bool>) {
        let (is_leader, receiver) = watch::channel(false);
        (LeaderElector { client, config, is_leader, cancellation: CancellationToken::new() }, receiver)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Acquires/renews the lease on every tick until `shutdown` fires.
    /// Loses leadership -> cancels in-flight work once, this process's
    /// cancellation token does not reset, so regaining the lease later
    /// in the same process lifetime requires a fresh `LeaderElector`.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(identity = %self.config.identity, "leader election loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(RENEW_INTERVAL) => {}
            }

            let is_leader = match self.try_acquire_or_renew().await {
                Ok(is_leader) => is_leader,
                Err(err) => {
                    warn!(identity = %self.config.identity, %err, "leader election renew failed, assuming not leader");
                    false
                }
            };

            let was_leader = *self.is_leader.borrow();
            if was_leader && !is_leader {
                warn!(identity = %self.config.identity, "lost leadership, cancelling in-flight work");
                self.cancellation.cancel();
            }
            let _ = self.is_leader.send(is_leader);
        }
    }

    #[instrument(skip(self), fields(identity = %self.config.identity))]
    async fn try_acquire_or_renew(&self) -> Result<bool, CoreError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.config.lease_namespace);
        let now = chrono::Utc::now();

        match api.get(&self.config.lease_name).await {
            Ok(existing) => {
                let spec = existing.spec.unwrap_or_default();
                let held_by_us = spec.holder_identity.as_deref() == Some(self.config.identity.as_str());
                let expired = spec
                    .renew_time
                    .as_ref()
                    .map(|t| now.signed_duration_since(t.0).num_seconds() > LEASE_DURATION.as_secs() as i64)
                    .unwrap_or(true);

                if !held_by_us && !expired {
                    return Ok(false);
                }

                let patch = Lease {
                    metadata: ObjectMeta { name: Some(self.config.lease_name.clone()), ..Default::default() },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.config.identity.clone()),
                        lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                        acquire_time: spec.acquire_time.or(Some(MicroTime(now))),
                        renew_time: Some(MicroTime(now)),
                        lease_transitions: Some(spec.lease_transitions.unwrap_or(0) + if held_by_us { 0 } else { 1 }),
                        ..Default::default()
                    }),
                };
                api.patch(&self.config.lease_name, &PatchParams::apply(crate::kube_apply::FIELD_MANAGER).force(), &Patch::Apply(&patch)).await?;
                Ok(true)
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                let lease = Lease {
                    metadata: ObjectMeta { name: Some(self.config.lease_name.clone()), ..Default::default() },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.config.identity.clone()),
                        lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                api.create(&PostParams::default(), &lease).await?;
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_is_clonable_and_shared() {
        let token = CancellationToken::new();
        let child = token.clone();
        assert!(!child.is_cancelled());
        token.cancel();
        assert!(child.is_cancelled());
    }
}
