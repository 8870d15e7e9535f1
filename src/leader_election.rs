//! Lease-based leader election.
//!
//! Only the Lease holder runs the controllers and the DNS flush loop; the
//! in-process lifecycle lock table also requires a single active operator.
//! Every instance repeatedly calls [`LeaseLock::try_acquire_or_renew`]: the
//! holder renews, standbys wait for the TTL to lapse and then take over.
//! Losing a compare-and-swap race on the Lease's `resourceVersion` reads as
//! "not the leader", never as an error.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};

pub const LEASE_NAME: &str = "lattice-operator-leader";
const LEASE_TTL_SECS: i32 = 15;

/// How often the holder renews and standbys re-check.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Where the lease stands relative to this instance.
enum LeaseState {
    Absent,
    Ours(Lease),
    HeldElsewhere,
    Lapsed(Lease),
}

pub struct LeaseLock {
    api: Api<Lease>,
    holder: String,
}

impl LeaseLock {
    pub fn new(client: Client, namespace: &str, holder: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            holder: holder.into(),
        }
    }

    /// One election step: create, renew, or take over the lease as the
    /// observed state demands. Returns whether this instance holds the
    /// lease after the step.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        match self.observe().await? {
            LeaseState::Absent => self.create().await,
            LeaseState::Ours(lease) => self.renew(lease).await,
            LeaseState::HeldElsewhere => Ok(false),
            LeaseState::Lapsed(lease) => {
                info!(holder = %self.holder, "Lease lapsed, taking over");
                self.take_over(lease).await
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting out the
    /// TTL. Best-effort, used on graceful shutdown.
    pub async fn step_down(&self) {
        let lease = match self.observe().await {
            Ok(LeaseState::Ours(lease)) => lease,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Could not read lease to step down");
                return;
            }
        };

        let mut released = lease;
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .api
            .replace(LEASE_NAME, &PostParams::default(), &released)
            .await
        {
            Ok(_) => info!(holder = %self.holder, "Stepped down from leadership"),
            Err(e) => warn!(error = %e, "Failed to step down cleanly"),
        }
    }

    async fn observe(&self) -> Result<LeaseState> {
        let lease = self.api.get_opt(LEASE_NAME).await?;
        Ok(classify(lease, &self.holder))
    }

    async fn create(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.clone()),
                lease_duration_seconds: Some(LEASE_TTL_SECS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                preferred_holder: None,
                strategy: None,
            }),
        };
        self.settle_race(self.api.create(&PostParams::default(), &lease).await)
    }

    async fn renew(&self, lease: Lease) -> Result<bool> {
        let mut renewed = lease;
        if let Some(spec) = renewed.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.settle_race(
            self.api
                .replace(LEASE_NAME, &PostParams::default(), &renewed)
                .await,
        )
    }

    async fn take_over(&self, lease: Lease) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let transitions = lease
            .spec
            .as_ref()
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0);

        let mut taken = lease;
        taken.spec = Some(LeaseSpec {
            holder_identity: Some(self.holder.clone()),
            lease_duration_seconds: Some(LEASE_TTL_SECS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions + 1),
            preferred_holder: None,
            strategy: None,
        });
        self.settle_race(
            self.api
                .replace(LEASE_NAME, &PostParams::default(), &taken)
                .await,
        )
    }

    /// A 409 on the lease means someone else won the write race; that's a
    /// normal election outcome, not a failure.
    fn settle_race(&self, result: kube::Result<Lease>) -> Result<bool> {
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = Error::from(e);
                if err.is_conflict() {
                    debug!(holder = %self.holder, "Lost the lease write race");
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Classify the lease against this instance's identity. A missing renew
/// time counts as lapsed; a lease we already hold is always renewable.
fn classify(lease: Option<Lease>, holder: &str) -> LeaseState {
    let Some(lease) = lease else {
        return LeaseState::Absent;
    };

    let spec = lease.spec.clone().unwrap_or_default();
    match spec.holder_identity.as_deref() {
        Some(current) if current == holder => return LeaseState::Ours(lease),
        Some(_) => {}
        // A stepped-down lease has no holder; take it without waiting.
        None => return LeaseState::Lapsed(lease),
    }

    let ttl = i64::from(spec.lease_duration_seconds.unwrap_or(LEASE_TTL_SECS));
    let fresh = spec.renew_time.as_ref().is_some_and(|MicroTime(renewed)| {
        Utc::now().signed_duration_since(*renewed).num_seconds() <= ttl
    });
    if fresh {
        LeaseState::HeldElsewhere
    } else {
        LeaseState::Lapsed(lease)
    }
}
