//! Tuner arbiter — mediates exclusive access to N physical tuners.
//!
//! A single async mutex guards a `Vec` of slots, with a `tokio::sync::oneshot` cancel trigger
//! stored alongside each slot so preemption never needs to reach back into a session object.
//! Leases are exclusive (one workload per tuner, no subscriber sharing), placed by round-robin,
//! and subject to a priority-ranked preemption policy.

use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The three workloads that may request a tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    Live,
    Epg,
    Dvr,
}

/// A tuner's mutable lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerState {
    Idle,
    Live,
    Epg,
    Dvr,
    Cleaning,
}

impl From<LeaseKind> for TunerState {
    fn from(kind: LeaseKind) -> Self {
        match kind {
            LeaseKind::Live => TunerState::Live,
            LeaseKind::Epg => TunerState::Epg,
            LeaseKind::Dvr => TunerState::Dvr,
        }
    }
}

/// An exclusive lease on one physical tuner.
#[derive(Debug)]
pub struct Lease {
    pub tuner_id: usize,
    pub device_path: String,
    pub kind: LeaseKind,
}

struct TunerSlot {
    id: usize,
    device_path: String,
    state: TunerState,
    cancel: Option<oneshot::Sender<()>>,
}

struct Inner {
    tuners: Vec<TunerSlot>,
    last_granted: usize,
}

/// Total time budget for `acquire` before giving up and returning `None`.
const WAIT_BUDGET: Duration = Duration::from_secs(5);
/// Sleep between free-search retries when nothing was immediately grantable.
const RETRY_SLEEP: Duration = Duration::from_millis(750);
/// Poll interval while waiting for a preempted tuner to report itself idle.
const PREEMPT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Maximum time to wait for a preempted tuner to go idle before giving up on it.
const PREEMPT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TunerArbiter {
    inner: Mutex<Inner>,
    preemption_enabled: bool,
}

impl TunerArbiter {
    pub fn new(device_paths: Vec<String>, preemption_enabled: bool) -> Self {
        let n = device_paths.len();
        let tuners: Vec<TunerSlot> = device_paths
            .into_iter()
            .enumerate()
            .map(|(id, device_path)| TunerSlot {
                id,
                device_path,
                state: TunerState::Idle,
                cancel: None,
            })
            .collect();
        // So the first grant lands on slot 0: `try_grant_free` starts its search at
        // `last_granted + 1`, and with no prior grant that must wrap around to 0.
        let last_granted = n.saturating_sub(1);
        Self {
            inner: Mutex::new(Inner {
                tuners,
                last_granted,
            }),
            preemption_enabled,
        }
    }

    /// Acquire a lease of the given kind, blocking (cooperatively) up to the wait budget.
    pub async fn acquire(&self, kind: LeaseKind) -> Option<Lease> {
        let deadline = Instant::now() + WAIT_BUDGET;

        loop {
            if let Some(lease) = self.try_grant_free(kind).await {
                return Some(lease);
            }

            if let Some(victim_id) = self.pick_preemption_victim(kind).await {
                self.trigger_cancel(victim_id).await;
                if self.wait_for_idle(victim_id).await {
                    if let Some(lease) = self.try_grant_free(kind).await {
                        return Some(lease);
                    }
                }
            }

            if Instant::now() >= deadline {
                warn!(?kind, "tuner acquire exhausted wait budget");
                return None;
            }

            tokio::time::sleep(RETRY_SLEEP.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }

    /// Release a lease. Idempotent: releasing an already-idle tuner is a no-op.
    pub async fn release(&self, lease: Lease) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.tuners.iter_mut().find(|t| t.id == lease.tuner_id) {
            if slot.state != TunerState::Idle {
                debug!(tuner_id = lease.tuner_id, "releasing tuner lease");
            }
            slot.state = TunerState::Idle;
            slot.cancel = None;
        }
    }

    /// Register the cancel trigger a session exposes for preemption, keyed by tuner id.
    pub async fn set_cancel_trigger(&self, tuner_id: usize, tx: oneshot::Sender<()>) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.tuners.iter_mut().find(|t| t.id == tuner_id) {
            slot.cancel = Some(tx);
        }
    }

    /// True only when every tuner is idle — the EPG orchestrator's all-or-nothing scan guard.
    pub async fn all_idle(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.tuners.iter().all(|t| t.state == TunerState::Idle)
    }

    async fn try_grant_free(&self, kind: LeaseKind) -> Option<Lease> {
        let mut inner = self.inner.lock().await;
        let n = inner.tuners.len();
        if n == 0 {
            return None;
        }
        let start = (inner.last_granted + 1) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if inner.tuners[idx].state == TunerState::Idle {
                inner.tuners[idx].state = kind.into();
                inner.last_granted = idx;
                let lease = Lease {
                    tuner_id: inner.tuners[idx].id,
                    device_path: inner.tuners[idx].device_path.clone(),
                    kind,
                };
                info!(tuner_id = lease.tuner_id, ?kind, "tuner lease granted");
                return Some(lease);
            }
        }
        None
    }

    /// Pick a victim tuner to preempt, per the priority policy. Does not mutate state.
    async fn pick_preemption_victim(&self, kind: LeaseKind) -> Option<usize> {
        let inner = self.inner.lock().await;
        match kind {
            LeaseKind::Epg => None,
            LeaseKind::Dvr => inner
                .tuners
                .iter()
                .find(|t| t.state == TunerState::Live || t.state == TunerState::Epg)
                .map(|t| t.id),
            LeaseKind::Live => {
                if !self.preemption_enabled {
                    return None;
                }
                inner
                    .tuners
                    .iter()
                    .find(|t| t.state == TunerState::Live)
                    .map(|t| t.id)
            }
        }
    }

    async fn trigger_cancel(&self, tuner_id: usize) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.tuners.iter_mut().find(|t| t.id == tuner_id) {
            if let Some(tx) = slot.cancel.take() {
                slot.state = TunerState::Cleaning;
                let _ = tx.send(());
                info!(tuner_id, "preemption cancel trigger sent");
            }
        }
    }

    /// Poll for the victim transitioning to idle, 200ms interval up to 3s.
    async fn wait_for_idle(&self, tuner_id: usize) -> bool {
        let deadline = Instant::now() + PREEMPT_TIMEOUT;
        loop {
            {
                let inner = self.inner.lock().await;
                if let Some(slot) = inner.tuners.iter().find(|t| t.id == tuner_id) {
                    if slot.state == TunerState::Idle {
                        return true;
                    }
                } else {
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(PREEMPT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_arbiter(n: usize, preemption_enabled: bool) -> TunerArbiter {
        let paths = (0..n).map(|i| format!("/dev/tuner{i}")).collect();
        TunerArbiter::new(paths, preemption_enabled)
    }

    #[tokio::test]
    async fn round_robin_spreads_across_tuners() {
        let arbiter = make_arbiter(2, false);
        let l0 = arbiter.acquire(LeaseKind::Live).await.unwrap();
        assert_eq!(l0.tuner_id, 0);
        let l1 = arbiter.acquire(LeaseKind::Live).await.unwrap();
        assert_eq!(l1.tuner_id, 1);
        arbiter.release(l0).await;
        arbiter.release(l1).await;

        // After releasing both, the next grant should resume from after the last grant (1 -> 0).
        let l2 = arbiter.acquire(LeaseKind::Live).await.unwrap();
        assert_eq!(l2.tuner_id, 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let arbiter = make_arbiter(1, false);
        let lease = arbiter.acquire(LeaseKind::Live).await.unwrap();
        arbiter
            .release(Lease {
                tuner_id: lease.tuner_id,
                device_path: lease.device_path.clone(),
                kind: lease.kind,
            })
            .await;
        // Releasing an already-idle tuner must not panic or corrupt state.
        arbiter
            .release(Lease {
                tuner_id: lease.tuner_id,
                device_path: lease.device_path,
                kind: lease.kind,
            })
            .await;
        assert!(arbiter.all_idle().await);
    }

    #[tokio::test]
    async fn epg_never_preempts() {
        let arbiter = make_arbiter(1, true);
        let live = arbiter.acquire(LeaseKind::Live).await.unwrap();
        let (tx, _rx) = oneshot::channel();
        arbiter.set_cancel_trigger(live.tuner_id, tx).await;

        let epg_attempt = arbiter.acquire(LeaseKind::Epg).await;
        assert!(epg_attempt.is_none(), "epg must never preempt a live lease");
    }

    #[tokio::test]
    async fn live_preemption_requires_flag_and_only_targets_live() {
        // Without the flag: live cannot preempt another live.
        let arbiter = make_arbiter(1, false);
        let first = arbiter.acquire(LeaseKind::Live).await.unwrap();
        let (tx, _rx) = oneshot::channel();
        arbiter.set_cancel_trigger(first.tuner_id, tx).await;
        assert!(arbiter.acquire(LeaseKind::Live).await.is_none());

        // With the flag, and a cancel trigger that actually releases on fire: preemption proceeds.
        let arbiter = make_arbiter(1, true);
        let first = arbiter.acquire(LeaseKind::Live).await.unwrap();
        let (tx, rx) = oneshot::channel();
        arbiter.set_cancel_trigger(first.tuner_id, tx).await;
        let arbiter = std::sync::Arc::new(arbiter);
        let releaser = {
            let arbiter = arbiter.clone();
            let tuner_id = first.tuner_id;
            let device_path = first.device_path.clone();
            tokio::spawn(async move {
                let _ = rx.await;
                arbiter
                    .release(Lease {
                        tuner_id,
                        device_path,
                        kind: LeaseKind::Live,
                    })
                    .await;
            })
        };
        let second = arbiter.acquire(LeaseKind::Live).await;
        assert!(
            second.is_some(),
            "live should preempt live when enabled and the victim releases"
        );
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn dvr_preempts_live_or_epg() {
        let arbiter = std::sync::Arc::new(make_arbiter(1, false));
        let epg = arbiter.acquire(LeaseKind::Epg).await.unwrap();
        let (tx, rx) = oneshot::channel();
        arbiter.set_cancel_trigger(epg.tuner_id, tx).await;
        let releaser = {
            let arbiter = arbiter.clone();
            let tuner_id = epg.tuner_id;
            let device_path = epg.device_path.clone();
            tokio::spawn(async move {
                let _ = rx.await;
                arbiter
                    .release(Lease {
                        tuner_id,
                        device_path,
                        kind: LeaseKind::Epg,
                    })
                    .await;
            })
        };
        let dvr = arbiter.acquire(LeaseKind::Dvr).await;
        assert!(
            dvr.is_some(),
            "dvr may preempt epg even without the live-preemption flag"
        );
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn all_idle_reflects_pool_state() {
        let arbiter = make_arbiter(2, false);
        assert!(arbiter.all_idle().await);
        let lease = arbiter.acquire(LeaseKind::Epg).await.unwrap();
        assert!(!arbiter.all_idle().await);
        arbiter.release(lease).await;
        assert!(arbiter.all_idle().await);
    }
}
