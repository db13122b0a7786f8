//! In-flight request registry and admission control.
//!
//! One registry per process, shared by `Arc`. All mutation goes through
//! [`RequestRegistry::admit`], [`RequestRegistry::end`] and
//! [`RequestRegistry::shutdown`], serialized by an internal mutex so the
//! occupancy invariant (`active <= max_concurrent`) holds under concurrent
//! admission attempts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type RequestId = u64;

/// Why a request left the registry. Logged on every terminal transition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EndReason {
    Completed,
    ClientDisconnected,
    TimedOut,
    Evicted,
    ShuttingDown,
    Failed(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::ClientDisconnected => f.write_str("client-disconnected"),
            Self::TimedOut => f.write_str("timeout"),
            Self::Evicted => f.write_str("evicted"),
            Self::ShuttingDown => f.write_str("shutting-down"),
            Self::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// What to do with a new request when every slot is taken.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum CapacityPolicy {
    /// Turn the new request away.
    #[default]
    Reject,
    /// End the oldest active request and admit the new one.
    EvictOldest,
}

#[derive(Debug, Error)]
#[error("max number of concurrent generations ({max_concurrent}) reached")]
pub struct CapacityExceeded {
    pub max_concurrent: usize,
}

/// A successful admission: the id and the cancellation handle owned by the
/// request's record. Cancelling the token tells the engine and the timeout
/// watchdog to stand down.
#[derive(Debug)]
pub struct Admission {
    pub id: RequestId,
    pub cancel: CancellationToken,
}

struct Record {
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    total_issued: u64,
    active: BTreeMap<RequestId, Record>,
}

/// Point-in-time view for the debug endpoint.
pub struct RegistrySnapshot {
    pub total_issued: u64,
    /// Live ids in admission order (ids are monotonic).
    pub active_ids: Vec<RequestId>,
}

pub struct RequestRegistry {
    max_concurrent: usize,
    policy: CapacityPolicy,
    inner: Mutex<Inner>,
}

impl RequestRegistry {
    pub fn new(max_concurrent: usize, policy: CapacityPolicy) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent,
            policy,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Atomic check-and-insert. Accepts iff a slot is free; with
    /// [`CapacityPolicy::EvictOldest`] a full registry ends its oldest
    /// request instead of rejecting. Rejection has no side effects.
    pub fn admit(&self) -> Result<Admission, CapacityExceeded> {
        let reject = || CapacityExceeded {
            max_concurrent: self.max_concurrent,
        };
        let (admission, evicted) = {
            let mut inner = self.inner.lock();
            let evicted = if inner.active.len() >= self.max_concurrent {
                match self.policy {
                    CapacityPolicy::Reject => return Err(reject()),
                    // A full registry with max_concurrent = 0 has nothing to
                    // evict either.
                    CapacityPolicy::EvictOldest => match inner.active.keys().next().copied() {
                        Some(oldest) => inner.active.remove(&oldest).map(|r| (oldest, r)),
                        None => return Err(reject()),
                    },
                }
            } else {
                None
            };

            let id = inner.total_issued;
            inner.total_issued += 1;
            let cancel = CancellationToken::new();
            inner.active.insert(
                id,
                Record {
                    cancel: cancel.clone(),
                },
            );
            (Admission { id, cancel }, evicted)
        };

        if let Some((id, record)) = evicted {
            finish(id, record, &EndReason::Evicted);
        }
        info!("request {} admitted", admission.id);
        Ok(admission)
    }

    pub fn is_live(&self, id: RequestId) -> bool {
        self.inner.lock().active.contains_key(&id)
    }

    /// Terminal transition. Idempotent: only the first call for an id removes
    /// the record, cancels its token and logs the reason; later calls (from
    /// racing triggers) are no-ops. Returns whether this call took effect.
    pub fn end(&self, id: RequestId, reason: EndReason) -> bool {
        let record = self.inner.lock().active.remove(&id);
        match record {
            Some(record) => {
                finish(id, record, &reason);
                true
            }
            None => false,
        }
    }

    /// Ends every active request. Called on controlled shutdown so engine-side
    /// work is released before the process exits.
    pub fn shutdown(&self) {
        let drained = std::mem::take(&mut self.inner.lock().active);
        for (id, record) in drained {
            finish(id, record, &EndReason::ShuttingDown);
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock();
        RegistrySnapshot {
            total_issued: inner.total_issued,
            active_ids: inner.active.keys().copied().collect(),
        }
    }
}

/// Cancel outside the registry lock and log once per terminal transition.
fn finish(id: RequestId, record: Record, reason: &EndReason) {
    record.cancel.cancel();
    match reason {
        EndReason::Failed(cause) => warn!("request {id} ended: failed: {cause}"),
        reason => info!("request {id} ended: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_capacity_then_rejects() {
        let registry = RequestRegistry::new(2, CapacityPolicy::Reject);
        let a = registry.admit().unwrap();
        let b = registry.admit().unwrap();
        assert_eq!((a.id, b.id), (0, 1));

        let err = registry.admit().unwrap_err();
        assert_eq!(err.max_concurrent, 2);
        // Rejection left the registry untouched.
        assert_eq!(registry.snapshot().active_ids, vec![0, 1]);
        assert_eq!(registry.snapshot().total_issued, 2);
    }

    #[test]
    fn ids_are_never_reused() {
        let registry = RequestRegistry::new(1, CapacityPolicy::Reject);
        let a = registry.admit().unwrap();
        registry.end(a.id, EndReason::Completed);
        let b = registry.admit().unwrap();
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert_eq!(registry.snapshot().total_issued, 2);
    }

    #[test]
    fn end_is_idempotent_and_cancels() {
        let registry = RequestRegistry::new(1, CapacityPolicy::Reject);
        let admission = registry.admit().unwrap();
        assert!(registry.is_live(admission.id));

        assert!(registry.end(admission.id, EndReason::Completed));
        assert!(admission.cancel.is_cancelled());
        assert!(!registry.is_live(admission.id));
        assert!(!registry.end(admission.id, EndReason::TimedOut));
        assert!(!registry.end(admission.id, EndReason::ClientDisconnected));
    }

    #[test]
    fn evict_oldest_frees_a_slot() {
        let registry = RequestRegistry::new(1, CapacityPolicy::EvictOldest);
        let a = registry.admit().unwrap();
        let b = registry.admit().unwrap();

        assert!(a.cancel.is_cancelled(), "evicted request must be cancelled");
        assert!(!registry.is_live(a.id));
        assert!(registry.is_live(b.id));
        assert_eq!(registry.snapshot().active_ids, vec![b.id]);
    }

    #[test]
    fn shutdown_drains_everything() {
        let registry = RequestRegistry::new(4, CapacityPolicy::Reject);
        let admissions: Vec<_> = (0..3).map(|_| registry.admit().unwrap()).collect();
        registry.shutdown();

        for admission in &admissions {
            assert!(admission.cancel.is_cancelled());
            assert!(!registry.is_live(admission.id));
        }
        assert!(registry.snapshot().active_ids.is_empty());
        assert_eq!(registry.snapshot().total_issued, 3);
    }

    #[test]
    fn concurrent_admissions_never_oversubscribe() {
        let registry = RequestRegistry::new(3, CapacityPolicy::Reject);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.admit().is_ok())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join())
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(admitted, 3);
        assert_eq!(registry.snapshot().active_ids.len(), 3);
    }
}
