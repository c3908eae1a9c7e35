//! Bounded admission of asynchronous units with fail-fast completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{Outcome, Unit};

/// Construction error: a pool must be able to run at least one unit.
#[derive(Debug, thiserror::Error)]
#[error("task pool capacity must be at least 1, got {0}")]
pub struct InvalidCapacity(pub usize);

struct Member {
    unit: Unit,
    // dropping the permit frees the slot, so membership removal and
    // capacity release are a single operation
    _permit: tokio::sync::OwnedSemaphorePermit,
}

type Members = Arc<Mutex<HashMap<usize, Member>>>;

/// Admits asynchronous units up to a fixed capacity and aggregates their
/// completion into a single signal.
///
/// `admit` suspends the submitting task while the pool is full - this is the
/// deliberate backpressure point that bounds concurrent work. The signal
/// returned by [`TaskPool::drain`] resolves successfully once every admitted
/// unit has finished, or with the *first* observed failure as soon as any
/// unit fails; remaining units are not canceled and run to completion
/// unobserved.
pub struct TaskPool {
    members: Members,
    slots: Arc<tokio::sync::Semaphore>,
    signal: Unit,
    capacity: usize,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Result<Self, InvalidCapacity> {
        if capacity < 1 {
            return Err(InvalidCapacity(capacity));
        }
        Ok(Self {
            members: Arc::new(Mutex::new(HashMap::new())),
            slots: Arc::new(tokio::sync::Semaphore::new(capacity)),
            signal: Unit::pending(),
            capacity,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of admitted units that have not yet resolved. Never exceeds
    /// the configured capacity.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    /// Admits a unit, waiting for a free slot if the pool is at capacity.
    ///
    /// The wait is interrupted if a previously admitted unit fails while we
    /// are suspended; the failure is already on the completion signal at
    /// that point and the pool stops admitting. Admitting after the pool has
    /// failed is a no-op.
    pub async fn admit(&self, unit: Unit) {
        if self.signal.is_resolved() {
            tracing::debug!("pool already resolved, not admitting");
            return;
        }
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.expect("pool semaphore is never closed")
            }
            _ = self.signal.wait() => {
                tracing::debug!("pool failed while waiting for a slot, not admitting");
                return;
            }
        };
        let id = unit.id();
        self.members.lock().unwrap().insert(
            id,
            Member {
                unit: unit.clone(),
                _permit: permit,
            },
        );
        let members = Arc::clone(&self.members);
        let on_failure_members = Arc::clone(&self.members);
        let signal = self.signal.clone();
        unit.then(move || {
            members.lock().unwrap().remove(&id);
            Ok(())
        })
        .catch(move |fault| {
            on_failure_members.lock().unwrap().remove(&id);
            tracing::debug!("admitted unit failed, failing the pool: {}", fault);
            signal.resolve(Outcome::Failed(fault.clone()));
        });
    }

    /// Returns the pool's completion signal; consumes the pool so draining
    /// can only happen once.
    ///
    /// The signal resolves successfully once every currently tracked unit
    /// has resolved successfully; if the pool is empty it resolves
    /// immediately. A failure that already occurred, or occurs later, wins
    /// over success and later failures are dropped (first writer wins).
    pub fn drain(self) -> Unit {
        let snapshot: Vec<Unit> = self
            .members
            .lock()
            .unwrap()
            .values()
            .map(|member| member.unit.clone())
            .collect();
        tracing::debug!("draining pool with {} tracked units", snapshot.len());
        let members = Arc::clone(&self.members);
        let signal = self.signal.clone();
        let on_failure_signal = self.signal.clone();
        Unit::then_all(&snapshot, move || {
            signal.resolve(Outcome::Succeeded);
            members.lock().unwrap().clear();
            Ok(())
        })
        .catch(move |fault| {
            on_failure_signal.resolve(Outcome::Failed(fault.clone()));
        });
        self.signal
    }
}
