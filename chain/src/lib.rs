//! Continuation chaining and bounded task pooling for asynchronous work
//!
//! This crate provides the concurrency-control machinery used by the `acopy`
//! file-copy operations. It is split into two pieces:
//!
//! 1. **[`Unit`]** - a handle to one in-flight or resolved asynchronous
//!    operation, with combinators ([`Unit::then`], [`Unit::then_all`],
//!    [`Unit::catch`]) that chain follow-up work without ever blocking the
//!    calling thread.
//! 2. **[`TaskPool`]** - admits units up to a fixed capacity, applies
//!    backpressure to the submitter when full, and exposes a single
//!    completion signal that resolves once every admitted unit has finished
//!    or fails as soon as the first unit fails.
//!
//! # Resolution semantics
//!
//! A unit resolves exactly once, to one of [`Outcome::Succeeded`],
//! [`Outcome::Failed`] or [`Outcome::Canceled`]. Continuations attached to a
//! unit that already resolved successfully run synchronously on the calling
//! thread; continuations attached to a pending unit run on whichever thread
//! resolves it. A failed unit short-circuits its chain: the continuation
//! never runs and the failure propagates unchanged. A continuation that
//! returns an error or panics fails the unit it produced with its own error,
//! never the original one.
//!
//! # Usage
//!
//! ```rust,no_run
//! use chain::{TaskPool, Unit};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = TaskPool::new(4)?;
//! for idx in 0..16 {
//!     let unit = Unit::spawn(async move {
//!         tracing::debug!("working on item {}", idx);
//!         Ok(())
//!     });
//!     // suspends here whenever 4 units are already in flight
//!     pool.admit(unit).await;
//! }
//! let outcome = pool.drain().wait().await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```
//!
//! # Runtime requirements
//!
//! [`Unit::spawn`] schedules work on the ambient tokio runtime and must be
//! called from within one. The combinators themselves have no runtime
//! dependency.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;

mod pool;

pub use pool::{InvalidCapacity, TaskPool};

/// Cloneable failure shared by every observer of a failed [`Unit`].
///
/// Display shows the full context chain of the underlying error.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{inner:#}")]
pub struct Fault {
    inner: Arc<anyhow::Error>,
}

impl Fault {
    #[must_use]
    pub fn new(error: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// A failure forwarded across unit boundaries (for example from a pool's
    /// completion signal into another unit) may be wrapped in further fault
    /// layers; those are looked through, so the downcast reaches the
    /// originating error regardless of how many units it traveled through.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        if let Some(error) = self.inner.downcast_ref::<E>() {
            return Some(error);
        }
        self.inner
            .downcast_ref::<Fault>()
            .and_then(Fault::downcast_ref)
    }
}

/// Terminal state of a resolved [`Unit`].
#[derive(Clone, Debug)]
pub enum Outcome {
    Succeeded,
    Failed(Fault),
    Canceled,
}

impl Outcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    /// The failure carried by this outcome, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&Fault> {
        match self {
            Outcome::Failed(fault) => Some(fault),
            _ => None,
        }
    }

    /// Converts the outcome into a `Result`, surfacing the shared fault as
    /// an `anyhow` error and mapping cancellation to a descriptive error.
    pub fn into_result(self) -> anyhow::Result<()> {
        match self {
            Outcome::Succeeded => Ok(()),
            Outcome::Failed(fault) => Err(anyhow::Error::new(fault)),
            Outcome::Canceled => Err(anyhow::anyhow!("operation was canceled")),
        }
    }
}

type Callback = Box<dyn FnOnce(&Outcome) + Send>;

enum State {
    Pending(Vec<Callback>),
    Resolved(Outcome),
}

/// Handle to one in-flight or resolved asynchronous operation.
///
/// Clones share the same underlying operation; resolution is observed by all
/// of them. The handle resolves at most once - later resolution attempts are
/// silently dropped (first writer wins).
#[derive(Clone)]
pub struct Unit {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.state.lock().unwrap() {
            State::Pending(callbacks) => f
                .debug_struct("Unit")
                .field("state", &"pending")
                .field("callbacks", &callbacks.len())
                .finish(),
            State::Resolved(outcome) => f
                .debug_struct("Unit")
                .field("state", outcome)
                .finish(),
        }
    }
}

impl Unit {
    fn pending() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    fn resolved(outcome: Outcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Resolved(outcome))),
        }
    }

    /// A unit that already resolved successfully.
    #[must_use]
    pub fn succeeded() -> Self {
        Self::resolved(Outcome::Succeeded)
    }

    /// A unit that already resolved with the given failure.
    ///
    /// Used to normalize validation failures into the same chaining
    /// interface as real asynchronous work.
    #[must_use]
    pub fn failed(error: anyhow::Error) -> Self {
        Self::resolved(Outcome::Failed(Fault::new(error)))
    }

    /// Spawns the future on the ambient tokio runtime and returns the unit
    /// tracking its completion.
    ///
    /// An `Err` return fails the unit; a panic inside the future is caught
    /// and becomes the unit's failure.
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let unit = Unit::pending();
        let resolver = unit.clone();
        tokio::spawn(async move {
            let outcome = match std::panic::AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => Outcome::Succeeded,
                Ok(Err(error)) => Outcome::Failed(Fault::new(error)),
                Err(payload) => Outcome::Failed(Fault::new(anyhow::anyhow!(
                    "task panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            resolver.resolve(outcome);
        });
        unit
    }

    /// The resolution, if the unit has resolved.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.state.lock().unwrap() {
            State::Pending(_) => None,
            State::Resolved(outcome) => Some(outcome.clone()),
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), State::Resolved(_))
    }

    /// Identity of the underlying operation, stable across clones.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.state) as usize
    }

    /// Resolves the unit, running any attached callbacks in attachment order
    /// on the current thread. First writer wins; later calls are dropped.
    pub(crate) fn resolve(&self, outcome: Outcome) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                State::Resolved(_) => return,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Resolved(outcome.clone());
                    callbacks
                }
            }
        };
        for callback in callbacks {
            callback(&outcome);
        }
    }

    /// Runs the callback when the unit resolves: synchronously if it already
    /// has, otherwise on the resolving thread. The lock is not held while
    /// the callback runs.
    fn on_resolved<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(Box::new(callback)),
            State::Resolved(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                callback(&outcome);
            }
        }
    }

    /// Chains a continuation to run after this unit resolves successfully.
    ///
    /// If the unit already resolved successfully the continuation runs
    /// synchronously and its own result resolves the produced unit. If the
    /// unit failed the continuation never runs and the failure propagates
    /// unchanged. Cancellation propagates likewise. A continuation that
    /// returns `Err` or panics fails the produced unit with that error,
    /// never the original one.
    pub fn then<F>(&self, continuation: F) -> Unit
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let next = Unit::pending();
        let chained = ChainGuard::new(next.clone());
        self.on_resolved(move |outcome| {
            let next_outcome = match outcome {
                Outcome::Succeeded => run_continuation(continuation),
                Outcome::Failed(fault) => Outcome::Failed(fault.clone()),
                Outcome::Canceled => Outcome::Canceled,
            };
            chained.resolve(next_outcome);
        });
        next
    }

    /// Runs the handler only if this unit fails; the produced unit resolves
    /// successfully afterwards - the error is treated as handled and is not
    /// re-surfaced. A panicking handler fails the produced unit.
    pub fn catch<F>(&self, handler: F) -> Unit
    where
        F: FnOnce(&Fault) + Send + 'static,
    {
        let next = Unit::pending();
        let chained = ChainGuard::new(next.clone());
        self.on_resolved(move |outcome| {
            let next_outcome = match outcome {
                Outcome::Succeeded => Outcome::Succeeded,
                Outcome::Failed(fault) => {
                    tracing::debug!("handling failure: {}", fault);
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler(fault);
                    })) {
                        Ok(()) => Outcome::Succeeded,
                        Err(payload) => Outcome::Failed(Fault::new(anyhow::anyhow!(
                            "failure handler panicked: {}",
                            panic_message(payload.as_ref())
                        ))),
                    }
                }
                Outcome::Canceled => Outcome::Canceled,
            };
            chained.resolve(next_outcome);
        });
        next
    }

    /// Runs the continuation once every unit in the slice has resolved
    /// successfully.
    ///
    /// The first failure in resolution-completion order fails the produced
    /// unit and the continuation never runs; cancellation of any member
    /// (with no failure observed) cancels it. An empty slice runs the
    /// continuation immediately.
    pub fn then_all<F>(units: &[Unit], continuation: F) -> Unit
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let next = Unit::pending();
        if units.is_empty() {
            next.resolve(run_continuation(continuation));
            return next;
        }
        struct Gate<F> {
            remaining: AtomicUsize,
            first_fault: Mutex<Option<Fault>>,
            canceled: AtomicBool,
            continuation: Mutex<Option<F>>,
            chained: Unit,
        }
        // a member dropped while pending drops its callback and, with it, the
        // last gate reference; the produced unit must then observe Canceled
        impl<F> Drop for Gate<F> {
            fn drop(&mut self) {
                self.chained.resolve(Outcome::Canceled);
            }
        }
        let gate = Arc::new(Gate {
            remaining: AtomicUsize::new(units.len()),
            first_fault: Mutex::new(None),
            canceled: AtomicBool::new(false),
            continuation: Mutex::new(Some(continuation)),
            chained: next.clone(),
        });
        for unit in units {
            let gate = Arc::clone(&gate);
            unit.on_resolved(move |outcome| {
                match outcome {
                    Outcome::Succeeded => {}
                    Outcome::Failed(fault) => {
                        let mut slot = gate.first_fault.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(fault.clone());
                        }
                    }
                    Outcome::Canceled => gate.canceled.store(true, Ordering::Release),
                }
                if gate.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let first_fault = gate.first_fault.lock().unwrap().take();
                    let next_outcome = if let Some(fault) = first_fault {
                        Outcome::Failed(fault)
                    } else if gate.canceled.load(Ordering::Acquire) {
                        Outcome::Canceled
                    } else {
                        let continuation = gate
                            .continuation
                            .lock()
                            .unwrap()
                            .take()
                            .expect("then_all continuation runs at most once");
                        run_continuation(continuation)
                    };
                    gate.chained.resolve(next_outcome);
                }
            });
        }
        next
    }

    /// Waits for the unit to resolve without blocking the thread.
    ///
    /// A unit dropped while still pending is observed as
    /// [`Outcome::Canceled`].
    pub async fn wait(&self) -> Outcome {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.on_resolved(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        rx.await.unwrap_or(Outcome::Canceled)
    }
}

/// Resolves the guarded unit with the callback's outcome, or with
/// [`Outcome::Canceled`] if the callback is dropped without ever running -
/// which happens when the unit it was attached to is dropped while pending.
struct ChainGuard {
    unit: Option<Unit>,
}

impl ChainGuard {
    fn new(unit: Unit) -> Self {
        Self { unit: Some(unit) }
    }

    fn resolve(mut self, outcome: Outcome) {
        if let Some(unit) = self.unit.take() {
            unit.resolve(outcome);
        }
    }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            unit.resolve(Outcome::Canceled);
        }
    }
}

fn run_continuation<F>(continuation: F) -> Outcome
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(continuation)) {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(error)) => Outcome::Failed(Fault::new(error)),
        Err(payload) => Outcome::Failed(Fault::new(anyhow::anyhow!(
            "continuation panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
