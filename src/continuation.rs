//! Pooled waiters that drive `then`-style chains.

use crate::error::{PromiseError, Rejection};
use crate::node::{Outcome, Waiter};
use crate::pool::{Pool, PoolMarker, Poolable};
use crate::promise::{Deferred, Promise};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// What a continuation produced: a final outcome, or another promise whose
/// outcome the chained promise adopts.
pub(crate) enum Step<U: Send + 'static> {
    Settle(Outcome<U>),
    Adopt(Promise<U>),
}

pub(crate) struct Continuation<T, U, F> {
    pending: Mutex<Option<(F, Deferred<U>)>>,
    marker: PoolMarker,
    _input: PhantomData<fn(T)>,
}

impl<T, U, F> Default for Continuation<T, U, F> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(None),
            marker: PoolMarker::default(),
            _input: PhantomData,
        }
    }
}

impl<T, U, F> Poolable for Continuation<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Step<U> + Send + 'static,
{
    fn marker(&self) -> &PoolMarker {
        &self.marker
    }

    fn reset(&self) {
        self.pending.lock().take();
    }
}

impl<T, U, F> Waiter<T> for Continuation<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Step<U> + Send + 'static,
{
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        self.marker.assert_live();
        let pending = self.pending.lock().take();
        Pool::<Self>::repool(self);
        let Some((f, deferred)) = pending else {
            return;
        };

        let step = match catch_unwind(AssertUnwindSafe(move || f(outcome))) {
            Ok(step) => step,
            Err(payload) => Step::Settle(Outcome::Rejected(Rejection::from_panic(payload))),
        };
        match step {
            Step::Settle(outcome) => {
                if let Err(error) = deferred.settle(outcome) {
                    tracing::warn!(%error, "continuation result dropped");
                }
            }
            Step::Adopt(promise) => forward(promise, deferred),
        }
    }
}

/// Chains `f` onto `promise` and returns the promise for its result.
pub(crate) fn hook<T, U, F>(promise: Promise<T>, f: F) -> Promise<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Step<U> + Send + 'static,
{
    let (deferred, chained) = Deferred::new();
    let continuation = Pool::<Continuation<T, U, F>>::take();
    *continuation.pending.lock() = Some((f, deferred.clone()));
    if let Err(error) = promise.hookup(continuation) {
        reject_with(&deferred, error);
    }
    chained
}

/// Waiter that copies an outcome into another deferred.
pub(crate) struct Forward<T> {
    target: Mutex<Option<Deferred<T>>>,
    marker: PoolMarker,
}

impl<T> Default for Forward<T> {
    fn default() -> Self {
        Self {
            target: Mutex::new(None),
            marker: PoolMarker::default(),
        }
    }
}

impl<T: Send + 'static> Poolable for Forward<T> {
    fn marker(&self) -> &PoolMarker {
        &self.marker
    }

    fn reset(&self) {
        self.target.lock().take();
    }
}

impl<T: Send + 'static> Waiter<T> for Forward<T> {
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        self.marker.assert_live();
        let target = self.target.lock().take();
        Pool::<Self>::repool(self);
        if let Some(target) = target {
            if let Err(error) = target.settle(outcome) {
                tracing::warn!(%error, "adopted outcome dropped");
            }
        }
    }
}

/// Settles `deferred` with whatever `promise` settles with.
pub(crate) fn forward<T: Send + 'static>(promise: Promise<T>, deferred: Deferred<T>) {
    let forward = Pool::<Forward<T>>::take();
    *forward.target.lock() = Some(deferred.clone());
    if let Err(error) = promise.hookup(forward) {
        reject_with(&deferred, error);
    }
}

fn reject_with<T: Send + 'static>(deferred: &Deferred<T>, error: PromiseError) {
    tracing::warn!(%error, "could not wait on promise");
    let _ = deferred.reject(Rejection::new(error));
}
