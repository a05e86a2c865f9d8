use super::passthrough::PassThrough;
use super::{cancel_siblings, GroupTarget};
use crate::cancel::CancelationSource;
use crate::config;
use crate::error::Rejection;
use crate::node::Outcome;
use crate::pool::{Pool, PoolMarker, Poolable};
use crate::promise::{Deferred, Promise};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

/// Decides how a group reacts to each input and what it settles with.
pub(crate) trait GroupPolicy<T>: Send + 'static {
    type Output: Send + 'static;

    fn on_input(&mut self, index: usize, outcome: Outcome<T>) -> Verdict;

    /// Produces the group's result. Called once.
    fn finish(&mut self) -> Outcome<Self::Output>;
}

#[derive(Debug, Default)]
pub(crate) struct Verdict {
    /// Cancel every input that has not settled yet.
    pub(crate) cancel_group: bool,
    /// Settle the group now instead of after the last input.
    pub(crate) settle_now: bool,
    /// Rejections the group will not use but must not drop silently.
    pub(crate) unhandled: Vec<Rejection>,
}

impl Verdict {
    pub(crate) fn cancel_group(cancel_group: bool) -> Self {
        Self {
            cancel_group,
            ..Self::default()
        }
    }
}

struct Inner<T, P: GroupPolicy<T>> {
    policy: Option<P>,
    deferred: Option<Deferred<P::Output>>,
    source: Option<CancelationSource>,
    _input: PhantomData<fn(T)>,
}

/// Shared state of one All/Race/Merge group.
///
/// `remaining` starts at zero. Every settled input decrements it and
/// `mark_ready` adds the number of inputs once all of them are linked, so
/// the counter only reaches zero after both have happened, whatever the
/// interleaving.
pub(crate) struct GroupNode<T, P: GroupPolicy<T>> {
    remaining: AtomicIsize,
    inner: Mutex<Inner<T, P>>,
    marker: PoolMarker,
}

impl<T, P: GroupPolicy<T>> Default for GroupNode<T, P> {
    fn default() -> Self {
        Self {
            remaining: AtomicIsize::new(0),
            inner: Mutex::new(Inner {
                policy: None,
                deferred: None,
                source: None,
                _input: PhantomData,
            }),
            marker: PoolMarker::default(),
        }
    }
}

impl<T: Send + 'static, P: GroupPolicy<T>> Poolable for GroupNode<T, P> {
    fn marker(&self) -> &PoolMarker {
        &self.marker
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.policy = None;
        inner.deferred = None;
        inner.source = None;
        self.remaining.store(0, Ordering::Release);
    }
}

impl<T: Send + 'static, P: GroupPolicy<T>> GroupNode<T, P> {
    pub(crate) fn new(policy: P, source: Option<CancelationSource>) -> (Arc<Self>, Promise<P::Output>) {
        let node = Pool::<Self>::take();
        let (deferred, promise) = Deferred::new();
        {
            let mut inner = node.inner.lock();
            inner.policy = Some(policy);
            inner.deferred = Some(deferred);
            inner.source = source;
        }
        (node, promise)
    }

    pub(crate) fn add(self: &Arc<Self>, promise: Promise<T>, index: usize) {
        PassThrough::link(promise, self.clone(), index);
    }

    pub(crate) fn mark_ready(self: &Arc<Self>, count: usize) {
        let count = count as isize;
        let previous = self.remaining.fetch_add(count, Ordering::AcqRel);
        tracing::trace!(count, "group ready");
        if previous + count == 0 {
            self.complete();
        }
    }

    fn settle(&self) {
        let settled = {
            let mut inner = self.inner.lock();
            match (inner.deferred.take(), inner.policy.as_mut()) {
                (Some(deferred), Some(policy)) => Some((deferred, policy.finish())),
                _ => None,
            }
        };
        if let Some((deferred, outcome)) = settled {
            tracing::debug!(state = ?outcome.state(), "group settled");
            if let Err(error) = deferred.settle(outcome) {
                tracing::warn!(%error, "group result dropped");
            }
        }
    }

    fn complete(self: &Arc<Self>) {
        self.settle();
        let source = self.inner.lock().source.take();
        if let Some(source) = source {
            source.try_dispose();
        }
        Pool::<Self>::repool(self.clone());
    }
}

impl<T: Send + 'static, P: GroupPolicy<T>> GroupTarget<T> for GroupNode<T, P> {
    fn handle_input(self: Arc<Self>, index: usize, outcome: Outcome<T>) {
        self.marker.assert_live();
        let (verdict, source) = {
            let mut inner = self.inner.lock();
            let verdict = match inner.policy.as_mut() {
                Some(policy) => policy.on_input(index, outcome),
                None => Verdict::default(),
            };
            let source = if verdict.cancel_group {
                inner.source.clone()
            } else {
                None
            };
            (verdict, source)
        };

        for rejection in verdict.unhandled {
            config::report_unhandled(rejection);
        }
        if let Some(source) = source {
            cancel_siblings(&source);
        }
        if verdict.settle_now {
            self.settle();
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete();
        }
    }
}
