use super::passthrough::PassThrough;
use super::{cancel_siblings, linked_source, GroupTarget, RejectionPolicy};
use crate::cancel::{CancelationSource, CancelationToken};
use crate::config;
use crate::node::Outcome;
use crate::pool::{Pool, PoolMarker, Poolable};
use crate::promise::{Deferred, Promise};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// One settled input of an [`Each`].
#[derive(Debug)]
pub struct EachResult<T> {
    pub index: usize,
    pub outcome: Outcome<T>,
}

type NextDeferred<T> = Deferred<Option<EachResult<T>>>;

struct Inner<T> {
    ready: VecDeque<EachResult<T>>,
    waiting: Option<NextDeferred<T>>,
    /// Every input has settled.
    exhausted: bool,
    disposed: bool,
    disposal: Option<Deferred<()>>,
    rejections: RejectionPolicy,
    source: Option<CancelationSource>,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            waiting: None,
            exhausted: false,
            disposed: false,
            disposal: None,
            rejections: RejectionPolicy::Suppress,
            source: None,
        }
    }
}

pub(crate) struct EachNode<T> {
    remaining: AtomicIsize,
    inner: Mutex<Inner<T>>,
    marker: PoolMarker,
}

impl<T> Default for EachNode<T> {
    fn default() -> Self {
        Self {
            remaining: AtomicIsize::new(0),
            inner: Mutex::new(Inner::default()),
            marker: PoolMarker::default(),
        }
    }
}

impl<T: Send + 'static> Poolable for EachNode<T> {
    fn marker(&self) -> &PoolMarker {
        &self.marker
    }

    fn reset(&self) {
        let leftovers = std::mem::take(&mut *self.inner.lock());
        self.remaining.store(0, Ordering::Release);
        drop(leftovers);
    }
}

impl<T: Send + 'static> EachNode<T> {
    fn new(rejections: RejectionPolicy, source: Option<CancelationSource>) -> Arc<Self> {
        let node = Pool::<Self>::take();
        {
            let mut inner = node.inner.lock();
            inner.rejections = rejections;
            inner.source = source;
        }
        node
    }

    fn mark_ready(self: &Arc<Self>, count: usize) {
        let count = count as isize;
        let previous = self.remaining.fetch_add(count, Ordering::AcqRel);
        if previous + count == 0 {
            self.on_exhausted();
        }
    }

    fn next(&self) -> Promise<Option<EachResult<T>>> {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.ready.pop_front() {
            return Promise::resolved(Some(item));
        }
        if inner.exhausted || inner.disposed {
            return Promise::resolved(None);
        }
        let (deferred, promise) = Deferred::new();
        let replaced = inner.waiting.replace(deferred);
        drop(inner);
        // Only the most recent request is served.
        if let Some(replaced) = replaced {
            replaced.try_cancel();
        }
        promise
    }

    fn on_exhausted(self: &Arc<Self>) {
        let (waiting, disposal) = {
            let mut inner = self.inner.lock();
            inner.exhausted = true;
            let disposal = inner.disposed.then(|| inner.disposal.take());
            (inner.waiting.take(), disposal)
        };
        if let Some(waiting) = waiting {
            waiting.try_resolve(None);
        }
        if let Some(disposal) = disposal {
            self.release(disposal);
        }
    }

    /// Stops delivering results. The returned promise resolves once every
    /// input has settled and the group has been released.
    fn dispose(self: &Arc<Self>) -> Promise<()> {
        let (deferred, promise) = Deferred::new();
        let (drained, waiting, source, finished, rejections) = {
            let mut inner = self.inner.lock();
            inner.disposed = true;
            let finished = inner.exhausted;
            if !finished {
                inner.disposal = Some(deferred.clone());
            }
            (
                std::mem::take(&mut inner.ready),
                inner.waiting.take(),
                inner.source.clone(),
                finished,
                inner.rejections,
            )
        };
        tracing::debug!(finished, undelivered = drained.len(), "disposing each group");

        if let Some(waiting) = waiting {
            waiting.try_resolve(None);
        }
        if rejections == RejectionPolicy::Surface {
            for item in drained {
                if let Outcome::Rejected(rejection) = item.outcome {
                    config::report_unhandled(rejection);
                }
            }
        }
        if finished {
            self.release(Some(deferred));
        } else if let Some(source) = source {
            cancel_siblings(&source);
        }
        promise
    }

    fn release(self: &Arc<Self>, disposal: Option<Deferred<()>>) {
        let source = self.inner.lock().source.take();
        if let Some(source) = source {
            source.try_dispose();
        }
        Pool::<Self>::repool(self.clone());
        if let Some(disposal) = disposal {
            disposal.try_resolve(());
        }
    }
}

impl<T: Send + 'static> GroupTarget<T> for EachNode<T> {
    fn handle_input(self: Arc<Self>, index: usize, outcome: Outcome<T>) {
        self.marker.assert_live();
        let mut item = EachResult { index, outcome };
        let unhandled = loop {
            let waiting = {
                let mut inner = self.inner.lock();
                if inner.disposed {
                    break match item.outcome {
                        Outcome::Rejected(rejection) if inner.rejections == RejectionPolicy::Surface => Some(rejection),
                        _ => None,
                    };
                }
                match inner.waiting.take() {
                    Some(waiting) => waiting,
                    None => {
                        inner.ready.push_back(item);
                        break None;
                    }
                }
            };
            // A request whose promise was dropped hands the item back.
            match waiting.settle_observed(Outcome::Resolved(Some(item))) {
                Ok(()) => break None,
                Err(Outcome::Resolved(Some(returned))) => {
                    waiting.try_cancel();
                    item = returned;
                }
                Err(_) => break None,
            }
        };

        if let Some(rejection) = unhandled {
            config::report_unhandled(rejection);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.on_exhausted();
        }
    }
}

/// Builds an [`Each`].
pub struct EachGroup<T: Send + 'static> {
    node: Option<Arc<EachNode<T>>>,
    count: usize,
}

impl<T: Send + 'static> EachGroup<T> {
    /// `rejections` decides what happens to rejected inputs that settle after
    /// the consumer disposed the group.
    pub fn new(token: &CancelationToken, rejections: RejectionPolicy) -> (Self, CancelationToken) {
        let (source, group_token) = linked_source(token);
        let group = Self {
            node: Some(EachNode::new(rejections, Some(source))),
            count: 0,
        };
        (group, group_token)
    }

    pub fn add(&mut self, promise: Promise<T>) -> usize {
        let index = self.count;
        self.count += 1;
        if let Some(node) = &self.node {
            PassThrough::link(promise, node.clone(), index);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn into_each(mut self) -> Each<T> {
        let node = self.node.take();
        if let Some(node) = &node {
            node.mark_ready(self.count);
        }
        Each { node, pending: None }
    }
}

impl<T: Send + 'static> Drop for EachGroup<T> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            node.mark_ready(self.count);
            node.dispose().forget();
        }
    }
}

/// Yields inputs in the order they settle.
///
/// Use [`Each::move_next`] directly, or the [`Stream`] implementation.
/// Dropping an `Each` disposes it.
pub struct Each<T: Send + 'static> {
    node: Option<Arc<EachNode<T>>>,
    pending: Option<Promise<Option<EachResult<T>>>>,
}

impl<T: Send + 'static> Each<T> {
    /// The next settled input, or `None` once every input has been yielded
    /// or the group was disposed.
    pub fn move_next(&mut self) -> Promise<Option<EachResult<T>>> {
        match &self.node {
            Some(node) => node.next(),
            None => Promise::resolved(None),
        }
    }

    /// Stops iterating. Resolves once every input has settled.
    pub fn dispose(mut self) -> Promise<()> {
        self.dispose_inner()
    }

    fn dispose_inner(&mut self) -> Promise<()> {
        self.pending = None;
        match self.node.take() {
            Some(node) => node.dispose(),
            None => Promise::resolved(()),
        }
    }
}

impl<T: Send + 'static> Drop for Each<T> {
    fn drop(&mut self) {
        if self.node.is_some() {
            self.dispose_inner().forget();
        }
    }
}

impl<T: Send + 'static> Stream for Each<T> {
    type Item = EachResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut pending = match this.pending.take() {
            Some(pending) => pending,
            None => this.move_next(),
        };
        match Pin::new(&mut pending).poll(cx) {
            Poll::Pending => {
                this.pending = Some(pending);
                Poll::Pending
            }
            Poll::Ready(Ok(item)) => Poll::Ready(item),
            Poll::Ready(Err(_)) => Poll::Ready(None),
        }
    }
}

/// Yields `promises` in the order they settle.
pub fn each<T, I>(promises: I) -> Each<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let node = EachNode::new(RejectionPolicy::Suppress, None);
    let mut count = 0;
    for promise in promises {
        PassThrough::link(promise, node.clone(), count);
        count += 1;
    }
    node.mark_ready(count);
    Each {
        node: Some(node),
        pending: None,
    }
}
