use crate::cancel::CancelationToken;
use crate::config;
use crate::continuation::{self, Step};
use crate::error::{PromiseError, Rejection};
use crate::node::{Node, Outcome, PromiseState, Waiter};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// The settling half of a promise.
///
/// A `Deferred` can be cloned freely; only the first settlement wins. Once the
/// promise has settled and been consumed, the underlying node is recycled and
/// every remaining clone becomes stale: settling it returns
/// [`PromiseError::InvalidId`] instead of touching the new occupant.
///
/// # Examples
///
/// ```
/// use promise_graph::Deferred;
/// use futures::executor::block_on;
/// use std::thread;
///
/// let (deferred, promise) = Deferred::<String>::new();
/// let task = thread::spawn(move || block_on(promise));
/// deferred.resolve("hi".into()).unwrap();
/// assert_eq!(task.join().unwrap().unwrap(), "hi");
/// ```
pub struct Deferred<T> {
    node: Arc<Node<T>>,
    id: u16,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            id: self.id,
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Deferred<T> {
    pub fn new() -> (Self, Promise<T>) {
        let (node, id) = Node::create_pending();
        let deferred = Self {
            node: node.clone(),
            id,
        };
        (deferred, Promise::from_node(node, id))
    }

    /// Like [`Deferred::new`], but the promise is canceled as soon as `token`
    /// is, unless it settled first. An already-canceled token yields an
    /// already-canceled promise.
    pub fn with_token(token: &CancelationToken) -> (Self, Promise<T>) {
        let (deferred, promise) = Self::new();
        if token.can_be_canceled() {
            let target = deferred.clone();
            let registration = token.register(move || {
                target.try_cancel();
            });
            if let Err(registration) = deferred.node.set_cancel_link(deferred.id, registration) {
                registration.try_unregister();
            }
        }
        (deferred, promise)
    }

    /// `true` until the first settlement through any clone.
    pub fn is_pending(&self) -> bool {
        self.node.id() == self.id && self.node.state().is_pending()
    }

    pub fn settle(&self, outcome: Outcome<T>) -> Result<(), PromiseError> {
        self.node.try_settle(self.id, outcome)
    }

    /// Settles only while a consumer still holds the promise, handing the
    /// outcome back otherwise.
    pub(crate) fn settle_observed(&self, outcome: Outcome<T>) -> Result<(), Outcome<T>> {
        self.node.try_settle_observed(self.id, outcome)
    }

    pub fn resolve(&self, value: T) -> Result<(), PromiseError> {
        self.settle(Outcome::Resolved(value))
    }

    pub fn reject(&self, reason: Rejection) -> Result<(), PromiseError> {
        self.settle(Outcome::Rejected(reason))
    }

    pub fn cancel(&self) -> Result<(), PromiseError> {
        self.settle(Outcome::Canceled)
    }

    pub fn try_resolve(&self, value: T) -> bool {
        self.resolve(value).is_ok()
    }

    pub fn try_reject(&self, reason: Rejection) -> bool {
        self.reject(reason).is_ok()
    }

    pub fn try_cancel(&self) -> bool {
        self.cancel().is_ok()
    }
}

/// The consuming half of a promise.
///
/// A promise can be consumed once: awaited, chained with a continuation,
/// added to a group, or read with [`Promise::try_outcome`]. Dropping it
/// unconsumed is fine; a rejection nobody observed is then reported to the
/// unhandled-rejection handler.
pub struct Promise<T: Send + 'static> {
    inner: Inner<T>,
}

enum Inner<T> {
    Node { node: Arc<Node<T>>, id: u16 },
    Awaiting(Arc<AwaitSlot<T>>),
    Done(PromiseState),
}

impl<T: Send + 'static> Promise<T> {
    pub(crate) fn from_node(node: Arc<Node<T>>, id: u16) -> Self {
        Self {
            inner: Inner::Node { node, id },
        }
    }

    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        let (node, id) = Node::create_settled(outcome);
        Self::from_node(node, id)
    }

    pub fn resolved(value: T) -> Self {
        Self::from_outcome(Outcome::Resolved(value))
    }

    pub fn rejected(reason: Rejection) -> Self {
        Self::from_outcome(Outcome::Rejected(reason))
    }

    pub fn canceled() -> Self {
        Self::from_outcome(Outcome::Canceled)
    }

    pub fn state(&self) -> PromiseState {
        match &self.inner {
            Inner::Node { node, .. } => node.state(),
            Inner::Awaiting(slot) => slot.state(),
            Inner::Done(state) => *state,
        }
    }

    /// Takes the outcome if the promise has settled, consuming it.
    pub fn try_outcome(&mut self) -> Option<Outcome<T>> {
        let Inner::Node { node, id } = &self.inner else {
            return None;
        };
        if node.state().is_pending() {
            return None;
        }
        let outcome = node.take_result(*id).ok()?;
        node.release();
        self.inner = Inner::Done(outcome.state());
        Some(outcome)
    }

    /// Hands the promise's result to `waiter`, consuming the promise.
    pub(crate) fn hookup(mut self, waiter: Arc<dyn Waiter<T>>) -> Result<(), PromiseError> {
        let state = self.state();
        match std::mem::replace(&mut self.inner, Inner::Done(state)) {
            Inner::Node { node, id } => node.hookup_new_waiter(id, waiter).inspect_err(|error| {
                // A mismatched id means the retain was never ours to give back.
                if !matches!(error, PromiseError::InvalidId { .. }) {
                    node.release();
                }
            }),
            Inner::Awaiting(_) | Inner::Done(_) => Err(PromiseError::AlreadyConsumed),
        }
    }

    /// Runs `f` with the outcome once this promise settles.
    pub fn continue_with<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        continuation::hook(self, move |outcome| Step::Settle(f(outcome)))
    }

    /// Maps the resolved value. Rejections and cancelation pass through.
    pub fn then<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.continue_with(move |outcome| outcome.map(f))
    }

    /// Chains an asynchronous step; the returned promise adopts the state of
    /// the promise `f` returns.
    pub fn then_promise<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        continuation::hook(self, move |outcome| match outcome {
            Outcome::Resolved(value) => Step::Adopt(f(value)),
            Outcome::Rejected(rejection) => Step::Settle(Outcome::Rejected(rejection)),
            Outcome::Canceled => Step::Settle(Outcome::Canceled),
        })
    }

    /// Recovers from a rejection. Cancelation passes through.
    pub fn catch<F>(self, f: F) -> Promise<T>
    where
        F: FnOnce(Rejection) -> T + Send + 'static,
    {
        self.continue_with(move |outcome| match outcome {
            Outcome::Rejected(rejection) => Outcome::Resolved(f(rejection)),
            other => other,
        })
    }

    /// Drops the promise without observing it.
    pub fn forget(self) {}
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        match &self.inner {
            Inner::Node { node, .. } => node.release(),
            Inner::Awaiting(slot) => slot.abandon(),
            Inner::Done(_) => {}
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("state", &self.state()).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Future for Promise<T> {
    type Output = Result<T, PromiseError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.try_outcome() {
            return Poll::Ready(outcome.into_result());
        }

        if let Inner::Node { .. } = &this.inner {
            let slot = Arc::new(AwaitSlot::default());
            let pending = std::mem::replace(&mut this.inner, Inner::Awaiting(slot.clone()));
            if let Err(error) = (Promise { inner: pending }).hookup(slot) {
                this.inner = Inner::Done(PromiseState::Pending);
                return Poll::Ready(Err(error));
            }
        }

        match &this.inner {
            Inner::Awaiting(slot) => match slot.poll(cx) {
                Poll::Ready(outcome) => {
                    this.inner = Inner::Done(outcome.state());
                    Poll::Ready(outcome.into_result())
                }
                Poll::Pending => Poll::Pending,
            },
            _ => Poll::Ready(Err(PromiseError::AlreadyConsumed)),
        }
    }
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}

struct AwaitState<T> {
    outcome: Option<Outcome<T>>,
    state: PromiseState,
    waker: Result<Waker, WakerState>,
    /// The awaiting promise was dropped before reading the outcome.
    abandoned: bool,
}

/// Waiter that parks a task until the outcome arrives.
struct AwaitSlot<T> {
    inner: Mutex<AwaitState<T>>,
}

impl<T> Default for AwaitSlot<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(AwaitState {
                outcome: None,
                state: PromiseState::Pending,
                waker: Err(WakerState::Fresh),
                abandoned: false,
            }),
        }
    }
}

impl<T> AwaitSlot<T> {
    fn state(&self) -> PromiseState {
        self.inner.lock().state
    }

    fn poll(&self, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        let mut inner = self.inner.lock();
        match inner.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                inner.waker = Ok(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Nobody will poll this slot again. An outcome it still holds, or one
    /// that arrives later, counts as unobserved.
    fn abandon(&self) {
        let unread = {
            let mut inner = self.inner.lock();
            inner.abandoned = true;
            inner.waker = Err(WakerState::Tainted);
            inner.outcome.take()
        };
        if let Some(Outcome::Rejected(rejection)) = unread {
            config::report_unhandled(rejection);
        }
    }
}

impl<T: Send + 'static> Waiter<T> for AwaitSlot<T> {
    fn is_abandoned(&self) -> bool {
        self.inner.lock().abandoned
    }

    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let mut inner = self.inner.lock();
        inner.state = outcome.state();
        if inner.abandoned {
            drop(inner);
            if let Outcome::Rejected(rejection) = outcome {
                config::report_unhandled(rejection);
            }
            return;
        }
        inner.outcome = Some(outcome);
        let waker = std::mem::replace(&mut inner.waker, Err(WakerState::Tainted));
        drop(inner);
        if let Ok(waker) = waker {
            waker.wake();
        }
    }
}
