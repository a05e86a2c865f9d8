//! The reference-counted unit behind every promise.
//!
//! A node is settled at most once and forwards its outcome to at most one
//! waiter. Fan-out to several observers only happens through a group
//! combinator, which registers one pass-through per input.
//!
//! Retains: a pending node starts with two (the settling side and the
//! consuming side), a pre-settled node with one. Settlement releases the
//! settling side's retain; consuming the outcome, either by a waiter or by
//! reading it directly, releases the other. The node goes back to its pool
//! when the count reaches zero.

use crate::cancel::CancelationRegistration;
use crate::config;
use crate::error::{PromiseError, Rejection};
use crate::pool::{Pool, PoolMarker, Poolable};
use crate::trampoline;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending = 0,
    Resolved = 1,
    Rejected = 2,
    Canceled = 3,
}

impl PromiseState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PromiseState::Pending,
            1 => PromiseState::Resolved,
            2 => PromiseState::Rejected,
            _ => PromiseState::Canceled,
        }
    }

    pub fn is_pending(self) -> bool {
        self == PromiseState::Pending
    }
}

/// How a promise was settled.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Resolved(T),
    Rejected(Rejection),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn state(&self) -> PromiseState {
        match self {
            Outcome::Resolved(_) => PromiseState::Resolved,
            Outcome::Rejected(_) => PromiseState::Rejected,
            Outcome::Canceled => PromiseState::Canceled,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Resolved(value) => Some(value),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(f(value)),
            Outcome::Rejected(rejection) => Outcome::Rejected(rejection),
            Outcome::Canceled => Outcome::Canceled,
        }
    }

    pub fn into_result(self) -> Result<T, PromiseError> {
        match self {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(rejection) => Err(PromiseError::Rejected(rejection)),
            Outcome::Canceled => Err(PromiseError::Canceled),
        }
    }
}

impl<T> From<Result<T, Rejection>> for Outcome<T> {
    fn from(result: Result<T, Rejection>) -> Self {
        match result {
            Ok(value) => Outcome::Resolved(value),
            Err(rejection) => Outcome::Rejected(rejection),
        }
    }
}

/// Something that wants to hear about a node's settlement.
pub(crate) trait Waiter<T>: Send + Sync + 'static {
    /// Called exactly once, with the outcome moved out of the node.
    fn handle(self: Arc<Self>, outcome: Outcome<T>);

    /// The consumer behind this waiter is gone.
    fn is_abandoned(&self) -> bool {
        false
    }
}

enum Next<T> {
    Empty,
    Waiter(Arc<dyn Waiter<T>>),
    /// The outcome has been handed to a waiter or read directly.
    Consumed,
}

struct Slot<T> {
    next: Next<T>,
    outcome: Option<Outcome<T>>,
    cancel_link: Option<CancelationRegistration>,
}

pub(crate) struct Node<T> {
    id: AtomicU16,
    state: AtomicU8,
    retains: AtomicU32,
    slot: Mutex<Slot<T>>,
    marker: PoolMarker,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            id: AtomicU16::new(0),
            state: AtomicU8::new(PromiseState::Pending as u8),
            retains: AtomicU32::new(0),
            slot: Mutex::new(Slot {
                next: Next::Empty,
                outcome: None,
                cancel_link: None,
            }),
            marker: PoolMarker::default(),
        }
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id.load(Ordering::Relaxed))
            .field("state", &PromiseState::from_u8(self.state.load(Ordering::Relaxed)))
            .field("retains", &self.retains.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Poolable for Node<T> {
    fn marker(&self) -> &PoolMarker {
        &self.marker
    }

    fn reset(&self) {
        let mut slot = self.slot.lock();
        let retains = self.retains.swap(0, Ordering::AcqRel);
        if retains != 0 {
            tracing::error!(retains, "node returned to the pool while still retained");
        }
        slot.next = Next::Empty;
        slot.outcome = None;
        slot.cancel_link = None;
        self.state
            .store(PromiseState::Pending as u8, Ordering::Release);
        // Invalidates every handle captured before this point.
        self.id.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: Send + 'static> Node<T> {
    pub(crate) fn create_pending() -> (Arc<Self>, u16) {
        let node = Pool::<Self>::take();
        node.retains.store(2, Ordering::Release);
        let id = node.id();
        tracing::trace!(id, "created pending node");
        (node, id)
    }

    pub(crate) fn create_settled(outcome: Outcome<T>) -> (Arc<Self>, u16) {
        let node = Pool::<Self>::take();
        node.state.store(outcome.state() as u8, Ordering::Release);
        node.slot.lock().outcome = Some(outcome);
        node.retains.store(1, Ordering::Release);
        let id = node.id();
        tracing::trace!(id, "created settled node");
        (node, id)
    }

    pub(crate) fn id(&self) -> u16 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> PromiseState {
        PromiseState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn check_id(&self, id: u16) -> Result<(), PromiseError> {
        let actual = self.id();
        if actual == id {
            Ok(())
        } else {
            Err(PromiseError::InvalidId {
                expected: id,
                actual,
            })
        }
    }

    /// Attaches the registration that cancels this node, so settling can
    /// unregister it. Hands the registration back if the node already
    /// settled or moved on.
    pub(crate) fn set_cancel_link(
        &self,
        id: u16,
        registration: CancelationRegistration,
    ) -> Result<(), CancelationRegistration> {
        let mut slot = self.slot.lock();
        if self.check_id(id).is_err() || !self.state().is_pending() {
            return Err(registration);
        }
        slot.cancel_link = Some(registration);
        Ok(())
    }

    /// Moves the node out of `Pending`. Succeeds exactly once per id.
    pub(crate) fn try_settle(self: &Arc<Self>, id: u16, outcome: Outcome<T>) -> Result<(), PromiseError> {
        self.settle_if(id, outcome, false).map_err(|(error, _)| error)
    }

    /// Like [`Node::try_settle`], but only while a consumer still holds the
    /// promise. Hands the outcome back otherwise.
    pub(crate) fn try_settle_observed(self: &Arc<Self>, id: u16, outcome: Outcome<T>) -> Result<(), Outcome<T>> {
        self.settle_if(id, outcome, true).map_err(|(_, outcome)| outcome)
    }

    fn settle_if(
        self: &Arc<Self>,
        id: u16,
        outcome: Outcome<T>,
        observed_only: bool,
    ) -> Result<(), (PromiseError, Outcome<T>)> {
        let state = outcome.state();
        let (handoff, link) = {
            let mut slot = self.slot.lock();
            if let Err(error) = self.check_id(id) {
                return Err((error, outcome));
            }
            self.marker.assert_live();
            if !self.state().is_pending() {
                return Err((PromiseError::AlreadySettled, outcome));
            }
            if observed_only && !self.has_consumer(&slot) {
                return Err((PromiseError::AlreadyConsumed, outcome));
            }
            self.state.store(state as u8, Ordering::Release);
            let link = slot.cancel_link.take();
            let handoff = match std::mem::replace(&mut slot.next, Next::Consumed) {
                Next::Waiter(waiter) => Some((waiter, outcome)),
                Next::Empty => {
                    slot.next = Next::Empty;
                    slot.outcome = Some(outcome);
                    None
                }
                Next::Consumed => None,
            };
            (handoff, link)
        };
        tracing::trace!(id, ?state, "settled node");

        if let Some(link) = link {
            link.try_unregister();
        }
        if let Some((waiter, outcome)) = handoff {
            trampoline::schedule(move || waiter.handle(outcome));
            // The waiter inherited the consuming side's retain.
            self.release();
        }
        self.release();
        Ok(())
    }

    /// Whether anything will read a settlement made now. A pending node
    /// without a waiter holds one retain for the deferred side and one for
    /// a live promise.
    fn has_consumer(&self, slot: &Slot<T>) -> bool {
        match &slot.next {
            Next::Waiter(waiter) => !waiter.is_abandoned(),
            Next::Empty => self.retains.load(Ordering::Acquire) > 1,
            Next::Consumed => false,
        }
    }

    /// Registers `waiter` as the single continuation of this node.
    ///
    /// If the node already settled, the outcome goes straight to the waiter
    /// and `next` is never published.
    pub(crate) fn hookup_new_waiter(
        self: &Arc<Self>,
        id: u16,
        waiter: Arc<dyn Waiter<T>>,
    ) -> Result<(), PromiseError> {
        let ready = {
            let mut slot = self.slot.lock();
            self.check_id(id)?;
            self.marker.assert_live();
            if !matches!(slot.next, Next::Empty) {
                return Err(PromiseError::AlreadyConsumed);
            }
            match slot.outcome.take() {
                Some(outcome) => {
                    slot.next = Next::Consumed;
                    Some((waiter, outcome))
                }
                None => {
                    slot.next = Next::Waiter(waiter);
                    None
                }
            }
        };

        if let Some((waiter, outcome)) = ready {
            trampoline::schedule(move || waiter.handle(outcome));
            self.release();
        }
        Ok(())
    }

    /// Reads the outcome of a settled node, consuming it. The caller still
    /// owns its retain and must release it.
    pub(crate) fn take_result(&self, id: u16) -> Result<Outcome<T>, PromiseError> {
        let mut slot = self.slot.lock();
        self.check_id(id)?;
        self.marker.assert_live();
        if !matches!(slot.next, Next::Empty) {
            return Err(PromiseError::AlreadyConsumed);
        }
        match slot.outcome.take() {
            Some(outcome) => {
                slot.next = Next::Consumed;
                Ok(outcome)
            }
            None => Err(PromiseError::NotSettled),
        }
    }

    pub(crate) fn release(self: &Arc<Self>) {
        self.marker.assert_live();
        let previous = self.retains.fetch_sub(1, Ordering::AcqRel);
        match previous {
            0 => {
                self.retains.fetch_add(1, Ordering::AcqRel);
                crate::fatal_misuse!("node {} released more times than it was retained", self.id());
            }
            1 => self.dispose(),
            _ => {}
        }
    }

    fn dispose(self: &Arc<Self>) {
        let unobserved = {
            let mut slot = self.slot.lock();
            match slot.outcome.take() {
                Some(Outcome::Rejected(rejection)) => Some(rejection),
                _ => None,
            }
        };

        if self.state().is_pending() {
            crate::fatal_misuse!("node {} lost its last retain while still pending", self.id());
            return;
        }
        if let Some(rejection) = unobserved {
            config::report_unhandled(rejection);
        }
        tracing::trace!(id = self.id(), "returning node to the pool");
        Pool::<Self>::repool(self.clone());
    }

    #[cfg(test)]
    pub(crate) fn retains(&self) -> u32 {
        self.retains.load(Ordering::Acquire)
    }
}
