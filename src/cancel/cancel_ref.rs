//! Shared state behind a cancelation source and its tokens.
//!
//! `source_id` identifies the owning source and is bumped on dispose, which
//! invalidates every copy of that source. `token_id` identifies one pooled
//! lifetime of the ref and is bumped on reset, which invalidates every token
//! and registration created during it.

use super::list::{Callback, CallbackList};
use super::registration::CancelationRegistration;
use crate::config;
use crate::error::{AggregateError, CancelationError, Rejection};
use crate::pool::{Pool, PoolMarker, Poolable};
use crate::timer::Timer;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const CANCELED = 0b0000_0001;
        const DISPOSED = 0b0000_0010;
        /// Every callback registered before cancelation has returned.
        const NOTIFY_COMPLETE = 0b0000_0100;
        /// Held while the timer slot is read or written.
        const CHANGING_TIMER = 0b0000_1000;
        /// Claimed by the one release that returns the ref to its pool.
        const REPOOLING = 0b0001_0000;
    }
}

pub(crate) enum Registered {
    Added { key: usize, callback_id: u64 },
    /// The ref is already canceled; the caller must run the callback.
    AlreadyCanceled(Callback),
    /// Stale token or disposed source: the callback will never run.
    Unavailable,
}

struct Executing {
    callback_id: u64,
    thread: ThreadId,
}

#[derive(Default)]
struct Inner {
    callbacks: CallbackList,
    executing: Option<Executing>,
    /// Registrations this ref holds on the tokens it is linked to.
    links: Vec<CancelationRegistration>,
}

pub(crate) struct CancelationRef {
    flags: AtomicU8,
    source_id: AtomicU32,
    token_id: AtomicU32,
    user_retains: AtomicU32,
    internal_retains: AtomicU32,
    next_timer_id: AtomicU64,
    inner: Mutex<Inner>,
    timer: UnsafeCell<Option<(u64, Box<dyn Timer>)>>,
    marker: PoolMarker,
}

// SAFETY: `timer` is only accessed through `TimerGuard`, which holds the
// CHANGING_TIMER bit for its whole lifetime.
unsafe impl Sync for CancelationRef {}

impl Default for CancelationRef {
    fn default() -> Self {
        Self {
            flags: AtomicU8::new(0),
            source_id: AtomicU32::new(0),
            token_id: AtomicU32::new(0),
            user_retains: AtomicU32::new(0),
            internal_retains: AtomicU32::new(0),
            next_timer_id: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
            timer: UnsafeCell::new(None),
            marker: PoolMarker::default(),
        }
    }
}

impl Poolable for CancelationRef {
    fn marker(&self) -> &PoolMarker {
        &self.marker
    }

    fn reset(&self) {
        let leftovers = {
            let mut inner = self.inner.lock();
            inner.executing = None;
            (inner.callbacks.drain(), std::mem::take(&mut inner.links))
        };
        let timer = self.lock_timer().slot().take();
        self.token_id.fetch_add(1, Ordering::AcqRel);
        self.user_retains.store(0, Ordering::Release);
        self.internal_retains.store(0, Ordering::Release);
        self.flags.store(0, Ordering::Release);
        drop(leftovers);
        drop(timer);
    }
}

struct TimerGuard<'a> {
    owner: &'a CancelationRef,
}

impl TimerGuard<'_> {
    fn slot(&mut self) -> &mut Option<(u64, Box<dyn Timer>)> {
        // SAFETY: the guard owns the CHANGING_TIMER bit, so no other
        // reference to the slot exists.
        unsafe { &mut *self.owner.timer.get() }
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .flags
            .fetch_and(!Flags::CHANGING_TIMER.bits(), Ordering::Release);
    }
}

impl CancelationRef {
    /// Takes a ref from the pool for a new source. The source holds one
    /// internal retain until it is disposed.
    pub(crate) fn new_source() -> (Arc<Self>, u32) {
        let cancel_ref = Pool::<Self>::take();
        cancel_ref.internal_retains.store(1, Ordering::Release);
        let source_id = cancel_ref.source_id.load(Ordering::Acquire);
        (cancel_ref, source_id)
    }

    fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set(&self, flags: Flags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn lock_timer(&self) -> TimerGuard<'_> {
        loop {
            let current = self.flags.load(Ordering::Relaxed);
            if current & Flags::CHANGING_TIMER.bits() != 0 {
                std::hint::spin_loop();
                continue;
            }
            if self
                .flags
                .compare_exchange_weak(
                    current,
                    current | Flags::CHANGING_TIMER.bits(),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return TimerGuard { owner: self };
            }
        }
    }

    pub(crate) fn is_source_valid(&self, source_id: u32) -> bool {
        self.source_id.load(Ordering::Acquire) == source_id
    }

    fn is_current(&self, token_id: u32) -> bool {
        self.token_id.load(Ordering::Acquire) == token_id
    }

    /// The token id for `source_id`, or `None` once that source is disposed.
    pub(crate) fn token_for(&self, source_id: u32) -> Option<u32> {
        let _inner = self.inner.lock();
        self.is_source_valid(source_id)
            .then(|| self.token_id.load(Ordering::Acquire))
    }

    pub(crate) fn is_canceled(&self, token_id: u32) -> bool {
        let _inner = self.inner.lock();
        self.is_current(token_id) && self.flags().contains(Flags::CANCELED)
    }

    pub(crate) fn can_be_canceled(&self, token_id: u32) -> bool {
        let _inner = self.inner.lock();
        let flags = self.flags();
        self.is_current(token_id)
            && (flags.contains(Flags::CANCELED) || !flags.contains(Flags::DISPOSED))
    }

    pub(crate) fn is_source_canceled(&self, source_id: u32) -> bool {
        let _inner = self.inner.lock();
        self.is_source_valid(source_id) && self.flags().contains(Flags::CANCELED)
    }

    pub(crate) fn register(&self, token_id: u32, callback: Callback) -> Registered {
        let mut inner = self.inner.lock();
        if !self.is_current(token_id) {
            return Registered::Unavailable;
        }
        self.marker.assert_live();
        let flags = self.flags();
        if flags.contains(Flags::CANCELED) {
            return Registered::AlreadyCanceled(callback);
        }
        if flags.contains(Flags::DISPOSED) {
            return Registered::Unavailable;
        }
        let (key, callback_id) = inner.callbacks.push_back(callback);
        Registered::Added { key, callback_id }
    }

    pub(crate) fn is_registered(&self, token_id: u32, key: usize, callback_id: u64) -> bool {
        let inner = self.inner.lock();
        self.is_current(token_id) && inner.callbacks.contains(key, callback_id)
    }

    pub(crate) fn try_unregister(&self, token_id: u32, key: usize, callback_id: u64) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            if !self.is_current(token_id) {
                return false;
            }
            inner.callbacks.remove(key, callback_id)
        };
        removed.is_some()
    }

    /// Unregisters the callback, or waits for it to return if another thread
    /// is running it right now.
    pub(crate) fn unregister_and_wait(&self, token_id: u32, key: usize, callback_id: u64) -> bool {
        let current = std::thread::current().id();
        loop {
            let mut inner = self.inner.lock();
            if !self.is_current(token_id) {
                return false;
            }
            if let Some(callback) = inner.callbacks.remove(key, callback_id) {
                drop(inner);
                drop(callback);
                return true;
            }
            match &inner.executing {
                Some(executing) if executing.callback_id == callback_id && executing.thread != current => {
                    drop(inner);
                    std::thread::yield_now();
                }
                _ => return false,
            }
        }
    }

    /// Remembers a registration on a parent token, dropping it right away if
    /// this ref has already moved past the point where it would matter.
    pub(crate) fn add_link(&self, registration: CancelationRegistration) {
        let rejected = {
            let mut inner = self.inner.lock();
            if self.flags().intersects(Flags::CANCELED | Flags::DISPOSED) {
                Some(registration)
            } else {
                inner.links.push(registration);
                None
            }
        };
        if let Some(registration) = rejected {
            registration.try_unregister();
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn cancel(self: &Arc<Self>, source_id: u32) -> Result<(), CancelationError> {
        let links = {
            let mut inner = self.inner.lock();
            if !self.is_source_valid(source_id) {
                return Err(CancelationError::Disposed);
            }
            self.marker.assert_live();
            if self.flags().contains(Flags::CANCELED) {
                return Ok(());
            }
            self.set(Flags::CANCELED);
            self.internal_retains.fetch_add(1, Ordering::AcqRel);
            std::mem::take(&mut inner.links)
        };

        for link in links {
            link.try_unregister();
        }
        let failures = self.invoke_callbacks();
        self.stop_timer();
        self.release_internal();

        if failures.is_empty() {
            Ok(())
        } else {
            tracing::debug!(failures = failures.len(), "cancelation callbacks failed");
            Err(CancelationError::CallbacksFailed(AggregateError::new(failures)))
        }
    }

    /// Runs registered callbacks newest first, without holding the lock
    /// while a callback runs.
    fn invoke_callbacks(&self) -> Vec<Rejection> {
        let thread = std::thread::current().id();
        let mut failures = Vec::new();
        let mut inner = self.inner.lock();
        while let Some((callback_id, callback)) = inner.callbacks.pop_back() {
            inner.executing = Some(Executing { callback_id, thread });
            drop(inner);
            if let Err(errors) = invoke(callback) {
                failures.extend(errors);
            }
            inner = self.inner.lock();
        }
        inner.executing = None;
        self.set(Flags::NOTIFY_COMPLETE);
        failures
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn dispose(self: &Arc<Self>, source_id: u32) -> Result<(), CancelationError> {
        let (dropped, links) = {
            let mut inner = self.inner.lock();
            if !self.is_source_valid(source_id) {
                return Err(CancelationError::Disposed);
            }
            self.marker.assert_live();
            self.source_id.fetch_add(1, Ordering::AcqRel);
            self.set(Flags::DISPOSED);
            // An in-progress cancel owns the remaining callbacks.
            let dropped = if self.flags().contains(Flags::CANCELED) {
                Vec::new()
            } else {
                inner.callbacks.drain()
            };
            (dropped, std::mem::take(&mut inner.links))
        };

        drop(dropped);
        for link in links {
            link.try_unregister();
        }
        self.stop_timer();
        self.release_internal();
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn cancel_after(self: &Arc<Self>, source_id: u32, delay: Duration) -> Result<(), CancelationError> {
        if delay.is_zero() {
            return self.cancel(source_id);
        }

        {
            let _inner = self.inner.lock();
            if !self.is_source_valid(source_id) {
                return Err(CancelationError::Disposed);
            }
            if self.flags().contains(Flags::CANCELED) {
                return Ok(());
            }
            // Handed to a new timer, or given back if the current one moves.
            self.internal_retains.fetch_add(1, Ordering::AcqRel);
        }

        // Timers are user code; the slot is never locked while one runs.
        let current = self.lock_timer().slot().take();
        if let Some((timer_id, timer)) = current {
            if timer.change(delay) {
                self.install_timer(timer_id, timer);
                self.release_internal();
                return Ok(());
            }
            // Already firing; it releases its own retain.
        }

        let timer_id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let owner = self.clone();
        let timer = config::timer_factory().create_timer(
            delay,
            Box::new(move || owner.on_timer(source_id, timer_id)),
        );
        self.install_timer(timer_id, timer);
        Ok(())
    }

    /// Puts `timer` in the slot, or stops it if the source was canceled or
    /// disposed while the slot was unlocked.
    fn install_timer(self: &Arc<Self>, timer_id: u64, timer: Box<dyn Timer>) {
        let displaced = {
            let mut guard = self.lock_timer();
            if self.flags().intersects(Flags::CANCELED | Flags::DISPOSED) {
                Some(timer)
            } else {
                guard.slot().replace((timer_id, timer)).map(|(_, stale)| stale)
            }
        };
        if let Some(timer) = displaced {
            if timer.cancel() {
                self.release_internal();
            }
        }
    }

    fn on_timer(self: Arc<Self>, source_id: u32, timer_id: u64) {
        match self.cancel(source_id) {
            Ok(()) | Err(CancelationError::Disposed) => {}
            Err(CancelationError::CallbacksFailed(errors)) => {
                for rejection in errors.into_errors() {
                    config::report_unhandled(rejection);
                }
            }
        }
        let finished = {
            let mut guard = self.lock_timer();
            let slot = guard.slot();
            if slot.as_ref().is_some_and(|(id, _)| *id == timer_id) {
                slot.take()
            } else {
                None
            }
        };
        drop(finished);
        self.release_internal();
    }

    fn stop_timer(self: &Arc<Self>) {
        let timer = self.lock_timer().slot().take();
        if let Some((_, timer)) = timer {
            // A timer that already fired releases its retain itself.
            if timer.cancel() {
                self.release_internal();
            }
        }
    }

    pub(crate) fn try_retain_user(&self, token_id: u32) -> bool {
        let _inner = self.inner.lock();
        if !self.is_current(token_id) {
            return false;
        }
        self.user_retains.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn release_user(self: &Arc<Self>) {
        Self::release(self, &self.user_retains);
    }

    fn release_internal(self: &Arc<Self>) {
        Self::release(self, &self.internal_retains);
    }

    fn release(this: &Arc<Self>, counter: &AtomicU32) {
        let previous = counter.fetch_sub(1, Ordering::AcqRel);
        match previous {
            0 => {
                counter.fetch_add(1, Ordering::AcqRel);
                crate::fatal_misuse!("cancelation ref released more times than it was retained");
            }
            1 => this.maybe_repool(),
            _ => {}
        }
    }

    fn maybe_repool(self: &Arc<Self>) {
        {
            let _inner = self.inner.lock();
            let flags = self.flags();
            if self.user_retains.load(Ordering::Acquire) != 0
                || self.internal_retains.load(Ordering::Acquire) != 0
                || !flags.contains(Flags::DISPOSED)
                || flags.contains(Flags::REPOOLING)
            {
                return;
            }
            self.set(Flags::REPOOLING);
        }
        tracing::trace!("returning cancelation ref to the pool");
        Pool::<Self>::repool(self.clone());
    }
}

/// Runs one callback, collecting panics as rejections.
fn invoke(callback: Callback) -> Result<(), Vec<Rejection>> {
    match callback {
        Callback::User(f) => catch_unwind(AssertUnwindSafe(f)).map_err(|payload| vec![Rejection::from_panic(payload)]),
        Callback::Link { child, source_id } => {
            let Some(child) = child.upgrade() else {
                return Ok(());
            };
            match child.cancel(source_id) {
                Err(CancelationError::CallbacksFailed(errors)) => Err(errors.into_errors()),
                Ok(()) | Err(CancelationError::Disposed) => Ok(()),
            }
        }
    }
}

/// Runs a callback registered on a token that is already canceled. User
/// callbacks run on the caller's stack, so their panics propagate.
pub(crate) fn invoke_now(callback: Callback) {
    match callback {
        Callback::User(f) => f(),
        link @ Callback::Link { .. } => {
            if let Err(errors) = invoke(link) {
                for rejection in errors {
                    config::report_unhandled(rejection);
                }
            }
        }
    }
}
