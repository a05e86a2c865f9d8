use super::GroupTarget;
use crate::error::Rejection;
use crate::node::{Outcome, Waiter};
use crate::pool::{Pool, PoolMarker, Poolable};
use crate::promise::Promise;
use parking_lot::Mutex;
use std::sync::Arc;

/// Waiter on one group input that forwards its outcome, tagged with the
/// input's index.
pub(crate) struct PassThrough<T> {
    target: Mutex<Option<(Arc<dyn GroupTarget<T>>, usize)>>,
    marker: PoolMarker,
}

impl<T> Default for PassThrough<T> {
    fn default() -> Self {
        Self {
            target: Mutex::new(None),
            marker: PoolMarker::default(),
        }
    }
}

impl<T: Send + 'static> Poolable for PassThrough<T> {
    fn marker(&self) -> &PoolMarker {
        &self.marker
    }

    fn reset(&self) {
        self.target.lock().take();
    }
}

impl<T: Send + 'static> PassThrough<T> {
    /// Routes `promise`'s outcome to `target` as input `index`. An input
    /// that cannot be waited on counts as rejected.
    pub(crate) fn link(promise: Promise<T>, target: Arc<dyn GroupTarget<T>>, index: usize) {
        let pass = Pool::<Self>::take();
        *pass.target.lock() = Some((target.clone(), index));
        if let Err(error) = promise.hookup(pass.clone()) {
            tracing::warn!(%error, index, "group input could not be linked");
            pass.target.lock().take();
            Pool::<Self>::repool(pass);
            target.handle_input(index, Outcome::Rejected(Rejection::new(error)));
        }
    }
}

impl<T: Send + 'static> Waiter<T> for PassThrough<T> {
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        self.marker.assert_live();
        let linked = self.target.lock().take();
        Pool::<Self>::repool(self);
        if let Some((target, index)) = linked {
            target.handle_input(index, outcome);
        }
    }
}
