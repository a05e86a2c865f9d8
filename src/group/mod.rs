//! Combinators over many promises.
//!
//! Every combinator is one pooled group node fed by one pass-through per
//! input. A pass-through carries the input's position, so results land by
//! index no matter which input settles first.

mod all;
mod each;
mod merge;
mod node;
mod passthrough;
mod race;

pub use all::{all, AllGroup};
pub use each::{each, Each, EachGroup, EachResult};
pub use merge::{all_settled, merge2, merge3, MergeGroup};
pub use race::{race, RaceGroup, RaceOptions};

use crate::cancel::{CancelationSource, CancelationToken};
use crate::config;
use crate::error::CancelationError;
use crate::node::Outcome;
use crate::promise::Promise;
use node::{GroupNode, GroupPolicy};
use std::sync::Arc;

/// What a group does with rejections it does not use for its own result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RejectionPolicy {
    /// Drop them.
    #[default]
    Suppress,
    /// Report them to the unhandled-rejection handler.
    Surface,
}

/// Receives the settled inputs of a group.
pub(crate) trait GroupTarget<T>: Send + Sync + 'static {
    fn handle_input(self: Arc<Self>, index: usize, outcome: Outcome<T>);
}

/// A group under construction. Dropping it without waiting still lets the
/// group run to completion.
pub(crate) struct Group<T: Send + 'static, P: GroupPolicy<T>> {
    node: Option<Arc<GroupNode<T, P>>>,
    promise: Option<Promise<P::Output>>,
    count: usize,
}

impl<T: Send + 'static, P: GroupPolicy<T>> Group<T, P> {
    pub(crate) fn new(policy: P, source: Option<CancelationSource>) -> Self {
        let (node, promise) = GroupNode::new(policy, source);
        Self {
            node: Some(node),
            promise: Some(promise),
            count: 0,
        }
    }

    pub(crate) fn add(&mut self, promise: Promise<T>) -> usize {
        let index = self.count;
        self.count += 1;
        if let Some(node) = &self.node {
            node.add(promise, index);
        }
        index
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn wait_async(mut self) -> Promise<P::Output> {
        if let Some(node) = self.node.take() {
            node.mark_ready(self.count);
        }
        self.promise.take().unwrap_or_else(Promise::canceled)
    }
}

impl<T: Send + 'static, P: GroupPolicy<T>> Drop for Group<T, P> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            node.mark_ready(self.count);
        }
    }
}

/// A source linked to `token`, canceled by the group when an input
/// disqualifies the rest.
pub(crate) fn linked_source(token: &CancelationToken) -> (CancelationSource, CancelationToken) {
    let source = CancelationSource::new_linked(std::slice::from_ref(token));
    let group_token = source.token();
    (source, group_token)
}

/// Cancels the group's remaining work. Panicking callbacks must not unwind
/// into whichever input happened to trigger the cancelation.
pub(crate) fn cancel_siblings(source: &CancelationSource) {
    match source.cancel() {
        Ok(()) | Err(CancelationError::Disposed) => {}
        Err(CancelationError::CallbacksFailed(errors)) => {
            for rejection in errors.into_errors() {
                config::report_unhandled(rejection);
            }
        }
    }
}
