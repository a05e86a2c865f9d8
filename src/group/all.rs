use super::node::{GroupPolicy, Verdict};
use super::{linked_source, Group};
use crate::cancel::CancelationToken;
use crate::error::{AggregateError, Rejection};
use crate::node::Outcome;
use crate::promise::Promise;

/// Resolves with every value in input order; any rejection rejects the group
/// with all the rejections that were seen.
pub(crate) struct AllPolicy<T> {
    completed: Vec<(usize, T)>,
    rejections: Vec<Rejection>,
    canceled: bool,
    /// Settle on the first rejection or cancelation instead of after the
    /// last input.
    settle_on_failure: bool,
}

impl<T> AllPolicy<T> {
    pub(crate) fn new(settle_on_failure: bool) -> Self {
        Self {
            completed: Vec::new(),
            rejections: Vec::new(),
            canceled: false,
            settle_on_failure,
        }
    }

    fn failed(&self) -> Verdict {
        Verdict {
            cancel_group: true,
            settle_now: self.settle_on_failure,
            ..Verdict::default()
        }
    }
}

impl<T: Send + 'static> GroupPolicy<T> for AllPolicy<T> {
    type Output = Vec<T>;

    fn on_input(&mut self, index: usize, outcome: Outcome<T>) -> Verdict {
        match outcome {
            Outcome::Resolved(value) => {
                self.completed.push((index, value));
                Verdict::default()
            }
            Outcome::Rejected(rejection) => {
                self.rejections.push(rejection);
                self.failed()
            }
            Outcome::Canceled => {
                self.canceled = true;
                self.failed()
            }
        }
    }

    fn finish(&mut self) -> Outcome<Vec<T>> {
        if !self.rejections.is_empty() {
            let rejections = std::mem::take(&mut self.rejections);
            return Outcome::Rejected(Rejection::new(AggregateError::new(rejections)));
        }
        if self.canceled {
            return Outcome::Canceled;
        }

        let completed = std::mem::take(&mut self.completed);
        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(completed.len()).collect();
        for (index, value) in completed {
            slots[index] = Some(value);
        }
        Outcome::Resolved(slots.into_iter().flatten().collect())
    }
}

/// Waits for every added promise.
///
/// The group token handed out by [`AllGroup::new`] is canceled as soon as
/// one input rejects or is canceled, so work started with it can stop early.
/// The group itself settles once every input has.
pub struct AllGroup<T: Send + 'static> {
    group: Group<T, AllPolicy<T>>,
}

impl<T: Send + 'static> AllGroup<T> {
    /// Creates a group whose token is also canceled by `token`.
    pub fn new(token: &CancelationToken) -> (Self, CancelationToken) {
        let (source, group_token) = linked_source(token);
        let group = Group::new(AllPolicy::new(false), Some(source));
        (Self { group }, group_token)
    }

    /// Adds an input and returns its position in the result.
    pub fn add(&mut self, promise: Promise<T>) -> usize {
        self.group.add(promise)
    }

    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.len() == 0
    }

    pub fn wait_async(self) -> Promise<Vec<T>> {
        self.group.wait_async()
    }
}

/// Resolves with every value in input order, or fails as soon as one input
/// rejects or is canceled.
pub fn all<T, I>(promises: I) -> Promise<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let mut group = Group::new(AllPolicy::new(true), None);
    for promise in promises {
        group.add(promise);
    }
    group.wait_async()
}
