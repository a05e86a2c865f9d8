use super::node::{GroupPolicy, Verdict};
use super::{linked_source, Group, RejectionPolicy};
use crate::cancel::CancelationToken;
use crate::error::{AggregateError, Rejection};
use crate::node::Outcome;
use crate::promise::Promise;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaceOptions {
    /// What happens to rejections from inputs that lost to a winner. With
    /// [`RejectionPolicy::Surface`] they go to the unhandled-rejection
    /// handler; the group still resolves with the winner.
    pub loser_rejections: RejectionPolicy,
    /// Also cancel the other inputs when one rejects or is canceled, not
    /// only when one resolves.
    pub cancel_on_non_resolved: bool,
}

/// The first input to resolve wins.
pub(crate) struct RacePolicy<T> {
    winner: Option<T>,
    rejections: Vec<Rejection>,
    options: RaceOptions,
    settle_on_winner: bool,
    finished: bool,
}

impl<T> RacePolicy<T> {
    fn new(options: RaceOptions, settle_on_winner: bool) -> Self {
        Self {
            winner: None,
            rejections: Vec::new(),
            options,
            settle_on_winner,
            finished: false,
        }
    }
}

impl<T> RacePolicy<T> {
    fn surfaces(&self) -> bool {
        self.options.loser_rejections == RejectionPolicy::Surface
    }
}

impl<T: Send + 'static> GroupPolicy<T> for RacePolicy<T> {
    type Output = T;

    fn on_input(&mut self, _index: usize, outcome: Outcome<T>) -> Verdict {
        match outcome {
            Outcome::Resolved(value) => {
                if self.winner.is_some() || self.finished {
                    return Verdict::default();
                }
                self.winner = Some(value);
                // Earlier rejections now belong to losers.
                let losers = std::mem::take(&mut self.rejections);
                Verdict {
                    cancel_group: true,
                    settle_now: self.settle_on_winner,
                    unhandled: if self.surfaces() { losers } else { Vec::new() },
                }
            }
            Outcome::Rejected(rejection) => {
                let mut verdict = Verdict::cancel_group(self.options.cancel_on_non_resolved);
                if self.winner.is_none() && !self.finished {
                    self.rejections.push(rejection);
                } else if self.surfaces() {
                    verdict.unhandled.push(rejection);
                }
                verdict
            }
            Outcome::Canceled => Verdict::cancel_group(self.options.cancel_on_non_resolved),
        }
    }

    fn finish(&mut self) -> Outcome<T> {
        self.finished = true;
        match self.winner.take() {
            Some(value) => Outcome::Resolved(value),
            None if !self.rejections.is_empty() => {
                let rejections = std::mem::take(&mut self.rejections);
                Outcome::Rejected(Rejection::new(AggregateError::new(rejections)))
            }
            None => Outcome::Canceled,
        }
    }
}

/// Settles with the first input to resolve.
///
/// The group settles once every input has settled, so no input is left
/// running unobserved; the group token is canceled as soon as there is a
/// winner. With no winner the group rejects if any input rejected and is
/// canceled otherwise, including when no inputs were added.
pub struct RaceGroup<T: Send + 'static> {
    group: Group<T, RacePolicy<T>>,
}

impl<T: Send + 'static> RaceGroup<T> {
    pub fn new(token: &CancelationToken, options: RaceOptions) -> (Self, CancelationToken) {
        let (source, group_token) = linked_source(token);
        let group = Group::new(RacePolicy::new(options, false), Some(source));
        (Self { group }, group_token)
    }

    pub fn add(&mut self, promise: Promise<T>) -> usize {
        self.group.add(promise)
    }

    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.len() == 0
    }

    pub fn wait_async(self) -> Promise<T> {
        self.group.wait_async()
    }
}

/// Settles as soon as one input resolves. Rejections from the other inputs
/// are dropped.
pub fn race<T, I>(promises: I) -> Promise<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let mut group = Group::new(RacePolicy::new(RaceOptions::default(), true), None);
    for promise in promises {
        group.add(promise);
    }
    group.wait_async()
}
