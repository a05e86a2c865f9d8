use super::all::AllPolicy;
use super::node::{GroupPolicy, Verdict};
use super::{linked_source, Group};
use crate::cancel::CancelationToken;
use crate::error::Rejection;
use crate::node::Outcome;
use crate::promise::Promise;

/// Collects every outcome in input order. Never rejects.
pub(crate) struct SettledPolicy<T> {
    completed: Vec<(usize, Outcome<T>)>,
    cancel_on_non_resolved: bool,
}

impl<T: Send + 'static> GroupPolicy<T> for SettledPolicy<T> {
    type Output = Vec<Outcome<T>>;

    fn on_input(&mut self, index: usize, outcome: Outcome<T>) -> Verdict {
        let disqualifying = !outcome.is_resolved();
        self.completed.push((index, outcome));
        Verdict::cancel_group(disqualifying && self.cancel_on_non_resolved)
    }

    fn finish(&mut self) -> Outcome<Vec<Outcome<T>>> {
        let mut completed = std::mem::take(&mut self.completed);
        completed.sort_unstable_by_key(|(index, _)| *index);
        Outcome::Resolved(completed.into_iter().map(|(_, outcome)| outcome).collect())
    }
}

/// Waits for every added promise and reports each outcome.
pub struct MergeGroup<T: Send + 'static> {
    group: Group<T, SettledPolicy<T>>,
}

impl<T: Send + 'static> MergeGroup<T> {
    /// With `cancel_on_non_resolved`, the group token is canceled as soon as
    /// one input rejects or is canceled.
    pub fn new(token: &CancelationToken, cancel_on_non_resolved: bool) -> (Self, CancelationToken) {
        let (source, group_token) = linked_source(token);
        let policy = SettledPolicy {
            completed: Vec::new(),
            cancel_on_non_resolved,
        };
        let group = Group::new(policy, Some(source));
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

    pub fn wait_async(self) -> Promise<Vec<Outcome<T>>> {
        self.group.wait_async()
    }
}

/// Resolves with the outcome of every input, in input order.
pub fn all_settled<T, I>(promises: I) -> Promise<Vec<Outcome<T>>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let policy = SettledPolicy {
        completed: Vec::new(),
        cancel_on_non_resolved: false,
    };
    let mut group = Group::new(policy, None);
    for promise in promises {
        group.add(promise);
    }
    group.wait_async()
}

enum Merged<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

fn merged<A, B, C>(promises: Vec<Promise<Merged<A, B, C>>>) -> Promise<Vec<Merged<A, B, C>>>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    let mut group = Group::new(AllPolicy::new(true), None);
    for promise in promises {
        group.add(promise);
    }
    group.wait_async()
}

/// Splits merged values back into one slot per input.
fn unmerge<A, B, C>(values: Vec<Merged<A, B, C>>) -> (Option<A>, Option<B>, Option<C>) {
    let mut slots = (None, None, None);
    for value in values {
        match value {
            Merged::First(a) => slots.0 = Some(a),
            Merged::Second(b) => slots.1 = Some(b),
            Merged::Third(c) => slots.2 = Some(c),
        }
    }
    slots
}

fn missing<T>() -> Outcome<T> {
    Outcome::Rejected(Rejection::msg("merged group lost an input"))
}

/// Resolves with both values. Fails the way [`all`](super::all) does.
pub fn merge2<A, B>(a: Promise<A>, b: Promise<B>) -> Promise<(A, B)>
where
    A: Send + 'static,
    B: Send + 'static,
{
    let inputs = vec![a.then(Merged::<A, B, ()>::First), b.then(Merged::Second)];
    merged(inputs).continue_with(|outcome| match outcome {
        Outcome::Resolved(values) => match unmerge(values) {
            (Some(a), Some(b), _) => Outcome::Resolved((a, b)),
            _ => missing(),
        },
        Outcome::Rejected(rejection) => Outcome::Rejected(rejection),
        Outcome::Canceled => Outcome::Canceled,
    })
}

/// Resolves with all three values. Fails the way [`all`](super::all) does.
pub fn merge3<A, B, C>(a: Promise<A>, b: Promise<B>, c: Promise<C>) -> Promise<(A, B, C)>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    let inputs = vec![
        a.then(Merged::<A, B, C>::First),
        b.then(Merged::Second),
        c.then(Merged::Third),
    ];
    merged(inputs).continue_with(|outcome| match outcome {
        Outcome::Resolved(values) => match unmerge(values) {
            (Some(a), Some(b), Some(c)) => Outcome::Resolved((a, b, c)),
            _ => missing(),
        },
        Outcome::Rejected(rejection) => Outcome::Rejected(rejection),
        Outcome::Canceled => Outcome::Canceled,
    })
}
