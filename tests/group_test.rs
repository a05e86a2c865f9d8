mod common;

use futures::executor::block_on;
use futures::{FutureExt, StreamExt};
use promise_graph::{
    all, all_settled, each, merge2, merge3, race, AggregateError, AllGroup, CancelationSource, CancelationToken,
    Deferred, EachGroup, MergeGroup, Outcome, Promise, PromiseState, RaceGroup, RaceOptions, Rejection,
    RejectionPolicy,
};
use std::thread;
use std::time::Duration;

fn pending<T: Send + 'static>(count: usize) -> (Vec<Deferred<T>>, Vec<Promise<T>>) {
    (0..count).map(|_| Deferred::new()).unzip()
}

#[test]
fn all_output_is_index_stable() {
    common::init_tracing();
    for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
        let (deferreds, promises) = pending::<usize>(3);
        let result = all(promises);
        for index in order {
            deferreds[index].resolve(index * 10).unwrap();
        }
        assert_eq!(block_on(result).unwrap(), vec![0, 10, 20]);
    }
}

#[test]
fn all_settles_across_threads() {
    let (deferreds, promises) = pending::<usize>(8);
    let result = all(promises);
    let workers: Vec<_> = deferreds
        .into_iter()
        .enumerate()
        .map(|(index, deferred)| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis((8 - index as u64) * 3));
                deferred.resolve(index).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(block_on(result).unwrap(), (0..8).collect::<Vec<_>>());
}

#[test]
fn all_rejects_with_exactly_the_rejections_seen() {
    let (deferreds, promises) = pending::<u32>(3);
    let result = all(promises);
    let e = Rejection::msg("E");
    deferreds[0].resolve(1).unwrap();
    deferreds[1].reject(e.clone()).unwrap();
    deferreds[2].resolve(3).unwrap();

    let rejection = block_on(result).unwrap_err().rejection().cloned().unwrap();
    let aggregate = rejection.downcast_ref::<AggregateError>().unwrap();
    assert_eq!(aggregate.len(), 1);
    assert!(aggregate.errors()[0].ptr_eq(&e));
}

#[test]
fn all_fails_without_waiting_for_the_rest() {
    let (bad, first) = Deferred::<u32>::new();
    let (_never, second) = Deferred::new();
    let mut result = all([first, second]);
    bad.reject(Rejection::msg("E")).unwrap();
    let outcome = result.try_outcome().unwrap();
    let aggregate = outcome.rejection().unwrap().downcast_ref::<AggregateError>().unwrap();
    assert_eq!(aggregate.errors()[0].to_string(), "E");

    let (gone, first) = Deferred::<u8>::new();
    let (_never, second) = Deferred::<char>::new();
    let mut merged = merge2(first, second);
    gone.cancel().unwrap();
    assert_eq!(merged.try_outcome().unwrap().state(), PromiseState::Canceled);
}

#[test]
fn all_of_nothing_resolves_empty() {
    assert_eq!(block_on(all(Vec::<Promise<u8>>::new())).unwrap(), Vec::<u8>::new());
}

#[test]
fn all_group_cancels_siblings_on_failure() {
    let (mut group, token) = AllGroup::<u32>::new(&CancelationToken::none());
    // Keeps the group's cancelation state readable after the group finishes.
    let token = token.try_retain().unwrap();
    let (failing, first) = Deferred::new();
    let (_sibling, second) = Deferred::with_token(&token);
    group.add(first);
    group.add(second);
    assert_eq!(group.len(), 2);
    let result = group.wait_async();

    failing.cancel().unwrap();
    assert!(token.is_cancelation_requested());
    assert!(block_on(result).unwrap_err().is_canceled());
}

#[test]
fn all_group_follows_the_outer_token() {
    let outer = CancelationSource::new();
    let (mut group, token) = AllGroup::<u32>::new(&outer.token());
    let (_deferred, promise) = Deferred::with_token(&token);
    group.add(promise);
    let result = group.wait_async();

    outer.cancel().unwrap();
    assert!(block_on(result).unwrap_err().is_canceled());
    outer.dispose().unwrap();
}

#[test]
fn race_resolves_with_the_first_winner() {
    let (deferreds, promises) = pending::<u32>(2);
    let result = race(promises);
    deferreds[1].resolve(42).unwrap();
    deferreds[0].reject(Rejection::msg("late")).unwrap();
    assert_eq!(block_on(result).unwrap(), 42);
}

#[test]
fn race_settles_before_the_losers() {
    let (deferreds, promises) = pending::<u32>(2);
    let mut result = race(promises);
    deferreds[0].resolve(1).unwrap();
    assert!(matches!(result.try_outcome(), Some(Outcome::Resolved(1))));
    deferreds[1].resolve(2).unwrap();
}

#[test]
fn race_group_waits_for_every_input() {
    let (mut group, token) = RaceGroup::<u32>::new(&CancelationToken::none(), RaceOptions::default());
    let token = token.try_retain().unwrap();
    let (winner, first) = Deferred::new();
    let (_loser, second) = Deferred::with_token(&token);
    group.add(first);
    group.add(second);
    let mut result = group.wait_async();

    winner.resolve(5).unwrap();
    // The winner canceled the loser through the group token, which let the
    // group finish.
    assert!(token.is_cancelation_requested());
    assert!(matches!(result.try_outcome(), Some(Outcome::Resolved(5))));
}

#[test]
fn race_with_a_single_winner_among_rejections() {
    for policy in [RejectionPolicy::Suppress, RejectionPolicy::Surface] {
        let options = RaceOptions {
            loser_rejections: policy,
            ..RaceOptions::default()
        };
        let (mut group, _token) = RaceGroup::<u32>::new(&CancelationToken::none(), options);
        let (deferreds, promises) = pending::<u32>(4);
        for promise in promises {
            group.add(promise);
        }
        let result = group.wait_async();
        deferreds[0].reject(Rejection::msg("a")).unwrap();
        deferreds[1].resolve(7).unwrap();
        deferreds[2].reject(Rejection::msg("b")).unwrap();
        deferreds[3].resolve(8).unwrap();
        assert_eq!(block_on(result).unwrap(), 7);
    }
}

#[test]
fn race_without_a_winner() {
    let (deferreds, promises) = pending::<u32>(2);
    let result = race(promises);
    deferreds[0].reject(Rejection::msg("x")).unwrap();
    deferreds[1].reject(Rejection::msg("y")).unwrap();
    let rejection = block_on(result).unwrap_err().rejection().cloned().unwrap();
    assert_eq!(rejection.downcast_ref::<AggregateError>().unwrap().len(), 2);

    let (deferreds, promises) = pending::<u32>(2);
    let result = race(promises);
    deferreds[0].cancel().unwrap();
    deferreds[1].cancel().unwrap();
    assert!(block_on(result).unwrap_err().is_canceled());

    assert!(block_on(race(Vec::<Promise<u8>>::new())).unwrap_err().is_canceled());
}

#[test]
fn race_can_cancel_on_non_resolved_inputs() {
    let options = RaceOptions {
        cancel_on_non_resolved: true,
        ..RaceOptions::default()
    };
    let (mut group, token) = RaceGroup::<u32>::new(&CancelationToken::none(), options);
    let token = token.try_retain().unwrap();
    let (failing, first) = Deferred::new();
    let (_other, second) = Deferred::with_token(&token);
    group.add(first);
    group.add(second);
    let result = group.wait_async();

    failing.reject(Rejection::msg("boom")).unwrap();
    assert!(token.is_cancelation_requested());
    assert_eq!(block_on(result).unwrap_err().rejection().unwrap().to_string(), "1 error(s) occurred: [boom]");
}

#[test]
fn all_settled_reports_every_outcome() {
    let (deferreds, promises) = pending::<u32>(3);
    let result = all_settled(promises);
    deferreds[2].cancel().unwrap();
    deferreds[0].resolve(1).unwrap();
    deferreds[1].reject(Rejection::msg("no")).unwrap();

    let outcomes = block_on(result).unwrap();
    let states: Vec<_> = outcomes.iter().map(Outcome::state).collect();
    assert_eq!(states, [PromiseState::Resolved, PromiseState::Rejected, PromiseState::Canceled]);
    assert_eq!(outcomes[0].value(), Some(&1));
}

#[test]
fn merge_group_optionally_cancels_the_rest() {
    let (mut group, token) = MergeGroup::<u32>::new(&CancelationToken::none(), true);
    let (failing, first) = Deferred::new();
    let (_other, second) = Deferred::with_token(&token);
    group.add(first);
    group.add(second);
    assert!(!group.is_empty());
    let result = group.wait_async();

    failing.reject(Rejection::msg("boom")).unwrap();
    let outcomes = block_on(result).unwrap();
    assert_eq!(outcomes[0].state(), PromiseState::Rejected);
    assert_eq!(outcomes[1].state(), PromiseState::Canceled);
}

#[test]
fn merge_combines_different_types() {
    let (number, first) = Deferred::<u32>::new();
    let merged = merge2(first, Promise::resolved("two"));
    number.resolve(1).unwrap();
    assert_eq!(block_on(merged).unwrap(), (1, "two"));

    let merged = merge3(Promise::resolved(1u8), Promise::resolved('b'), Promise::resolved(3.0f64));
    assert_eq!(block_on(merged).unwrap(), (1, 'b', 3.0));

    let failed = merge2(Promise::resolved(1u8), Promise::<char>::rejected(Rejection::msg("bad")));
    assert!(block_on(failed).unwrap_err().rejection().is_some());
}

#[test]
fn each_yields_in_settlement_order() {
    let (deferreds, promises) = pending::<&'static str>(3);
    let mut results = each(promises);
    deferreds[2].resolve("c").unwrap();
    deferreds[0].resolve("a").unwrap();

    let first = block_on(results.move_next()).unwrap().unwrap();
    assert_eq!((first.index, first.outcome.value().copied()), (2, Some("c")));
    let second = block_on(results.move_next()).unwrap().unwrap();
    assert_eq!(second.index, 0);

    // Nothing ready: the next item is delivered straight to the waiting request.
    let third = results.move_next();
    deferreds[1].reject(Rejection::msg("b")).unwrap();
    let third = block_on(third).unwrap().unwrap();
    assert_eq!(third.index, 1);
    assert_eq!(third.outcome.state(), PromiseState::Rejected);

    assert!(block_on(results.move_next()).unwrap().is_none());
}

#[test]
fn each_keeps_items_when_a_request_is_dropped() {
    let (deferreds, promises) = pending::<u32>(2);
    let mut results = each(promises);

    drop(results.move_next());
    deferreds[0].reject(Rejection::msg("kept")).unwrap();
    let first = block_on(results.move_next()).unwrap().unwrap();
    assert_eq!(first.index, 0);
    assert_eq!(first.outcome.rejection().unwrap().to_string(), "kept");

    // Polled once, then dropped.
    assert!(results.move_next().now_or_never().is_none());
    deferreds[1].resolve(2).unwrap();
    let second = block_on(results.move_next()).unwrap().unwrap();
    assert_eq!((second.index, second.outcome.value().copied()), (1, Some(2)));
    assert!(block_on(results.move_next()).unwrap().is_none());
}

#[test]
fn each_is_a_stream() {
    let (deferreds, promises) = pending::<usize>(4);
    let stream = each(promises);
    let producer = thread::spawn(move || {
        for (index, deferred) in deferreds.into_iter().enumerate().rev() {
            thread::sleep(Duration::from_millis(5));
            deferred.resolve(index).unwrap();
        }
    });
    let indices: Vec<_> = block_on(stream.map(|item| item.index).collect());
    producer.join().unwrap();
    assert_eq!(indices, [3, 2, 1, 0]);
}

#[test]
fn each_dispose_waits_for_outstanding_inputs() {
    let (mut group, token) = EachGroup::<u32>::new(&CancelationToken::none(), RejectionPolicy::Suppress);
    let (finished, first) = Deferred::new();
    let (outstanding, second) = Deferred::new();
    group.add(first);
    group.add(second);
    assert_eq!(group.len(), 2);
    let mut results = group.into_each();

    finished.resolve(1).unwrap();
    let _ = block_on(results.move_next()).unwrap();
    let mut disposed = results.dispose();
    assert!(token.is_cancelation_requested());
    assert_eq!(disposed.state(), PromiseState::Pending);

    outstanding.resolve(2).unwrap();
    assert!(matches!(disposed.try_outcome(), Some(Outcome::Resolved(()))));
}

#[test]
fn each_dispose_after_exhaustion_resolves_immediately() {
    let mut results = each([Promise::resolved(1u8)]);
    assert!(block_on(results.move_next()).unwrap().is_some());
    assert!(block_on(results.move_next()).unwrap().is_none());
    assert!(block_on(results.dispose()).is_ok());
}
