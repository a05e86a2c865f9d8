//! Process-wide settings. Everything lives in one test so nothing else in
//! this binary observes the changes.

mod common;

use futures::executor::block_on;
use futures::FutureExt;
use promise_graph::config::{
    clear_unhandled_rejection_handler, object_pooling_enabled, set_object_pooling_enabled, set_timer_factory,
    set_unhandled_rejection_handler,
};
use promise_graph::timer::{Timer, TimerCallback, TimerFactory};
use promise_graph::{
    clear_object_pool, race, CancelationSource, CancelationToken, Deferred, EachGroup, Promise, RaceGroup,
    RaceOptions, Rejection, RejectionPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

struct DetachedTimer;

impl Timer for DetachedTimer {
    fn change(&self, _due: Duration) -> bool {
        false
    }

    fn cancel(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct SpawningFactory {
    created: AtomicUsize,
}

impl TimerFactory for SpawningFactory {
    fn create_timer(&self, due: Duration, callback: TimerCallback) -> Box<dyn Timer> {
        self.created.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            thread::sleep(due);
            callback();
        });
        Box::new(DetachedTimer)
    }
}

/// Fires every timer before handing it out.
struct InlineFactory;

impl TimerFactory for InlineFactory {
    fn create_timer(&self, _due: Duration, callback: TimerCallback) -> Box<dyn Timer> {
        callback();
        Box::new(DetachedTimer)
    }
}

#[test]
fn process_wide_settings() {
    common::init_tracing();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    set_unhandled_rejection_handler(move |rejection| sink.lock().unwrap().push(rejection.to_string()));
    let take_reported = || std::mem::take(&mut *reported.lock().unwrap());

    // Unobserved rejections reach the handler once their promise is gone.
    drop(Promise::<u8>::rejected(Rejection::msg("dropped")));
    let (deferred, promise) = Deferred::<u8>::new();
    promise.forget();
    deferred.reject(Rejection::msg("no consumer")).unwrap();
    assert_eq!(take_reported(), ["dropped", "no consumer"]);

    // Observed ones do not.
    assert!(block_on(Promise::<u8>::rejected(Rejection::msg("seen"))).is_err());
    let recovered = Promise::rejected(Rejection::msg("caught")).catch(|_| 1u8);
    assert_eq!(block_on(recovered).unwrap(), 1);
    assert!(take_reported().is_empty());

    // An await that was dropped before the outcome arrived did not observe it.
    let (deferred, promise) = Deferred::<u8>::new();
    assert!(promise.now_or_never().is_none());
    deferred.reject(Rejection::msg("await dropped")).unwrap();
    let (deferred, mut promise) = Deferred::<u8>::new();
    assert!((&mut promise).now_or_never().is_none());
    deferred.reject(Rejection::msg("never read")).unwrap();
    drop(promise);
    assert_eq!(take_reported(), ["await dropped", "never read"]);

    // Suppressed race losers are not reported, with either race flavour.
    let (mut group, _token) = RaceGroup::<u8>::new(&CancelationToken::none(), RaceOptions::default());
    let (winner, first) = Deferred::new();
    let (loser, second) = Deferred::new();
    group.add(first);
    group.add(second);
    let result = group.wait_async();
    loser.reject(Rejection::msg("quiet before")).unwrap();
    winner.resolve(42).unwrap();
    assert_eq!(block_on(result).unwrap(), 42);
    let (winner, first) = Deferred::new();
    let (loser, second) = Deferred::new();
    let result = race([first, second]);
    winner.resolve(7u8).unwrap();
    loser.reject(Rejection::msg("quiet after")).unwrap();
    assert_eq!(block_on(result).unwrap(), 7);
    assert!(take_reported().is_empty());

    // A surfaced race loser is reported; the group still resolves.
    let options = RaceOptions {
        loser_rejections: RejectionPolicy::Surface,
        ..RaceOptions::default()
    };
    let (mut race, _token) = RaceGroup::<u8>::new(&CancelationToken::none(), options);
    let (winner, first) = Deferred::new();
    let (loser, second) = Deferred::new();
    race.add(first);
    race.add(second);
    let result = race.wait_async();
    winner.resolve(42).unwrap();
    loser.reject(Rejection::msg("loser")).unwrap();
    assert_eq!(block_on(result).unwrap(), 42);
    assert_eq!(take_reported(), ["loser"]);

    // So is a rejection that arrives after an each group was disposed.
    let (mut group, _token) = EachGroup::<u8>::new(&CancelationToken::none(), RejectionPolicy::Surface);
    let (late, input) = Deferred::new();
    group.add(input);
    let disposed = group.into_each().dispose();
    late.reject(Rejection::msg("after dispose")).unwrap();
    block_on(disposed).unwrap();
    assert_eq!(take_reported(), ["after dispose"]);

    clear_unhandled_rejection_handler();
    drop(Promise::<u8>::rejected(Rejection::msg("logged only")));
    assert!(take_reported().is_empty());

    // Pooling is an optimisation only.
    assert!(object_pooling_enabled());
    set_object_pooling_enabled(false);
    assert!(!object_pooling_enabled());
    let (deferred, promise) = Deferred::<u32>::new();
    let chained = promise.then(|value| value + 1);
    deferred.resolve(1).unwrap();
    assert_eq!(block_on(chained).unwrap(), 2);
    let source = CancelationSource::new();
    source.cancel().unwrap();
    source.dispose().unwrap();
    set_object_pooling_enabled(true);
    assert_eq!(block_on(Promise::resolved(5u8)).unwrap(), 5);
    clear_object_pool();

    // A timer that fires while it is being created cancels the source.
    set_timer_factory(Arc::new(InlineFactory));
    let source = CancelationSource::new();
    let token = source.token().try_retain().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let scheduled = source.cancel_after(Duration::from_nanos(1)).is_ok();
        tx.send((scheduled, source)).unwrap();
    });
    let (scheduled, source) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(scheduled);
    assert!(token.is_cancelation_requested());
    source.dispose().unwrap();

    // Delayed cancelation goes through the configured timer factory.
    let factory = Arc::new(SpawningFactory::default());
    set_timer_factory(factory.clone());
    let source = CancelationSource::new();
    let (tx, rx) = mpsc::channel();
    source.token().register(move || tx.send(()).unwrap());
    source.cancel_after(Duration::from_millis(10)).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    source.dispose().unwrap();
}
