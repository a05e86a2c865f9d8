//! Promises backed by pooled, generation-checked nodes.
//!
//! A [`Deferred`] settles a value that its [`Promise`] hands to exactly one
//! consumer: an `.await`, a continuation, or a group. Groups ([`all`],
//! [`race`], [`all_settled`], [`each`]) fan many promises into one.
//! Cancelation is cooperative: a [`CancelationSource`] signals its
//! [`CancelationToken`]s, which run registered callbacks newest first.
//!
//! # Examples
//!
//! ```
//! use promise_graph::{all, Deferred, Promise};
//! use futures::executor::block_on;
//!
//! let (deferred, pending) = Deferred::<u32>::new();
//! let doubled = pending.then(|value| value * 2);
//! let both = all([doubled, Promise::resolved(1)]);
//!
//! deferred.resolve(20).unwrap();
//! assert_eq!(block_on(both).unwrap(), vec![40, 1]);
//! ```

/// Reports a broken internal invariant: a panic in validating builds, an
/// error log otherwise.
macro_rules! fatal_misuse {
    ($($arg:tt)+) => {
        if cfg!(any(debug_assertions, feature = "validate")) {
            panic!($($arg)+);
        } else {
            tracing::error!($($arg)+);
        }
    };
}
pub(crate) use fatal_misuse;

pub mod cancel;
pub mod config;
mod continuation;
pub mod error;
pub mod group;
mod node;
mod pool;
mod promise;
pub mod timer;
mod trampoline;

pub use cancel::{CancelationRegistration, CancelationSource, CancelationToken, RetainedToken};
pub use error::{AggregateError, CancelationError, Panicked, PromiseError, Rejection};
pub use group::{
    all, all_settled, each, merge2, merge3, race, AllGroup, Each, EachGroup, EachResult, MergeGroup, RaceGroup,
    RaceOptions, RejectionPolicy,
};
pub use node::{Outcome, PromiseState};
pub use pool::clear_object_pool;
pub use promise::{Deferred, Promise};
