//! Cooperative cancelation: sources signal, tokens observe, registrations
//! track individual callbacks.

mod cancel_ref;
mod list;
mod registration;
mod source;
mod token;

pub use registration::CancelationRegistration;
pub use source::CancelationSource;
pub use token::{CancelationToken, RetainedToken};
