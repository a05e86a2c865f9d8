use super::cancel_ref::CancelationRef;
use super::list::Callback;
use super::token::CancelationToken;
use crate::error::CancelationError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The owning side of a cancelation signal.
///
/// Clones share the same signal. Disposing any clone invalidates all of them;
/// tokens handed out before that keep working until the state is recycled.
#[derive(Clone)]
pub struct CancelationSource {
    cancel_ref: Arc<CancelationRef>,
    source_id: u32,
}

impl CancelationSource {
    pub fn new() -> Self {
        let (cancel_ref, source_id) = CancelationRef::new_source();
        tracing::trace!(source_id, "created cancelation source");
        Self { cancel_ref, source_id }
    }

    /// A source that is also canceled when any of `tokens` is.
    pub fn new_linked(tokens: &[CancelationToken]) -> Self {
        let source = Self::new();
        for token in tokens {
            let link = Callback::Link {
                child: Arc::downgrade(&source.cancel_ref),
                source_id: source.source_id,
            };
            if let Some(registration) = token.register_callback(link) {
                source.cancel_ref.add_link(registration);
            }
        }
        source
    }

    /// A token observing this source, or [`CancelationToken::none`] once the
    /// source is disposed.
    pub fn token(&self) -> CancelationToken {
        match self.cancel_ref.token_for(self.source_id) {
            Some(token_id) => CancelationToken::from_ref(self.cancel_ref.clone(), token_id),
            None => CancelationToken::none(),
        }
    }

    /// `false` once the source has been disposed.
    pub fn is_valid(&self) -> bool {
        self.cancel_ref.is_source_valid(self.source_id)
    }

    pub fn is_cancelation_requested(&self) -> bool {
        self.cancel_ref.is_source_canceled(self.source_id)
    }

    /// Cancels the source and runs every registered callback, newest first.
    ///
    /// Canceling twice is a no-op. Panicking callbacks do not stop the
    /// others; their payloads come back as
    /// [`CancelationError::CallbacksFailed`].
    pub fn cancel(&self) -> Result<(), CancelationError> {
        self.cancel_ref.cancel(self.source_id)
    }

    /// Cancels the source after `delay`. Calling it again reschedules the
    /// pending timer. A zero delay cancels before returning.
    pub fn cancel_after(&self, delay: Duration) -> Result<(), CancelationError> {
        self.cancel_ref.cancel_after(self.source_id, delay)
    }

    /// Releases the source. Callbacks that have not run are dropped, and a
    /// pending `cancel_after` timer is stopped.
    pub fn dispose(&self) -> Result<(), CancelationError> {
        self.cancel_ref.dispose(self.source_id)
    }

    pub fn try_dispose(&self) -> bool {
        self.dispose().is_ok()
    }
}

impl Default for CancelationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationSource")
            .field("source_id", &self.source_id)
            .field("valid", &self.is_valid())
            .field("requested", &self.is_cancelation_requested())
            .finish()
    }
}
