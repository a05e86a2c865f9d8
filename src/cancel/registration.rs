use super::cancel_ref::CancelationRef;
use super::token::CancelationToken;
use std::fmt;
use std::sync::Arc;

/// Handle to a callback registered on a [`CancelationToken`].
///
/// Dropping the handle leaves the callback registered. An empty registration
/// is returned when the token could not be canceled, or when the callback
/// already ran because the token was canceled at registration time.
#[derive(Clone, Default)]
pub struct CancelationRegistration {
    inner: Option<Linked>,
}

#[derive(Clone)]
struct Linked {
    cancel_ref: Arc<CancelationRef>,
    token_id: u32,
    key: usize,
    callback_id: u64,
}

impl CancelationRegistration {
    pub(crate) fn new(cancel_ref: Arc<CancelationRef>, token_id: u32, key: usize, callback_id: u64) -> Self {
        Self {
            inner: Some(Linked {
                cancel_ref,
                token_id,
                key,
                callback_id,
            }),
        }
    }

    /// `true` while the callback is registered and has not started running.
    pub fn is_registered(&self) -> bool {
        self.inner.as_ref().is_some_and(|linked| {
            linked
                .cancel_ref
                .is_registered(linked.token_id, linked.key, linked.callback_id)
        })
    }

    /// Removes the callback. Returns `true` only for the call that actually
    /// removed it; `false` once it has run, started running, or was removed.
    pub fn try_unregister(&self) -> bool {
        self.inner.as_ref().is_some_and(|linked| {
            linked
                .cancel_ref
                .try_unregister(linked.token_id, linked.key, linked.callback_id)
        })
    }

    /// Like [`try_unregister`](Self::try_unregister), but if the callback is
    /// running on another thread, blocks until it returns.
    pub fn unregister_and_wait(&self) -> bool {
        self.inner.as_ref().is_some_and(|linked| {
            linked
                .cancel_ref
                .unregister_and_wait(linked.token_id, linked.key, linked.callback_id)
        })
    }

    /// The token this callback was registered on.
    pub fn token(&self) -> CancelationToken {
        match &self.inner {
            Some(linked) => CancelationToken::from_ref(linked.cancel_ref.clone(), linked.token_id),
            None => CancelationToken::none(),
        }
    }
}

impl fmt::Debug for CancelationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationRegistration")
            .field("registered", &self.is_registered())
            .finish()
    }
}
