use super::cancel_ref::{self, CancelationRef, Registered};
use super::list::Callback;
use super::registration::CancelationRegistration;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Read-only view of a cancelation source.
///
/// Tokens are cheap to clone. A token outlives its source safely: once the
/// source is disposed and its state recycled, the token reports that it can
/// no longer be canceled.
#[derive(Clone, Default)]
pub struct CancelationToken {
    inner: Kind,
}

#[derive(Clone, Default)]
enum Kind {
    #[default]
    None,
    Canceled,
    Ref {
        cancel_ref: Arc<CancelationRef>,
        token_id: u32,
    },
}

impl CancelationToken {
    /// A token that is never canceled.
    pub fn none() -> Self {
        Self { inner: Kind::None }
    }

    /// A token that is canceled from the start.
    pub fn canceled() -> Self {
        Self { inner: Kind::Canceled }
    }

    pub(crate) fn from_ref(cancel_ref: Arc<CancelationRef>, token_id: u32) -> Self {
        Self {
            inner: Kind::Ref { cancel_ref, token_id },
        }
    }

    pub fn can_be_canceled(&self) -> bool {
        match &self.inner {
            Kind::None => false,
            Kind::Canceled => true,
            Kind::Ref { cancel_ref, token_id } => cancel_ref.can_be_canceled(*token_id),
        }
    }

    pub fn is_cancelation_requested(&self) -> bool {
        match &self.inner {
            Kind::None => false,
            Kind::Canceled => true,
            Kind::Ref { cancel_ref, token_id } => cancel_ref.is_canceled(*token_id),
        }
    }

    /// Registers `callback` to run when the token is canceled.
    ///
    /// If the token is already canceled, `callback` runs before this returns
    /// and the returned registration is empty. Callbacks run newest first.
    pub fn register<F>(&self, callback: F) -> CancelationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_register(callback).unwrap_or_default()
    }

    /// Like [`register`](Self::register), but returns `None` if the token can
    /// never be canceled, so the callback will never run.
    pub fn try_register<F>(&self, callback: F) -> Option<CancelationRegistration>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_callback(Callback::User(Box::new(callback)))
    }

    pub(crate) fn register_callback(&self, callback: Callback) -> Option<CancelationRegistration> {
        match &self.inner {
            Kind::None => None,
            Kind::Canceled => {
                cancel_ref::invoke_now(callback);
                Some(CancelationRegistration::default())
            }
            Kind::Ref { cancel_ref, token_id } => match cancel_ref.register(*token_id, callback) {
                Registered::Added { key, callback_id } => Some(CancelationRegistration::new(
                    cancel_ref.clone(),
                    *token_id,
                    key,
                    callback_id,
                )),
                Registered::AlreadyCanceled(callback) => {
                    cancel_ref::invoke_now(callback);
                    Some(CancelationRegistration::default())
                }
                Registered::Unavailable => None,
            },
        }
    }

    /// Keeps the token's state from being recycled while the returned guard
    /// is alive. `None` if the token is stale.
    pub fn try_retain(&self) -> Option<RetainedToken> {
        if let Kind::Ref { cancel_ref, token_id } = &self.inner {
            if !cancel_ref.try_retain_user(*token_id) {
                return None;
            }
        }
        Some(RetainedToken { token: self.clone() })
    }
}

impl PartialEq for CancelationToken {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Kind::None, Kind::None) | (Kind::Canceled, Kind::Canceled) => true,
            (
                Kind::Ref { cancel_ref: a, token_id: x },
                Kind::Ref { cancel_ref: b, token_id: y },
            ) => Arc::ptr_eq(a, b) && x == y,
            _ => false,
        }
    }
}

impl Eq for CancelationToken {}

impl fmt::Debug for CancelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Kind::None => f.write_str("CancelationToken::None"),
            Kind::Canceled => f.write_str("CancelationToken::Canceled"),
            Kind::Ref { token_id, .. } => f
                .debug_struct("CancelationToken")
                .field("token_id", token_id)
                .field("requested", &self.is_cancelation_requested())
                .finish(),
        }
    }
}

/// A token whose state stays valid until this guard is dropped.
#[derive(Debug)]
pub struct RetainedToken {
    token: CancelationToken,
}

impl Deref for RetainedToken {
    type Target = CancelationToken;

    fn deref(&self) -> &CancelationToken {
        &self.token
    }
}

impl Drop for RetainedToken {
    fn drop(&mut self) {
        if let Kind::Ref { cancel_ref, .. } = &self.token.inner {
            cancel_ref.release_user();
        }
    }
}
