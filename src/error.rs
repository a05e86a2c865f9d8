use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// The payload carried by a rejected promise.
///
/// Cloning is cheap: every clone points at the same underlying error, which
/// lets callers compare payloads by identity with [`Rejection::ptr_eq`].
#[derive(Clone)]
pub struct Rejection(Arc<dyn StdError + Send + Sync + 'static>);

impl Rejection {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Shorthand for a rejection that only carries a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Rejection>() {
            Ok(rejection) => return *rejection,
            Err(payload) => payload,
        };
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self::new(Panicked(message))
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.0.is::<E>()
    }

    /// Returns `true` if both rejections share the same payload.
    pub fn ptr_eq(&self, other: &Rejection) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rejection").field(&self.0).finish()
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// A continuation or cancelation callback panicked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("callback panicked: {0}")]
pub struct Panicked(pub String);

/// Several failures merged into one, in the order they were observed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} error(s) occurred: [{}]", .errors.len(), display_list(.errors))]
pub struct AggregateError {
    errors: Vec<Rejection>,
}

fn display_list(errors: &[Rejection]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AggregateError {
    pub fn new(errors: Vec<Rejection>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[Rejection] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<Rejection> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PromiseError {
    #[error("promise was rejected: {0}")]
    Rejected(Rejection),
    #[error("promise was canceled")]
    Canceled,
    /// The handle was captured before its node went back to the pool.
    #[error("stale promise handle: handle id {expected}, node id {actual}")]
    InvalidId { expected: u16, actual: u16 },
    #[error("promise has already been settled")]
    AlreadySettled,
    #[error("promise has already been awaited or forwarded")]
    AlreadyConsumed,
    #[error("promise has not been settled yet")]
    NotSettled,
}

impl PromiseError {
    /// The rejection payload, if this error carries one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            PromiseError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, PromiseError::Canceled)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CancelationError {
    #[error("cancelation source has been disposed")]
    Disposed,
    #[error("one or more cancelation callbacks failed: {0}")]
    CallbacksFailed(#[source] AggregateError),
}
