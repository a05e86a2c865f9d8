//! Process-wide settings.
//!
//! Everything here is read on hot paths, so reads go through a `RwLock` that
//! is only written when a setting changes.

use crate::error::Rejection;
use crate::timer::{ThreadTimerFactory, TimerFactory};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::sync::Arc;

type UnhandledRejectionHandler = Arc<dyn Fn(Rejection) + Send + Sync + 'static>;

struct Config {
    object_pooling: bool,
    unhandled_rejection_handler: Option<UnhandledRejectionHandler>,
    timer_factory: Option<Arc<dyn TimerFactory>>,
}

lazy_static! {
    static ref CONFIG: RwLock<Config> = RwLock::new(Config {
        object_pooling: true,
        unhandled_rejection_handler: None,
        timer_factory: None,
    });
}

/// Turns object pooling on or off. Turning it off also drops every object
/// that is currently parked in a pool.
pub fn set_object_pooling_enabled(enabled: bool) {
    CONFIG.write().object_pooling = enabled;
    if !enabled {
        crate::pool::clear_object_pool();
    }
}

pub fn object_pooling_enabled() -> bool {
    CONFIG.read().object_pooling
}

/// Installs the sink for rejections that were never observed before their
/// promise was released.
pub fn set_unhandled_rejection_handler<F>(handler: F)
where
    F: Fn(Rejection) + Send + Sync + 'static,
{
    CONFIG.write().unhandled_rejection_handler = Some(Arc::new(handler));
}

/// Restores the default sink, which logs the rejection at error level.
pub fn clear_unhandled_rejection_handler() {
    CONFIG.write().unhandled_rejection_handler = None;
}

pub fn set_timer_factory(factory: Arc<dyn TimerFactory>) {
    CONFIG.write().timer_factory = Some(factory);
}

pub(crate) fn timer_factory() -> Arc<dyn TimerFactory> {
    if let Some(factory) = CONFIG.read().timer_factory.clone() {
        return factory;
    }
    ThreadTimerFactory::shared()
}

pub(crate) fn report_unhandled(rejection: Rejection) {
    // Never call the handler while holding the lock; it may touch the config.
    let handler = CONFIG.read().unhandled_rejection_handler.clone();
    match handler {
        Some(handler) => handler(rejection),
        None => tracing::error!(reason = %rejection, "unhandled promise rejection"),
    }
}
