//! The platform a query runs in: visibility, connectivity and their change events.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{self, BoxFuture, FutureExt};
use requery_cache::{ListenerSet, Subscription};

/// A listener for [`Environment`] events.
pub type EnvironmentListener = Box<dyn Fn() + Send + Sync>;

/// The probes and events that drive automatic revalidation.
///
/// Probes return futures, so implementations are free to ask an external system.
pub trait Environment: Send + Sync {
    /// Whether the consumer of the data is currently visible.
    fn is_visible(&self) -> BoxFuture<'static, bool>;

    /// Whether the network is reachable.
    fn is_online(&self) -> BoxFuture<'static, bool>;

    /// Registers a listener for when the consumer regains focus.
    fn on_focus(&self, listener: EnvironmentListener) -> Subscription;

    /// Registers a listener for when the network becomes reachable again.
    fn on_reconnect(&self, listener: EnvironmentListener) -> Subscription;
}

/// An [`Environment`] that is driven by explicit calls.
///
/// It starts out visible and online.
pub struct ManualEnvironment {
    visible: AtomicBool,
    online: AtomicBool,
    focus: ListenerSet<()>,
    reconnect: ListenerSet<()>,
}

impl Default for ManualEnvironment {
    fn default() -> Self {
        Self {
            visible: AtomicBool::new(true),
            online: AtomicBool::new(true),
            focus: Default::default(),
            reconnect: Default::default(),
        }
    }
}

impl fmt::Debug for ManualEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualEnvironment")
            .field("visible", &self.visible.load(Ordering::Relaxed))
            .field("online", &self.online.load(Ordering::Relaxed))
            .finish()
    }
}

impl ManualEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes visibility. Becoming visible counts as regaining focus.
    pub fn set_visible(&self, visible: bool) {
        let was_visible = self.visible.swap(visible, Ordering::SeqCst);
        if visible && !was_visible {
            tracing::trace!("Became visible");
            self.focus.emit(&());
        }
    }

    /// Changes connectivity. Going from offline to online emits a reconnect.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            tracing::trace!("Reconnected");
            self.reconnect.emit(&());
        }
    }

    /// Emits a focus event.
    pub fn focus(&self) {
        self.focus.emit(&());
    }
}

impl Environment for ManualEnvironment {
    fn is_visible(&self) -> BoxFuture<'static, bool> {
        future::ready(self.visible.load(Ordering::SeqCst)).boxed()
    }

    fn is_online(&self) -> BoxFuture<'static, bool> {
        future::ready(self.online.load(Ordering::SeqCst)).boxed()
    }

    fn on_focus(&self, listener: EnvironmentListener) -> Subscription {
        self.focus.subscribe(move |_| listener())
    }

    fn on_reconnect(&self, listener: EnvironmentListener) -> Subscription {
        self.reconnect.subscribe(move |_| listener())
    }
}
