//! Automatic revalidation: focus, reconnect and polling.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::Instant;

use super::QueryInner;

impl<T, P> QueryInner<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    /// Registers the environment listeners and starts polling, as configured.
    pub(super) fn install_triggers(self: &Arc<Self>) {
        let environment = &self.options.environment;
        let mut subscriptions = self.subscriptions.lock().unwrap();

        if self.options.refresh_on_focus {
            let weak = Arc::downgrade(self);
            subscriptions.push(environment.on_focus(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.focused();
                }
            })));
        }

        if self.options.refresh_on_reconnect {
            let weak = Arc::downgrade(self);
            subscriptions.push(environment.on_reconnect(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    tracing::trace!("Revalidating after reconnect");
                    inner.spawn_revalidate();
                }
            })));
        }
        drop(subscriptions);

        self.start_polling();
    }

    /// Revalidates on focus, at most once per `focus_throttle`.
    fn focused(self: &Arc<Self>) {
        let now = Instant::now();
        {
            let mut last_focus = self.last_focus.lock().unwrap();
            let throttled = last_focus.is_some_and(|last| {
                now.saturating_duration_since(last) < self.options.focus_throttle
            });
            if throttled {
                tracing::trace!("Ignoring focus within throttle window");
                return;
            }
            *last_focus = Some(now);
        }

        tracing::trace!("Revalidating on focus");
        self.spawn_revalidate();
    }

    fn spawn_revalidate(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.revalidate().await;
        });
    }

    /// The single gate of all automatic refreshes.
    pub(super) async fn revalidate(self: &Arc<Self>) -> bool {
        if self.is_closed() || !self.active.load(Ordering::SeqCst) {
            return false;
        }

        let environment = &self.options.environment;
        if !self.options.revalidate_when_hidden && !environment.is_visible().await {
            tracing::trace!("Skipping revalidation while hidden");
            return false;
        }
        if !self.options.revalidate_when_offline && !environment.is_online().await {
            tracing::trace!("Skipping revalidation while offline");
            return false;
        }

        let Some(params) = self.last_params() else {
            return false;
        };

        metric!(counter("query.revalidate") += 1);
        // the outcome is reflected in the state
        let _ = self.run_async(params).await;
        true
    }

    /// (Re)starts the polling task, if polling is configured.
    pub(super) fn start_polling(self: &Arc<Self>) {
        let Some(interval) = self.options.polling_interval else {
            return;
        };

        let weak = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tracing::trace!("Polling");
                inner.revalidate().await;
            }
        });

        let previous = self.polling.lock().unwrap().replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(super) fn stop_polling(&self) {
        if let Some(polling) = self.polling.lock().unwrap().take() {
            polling.abort();
        }
    }
}
