//! Debouncing and throttling of imperative calls.
//!
//! Both follow the semantics of the well known lodash functions: a [`Throttler`] is a
//! [`Debouncer`] whose `max_wait` equals its `wait`. Pending invocations are driven by timers
//! spawned on a Tokio runtime.

use std::cmp;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

type Func<A> = Arc<dyn Fn(A) + Send + Sync>;

/// Options of a [`Debouncer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebounceOptions {
    /// How long calls have to stop before the function is invoked.
    pub wait: Duration,
    /// Invoke on the leading edge of the timeout.
    pub leading: bool,
    /// Invoke on the trailing edge of the timeout.
    pub trailing: bool,
    /// The maximum time an invocation may be delayed. Values below `wait` are raised to `wait`.
    pub max_wait: Option<Duration>,
}

impl DebounceOptions {
    /// Trailing edge only, without `max_wait`.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            leading: false,
            trailing: true,
            max_wait: None,
        }
    }
}

/// Options of a [`Throttler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleOptions {
    /// The function is invoked at most once per `wait`.
    pub wait: Duration,
    pub leading: bool,
    pub trailing: bool,
}

impl ThrottleOptions {
    /// Both leading and trailing edge.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            leading: true,
            trailing: true,
        }
    }
}

impl From<ThrottleOptions> for DebounceOptions {
    fn from(options: ThrottleOptions) -> Self {
        Self {
            wait: options.wait,
            leading: options.leading,
            trailing: options.trailing,
            max_wait: Some(options.wait),
        }
    }
}

struct DebounceState<A> {
    last_args: Option<A>,
    last_call: Option<Instant>,
    last_invoke: Option<Instant>,
    timer: Option<(u64, AbortHandle)>,
    next_timer: u64,
}

impl<A> Default for DebounceState<A> {
    fn default() -> Self {
        Self {
            last_args: None,
            last_call: None,
            last_invoke: None,
            timer: None,
            next_timer: 0,
        }
    }
}

struct DebounceInner<A> {
    func: Func<A>,
    options: DebounceOptions,
    runtime: Handle,
    state: Mutex<DebounceState<A>>,
}

impl<A> Drop for DebounceInner<A> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
    }
}

/// Delays invocations of a function until calls have stopped for some time.
///
/// The arguments of the latest call win. The function itself is never called while the internal
/// lock is held, so it may call back into the debouncer.
pub struct Debouncer<A> {
    inner: Arc<DebounceInner<A>>,
}

impl<A> Clone for Debouncer<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for Debouncer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl<A: Send + 'static> Debouncer<A> {
    /// Creates a debouncer with timers on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new<F>(options: DebounceOptions, func: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self::with_runtime(options, Handle::current(), Arc::new(func))
    }

    fn with_runtime(mut options: DebounceOptions, runtime: Handle, func: Func<A>) -> Self {
        options.max_wait = options.max_wait.map(|max| cmp::max(max, options.wait));
        Self {
            inner: Arc::new(DebounceInner {
                func,
                options,
                runtime,
                state: Default::default(),
            }),
        }
    }

    /// Schedules an invocation with `args`.
    pub fn call(&self, args: A) {
        let inner = &self.inner;
        let options = &inner.options;
        let now = Instant::now();

        let invoke = {
            let mut state = inner.state.lock().unwrap();
            let is_invoking = inner.should_invoke(&state, now);
            state.last_args = Some(args);
            state.last_call = Some(now);

            if !is_invoking {
                if state.timer.is_none() {
                    inner.start_timer(&mut state, options.wait);
                }
                None
            } else if state.timer.is_none() {
                // leading edge
                state.last_invoke = Some(now);
                inner.start_timer(&mut state, options.wait);
                if options.leading {
                    state.last_args.take()
                } else {
                    None
                }
            } else if options.max_wait.is_some() {
                // calls in a tight loop, `max_wait` is due
                inner.start_timer(&mut state, options.wait);
                state.last_invoke = Some(now);
                state.last_args.take()
            } else {
                None
            }
        };

        if let Some(args) = invoke {
            (inner.func)(args);
        }
    }

    /// Drops the pending invocation, if any.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
        let next_timer = state.next_timer;
        *state = DebounceState {
            next_timer,
            ..Default::default()
        };
    }

    /// Immediately runs the pending invocation, if any.
    pub fn flush(&self) {
        let inner = &self.inner;
        let invoke = {
            let mut state = inner.state.lock().unwrap();
            match state.timer.take() {
                Some((_, timer)) => {
                    timer.abort();
                    inner.trailing_edge(&mut state, Instant::now())
                }
                None => None,
            }
        };

        if let Some(args) = invoke {
            (inner.func)(args);
        }
    }

    /// Whether an invocation is scheduled.
    pub fn pending(&self) -> bool {
        self.inner.state.lock().unwrap().timer.is_some()
    }
}

impl<A: Send + 'static> DebounceInner<A> {
    fn should_invoke(&self, state: &DebounceState<A>, now: Instant) -> bool {
        let Some(last_call) = state.last_call else {
            return true;
        };
        let since_call = now.saturating_duration_since(last_call);
        let max_wait_due = self.options.max_wait.is_some_and(|max_wait| {
            state
                .last_invoke
                .is_none_or(|last| now.saturating_duration_since(last) >= max_wait)
        });
        since_call >= self.options.wait || max_wait_due
    }

    fn remaining_wait(&self, state: &DebounceState<A>, now: Instant) -> Duration {
        let since_call = state
            .last_call
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        let waiting = self.options.wait.saturating_sub(since_call);
        match (self.options.max_wait, state.last_invoke) {
            (Some(max_wait), Some(last_invoke)) => {
                let since_invoke = now.saturating_duration_since(last_invoke);
                cmp::min(waiting, max_wait.saturating_sub(since_invoke))
            }
            _ => waiting,
        }
    }

    fn trailing_edge(&self, state: &mut DebounceState<A>, now: Instant) -> Option<A> {
        state.timer = None;
        if self.options.trailing && state.last_args.is_some() {
            state.last_invoke = Some(now);
            state.last_args.take()
        } else {
            state.last_args = None;
            None
        }
    }

    fn start_timer(self: &Arc<Self>, state: &mut DebounceState<A>, wait: Duration) {
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
        state.next_timer += 1;
        let id = state.next_timer;
        let inner = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            timer_expired(inner, id);
        });
        state.timer = Some((id, handle.abort_handle()));
    }
}

fn timer_expired<A: Send + 'static>(inner: Weak<DebounceInner<A>>, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let now = Instant::now();
    let invoke = {
        let mut state = inner.state.lock().unwrap();
        if !state.timer.as_ref().is_some_and(|(timer, _)| *timer == id) {
            return;
        }
        if inner.should_invoke(&state, now) {
            inner.trailing_edge(&mut state, now)
        } else {
            let remaining = inner.remaining_wait(&state, now);
            inner.start_timer(&mut state, remaining);
            None
        }
    };

    if let Some(args) = invoke {
        (inner.func)(args);
    }
}

/// Invokes a function at most once per `wait`.
pub struct Throttler<A> {
    debouncer: Debouncer<A>,
}

impl<A> Clone for Throttler<A> {
    fn clone(&self) -> Self {
        Self {
            debouncer: self.debouncer.clone(),
        }
    }
}

impl<A> fmt::Debug for Throttler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttler")
            .field("options", &self.debouncer.inner.options)
            .finish_non_exhaustive()
    }
}

impl<A: Send + 'static> Throttler<A> {
    /// Creates a throttler with timers on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new<F>(options: ThrottleOptions, func: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self::with_runtime(options, Handle::current(), Arc::new(func))
    }

    fn with_runtime(options: ThrottleOptions, runtime: Handle, func: Func<A>) -> Self {
        Self {
            debouncer: Debouncer::with_runtime(options.into(), runtime, func),
        }
    }

    pub fn call(&self, args: A) {
        self.debouncer.call(args)
    }

    pub fn cancel(&self) {
        self.debouncer.cancel()
    }

    pub fn flush(&self) {
        self.debouncer.flush()
    }

    pub fn pending(&self) -> bool {
        self.debouncer.pending()
    }
}

/// The resolved rate limiting of a query: a debouncer, a throttler, or a debouncer in front of a
/// throttler.
pub struct RateLimit<A> {
    debounce: Option<Debouncer<A>>,
    throttle: Option<Throttler<A>>,
}

impl<A> fmt::Debug for RateLimit<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimit")
            .field("debounce", &self.debounce)
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl<A: Send + 'static> RateLimit<A> {
    /// Wraps `func` into the configured limiters, or returns `None` if neither is configured.
    pub fn new<F>(
        debounce: Option<DebounceOptions>,
        throttle: Option<ThrottleOptions>,
        runtime: Handle,
        func: F,
    ) -> Option<Self>
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        if debounce.is_none() && throttle.is_none() {
            return None;
        }

        let func: Func<A> = Arc::new(func);
        let throttle =
            throttle.map(|options| Throttler::with_runtime(options, runtime.clone(), func.clone()));
        let debounce = debounce.map(|options| {
            let target: Func<A> = match &throttle {
                Some(throttle) => {
                    let throttle = throttle.clone();
                    Arc::new(move |args| throttle.call(args))
                }
                None => func.clone(),
            };
            Debouncer::with_runtime(options, runtime.clone(), target)
        });

        Some(Self { debounce, throttle })
    }

    pub fn call(&self, args: A) {
        match (&self.debounce, &self.throttle) {
            (Some(debounce), _) => debounce.call(args),
            (None, Some(throttle)) => throttle.call(args),
            (None, None) => {}
        }
    }

    /// Drops all pending invocations.
    pub fn cancel(&self) {
        if let Some(debounce) = &self.debounce {
            debounce.cancel();
        }
        if let Some(throttle) = &self.throttle {
            throttle.cancel();
        }
    }

    pub fn pending(&self) -> bool {
        self.debounce.as_ref().is_some_and(Debouncer::pending)
            || self.throttle.as_ref().is_some_and(Throttler::pending)
    }
}
