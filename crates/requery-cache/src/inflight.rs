use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};

/// A shared, in-flight computation that can be awaited by any number of callers.
pub type SharedFuture<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct Slot<T, E> {
    id: u64,
    future: SharedFuture<T, E>,
}

type Slots<T, E> = Arc<Mutex<HashMap<String, Slot<T, E>>>>;

/// The role a caller got when asking [`InFlight`] for a computation.
pub enum Flight<T, E> {
    /// This caller started a new computation.
    Leader { id: u64, future: SharedFuture<T, E> },
    /// A computation for the key was already running and this caller joined it.
    Follower { id: u64, future: SharedFuture<T, E> },
}

impl<T, E> Flight<T, E> {
    /// Whether this caller started the computation.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }

    /// Identifies the computation, see [`InFlight::clear_if`].
    pub fn id(&self) -> u64 {
        match self {
            Self::Leader { id, .. } | Self::Follower { id, .. } => *id,
        }
    }

    /// The shared computation, regardless of the role.
    pub fn into_future(self) -> SharedFuture<T, E> {
        match self {
            Self::Leader { future, .. } | Self::Follower { future, .. } => future,
        }
    }
}

/// Request coalescing for concurrent computations with the same key.
///
/// While a computation for a key is running, every further request for that key joins it
/// instead of starting another one. The entry removes itself once the computation settles,
/// whether it succeeded or failed, so the next request after that starts fresh.
///
/// Nothing is cached beyond the lifetime of the computation itself, that is the job of the
/// [`CacheStore`](crate::CacheStore).
pub struct InFlight<T, E> {
    next_id: AtomicU64,
    slots: Slots<T, E>,
}

impl<T, E> Default for InFlight<T, E> {
    fn default() -> Self {
        Self {
            next_id: Default::default(),
            slots: Default::default(),
        }
    }
}

impl<T, E> std::fmt::Debug for InFlight<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self.slots.try_lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("InFlight")
            .field("running", &running)
            .finish()
    }
}

impl<T, E> InFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the computation currently running for `key`.
    pub fn get(&self, key: &str) -> Option<SharedFuture<T, E>> {
        let slots = self.slots.lock().unwrap();
        slots.get(key).map(|slot| slot.future.clone())
    }

    /// Joins the computation running for `key`, or starts a new one with `start`.
    ///
    /// `start` is only invoked when this caller becomes the [`Flight::Leader`]. The computation
    /// itself is lazy and is driven by whoever awaits the returned future.
    pub fn get_or_start<S, F>(&self, key: &str, start: S) -> Flight<T, E>
    where
        S: FnOnce() -> F,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(key) {
            tracing::trace!(key, "Joining in-flight computation");
            return Flight::Follower {
                id: slot.id,
                future: slot.future.clone(),
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let computation = start();
        let weak_slots = Arc::downgrade(&self.slots);
        let owned_key = key.to_owned();

        let future = async move {
            let result = computation.await;
            if let Some(slots) = weak_slots.upgrade() {
                remove_slot(&slots, &owned_key, id);
            }
            result
        }
        .boxed()
        .shared();

        slots.insert(
            key.to_owned(),
            Slot {
                id,
                future: future.clone(),
            },
        );
        Flight::Leader { id, future }
    }

    /// Forgets the computation running for `key`.
    ///
    /// Callers that already hold the shared future still get its result, but the next request
    /// for `key` will start a new computation.
    pub fn clear(&self, key: &str) -> bool {
        self.slots.lock().unwrap().remove(key).is_some()
    }

    /// Forgets the computation running for `key`, but only if it is computation `id`.
    ///
    /// A caller that took part in a computation uses this to abandon it without touching a
    /// newer computation for the same key.
    pub fn clear_if(&self, key: &str, id: u64) -> bool {
        remove_slot(&self.slots, key, id)
    }

    /// The number of running computations.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Whether no computation is running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the slot for `key`, but only if it still belongs to computation `id`.
fn remove_slot<T, E>(slots: &Mutex<HashMap<String, Slot<T, E>>>, key: &str, id: u64) -> bool {
    let mut slots = slots.lock().unwrap();
    let owned = slots.get(key).is_some_and(|slot| slot.id == id);
    if owned {
        slots.remove(key);
    }
    owned
}
