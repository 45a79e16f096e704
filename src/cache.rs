//! Fetch deduplication and the process-wide font registry.
//!
//! [`FetchCache`] maps canonical request keys to shared fetch operations and
//! guarantees at most one underlying fetch per key: the first acquirer starts
//! the fetch on a background thread, every later acquirer attaches to the
//! same [`FetchSlot`]. A successful fetch is kept for the lifetime of the
//! cache and its font is inserted into the [`FontRegistry`] exactly once; a
//! failed fetch is evicted before its waiters are notified, so the next
//! request for that key retries instead of replaying the failure.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::{FetchError, LoadedFont};

/// Settled result of a shared fetch operation.
pub type FetchOutcome = Result<Arc<LoadedFont>, FetchError>;

type Continuation = Box<dyn FnOnce(&FetchOutcome) + Send>;

enum SlotState {
    /// Fetch in flight; continuations queued until settle.
    Pending(Vec<Continuation>),
    Settled(FetchOutcome),
}

// ── Shared fetch operations ─────────────────────────────────────────────────

/// One shared fetch operation, fanned out to any number of subscribers.
///
/// A slot settles exactly once. Continuations attached before the settle run
/// when it happens; continuations attached afterwards run immediately with
/// the recorded outcome.
pub struct FetchSlot {
    state: Mutex<SlotState>,
    settled: Condvar,
}

impl FetchSlot {
    fn new() -> Self {
        FetchSlot {
            state: Mutex::new(SlotState::Pending(Vec::new())),
            settled: Condvar::new(),
        }
    }

    /// Attach a continuation to the operation's outcome.
    pub fn subscribe(&self, continuation: Box<dyn FnOnce(&FetchOutcome) + Send>) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            SlotState::Pending(waiters) => waiters.push(continuation),
            SlotState::Settled(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                continuation(&outcome);
            }
        }
    }

    /// Block the calling thread until the operation settles.
    pub fn wait(&self) -> FetchOutcome {
        let mut state = self.state.lock().unwrap();
        loop {
            if let SlotState::Settled(outcome) = &*state {
                return outcome.clone();
            }
            state = self.settled.wait(state).unwrap();
        }
    }

    /// The outcome, if the operation has settled.
    pub fn try_outcome(&self) -> Option<FetchOutcome> {
        match &*self.state.lock().unwrap() {
            SlotState::Pending(_) => None,
            SlotState::Settled(outcome) => Some(outcome.clone()),
        }
    }

    fn settle(&self, outcome: FetchOutcome) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, SlotState::Settled(outcome.clone())) {
                SlotState::Pending(waiters) => waiters,
                // Settle happens once per key; keep the first outcome.
                SlotState::Settled(previous) => {
                    *state = SlotState::Settled(previous);
                    return;
                }
            }
        };
        self.settled.notify_all();
        for continuation in waiters {
            continuation(&outcome);
        }
    }
}

// ── Deduplication cache ─────────────────────────────────────────────────────

/// Process-wide map from canonical request key to a shared fetch operation.
///
/// Only this type writes into the slot map; every other component attaches
/// to the slots it hands out.
pub struct FetchCache {
    slots: Mutex<HashMap<String, Arc<FetchSlot>>>,
    registry: Arc<FontRegistry>,
    fetch_seq: AtomicUsize,
}

impl FetchCache {
    pub fn new(registry: Arc<FontRegistry>) -> Arc<Self> {
        Arc::new(FetchCache {
            slots: Mutex::new(HashMap::new()),
            registry,
            fetch_seq: AtomicUsize::new(0),
        })
    }

    /// Return the live operation for `key`, or start one.
    ///
    /// If `key` has a live entry the existing slot is returned and `start` is
    /// dropped unused. Otherwise `start` runs on a spawned fetch thread; on
    /// success the loaded font is inserted into the registry before the slot
    /// settles, on failure the key is evicted before waiters are notified.
    /// A `start` that panics counts as a failure, so waiters are never left
    /// blocking on a slot that cannot settle.
    pub fn acquire(
        self: &Arc<Self>,
        key: &str,
        start: impl FnOnce() -> Result<LoadedFont, FetchError> + Send + 'static,
    ) -> Arc<FetchSlot> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            if let Some(existing) = slots.get(key) {
                return Arc::clone(existing);
            }
            let slot = Arc::new(FetchSlot::new());
            slots.insert(key.to_string(), Arc::clone(&slot));
            slot
        };

        let cache = Arc::clone(self);
        let fetch_slot = Arc::clone(&slot);
        let key = key.to_string();
        let seq = self.fetch_seq.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("webfont-fetch-{}", seq))
            .spawn(move || {
                tracing::debug!(key = %key, "starting font fetch");
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(start))
                    .unwrap_or_else(|_| Err(FetchError::new("font fetch panicked")));
                let outcome = match result {
                    Ok(font) => {
                        let font = Arc::new(font);
                        cache.registry.insert(&key, Arc::clone(&font));
                        tracing::debug!(key = %key, "font fetch settled, registered");
                        Ok(font)
                    }
                    Err(err) => {
                        // Failure is never cached: evict before anyone is told.
                        cache.evict(&key, &fetch_slot);
                        tracing::warn!(key = %key, error = %err, "font fetch failed, evicted");
                        Err(err)
                    }
                };
                fetch_slot.settle(outcome);
            })
            .expect("failed to spawn font fetch thread");

        slot
    }

    /// Whether `key` has a live entry (in flight or settled successfully).
    pub fn contains(&self, key: &str) -> bool {
        self.slots.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().is_empty()
    }

    /// Drop every cached operation. In-flight fetches still run to
    /// completion and settle their slots; they are simply no longer shared
    /// with future acquirers.
    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }

    /// Remove `key` only while it still maps to `slot`, so a stale fetch
    /// cannot evict a newer operation started after a `clear`.
    fn evict(&self, key: &str, slot: &Arc<FetchSlot>) {
        let mut slots = self.slots.lock().unwrap();
        if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }
}

// ── Font registry ───────────────────────────────────────────────────────────

/// Process-wide registry of successfully loaded fonts, keyed by canonical
/// request key.
///
/// Explicitly constructed and injectable; created once per process and
/// cleared only by explicit caller action. Each key is registered at most
/// once, no matter how many elements awaited its fetch.
#[derive(Default)]
pub struct FontRegistry {
    fonts: RwLock<BTreeMap<String, Arc<LoadedFont>>>,
}

impl FontRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(FontRegistry::default())
    }

    /// Register a font under `key`. Returns `false` if the key was already
    /// registered; the earlier entry wins.
    pub fn insert(&self, key: &str, font: Arc<LoadedFont>) -> bool {
        let mut fonts = self.fonts.write().unwrap();
        if fonts.contains_key(key) {
            return false;
        }
        fonts.insert(key.to_string(), font);
        true
    }

    pub fn get(&self, key: &str) -> Option<Arc<LoadedFont>> {
        self.fonts.read().unwrap().get(key).cloned()
    }

    /// All registered fonts, in key order.
    pub fn list(&self) -> Vec<(String, Arc<LoadedFont>)> {
        self.fonts
            .read()
            .unwrap()
            .iter()
            .map(|(key, font)| (key.clone(), Arc::clone(font)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fonts.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.read().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.fonts.write().unwrap().clear();
    }
}
