//! Scheduling, per-element status tracking, and completion notification.
//!
//! [`FontLoader`] is the entry point: callers hand it a set of elements and
//! it arms a visibility watch over them (or dispatches immediately). On each
//! element's first relevance trigger the loader builds the canonical request,
//! runs the element state machine, and attaches the element to the shared
//! fetch operation from the [`FetchCache`]. Every scheduled element gets a
//! [`CompletionHandle`] before dispatch begins, so callers can await "this
//! element's font is ready" regardless of whether loading is immediate, lazy,
//! or already cached.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cache::{FetchCache, FontRegistry};
use crate::{FontElement, FontError, FontFetcher, FontRequest, LoadStatus, LoadedFont};

/// Outcome delivered through a completion handle.
pub type LoadOutcome = Result<Arc<LoadedFont>, FontError>;

// ── Completion handles ──────────────────────────────────────────────────────

/// Awaitable success/failure signal for one element's font-loading outcome.
///
/// Resolves when the element's status transitions to `loaded`, rejects when
/// it transitions to `error`. A handle settles at most once.
pub struct CompletionHandle {
    outcome: Mutex<Option<LoadOutcome>>,
    settled: Condvar,
}

impl CompletionHandle {
    fn new() -> Arc<Self> {
        Arc::new(CompletionHandle {
            outcome: Mutex::new(None),
            settled: Condvar::new(),
        })
    }

    fn resolve(&self, font: Arc<LoadedFont>) {
        self.settle(Ok(font));
    }

    fn reject(&self, error: FontError) {
        self.settle(Err(error));
    }

    fn settle(&self, outcome: LoadOutcome) {
        let mut slot = self.outcome.lock().unwrap();
        if slot.is_none() {
            *slot = Some(outcome);
            self.settled.notify_all();
        }
    }

    /// Block until the element's font load settles.
    pub fn wait(&self) -> LoadOutcome {
        let mut slot = self.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self.settled.wait(slot).unwrap();
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<LoadOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self.settled.wait_timeout(slot, remaining).unwrap();
            slot = guard;
        }
    }

    /// The outcome, if the load has settled.
    pub fn try_outcome(&self) -> Option<LoadOutcome> {
        self.outcome.lock().unwrap().clone()
    }
}

// ── Visibility collaborator ─────────────────────────────────────────────────

/// Proximity configuration forwarded verbatim to the visibility watcher.
///
/// The loader never interprets these fields; they carry standard
/// viewport-intersection semantics for whatever watcher is injected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisibilityOptions {
    /// Margin around the viewport, e.g. `"200px"`.
    pub margin: Option<String>,
    /// Fraction of the element that must be visible to count as relevant.
    pub threshold: Option<f64>,
}

/// Configuration accepted by [`FontLoader::schedule`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Bypass visibility watching and dispatch every element synchronously.
    pub immediate: bool,
    pub visibility: VisibilityOptions,
}

impl ScheduleOptions {
    pub fn immediate() -> Self {
        ScheduleOptions {
            immediate: true,
            ..Default::default()
        }
    }
}

/// External visibility-detection collaborator.
///
/// Implementations must invoke `trigger` at most once, when the element
/// becomes relevant (enters or nears the viewport per `options`). The loader
/// cancels the returned subscription after the first trigger, so each element
/// is dispatched at most once automatically.
pub trait VisibilityWatcher: Send + Sync {
    fn observe(
        &self,
        element: Arc<dyn FontElement>,
        options: &VisibilityOptions,
        trigger: Box<dyn FnOnce() + Send>,
    ) -> Box<dyn WatchSubscription>;
}

/// Cancellation handle for one armed watch.
pub trait WatchSubscription: Send {
    fn cancel(self: Box<Self>);
}

/// Watcher for environments without visibility detection: every element is
/// treated as relevant the moment it is observed.
pub struct ImmediateVisibility;

impl VisibilityWatcher for ImmediateVisibility {
    fn observe(
        &self,
        _element: Arc<dyn FontElement>,
        _options: &VisibilityOptions,
        trigger: Box<dyn FnOnce() + Send>,
    ) -> Box<dyn WatchSubscription> {
        trigger();
        Box::new(NoopSubscription)
    }
}

struct NoopSubscription;

impl WatchSubscription for NoopSubscription {
    fn cancel(self: Box<Self>) {}
}

// ── Element entries ─────────────────────────────────────────────────────────

/// Lifecycle of one registration's visibility watch.
///
/// `Done` is terminal: once the trigger has fired, a subscription arriving
/// late from `observe` is cancelled instead of stored, so no watch outlives
/// its one trigger regardless of which thread fires it.
enum WatchState {
    Unarmed,
    Armed(Box<dyn WatchSubscription>),
    Done,
}

/// One registration of one element. Never shared across `schedule` calls.
struct ElementEntry {
    element: Arc<dyn FontElement>,
    handle: Arc<CompletionHandle>,
    /// Re-entrancy guard: each registration dispatches at most once.
    dispatched: Mutex<bool>,
    watch: Mutex<WatchState>,
}

// ── Schedule handles ────────────────────────────────────────────────────────

/// Aggregate result of one `schedule` call, one outcome per element in
/// registration order.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub outcomes: Vec<LoadOutcome>,
}

impl ScheduleOutcome {
    /// `true` if every element loaded.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(Result::is_ok)
    }

    /// Failed elements, as `(index, error)` pairs.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &FontError)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, outcome)| outcome.as_ref().err().map(|e| (i, e)))
    }
}

/// Handle over everything one `schedule` call registered.
pub struct ScheduleHandle {
    entries: Vec<Arc<ElementEntry>>,
}

impl ScheduleHandle {
    /// Per-element completion handles, in registration order.
    pub fn handles(&self) -> Vec<Arc<CompletionHandle>> {
        self.entries.iter().map(|e| Arc::clone(&e.handle)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for every element to settle, success or failure.
    ///
    /// Never bails out early on the first failure: each element's fetch is
    /// accounted for before the aggregate outcome is reported.
    pub fn wait(&self) -> ScheduleOutcome {
        ScheduleOutcome {
            outcomes: self.entries.iter().map(|e| e.handle.wait()).collect(),
        }
    }

    /// Like [`wait`](Self::wait), giving up once `timeout` has elapsed
    /// overall. Returns `None` if any element was still unsettled.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ScheduleOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcomes = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO);
            outcomes.push(entry.handle.wait_timeout(remaining)?);
        }
        Some(ScheduleOutcome { outcomes })
    }
}

// ── The loader ──────────────────────────────────────────────────────────────

/// Coordinates visibility-triggered font fetches over a shared cache and
/// registry.
pub struct FontLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    fetcher: Arc<dyn FontFetcher>,
    watcher: Arc<dyn VisibilityWatcher>,
    cache: Arc<FetchCache>,
    registry: Arc<FontRegistry>,
}

impl FontLoader {
    /// Create a loader with a fresh cache and registry.
    pub fn new(fetcher: Arc<dyn FontFetcher>, watcher: Arc<dyn VisibilityWatcher>) -> Self {
        let registry = FontRegistry::new();
        let cache = FetchCache::new(Arc::clone(&registry));
        FontLoader::with_stores(fetcher, watcher, cache, registry)
    }

    /// Create a loader over an existing cache and registry, so several
    /// loaders (or tests) can share one process-wide store.
    pub fn with_stores(
        fetcher: Arc<dyn FontFetcher>,
        watcher: Arc<dyn VisibilityWatcher>,
        cache: Arc<FetchCache>,
        registry: Arc<FontRegistry>,
    ) -> Self {
        FontLoader {
            inner: Arc::new(LoaderInner {
                fetcher,
                watcher,
                cache,
                registry,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<FontRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<FetchCache> {
        &self.inner.cache
    }

    /// Dispatch fetches for `elements` right away, without visibility
    /// watching and without handing back completion handles.
    pub fn dispatch_now(&self, elements: Vec<Arc<dyn FontElement>>) {
        let _ = self.schedule(elements, ScheduleOptions::immediate());
    }

    /// Register `elements` for font loading.
    ///
    /// Every element gets its completion handle and an initial `unloaded`
    /// status (if it has none yet) before any dispatch or watch arming
    /// happens. With `immediate` set, each element is dispatched
    /// synchronously; otherwise each is observed through the injected
    /// visibility watcher and dispatched on its first relevance trigger,
    /// after which its subscription is cancelled.
    pub fn schedule(
        &self,
        elements: Vec<Arc<dyn FontElement>>,
        options: ScheduleOptions,
    ) -> ScheduleHandle {
        let entries: Vec<Arc<ElementEntry>> = elements
            .into_iter()
            .map(|element| {
                if element.status().is_none() {
                    element.set_status(LoadStatus::Unloaded);
                }
                Arc::new(ElementEntry {
                    element,
                    handle: CompletionHandle::new(),
                    dispatched: Mutex::new(false),
                    watch: Mutex::new(WatchState::Unarmed),
                })
            })
            .collect();

        if options.immediate {
            for entry in &entries {
                LoaderInner::dispatch(&self.inner, entry);
            }
        } else {
            for entry in &entries {
                self.arm_watch(entry, &options.visibility);
            }
        }

        ScheduleHandle { entries }
    }

    fn arm_watch(&self, entry: &Arc<ElementEntry>, visibility: &VisibilityOptions) {
        let inner = Arc::clone(&self.inner);
        let triggered = Arc::clone(entry);
        let trigger = Box::new(move || {
            LoaderInner::dispatch(&inner, &triggered);
            // One trigger per element: the watch is finished whether or not
            // its subscription has been stored yet.
            let previous =
                std::mem::replace(&mut *triggered.watch.lock().unwrap(), WatchState::Done);
            if let WatchState::Armed(subscription) = previous {
                subscription.cancel();
            }
        });

        let subscription =
            self.inner
                .watcher
                .observe(Arc::clone(&entry.element), visibility, trigger);

        // The trigger may already have fired, inside observe() or from a
        // watcher thread; then the subscription is cancelled here instead
        // of stored.
        let mut watch = entry.watch.lock().unwrap();
        if matches!(*watch, WatchState::Done) {
            drop(watch);
            subscription.cancel();
        } else {
            *watch = WatchState::Armed(subscription);
        }
    }
}

impl LoaderInner {
    /// Run one element through the state machine and attach it to the shared
    /// fetch operation for its key.
    fn dispatch(inner: &Arc<LoaderInner>, entry: &Arc<ElementEntry>) {
        {
            let mut dispatched = entry.dispatched.lock().unwrap();
            if *dispatched {
                return;
            }
            *dispatched = true;
        }

        let element = &entry.element;
        let request = match FontRequest::from_element(element.as_ref()) {
            Ok(request) => request,
            Err(err) => {
                element.set_status(LoadStatus::Error);
                entry.handle.reject(err);
                return;
            }
        };
        let key = request.cache_key();

        match element.status() {
            Some(LoadStatus::Loaded) => {
                // Short-circuit: the font is already registered, so fulfil
                // the handle without touching the cache.
                if let Some(font) = inner.registry.get(&key) {
                    entry.handle.resolve(font);
                    return;
                }
                // Loaded status with no registry entry means the status was
                // written externally; fall through and fetch.
            }
            Some(LoadStatus::Error) => {
                entry.handle.reject(FontError::PreviouslyFailed);
                return;
            }
            _ => {}
        }

        element.set_status(LoadStatus::Loading);
        tracing::debug!(key = %key, "dispatching font fetch");

        let fetcher = Arc::clone(&inner.fetcher);
        let fetch_request = request.clone();
        let slot = inner
            .cache
            .acquire(&key, move || fetcher.fetch(&fetch_request));

        let element = Arc::clone(element);
        let handle = Arc::clone(&entry.handle);
        slot.subscribe(Box::new(move |outcome| match outcome {
            Ok(font) => {
                element.set_status(LoadStatus::Loaded);
                handle.resolve(Arc::clone(font));
            }
            Err(err) => {
                element.set_status(LoadStatus::Error);
                handle.reject(FontError::Fetch(err.clone()));
            }
        }));
    }
}
