use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

use crate::engine::{Unit, WorkQueue};

/// Bookkeeping for one identity key. Created on first discovery and kept for
/// the lifetime of the scheduler.
struct Record<U: Unit> {
    /// The canonical unit, every later discovery of the same key is rewritten
    /// to point here.
    unit: Arc<U>,
    state: Mutex<RecordState<U>>,
}

struct RecordState<U> {
    ran: bool,
    /// Lowest depth at which the children were expanded, `usize::MAX` if never.
    lowest_depth: usize,
    /// Canonicalized children, filled in right after `run`.
    children: Vec<Arc<U>>,
}

impl<U: Unit> Record<U> {
    fn new(unit: Arc<U>) -> Self {
        Self {
            unit,
            state: Mutex::new(RecordState {
                ran: false,
                lowest_depth: usize::MAX,
                children: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecordState<U>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs a dynamically discovered graph of [`Unit`]s on the rayon pool.
///
/// The registry lives as long as the scheduler, so consecutive calls to
/// [`Scheduler::run_and_wait`] share it: a unit that already ran is never run
/// again, but may still be expanded from a shallower depth.
pub struct Scheduler<U: Unit> {
    registry: DashMap<U::Key, Arc<Record<U>>>,
    max_depth: usize,
    cancelled: AtomicBool,
}

impl<U: Unit> Default for Scheduler<U> {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl<U: Unit> Scheduler<U> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            registry: DashMap::new(),
            max_depth,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Runs `units` and everything transitively discovered from them within the
    /// depth budget, blocking until all of it (including work pushed onto the
    /// [`WorkQueue`] by units) has finished.
    ///
    /// Each slot in `units` is replaced with the canonical unit for its key.
    pub fn run_and_wait(&self, units: &mut [Arc<U>]) {
        let span = tracing::debug_span!("run_and_wait", roots = units.len());
        let _enter = span.enter();

        rayon::scope(|scope| self.start(scope, units, 0));

        tracing::debug!(registered = self.registry.len(), "scheduler drained");
    }

    fn start<'scope>(
        &'scope self,
        scope: &rayon::Scope<'scope>,
        units: &mut [Arc<U>],
        depth: usize,
    ) {
        if self.is_cancelled() {
            return;
        }

        for slot in units.iter_mut() {
            let record = self.register(slot);
            let next_depth = depth.saturating_add(usize::from(slot.increases_depth()));

            if next_depth > self.max_depth {
                tracing::trace!(key = ?slot.key(), depth = next_depth, "depth budget exceeded");
                continue;
            }

            scope.spawn(move |scope| self.expand(scope, &record, next_depth));
        }
    }

    /// Inserts a record for the unit in `slot` unless one exists, then points
    /// `slot` at the canonical unit.
    fn register(&self, slot: &mut Arc<U>) -> Arc<Record<U>> {
        let record = self
            .registry
            .entry(slot.key())
            .or_insert_with(|| Arc::new(Record::new(Arc::clone(slot))))
            .value()
            .clone();

        if !Arc::ptr_eq(&record.unit, slot) {
            *slot = Arc::clone(&record.unit);
        }

        record
    }

    fn expand<'scope>(&'scope self, scope: &rayon::Scope<'scope>, record: &Record<U>, depth: usize) {
        if self.is_cancelled() {
            return;
        }

        let mut state = record.lock();

        if !state.ran {
            tracing::debug!(key = ?record.unit.key(), depth, "running unit");
            record.unit.run(&WorkQueue::new(scope));
            state.ran = true;
            state.children = record.unit.sub_units();
        }

        if depth < state.lowest_depth {
            state.lowest_depth = depth;
            self.start(scope, &mut state.children, depth);
        }
    }

    /// Post-order walk over units that already ran.
    ///
    /// `on_unit` receives every unit once, together with the keys of its direct
    /// children that were not visited earlier in this walk. The return value
    /// holds the keys of `units` themselves, never their descendants.
    pub fn visit<F>(&self, units: &[Arc<U>], mut on_unit: F) -> Vec<U::Key>
    where
        F: FnMut(&Arc<U>, Vec<U::Key>),
    {
        let mut visited = HashSet::new();
        self.visit_level(units, &mut visited, &mut on_unit)
    }

    fn visit_level<F>(
        &self,
        units: &[Arc<U>],
        visited: &mut HashSet<U::Key>,
        on_unit: &mut F,
    ) -> Vec<U::Key>
    where
        F: FnMut(&Arc<U>, Vec<U::Key>),
    {
        let mut keys = Vec::with_capacity(units.len());

        for unit in units {
            let key = unit.key();
            if !visited.insert(key.clone()) {
                continue;
            }

            let unit = self.canonical(&key).unwrap_or_else(|| Arc::clone(unit));
            let children = self.sub_units_of(&key);
            let child_keys = self.visit_level(&children, visited, on_unit);

            on_unit(&unit, child_keys);
            keys.push(key);
        }

        keys
    }

    /// Stops the traversal. Work that has not started yet turns into a no-op,
    /// work already running is left to finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Number of distinct keys discovered so far.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn contains(&self, key: &U::Key) -> bool {
        self.registry.contains_key(key)
    }

    pub fn has_run(&self, key: &U::Key) -> bool {
        self.record(key).is_some_and(|record| record.lock().ran)
    }

    /// Lowest depth at which the children of `key` were expanded.
    pub fn expanded_depth(&self, key: &U::Key) -> Option<usize> {
        let depth = self.record(key)?.lock().lowest_depth;
        (depth != usize::MAX).then_some(depth)
    }

    /// The first unit registered under `key`.
    pub fn canonical(&self, key: &U::Key) -> Option<Arc<U>> {
        self.record(key).map(|record| Arc::clone(&record.unit))
    }

    /// Canonicalized children of `key`, empty if it never ran.
    pub fn sub_units_of(&self, key: &U::Key) -> Vec<Arc<U>> {
        self.record(key)
            .map(|record| record.lock().children.clone())
            .unwrap_or_default()
    }

    fn record(&self, key: &U::Key) -> Option<Arc<Record<U>>> {
        self.registry.get(key).map(|entry| Arc::clone(entry.value()))
    }
}
