//! The generic run-once task engine.
//!
//! A [`Unit`] is a node of a graph that is discovered while it is being
//! executed: its children are only known after [`Unit::run`] returns. The
//! [`Scheduler`] fans out over such a graph on the rayon pool, making sure that
//! every identity key is executed at most once, no matter how many parents
//! reach it.
//!
//! ## Depth
//!
//! Every unit reports whether stepping into its children costs one unit of the
//! scheduler's depth budget. A unit reached past the budget is registered but
//! not executed from that path. When a unit is reached again at a shallower
//! depth its children are expanded again, so the shallowest path always wins.

mod scheduler;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

pub use crate::engine::scheduler::Scheduler;

/// A schedulable node of a dynamically discovered graph.
///
/// Implementors rely on interior mutability for whatever `run` produces, the
/// scheduler only ever hands out shared references.
pub trait Unit: Send + Sync + 'static {
    /// Identity used for deduplication. Two units with equal keys are the same
    /// logical node.
    type Key: Clone + Eq + Hash + Debug + Send + Sync;

    /// Stable identity of this unit.
    fn key(&self) -> Self::Key;

    /// Performs the one-time effect of this unit. Additional work may be pushed
    /// onto `queue`, it is joined by the same barrier as the traversal.
    ///
    /// Runs while the unit's record is locked, so it must not block on the
    /// rayon pool (`join`, `scope`, parallel iterators). Push onto `queue`
    /// instead.
    fn run(&self, queue: &WorkQueue<'_, '_>);

    /// Units discovered by [`Unit::run`].
    ///
    /// # Panics
    /// Implementations are expected to panic when called before `run`.
    fn sub_units(&self) -> Vec<Arc<Self>>;

    /// Whether descending into the children of this unit consumes depth.
    fn increases_depth(&self) -> bool {
        true
    }
}

/// Handle to the parallel work queue backing a single
/// [`Scheduler::run_and_wait`] call.
pub struct WorkQueue<'a, 'scope> {
    scope: &'a rayon::Scope<'scope>,
}

impl<'a, 'scope> WorkQueue<'a, 'scope> {
    pub(crate) fn new(scope: &'a rayon::Scope<'scope>) -> Self {
        Self { scope }
    }

    /// Enqueues fire-and-forget work. The surrounding `run_and_wait` does not
    /// return before `work` has finished.
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        self.scope.spawn(move |_| work());
    }
}
