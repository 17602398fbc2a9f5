//! The dataflow graph: operator registry, finalization, and the run loop.
//!
//! A [`GraphBuilder`] is the shared, cheaply-cloneable registry that stream
//! builders insert operators into (the same role the pipeline graph plays in
//! a batch pipeline, except that here operators are long-lived and stateful).
//! [`GraphBuilder::finalize`] seals the graph into a runnable [`Graph`]; no
//! operators may be added afterwards, and a live query that re-subscribes
//! compiles a fresh graph rather than reusing a finalized one.
//!
//! Operator ids are allocated sequentially as the graph is built, and an
//! operator is always inserted after everything upstream of it, so ascending
//! id order is a topological order. [`Graph::run`] sweeps operators in that
//! order, draining pending input until a whole sweep finds no work — the
//! fixed point. A re-entry flag makes nested `run` calls return immediately,
//! so callbacks fired mid-run cannot recurse into the scheduler.

use std::sync::{Arc, Mutex};

/// Unique numeric identifier for an operator in a dataflow graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OperatorId(u64);

impl OperatorId {
    pub(crate) fn new(v: u64) -> Self {
        Self(v)
    }

    /// The underlying numeric value, mainly for debugging.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A stateful dataflow operator.
///
/// Each operator owns reader(s) onto its input stream(s) and a writer for
/// its output. `run` must drain all available input messages and write any
/// resulting deltas before returning.
pub trait Operator: Send {
    /// This operator's id within its graph.
    fn id(&self) -> OperatorId;

    /// True if any input message is waiting.
    fn pending_work(&self) -> bool;

    /// Drain inputs, transform, and emit output deltas.
    fn run(&mut self);
}

pub(crate) struct GraphInner {
    next_id: u64,
    operators: Vec<Box<dyn Operator>>,
    finalized: bool,
    running: bool,
}

/// Shared handle used while building a dataflow graph.
pub struct GraphBuilder {
    inner: Arc<Mutex<GraphInner>>,
}

impl Clone for GraphBuilder {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// A fresh, empty graph.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GraphInner {
                next_id: 0,
                operators: Vec::new(),
                finalized: false,
                running: false,
            })),
        }
    }

    pub(crate) fn alloc_id(&self) -> OperatorId {
        let mut g = self.inner.lock().unwrap();
        let id = OperatorId::new(g.next_id);
        g.next_id += 1;
        id
    }

    /// Register an operator. Panics if the graph is already finalized.
    pub(crate) fn add_operator(&self, op: Box<dyn Operator>) {
        let mut g = self.inner.lock().unwrap();
        assert!(!g.finalized, "cannot add operators to a finalized graph");
        g.operators.push(op);
    }

    /// Number of operators registered so far.
    pub fn operator_count(&self) -> usize {
        self.inner.lock().unwrap().operators.len()
    }

    /// Seal the graph. After this, no operators may be added; the returned
    /// [`Graph`] is the runnable handle.
    pub fn finalize(&self) -> Graph {
        self.inner.lock().unwrap().finalized = true;
        Graph { inner: Arc::clone(&self.inner) }
    }
}

/// A finalized, runnable dataflow graph.
pub struct Graph {
    inner: Arc<Mutex<GraphInner>>,
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Graph {
    /// True if any operator has input waiting.
    pub fn pending_work(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.operators.iter().any(|op| op.pending_work())
    }

    /// Execute operators in dependency order until no work remains.
    ///
    /// Returns `false` when the call was re-entrant (a run is already in
    /// progress) and did nothing.
    pub fn run(&self) -> bool {
        // Move the operators out so callbacks fired by operators can take
        // the lock (they will observe `running` and return).
        let mut ops = {
            let mut g = self.inner.lock().unwrap();
            if g.running {
                return false;
            }
            g.running = true;
            std::mem::take(&mut g.operators)
        };

        loop {
            let mut any = false;
            for op in ops.iter_mut() {
                if op.pending_work() {
                    op.run();
                    any = true;
                }
            }
            if !any {
                break;
            }
        }

        let mut g = self.inner.lock().unwrap();
        g.operators = ops;
        g.running = false;
        true
    }
}
