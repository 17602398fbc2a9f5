//! Difference streams: the typed edges of the dataflow graph.
//!
//! A [`StreamWriter`] fans a [`MultiSet`] delta out to every reader created
//! from it; each [`StreamReader`] owns an independent queue, so two
//! downstream operators never steal each other's messages. [`DiffStream`] is
//! the typed builder handle — the analogue of a collection handle in a batch
//! pipeline — whose methods insert operators into the shared
//! [`GraphBuilder`] and return the next stream along.
//!
//! [`InputWriter`] is the root of a graph: the live-query coordinator pushes
//! source deltas into it and then runs the graph to fixed point.

use crate::graph::GraphBuilder;
use crate::index::IndexKey;
use crate::multiset::MultiSet;
use crate::operators::consolidate::ConsolidateOperator;
use crate::operators::join::{JoinKind, JoinOperator};
use crate::operators::linear::{FilterOperator, MapOperator, TapOperator};
use crate::operators::output::{OutputEvent, OutputOperator};
use crate::operators::reduce::ReduceOperator;
use crate::operators::topk::{OrderByOperator, OrderByOptions};
use crate::value::{ContentHash, Data};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type SharedQueue<T> = Arc<Mutex<VecDeque<MultiSet<T>>>>;

/// Writing end of a difference stream; fans out to all readers.
pub struct StreamWriter<T> {
    targets: Arc<Mutex<Vec<SharedQueue<T>>>>,
}

impl<T> Clone for StreamWriter<T> {
    fn clone(&self) -> Self {
        Self { targets: Arc::clone(&self.targets) }
    }
}

impl<T: Data> StreamWriter<T> {
    pub(crate) fn new() -> Self {
        Self { targets: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Create an independent reader fed by this writer.
    pub fn reader(&self) -> StreamReader<T> {
        let queue: SharedQueue<T> = Arc::new(Mutex::new(VecDeque::new()));
        self.targets.lock().unwrap().push(Arc::clone(&queue));
        StreamReader { queue }
    }

    /// Send a delta to every reader. Empty deltas are dropped.
    pub fn send(&self, data: MultiSet<T>) {
        if data.is_empty() {
            return;
        }
        let targets = self.targets.lock().unwrap();
        for queue in targets.iter() {
            queue.lock().unwrap().push_back(data.clone());
        }
    }
}

/// Reading end of a difference stream.
pub struct StreamReader<T> {
    queue: SharedQueue<T>,
}

impl<T> Clone for StreamReader<T> {
    fn clone(&self) -> Self {
        Self { queue: Arc::clone(&self.queue) }
    }
}

impl<T> StreamReader<T> {
    /// True if a message is waiting.
    pub fn has_pending(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// Take all waiting messages.
    pub fn drain(&self) -> Vec<MultiSet<T>> {
        self.queue.lock().unwrap().drain(..).collect()
    }
}

/// Root input of a dataflow graph.
pub struct InputWriter<T> {
    writer: StreamWriter<T>,
}

impl<T> Clone for InputWriter<T> {
    fn clone(&self) -> Self {
        Self { writer: self.writer.clone() }
    }
}

impl<T: Data> InputWriter<T> {
    /// Push a batch of deltas into the graph. The graph is not run; callers
    /// decide when to run to fixed point.
    pub fn send(&self, deltas: MultiSet<T>) {
        self.writer.send(deltas);
    }
}

/// Typed handle to a point in the dataflow graph under construction.
pub struct DiffStream<T> {
    graph: GraphBuilder,
    writer: StreamWriter<T>,
}

impl<T> Clone for DiffStream<T> {
    fn clone(&self) -> Self {
        Self { graph: self.graph.clone(), writer: self.writer.clone() }
    }
}

impl GraphBuilder {
    /// Create a root input stream on this graph.
    pub fn new_input<T: Data>(&self) -> (InputWriter<T>, DiffStream<T>) {
        let writer = StreamWriter::new();
        (
            InputWriter { writer: writer.clone() },
            DiffStream { graph: self.clone(), writer },
        )
    }
}

impl<T: Data + ContentHash> DiffStream<T> {
    /// The graph this stream belongs to.
    pub fn graph(&self) -> &GraphBuilder {
        &self.graph
    }

    fn derived<O: Data>(&self) -> (StreamWriter<O>, DiffStream<O>) {
        let writer = StreamWriter::new();
        (writer.clone(), DiffStream { graph: self.graph.clone(), writer })
    }

    /// Transform each element; multiplicities are preserved.
    pub fn map<O, F>(&self, f: F) -> DiffStream<O>
    where
        O: Data + ContentHash,
        F: Fn(&T) -> O + Send + Sync + 'static,
    {
        let (writer, next) = self.derived::<O>();
        let id = self.graph.alloc_id();
        self.graph.add_operator(Box::new(MapOperator::new(id, self.writer.reader(), writer, f)));
        next
    }

    /// Drop elements whose value fails the predicate.
    pub fn filter<P>(&self, p: P) -> DiffStream<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (writer, next) = self.derived::<T>();
        let id = self.graph.alloc_id();
        self.graph.add_operator(Box::new(FilterOperator::new(id, self.writer.reader(), writer, p)));
        next
    }

    /// Observe each delta batch without perturbing the stream. The compiler
    /// uses taps to install lazy-load probes on the active side of a join.
    pub fn tap<F>(&self, f: F) -> DiffStream<T>
    where
        F: Fn(&MultiSet<T>) + Send + Sync + 'static,
    {
        let (writer, next) = self.derived::<T>();
        let id = self.graph.alloc_id();
        self.graph.add_operator(Box::new(TapOperator::new(id, self.writer.reader(), writer, f)));
        next
    }

    /// Merge accumulated deltas, emitting one net entry per value per tick.
    pub fn consolidate(&self) -> DiffStream<T> {
        let (writer, next) = self.derived::<T>();
        let id = self.graph.alloc_id();
        self.graph.add_operator(Box::new(ConsolidateOperator::new(id, self.writer.reader(), writer)));
        next
    }
}

impl<K, V> DiffStream<(K, V)>
where
    K: IndexKey + ContentHash,
    V: Data + ContentHash,
{
    /// Keyed join against `other`. Output carries `None` slots for the
    /// outer kinds and is pre-consolidation; follow with
    /// [`DiffStream::consolidate`].
    #[allow(clippy::type_complexity)]
    pub fn join<V2>(
        &self,
        other: &DiffStream<(K, V2)>,
        kind: JoinKind,
    ) -> DiffStream<(K, (Option<V>, Option<V2>))>
    where
        V2: Data + ContentHash,
    {
        let (writer, next) = self.derived::<(K, (Option<V>, Option<V2>))>();
        let id = self.graph.alloc_id();
        self.graph.add_operator(Box::new(JoinOperator::new(
            id,
            kind,
            self.writer.reader(),
            other.writer.reader(),
            writer,
        )));
        next
    }

    /// Group by key and fold the per-key `(value, multiplicity)` list into
    /// output rows. The fold is re-applied to affected keys only; the
    /// operator emits retractions for previously emitted rows.
    pub fn reduce<R, F>(&self, fold: F) -> DiffStream<(K, R)>
    where
        R: Data + ContentHash,
        F: Fn(&[(V, isize)]) -> Vec<(R, isize)> + Send + Sync + 'static,
    {
        let (writer, next) = self.derived::<(K, R)>();
        let id = self.graph.alloc_id();
        self.graph.add_operator(Box::new(ReduceOperator::new(id, self.writer.reader(), writer, fold)));
        next
    }

    /// Maintain the ordered window `[offset, offset+limit)` of the stream,
    /// assigning each emitted value a fractional index string.
    pub fn order_by_with_fractional_index(
        &self,
        options: OrderByOptions<V>,
    ) -> DiffStream<(K, (V, String))> {
        let (writer, next) = self.derived::<(K, (V, String))>();
        let id = self.graph.alloc_id();
        self.graph.add_operator(Box::new(OrderByOperator::new(id, self.writer.reader(), writer, options)));
        next
    }

    /// Terminal sink: accumulate per-key deltas into insert/update/delete
    /// events and hand each non-empty batch to `sink`.
    pub fn output<F>(&self, sink: F)
    where
        F: Fn(Vec<OutputEvent<K, V>>) + Send + Sync + 'static,
    {
        let id = self.graph.alloc_id();
        self.graph.add_operator(Box::new(OutputOperator::new(id, self.writer.reader(), sink)));
    }
}
