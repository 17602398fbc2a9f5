//! Stateless, element-wise operators: `map`, `filter`, and `tap`.

use crate::graph::{Operator, OperatorId};
use crate::multiset::MultiSet;
use crate::stream::{StreamReader, StreamWriter};
use crate::value::Data;

/// Applies a function to every element, preserving multiplicities.
pub struct MapOperator<I, O, F> {
    id: OperatorId,
    input: StreamReader<I>,
    output: StreamWriter<O>,
    f: F,
}

impl<I, O, F> MapOperator<I, O, F> {
    pub(crate) fn new(id: OperatorId, input: StreamReader<I>, output: StreamWriter<O>, f: F) -> Self {
        Self { id, input, output, f }
    }
}

impl<I, O, F> Operator for MapOperator<I, O, F>
where
    I: Data,
    O: Data,
    F: Fn(&I) -> O + Send + Sync + 'static,
{
    fn id(&self) -> OperatorId {
        self.id
    }

    fn pending_work(&self) -> bool {
        self.input.has_pending()
    }

    fn run(&mut self) {
        for message in self.input.drain() {
            self.output.send(message.map(&self.f));
        }
    }
}

/// Drops elements whose value fails the predicate.
pub struct FilterOperator<T, P> {
    id: OperatorId,
    input: StreamReader<T>,
    output: StreamWriter<T>,
    predicate: P,
}

impl<T, P> FilterOperator<T, P> {
    pub(crate) fn new(id: OperatorId, input: StreamReader<T>, output: StreamWriter<T>, predicate: P) -> Self {
        Self { id, input, output, predicate }
    }
}

impl<T, P> Operator for FilterOperator<T, P>
where
    T: Data,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn id(&self) -> OperatorId {
        self.id
    }

    fn pending_work(&self) -> bool {
        self.input.has_pending()
    }

    fn run(&mut self) {
        for message in self.input.drain() {
            self.output.send(message.filter(&self.predicate));
        }
    }
}

/// Side-effecting identity: observes each delta batch, then forwards it.
pub struct TapOperator<T, F> {
    id: OperatorId,
    input: StreamReader<T>,
    output: StreamWriter<T>,
    observer: F,
}

impl<T, F> TapOperator<T, F> {
    pub(crate) fn new(id: OperatorId, input: StreamReader<T>, output: StreamWriter<T>, observer: F) -> Self {
        Self { id, input, output, observer }
    }
}

impl<T, F> Operator for TapOperator<T, F>
where
    T: Data,
    F: Fn(&MultiSet<T>) + Send + Sync + 'static,
{
    fn id(&self) -> OperatorId {
        self.id
    }

    fn pending_work(&self) -> bool {
        self.input.has_pending()
    }

    fn run(&mut self) {
        for message in self.input.drain() {
            (self.observer)(&message);
            self.output.send(message);
        }
    }
}
