//! The consolidate operator: net out accumulated deltas per tick.

use crate::graph::{Operator, OperatorId};
use crate::multiset::MultiSet;
use crate::stream::{StreamReader, StreamWriter};
use crate::value::{ContentHash, Data};

/// Merges all deltas available at a tick into one multiset, sums
/// multiplicities per value, and drops zeros. The only operator that
/// collapses duplicate entries.
pub struct ConsolidateOperator<T> {
    id: OperatorId,
    input: StreamReader<T>,
    output: StreamWriter<T>,
}

impl<T> ConsolidateOperator<T> {
    pub(crate) fn new(id: OperatorId, input: StreamReader<T>, output: StreamWriter<T>) -> Self {
        Self { id, input, output }
    }
}

impl<T: Data + ContentHash> Operator for ConsolidateOperator<T> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn pending_work(&self) -> bool {
        self.input.has_pending()
    }

    fn run(&mut self) {
        let mut merged = MultiSet::new();
        for message in self.input.drain() {
            merged.extend(message);
        }
        let net = merged.consolidate();
        if !net.is_empty() {
            self.output.send(net);
        }
    }
}
