//! Reachability tracing through stream internals.
//!
//! A host that keeps its own object graph (a scripting runtime, a leak checker)
//! can walk everything a stream holds on to: stored error reasons, unsettled
//! resolvers, buffered entries and the consumers attached to a queue.

use super::error::StreamError;

pub trait GcVisitor {
    fn visit_error(&mut self, reason: &StreamError) {
        let _ = reason;
    }

    /// An unsettled resolver owned by the traced object.
    fn visit_pending(&mut self, what: &'static str) {
        let _ = what;
    }

    /// A buffered entry of `size` units.
    fn visit_entry(&mut self, size: usize) {
        let _ = size;
    }
}

pub trait GcTraced {
    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor);
}

impl<T: GcTraced> GcTraced for Option<T> {
    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        if let Some(inner) = self {
            inner.visit_for_gc(visitor);
        }
    }
}

/// Tallies what a trace saw. Handy for asserting nothing is left dangling.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcCounter {
    pub errors: usize,
    pub pending: usize,
    pub entries: usize,
    pub buffered: usize,
}

impl GcCounter {
    pub fn trace(target: &dyn GcTraced) -> Self {
        let mut counter = Self::default();
        target.visit_for_gc(&mut counter);
        counter
    }
}

impl GcVisitor for GcCounter {
    fn visit_error(&mut self, _reason: &StreamError) {
        self.errors += 1;
    }

    fn visit_pending(&mut self, _what: &'static str) {
        self.pending += 1;
    }

    fn visit_entry(&mut self, size: usize) {
        self.entries += 1;
        self.buffered += size;
    }
}
