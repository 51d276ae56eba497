pub mod bulk;
pub mod byte_queue;
pub mod error;
pub mod gc;
pub mod lock;
pub mod pipe;
#[doc(hidden)]
pub mod queue;
pub mod readable;
pub mod transform;
pub mod value_queue;
pub mod writable;

#[cfg(test)]
pub(crate) mod test_util;

pub use bulk::*;
pub use byte_queue::ByobReadOptions;
pub use error::*;
pub use gc::*;
pub use pipe::*;
pub use readable::*;
pub use transform::*;
pub use writable::*;

use bytes::Bytes;
use queue::QueueKind;

pub type StreamResult<T> = Result<T, StreamError>;

/// Outcome of a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult<T> {
    pub value: Option<T>,
    pub done: bool,
}

impl<T> ReadResult<T> {
    pub fn value(value: T) -> Self {
        Self {
            value: Some(value),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            value: None,
            done: true,
        }
    }
}

/// Type-level marker for streams of arbitrary values
pub struct DefaultStream;
/// Type-level marker for byte-oriented streams supporting BYOB reads
pub struct ByteStream;

/// Selects the queue implementation backing a `ReadableStream<T, Marker>`.
pub trait StreamTypeMarker<T>: 'static {
    #[doc(hidden)]
    type Queue: QueueKind<Value = T>;
}

impl<T: Clone + 'static> StreamTypeMarker<T> for DefaultStream {
    type Queue = value_queue::ValueQueue<T>;
}

impl StreamTypeMarker<Bytes> for ByteStream {
    type Queue = byte_queue::ByteQueue;
}

/// Generic queuing strategy trait
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk. A failure errors the stream.
    fn size(&self, chunk: &T) -> StreamResult<usize>;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> usize;
}

/// Count-based strategy
#[derive(Clone, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: usize,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<usize> {
        Ok(1)
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Byte length strategy for chunk types that expose their bytes
#[derive(Clone, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: usize,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl<T: AsRef<[u8]>> QueuingStrategy<T> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &T) -> StreamResult<usize> {
        Ok(chunk.as_ref().len())
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Strategy built from a closure, for sizes that can fail.
pub struct SizeFnStrategy<F> {
    size: F,
    high_water_mark: usize,
}

impl<F> SizeFnStrategy<F> {
    pub fn new(high_water_mark: usize, size: F) -> Self {
        Self {
            size,
            high_water_mark,
        }
    }
}

impl<T, F> QueuingStrategy<T> for SizeFnStrategy<F>
where
    F: Fn(&T) -> StreamResult<usize>,
{
    fn size(&self, chunk: &T) -> StreamResult<usize> {
        (self.size)(chunk)
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}
