//! Byte queue with support for caller-supplied (BYOB) read buffers.
//!
//! Every read, default or BYOB, is a [`ByteReadRequest`] with a destination
//! buffer. Buffered chunks are copied into the front request until it holds at
//! least `at_least` whole elements or is full. Leftover bytes of a chunk stay
//! at the front of the consumer's buffer.

use super::{
    ReadResult, StreamResult,
    error::StreamError,
    queue::{ConsumerBuffer, ConsumerHandle, ConsumerImpl, Queue, QueueKind},
};
use crate::platform::{Promise, Resolver, promise};
use bytes::{Buf, Bytes, BytesMut};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

pub struct ByteQueue;

/// Options for a BYOB read.
#[derive(Debug, Clone, Copy)]
pub struct ByobReadOptions {
    /// Minimum number of bytes before the read resolves. Defaults to one element.
    pub at_least: Option<usize>,
    /// Bytes per element of the view. Only whole elements are delivered.
    pub element_size: usize,
}

impl Default for ByobReadOptions {
    fn default() -> Self {
        Self {
            at_least: None,
            element_size: 1,
        }
    }
}

impl ByobReadOptions {
    pub fn at_least(at_least: usize) -> Self {
        Self {
            at_least: Some(at_least),
            ..Self::default()
        }
    }

    /// Effective minimum fill, rounded down to whole elements and never below one.
    pub(crate) fn min_fill(&self) -> usize {
        let element_size = self.element_size.max(1);
        let at_least = element_size.max(self.at_least.unwrap_or(1));
        (at_least - at_least % element_size).max(1)
    }
}

enum ByteResolver {
    Default(Resolver<ReadResult<Bytes>>),
    Byob(Resolver<ReadResult<BytesMut>>),
}

pub struct ByteReadRequest {
    resolver: Option<ByteResolver>,
    buffer: BytesMut,
    filled: usize,
    at_least: usize,
    element_size: usize,
}

pub type SharedByteRequest = Rc<RefCell<ByteReadRequest>>;

impl ByteReadRequest {
    pub(crate) fn byob(
        buffer: BytesMut,
        options: &ByobReadOptions,
    ) -> (SharedByteRequest, Promise<ReadResult<BytesMut>>) {
        let (resolver, promise) = promise();
        let request = Self {
            resolver: Some(ByteResolver::Byob(resolver)),
            buffer,
            filled: 0,
            at_least: options.min_fill(),
            element_size: options.element_size.max(1),
        };
        (Rc::new(RefCell::new(request)), promise)
    }

    fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.filled)
    }

    fn usable(&self) -> usize {
        self.filled - self.filled % self.element_size
    }

    fn is_satisfied(&self) -> bool {
        self.usable() >= self.at_least || self.remaining() == 0
    }

    fn is_settled(&self) -> bool {
        self.resolver.is_none()
    }

    /// Deliver the whole elements written so far. Returns the trailing partial
    /// element, which belongs back in the consumer's buffer.
    fn fulfill(&mut self) -> Option<Bytes> {
        let resolver = self.resolver.take()?;
        let usable = self.usable();
        let mut out = std::mem::take(&mut self.buffer);
        let remainder = (self.filled > usable)
            .then(|| Bytes::copy_from_slice(&out[usable..self.filled]));
        out.truncate(usable);
        self.filled = 0;
        match resolver {
            ByteResolver::Default(resolver) => resolver.resolve(ReadResult::value(out.freeze())),
            ByteResolver::Byob(resolver) => resolver.resolve(ReadResult::value(out)),
        }
        remainder
    }

    fn finish_closed(&mut self) {
        let Some(resolver) = self.resolver.take() else {
            return;
        };
        let mut out = std::mem::take(&mut self.buffer);
        let filled = std::mem::take(&mut self.filled);
        match resolver {
            ByteResolver::Default(resolver) if filled > 0 => {
                out.truncate(filled);
                resolver.resolve(ReadResult::value(out.freeze()));
            }
            ByteResolver::Default(resolver) => resolver.resolve(ReadResult::done()),
            ByteResolver::Byob(resolver) => {
                out.truncate(filled);
                resolver.resolve(ReadResult {
                    value: Some(out),
                    done: true,
                });
            }
        }
    }

    fn finish_errored(&mut self, reason: &StreamError) {
        match self.resolver.take() {
            Some(ByteResolver::Default(resolver)) => resolver.reject(reason.clone()),
            Some(ByteResolver::Byob(resolver)) => resolver.reject(reason.clone()),
            None => {}
        }
    }
}

impl QueueKind for ByteQueue {
    type Entry = Bytes;
    type ReadRequest = SharedByteRequest;
    type Value = Bytes;

    fn entry_size(entry: &Bytes) -> usize {
        entry.len()
    }

    fn default_read(auto_allocate_chunk_size: usize) -> (SharedByteRequest, Promise<ReadResult<Bytes>>) {
        let (resolver, promise) = promise();
        let request = ByteReadRequest {
            resolver: Some(ByteResolver::Default(resolver)),
            buffer: BytesMut::zeroed(auto_allocate_chunk_size),
            filled: 0,
            at_least: 1,
            element_size: 1,
        };
        (Rc::new(RefCell::new(request)), promise)
    }

    fn fill_requests(buffer: &mut ConsumerBuffer<Self>) {
        while let Some(request) = buffer.requests.front().cloned() {
            let mut request = request.borrow_mut();
            if request.is_settled() {
                drop(request);
                buffer.requests.pop_front();
                continue;
            }
            let Some(chunk) = buffer.entries.front_mut() else {
                break;
            };
            let n = chunk.len().min(request.remaining());
            let at = request.filled;
            request.buffer[at..at + n].copy_from_slice(&chunk[..n]);
            request.filled += n;
            if n == chunk.len() {
                buffer.entries.pop_front();
            } else {
                chunk.advance(n);
            }
            buffer.size -= n;

            if request.is_satisfied() {
                if let Some(remainder) = request.fulfill() {
                    buffer.size += remainder.len();
                    buffer.entries.push_front(remainder);
                }
                drop(request);
                buffer.requests.pop_front();
            }
        }
    }

    fn close_request(request: SharedByteRequest) {
        request.borrow_mut().finish_closed();
    }

    fn error_request(request: SharedByteRequest, reason: &StreamError) {
        request.borrow_mut().finish_errored(reason);
    }

    fn is_partially_fulfilled(request: &SharedByteRequest) -> bool {
        let request = request.borrow();
        !request.is_settled() && request.filled > 0
    }
}

/// The front BYOB-capable read of one consumer, as seen by the underlying source.
#[derive(Clone)]
pub(crate) struct PendingByob {
    request: SharedByteRequest,
    consumer: Weak<RefCell<ConsumerImpl<ByteQueue>>>,
    consumer_id: usize,
    queue: Queue<ByteQueue>,
}

impl Queue<ByteQueue> {
    /// The first consumer's front unsettled read, if any.
    pub(crate) fn next_pending_byob(&self) -> Option<PendingByob> {
        self.consumers().into_iter().find_map(|consumer| {
            let request = consumer.with_buffer(|buffer| buffer.requests.front().cloned())?;
            if request.borrow().is_settled() {
                return None;
            }
            Some(PendingByob {
                request,
                consumer: consumer.downgrade(),
                consumer_id: consumer.id(),
                queue: self.clone(),
            })
        })
    }
}

impl PendingByob {
    /// The request's consumer went away or the request was settled some other way.
    pub(crate) fn is_invalidated(&self) -> bool {
        self.request.borrow().is_settled() || self.consumer.strong_count() == 0
    }

    pub(crate) fn at_least(&self) -> usize {
        self.request.borrow().at_least
    }

    pub(crate) fn view_len(&self) -> usize {
        let request = self.request.borrow();
        if request.is_settled() {
            0
        } else {
            request.remaining()
        }
    }

    pub(crate) fn is_partially_fulfilled(&self) -> bool {
        ByteQueue::is_partially_fulfilled(&self.request)
    }

    pub(crate) fn with_view<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut request = self.request.borrow_mut();
        let at = request.filled;
        f(&mut request.buffer[at..])
    }

    pub(crate) fn write_view(&self, bytes: &[u8]) -> StreamResult<()> {
        if bytes.len() > self.view_len() {
            return Err(StreamError::type_error(
                "The view is larger than the remaining space of the byobRequest.",
            ));
        }
        self.with_view(|view| view[..bytes.len()].copy_from_slice(bytes));
        Ok(())
    }

    /// Copy of the bytes a source just wrote into the view.
    pub(crate) fn written(&self, bytes_written: usize) -> StreamResult<Bytes> {
        let request = self.request.borrow();
        if request.is_settled() {
            // The buffer already went back to its reader.
            return Ok(Bytes::new());
        }
        if bytes_written > request.remaining() {
            return Err(StreamError::type_error(
                "The bytesWritten exceeds the size of the byobRequest view.",
            ));
        }
        let at = request.filled;
        Ok(Bytes::copy_from_slice(&request.buffer[at..at + bytes_written]))
    }

    /// Commit `bytes_written` bytes into the view. Other consumers get a copy.
    /// Returns true when the read was fulfilled.
    pub(crate) fn respond(&self, bytes_written: usize) -> StreamResult<bool> {
        let copy = self.written(bytes_written)?;
        let (fulfilled, remainder) = {
            let mut request = self.request.borrow_mut();
            request.filled += bytes_written;
            if request.is_satisfied() {
                (true, request.fulfill())
            } else {
                (false, None)
            }
        };
        if let Some(consumer) = ConsumerHandle::upgrade(&self.consumer) {
            consumer.with_buffer(|buffer| {
                if fulfilled {
                    buffer
                        .requests
                        .retain(|pending| !Rc::ptr_eq(pending, &self.request));
                }
                if let Some(remainder) = remainder {
                    buffer.size += remainder.len();
                    buffer.entries.push_front(remainder);
                    ByteQueue::fill_requests(buffer);
                }
            });
        }
        if self.queue.consumer_count() > 1 {
            self.queue.push_except(self.consumer_id, copy);
        }
        Ok(fulfilled)
    }
}
