//! Queue of arbitrary values, each carrying the size its strategy assigned.

use super::{
    ReadResult,
    error::StreamError,
    queue::{ConsumerBuffer, QueueKind},
};
use crate::platform::{Promise, Resolver, promise};
use std::marker::PhantomData;

pub struct ValueQueue<T>(PhantomData<fn() -> T>);

#[derive(Clone, Debug)]
pub struct ValueEntry<T> {
    value: T,
    size: usize,
}

impl<T> ValueEntry<T> {
    pub fn new(value: T, size: usize) -> Self {
        Self { value, size }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T: Clone + 'static> QueueKind for ValueQueue<T> {
    type Entry = ValueEntry<T>;
    type ReadRequest = Resolver<ReadResult<T>>;
    type Value = T;

    fn entry_size(entry: &Self::Entry) -> usize {
        entry.size
    }

    fn default_read(_auto_allocate_chunk_size: usize) -> (Self::ReadRequest, Promise<ReadResult<T>>) {
        promise()
    }

    fn fill_requests(buffer: &mut ConsumerBuffer<Self>) {
        while !buffer.requests.is_empty() {
            let Some(entry) = buffer.pop_entry() else {
                break;
            };
            if let Some(request) = buffer.requests.pop_front() {
                request.resolve(ReadResult::value(entry.into_value()));
            }
        }
    }

    fn close_request(request: Self::ReadRequest) {
        request.resolve(ReadResult::done());
    }

    fn error_request(request: Self::ReadRequest, reason: &StreamError) {
        request.reject(reason.clone());
    }
}
