//! Size-accounted buffering shared by one controller and any number of consumers.
//!
//! A [`Queue`] never stores entries itself. Every push is fanned out to the
//! attached consumers, each of which keeps its own FIFO buffer and its own
//! FIFO of unmet read requests. That is what lets a tee branch fall behind its
//! sibling without losing data.
//!
//! Listener notifications are always delivered with no `RefCell` borrow held,
//! so the listener may freely drop the consumer or call back into the queue.

use super::{
    ReadResult, StreamResult,
    error::StreamError,
    gc::{GcTraced, GcVisitor},
};
use crate::platform::Promise;
use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};
use tracing::trace;

/// Entry and read-request semantics for one flavour of queue.
pub trait QueueKind: Sized + 'static {
    type Entry: Clone + 'static;
    type ReadRequest: 'static;
    type Value: Clone + 'static;

    fn entry_size(entry: &Self::Entry) -> usize;

    /// A read that takes whatever is available next.
    fn default_read(
        auto_allocate_chunk_size: usize,
    ) -> (Self::ReadRequest, Promise<ReadResult<Self::Value>>);

    /// Satisfy pending requests from buffered entries, front to front.
    fn fill_requests(buffer: &mut ConsumerBuffer<Self>);

    /// Settle a request that can never see more data.
    fn close_request(request: Self::ReadRequest);

    fn error_request(request: Self::ReadRequest, reason: &StreamError);

    fn is_partially_fulfilled(request: &Self::ReadRequest) -> bool {
        let _ = request;
        false
    }
}

/// Callbacks a consumer makes to whoever owns it.
pub trait StateListener {
    fn on_consumer_close(&self);
    fn on_consumer_error(&self, reason: StreamError);
    fn on_consumer_wants_data(&self);
}

pub struct ConsumerBuffer<K: QueueKind> {
    pub(crate) entries: VecDeque<K::Entry>,
    pub(crate) size: usize,
    pub(crate) requests: VecDeque<K::ReadRequest>,
}

impl<K: QueueKind> ConsumerBuffer<K> {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            requests: VecDeque::new(),
        }
    }

    pub(crate) fn push_entry(&mut self, entry: K::Entry) {
        self.size += K::entry_size(&entry);
        self.entries.push_back(entry);
    }

    pub(crate) fn pop_entry(&mut self) -> Option<K::Entry> {
        let entry = self.entries.pop_front()?;
        self.size -= K::entry_size(&entry);
        Some(entry)
    }

    fn clear_entries(&mut self) {
        self.entries.clear();
        self.size = 0;
    }
}

enum QueueState {
    Open,
    Closed,
    Errored,
}

struct QueueImpl<K: QueueKind> {
    high_water_mark: usize,
    state: QueueState,
    consumers: Vec<(usize, Weak<RefCell<ConsumerImpl<K>>>)>,
    next_consumer_id: usize,
}

impl<K: QueueKind> QueueImpl<K> {
    fn live_consumers(&self) -> Vec<ConsumerHandle<K>> {
        self.consumers
            .iter()
            .filter_map(|(_, weak)| weak.upgrade().map(ConsumerHandle))
            .collect()
    }
}

pub struct Queue<K: QueueKind> {
    inner: Rc<RefCell<QueueImpl<K>>>,
}

impl<K: QueueKind> Clone for Queue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: QueueKind> Queue<K> {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(QueueImpl {
                high_water_mark,
                state: QueueState::Open,
                consumers: Vec::new(),
                next_consumer_id: 0,
            })),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.borrow().state, QueueState::Open)
    }

    /// Fan an entry out to every attached consumer.
    pub fn push(&self, entry: K::Entry) -> StreamResult<()> {
        let consumers = {
            let inner = self.inner.borrow();
            if !matches!(inner.state, QueueState::Open) {
                return Err(StreamError::type_error("This ReadableStream is closed."));
            }
            inner.live_consumers()
        };
        if let Some((last, rest)) = consumers.split_last() {
            for consumer in rest {
                consumer.push(entry.clone());
            }
            last.push(entry);
        }
        Ok(())
    }

    /// Push to every consumer except `skip`, used when a BYOB response already
    /// landed in one consumer's buffer.
    pub(crate) fn push_except(&self, skip: usize, entry: K::Entry) {
        let consumers = self.inner.borrow().live_consumers();
        for consumer in consumers.iter().filter(|c| c.id() != skip) {
            consumer.push(entry.clone());
        }
    }

    pub fn close(&self) {
        let consumers = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, QueueState::Open) {
                return;
            }
            inner.state = QueueState::Closed;
            inner.live_consumers()
        };
        trace!(consumers = consumers.len(), "queue closed");
        for consumer in consumers {
            consumer.close();
        }
    }

    pub fn error(&self, reason: StreamError) {
        let consumers = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, QueueState::Open) {
                return;
            }
            inner.state = QueueState::Errored;
            inner.live_consumers()
        };
        trace!(consumers = consumers.len(), %reason, "queue errored");
        for consumer in consumers {
            consumer.error(reason.clone());
        }
    }

    /// Size of the largest consumer backlog.
    pub fn size(&self) -> usize {
        self.inner
            .borrow()
            .live_consumers()
            .iter()
            .map(ConsumerHandle::size)
            .max()
            .unwrap_or(0)
    }

    pub fn desired_size(&self) -> isize {
        let high_water_mark = self.inner.borrow().high_water_mark;
        high_water_mark as isize - self.size() as isize
    }

    pub fn wants_read(&self) -> bool {
        self.inner
            .borrow()
            .live_consumers()
            .iter()
            .any(ConsumerHandle::has_read_requests)
    }

    pub fn consumer_count(&self) -> usize {
        self.inner
            .borrow()
            .consumers
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn has_partially_fulfilled_read(&self) -> bool {
        self.inner
            .borrow()
            .live_consumers()
            .iter()
            .any(ConsumerHandle::is_partially_fulfilled)
    }

    pub(crate) fn consumers(&self) -> Vec<ConsumerHandle<K>> {
        self.inner.borrow().live_consumers()
    }

    pub fn new_consumer(&self, listener: Option<Weak<dyn StateListener>>) -> Consumer<K> {
        let consumer = ConsumerImpl {
            id: 0,
            state: ConsumerState::Ready,
            buffer: ConsumerBuffer::new(),
            listener,
        };
        self.register(consumer)
    }

    fn register(&self, mut consumer: ConsumerImpl<K>) -> Consumer<K> {
        let mut inner = self.inner.borrow_mut();
        consumer.id = inner.next_consumer_id;
        inner.next_consumer_id += 1;
        let handle = ConsumerHandle(Rc::new(RefCell::new(consumer)));
        inner
            .consumers
            .push((handle.id(), Rc::downgrade(&handle.0)));
        Consumer {
            handle,
            queue: self.clone(),
        }
    }

    fn remove(&self, id: usize) {
        self.inner
            .borrow_mut()
            .consumers
            .retain(|(consumer_id, weak)| *consumer_id != id && weak.strong_count() > 0);
    }
}

impl<K: QueueKind> GcTraced for Queue<K> {
    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        for consumer in self.consumers() {
            consumer.visit_for_gc(visitor);
        }
    }
}

#[derive(Clone)]
enum ConsumerState {
    Ready,
    /// Closed upstream, still draining buffered entries.
    Closing,
    Closed,
    Errored(StreamError),
}

pub(crate) struct ConsumerImpl<K: QueueKind> {
    id: usize,
    state: ConsumerState,
    buffer: ConsumerBuffer<K>,
    listener: Option<Weak<dyn StateListener>>,
}

enum Notify {
    Nothing,
    WantsData,
    Close,
}

/// Shared access to a consumer's state. Cloning does not register a new consumer.
pub(crate) struct ConsumerHandle<K: QueueKind>(Rc<RefCell<ConsumerImpl<K>>>);

impl<K: QueueKind> Clone for ConsumerHandle<K> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<K: QueueKind> ConsumerHandle<K> {
    pub(crate) fn id(&self) -> usize {
        self.0.borrow().id
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<ConsumerImpl<K>>> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<RefCell<ConsumerImpl<K>>>) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    fn listener(&self) -> Option<Rc<dyn StateListener>> {
        self.0.borrow().listener.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn size(&self) -> usize {
        self.0.borrow().buffer.size
    }

    pub(crate) fn has_read_requests(&self) -> bool {
        !self.0.borrow().buffer.requests.is_empty()
    }

    pub(crate) fn is_partially_fulfilled(&self) -> bool {
        self.0
            .borrow()
            .buffer
            .requests
            .front()
            .is_some_and(K::is_partially_fulfilled)
    }

    pub(crate) fn with_buffer<R>(&self, f: impl FnOnce(&mut ConsumerBuffer<K>) -> R) -> R {
        f(&mut self.0.borrow_mut().buffer)
    }

    fn push(&self, entry: K::Entry) {
        let mut consumer = self.0.borrow_mut();
        if matches!(consumer.state, ConsumerState::Ready) {
            consumer.buffer.push_entry(entry);
            K::fill_requests(&mut consumer.buffer);
        }
    }

    pub(crate) fn read(&self, request: K::ReadRequest) {
        let notify = {
            let mut consumer = self.0.borrow_mut();
            match consumer.state.clone() {
                ConsumerState::Closed => {
                    K::close_request(request);
                    Notify::Nothing
                }
                ConsumerState::Errored(reason) => {
                    K::error_request(request, &reason);
                    Notify::Nothing
                }
                ConsumerState::Ready => {
                    consumer.buffer.requests.push_back(request);
                    K::fill_requests(&mut consumer.buffer);
                    if consumer.buffer.requests.is_empty() {
                        Notify::Nothing
                    } else {
                        Notify::WantsData
                    }
                }
                ConsumerState::Closing => {
                    consumer.buffer.requests.push_back(request);
                    K::fill_requests(&mut consumer.buffer);
                    if consumer.buffer.entries.is_empty() {
                        consumer.state = ConsumerState::Closed;
                        while let Some(pending) = consumer.buffer.requests.pop_front() {
                            K::close_request(pending);
                        }
                        Notify::Close
                    } else {
                        Notify::Nothing
                    }
                }
            }
        };
        match notify {
            Notify::Nothing => {}
            Notify::WantsData => {
                if let Some(listener) = self.listener() {
                    listener.on_consumer_wants_data();
                }
            }
            Notify::Close => {
                trace!("consumer drained after close");
                if let Some(listener) = self.listener() {
                    listener.on_consumer_close();
                }
            }
        }
    }

    fn close(&self) {
        let closed = {
            let mut consumer = self.0.borrow_mut();
            match consumer.state {
                ConsumerState::Ready if consumer.buffer.entries.is_empty() => {
                    consumer.state = ConsumerState::Closed;
                    while let Some(pending) = consumer.buffer.requests.pop_front() {
                        K::close_request(pending);
                    }
                    true
                }
                ConsumerState::Ready => {
                    consumer.state = ConsumerState::Closing;
                    false
                }
                _ => false,
            }
        };
        if closed {
            if let Some(listener) = self.listener() {
                listener.on_consumer_close();
            }
        }
    }

    fn error(&self, reason: StreamError) {
        let errored = {
            let mut consumer = self.0.borrow_mut();
            match consumer.state {
                ConsumerState::Ready | ConsumerState::Closing => {
                    consumer.state = ConsumerState::Errored(reason.clone());
                    consumer.buffer.clear_entries();
                    while let Some(pending) = consumer.buffer.requests.pop_front() {
                        K::error_request(pending, &reason);
                    }
                    true
                }
                _ => false,
            }
        };
        if errored {
            if let Some(listener) = self.listener() {
                listener.on_consumer_error(reason);
            }
        }
    }

    /// Stop consuming. Pending reads settle as done and nobody is notified:
    /// whoever cancels already knows.
    pub(crate) fn cancel(&self) {
        let mut consumer = self.0.borrow_mut();
        if matches!(
            consumer.state,
            ConsumerState::Ready | ConsumerState::Closing
        ) {
            consumer.state = ConsumerState::Closed;
            consumer.buffer.clear_entries();
            while let Some(pending) = consumer.buffer.requests.pop_front() {
                K::close_request(pending);
            }
        }
    }

    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        let consumer = self.0.borrow();
        if let ConsumerState::Errored(reason) = &consumer.state {
            visitor.visit_error(reason);
        }
        for entry in &consumer.buffer.entries {
            visitor.visit_entry(K::entry_size(entry));
        }
        for _ in &consumer.buffer.requests {
            visitor.visit_pending("read request");
        }
    }
}

/// A registered consumer. Dropping it detaches it from the queue.
pub struct Consumer<K: QueueKind> {
    handle: ConsumerHandle<K>,
    queue: Queue<K>,
}

impl<K: QueueKind> Consumer<K> {
    pub(crate) fn handle(&self) -> ConsumerHandle<K> {
        self.handle.clone()
    }

    pub(crate) fn queue(&self) -> &Queue<K> {
        &self.queue
    }

    pub fn read(&self, request: K::ReadRequest) {
        self.handle.read(request);
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn size(&self) -> usize {
        self.handle.size()
    }

    pub fn has_read_requests(&self) -> bool {
        self.handle.has_read_requests()
    }

    /// Register a new consumer that starts with a copy of this one's state and
    /// buffered entries. Pending read requests are not copied.
    pub fn clone_with(&self, listener: Option<Weak<dyn StateListener>>) -> Consumer<K> {
        let copy = {
            let source = self.handle.0.borrow();
            let mut buffer = ConsumerBuffer::new();
            for entry in &source.buffer.entries {
                buffer.push_entry(entry.clone());
            }
            ConsumerImpl {
                id: 0,
                state: source.state.clone(),
                buffer,
                listener,
            }
        };
        self.queue.register(copy)
    }

    pub fn set_listener(&self, listener: Option<Weak<dyn StateListener>>) {
        self.handle.0.borrow_mut().listener = listener;
    }
}

impl<K: QueueKind> Drop for Consumer<K> {
    fn drop(&mut self) {
        let id = self.handle.0.borrow().id;
        self.queue.remove(id);
    }
}

impl<K: QueueKind> GcTraced for Consumer<K> {
    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        self.handle.visit_for_gc(visitor);
    }
}
