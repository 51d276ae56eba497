//! Readable streams.
//!
//! Three layers cooperate here:
//!
//! - [`ReadableController`] owns the queue and the underlying source, and
//!   decides when to pull.
//! - [`Readable`] binds one queue consumer to whoever currently owns it: a
//!   stream, a bulk reader, a pump loop. It is the consumer's state listener.
//! - [`ReadableStream`] is the user-facing handle with its lock and its
//!   `disturbed` flag.
//!
//! No layer holds a `RefCell` borrow while calling into another.

use super::{
    ByteStream, DefaultStream, QueuingStrategy, ReadResult, StreamResult, StreamTypeMarker,
    byte_queue::{ByobReadOptions, ByteQueue, ByteReadRequest, PendingByob},
    error::StreamError,
    gc::{GcTraced, GcVisitor},
    lock::{EndState, ReadableLock},
    queue::{Consumer, ConsumerHandle, Queue, QueueKind, StateListener},
    value_queue::{ValueEntry, ValueQueue},
};
use crate::platform::{
    ExecutionContext, Promise, Resolver, StreamFuture, maybe_run_algorithm, promise, ready_ok,
    rejected, resolved,
};
use bytes::{Bytes, BytesMut};
use futures::{
    FutureExt, Stream, StreamExt,
    future::{self, LocalBoxFuture},
};
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    marker::PhantomData,
    rc::{Rc, Weak},
};
use tracing::{debug, trace};

pub(crate) const DEFAULT_AUTO_ALLOCATE_CHUNK_SIZE: usize = 4096;
const DEFAULT_VALUE_HIGH_WATER_MARK: usize = 1;
const DEFAULT_BYTE_HIGH_WATER_MARK: usize = 0;

/// Producer of values for a [`ReadableStream`].
///
/// Every method has a no-op default. `pull` is called whenever the stream
/// wants more data and no other pull is outstanding.
pub trait ReadableSource<T: Clone + 'static>: 'static {
    fn start(&mut self, controller: ReadableStreamDefaultController<T>) -> StreamFuture<()> {
        let _ = controller;
        ready_ok()
    }

    fn pull(&mut self, controller: ReadableStreamDefaultController<T>) -> StreamFuture<()> {
        let _ = controller;
        ready_ok()
    }

    fn cancel(&mut self, reason: StreamError) -> StreamFuture<()> {
        let _ = reason;
        ready_ok()
    }
}

/// Producer of bytes for a byte stream. May answer BYOB reads in place through
/// [`ReadableByteStreamController::byob_request`].
pub trait ReadableByteSource: 'static {
    fn start(&mut self, controller: ReadableByteStreamController) -> StreamFuture<()> {
        let _ = controller;
        ready_ok()
    }

    fn pull(&mut self, controller: ReadableByteStreamController) -> StreamFuture<()> {
        let _ = controller;
        ready_ok()
    }

    fn cancel(&mut self, reason: StreamError) -> StreamFuture<()> {
        let _ = reason;
        ready_ok()
    }
}

pub(crate) trait UnderlyingSource<K: QueueKind> {
    fn start(&mut self, controller: ReadableController<K>) -> StreamFuture<()>;
    fn pull(&mut self, controller: ReadableController<K>) -> StreamFuture<()>;
    fn cancel(&mut self, reason: StreamError) -> StreamFuture<()>;
}

struct ValueSource<S>(S);

impl<T: Clone + 'static, S: ReadableSource<T>> UnderlyingSource<ValueQueue<T>> for ValueSource<S> {
    fn start(&mut self, controller: ReadableController<ValueQueue<T>>) -> StreamFuture<()> {
        self.0.start(ReadableStreamDefaultController { inner: controller })
    }

    fn pull(&mut self, controller: ReadableController<ValueQueue<T>>) -> StreamFuture<()> {
        self.0.pull(ReadableStreamDefaultController { inner: controller })
    }

    fn cancel(&mut self, reason: StreamError) -> StreamFuture<()> {
        self.0.cancel(reason)
    }
}

struct ByteSource<S>(S);

impl<S: ReadableByteSource> UnderlyingSource<ByteQueue> for ByteSource<S> {
    fn start(&mut self, controller: ReadableController<ByteQueue>) -> StreamFuture<()> {
        self.0.start(ReadableByteStreamController { inner: controller })
    }

    fn pull(&mut self, controller: ReadableController<ByteQueue>) -> StreamFuture<()> {
        self.0.pull(ReadableByteStreamController { inner: controller })
    }

    fn cancel(&mut self, reason: StreamError) -> StreamFuture<()> {
        self.0.cancel(reason)
    }
}

type SourceRef<K> = Rc<RefCell<dyn UnderlyingSource<K>>>;
type SizeRef<K> = Rc<dyn QueuingStrategy<<K as QueueKind>::Value>>;

enum ControllerState<K: QueueKind> {
    Queue(Queue<K>),
    Closed,
    Errored(StreamError),
}

struct PendingCancel {
    resolver: Option<Resolver<()>>,
    promise: Promise<()>,
}

pub(crate) struct ReadableImpl<K: QueueKind> {
    ctx: ExecutionContext,
    state: ControllerState<K>,
    source: Option<SourceRef<K>>,
    size: Option<SizeRef<K>>,
    started: bool,
    starting: bool,
    pulling: bool,
    pull_again: bool,
    pending_cancel: Option<PendingCancel>,
    byob_request: Option<ReadableStreamBYOBRequest>,
}

impl<K: QueueKind> ReadableImpl<K> {
    /// Detach the user algorithms so they are dropped once the caller releases
    /// its borrow.
    fn clear_algorithms(&mut self) -> (Option<SourceRef<K>>, Option<SizeRef<K>>) {
        (self.source.take(), self.size.take())
    }
}

/// Shared handle to a readable controller.
pub(crate) struct ReadableController<K: QueueKind>(Rc<RefCell<ReadableImpl<K>>>);

impl<K: QueueKind> Clone for ReadableController<K> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

pub(crate) struct WeakReadableController<K: QueueKind>(Weak<RefCell<ReadableImpl<K>>>);

impl<K: QueueKind> Clone for WeakReadableController<K> {
    fn clone(&self) -> Self {
        Self(Weak::clone(&self.0))
    }
}

impl<K: QueueKind> WeakReadableController<K> {
    pub(crate) fn upgrade(&self) -> Option<ReadableController<K>> {
        self.0.upgrade().map(ReadableController)
    }
}

impl<K: QueueKind> ReadableController<K> {
    fn new(
        ctx: ExecutionContext,
        source: SourceRef<K>,
        size: Option<SizeRef<K>>,
        high_water_mark: usize,
    ) -> (Self, Queue<K>) {
        let queue = Queue::new(high_water_mark);
        let controller = Self(Rc::new(RefCell::new(ReadableImpl {
            ctx,
            state: ControllerState::Queue(queue.clone()),
            source: Some(source),
            size,
            started: false,
            starting: false,
            pulling: false,
            pull_again: false,
            pending_cancel: None,
            byob_request: None,
        })));
        (controller, queue)
    }

    pub(crate) fn downgrade(&self) -> WeakReadableController<K> {
        WeakReadableController(Rc::downgrade(&self.0))
    }

    fn start(&self) {
        let (ctx, source) = {
            let mut controller = self.0.borrow_mut();
            debug_assert!(!controller.started && !controller.starting);
            controller.starting = true;
            (controller.ctx.clone(), controller.source.clone())
        };
        let handle = self.clone();
        let this = self.clone();
        maybe_run_algorithm(
            &ctx,
            source,
            move |source| source.start(handle),
            move |result| {
                {
                    let mut controller = this.0.borrow_mut();
                    controller.started = true;
                    controller.starting = false;
                }
                match result {
                    Ok(()) => this.pull_if_needed(),
                    Err(reason) => this.do_error(reason),
                }
            },
        );
    }

    fn queue(&self) -> Option<Queue<K>> {
        match &self.0.borrow().state {
            ControllerState::Queue(queue) => Some(queue.clone()),
            _ => None,
        }
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        matches!(self.0.borrow().state, ControllerState::Queue(_))
    }

    fn size_algorithm(&self) -> Option<SizeRef<K>> {
        self.0.borrow().size.clone()
    }

    pub(crate) fn should_call_pull(&self) -> bool {
        if !self.0.borrow().started {
            return false;
        }
        match self.queue() {
            Some(queue) => queue.wants_read() || queue.desired_size() > 0,
            None => false,
        }
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        !self.should_call_pull()
    }

    pub(crate) fn has_pending_read_requests(&self) -> bool {
        self.queue().is_some_and(|queue| queue.wants_read())
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        match &self.0.borrow().state {
            ControllerState::Queue(queue) => Some(queue.desired_size()),
            ControllerState::Closed => Some(0),
            ControllerState::Errored(_) => None,
        }
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.queue().map_or(0, |queue| queue.consumer_count())
    }

    pub(crate) fn pull_if_needed(&self) {
        if !self.should_call_pull() {
            return;
        }
        let (ctx, source) = {
            let mut controller = self.0.borrow_mut();
            if controller.pulling {
                controller.pull_again = true;
                return;
            }
            controller.pulling = true;
            (controller.ctx.clone(), controller.source.clone())
        };
        trace!("pulling from underlying source");
        let handle = self.clone();
        let this = self.clone();
        maybe_run_algorithm(
            &ctx,
            source,
            move |source| source.pull(handle),
            move |result| {
                let again = {
                    let mut controller = this.0.borrow_mut();
                    controller.pulling = false;
                    std::mem::take(&mut controller.pull_again)
                };
                match result {
                    Ok(()) if again => this.pull_if_needed(),
                    Ok(()) => {}
                    Err(reason) => this.do_error(reason),
                }
            },
        );
    }

    pub(crate) fn enqueue(&self, entry: K::Entry) -> StreamResult<()> {
        let queue = self
            .queue()
            .ok_or_else(|| StreamError::type_error("This ReadableStream is closed."))?;
        queue.push(entry)?;
        self.pull_if_needed();
        Ok(())
    }

    pub(crate) fn close(&self) -> StreamResult<()> {
        let queue = self
            .queue()
            .ok_or_else(|| StreamError::type_error("This ReadableStream is closed."))?;
        if queue.has_partially_fulfilled_read() {
            let reason =
                StreamError::type_error("This ReadableStream was closed with a partial read pending.");
            self.do_error(reason.clone());
            return Err(reason);
        }
        debug!("readable controller closing");
        queue.close();
        let cleared = {
            let mut controller = self.0.borrow_mut();
            controller.state = ControllerState::Closed;
            controller.clear_algorithms()
        };
        drop(cleared);
        Ok(())
    }

    pub(crate) fn do_error(&self, reason: StreamError) {
        let Some(queue) = self.queue() else {
            return;
        };
        debug!(%reason, "readable controller errored");
        queue.error(reason.clone());
        let cleared = {
            let mut controller = self.0.borrow_mut();
            controller.state = ControllerState::Errored(reason);
            controller.clear_algorithms()
        };
        drop(cleared);
    }

    /// Cancel on behalf of one consumer. The source is only canceled once the
    /// last consumer has lost interest.
    pub(crate) fn cancel(&self, reason: StreamError) -> Promise<()> {
        let queue = {
            let controller = self.0.borrow();
            match &controller.state {
                ControllerState::Closed => return resolved(()),
                ControllerState::Errored(reason) => return rejected(reason.clone()),
                ControllerState::Queue(queue) => queue.clone(),
            }
        };
        if queue.consumer_count() > 1 {
            return resolved(());
        }
        if let Some(pending) = &self.0.borrow().pending_cancel {
            return pending.promise.clone();
        }
        self.do_cancel(reason)
    }

    fn do_cancel(&self, reason: StreamError) -> Promise<()> {
        let (ctx, source, promise) = {
            let mut controller = self.0.borrow_mut();
            controller.state = ControllerState::Closed;
            let (resolver, promise) = promise();
            controller.pending_cancel = Some(PendingCancel {
                resolver: Some(resolver),
                promise: promise.clone(),
            });
            (controller.ctx.clone(), controller.source.clone(), promise)
        };
        debug!(%reason, "canceling underlying source");
        let this = self.clone();
        maybe_run_algorithm(
            &ctx,
            source,
            move |source| source.cancel(reason),
            move |result| {
                let (pending, cleared) = {
                    let mut controller = this.0.borrow_mut();
                    (controller.pending_cancel.take(), controller.clear_algorithms())
                };
                drop(cleared);
                if let Err(reason) = &result {
                    debug!(%reason, "underlying source cancel failed");
                }
                if let Some(resolver) = pending.and_then(|pending| pending.resolver) {
                    resolver.settle(result);
                }
            },
        );
        promise
    }
}

impl ReadableController<ByteQueue> {
    fn current_byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        self.0.borrow().byob_request.clone()
    }

    fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        if let Some(request) = self.current_byob_request() {
            return Some(request);
        }
        let pending = self.queue()?.next_pending_byob()?;
        let request = ReadableStreamBYOBRequest::new(pending, self.downgrade());
        self.0.borrow_mut().byob_request = Some(request.clone());
        Some(request)
    }

    fn invalidate_byob_request(&self) {
        let request = self.0.borrow_mut().byob_request.take();
        if let Some(request) = request {
            request.detach();
        }
    }
}

/// Handed to a [`ReadableSource`] to feed its stream.
pub struct ReadableStreamDefaultController<T: Clone + 'static> {
    inner: ReadableController<ValueQueue<T>>,
}

impl<T: Clone + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> ReadableStreamDefaultController<T> {
    /// Queue a chunk for every consumer. A failing size algorithm errors the
    /// stream and is returned.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        if !self.inner.can_close_or_enqueue() {
            return Err(StreamError::type_error("This ReadableStream is closed."));
        }
        let size = match self.inner.size_algorithm() {
            Some(strategy) => match strategy.size(&chunk) {
                Ok(size) => size,
                Err(reason) => {
                    self.inner.do_error(reason.clone());
                    return Err(reason);
                }
            },
            None => 1,
        };
        self.inner.enqueue(ValueEntry::new(chunk, size))
    }

    pub fn close(&self) -> StreamResult<()> {
        self.inner.close()
    }

    pub fn error(&self, reason: StreamError) {
        self.inner.do_error(reason);
    }

    /// `None` once errored, zero once closed.
    pub fn desired_size(&self) -> Option<isize> {
        self.inner.desired_size()
    }

    /// False once closed or errored.
    pub fn can_close_or_enqueue(&self) -> bool {
        self.inner.can_close_or_enqueue()
    }

    /// True when the source should hold off producing.
    pub fn has_backpressure(&self) -> bool {
        self.inner.has_backpressure()
    }

    pub fn has_pending_read_requests(&self) -> bool {
        self.inner.has_pending_read_requests()
    }

    pub(crate) fn downgrade(&self) -> WeakReadableController<ValueQueue<T>> {
        self.inner.downgrade()
    }

    pub(crate) fn from_weak(weak: &WeakReadableController<ValueQueue<T>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

/// Handed to a [`ReadableByteSource`] to feed its stream.
#[derive(Clone)]
pub struct ReadableByteStreamController {
    inner: ReadableController<ByteQueue>,
}

impl ReadableByteStreamController {
    pub fn enqueue(&self, chunk: Bytes) -> StreamResult<()> {
        if chunk.is_empty() {
            return Err(StreamError::type_error("Cannot enqueue a zero-length ArrayBuffer."));
        }
        if !self.inner.can_close_or_enqueue() {
            return Err(StreamError::type_error("This ReadableByteStreamController is closed."));
        }
        if self.inner.current_byob_request().is_some() {
            self.inner.invalidate_byob_request();
        }
        self.inner.enqueue(chunk)
    }

    pub fn close(&self) -> StreamResult<()> {
        if let Some(request) = self.inner.current_byob_request() {
            if request.is_partially_fulfilled() {
                return Err(StreamError::type_error(
                    "This ReadableStream was closed with a partial read pending.",
                ));
            }
        }
        self.inner.close()
    }

    pub fn error(&self, reason: StreamError) {
        self.inner.do_error(reason);
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.inner.desired_size()
    }

    pub fn can_close_or_enqueue(&self) -> bool {
        self.inner.can_close_or_enqueue()
    }

    pub fn has_backpressure(&self) -> bool {
        self.inner.has_backpressure()
    }

    pub fn has_pending_read_requests(&self) -> bool {
        self.inner.has_pending_read_requests()
    }

    /// The oldest unmet read, exposed for in-place filling. `None` when no
    /// consumer is waiting.
    pub fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        self.inner.byob_request()
    }
}

struct ByobState {
    pending: PendingByob,
    controller: WeakReadableController<ByteQueue>,
}

/// A pending read whose buffer the source may write into directly.
///
/// Handles are invalidated once the read is fulfilled, the controller
/// enqueues a chunk, or the stream is canceled.
#[derive(Clone)]
pub struct ReadableStreamBYOBRequest {
    inner: Rc<RefCell<Option<ByobState>>>,
}

fn invalidated() -> StreamError {
    StreamError::type_error("This ReadableStreamBYOBRequest has been invalidated.")
}

impl ReadableStreamBYOBRequest {
    fn new(pending: PendingByob, controller: WeakReadableController<ByteQueue>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Some(ByobState {
                pending,
                controller,
            }))),
        }
    }

    fn detach(&self) {
        self.inner.borrow_mut().take();
    }

    fn state(&self) -> StreamResult<(PendingByob, ReadableController<ByteQueue>)> {
        let state = self.inner.borrow();
        let state = state.as_ref().ok_or_else(invalidated)?;
        let controller = state.controller.upgrade().ok_or_else(invalidated)?;
        Ok((state.pending.clone(), controller))
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.borrow().is_none()
    }

    /// Minimum bytes the read still wants before it resolves.
    pub fn at_least(&self) -> Option<usize> {
        self.inner.borrow().as_ref().map(|state| state.pending.at_least())
    }

    /// Writable space left in the view.
    pub fn view_len(&self) -> Option<usize> {
        self.inner.borrow().as_ref().map(|state| state.pending.view_len())
    }

    pub fn is_partially_fulfilled(&self) -> bool {
        self.inner
            .borrow()
            .as_ref()
            .is_some_and(|state| state.pending.is_partially_fulfilled())
    }

    /// Write into the unfilled part of the view. Commit with [`respond`](Self::respond).
    pub fn with_view<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> StreamResult<R> {
        let (pending, _) = self.state()?;
        Ok(pending.with_view(f))
    }

    pub fn respond(&self, bytes_written: usize) -> StreamResult<()> {
        let (pending, controller) = self.state()?;
        if pending.view_len() == 0 && !pending.is_invalidated() {
            return Err(StreamError::type_error(
                "Cannot respond with a zero-length or detached view",
            ));
        }
        if !controller.can_close_or_enqueue() {
            if bytes_written > 0 {
                return Err(StreamError::type_error(
                    "The bytesWritten must be zero after the stream is closed.",
                ));
            }
            controller.invalidate_byob_request();
            return Ok(());
        }

        let fulfilled = if pending.is_invalidated() && controller.consumer_count() >= 1 {
            // The reader went away; the bytes still belong to everyone else.
            let bytes = pending.written(bytes_written)?;
            if !bytes.is_empty() {
                controller.enqueue(bytes)?;
            }
            true
        } else {
            if bytes_written == 0 {
                return Err(StreamError::type_error(
                    "The bytesWritten must be more than zero while the stream is open.",
                ));
            }
            pending.respond(bytes_written)?
        };

        controller.pull_if_needed();
        if fulfilled {
            controller.invalidate_byob_request();
        }
        Ok(())
    }

    /// Copy `view` into the request and respond with its length.
    pub fn respond_with_new_view(&self, view: Bytes) -> StreamResult<()> {
        let (pending, _) = self.state()?;
        pending.write_view(&view)?;
        self.respond(view.len())
    }
}

/// Terminal state recorded while a read is in progress.
#[derive(Clone)]
pub(crate) enum Terminal {
    Closed,
    Errored(StreamError),
}

/// Counts reads in progress. Close and error notifications that arrive during
/// a read are parked here and applied when the last read returns.
#[derive(Default)]
pub(crate) struct PendingReads {
    count: Cell<usize>,
    deferred: RefCell<Option<Terminal>>,
}

impl PendingReads {
    pub(crate) fn is_pending(&self) -> bool {
        self.count.get() > 0
    }

    pub(crate) fn defer(&self, terminal: Terminal) {
        let mut deferred = self.deferred.borrow_mut();
        if !matches!(*deferred, Some(Terminal::Errored(_))) {
            *deferred = Some(terminal);
        }
    }

    pub(crate) fn deferred(&self) -> Option<Terminal> {
        self.deferred.borrow().clone()
    }
}

/// Something that owns a [`Readable`] and wants to hear when it ends.
pub(crate) trait ConsumerOwner {
    fn read_pending(&self) -> &PendingReads;
    fn do_close(&self);
    fn do_error(&self, reason: StreamError);
}

pub(crate) struct ReadPendingScope<'a, O: ConsumerOwner + ?Sized> {
    owner: &'a O,
}

impl<'a, O: ConsumerOwner + ?Sized> ReadPendingScope<'a, O> {
    pub(crate) fn new(owner: &'a O) -> Self {
        let pending = owner.read_pending();
        pending.count.set(pending.count.get() + 1);
        Self { owner }
    }
}

impl<O: ConsumerOwner + ?Sized> Drop for ReadPendingScope<'_, O> {
    fn drop(&mut self) {
        let pending = self.owner.read_pending();
        pending.count.set(pending.count.get() - 1);
        if pending.count.get() > 0 {
            return;
        }
        let deferred = pending.deferred.borrow_mut().take();
        match deferred {
            Some(Terminal::Closed) => self.owner.do_close(),
            Some(Terminal::Errored(reason)) => self.owner.do_error(reason),
            None => {}
        }
    }
}

struct Attachment<K: QueueKind> {
    controller: ReadableController<K>,
    consumer: Consumer<K>,
    owner: Option<Weak<dyn ConsumerOwner>>,
}

/// One consumer of a controller's queue, bound to its current owner.
pub(crate) struct Readable<K: QueueKind> {
    attachment: RefCell<Option<Attachment<K>>>,
    auto_allocate_chunk_size: usize,
}

impl<K: QueueKind> Readable<K> {
    fn new(controller: ReadableController<K>, queue: &Queue<K>, auto_allocate_chunk_size: usize) -> Rc<Self> {
        Rc::new_cyclic(|this: &Weak<Self>| {
            let listener: Weak<dyn StateListener> = this.clone();
            Self {
                attachment: RefCell::new(Some(Attachment {
                    controller,
                    consumer: queue.new_consumer(Some(listener)),
                    owner: None,
                })),
                auto_allocate_chunk_size,
            }
        })
    }

    /// A second consumer of the same controller, starting from this one's backlog.
    fn clone_readable(&self) -> Option<Rc<Self>> {
        let attachment = self.attachment.borrow();
        let attachment = attachment.as_ref()?;
        let controller = attachment.controller.clone();
        Some(Rc::new_cyclic(|this: &Weak<Self>| {
            let listener: Weak<dyn StateListener> = this.clone();
            Self {
                attachment: RefCell::new(Some(Attachment {
                    controller,
                    consumer: attachment.consumer.clone_with(Some(listener)),
                    owner: None,
                })),
                auto_allocate_chunk_size: self.auto_allocate_chunk_size,
            }
        }))
    }

    pub(crate) fn set_owner(&self, owner: Option<Weak<dyn ConsumerOwner>>) {
        if let Some(attachment) = self.attachment.borrow_mut().as_mut() {
            attachment.owner = owner;
        }
    }

    fn owner(&self) -> Option<Rc<dyn ConsumerOwner>> {
        self.attachment
            .borrow()
            .as_ref()
            .and_then(|attachment| attachment.owner.as_ref())
            .and_then(Weak::upgrade)
    }

    fn consumer(&self) -> Option<ConsumerHandle<K>> {
        self.attachment
            .borrow()
            .as_ref()
            .map(|attachment| attachment.consumer.handle())
    }

    pub(crate) fn controller(&self) -> Option<ReadableController<K>> {
        self.attachment
            .borrow()
            .as_ref()
            .map(|attachment| attachment.controller.clone())
    }

    pub(crate) fn read(&self) -> Promise<ReadResult<K::Value>> {
        match self.consumer() {
            Some(consumer) => {
                let (request, promise) = K::default_read(self.auto_allocate_chunk_size);
                consumer.read(request);
                // Served from the backlog: room may have opened up below the high water mark.
                if !consumer.has_read_requests() {
                    if let Some(controller) = self.controller() {
                        controller.pull_if_needed();
                    }
                }
                promise
            }
            None => resolved(ReadResult::done()),
        }
    }

    pub(crate) fn cancel(&self, reason: StreamError) -> Promise<()> {
        let attachment = self.attachment.borrow_mut().take();
        let Some(attachment) = attachment else {
            return resolved(());
        };
        attachment.consumer.cancel();
        let promise = attachment.controller.cancel(reason);
        drop(attachment);
        promise
    }

    pub(crate) fn has_pending_read_requests(&self) -> bool {
        self.consumer()
            .is_some_and(|consumer| consumer.has_read_requests())
    }
}

impl Readable<ByteQueue> {
    fn read_byob(&self, buffer: BytesMut, options: &ByobReadOptions) -> Promise<ReadResult<BytesMut>> {
        let (request, promise) = ByteReadRequest::byob(buffer, options);
        match self.consumer() {
            Some(consumer) => consumer.read(request),
            None => ByteQueue::close_request(request),
        }
        promise
    }
}

impl<K: QueueKind> StateListener for Readable<K> {
    fn on_consumer_close(&self) {
        if let Some(owner) = self.owner() {
            owner.do_close();
        }
    }

    fn on_consumer_error(&self, reason: StreamError) {
        if let Some(owner) = self.owner() {
            owner.do_error(reason);
        }
    }

    fn on_consumer_wants_data(&self) {
        if let Some(controller) = self.controller() {
            controller.pull_if_needed();
        }
    }
}

impl<K: QueueKind> GcTraced for Readable<K> {
    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        if let Some(attachment) = self.attachment.borrow().as_ref() {
            attachment.consumer.visit_for_gc(visitor);
        }
    }
}

pub(crate) enum ReadableState<K: QueueKind> {
    Closed,
    Errored(StreamError),
    Readable(Rc<Readable<K>>),
}

struct ReadableCore<K: QueueKind> {
    state: ReadableState<K>,
    lock: ReadableLock,
    disturbed: bool,
}

pub(crate) struct ReadableStreamInner<K: QueueKind> {
    core: RefCell<ReadableCore<K>>,
    pending: PendingReads,
    pub(crate) ctx: ExecutionContext,
}

impl<K: QueueKind> ReadableStreamInner<K> {
    fn with_state(ctx: ExecutionContext, state: ReadableState<K>) -> Rc<Self> {
        Rc::new(Self {
            core: RefCell::new(ReadableCore {
                state,
                lock: ReadableLock::new(),
                disturbed: false,
            }),
            pending: PendingReads::default(),
            ctx,
        })
    }

    fn from_readable(ctx: ExecutionContext, readable: Rc<Readable<K>>) -> Rc<Self> {
        let inner = Self::with_state(ctx, ReadableState::Readable(Rc::clone(&readable)));
        let owner: Weak<dyn ConsumerOwner> = Rc::downgrade(&inner) as Weak<Self>;
        readable.set_owner(Some(owner));
        inner
    }

    fn from_state(ctx: ExecutionContext, state: ReadableState<K>) -> Rc<Self> {
        match state {
            ReadableState::Readable(readable) => Self::from_readable(ctx, readable),
            other => Self::with_state(ctx, other),
        }
    }

    fn setup(
        ctx: &ExecutionContext,
        source: SourceRef<K>,
        size: Option<SizeRef<K>>,
        high_water_mark: usize,
        auto_allocate_chunk_size: usize,
    ) -> Rc<Self> {
        let (controller, queue) =
            ReadableController::new(ctx.clone(), source, size, high_water_mark);
        let readable = Readable::new(controller.clone(), &queue, auto_allocate_chunk_size);
        let inner = Self::from_readable(ctx.clone(), readable);
        controller.start();
        inner
    }

    /// Terminal state as seen by callers, counting notifications parked by a
    /// read in progress.
    fn terminal(&self) -> Option<Terminal> {
        if let Some(terminal) = self.pending.deferred() {
            return Some(terminal);
        }
        match &self.core.borrow().state {
            ReadableState::Closed => Some(Terminal::Closed),
            ReadableState::Errored(reason) => Some(Terminal::Errored(reason.clone())),
            ReadableState::Readable(_) => None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.terminal(), Some(Terminal::Closed))
    }

    pub(crate) fn try_get_errored(&self) -> Option<StreamError> {
        match self.terminal() {
            Some(Terminal::Errored(reason)) => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.core.borrow().lock.is_locked()
    }

    fn readable(&self) -> Option<Rc<Readable<K>>> {
        match &self.core.borrow().state {
            ReadableState::Readable(readable) => Some(Rc::clone(readable)),
            _ => None,
        }
    }

    pub(crate) fn read_default(&self) -> Promise<ReadResult<K::Value>> {
        self.core.borrow_mut().disturbed = true;
        match self.terminal() {
            Some(Terminal::Closed) => return resolved(ReadResult::done()),
            Some(Terminal::Errored(reason)) => return rejected(reason),
            None => {}
        }
        let Some(readable) = self.readable() else {
            return resolved(ReadResult::done());
        };
        let _scope = ReadPendingScope::new(self);
        readable.read()
    }

    pub(crate) fn cancel(&self, reason: StreamError) -> Promise<()> {
        let readable = {
            let mut core = self.core.borrow_mut();
            core.disturbed = true;
            match self.pending.deferred() {
                Some(Terminal::Closed) => return resolved(()),
                Some(Terminal::Errored(reason)) => return rejected(reason),
                None => {}
            }
            match std::mem::replace(&mut core.state, ReadableState::Closed) {
                ReadableState::Closed => return resolved(()),
                ReadableState::Errored(reason) => {
                    core.state = ReadableState::Errored(reason.clone());
                    return rejected(reason);
                }
                ReadableState::Readable(readable) => {
                    core.lock.on_close();
                    readable
                }
            }
        };
        debug!(%reason, "readable stream canceled");
        readable.cancel(reason)
    }

    fn end_state_lock_reader(&self) -> StreamResult<(u64, Promise<()>)> {
        let terminal = self.terminal();
        let end = match &terminal {
            None => EndState::Active,
            Some(Terminal::Closed) => EndState::Closed,
            Some(Terminal::Errored(reason)) => EndState::Errored(reason),
        };
        self.core
            .borrow_mut()
            .lock
            .lock_reader(end)
            .ok_or_else(|| StreamError::type_error("This ReadableStream is currently locked to a reader."))
    }

    fn release_reader(&self, id: u64, explicit: bool) -> StreamResult<()> {
        if explicit
            && self.core.borrow().lock.is_reader(id)
            && self
                .readable()
                .is_some_and(|readable| readable.has_pending_read_requests())
        {
            return Err(StreamError::type_error(
                "Cannot call releaseLock() on a reader with outstanding read promises.",
            ));
        }
        self.core.borrow_mut().lock.release_reader(id, explicit);
        Ok(())
    }

    pub(crate) fn try_pipe_lock(&self) -> bool {
        let mut core = self.core.borrow_mut();
        if !core.lock.try_pipe_lock() {
            return false;
        }
        core.disturbed = true;
        true
    }

    pub(crate) fn release_pipe_lock(&self) {
        self.core.borrow_mut().lock.release_pipe_lock();
    }

    /// Permanently lock the stream and take its state, leaving it closed.
    pub(crate) fn detach_state(&self) -> StreamResult<ReadableState<K>> {
        let mut core = self.core.borrow_mut();
        if !core.lock.lock() {
            return Err(StreamError::type_error(
                "This ReadableStream is currently locked to a reader.",
            ));
        }
        core.disturbed = true;
        match self.pending.deferred() {
            Some(Terminal::Closed) => return Ok(ReadableState::Closed),
            Some(Terminal::Errored(reason)) => return Ok(ReadableState::Errored(reason)),
            None => {}
        }
        Ok(match &core.state {
            ReadableState::Closed => ReadableState::Closed,
            ReadableState::Errored(reason) => ReadableState::Errored(reason.clone()),
            ReadableState::Readable(_) => std::mem::replace(&mut core.state, ReadableState::Closed),
        })
    }

    fn tee(&self) -> StreamResult<(Rc<Self>, Rc<Self>)> {
        let ctx = self.ctx.clone();
        Ok(match self.detach_state()? {
            ReadableState::Readable(readable) => {
                let first = match readable.clone_readable() {
                    Some(copy) => Self::from_readable(ctx.clone(), copy),
                    None => Self::with_state(ctx.clone(), ReadableState::Closed),
                };
                (first, Self::from_readable(ctx, readable))
            }
            ReadableState::Closed => (
                Self::with_state(ctx.clone(), ReadableState::Closed),
                Self::with_state(ctx, ReadableState::Closed),
            ),
            ReadableState::Errored(reason) => (
                Self::with_state(ctx.clone(), ReadableState::Errored(reason.clone())),
                Self::with_state(ctx, ReadableState::Errored(reason)),
            ),
        })
    }
}

impl ReadableStreamInner<ByteQueue> {
    fn read_byob(&self, buffer: BytesMut, options: ByobReadOptions) -> Promise<ReadResult<BytesMut>> {
        if buffer.is_empty() {
            return rejected(StreamError::type_error("Unable to use a zero-length ArrayBuffer."));
        }
        if options.element_size == 0 || buffer.len() % options.element_size != 0 {
            return rejected(StreamError::type_error(
                "The view length must be a multiple of the element size.",
            ));
        }
        if options.min_fill() > buffer.len() {
            return rejected(StreamError::type_error(
                "atLeast must not be greater than the view length.",
            ));
        }
        self.core.borrow_mut().disturbed = true;
        match self.terminal() {
            Some(Terminal::Closed) => {
                let mut buffer = buffer;
                buffer.truncate(0);
                return resolved(ReadResult {
                    value: Some(buffer),
                    done: true,
                });
            }
            Some(Terminal::Errored(reason)) => return rejected(reason),
            None => {}
        }
        let Some(readable) = self.readable() else {
            return resolved(ReadResult::done());
        };
        let _scope = ReadPendingScope::new(self);
        readable.read_byob(buffer, &options)
    }
}

impl<K: QueueKind> ConsumerOwner for ReadableStreamInner<K> {
    fn read_pending(&self) -> &PendingReads {
        &self.pending
    }

    fn do_close(&self) {
        if self.pending.is_pending() {
            self.pending.defer(Terminal::Closed);
            return;
        }
        let previous = {
            let mut core = self.core.borrow_mut();
            if !matches!(core.state, ReadableState::Readable(_)) {
                return;
            }
            core.lock.on_close();
            std::mem::replace(&mut core.state, ReadableState::Closed)
        };
        trace!("readable stream closed");
        drop(previous);
    }

    fn do_error(&self, reason: StreamError) {
        if self.pending.is_pending() {
            self.pending.defer(Terminal::Errored(reason));
            return;
        }
        let previous = {
            let mut core = self.core.borrow_mut();
            if !matches!(core.state, ReadableState::Readable(_)) {
                return;
            }
            core.lock.on_error(&reason);
            std::mem::replace(&mut core.state, ReadableState::Errored(reason))
        };
        trace!("readable stream errored");
        drop(previous);
    }
}

/// A readable stream of `T`. `S` selects value or byte semantics.
///
/// Cloning yields another handle to the same stream.
pub struct ReadableStream<T, S: StreamTypeMarker<T> = DefaultStream> {
    inner: Rc<ReadableStreamInner<S::Queue>>,
    _marker: PhantomData<fn() -> (T, S)>,
}

impl<T, S: StreamTypeMarker<T>> Clone for ReadableStream<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static, S: StreamTypeMarker<T>> fmt::Debug for ReadableStream<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStream")
            .field("locked", &self.is_locked())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T: 'static, S: StreamTypeMarker<T>> ReadableStream<T, S> {
    pub(crate) fn from_inner(inner: Rc<ReadableStreamInner<S::Queue>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub(crate) fn inner(&self) -> &Rc<ReadableStreamInner<S::Queue>> {
        &self.inner
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// True once anything has read from, canceled, piped or teed the stream.
    pub fn is_disturbed(&self) -> bool {
        self.inner.core.borrow().disturbed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.inner.try_get_errored()
    }

    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T, S>> {
        let (id, closed) = self.inner.end_state_lock_reader()?;
        Ok(ReadableStreamDefaultReader {
            stream: Rc::clone(&self.inner),
            id,
            closed,
            released: Cell::new(false),
            _marker: PhantomData,
        })
    }

    /// Cancel the stream. Fails on a locked stream; cancel through the reader instead.
    pub fn cancel(&self, reason: Option<StreamError>) -> Promise<()> {
        if self.is_locked() {
            return rejected(StreamError::type_error(
                "This ReadableStream is currently locked to a reader.",
            ));
        }
        self.inner.cancel(reason.unwrap_or(StreamError::Canceled))
    }

    /// Split into two branches that each see every chunk. The source is
    /// canceled only after both branches cancel.
    pub fn tee(&self) -> StreamResult<(Self, Self)> {
        let (first, second) = self.inner.tee()?;
        Ok((Self::from_inner(first), Self::from_inner(second)))
    }

    /// Move the stream's data into a fresh stream, leaving this one locked and closed.
    pub fn detach(&self) -> StreamResult<Self> {
        let ctx = self.inner.ctx.clone();
        let state = self.inner.detach_state()?;
        Ok(Self::from_inner(ReadableStreamInner::from_state(ctx, state)))
    }
}

impl<T: 'static, S: StreamTypeMarker<T>> GcTraced for ReadableStream<T, S> {
    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        let core = self.inner.core.borrow();
        match &core.state {
            ReadableState::Errored(reason) => visitor.visit_error(reason),
            ReadableState::Readable(readable) => readable.visit_for_gc(visitor),
            ReadableState::Closed => {}
        }
        if core.lock.has_pending_closed() {
            visitor.visit_pending("reader closed");
        }
    }
}

impl<T: Clone + 'static> ReadableStream<T, DefaultStream> {
    pub fn builder<Src: ReadableSource<T>>(source: Src) -> ReadableStreamBuilder<T> {
        ReadableStreamBuilder {
            source: Rc::new(RefCell::new(ValueSource(source))),
            strategy: None,
            high_water_mark: DEFAULT_VALUE_HIGH_WATER_MARK,
        }
    }

    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Self::builder(IteratorSource {
            iter: iter.into_iter(),
        })
    }

    pub fn from_vec(values: Vec<T>) -> ReadableStreamBuilder<T> {
        Self::from_iterator(values)
    }

    /// `None` once the stream has closed or errored.
    pub(crate) fn default_controller(&self) -> Option<ReadableStreamDefaultController<T>> {
        self.inner
            .readable()
            .and_then(|readable| readable.controller())
            .map(|inner| ReadableStreamDefaultController { inner })
    }

    /// Adapt a `futures::Stream`. Each pull awaits one item.
    pub fn from_stream<St>(stream: St) -> ReadableStreamBuilder<T>
    where
        St: Stream<Item = T> + Unpin + 'static,
    {
        Self::builder(StreamSource {
            stream: Rc::new(RefCell::new(Some(stream))),
        })
    }
}

impl ReadableStream<Bytes, ByteStream> {
    pub fn bytes_builder<Src: ReadableByteSource>(source: Src) -> ReadableByteStreamBuilder {
        ReadableByteStreamBuilder {
            source: Rc::new(RefCell::new(ByteSource(source))),
            high_water_mark: DEFAULT_BYTE_HIGH_WATER_MARK,
            auto_allocate_chunk_size: DEFAULT_AUTO_ALLOCATE_CHUNK_SIZE,
        }
    }

    pub fn get_byob_reader(&self) -> StreamResult<ReadableStreamBYOBReader> {
        let (id, closed) = self.inner.end_state_lock_reader()?;
        Ok(ReadableStreamBYOBReader {
            stream: Rc::clone(&self.inner),
            id,
            closed,
            released: Cell::new(false),
        })
    }
}

pub struct ReadableStreamBuilder<T: Clone + 'static> {
    source: SourceRef<ValueQueue<T>>,
    strategy: Option<Rc<dyn QueuingStrategy<T>>>,
    high_water_mark: usize,
}

impl<T: Clone + 'static> ReadableStreamBuilder<T> {
    /// Size chunks with `strategy`. Also adopts its high water mark.
    pub fn strategy<Q: QueuingStrategy<T> + 'static>(mut self, strategy: Q) -> Self {
        self.high_water_mark = strategy.high_water_mark();
        self.strategy = Some(Rc::new(strategy));
        self
    }

    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn build(self, ctx: &ExecutionContext) -> ReadableStream<T> {
        ReadableStream::from_inner(ReadableStreamInner::setup(
            ctx,
            self.source,
            self.strategy,
            self.high_water_mark,
            DEFAULT_AUTO_ALLOCATE_CHUNK_SIZE,
        ))
    }

    /// Build on an executor given by its spawn function, e.g. `tokio::task::spawn_local`.
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T>
    where
        F: Fn(LocalBoxFuture<'static, ()>) -> R + 'static,
    {
        self.build(&ExecutionContext::new(spawn_fn))
    }
}

pub struct ReadableByteStreamBuilder {
    source: SourceRef<ByteQueue>,
    high_water_mark: usize,
    auto_allocate_chunk_size: usize,
}

impl ReadableByteStreamBuilder {
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Buffer size allocated for each default read. Defaults to 4096.
    pub fn auto_allocate_chunk_size(mut self, size: usize) -> Self {
        self.auto_allocate_chunk_size = size;
        self
    }

    pub fn build(self, ctx: &ExecutionContext) -> StreamResult<ReadableStream<Bytes, ByteStream>> {
        if self.auto_allocate_chunk_size == 0 {
            return Err(StreamError::type_error(
                "The autoAllocateChunkSize option cannot be zero.",
            ));
        }
        Ok(ReadableStream::from_inner(ReadableStreamInner::setup(
            ctx,
            self.source,
            None,
            self.high_water_mark,
            self.auto_allocate_chunk_size,
        )))
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<Bytes, ByteStream>>
    where
        F: Fn(LocalBoxFuture<'static, ()>) -> R + 'static,
    {
        self.build(&ExecutionContext::new(spawn_fn))
    }
}

struct IteratorSource<I> {
    iter: I,
}

impl<T: Clone + 'static, I: Iterator<Item = T> + 'static> ReadableSource<T> for IteratorSource<I> {
    fn pull(&mut self, controller: ReadableStreamDefaultController<T>) -> StreamFuture<()> {
        let result = match self.iter.next() {
            Some(value) => controller.enqueue(value),
            None => controller.close(),
        };
        future::ready(result).boxed_local()
    }
}

struct StreamSource<St> {
    stream: Rc<RefCell<Option<St>>>,
}

impl<T, St> ReadableSource<T> for StreamSource<St>
where
    T: Clone + 'static,
    St: Stream<Item = T> + Unpin + 'static,
{
    fn pull(&mut self, controller: ReadableStreamDefaultController<T>) -> StreamFuture<()> {
        let slot = Rc::clone(&self.stream);
        async move {
            let Some(mut stream) = slot.borrow_mut().take() else {
                return Ok(());
            };
            let next = stream.next().await;
            *slot.borrow_mut() = Some(stream);
            match next {
                Some(value) => controller.enqueue(value),
                None => controller.close(),
            }
        }
        .boxed_local()
    }

    fn cancel(&mut self, _reason: StreamError) -> StreamFuture<()> {
        self.stream.borrow_mut().take();
        ready_ok()
    }
}

fn released() -> StreamError {
    StreamError::type_error("This ReadableStream reader has been released.")
}

/// Exclusive reader of a [`ReadableStream`].
///
/// Dropping the reader frees its lock state but leaves the stream marked as
/// locked; call [`release_lock`](Self::release_lock) to hand the stream on.
pub struct ReadableStreamDefaultReader<T, S: StreamTypeMarker<T> = DefaultStream> {
    stream: Rc<ReadableStreamInner<S::Queue>>,
    id: u64,
    closed: Promise<()>,
    released: Cell<bool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static, S: StreamTypeMarker<T>> ReadableStreamDefaultReader<T, S> {
    /// Next chunk, or `None` at end of stream.
    pub fn read(&self) -> impl Future<Output = StreamResult<Option<T>>> + 'static {
        let promise = if self.released.get() {
            rejected(released())
        } else {
            self.stream.read_default()
        };
        async move { promise.await.map(|result| result.value) }
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Promise<()> {
        if self.released.get() {
            return rejected(released());
        }
        self.stream.cancel(reason.unwrap_or(StreamError::Canceled))
    }

    /// Settles when the stream closes or errors, or rejects once released.
    pub fn closed(&self) -> Promise<()> {
        self.closed.clone()
    }

    pub fn release_lock(&self) -> StreamResult<()> {
        if self.released.get() {
            return Ok(());
        }
        self.stream.release_reader(self.id, true)?;
        self.released.set(true);
        Ok(())
    }

    /// Consume the reader as a `futures::Stream`. An error ends the stream
    /// after it is yielded.
    pub fn into_stream(self) -> impl Stream<Item = StreamResult<T>> + 'static {
        futures::stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read().await {
                Ok(Some(value)) => Some((Ok(value), Some(reader))),
                Ok(None) => None,
                Err(reason) => Some((Err(reason), None)),
            }
        })
    }
}

impl<T, S: StreamTypeMarker<T>> Drop for ReadableStreamDefaultReader<T, S> {
    fn drop(&mut self) {
        if !self.released.get() {
            let _ = self.stream.release_reader(self.id, false);
        }
    }
}

/// Reader that fills caller-supplied buffers.
pub struct ReadableStreamBYOBReader {
    stream: Rc<ReadableStreamInner<ByteQueue>>,
    id: u64,
    closed: Promise<()>,
    released: Cell<bool>,
}

impl ReadableStreamBYOBReader {
    /// Fill `buffer` with at least one byte. On end of stream the result is
    /// `done` and carries the buffer back, emptied.
    pub fn read(&self, buffer: BytesMut) -> Promise<ReadResult<BytesMut>> {
        self.read_with(buffer, ByobReadOptions::default())
    }

    pub fn read_with(&self, buffer: BytesMut, options: ByobReadOptions) -> Promise<ReadResult<BytesMut>> {
        if self.released.get() {
            return rejected(released());
        }
        self.stream.read_byob(buffer, options)
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Promise<()> {
        if self.released.get() {
            return rejected(released());
        }
        self.stream.cancel(reason.unwrap_or(StreamError::Canceled))
    }

    pub fn closed(&self) -> Promise<()> {
        self.closed.clone()
    }

    pub fn release_lock(&self) -> StreamResult<()> {
        if self.released.get() {
            return Ok(());
        }
        self.stream.release_reader(self.id, true)?;
        self.released.set(true);
        Ok(())
    }
}

impl Drop for ReadableStreamBYOBReader {
    fn drop(&mut self) {
        if !self.released.get() {
            let _ = self.stream.release_reader(self.id, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        CountQueuingStrategy, SizeFnStrategy,
        test_util::{local_test, settle},
    };

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(tokio::task::spawn_local)
    }

    type Slot<C> = Rc<RefCell<Option<C>>>;

    /// Hands its controller to the test and records cancellations.
    struct ManualSource<C> {
        controller: Slot<C>,
        pulls: Rc<Cell<usize>>,
        cancels: Rc<RefCell<Vec<String>>>,
    }

    impl<C> ManualSource<C> {
        fn new() -> (Self, Slot<C>, Rc<Cell<usize>>, Rc<RefCell<Vec<String>>>) {
            let controller = Rc::new(RefCell::new(None));
            let pulls = Rc::new(Cell::new(0));
            let cancels = Rc::new(RefCell::new(Vec::new()));
            let source = Self {
                controller: Rc::clone(&controller),
                pulls: Rc::clone(&pulls),
                cancels: Rc::clone(&cancels),
            };
            (source, controller, pulls, cancels)
        }
    }

    impl<T: Clone + 'static> ReadableSource<T> for ManualSource<ReadableStreamDefaultController<T>> {
        fn start(&mut self, controller: ReadableStreamDefaultController<T>) -> StreamFuture<()> {
            *self.controller.borrow_mut() = Some(controller);
            ready_ok()
        }

        fn pull(&mut self, _controller: ReadableStreamDefaultController<T>) -> StreamFuture<()> {
            self.pulls.set(self.pulls.get() + 1);
            ready_ok()
        }

        fn cancel(&mut self, reason: StreamError) -> StreamFuture<()> {
            self.cancels.borrow_mut().push(reason.to_string());
            ready_ok()
        }
    }

    impl ReadableByteSource for ManualSource<ReadableByteStreamController> {
        fn start(&mut self, controller: ReadableByteStreamController) -> StreamFuture<()> {
            *self.controller.borrow_mut() = Some(controller);
            ready_ok()
        }

        fn pull(&mut self, _controller: ReadableByteStreamController) -> StreamFuture<()> {
            self.pulls.set(self.pulls.get() + 1);
            ready_ok()
        }

        fn cancel(&mut self, reason: StreamError) -> StreamFuture<()> {
            self.cancels.borrow_mut().push(reason.to_string());
            ready_ok()
        }
    }

    fn controller<C: Clone>(slot: &Slot<C>) -> C {
        slot.borrow().clone().expect("source started")
    }

    #[tokio::test]
    async fn iterator_stream_reads_in_order() {
        local_test(|| async {
            let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::task::spawn_local);
            let reader = stream.get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap(), Some(1));
            assert_eq!(reader.read().await.unwrap(), Some(2));
            assert_eq!(reader.read().await.unwrap(), Some(3));
            assert_eq!(reader.read().await.unwrap(), None);
            reader.closed().await.unwrap();
            assert!(stream.is_disturbed());
        })
        .await;
    }

    #[tokio::test]
    async fn from_stream_adapts_futures_streams() {
        local_test(|| async {
            let source = futures::stream::iter(vec!["a", "b"]);
            let stream = ReadableStream::from_stream(source).build(&ctx());
            let collected: Vec<_> = stream
                .get_reader()
                .unwrap()
                .into_stream()
                .map(|item| item.unwrap())
                .collect()
                .await;
            assert_eq!(collected, vec!["a", "b"]);
        })
        .await;
    }

    #[tokio::test]
    async fn pull_waits_for_start_and_respects_high_water_mark() {
        local_test(|| async {
            let (source, slot, pulls, _) = ManualSource::new();
            let stream = ReadableStream::<u32>::builder(source)
                .strategy(CountQueuingStrategy::new(2))
                .build(&ctx());
            assert_eq!(pulls.get(), 0);
            settle().await;
            // Desired size is positive after start, so exactly one pull runs.
            assert_eq!(pulls.get(), 1);

            let controller = controller(&slot);
            controller.enqueue(1).unwrap();
            controller.enqueue(2).unwrap();
            assert_eq!(controller.desired_size(), Some(0));
            settle().await;
            let seen = pulls.get();

            let reader = stream.get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap(), Some(1));
            settle().await;
            assert!(pulls.get() > seen);
        })
        .await;
    }

    #[tokio::test]
    async fn enqueue_and_close_after_close_are_usage_errors() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::<u32>::builder(source).build(&ctx());
            settle().await;
            let controller = controller(&slot);
            controller.enqueue(7).unwrap();
            controller.close().unwrap();
            assert!(controller.close().unwrap_err().is_usage_error());
            assert!(controller.enqueue(8).unwrap_err().is_usage_error());
            assert_eq!(controller.desired_size(), Some(0));

            let reader = stream.get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap(), Some(7));
            assert_eq!(reader.read().await.unwrap(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn failing_size_errors_the_stream() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let strategy = SizeFnStrategy::new(4, |chunk: &i32| {
                if *chunk < 0 {
                    Err(StreamError::from("negative"))
                } else {
                    Ok(1)
                }
            });
            let stream = ReadableStream::<i32>::builder(source)
                .strategy(strategy)
                .build(&ctx());
            let reader = stream.get_reader().unwrap();
            settle().await;
            let controller = controller(&slot);
            assert_eq!(controller.enqueue(-1).unwrap_err().to_string(), "negative");
            assert_eq!(controller.desired_size(), None);
            assert_eq!(reader.read().await.unwrap_err().to_string(), "negative");
            assert_eq!(reader.closed().await.unwrap_err().to_string(), "negative");
        })
        .await;
    }

    #[tokio::test]
    async fn failing_start_errors_the_stream() {
        struct Broken;
        impl ReadableSource<u8> for Broken {
            fn start(&mut self, _: ReadableStreamDefaultController<u8>) -> StreamFuture<()> {
                future::ready(Err(StreamError::from("no start"))).boxed_local()
            }
        }
        local_test(|| async {
            let stream = ReadableStream::builder(Broken).build(&ctx());
            settle().await;
            assert_eq!(stream.errored().unwrap().to_string(), "no start");
            let reader = stream.get_reader().unwrap();
            assert!(reader.closed().await.is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_settles_pending_reads_and_calls_source_once() {
        local_test(|| async {
            let (source, _, _, cancels) = ManualSource::<ReadableStreamDefaultController<u8>>::new();
            let stream = ReadableStream::builder(source).build(&ctx());
            let reader = stream.get_reader().unwrap();
            let pending = reader.read();
            reader.cancel(Some("done here".into())).await.unwrap();
            assert_eq!(pending.await.unwrap(), None);
            assert_eq!(cancels.borrow().as_slice(), ["done here"]);
            reader.closed().await.unwrap();
            reader.cancel(None).await.unwrap();
            assert_eq!(cancels.borrow().len(), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_on_locked_stream_fails() {
        local_test(|| async {
            let stream = ReadableStream::from_vec(vec![1u8]).build(&ctx());
            let _reader = stream.get_reader().unwrap();
            assert!(stream.cancel(None).await.unwrap_err().is_usage_error());
            assert!(stream.get_reader().is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn release_lock_with_pending_read_fails() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::<u8>::builder(source).build(&ctx());
            let reader = stream.get_reader().unwrap();
            let pending = reader.read();
            assert!(reader.release_lock().unwrap_err().is_usage_error());

            settle().await;
            controller(&slot).enqueue(5).unwrap();
            assert_eq!(pending.await.unwrap(), Some(5));
            reader.release_lock().unwrap();
            assert!(!stream.is_locked());
            assert!(reader.closed().await.unwrap_err().is_usage_error());
            assert!(reader.read().await.unwrap_err().is_usage_error());
        })
        .await;
    }

    #[tokio::test]
    async fn dropped_reader_leaves_stream_locked() {
        local_test(|| async {
            let stream = ReadableStream::from_vec(vec![1u8]).build(&ctx());
            drop(stream.get_reader().unwrap());
            assert!(stream.is_locked());
            assert!(stream.get_reader().is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn tee_branches_see_every_chunk() {
        local_test(|| async {
            let stream = ReadableStream::from_vec(vec!["x", "y"]).build(&ctx());
            let (left, right) = stream.tee().unwrap();
            assert!(stream.is_locked());
            assert!(stream.tee().is_err());

            let left = left.get_reader().unwrap();
            let right = right.get_reader().unwrap();
            assert_eq!(left.read().await.unwrap(), Some("x"));
            assert_eq!(left.read().await.unwrap(), Some("y"));
            assert_eq!(left.read().await.unwrap(), None);
            assert_eq!(right.read().await.unwrap(), Some("x"));
            assert_eq!(right.read().await.unwrap(), Some("y"));
            assert_eq!(right.read().await.unwrap(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn tee_cancels_source_only_after_last_branch() {
        local_test(|| async {
            let (source, _, _, cancels) = ManualSource::<ReadableStreamDefaultController<u8>>::new();
            let stream = ReadableStream::builder(source).build(&ctx());
            let (left, right) = stream.tee().unwrap();

            left.cancel(Some("left".into())).await.unwrap();
            settle().await;
            assert!(cancels.borrow().is_empty());

            right.cancel(Some("right".into())).await.unwrap();
            assert_eq!(cancels.borrow().as_slice(), ["right"]);
        })
        .await;
    }

    #[tokio::test]
    async fn tee_of_errored_stream_yields_errored_branches() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::<u8>::builder(source).build(&ctx());
            settle().await;
            controller(&slot).error("broken".into());
            let (left, right) = stream.tee().unwrap();
            assert_eq!(left.errored().unwrap().to_string(), "broken");
            assert_eq!(right.errored().unwrap().to_string(), "broken");
        })
        .await;
    }

    #[tokio::test]
    async fn detach_moves_data_to_new_stream() {
        local_test(|| async {
            let stream = ReadableStream::from_vec(vec![4u8, 5]).build(&ctx());
            let moved = stream.detach().unwrap();
            assert!(stream.is_locked() && stream.is_closed());
            let reader = moved.get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap(), Some(4));
            assert_eq!(reader.read().await.unwrap(), Some(5));
        })
        .await;
    }

    #[tokio::test]
    async fn byob_read_waits_for_at_least() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::bytes_builder(source).build(&ctx()).unwrap();
            let reader = stream.get_byob_reader().unwrap();
            let read = reader.read_with(BytesMut::zeroed(16), ByobReadOptions::at_least(10));
            settle().await;

            let controller = controller(&slot);
            controller.enqueue(Bytes::from_static(&[1; 4])).unwrap();
            controller.enqueue(Bytes::from_static(&[2; 4])).unwrap();
            settle().await;
            assert!(crate::platform::peek(&read).is_none());
            controller.enqueue(Bytes::from_static(&[3; 4])).unwrap();

            let result = read.await.unwrap();
            assert_eq!(result.value.unwrap().len(), 12);
        })
        .await;
    }

    #[tokio::test]
    async fn byob_request_fills_reader_buffer_in_place() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::bytes_builder(source).build(&ctx()).unwrap();
            let reader = stream.get_byob_reader().unwrap();
            let read = reader.read(BytesMut::zeroed(8));
            settle().await;

            let controller = controller(&slot);
            let request = controller.byob_request().unwrap();
            assert_eq!(request.view_len(), Some(8));
            request.with_view(|view| view[..3].copy_from_slice(b"abc")).unwrap();
            request.respond(3).unwrap();
            assert!(request.is_invalidated());
            assert!(request.respond(1).unwrap_err().is_usage_error());

            assert_eq!(&read.await.unwrap().value.unwrap()[..], b"abc");
        })
        .await;
    }

    #[tokio::test]
    async fn respond_with_zero_while_open_is_rejected() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::bytes_builder(source).build(&ctx()).unwrap();
            let reader = stream.get_byob_reader().unwrap();
            let _read = reader.read(BytesMut::zeroed(4));
            settle().await;
            let request = controller(&slot).byob_request().unwrap();
            assert!(request.respond(0).unwrap_err().is_usage_error());
            request.respond_with_new_view(Bytes::from_static(b"hi")).unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn byte_controller_rejects_empty_chunks_and_buffers() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::bytes_builder(source).build(&ctx()).unwrap();
            settle().await;
            let controller = controller(&slot);
            assert!(controller.enqueue(Bytes::new()).unwrap_err().is_usage_error());

            let reader = stream.get_byob_reader().unwrap();
            assert!(reader.read(BytesMut::new()).await.unwrap_err().is_usage_error());
        })
        .await;
    }

    #[tokio::test]
    async fn byob_read_after_close_returns_empty_view() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::bytes_builder(source).build(&ctx()).unwrap();
            settle().await;
            controller(&slot).close().unwrap();
            let reader = stream.get_byob_reader().unwrap();
            let result = reader.read(BytesMut::zeroed(4)).await.unwrap();
            assert!(result.done);
            assert!(result.value.unwrap().is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn default_read_on_byte_stream_uses_auto_allocation() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::bytes_builder(source)
                .auto_allocate_chunk_size(4)
                .build(&ctx())
                .unwrap();
            settle().await;
            controller(&slot).enqueue(Bytes::from_static(b"abcdef")).unwrap();
            let reader = stream.get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap(), Some(Bytes::from_static(b"abcd")));
            assert_eq!(reader.read().await.unwrap(), Some(Bytes::from_static(b"ef")));
        })
        .await;
    }

    #[test]
    fn zero_auto_allocation_is_rejected() {
        let (source, _, _, _) = ManualSource::<ReadableByteStreamController>::new();
        let result = ReadableStream::bytes_builder(source)
            .auto_allocate_chunk_size(0)
            .build(&ExecutionContext::new(|_| ()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn controller_observers_follow_queue_state() {
        local_test(|| async {
            let (source, slot, _, _) = ManualSource::new();
            let stream = ReadableStream::<u32>::builder(source).build(&ctx());
            settle().await;
            let controller = controller(&slot);
            assert!(controller.can_close_or_enqueue());
            assert!(!controller.has_backpressure());
            assert!(!controller.has_pending_read_requests());

            let reader = stream.get_reader().unwrap();
            let read = reader.read();
            settle().await;
            assert!(controller.has_pending_read_requests());

            controller.enqueue(1).unwrap();
            assert_eq!(read.await.unwrap(), Some(1));
            controller.enqueue(2).unwrap();
            assert!(controller.has_backpressure());

            controller.close().unwrap();
            assert!(!controller.can_close_or_enqueue());
        })
        .await;
    }
}
