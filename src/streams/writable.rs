//! Writable streams.
//!
//! [`WritableController`] runs the write queue: one write or close in flight at
//! a time, backpressure from the queued size, and the erroring/abort protocol.
//! [`WritableStream`] wraps it with lock handling and the writer-facing
//! `closed`/`ready` promises.

use super::{
    QueuingStrategy, StreamResult,
    error::StreamError,
    gc::{GcTraced, GcVisitor},
    lock::{EndState, PipeLock, WritableLock},
    pipe::{AbortController, AbortSignal},
};
use crate::platform::{
    ExecutionContext, Promise, Resolver, StreamFuture, maybe_run_algorithm, promise, ready_ok,
    rejected, resolved,
};
use futures::{FutureExt, future::LocalBoxFuture};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};
use tracing::{debug, trace};

const DEFAULT_HIGH_WATER_MARK: usize = 1;

/// Consumer of chunks written to a [`WritableStream`].
pub trait WritableSink<T: 'static>: 'static {
    fn start(&mut self, controller: WritableStreamDefaultController) -> StreamFuture<()> {
        let _ = controller;
        ready_ok()
    }

    fn write(&mut self, chunk: T, controller: WritableStreamDefaultController) -> StreamFuture<()>;

    /// Called once every queued write has finished.
    fn close(&mut self) -> StreamFuture<()> {
        ready_ok()
    }

    fn abort(&mut self, reason: StreamError) -> StreamFuture<()> {
        let _ = reason;
        ready_ok()
    }
}

trait ErrorTarget {
    fn error(&self, reason: StreamError);
}

/// Handed to a [`WritableSink`]. Lets the sink fail the stream and observe aborts.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    target: Weak<dyn ErrorTarget>,
    signal: AbortSignal,
}

impl WritableStreamDefaultController {
    /// Error the stream, if it is still writable.
    pub fn error(&self, reason: StreamError) {
        if let Some(target) = self.target.upgrade() {
            target.error(reason);
        }
    }

    /// Signal triggered when the stream is aborted.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }

    /// Race `fut` against an abort of the stream.
    ///
    /// ```ignore
    /// fn write(&mut self, chunk: Bytes, controller: WritableStreamDefaultController) -> StreamFuture<()> {
    ///     let file = self.file.clone();
    ///     controller.with_abort(async move { file.write(chunk).await }).map(|r| r?).boxed_local()
    /// }
    /// ```
    pub fn with_abort<F, R>(&self, fut: F) -> impl Future<Output = StreamResult<R>> + 'static
    where
        F: Future<Output = R> + 'static,
        R: 'static,
    {
        self.signal.with_abort(fut)
    }
}

type SinkRef<T> = Rc<RefCell<dyn WritableSink<T>>>;

#[derive(Clone)]
enum WritableState {
    Writable,
    Erroring(StreamError),
    Errored(StreamError),
    Closed,
}

struct WriteRequest<T> {
    resolver: Resolver<()>,
    value: T,
    size: usize,
}

struct PendingAbort {
    resolver: Option<Resolver<()>>,
    promise: Promise<()>,
    reason: StreamError,
    /// The stream was already erroring when abort was requested.
    reject: bool,
}

impl PendingAbort {
    fn complete(mut self) {
        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(());
        }
    }

    fn fail(mut self, reason: StreamError) {
        if let Some(resolver) = self.resolver.take() {
            resolver.reject(reason);
        }
    }
}

pub(crate) struct WritableImpl<T> {
    this: Weak<RefCell<WritableImpl<T>>>,
    ctx: ExecutionContext,
    owner: Weak<WritableStreamInner<T>>,
    state: WritableState,
    sink: Option<SinkRef<T>>,
    size: Option<Rc<dyn QueuingStrategy<T>>>,
    abort_controller: AbortController,
    started: bool,
    starting: bool,
    backpressure: bool,
    high_water_mark: usize,
    amount_buffered: usize,
    write_requests: VecDeque<WriteRequest<T>>,
    in_flight_write: Option<Resolver<()>>,
    in_flight_close: Option<Resolver<()>>,
    close_request: Option<Resolver<()>>,
    pending_abort: Option<PendingAbort>,
}

impl<T> WritableImpl<T> {
    fn desired_size_raw(&self) -> isize {
        self.high_water_mark as isize - self.amount_buffered as isize
    }

    fn is_close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn clear_algorithms(&mut self) -> (Option<SinkRef<T>>, Option<Rc<dyn QueuingStrategy<T>>>) {
        (self.sink.take(), self.size.take())
    }
}

impl<T: 'static> ErrorTarget for RefCell<WritableImpl<T>> {
    fn error(&self, reason: StreamError) {
        let this = self.borrow().this.upgrade();
        if let Some(this) = this {
            WritableController(this).error(reason);
        }
    }
}

pub(crate) struct WritableController<T>(Rc<RefCell<WritableImpl<T>>>);

impl<T> Clone for WritableController<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

enum Step<T> {
    Idle,
    FinishErroring,
    Close(Option<SinkRef<T>>),
    Write(Option<SinkRef<T>>, T, usize),
}

impl<T: 'static> WritableController<T> {
    fn new(
        ctx: ExecutionContext,
        sink: SinkRef<T>,
        size: Option<Rc<dyn QueuingStrategy<T>>>,
        high_water_mark: usize,
        owner: Weak<WritableStreamInner<T>>,
    ) -> Self {
        Self(Rc::new_cyclic(|this| {
            RefCell::new(WritableImpl {
                this: this.clone(),
                ctx,
                owner,
                state: WritableState::Writable,
                sink: Some(sink),
                size,
                abort_controller: AbortController::new(),
                started: false,
                starting: false,
                backpressure: false,
                high_water_mark,
                amount_buffered: 0,
                write_requests: VecDeque::new(),
                in_flight_write: None,
                in_flight_close: None,
                close_request: None,
                pending_abort: None,
            })
        }))
    }

    fn owner(&self) -> Option<Rc<WritableStreamInner<T>>> {
        self.0.borrow().owner.upgrade()
    }

    fn ctx(&self) -> ExecutionContext {
        self.0.borrow().ctx.clone()
    }

    fn public_controller(&self) -> WritableStreamDefaultController {
        let controller = self.0.borrow();
        let target: Weak<dyn ErrorTarget> = controller.this.clone();
        WritableStreamDefaultController {
            target,
            signal: controller.abort_controller.signal(),
        }
    }

    fn start(&self) {
        let sink = {
            let mut controller = self.0.borrow_mut();
            debug_assert!(!controller.started && !controller.starting);
            controller.starting = true;
            controller.backpressure = controller.desired_size_raw() < 0;
            controller.sink.clone()
        };
        let handle = self.public_controller();
        let this = self.clone();
        maybe_run_algorithm(
            &self.ctx(),
            sink,
            move |sink| sink.start(handle),
            move |result| {
                let ready = {
                    let mut controller = this.0.borrow_mut();
                    controller.started = true;
                    controller.starting = false;
                    matches!(controller.state, WritableState::Writable) && !controller.backpressure
                };
                match result {
                    Ok(()) => {
                        if ready {
                            if let Some(owner) = this.owner() {
                                owner.resolve_ready();
                            }
                        }
                        this.advance_queue_if_needed();
                    }
                    Err(reason) => this.deal_with_rejection(reason),
                }
            },
        );
    }

    pub(crate) fn is_started(&self) -> bool {
        self.0.borrow().started
    }

    pub(crate) fn is_writable(&self) -> bool {
        matches!(self.0.borrow().state, WritableState::Writable)
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.0.borrow().backpressure
    }

    pub(crate) fn errored_or_erroring(&self) -> Option<StreamError> {
        match &self.0.borrow().state {
            WritableState::Erroring(reason) | WritableState::Errored(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_close_queued_or_in_flight(&self) -> bool {
        self.0.borrow().is_close_queued_or_in_flight()
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        let controller = self.0.borrow();
        match controller.state {
            WritableState::Writable => Some(controller.desired_size_raw()),
            WritableState::Closed => Some(0),
            _ => None,
        }
    }

    pub(crate) fn abort(&self, reason: StreamError) -> Promise<()> {
        let signal = self.0.borrow().abort_controller.clone();
        signal.abort(reason.clone());
        let (promise, start) = {
            let mut controller = self.0.borrow_mut();
            match &controller.state {
                WritableState::Closed | WritableState::Errored(_) => return resolved(()),
                _ => {}
            }
            if let Some(pending) = &controller.pending_abort {
                return pending.promise.clone();
            }
            let was_erroring = matches!(controller.state, WritableState::Erroring(_));
            let (resolver, promise) = promise();
            controller.pending_abort = Some(PendingAbort {
                resolver: Some(resolver),
                promise: promise.clone(),
                reason: reason.clone(),
                reject: was_erroring,
            });
            (promise, !was_erroring)
        };
        debug!(%reason, "writable stream aborted");
        if start {
            self.start_erroring(reason);
        }
        promise
    }

    pub(crate) fn close(&self) -> Promise<()> {
        let (promise, resolve_ready) = {
            let mut controller = self.0.borrow_mut();
            match &controller.state {
                WritableState::Closed => return rejected(closed_error()),
                WritableState::Errored(reason) => return rejected(reason.clone()),
                _ => {}
            }
            if controller.is_close_queued_or_in_flight() {
                return rejected(StreamError::type_error(
                    "Cannot close a writer that is already being closed",
                ));
            }
            let (resolver, promise) = promise();
            controller.close_request = Some(resolver);
            let resolve_ready =
                controller.backpressure && matches!(controller.state, WritableState::Writable);
            (promise, resolve_ready)
        };
        if resolve_ready {
            if let Some(owner) = self.owner() {
                owner.resolve_ready();
            }
        }
        self.advance_queue_if_needed();
        promise
    }

    pub(crate) fn write(&self, value: T) -> Promise<()> {
        let size = self.0.borrow().size.clone();
        let size = match size {
            Some(strategy) => match strategy.size(&value) {
                Ok(size) => size,
                Err(reason) => {
                    if self.is_writable() {
                        self.start_erroring(reason.clone());
                    }
                    return rejected(reason);
                }
            },
            None => 1,
        };
        let promise = {
            let mut controller = self.0.borrow_mut();
            match &controller.state {
                WritableState::Errored(reason) => return rejected(reason.clone()),
                WritableState::Closed => return rejected(closed_error()),
                _ if controller.is_close_queued_or_in_flight() => {
                    return rejected(StreamError::type_error(
                        "Cannot write to a WritableStream that is being closed.",
                    ));
                }
                WritableState::Erroring(reason) => return rejected(reason.clone()),
                WritableState::Writable => {}
            }
            let (resolver, promise) = promise();
            controller.write_requests.push_back(WriteRequest {
                resolver,
                value,
                size,
            });
            controller.amount_buffered += size;
            promise
        };
        self.update_backpressure();
        self.advance_queue_if_needed();
        promise
    }

    /// Error from the sink's side. Ignored unless the stream is still writable.
    pub(crate) fn error(&self, reason: StreamError) {
        let cleared = {
            let mut controller = self.0.borrow_mut();
            if !matches!(controller.state, WritableState::Writable) {
                return;
            }
            controller.clear_algorithms()
        };
        drop(cleared);
        self.start_erroring(reason);
    }

    /// Move a writable stream straight to `Errored`, skipping the erroring drain.
    ///
    /// Everything queued is rejected now, a pending abort included. A write or
    /// close already in flight settles on its own and finds the stream errored.
    pub(crate) fn force_error(&self, reason: StreamError) {
        let (writes, close, abort, cleared) = {
            let mut controller = self.0.borrow_mut();
            if !matches!(controller.state, WritableState::Writable) {
                return;
            }
            controller.state = WritableState::Errored(reason.clone());
            controller.amount_buffered = 0;
            let writes: Vec<_> = controller.write_requests.drain(..).collect();
            (
                writes,
                controller.close_request.take(),
                controller.pending_abort.take(),
                controller.clear_algorithms(),
            )
        };
        drop(cleared);
        debug!(%reason, "writable stream errored without draining");
        for write in writes {
            write.resolver.reject(reason.clone());
        }
        if let Some(close) = close {
            close.reject(reason.clone());
        }
        if let Some(abort) = abort {
            abort.fail(reason.clone());
        }
        if let Some(owner) = self.owner() {
            owner.do_error(reason);
        }
    }

    fn advance_queue_if_needed(&self) {
        let step = {
            let mut controller = self.0.borrow_mut();
            if !controller.started || controller.in_flight_write.is_some() {
                Step::Idle
            } else {
                match controller.state {
                    WritableState::Erroring(_) => Step::FinishErroring,
                    WritableState::Writable => {
                        if let Some(request) = controller.write_requests.pop_front() {
                            controller.in_flight_write = Some(request.resolver);
                            Step::Write(controller.sink.clone(), request.value, request.size)
                        } else if controller.in_flight_close.is_none() {
                            match controller.close_request.take() {
                                Some(close) => {
                                    controller.in_flight_close = Some(close);
                                    Step::Close(controller.sink.clone())
                                }
                                None => Step::Idle,
                            }
                        } else {
                            Step::Idle
                        }
                    }
                    _ => Step::Idle,
                }
            }
        };

        match step {
            Step::Idle => {}
            Step::FinishErroring => self.finish_erroring(),
            Step::Close(sink) => {
                trace!("closing underlying sink");
                let this = self.clone();
                maybe_run_algorithm(
                    &self.ctx(),
                    sink,
                    |sink| sink.close(),
                    move |result| this.finish_in_flight_close(result.err()),
                );
            }
            Step::Write(sink, value, size) => {
                let handle = self.public_controller();
                let this = self.clone();
                maybe_run_algorithm(
                    &self.ctx(),
                    sink,
                    move |sink| sink.write(value, handle),
                    move |result| {
                        let writable = {
                            let mut controller = this.0.borrow_mut();
                            controller.amount_buffered = controller.amount_buffered.saturating_sub(size);
                            matches!(controller.state, WritableState::Writable)
                        };
                        match result {
                            Ok(()) => {
                                this.finish_in_flight_write(None);
                                if writable && !this.is_close_queued_or_in_flight() {
                                    this.update_backpressure();
                                }
                                this.advance_queue_if_needed();
                            }
                            Err(reason) => {
                                if writable {
                                    let cleared = this.0.borrow_mut().clear_algorithms();
                                    drop(cleared);
                                }
                                this.finish_in_flight_write(Some(reason));
                            }
                        }
                    },
                );
            }
        }
    }

    fn deal_with_rejection(&self, reason: StreamError) {
        if self.is_writable() {
            self.start_erroring(reason);
        } else {
            self.finish_erroring();
        }
    }

    fn start_erroring(&self, reason: StreamError) {
        let finish = {
            let mut controller = self.0.borrow_mut();
            debug_assert!(matches!(controller.state, WritableState::Writable));
            controller.state = WritableState::Erroring(reason.clone());
            controller.started
                && controller.in_flight_write.is_none()
                && controller.in_flight_close.is_none()
        };
        debug!(%reason, "writable stream erroring");
        if let Some(owner) = self.owner() {
            owner.reject_ready(&reason);
        }
        if finish {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&self) {
        enum AbortStep<T> {
            Nothing,
            Reject(PendingAbort),
            Run(PendingAbort, Option<SinkRef<T>>),
        }

        let (reason, writes, step) = {
            let mut controller = self.0.borrow_mut();
            let WritableState::Erroring(reason) = controller.state.clone() else {
                return;
            };
            controller.state = WritableState::Errored(reason.clone());
            let writes: Vec<_> = controller.write_requests.drain(..).collect();
            controller.amount_buffered = 0;
            let step = match controller.pending_abort.take() {
                None => AbortStep::Nothing,
                Some(abort) if abort.reject => AbortStep::Reject(abort),
                Some(abort) => AbortStep::Run(abort, controller.sink.clone()),
            };
            (reason, writes, step)
        };

        for write in writes {
            write.resolver.reject(reason.clone());
        }

        match step {
            AbortStep::Nothing => self.reject_close_and_closed_promise_if_needed(),
            AbortStep::Reject(abort) => {
                abort.fail(reason);
                self.reject_close_and_closed_promise_if_needed();
            }
            AbortStep::Run(abort, sink) => {
                let abort_reason = abort.reason.clone();
                let this = self.clone();
                maybe_run_algorithm(
                    &self.ctx(),
                    sink,
                    move |sink| sink.abort(abort_reason),
                    move |result| {
                        match result {
                            Ok(()) => abort.complete(),
                            Err(reason) => abort.fail(reason),
                        }
                        this.reject_close_and_closed_promise_if_needed();
                    },
                );
            }
        }
    }

    fn reject_close_and_closed_promise_if_needed(&self) {
        let (close, reason, cleared) = {
            let mut controller = self.0.borrow_mut();
            let WritableState::Errored(reason) = controller.state.clone() else {
                return;
            };
            (controller.close_request.take(), reason, controller.clear_algorithms())
        };
        drop(cleared);
        if let Some(close) = close {
            close.reject(reason.clone());
        }
        if let Some(owner) = self.owner() {
            owner.do_error(reason);
        }
    }

    fn finish_in_flight_close(&self, error: Option<StreamError>) {
        let resolver = self.0.borrow_mut().in_flight_close.take();
        match error {
            Some(reason) => {
                if let Some(resolver) = resolver {
                    resolver.reject(reason.clone());
                }
                let abort = self.0.borrow_mut().pending_abort.take();
                if let Some(abort) = abort {
                    abort.fail(reason.clone());
                }
                self.deal_with_rejection(reason);
            }
            None => {
                if let Some(resolver) = resolver {
                    resolver.resolve(());
                }
                let (abort, cleared) = {
                    let mut controller = self.0.borrow_mut();
                    let abort = match controller.state {
                        WritableState::Erroring(_) => controller.pending_abort.take(),
                        _ => None,
                    };
                    if !matches!(controller.state, WritableState::Errored(_)) {
                        controller.state = WritableState::Closed;
                    }
                    (abort, controller.clear_algorithms())
                };
                drop(cleared);
                if let Some(abort) = abort {
                    abort.complete();
                }
                debug!("writable stream closed");
                if let Some(owner) = self.owner() {
                    owner.do_close();
                }
            }
        }
    }

    fn finish_in_flight_write(&self, error: Option<StreamError>) {
        let resolver = self.0.borrow_mut().in_flight_write.take();
        match error {
            None => {
                if let Some(resolver) = resolver {
                    resolver.resolve(());
                }
            }
            Some(reason) => {
                if let Some(resolver) = resolver {
                    resolver.reject(reason.clone());
                }
                self.deal_with_rejection(reason);
            }
        }
    }

    fn update_backpressure(&self) {
        let change = {
            let mut controller = self.0.borrow_mut();
            let backpressure = controller.desired_size_raw() < 0;
            if backpressure == controller.backpressure {
                None
            } else {
                controller.backpressure = backpressure;
                Some(backpressure)
            }
        };
        if let Some(backpressure) = change {
            trace!(backpressure, "writable backpressure changed");
            if let Some(owner) = self.owner() {
                owner.update_backpressure(backpressure);
            }
        }
    }

    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        let controller = self.0.borrow();
        if let WritableState::Erroring(reason) | WritableState::Errored(reason) = &controller.state {
            visitor.visit_error(reason);
        }
        for request in &controller.write_requests {
            visitor.visit_entry(request.size);
        }
        let in_flight = [
            controller.in_flight_write.is_some(),
            controller.in_flight_close.is_some(),
            controller.close_request.is_some(),
            controller.pending_abort.is_some(),
        ];
        for _ in in_flight.iter().filter(|pending| **pending) {
            visitor.visit_pending("writable request");
        }
    }
}

fn closed_error() -> StreamError {
    StreamError::type_error("This WritableStream has been closed.")
}

fn locked_error() -> StreamError {
    StreamError::type_error("This WritableStream is currently locked to a writer.")
}

fn released_error() -> StreamError {
    StreamError::type_error("This WritableStream writer has been released.")
}

enum WritableStreamState<T> {
    Closed,
    Errored(StreamError),
    Controller(WritableController<T>),
}

struct WritableCore<T> {
    state: WritableStreamState<T>,
    lock: WritableLock<T>,
    abort_promise: Option<Promise<()>>,
}

pub(crate) struct WritableStreamInner<T> {
    core: RefCell<WritableCore<T>>,
}

/// The writable half of a pipe or transform, seen without its chunk type.
pub(crate) trait WritableSide {
    fn is_writable(&self) -> bool;
    fn erroring_or_errored(&self) -> Option<StreamError>;
    fn force_error(&self, reason: StreamError);
}

impl<T: 'static> WritableStreamInner<T> {
    fn setup(
        ctx: &ExecutionContext,
        sink: SinkRef<T>,
        size: Option<Rc<dyn QueuingStrategy<T>>>,
        high_water_mark: usize,
    ) -> Rc<Self> {
        let inner = Rc::new_cyclic(|owner: &Weak<Self>| {
            let controller =
                WritableController::new(ctx.clone(), sink, size, high_water_mark, owner.clone());
            Self {
                core: RefCell::new(WritableCore {
                    state: WritableStreamState::Controller(controller),
                    lock: WritableLock::new(),
                    abort_promise: None,
                }),
            }
        });
        if let Some(controller) = inner.controller() {
            controller.start();
        }
        inner
    }

    pub(crate) fn controller(&self) -> Option<WritableController<T>> {
        match &self.core.borrow().state {
            WritableStreamState::Controller(controller) => Some(controller.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.core.borrow().lock.is_locked()
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.core.borrow().state, WritableStreamState::Closed)
    }

    pub(crate) fn write(&self, value: T) -> Promise<()> {
        match self.controller() {
            Some(controller) => controller.write(value),
            None => match &self.core.borrow().state {
                WritableStreamState::Errored(reason) => rejected(reason.clone()),
                _ => rejected(closed_error()),
            },
        }
    }

    pub(crate) fn close(&self) -> Promise<()> {
        match self.controller() {
            Some(controller) => controller.close(),
            None => match &self.core.borrow().state {
                WritableStreamState::Errored(reason) => rejected(reason.clone()),
                _ => rejected(closed_error()),
            },
        }
    }

    pub(crate) fn abort(&self, reason: StreamError) -> Promise<()> {
        if let Some(promise) = &self.core.borrow().abort_promise {
            return promise.clone();
        }
        let promise = match self.controller() {
            Some(controller) => controller.abort(reason),
            None => resolved(()),
        };
        self.core.borrow_mut().abort_promise = Some(promise.clone());
        promise
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        match self.controller() {
            Some(controller) => controller.desired_size(),
            None => match self.core.borrow().state {
                WritableStreamState::Closed => Some(0),
                _ => None,
            },
        }
    }

    fn lock_writer(&self) -> StreamResult<(u64, Promise<()>)> {
        let controller = self.controller();
        let ready_now = controller.as_ref().is_some_and(|controller| {
            controller.is_started() && controller.is_writable() && !controller.has_backpressure()
        });
        let erroring = controller.as_ref().and_then(|controller| controller.errored_or_erroring());
        let mut core = self.core.borrow_mut();
        let errored = match &core.state {
            WritableStreamState::Errored(reason) => Some(reason.clone()),
            _ => None,
        };
        let end = match (&core.state, &errored) {
            (WritableStreamState::Closed, _) => EndState::Closed,
            (_, Some(reason)) => EndState::Errored(reason),
            _ => EndState::Active,
        };
        let (id, closed) = core.lock.lock_writer(end, ready_now).ok_or_else(locked_error)?;
        if let Some(reason) = erroring {
            core.lock.reject_ready(&reason);
        }
        Ok((id, closed))
    }

    fn release_writer(&self, id: u64, explicit: bool) {
        self.core.borrow_mut().lock.release_writer(id, explicit);
    }

    fn ready(&self, id: u64) -> Promise<()> {
        self.core
            .borrow()
            .lock
            .ready(id)
            .unwrap_or_else(|| rejected(released_error()))
    }

    pub(crate) fn try_pipe_lock(&self, pipe: PipeLock<T>) -> bool {
        self.core.borrow_mut().lock.try_pipe_lock(pipe)
    }

    pub(crate) fn pipe(&self) -> Option<PipeLock<T>> {
        self.core.borrow().lock.pipe()
    }

    pub(crate) fn release_pipe_lock(&self) {
        self.core.borrow_mut().lock.release_pipe_lock();
    }

    fn do_close(&self) {
        let previous = {
            let mut core = self.core.borrow_mut();
            if !matches!(core.state, WritableStreamState::Controller(_)) {
                return;
            }
            core.lock.on_close();
            std::mem::replace(&mut core.state, WritableStreamState::Closed)
        };
        drop(previous);
    }

    fn do_error(&self, reason: StreamError) {
        let previous = {
            let mut core = self.core.borrow_mut();
            if !matches!(core.state, WritableStreamState::Controller(_)) {
                return;
            }
            core.lock.on_error(&reason);
            std::mem::replace(&mut core.state, WritableStreamState::Errored(reason))
        };
        drop(previous);
    }

    fn update_backpressure(&self, backpressure: bool) {
        let mut core = self.core.borrow_mut();
        if backpressure {
            core.lock.set_ready_pending();
        } else {
            core.lock.resolve_ready();
        }
    }

    fn resolve_ready(&self) {
        self.core.borrow_mut().lock.resolve_ready();
    }

    fn reject_ready(&self, reason: &StreamError) {
        self.core.borrow_mut().lock.reject_ready(reason);
    }
}

impl<T: 'static> WritableSide for WritableStreamInner<T> {
    fn is_writable(&self) -> bool {
        self.controller().is_some_and(|controller| controller.is_writable())
    }

    fn erroring_or_errored(&self) -> Option<StreamError> {
        match self.controller() {
            Some(controller) => controller.errored_or_erroring(),
            None => match &self.core.borrow().state {
                WritableStreamState::Errored(reason) => Some(reason.clone()),
                _ => None,
            },
        }
    }

    fn force_error(&self, reason: StreamError) {
        if let Some(controller) = self.controller() {
            controller.force_error(reason);
        }
    }
}

/// A writable stream of `T`. Cloning yields another handle to the same stream.
pub struct WritableStream<T> {
    inner: Rc<WritableStreamInner<T>>,
}

impl<T> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> WritableStream<T> {
    pub fn builder<Sk: WritableSink<T>>(sink: Sk) -> WritableStreamBuilder<T> {
        WritableStreamBuilder {
            sink: Rc::new(RefCell::new(sink)),
            strategy: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    pub(crate) fn inner(&self) -> &Rc<WritableStreamInner<T>> {
        &self.inner
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// The stored error once the stream is erroring or errored.
    pub fn errored(&self) -> Option<StreamError> {
        self.inner.erroring_or_errored()
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.inner.desired_size()
    }

    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        let (id, closed) = self.inner.lock_writer()?;
        Ok(WritableStreamDefaultWriter {
            stream: Rc::clone(&self.inner),
            id,
            closed,
            released: Cell::new(false),
            pending_ready: None,
            last_write: None,
            closing: None,
        })
    }

    /// Abort the stream. Repeated aborts share the first one's outcome.
    pub fn abort(&self, reason: Option<StreamError>) -> Promise<()> {
        if self.is_locked() {
            return rejected(locked_error());
        }
        self.inner.abort(reason.unwrap_or(StreamError::Aborted(None)))
    }

    pub fn close(&self) -> Promise<()> {
        if self.is_locked() {
            return rejected(locked_error());
        }
        self.inner.close()
    }
}

impl<T: 'static> GcTraced for WritableStream<T> {
    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        let controller = self.inner.controller();
        match controller {
            Some(controller) => controller.visit_for_gc(visitor),
            None => {
                if let WritableStreamState::Errored(reason) = &self.inner.core.borrow().state {
                    visitor.visit_error(reason);
                }
            }
        }
        for _ in 0..self.inner.core.borrow().lock.pending_count() {
            visitor.visit_pending("writer promise");
        }
    }
}

pub struct WritableStreamBuilder<T> {
    sink: SinkRef<T>,
    strategy: Option<Rc<dyn QueuingStrategy<T>>>,
    high_water_mark: usize,
}

impl<T: 'static> WritableStreamBuilder<T> {
    pub fn strategy<Q: QueuingStrategy<T> + 'static>(mut self, strategy: Q) -> Self {
        self.high_water_mark = strategy.high_water_mark();
        self.strategy = Some(Rc::new(strategy));
        self
    }

    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn build(self, ctx: &ExecutionContext) -> WritableStream<T> {
        WritableStream {
            inner: WritableStreamInner::setup(ctx, self.sink, self.strategy, self.high_water_mark),
        }
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream<T>
    where
        F: Fn(LocalBoxFuture<'static, ()>) -> R + 'static,
    {
        self.build(&ExecutionContext::new(spawn_fn))
    }
}

/// Exclusive writer of a [`WritableStream`].
///
/// Also a [`futures::Sink`]: `poll_ready` waits on [`ready`](Self::ready),
/// `poll_flush` waits for the last write to finish.
pub struct WritableStreamDefaultWriter<T> {
    stream: Rc<WritableStreamInner<T>>,
    id: u64,
    closed: Promise<()>,
    released: Cell<bool>,
    pending_ready: Option<Promise<()>>,
    last_write: Option<Promise<()>>,
    closing: Option<Promise<()>>,
}

impl<T: 'static> WritableStreamDefaultWriter<T> {
    pub fn write(&self, chunk: T) -> Promise<()> {
        if self.released.get() {
            return rejected(released_error());
        }
        self.stream.write(chunk)
    }

    pub fn close(&self) -> Promise<()> {
        if self.released.get() {
            return rejected(released_error());
        }
        self.stream.close()
    }

    pub fn abort(&self, reason: Option<StreamError>) -> Promise<()> {
        if self.released.get() {
            return rejected(released_error());
        }
        self.stream.abort(reason.unwrap_or(StreamError::Aborted(None)))
    }

    /// Settles once the stream has room for more data.
    pub fn ready(&self) -> Promise<()> {
        if self.released.get() {
            return rejected(released_error());
        }
        self.stream.ready(self.id)
    }

    pub fn closed(&self) -> Promise<()> {
        self.closed.clone()
    }

    pub fn desired_size(&self) -> StreamResult<Option<isize>> {
        if self.released.get() {
            return Err(released_error());
        }
        Ok(self.stream.desired_size())
    }

    pub fn release_lock(&self) {
        if !self.released.replace(true) {
            self.stream.release_writer(self.id, true);
        }
    }
}

impl<T> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        if !self.released.get() {
            self.stream.core.borrow_mut().lock.release_writer(self.id, false);
        }
    }
}

impl<T: 'static> futures::Sink<T> for WritableStreamDefaultWriter<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let this = self.get_mut();
        // The waker lives in this clone, so it has to outlive the pending poll.
        let ready = match this.pending_ready.as_mut() {
            Some(ready) => ready,
            None => this.pending_ready.insert(this.ready()),
        };
        let result = futures::ready!(ready.poll_unpin(cx));
        this.pending_ready = None;
        Poll::Ready(result)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> StreamResult<()> {
        let this = self.get_mut();
        if this.released.get() {
            return Err(released_error());
        }
        this.last_write = Some(this.stream.write(item));
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let this = self.get_mut();
        if let Some(write) = this.last_write.as_mut() {
            futures::ready!(write.poll_unpin(cx))?;
            this.last_write = None;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        futures::ready!(self.as_mut().poll_flush(cx))?;
        let this = self.get_mut();
        let closing = match this.closing.as_mut() {
            Some(closing) => closing,
            None => this.closing.insert(this.stream.close()),
        };
        closing.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        SizeFnStrategy,
        test_util::{local_test, settle},
    };
    use futures::SinkExt;
    use tokio::sync::Notify;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(tokio::task::spawn_local)
    }

    #[derive(Default, Clone)]
    struct Log(Rc<RefCell<Vec<String>>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.borrow_mut().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.borrow().clone()
        }
    }

    struct RecordingSink {
        log: Log,
        gate: Option<Rc<Notify>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingSink {
        fn new(log: &Log) -> Self {
            Self {
                log: log.clone(),
                gate: None,
                fail_on: None,
            }
        }
    }

    impl WritableSink<&'static str> for RecordingSink {
        fn write(&mut self, chunk: &'static str, _: WritableStreamDefaultController) -> StreamFuture<()> {
            let log = self.log.clone();
            let gate = self.gate.clone();
            let fail = self.fail_on == Some(chunk);
            async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                if fail {
                    return Err(StreamError::from(format!("cannot write {chunk}")));
                }
                log.push(chunk);
                Ok(())
            }
            .boxed_local()
        }

        fn close(&mut self) -> StreamFuture<()> {
            self.log.push("close");
            ready_ok()
        }

        fn abort(&mut self, reason: StreamError) -> StreamFuture<()> {
            self.log.push(format!("abort: {reason}"));
            ready_ok()
        }
    }

    #[tokio::test]
    async fn writes_reach_sink_in_order_before_close() {
        local_test(|| async {
            let log = Log::default();
            let stream = WritableStream::builder(RecordingSink::new(&log)).build(&ctx());
            let writer = stream.get_writer().unwrap();
            let first = writer.write("a");
            let second = writer.write("b");
            let closed = writer.close();
            first.await.unwrap();
            second.await.unwrap();
            closed.await.unwrap();
            writer.closed().await.unwrap();
            assert_eq!(log.entries(), ["a", "b", "close"]);
            assert!(stream.is_closed());
        })
        .await;
    }

    #[tokio::test]
    async fn ready_waits_for_backpressure_to_clear() {
        local_test(|| async {
            let log = Log::default();
            let gate = Rc::new(Notify::new());
            let mut sink = RecordingSink::new(&log);
            sink.gate = Some(gate.clone());
            let stream = WritableStream::builder(sink).build(&ctx());
            let writer = stream.get_writer().unwrap();
            writer.ready().await.unwrap();

            let first = writer.write("a");
            let second = writer.write("b");
            assert_eq!(writer.desired_size().unwrap(), Some(-1));
            let ready = writer.ready();
            settle().await;
            assert!(crate::platform::peek(&ready).is_none());

            gate.notify_one();
            first.await.unwrap();
            gate.notify_one();
            second.await.unwrap();
            ready.await.unwrap();
            assert_eq!(writer.desired_size().unwrap(), Some(1));
        })
        .await;
    }

    #[tokio::test]
    async fn failed_write_errors_the_stream() {
        local_test(|| async {
            let log = Log::default();
            let mut sink = RecordingSink::new(&log);
            sink.fail_on = Some("bad");
            let stream = WritableStream::builder(sink).build(&ctx());
            let writer = stream.get_writer().unwrap();
            let bad = writer.write("bad");
            let after = writer.write("after");
            assert_eq!(bad.await.unwrap_err().to_string(), "cannot write bad");
            assert_eq!(after.await.unwrap_err().to_string(), "cannot write bad");
            assert_eq!(writer.closed().await.unwrap_err().to_string(), "cannot write bad");
            assert!(writer.write("late").await.is_err());
            assert!(log.entries().is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn second_abort_shares_the_first() {
        local_test(|| async {
            let log = Log::default();
            let stream = WritableStream::builder(RecordingSink::new(&log)).build(&ctx());
            let first = stream.abort(Some("A".into()));
            let second = stream.abort(Some("B".into()));
            first.await.unwrap();
            second.await.unwrap();
            assert_eq!(log.entries(), ["abort: A"]);
            assert_eq!(stream.errored().unwrap().to_string(), "A");
        })
        .await;
    }

    #[tokio::test]
    async fn abort_rejects_queued_writes_and_signals_the_sink() {
        local_test(|| async {
            let log = Log::default();
            let gate = Rc::new(Notify::new());
            let mut sink = RecordingSink::new(&log);
            sink.gate = Some(gate.clone());
            let signal = Rc::new(RefCell::new(None));
            struct Observer(Rc<RefCell<Option<AbortSignal>>>, RecordingSink);
            impl WritableSink<&'static str> for Observer {
                fn write(&mut self, chunk: &'static str, c: WritableStreamDefaultController) -> StreamFuture<()> {
                    *self.0.borrow_mut() = Some(c.signal());
                    self.1.write(chunk, c)
                }
                fn abort(&mut self, reason: StreamError) -> StreamFuture<()> {
                    self.1.abort(reason)
                }
            }
            let stream = WritableStream::builder(Observer(signal.clone(), sink)).build(&ctx());
            let writer = stream.get_writer().unwrap();
            let in_flight = writer.write("a");
            let queued = writer.write("b");
            settle().await;

            let abort = writer.abort(Some("stop".into()));
            assert!(signal.borrow().as_ref().unwrap().is_aborted());
            gate.notify_one();
            in_flight.await.unwrap();
            assert_eq!(queued.await.unwrap_err().to_string(), "stop");
            abort.await.unwrap();
            assert_eq!(log.entries(), ["a", "abort: stop"]);
        })
        .await;
    }

    #[tokio::test]
    async fn close_twice_and_write_after_close_are_usage_errors() {
        local_test(|| async {
            let log = Log::default();
            let stream = WritableStream::builder(RecordingSink::new(&log)).build(&ctx());
            let writer = stream.get_writer().unwrap();
            let closing = writer.close();
            assert!(writer.close().await.unwrap_err().is_usage_error());
            assert!(writer.write("x").await.unwrap_err().is_usage_error());
            closing.await.unwrap();
            writer.release_lock();
            assert_eq!(
                stream.close().await.unwrap_err().to_string(),
                "TypeError: This WritableStream has been closed."
            );
        })
        .await;
    }

    #[tokio::test]
    async fn released_writer_rejects_everything() {
        local_test(|| async {
            let log = Log::default();
            let stream = WritableStream::builder(RecordingSink::new(&log)).build(&ctx());
            let writer = stream.get_writer().unwrap();
            assert!(stream.get_writer().is_err());
            assert!(stream.close().await.unwrap_err().is_usage_error());
            writer.release_lock();
            assert!(!stream.is_locked());
            assert!(writer.closed().await.unwrap_err().is_usage_error());
            assert!(writer.write("x").await.unwrap_err().is_usage_error());
            assert!(writer.desired_size().is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn sink_controller_error_fails_pending_writes() {
        struct Failing;
        impl WritableSink<u32> for Failing {
            fn write(&mut self, _: u32, controller: WritableStreamDefaultController) -> StreamFuture<()> {
                controller.error("sink gave up".into());
                ready_ok()
            }
        }
        local_test(|| async {
            let stream = WritableStream::builder(Failing).build(&ctx());
            let writer = stream.get_writer().unwrap();
            let first = writer.write(1);
            let second = writer.write(2);
            first.await.unwrap();
            assert_eq!(second.await.unwrap_err().to_string(), "sink gave up");
            assert_eq!(writer.closed().await.unwrap_err().to_string(), "sink gave up");
        })
        .await;
    }

    #[tokio::test]
    async fn failing_size_rejects_the_write() {
        local_test(|| async {
            let log = Log::default();
            let strategy = SizeFnStrategy::new(4, |chunk: &&'static str| {
                if chunk.is_empty() {
                    Err(StreamError::from("empty chunk"))
                } else {
                    Ok(chunk.len())
                }
            });
            let stream = WritableStream::builder(RecordingSink::new(&log))
                .strategy(strategy)
                .build(&ctx());
            let writer = stream.get_writer().unwrap();
            assert_eq!(writer.write("").await.unwrap_err().to_string(), "empty chunk");
            assert_eq!(stream.errored().unwrap().to_string(), "empty chunk");
        })
        .await;
    }

    #[tokio::test]
    async fn writer_works_as_futures_sink() {
        local_test(|| async {
            let log = Log::default();
            let stream = WritableStream::builder(RecordingSink::new(&log)).build(&ctx());
            let mut writer = stream.get_writer().unwrap();
            writer.send("one").await.unwrap();
            writer.send("two").await.unwrap();
            SinkExt::close(&mut writer).await.unwrap();
            assert_eq!(log.entries(), ["one", "two", "close"]);
        })
        .await;
    }

    #[tokio::test]
    async fn sink_send_resumes_once_backpressure_clears() {
        local_test(|| async {
            let log = Log::default();
            let gate = Rc::new(Notify::new());
            let mut sink = RecordingSink::new(&log);
            sink.gate = Some(gate.clone());
            let stream = WritableStream::builder(sink).build(&ctx());
            let mut writer = stream.get_writer().unwrap();
            writer.feed("a").await.unwrap();
            assert_eq!(writer.desired_size().unwrap(), Some(0));

            let sending = tokio::task::spawn_local(async move {
                writer.send("b").await?;
                SinkExt::close(&mut writer).await
            });
            settle().await;
            assert!(log.entries().is_empty());

            gate.notify_one();
            settle().await;
            gate.notify_one();
            sending.await.unwrap().unwrap();
            assert_eq!(log.entries(), ["a", "b", "close"]);
        })
        .await;
    }

    #[tokio::test]
    async fn dropped_writer_leaves_stream_locked() {
        local_test(|| async {
            let log = Log::default();
            let stream = WritableStream::builder(RecordingSink::new(&log)).build(&ctx());
            drop(stream.get_writer().unwrap());
            assert!(stream.is_locked());
            assert!(stream.get_writer().is_err());
            assert!(stream.close().await.unwrap_err().is_usage_error());
        })
        .await;
    }

    #[test]
    fn gc_trace_reports_queued_writes() {
        let log = Log::default();
        let stream = WritableStream::builder(RecordingSink::new(&log))
            .build(&ExecutionContext::new(|_| ()));
        let writer = stream.get_writer().unwrap();
        let _a = writer.write("a");
        let _b = writer.write("b");
        let counter = crate::streams::gc::GcCounter::trace(&stream);
        assert_eq!(counter.entries, 2);
    }
}
