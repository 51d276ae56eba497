//! Transform streams: a writable front end feeding a readable back end
//! through a user [`Transformer`].
//!
//! Both ends share one backpressure flag. It starts raised; a pull from the
//! readable side lowers it and releases the write that was waiting, and an
//! enqueue that fills the readable queue raises it again.

use super::{
    DefaultStream, QueuingStrategy, StreamResult, StreamTypeMarker,
    error::StreamError,
    gc::{GcTraced, GcVisitor},
    pipe::StreamPipeOptions,
    readable::{
        ReadableSource, ReadableStream, ReadableStreamBuilder, ReadableStreamDefaultController,
        WeakReadableController,
    },
    value_queue::ValueQueue,
    writable::{
        WritableSide, WritableSink, WritableStream, WritableStreamBuilder,
        WritableStreamDefaultController,
    },
};
use crate::platform::{
    ExecutionContext, Promise, Resolver, StreamFuture, maybe_run_algorithm, promise, ready_ok,
};
use futures::{FutureExt, future::LocalBoxFuture};
use std::{
    cell::RefCell,
    marker::PhantomData,
    rc::{Rc, Weak},
};
use tracing::{debug, trace};

const DEFAULT_READABLE_HIGH_WATER_MARK: usize = 0;
const DEFAULT_WRITABLE_HIGH_WATER_MARK: usize = 1;

/// User algorithms behind a [`TransformStream`].
pub trait Transformer<I: 'static, O: Clone + 'static>: 'static {
    fn start(&mut self, controller: TransformStreamDefaultController<O>) -> StreamFuture<()> {
        let _ = controller;
        ready_ok()
    }

    /// Turn one written chunk into zero or more readable chunks through
    /// [`TransformStreamDefaultController::enqueue`].
    fn transform(&mut self, chunk: I, controller: TransformStreamDefaultController<O>)
    -> StreamFuture<()>;

    /// Runs once after the writable side closes, before the readable side does.
    fn flush(&mut self, controller: TransformStreamDefaultController<O>) -> StreamFuture<()> {
        let _ = controller;
        ready_ok()
    }
}

/// Passes every chunk through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl<T: Clone + 'static> Transformer<T, T> for IdentityTransformer {
    fn transform(&mut self, chunk: T, controller: TransformStreamDefaultController<T>) -> StreamFuture<()> {
        futures::future::ready(controller.enqueue(chunk)).boxed_local()
    }
}

type TransformerRef<I, O> = Rc<RefCell<dyn Transformer<I, O>>>;
type TransformerSlot<I, O> = Rc<RefCell<Option<TransformerRef<I, O>>>>;

struct TransformCore<O: Clone + 'static> {
    readable: Option<WeakReadableController<ValueQueue<O>>>,
    writable: Option<Weak<dyn WritableSide>>,
    backpressure: bool,
    backpressure_change: Option<Resolver<()>>,
    backpressure_promise: Promise<()>,
    clear_algorithms: Option<Box<dyn FnOnce()>>,
    // First reason the writable side was shut down with.
    ended: Option<StreamError>,
}

/// Handed to a [`Transformer`] to feed the readable side.
pub struct TransformStreamDefaultController<O: Clone + 'static> {
    core: Rc<RefCell<TransformCore<O>>>,
}

impl<O: Clone + 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<O: Clone + 'static> TransformStreamDefaultController<O> {
    fn new() -> Self {
        let (resolver, backpressure_promise) = promise();
        Self {
            core: Rc::new(RefCell::new(TransformCore {
                readable: None,
                writable: None,
                backpressure: false,
                backpressure_change: Some(resolver),
                backpressure_promise,
                clear_algorithms: None,
                ended: None,
            })),
        }
    }

    /// Queue a chunk on the readable side.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        let readable = self
            .readable_controller()
            .filter(|readable| readable.can_close_or_enqueue())
            .ok_or_else(|| {
                StreamError::type_error("The readable side of this TransformStream is no longer readable.")
            })?;
        if let Err(reason) = readable.enqueue(chunk) {
            self.error_writable_and_unblock_write(reason.clone());
            return Err(reason);
        }
        // An enqueue may only raise backpressure.
        if readable.has_backpressure() && !self.core.borrow().backpressure {
            self.set_backpressure(true);
        }
        Ok(())
    }

    /// Error both sides.
    pub fn error(&self, reason: StreamError) {
        debug!(%reason, "transform stream erroring");
        if let Some(readable) = self.take_readable() {
            readable.error(reason.clone());
        }
        self.error_writable_and_unblock_write(reason);
    }

    /// Close the readable side and error the writable side.
    pub fn terminate(&self) {
        debug!("transform stream terminated");
        if let Some(readable) = self.take_readable().filter(|readable| readable.can_close_or_enqueue()) {
            if let Err(reason) = readable.close() {
                debug!(%reason, "closing the readable side on terminate failed");
            }
        }
        self.error_writable_and_unblock_write(StreamError::type_error(
            "The transform stream has been terminated",
        ));
    }

    /// Desired size of the readable side. `None` once it has errored or been
    /// decoupled.
    pub fn desired_size(&self) -> Option<isize> {
        self.readable_controller()
            .and_then(|readable| readable.desired_size())
    }

    fn readable_controller(&self) -> Option<ReadableStreamDefaultController<O>> {
        self.core
            .borrow()
            .readable
            .as_ref()
            .and_then(ReadableStreamDefaultController::from_weak)
    }

    fn take_readable(&self) -> Option<ReadableStreamDefaultController<O>> {
        let weak = self.core.borrow_mut().readable.take();
        weak.as_ref().and_then(ReadableStreamDefaultController::from_weak)
    }

    fn writable(&self) -> Option<Rc<dyn WritableSide>> {
        self.core
            .borrow()
            .writable
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn ended_reason(&self) -> StreamError {
        self.core
            .borrow()
            .ended
            .clone()
            .unwrap_or_else(|| StreamError::type_error("Writing to the TransformStream failed."))
    }

    fn set_backpressure(&self, backpressure: bool) {
        let previous = {
            let mut core = self.core.borrow_mut();
            let (resolver, change) = promise();
            core.backpressure = backpressure;
            core.backpressure_promise = change;
            core.backpressure_change.replace(resolver)
        };
        trace!(backpressure, "transform backpressure changed");
        if let Some(previous) = previous {
            previous.resolve(());
        }
    }

    fn error_writable_and_unblock_write(&self, reason: StreamError) {
        let (clear, writable, unblock) = {
            let mut core = self.core.borrow_mut();
            if core.ended.is_none() {
                core.ended = Some(reason.clone());
            }
            (
                core.clear_algorithms.take(),
                core.writable.take(),
                core.backpressure,
            )
        };
        if let Some(clear) = clear {
            clear();
        }
        if let Some(writable) = writable.and_then(|weak| weak.upgrade()) {
            if writable.is_writable() {
                writable.force_error(reason);
            }
        }
        if unblock {
            self.set_backpressure(false);
        }
    }

    async fn write<I: 'static>(self, chunk: I, transformer: TransformerSlot<I, O>) -> StreamResult<()> {
        let Some(writable) = self.writable() else {
            return Err(self.ended_reason());
        };
        if let Some(reason) = writable.erroring_or_errored() {
            return Err(reason);
        }
        let waiting = {
            let core = self.core.borrow();
            core.backpressure.then(|| core.backpressure_promise.clone())
        };
        if let Some(change) = waiting {
            trace!("transform write waiting on backpressure");
            change.await?;
            match self.writable() {
                Some(writable) => {
                    if let Some(reason) = writable.erroring_or_errored() {
                        return Err(reason);
                    }
                }
                None => return Err(self.ended_reason()),
            }
        }

        let current = transformer.borrow().clone();
        let Some(current) = current else {
            return Err(self.ended_reason());
        };
        let fut = current.borrow_mut().transform(chunk, self.clone());
        match fut.await {
            Ok(()) => Ok(()),
            Err(reason) => {
                self.error(reason.clone());
                Err(reason)
            }
        }
    }

    async fn flush<I: 'static>(self, transformer: TransformerSlot<I, O>) -> StreamResult<()> {
        let current = transformer.borrow_mut().take();
        let result = match current {
            Some(current) => {
                let fut = current.borrow_mut().flush(self.clone());
                fut.await
            }
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                if let Some(readable) = self
                    .readable_controller()
                    .filter(|readable| readable.can_close_or_enqueue())
                {
                    readable.close()?;
                }
                Ok(())
            }
            Err(reason) => {
                self.error(reason.clone());
                Err(reason)
            }
        }
    }

    fn pull(&self) -> Promise<()> {
        self.set_backpressure(false);
        self.core.borrow().backpressure_promise.clone()
    }

    fn cancel(&self, reason: StreamError) {
        debug!(%reason, "readable side of transform canceled");
        drop(self.take_readable());
        self.error_writable_and_unblock_write(reason);
    }

    fn has_pending_backpressure(&self) -> bool {
        self.core.borrow().backpressure
    }
}

struct TransformSink<I: 'static, O: Clone + 'static> {
    controller: TransformStreamDefaultController<O>,
    transformer: TransformerSlot<I, O>,
    start: Promise<()>,
}

impl<I: 'static, O: Clone + 'static> WritableSink<I> for TransformSink<I, O> {
    fn start(&mut self, _: WritableStreamDefaultController) -> StreamFuture<()> {
        self.start.clone().boxed_local()
    }

    fn write(&mut self, chunk: I, _: WritableStreamDefaultController) -> StreamFuture<()> {
        self.controller
            .clone()
            .write(chunk, Rc::clone(&self.transformer))
            .boxed_local()
    }

    fn close(&mut self) -> StreamFuture<()> {
        self.controller
            .clone()
            .flush(Rc::clone(&self.transformer))
            .boxed_local()
    }

    fn abort(&mut self, reason: StreamError) -> StreamFuture<()> {
        self.controller.error(reason);
        ready_ok()
    }
}

struct TransformSource<O: Clone + 'static> {
    controller: TransformStreamDefaultController<O>,
    start: Promise<()>,
}

impl<O: Clone + 'static> ReadableSource<O> for TransformSource<O> {
    fn start(&mut self, _: ReadableStreamDefaultController<O>) -> StreamFuture<()> {
        self.start.clone().boxed_local()
    }

    fn pull(&mut self, _: ReadableStreamDefaultController<O>) -> StreamFuture<()> {
        self.controller.pull().boxed_local()
    }

    fn cancel(&mut self, reason: StreamError) -> StreamFuture<()> {
        self.controller.cancel(reason);
        ready_ok()
    }
}

/// A writable stream of `I` whose chunks come out of a readable stream of `O`.
pub struct TransformStream<I: 'static, O: Clone + 'static> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
    controller: TransformStreamDefaultController<O>,
}

impl<I: 'static, O: Clone + 'static> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
            controller: self.controller.clone(),
        }
    }
}

impl<I: 'static, O: Clone + 'static> TransformStream<I, O> {
    pub fn builder<Tr: Transformer<I, O>>(transformer: Tr) -> TransformStreamBuilder<I, O> {
        TransformStreamBuilder {
            transformer: Rc::new(RefCell::new(transformer)),
            readable: Box::new(|builder: ReadableStreamBuilder<O>| builder),
            writable: Box::new(|builder: WritableStreamBuilder<I>| builder),
            _marker: PhantomData,
        }
    }

    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    pub fn into_parts(self) -> (WritableStream<I>, ReadableStream<O>) {
        (self.writable, self.readable)
    }
}

impl<T: Clone + 'static> TransformStream<T, T> {
    /// A transform stream that forwards chunks unchanged.
    pub fn identity(ctx: &ExecutionContext) -> Self {
        Self::builder(IdentityTransformer).build(ctx)
    }
}

impl<I: 'static, O: Clone + 'static> GcTraced for TransformStream<I, O> {
    fn visit_for_gc(&self, visitor: &mut dyn GcVisitor) {
        self.readable.visit_for_gc(visitor);
        self.writable.visit_for_gc(visitor);
        if self.controller.has_pending_backpressure() {
            visitor.visit_pending("transform backpressure");
        }
    }
}

type Configure<B> = Box<dyn FnOnce(B) -> B>;

pub struct TransformStreamBuilder<I: 'static, O: Clone + 'static> {
    transformer: TransformerRef<I, O>,
    readable: Configure<ReadableStreamBuilder<O>>,
    writable: Configure<WritableStreamBuilder<I>>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I: 'static, O: Clone + 'static> TransformStreamBuilder<I, O> {
    /// Queuing strategy of the writable side. Defaults to a high water mark of 1.
    pub fn writable_strategy<Q: QueuingStrategy<I> + 'static>(mut self, strategy: Q) -> Self {
        self.writable = Box::new(move |builder| builder.strategy(strategy));
        self
    }

    /// Queuing strategy of the readable side. Defaults to a high water mark of 0.
    pub fn readable_strategy<Q: QueuingStrategy<O> + 'static>(mut self, strategy: Q) -> Self {
        self.readable = Box::new(move |builder| builder.strategy(strategy));
        self
    }

    pub fn build(self, ctx: &ExecutionContext) -> TransformStream<I, O> {
        let (start_resolver, start) = promise();
        let controller = TransformStreamDefaultController::new();
        let slot: TransformerSlot<I, O> = Rc::new(RefCell::new(Some(Rc::clone(&self.transformer))));

        let writable = (self.writable)(
            WritableStream::builder(TransformSink {
                controller: controller.clone(),
                transformer: Rc::clone(&slot),
                start: start.clone(),
            })
            .high_water_mark(DEFAULT_WRITABLE_HIGH_WATER_MARK),
        )
        .build(ctx);
        let readable = (self.readable)(
            ReadableStream::builder(TransformSource {
                controller: controller.clone(),
                start,
            })
            .high_water_mark(DEFAULT_READABLE_HIGH_WATER_MARK),
        )
        .build(ctx);

        let writable_side: Rc<dyn WritableSide> = Rc::clone(writable.inner()) as Rc<dyn WritableSide>;
        let weak_slot = Rc::downgrade(&slot);
        {
            let mut core = controller.core.borrow_mut();
            core.readable = readable
                .default_controller()
                .map(|readable| readable.downgrade());
            core.writable = Some(Rc::downgrade(&writable_side));
            core.clear_algorithms = Some(Box::new(move || {
                if let Some(slot) = weak_slot.upgrade() {
                    slot.borrow_mut().take();
                }
            }));
        }
        controller.set_backpressure(true);

        let handle = controller.clone();
        maybe_run_algorithm(
            ctx,
            Some(self.transformer),
            move |transformer| transformer.start(handle),
            move |result| {
                match &result {
                    Ok(()) => trace!("transformer started"),
                    Err(reason) => debug!(%reason, "transformer start failed"),
                }
                start_resolver.settle(result);
            },
        );

        TransformStream {
            readable,
            writable,
            controller,
        }
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream<I, O>
    where
        F: Fn(LocalBoxFuture<'static, ()>) -> R + 'static,
    {
        self.build(&ExecutionContext::new(spawn_fn))
    }
}

impl<T: Clone + 'static, S: StreamTypeMarker<T>> ReadableStream<T, S> {
    /// Pipe this stream into `transform`'s writable side and hand back its
    /// readable side.
    pub fn pipe_through<O: Clone + 'static>(
        &self,
        transform: &TransformStream<T, O>,
        options: StreamPipeOptions,
    ) -> StreamResult<ReadableStream<O, DefaultStream>> {
        if self.is_locked() {
            return Err(StreamError::type_error(
                "This ReadableStream is currently locked to a reader.",
            ));
        }
        if transform.writable.is_locked() {
            return Err(StreamError::type_error(
                "This WritableStream is currently locked to a writer.",
            ));
        }
        let piped = self.pipe_to(&transform.writable, options);
        self.inner().ctx.then(piped, |result| {
            if let Err(reason) = result {
                debug!(%reason, "pipe into transform stream ended");
            }
        });
        Ok(transform.readable.clone())
    }
}
