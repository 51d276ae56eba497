//! Piping a readable stream into a writable stream, and the abort signal
//! that can stop a pipe or a sink midway.
//!
//! A pipe holds the pipe lock on both ends for its whole life. Each step of
//! the loop first looks at the signal, then at the end state of both sides,
//! and only then moves one chunk. Whichever side ended first decides how the
//! other side is shut down, subject to the `prevent_*` options.

use super::{
    ReadResult, StreamResult, StreamTypeMarker,
    error::StreamError,
    lock::{PipeFlags, PipeLock},
    queue::QueueKind,
    readable::{ReadableStream, ReadableStreamInner},
    writable::{WritableSide, WritableStream, WritableStreamInner},
};
use crate::platform::{Promise, promise, rejected, resolved};
use futures::future::{self, Either};
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};
use tracing::{debug, trace};

#[derive(Default)]
struct SignalInner {
    reason: RefCell<Option<StreamError>>,
    wakers: RefCell<Vec<Waker>>,
}

/// Observes an abort requested through an [`AbortController`].
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Rc<SignalInner>,
}

impl AbortSignal {
    /// A signal that is never aborted.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.reason.borrow().is_some()
    }

    pub fn reason(&self) -> Option<StreamError> {
        self.inner.reason.borrow().clone()
    }

    /// Resolves with the abort reason once the signal trips.
    pub fn aborted(&self) -> AbortedFuture {
        AbortedFuture {
            signal: self.clone(),
        }
    }

    /// Race `fut` against the signal. An abort that wins yields its reason.
    pub fn with_abort<F, R>(&self, fut: F) -> impl Future<Output = StreamResult<R>> + 'static
    where
        F: Future<Output = R> + 'static,
        R: 'static,
    {
        let aborted = self.aborted();
        let fut = Box::pin(fut);
        async move {
            if let Some(reason) = aborted.signal.reason() {
                return Err(reason);
            }
            match future::select(fut, aborted).await {
                Either::Left((value, _)) => Ok(value),
                Either::Right((reason, _)) => Err(reason),
            }
        }
    }

    fn register(&self, waker: &Waker) {
        let mut wakers = self.inner.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn trigger(&self, reason: StreamError) -> bool {
        {
            let mut slot = self.inner.reason.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        let wakers = std::mem::take(&mut *self.inner.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Future returned by [`AbortSignal::aborted`].
pub struct AbortedFuture {
    signal: AbortSignal,
}

impl Future for AbortedFuture {
    type Output = StreamError;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamError> {
        match self.signal.reason() {
            Some(reason) => Poll::Ready(reason),
            None => {
                self.signal.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

/// Owns the right to trip an [`AbortSignal`].
#[derive(Clone, Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Trip the signal. Only the first reason is kept.
    pub fn abort(&self, reason: StreamError) {
        if self.signal.trigger(reason) {
            trace!("abort signal tripped");
        }
    }
}

/// Options for [`ReadableStream::pipe_to`].
#[derive(Clone, Debug, Default)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors.
    pub prevent_cancel: bool,
    pub signal: Option<AbortSignal>,
}

/// The readable end of a pipe, seen from the destination.
pub(crate) trait PipeSource<T> {
    fn is_closed(&self) -> bool;
    fn try_get_errored(&self) -> Option<StreamError>;
    /// Give up the pipe lock, canceling the source first when a reason is given.
    fn release(&self, cancel: Option<StreamError>) -> Promise<()>;
    fn read(&self) -> Promise<ReadResult<T>>;
}

impl<K: QueueKind> PipeSource<K::Value> for ReadableStreamInner<K> {
    fn is_closed(&self) -> bool {
        ReadableStreamInner::is_closed(self)
    }

    fn try_get_errored(&self) -> Option<StreamError> {
        ReadableStreamInner::try_get_errored(self)
    }

    fn release(&self, cancel: Option<StreamError>) -> Promise<()> {
        let canceled = match cancel {
            Some(reason) => self.cancel(reason),
            None => resolved(()),
        };
        self.release_pipe_lock();
        canceled
    }

    fn read(&self) -> Promise<ReadResult<K::Value>> {
        self.read_default()
    }
}

impl<T: Clone + 'static, S: StreamTypeMarker<T>> ReadableStream<T, S> {
    /// Move every chunk of this stream into `destination`.
    ///
    /// Both streams stay locked until the returned promise settles. The
    /// promise resolves once the source has closed (and, unless
    /// `prevent_close` is set, the destination has closed too) and rejects
    /// with whatever ended the pipe otherwise.
    pub fn pipe_to(&self, destination: &WritableStream<T>, options: StreamPipeOptions) -> Promise<()> {
        let source = Rc::clone(self.inner());
        let dest = Rc::clone(destination.inner());
        if source.is_locked() {
            return rejected(StreamError::type_error(
                "This ReadableStream is currently locked to a reader.",
            ));
        }
        if dest.is_locked() {
            return rejected(StreamError::type_error(
                "This WritableStream is currently locked to a writer.",
            ));
        }
        if !source.try_pipe_lock() {
            return rejected(StreamError::type_error(
                "This ReadableStream is currently locked to a reader.",
            ));
        }
        let pipe_source: Rc<dyn PipeSource<T>> = source.clone();
        let lock = PipeLock {
            source: pipe_source,
            flags: PipeFlags {
                prevent_close: options.prevent_close,
                prevent_abort: options.prevent_abort,
                prevent_cancel: options.prevent_cancel,
            },
            signal: options.signal,
        };
        if !dest.try_pipe_lock(lock) {
            source.release_pipe_lock();
            return rejected(StreamError::type_error(
                "This WritableStream is currently locked to a writer.",
            ));
        }
        debug!(
            prevent_close = options.prevent_close,
            prevent_abort = options.prevent_abort,
            prevent_cancel = options.prevent_cancel,
            "pipe started"
        );

        let (resolver, done) = promise();
        source.ctx.spawn(async move {
            let result = pipe_loop(dest).await;
            match &result {
                Ok(()) => debug!("pipe finished"),
                Err(reason) => debug!(%reason, "pipe failed"),
            }
            resolver.settle(result);
        });
        done
    }
}

/// Why a pipe stopped before moving the next chunk.
enum Shutdown {
    Aborted(StreamError),
    SourceErrored(StreamError),
    DestErrored(StreamError),
    SourceClosed,
    DestClosed,
}

/// The checks run before each chunk moves, in order.
fn check<T>(dest: &WritableStreamInner<T>, pipe: &PipeLock<T>) -> Option<Shutdown>
where
    T: 'static,
{
    if let Some(reason) = pipe.signal.as_ref().and_then(AbortSignal::reason) {
        return Some(Shutdown::Aborted(reason));
    }
    if let Some(reason) = pipe.source.try_get_errored() {
        return Some(Shutdown::SourceErrored(reason));
    }
    if let Some(reason) = dest.erroring_or_errored() {
        return Some(Shutdown::DestErrored(reason));
    }
    if pipe.source.is_closed() {
        return Some(Shutdown::SourceClosed);
    }
    if dest.is_closed() {
        return Some(Shutdown::DestClosed);
    }
    None
}

/// Release both locks and carry the end over to the side that is still open.
async fn shut_down<T: 'static>(
    dest: &WritableStreamInner<T>,
    pipe: &PipeLock<T>,
    shutdown: Shutdown,
) -> StreamResult<()> {
    let flags = pipe.flags;
    let cancel_unless_prevented = |reason: &StreamError| (!flags.prevent_cancel).then(|| reason.clone());
    dest.release_pipe_lock();
    match shutdown {
        Shutdown::Aborted(reason) => {
            debug!(%reason, "pipe aborted by signal");
            let canceled = pipe.source.release(cancel_unless_prevented(&reason));
            if !flags.prevent_abort {
                dest.abort(reason.clone()).await?;
            }
            let _ = canceled.await;
            Err(reason)
        }
        Shutdown::SourceErrored(reason) => {
            debug!(%reason, "pipe source errored");
            let _ = pipe.source.release(None);
            if !flags.prevent_abort {
                dest.abort(reason.clone()).await?;
            }
            Err(reason)
        }
        Shutdown::DestErrored(reason) => {
            debug!(%reason, "pipe destination errored");
            let _ = pipe.source.release(cancel_unless_prevented(&reason)).await;
            Err(reason)
        }
        Shutdown::SourceClosed => {
            trace!("pipe source closed");
            let _ = pipe.source.release(None);
            if flags.prevent_close {
                return Ok(());
            }
            dest.close().await
        }
        Shutdown::DestClosed => {
            let reason = StreamError::type_error("This destination writable stream is closed.");
            debug!(%reason, "pipe destination closed");
            let _ = pipe.source.release(cancel_unless_prevented(&reason)).await;
            Err(reason)
        }
    }
}

/// Await `fut` unless the pipe's signal trips first.
async fn unless_aborted<T, R: Clone + 'static>(
    pipe: &PipeLock<T>,
    fut: Promise<R>,
) -> Option<StreamResult<R>> {
    match &pipe.signal {
        Some(signal) => match future::select(fut, signal.aborted()).await {
            Either::Left((result, _)) => Some(result),
            Either::Right(_) => None,
        },
        None => Some(fut.await),
    }
}

async fn pipe_loop<T: Clone + 'static>(dest: Rc<WritableStreamInner<T>>) -> StreamResult<()> {
    loop {
        // Released by someone else: the pipe is over.
        let Some(pipe) = dest.pipe() else {
            return Ok(());
        };
        if let Some(shutdown) = check(&dest, &pipe) {
            return shut_down(&dest, &pipe, shutdown).await;
        }

        let Some(read) = unless_aborted(&pipe, pipe.source.read()).await else {
            continue;
        };
        if dest.pipe().is_none() {
            return Ok(());
        }
        let chunk = match read {
            Ok(ReadResult {
                value: Some(chunk),
                done: false,
            }) => chunk,
            Ok(_) => {
                if pipe.source.is_closed() {
                    continue;
                }
                return shut_down(&dest, &pipe, Shutdown::SourceClosed).await;
            }
            Err(reason) => {
                if pipe.source.try_get_errored().is_some() {
                    continue;
                }
                return shut_down(&dest, &pipe, Shutdown::SourceErrored(reason)).await;
            }
        };

        let Some(written) = unless_aborted(&pipe, dest.write(chunk)).await else {
            continue;
        };
        if let Err(reason) = written {
            if dest.pipe().is_none() {
                return Err(reason);
            }
            dest.release_pipe_lock();
            debug!(%reason, "pipe write failed");
            let cancel = (!pipe.flags.prevent_cancel).then(|| reason.clone());
            let _ = pipe.source.release(cancel).await;
            return Err(reason);
        }
    }
}
