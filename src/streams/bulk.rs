//! Consumers that take over a readable stream completely.
//!
//! [`ReadableStream::read_all_bytes`] and [`ReadableStream::read_all_text`]
//! collect every chunk into one buffer. [`ReadableStream::pump_to`] forwards
//! every chunk into a [`ByteSink`]. Both detach the stream's consumer, so the
//! original stream is left locked and closed.

use super::{
    ReadResult, StreamResult, StreamTypeMarker,
    error::StreamError,
    queue::QueueKind,
    readable::{
        ConsumerOwner, PendingReads, ReadPendingScope, Readable, ReadableState, ReadableStream,
        Terminal,
    },
};
use crate::platform::{Promise, StreamFuture, promise, ready_ok, rejected};
use bytes::{Bytes, BytesMut};
use futures::{
    AsyncWrite, AsyncWriteExt, FutureExt,
    lock::Mutex,
};
use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};
use tracing::{debug, trace};

enum BulkState<K: QueueKind> {
    Readable(Rc<Readable<K>>),
    Closed,
    Errored(StreamError),
}

impl<K: QueueKind> From<ReadableState<K>> for BulkState<K> {
    fn from(state: ReadableState<K>) -> Self {
        match state {
            ReadableState::Readable(readable) => BulkState::Readable(readable),
            ReadableState::Closed => BulkState::Closed,
            ReadableState::Errored(reason) => BulkState::Errored(reason),
        }
    }
}

/// Reads a stream to its end, holding everything in memory up to `limit` bytes.
struct AllReader<K: QueueKind> {
    state: RefCell<BulkState<K>>,
    pending: PendingReads,
    limit: u64,
    collected: RefCell<BytesMut>,
}

impl<K: QueueKind> AllReader<K>
where
    K::Value: AsRef<[u8]>,
{
    fn new(state: ReadableState<K>, limit: u64) -> Rc<Self> {
        let reader = Rc::new(Self {
            state: RefCell::new(state.into()),
            pending: PendingReads::default(),
            limit,
            collected: RefCell::new(BytesMut::new()),
        });
        if let BulkState::Readable(readable) = &*reader.state.borrow() {
            let owner: Weak<dyn ConsumerOwner> = Rc::downgrade(&reader) as Weak<Self>;
            readable.set_owner(Some(owner));
        }
        reader
    }

    fn terminal(&self) -> Option<Terminal> {
        if let Some(terminal) = self.pending.deferred() {
            return Some(terminal);
        }
        match &*self.state.borrow() {
            BulkState::Readable(_) => None,
            BulkState::Closed => Some(Terminal::Closed),
            BulkState::Errored(reason) => Some(Terminal::Errored(reason.clone())),
        }
    }

    fn readable(&self) -> Option<Rc<Readable<K>>> {
        match &*self.state.borrow() {
            BulkState::Readable(readable) => Some(Rc::clone(readable)),
            _ => None,
        }
    }

    async fn read_all(self: Rc<Self>) -> StreamResult<Bytes> {
        loop {
            match self.terminal() {
                Some(Terminal::Closed) => break,
                Some(Terminal::Errored(reason)) => return Err(reason),
                None => {}
            }
            let Some(readable) = self.readable() else {
                break;
            };
            let read = {
                let _scope = ReadPendingScope::new(&*self);
                readable.read()
            };
            match read.await {
                Ok(ReadResult {
                    value: Some(chunk),
                    done: false,
                }) => {
                    let bytes = chunk.as_ref();
                    if bytes.is_empty() {
                        continue;
                    }
                    let total = self.collected.borrow().len() as u64 + bytes.len() as u64;
                    if total > self.limit {
                        let reason = StreamError::LimitExceeded { limit: self.limit };
                        debug!(limit = self.limit, "bulk read over its limit");
                        self.do_error(reason.clone());
                        let _ = readable.cancel(reason.clone());
                        return Err(reason);
                    }
                    self.collected.borrow_mut().extend_from_slice(bytes);
                }
                Ok(_) => self.do_close(),
                Err(reason) => self.do_error(reason),
            }
        }
        let collected = std::mem::take(&mut *self.collected.borrow_mut());
        trace!(bytes = collected.len(), "bulk read complete");
        Ok(collected.freeze())
    }
}

impl<K: QueueKind> ConsumerOwner for AllReader<K> {
    fn read_pending(&self) -> &PendingReads {
        &self.pending
    }

    fn do_close(&self) {
        if self.pending.is_pending() {
            self.pending.defer(Terminal::Closed);
            return;
        }
        let previous = {
            let mut state = self.state.borrow_mut();
            if !matches!(*state, BulkState::Readable(_)) {
                return;
            }
            std::mem::replace(&mut *state, BulkState::Closed)
        };
        drop(previous);
    }

    fn do_error(&self, reason: StreamError) {
        if self.pending.is_pending() {
            self.pending.defer(Terminal::Errored(reason));
            return;
        }
        let previous = {
            let mut state = self.state.borrow_mut();
            if !matches!(*state, BulkState::Readable(_)) {
                return;
            }
            std::mem::replace(&mut *state, BulkState::Errored(reason))
        };
        drop(previous);
    }
}

/// Destination of [`ReadableStream::pump_to`].
pub trait ByteSink: 'static {
    fn write(&mut self, bytes: Bytes) -> StreamFuture<()>;

    /// Called after the last chunk when the pump was asked to end the sink.
    fn end(&mut self) -> StreamFuture<()> {
        ready_ok()
    }

    fn abort(&mut self, reason: StreamError) -> StreamFuture<()> {
        let _ = reason;
        ready_ok()
    }
}

/// [`ByteSink`] over any [`AsyncWrite`].
///
/// Clones share the writer, so a clone kept aside can recover it with
/// [`try_into_inner`](Self::try_into_inner) once the pump is done.
pub struct AsyncWriteSink<W> {
    writer: Rc<Mutex<W>>,
}

impl<W> Clone for AsyncWriteSink<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Rc::clone(&self.writer),
        }
    }
}

impl<W: AsyncWrite + Unpin + 'static> AsyncWriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Rc::new(Mutex::new(writer)),
        }
    }

    /// The writer, if no other clone of this sink is alive.
    pub fn try_into_inner(self) -> Option<W> {
        Rc::try_unwrap(self.writer).ok().map(Mutex::into_inner)
    }
}

impl<W: AsyncWrite + Unpin + 'static> ByteSink for AsyncWriteSink<W> {
    fn write(&mut self, bytes: Bytes) -> StreamFuture<()> {
        let writer = Rc::clone(&self.writer);
        async move {
            writer.lock().await.write_all(&bytes).await?;
            Ok(())
        }
        .boxed_local()
    }

    fn end(&mut self) -> StreamFuture<()> {
        let writer = Rc::clone(&self.writer);
        async move {
            let mut writer = writer.lock().await;
            writer.flush().await?;
            writer.close().await?;
            Ok(())
        }
        .boxed_local()
    }

    fn abort(&mut self, _reason: StreamError) -> StreamFuture<()> {
        let writer = Rc::clone(&self.writer);
        async move {
            writer.lock().await.close().await?;
            Ok(())
        }
        .boxed_local()
    }
}

enum PumpState {
    Pumping,
    Closed,
    Errored(StreamError),
}

/// Owned by the [`PumpTo`] future. The pump loop reaches it only through a
/// weak reference, so dropping the future stops the loop.
struct PumpToReader {
    state: RefCell<PumpState>,
    pending: PendingReads,
    sink: RefCell<Box<dyn ByteSink>>,
    end: bool,
}

impl PumpToReader {
    fn state(&self) -> Option<StreamResult<()>> {
        match &*self.state.borrow() {
            PumpState::Pumping => None,
            PumpState::Closed => Some(Ok(())),
            PumpState::Errored(reason) => Some(Err(reason.clone())),
        }
    }
}

impl ConsumerOwner for PumpToReader {
    fn read_pending(&self) -> &PendingReads {
        &self.pending
    }

    fn do_close(&self) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, PumpState::Pumping) {
            *state = PumpState::Closed;
        }
    }

    fn do_error(&self, reason: StreamError) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, PumpState::Pumping) {
            *state = PumpState::Errored(reason);
        }
    }
}

/// Future returned by [`ReadableStream::pump_to`].
///
/// Dropping it before it completes cancels the source at the pump loop's
/// next step.
#[must_use = "dropping a PumpTo cancels the pump"]
pub struct PumpTo {
    _reader: Option<Rc<PumpToReader>>,
    done: Promise<()>,
}

impl Future for PumpTo {
    type Output = StreamResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.done.poll_unpin(cx)
    }
}

async fn pump_loop<K: QueueKind>(
    readable: Option<Rc<Readable<K>>>,
    reader: Weak<PumpToReader>,
) -> StreamResult<()>
where
    K::Value: Into<Bytes>,
{
    loop {
        {
            let Some(this) = reader.upgrade() else {
                if let Some(readable) = &readable {
                    let _ = readable.cancel(StreamError::Canceled);
                }
                return Err(StreamError::TaskDropped);
            };
            match this.state() {
                Some(Ok(())) => {
                    trace!("pump source closed");
                    if !this.end {
                        return Ok(());
                    }
                    let ended = this.sink.borrow_mut().end();
                    drop(this);
                    return ended.await;
                }
                Some(Err(reason)) => {
                    debug!(%reason, "pump failed");
                    if this.end {
                        let aborted = this.sink.borrow_mut().abort(reason.clone());
                        drop(this);
                        if let Err(failure) = aborted.await {
                            debug!(%failure, "pump sink abort failed");
                        }
                    }
                    return Err(reason);
                }
                None => {}
            }
        }

        // Still pumping, so the stream had a consumer to detach.
        let Some(readable) = &readable else {
            return Ok(());
        };
        let result = readable.read().await;
        let Some(this) = reader.upgrade() else {
            if !matches!(result, Ok(ReadResult { done: true, .. })) {
                let reason = result.err().unwrap_or(StreamError::Canceled);
                let _ = readable.cancel(reason);
            }
            return Err(StreamError::TaskDropped);
        };
        let chunk = match result {
            Ok(ReadResult {
                value: Some(chunk),
                done: false,
            }) => chunk,
            Ok(_) => {
                this.do_close();
                continue;
            }
            Err(reason) => {
                this.do_error(reason);
                continue;
            }
        };
        let bytes: Bytes = chunk.into();
        if bytes.is_empty() {
            continue;
        }
        let written = this.sink.borrow_mut().write(bytes);
        drop(this);
        let written = written.await;

        let Some(this) = reader.upgrade() else {
            let _ = readable.cancel(written.err().unwrap_or(StreamError::Canceled));
            return Err(StreamError::TaskDropped);
        };
        if let Err(reason) = written {
            this.do_error(reason.clone());
            let _ = readable.cancel(reason);
        }
    }
}

fn locked_error() -> StreamError {
    StreamError::type_error("This ReadableStream is currently locked to a reader.")
}

impl<T, S> ReadableStream<T, S>
where
    T: AsRef<[u8]> + 'static,
    S: StreamTypeMarker<T>,
{
    /// Read the whole stream into one buffer.
    ///
    /// Fails with [`StreamError::LimitExceeded`] as soon as more than `limit`
    /// bytes arrive, canceling the source.
    pub fn read_all_bytes(&self, limit: u64) -> Promise<Bytes> {
        if self.is_locked() {
            return rejected(locked_error());
        }
        let state = match self.inner().detach_state() {
            Ok(state) => state,
            Err(reason) => return rejected(reason),
        };
        let reader = AllReader::new(state, limit);
        let (resolver, done) = promise();
        self.inner()
            .ctx
            .spawn(async move { resolver.settle(reader.read_all().await) });
        done
    }

    /// Like [`read_all_bytes`](Self::read_all_bytes), decoded as UTF-8.
    /// Invalid sequences become U+FFFD.
    pub fn read_all_text(&self, limit: u64) -> Promise<String> {
        let bytes = self.read_all_bytes(limit);
        let (resolver, done) = promise();
        self.inner().ctx.spawn(async move {
            resolver.settle(
                bytes
                    .await
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            );
        });
        done
    }
}

impl<T, S> ReadableStream<T, S>
where
    T: Into<Bytes> + 'static,
    S: StreamTypeMarker<T>,
{
    /// Forward every chunk into `sink`. With `end` set, the sink is ended when
    /// the stream closes and aborted when it errors.
    pub fn pump_to<Sk: ByteSink>(&self, sink: Sk, end: bool) -> PumpTo {
        if self.is_locked() {
            return PumpTo {
                _reader: None,
                done: rejected(locked_error()),
            };
        }
        let state = match self.inner().detach_state() {
            Ok(state) => state,
            Err(reason) => {
                return PumpTo {
                    _reader: None,
                    done: rejected(reason),
                };
            }
        };
        let (pump_state, readable) = match state {
            ReadableState::Readable(readable) => (PumpState::Pumping, Some(readable)),
            ReadableState::Closed => (PumpState::Closed, None),
            ReadableState::Errored(reason) => (PumpState::Errored(reason), None),
        };
        let reader = Rc::new(PumpToReader {
            state: RefCell::new(pump_state),
            pending: PendingReads::default(),
            sink: RefCell::new(Box::new(sink)),
            end,
        });
        let weak = Rc::downgrade(&reader);
        if let Some(readable) = &readable {
            let owner: Weak<dyn ConsumerOwner> = weak.clone();
            readable.set_owner(Some(owner));
        }
        let (resolver, done) = promise();
        self.inner().ctx.spawn(async move {
            resolver.settle(pump_loop(readable, weak).await);
        });
        PumpTo {
            _reader: Some(reader),
            done,
        }
    }
}
