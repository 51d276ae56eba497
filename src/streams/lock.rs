//! Reader/writer/pipe lock state machines for both stream ends.

use super::{error::StreamError, pipe::PipeSource};
use crate::platform::{Promise, Resolver, promise, rejected, resolved};
use std::rc::Rc;
use tracing::trace;

/// Where a stream end stands, as far as a new lock holder cares.
#[derive(Clone, Copy)]
pub(crate) enum EndState<'a> {
    Active,
    Closed,
    Errored(&'a StreamError),
}

struct ReaderLock {
    id: u64,
    closed: Option<Resolver<()>>,
}

enum ReadableLockState {
    Unlocked,
    /// Locked with nobody to notify: tee, detach, bulk reads, a dropped reader.
    Locked,
    ReaderLocked(ReaderLock),
    PipeLocked,
}

pub(crate) struct ReadableLock {
    state: ReadableLockState,
    next_id: u64,
}

impl ReadableLock {
    pub(crate) fn new() -> Self {
        Self {
            state: ReadableLockState::Unlocked,
            next_id: 1,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        !matches!(self.state, ReadableLockState::Unlocked)
    }

    pub(crate) fn is_reader(&self, id: u64) -> bool {
        matches!(&self.state, ReadableLockState::ReaderLocked(lock) if lock.id == id)
    }

    pub(crate) fn lock(&mut self) -> bool {
        if self.is_locked() {
            return false;
        }
        self.state = ReadableLockState::Locked;
        true
    }

    pub(crate) fn lock_reader(&mut self, end: EndState<'_>) -> Option<(u64, Promise<()>)> {
        if self.is_locked() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let (closed, promise) = match end {
            EndState::Active => {
                let (resolver, promise) = promise();
                (Some(resolver), promise)
            }
            EndState::Closed => (None, resolved(())),
            EndState::Errored(reason) => (None, rejected(reason.clone())),
        };
        self.state = ReadableLockState::ReaderLocked(ReaderLock { id, closed });
        trace!(reader = id, "readable locked to reader");
        Some((id, promise))
    }

    /// Release a reader's lock.
    ///
    /// An explicit release rejects `closed` and unlocks. An implicit one (the
    /// reader was dropped) frees the reader state but leaves the stream locked.
    pub(crate) fn release_reader(&mut self, id: u64, explicit: bool) {
        if !self.is_reader(id) {
            return;
        }
        let previous = std::mem::replace(
            &mut self.state,
            if explicit {
                ReadableLockState::Unlocked
            } else {
                ReadableLockState::Locked
            },
        );
        if let ReadableLockState::ReaderLocked(ReaderLock {
            closed: Some(resolver),
            ..
        }) = previous
        {
            if explicit {
                resolver.reject(StreamError::type_error(
                    "This ReadableStream reader has been released.",
                ));
            }
        }
        trace!(reader = id, explicit, "reader released");
    }

    pub(crate) fn try_pipe_lock(&mut self) -> bool {
        if self.is_locked() {
            return false;
        }
        self.state = ReadableLockState::PipeLocked;
        true
    }

    pub(crate) fn release_pipe_lock(&mut self) {
        if matches!(self.state, ReadableLockState::PipeLocked) {
            self.state = ReadableLockState::Unlocked;
        }
    }

    pub(crate) fn on_close(&mut self) {
        match &mut self.state {
            ReadableLockState::ReaderLocked(lock) => {
                if let Some(resolver) = lock.closed.take() {
                    resolver.resolve(());
                }
            }
            ReadableLockState::PipeLocked => self.state = ReadableLockState::Unlocked,
            _ => {}
        }
    }

    pub(crate) fn on_error(&mut self, reason: &StreamError) {
        match &mut self.state {
            ReadableLockState::ReaderLocked(lock) => {
                if let Some(resolver) = lock.closed.take() {
                    resolver.reject(reason.clone());
                }
            }
            ReadableLockState::PipeLocked => self.state = ReadableLockState::Unlocked,
            _ => {}
        }
    }

    pub(crate) fn has_pending_closed(&self) -> bool {
        matches!(&self.state, ReadableLockState::ReaderLocked(ReaderLock { closed: Some(_), .. }))
    }
}

struct WriterLock {
    id: u64,
    closed: Option<Resolver<()>>,
    ready: Option<Resolver<()>>,
    ready_promise: Promise<()>,
}

impl WriterLock {
    fn resolve_ready(&mut self) {
        if let Some(resolver) = self.ready.take() {
            resolver.resolve(());
        }
    }

    fn reject_ready(&mut self, reason: &StreamError) {
        match self.ready.take() {
            Some(resolver) => resolver.reject(reason.clone()),
            None => self.ready_promise = rejected(reason.clone()),
        }
    }
}

/// Pipe options the destination keeps while it is pipe-locked.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PipeFlags {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
}

pub(crate) struct PipeLock<T> {
    pub source: Rc<dyn PipeSource<T>>,
    pub flags: PipeFlags,
    pub signal: Option<super::pipe::AbortSignal>,
}

impl<T> Clone for PipeLock<T> {
    fn clone(&self) -> Self {
        Self {
            source: Rc::clone(&self.source),
            flags: self.flags,
            signal: self.signal.clone(),
        }
    }
}

enum WritableLockState<T> {
    Unlocked,
    /// A dropped writer: nothing left to notify, the stream stays locked.
    Locked,
    WriterLocked(WriterLock),
    PipeLocked(PipeLock<T>),
}

pub(crate) struct WritableLock<T> {
    state: WritableLockState<T>,
    next_id: u64,
}

impl<T> WritableLock<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: WritableLockState::Unlocked,
            next_id: 1,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        !matches!(self.state, WritableLockState::Unlocked)
    }

    pub(crate) fn is_writer(&self, id: u64) -> bool {
        matches!(&self.state, WritableLockState::WriterLocked(lock) if lock.id == id)
    }

    /// Lock to a new writer. `ready` starts resolved only when the sink has
    /// started and there is no backpressure.
    pub(crate) fn lock_writer(
        &mut self,
        end: EndState<'_>,
        ready_now: bool,
    ) -> Option<(u64, Promise<()>)> {
        if self.is_locked() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let (closed_resolver, closed) = promise();
        let (ready_resolver, ready_promise) = promise();
        let mut lock = WriterLock {
            id,
            closed: Some(closed_resolver),
            ready: Some(ready_resolver),
            ready_promise,
        };
        match end {
            EndState::Closed => {
                if let Some(resolver) = lock.closed.take() {
                    resolver.resolve(());
                }
                lock.resolve_ready();
            }
            EndState::Errored(reason) => {
                if let Some(resolver) = lock.closed.take() {
                    resolver.reject(reason.clone());
                }
                lock.reject_ready(reason);
            }
            EndState::Active if ready_now => lock.resolve_ready(),
            EndState::Active => {}
        }
        self.state = WritableLockState::WriterLocked(lock);
        trace!(writer = id, "writable locked to writer");
        Some((id, closed))
    }

    pub(crate) fn ready(&self, id: u64) -> Option<Promise<()>> {
        match &self.state {
            WritableLockState::WriterLocked(lock) if lock.id == id => Some(lock.ready_promise.clone()),
            _ => None,
        }
    }

    /// Release the writer `id`.
    ///
    /// Only an explicit release unlocks the stream. A dropped writer leaves it
    /// locked, the same way a dropped reader does.
    pub(crate) fn release_writer(&mut self, id: u64, explicit: bool) {
        if !self.is_writer(id) {
            return;
        }
        let next = if explicit {
            WritableLockState::Unlocked
        } else {
            WritableLockState::Locked
        };
        let previous = std::mem::replace(&mut self.state, next);
        if let WritableLockState::WriterLocked(mut lock) = previous {
            if explicit {
                let released = StreamError::type_error("This WritableStream writer has been released.");
                if let Some(resolver) = lock.closed.take() {
                    resolver.reject(released.clone());
                }
                lock.reject_ready(&released);
            }
        }
        trace!(writer = id, explicit, "writer released");
    }

    pub(crate) fn try_pipe_lock(&mut self, pipe: PipeLock<T>) -> bool {
        if self.is_locked() {
            return false;
        }
        self.state = WritableLockState::PipeLocked(pipe);
        true
    }

    pub(crate) fn pipe(&self) -> Option<PipeLock<T>> {
        match &self.state {
            WritableLockState::PipeLocked(pipe) => Some(pipe.clone()),
            _ => None,
        }
    }

    pub(crate) fn release_pipe_lock(&mut self) {
        if matches!(self.state, WritableLockState::PipeLocked(_)) {
            self.state = WritableLockState::Unlocked;
        }
    }

    /// Backpressure appeared: readiness goes back to pending.
    pub(crate) fn set_ready_pending(&mut self) {
        if let WritableLockState::WriterLocked(lock) = &mut self.state {
            let (resolver, promise) = promise();
            lock.ready = Some(resolver);
            lock.ready_promise = promise;
        }
    }

    pub(crate) fn resolve_ready(&mut self) {
        if let WritableLockState::WriterLocked(lock) = &mut self.state {
            lock.resolve_ready();
        }
    }

    pub(crate) fn reject_ready(&mut self, reason: &StreamError) {
        if let WritableLockState::WriterLocked(lock) = &mut self.state {
            lock.reject_ready(reason);
        }
    }

    pub(crate) fn on_close(&mut self) {
        match &mut self.state {
            WritableLockState::WriterLocked(lock) => {
                if let Some(resolver) = lock.closed.take() {
                    resolver.resolve(());
                }
                lock.resolve_ready();
            }
            // The pipe loop observes the end state and releases its own lock.
            WritableLockState::PipeLocked(_)
            | WritableLockState::Locked
            | WritableLockState::Unlocked => {}
        }
    }

    pub(crate) fn on_error(&mut self, reason: &StreamError) {
        match &mut self.state {
            WritableLockState::WriterLocked(lock) => {
                if let Some(resolver) = lock.closed.take() {
                    resolver.reject(reason.clone());
                }
                lock.reject_ready(reason);
            }
            WritableLockState::PipeLocked(_)
            | WritableLockState::Locked
            | WritableLockState::Unlocked => {}
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        match &self.state {
            WritableLockState::WriterLocked(lock) => {
                usize::from(lock.closed.is_some()) + usize::from(lock.ready.is_some())
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{platform::peek, streams::test_util::local_test};

    #[tokio::test]
    async fn reader_closed_promise_follows_stream_end() {
        local_test(|| async {
            let mut lock = ReadableLock::new();
            let (_, closed) = lock.lock_reader(EndState::Active).unwrap();
            assert!(lock.lock_reader(EndState::Active).is_none());
            lock.on_close();
            closed.await.unwrap();

            let mut lock = ReadableLock::new();
            let reason = StreamError::from("bad");
            let (_, closed) = lock.lock_reader(EndState::Errored(&reason)).unwrap();
            assert_eq!(closed.await.unwrap_err().to_string(), "bad");
        })
        .await;
    }

    #[tokio::test]
    async fn explicit_release_unlocks_and_implicit_keeps_flag() {
        local_test(|| async {
            let mut lock = ReadableLock::new();
            let (id, closed) = lock.lock_reader(EndState::Active).unwrap();
            lock.release_reader(id, true);
            assert!(!lock.is_locked());
            assert!(closed.await.unwrap_err().is_usage_error());

            let (id, _closed) = lock.lock_reader(EndState::Active).unwrap();
            lock.release_reader(id, false);
            assert!(lock.is_locked());
            assert!(!lock.try_pipe_lock());
        })
        .await;
    }

    #[tokio::test]
    async fn pipe_lock_clears_on_close() {
        local_test(|| async {
            let mut lock = ReadableLock::new();
            assert!(lock.try_pipe_lock());
            assert!(lock.is_locked());
            lock.on_close();
            assert!(!lock.is_locked());
        })
        .await;
    }

    #[tokio::test]
    async fn writer_ready_tracks_backpressure() {
        local_test(|| async {
            let mut lock = WritableLock::<u8>::new();
            let (id, _closed) = lock.lock_writer(EndState::Active, true).unwrap();
            let ready = lock.ready(id).unwrap();
            ready.clone().await.unwrap();

            lock.set_ready_pending();
            let pending = lock.ready(id).unwrap();
            assert!(peek(&pending).is_none());
            lock.resolve_ready();
            pending.await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn dropped_writer_keeps_the_writable_locked() {
        local_test(|| async {
            let mut lock = WritableLock::<u8>::new();
            let (id, _closed) = lock.lock_writer(EndState::Active, true).unwrap();
            lock.release_writer(id, false);
            assert!(lock.is_locked());
            assert!(!lock.is_writer(id));
            assert!(lock.ready(id).is_none());
            assert!(lock.lock_writer(EndState::Active, true).is_none());

            let mut lock = WritableLock::<u8>::new();
            let (id, closed) = lock.lock_writer(EndState::Active, true).unwrap();
            lock.release_writer(id, true);
            assert!(!lock.is_locked());
            assert!(closed.await.unwrap_err().is_usage_error());
            assert!(lock.lock_writer(EndState::Active, true).is_some());
        })
        .await;
    }

    #[tokio::test]
    async fn writer_on_errored_stream_sees_rejections() {
        local_test(|| async {
            let reason = StreamError::from("sink failed");
            let mut lock = WritableLock::<u8>::new();
            let (id, closed) = lock.lock_writer(EndState::Errored(&reason), false).unwrap();
            assert_eq!(closed.await.unwrap_err().to_string(), "sink failed");
            assert!(lock.ready(id).unwrap().await.is_err());
            assert_eq!(lock.pending_count(), 0);
        })
        .await;
    }
}
