//! Host execution context primitives
//!
//! Streams are single threaded. All stream state lives behind `Rc<RefCell<..>>`
//! and every continuation (the outcome of a user algorithm, a pipe step, a bulk
//! read) is spawned onto the executor the stream was built with.
//!
//! - [`ExecutionContext`] wraps a spawn function such as `tokio::task::spawn_local`
//! - [`Promise`] is a cloneable future that settles exactly once
//! - [`Resolver`] settles its paired promise; dropping it unsettled rejects with
//!   [`StreamError::TaskDropped`]

use crate::streams::{StreamResult, error::StreamError};
use futures::{
    FutureExt,
    channel::oneshot,
    future::{self, LocalBoxFuture, Shared},
};
use std::{cell::RefCell, fmt, future::Future, rc::Rc};

/// Boxed future returned by user supplied algorithms.
pub type StreamFuture<T> = LocalBoxFuture<'static, StreamResult<T>>;

/// A cloneable, shared handle to a value that settles exactly once.
pub type Promise<T> = Shared<StreamFuture<T>>;

/// The settling half of a [`Promise`].
pub struct Resolver<T> {
    tx: oneshot::Sender<StreamResult<T>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn reject(self, reason: StreamError) {
        let _ = self.tx.send(Err(reason));
    }

    pub fn settle(self, result: StreamResult<T>) {
        let _ = self.tx.send(result);
    }

    /// True once every clone of the paired promise has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_canceled()
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("abandoned", &self.tx.is_canceled())
            .finish()
    }
}

/// Create a pending promise and the resolver that settles it.
pub fn promise<T: Clone + 'static>() -> (Resolver<T>, Promise<T>) {
    let (tx, rx) = oneshot::channel();
    let fut = async move { rx.await.unwrap_or(Err(StreamError::TaskDropped)) };
    (Resolver { tx }, fut.boxed_local().shared())
}

pub fn resolved<T: Clone + 'static>(value: T) -> Promise<T> {
    future::ready(Ok(value)).boxed_local().shared()
}

pub fn rejected<T: Clone + 'static>(reason: StreamError) -> Promise<T> {
    future::ready(Err(reason)).boxed_local().shared()
}

/// An algorithm outcome that is already a success.
pub fn ready_ok() -> StreamFuture<()> {
    future::ready(Ok(())).boxed_local()
}

/// Settled value of a promise, or `None` while it is still pending.
///
/// Polls a clone once with a no-op waker, so it works on a promise nobody has awaited yet.
pub fn peek<T: Clone + 'static>(promise: &Promise<T>) -> Option<StreamResult<T>> {
    promise.clone().now_or_never()
}

/// Spawns continuations onto a single-threaded executor.
///
/// ```ignore
/// let ctx = ExecutionContext::new(tokio::task::spawn_local);
/// ```
#[derive(Clone)]
pub struct ExecutionContext {
    spawner: Rc<dyn Fn(LocalBoxFuture<'static, ()>)>,
}

impl ExecutionContext {
    pub fn new<F, R>(spawn_fn: F) -> Self
    where
        F: Fn(LocalBoxFuture<'static, ()>) -> R + 'static,
    {
        Self {
            spawner: Rc::new(move |fut| {
                let _ = spawn_fn(fut);
            }),
        }
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        (self.spawner)(fut.boxed_local());
    }

    /// Run `on_settled` in its own continuation once `fut` settles.
    pub fn then<T, F, C>(&self, fut: F, on_settled: C)
    where
        T: 'static,
        F: Future<Output = StreamResult<T>> + 'static,
        C: FnOnce(StreamResult<T>) + 'static,
    {
        self.spawn(async move { on_settled(fut.await) });
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExecutionContext")
    }
}

/// Invoke an optional user algorithm from a fresh continuation.
///
/// A missing algorithm settles as success. The algorithm object is borrowed
/// only while `invoke` builds its future, never across an await.
pub(crate) fn maybe_run_algorithm<A, I, C>(
    ctx: &ExecutionContext,
    algorithm: Option<Rc<RefCell<A>>>,
    invoke: I,
    on_settled: C,
) where
    A: ?Sized + 'static,
    I: FnOnce(&mut A) -> StreamFuture<()> + 'static,
    C: FnOnce(StreamResult<()>) + 'static,
{
    ctx.spawn(async move {
        let result = match algorithm {
            Some(algorithm) => {
                let fut = invoke(&mut *algorithm.borrow_mut());
                fut.await
            }
            None => Ok(()),
        };
        on_settled(result);
    });
}
