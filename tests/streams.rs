use bytes::{Bytes, BytesMut};
use flow_streams::{
    platform::{peek, ready_ok},
    ByobReadOptions, ExecutionContext, ReadableByteSource, ReadableByteStreamController,
    ReadableSource, ReadableStream, ReadableStreamDefaultController, StreamError, StreamFuture,
    StreamPipeOptions, TransformStream, WritableSink, WritableStream,
    WritableStreamDefaultController,
};
use futures::FutureExt;
use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

async fn local<F, Fut>(f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()> + 'static,
{
    tokio::task::LocalSet::new().run_until(f()).await;
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn ctx() -> ExecutionContext {
    ExecutionContext::new(tokio::task::spawn_local)
}

type Slot<C> = Rc<RefCell<Option<C>>>;

struct Manual<C> {
    controller: Slot<C>,
    cancels: Rc<Cell<usize>>,
}

impl<C> Manual<C> {
    fn new() -> (Self, Slot<C>, Rc<Cell<usize>>) {
        let controller = Rc::new(RefCell::new(None));
        let cancels = Rc::new(Cell::new(0));
        let source = Self {
            controller: Rc::clone(&controller),
            cancels: Rc::clone(&cancels),
        };
        (source, controller, cancels)
    }
}

impl<T: Clone + 'static> ReadableSource<T> for Manual<ReadableStreamDefaultController<T>> {
    fn start(&mut self, controller: ReadableStreamDefaultController<T>) -> StreamFuture<()> {
        *self.controller.borrow_mut() = Some(controller);
        ready_ok()
    }

    fn cancel(&mut self, _reason: StreamError) -> StreamFuture<()> {
        self.cancels.set(self.cancels.get() + 1);
        ready_ok()
    }
}

impl ReadableByteSource for Manual<ReadableByteStreamController> {
    fn start(&mut self, controller: ReadableByteStreamController) -> StreamFuture<()> {
        *self.controller.borrow_mut() = Some(controller);
        ready_ok()
    }

    fn cancel(&mut self, _reason: StreamError) -> StreamFuture<()> {
        self.cancels.set(self.cancels.get() + 1);
        ready_ok()
    }
}

fn take<C: Clone>(slot: &Slot<C>) -> C {
    slot.borrow().clone().expect("source started")
}

#[derive(Default, Clone)]
struct Recorder {
    chunks: Rc<RefCell<Vec<u32>>>,
    aborts: Rc<RefCell<Vec<String>>>,
    fail_on: Option<u32>,
}

impl WritableSink<u32> for Recorder {
    fn write(&mut self, chunk: u32, _: WritableStreamDefaultController) -> StreamFuture<()> {
        if self.fail_on == Some(chunk) {
            return futures::future::ready(Err(StreamError::from("disk full"))).boxed_local();
        }
        self.chunks.borrow_mut().push(chunk);
        ready_ok()
    }

    fn abort(&mut self, reason: StreamError) -> StreamFuture<()> {
        self.aborts.borrow_mut().push(reason.to_string());
        ready_ok()
    }
}

#[tokio::test]
async fn bytes_arrive_in_order_and_in_full() {
    local(|| async {
        let (source, slot, _) = Manual::<ReadableByteStreamController>::new();
        let stream = ReadableStream::bytes_builder(source).build(&ctx()).unwrap();
        settle().await;
        let controller = take(&slot);
        for chunk in [&b"flow"[..], b"-", b"control", b" engine"] {
            controller.enqueue(Bytes::copy_from_slice(chunk)).unwrap();
        }
        controller.close().unwrap();

        let all = stream.read_all_bytes(1024).await.unwrap();
        assert_eq!(&all[..], b"flow-control engine");
    })
    .await;
}

#[tokio::test]
async fn tee_cancels_the_source_once_both_branches_cancel() {
    local(|| async {
        let (source, _slot, cancels) = Manual::<ReadableStreamDefaultController<u32>>::new();
        let stream = ReadableStream::builder(source).build(&ctx());
        let (left, right) = stream.tee().unwrap();
        settle().await;

        left.cancel(None).await.unwrap();
        settle().await;
        assert_eq!(cancels.get(), 0);

        right.cancel(None).await.unwrap();
        settle().await;
        assert_eq!(cancels.get(), 1);
    })
    .await;
}

#[tokio::test]
async fn second_close_is_a_usage_error() {
    local(|| async {
        let (source, slot, _) = Manual::<ReadableStreamDefaultController<u32>>::new();
        let stream = ReadableStream::builder(source).build(&ctx());
        settle().await;
        let controller = take(&slot);
        controller.close().unwrap();
        assert!(controller.close().unwrap_err().is_usage_error());
        assert!(stream.is_closed());

        let writable = WritableStream::builder(Recorder::default()).build(&ctx());
        let writer = writable.get_writer().unwrap();
        let first = writer.close();
        assert!(writer.close().await.unwrap_err().is_usage_error());
        first.await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn concurrent_aborts_share_the_first_reason() {
    local(|| async {
        let sink = Recorder::default();
        let aborts = Rc::clone(&sink.aborts);
        let writable = WritableStream::builder(sink).build(&ctx());
        settle().await;

        let first = writable.abort(Some(StreamError::from("reason A")));
        let second = writable.abort(Some(StreamError::from("reason B")));
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(*aborts.borrow(), vec!["reason A".to_string()]);
        assert_eq!(writable.errored().unwrap().to_string(), "reason A");
    })
    .await;
}

#[tokio::test]
async fn byob_read_waits_for_its_minimum() {
    local(|| async {
        let (source, slot, _) = Manual::<ReadableByteStreamController>::new();
        let stream = ReadableStream::bytes_builder(source).build(&ctx()).unwrap();
        let reader = stream.get_byob_reader().unwrap();
        let read = reader.read_with(BytesMut::zeroed(16), ByobReadOptions::at_least(10));
        settle().await;

        let controller = take(&slot);
        controller.enqueue(Bytes::from_static(&[1; 4])).unwrap();
        settle().await;
        controller.enqueue(Bytes::from_static(&[2; 4])).unwrap();
        settle().await;
        assert!(peek(&read).is_none());
        controller.enqueue(Bytes::from_static(&[3; 4])).unwrap();

        let view = read.await.unwrap().value.unwrap();
        assert_eq!(view.len(), 12);
        assert_eq!(&view[..], &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    })
    .await;
}

#[tokio::test]
async fn prevent_cancel_pipe_reports_write_error_without_canceling() {
    local(|| async {
        let (source, slot, cancels) = Manual::<ReadableStreamDefaultController<u32>>::new();
        let readable = ReadableStream::builder(source).build(&ctx());
        let writable = WritableStream::builder(Recorder {
            fail_on: Some(2),
            ..Default::default()
        })
        .build(&ctx());
        settle().await;
        let controller = take(&slot);
        controller.enqueue(1).unwrap();
        controller.enqueue(2).unwrap();
        controller.enqueue(3).unwrap();

        let options = StreamPipeOptions {
            prevent_cancel: true,
            ..Default::default()
        };
        let err = readable.pipe_to(&writable, options).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        settle().await;
        assert_eq!(cancels.get(), 0);
        assert!(!readable.is_locked());
    })
    .await;
}

#[tokio::test]
async fn enqueue_after_close_fails() {
    local(|| async {
        let (source, slot, _) = Manual::<ReadableStreamDefaultController<u32>>::new();
        let _stream = ReadableStream::builder(source).build(&ctx());
        settle().await;
        let controller = take(&slot);
        controller.close().unwrap();
        assert!(controller.enqueue(9).unwrap_err().is_usage_error());

        let (source, slot, _) = Manual::<ReadableByteStreamController>::new();
        let _bytes = ReadableStream::bytes_builder(source).build(&ctx()).unwrap();
        settle().await;
        let controller = take(&slot);
        controller.close().unwrap();
        assert!(controller
            .enqueue(Bytes::from_static(b"late"))
            .unwrap_err()
            .is_usage_error());
    })
    .await;
}

#[tokio::test]
async fn pipe_through_transform_into_writable() {
    local(|| async {
        let sink = Recorder::default();
        let chunks = Rc::clone(&sink.chunks);
        let source = ReadableStream::from_vec(vec![3u32, 1, 4, 1, 5]).build(&ctx());
        let transform = TransformStream::<u32, u32>::identity(&ctx());
        let writable = WritableStream::builder(sink).build(&ctx());

        let readable = source
            .pipe_through(&transform, StreamPipeOptions::default())
            .unwrap();
        readable
            .pipe_to(&writable, StreamPipeOptions::default())
            .await
            .unwrap();

        assert_eq!(*chunks.borrow(), vec![3, 1, 4, 1, 5]);
        assert!(writable.is_closed());
    })
    .await;
}
