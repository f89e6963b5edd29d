//! # Async Bridge
//!
//! Adapters between the callback-driven stream engine and `futures`. None of
//! them drive the engine themselves: the scheduler still has to be drained, and
//! [`Scheduler::run_until`](runnel_io::Scheduler::run_until) is the usual way
//! to do both at once.
//!
//! ```rust
//! use runnel::prelude::*;
//! use runnel::bridge::ReadableStreamExt;
//! use futures::StreamExt;
//!
//! # async fn demo(readable: Readable) {
//! let scheduler = readable.scheduler().clone();
//! let chunks: Vec<_> = scheduler.run_until(readable.chunk_stream().collect()).await;
//! # }
//! ```

use crate::engine::StreamCore;
use crate::error::StreamError;
use crate::events::{Event, EventKind, ListenerId};
use crate::stream::private::Sealed;
use crate::stream::{Chunk, ReadableStream, WritableStream};
use futures::Stream;
use runnel_io::Mutex;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

enum Delivery {
    Chunk(Chunk),
    End,
    Error(StreamError),
}

/// Chunks delivered to a [`ChunkStream`] but not yet polled out of it
struct Backlog {
    queued: AtomicUsize,
    limit: usize,
    paused: AtomicBool,
}

/// The chunks of a readable stream as a [`Stream`]. Creating one switches the
/// source into flowing mode. Once the readable side's high-water mark worth of
/// chunks waits unpolled, the source is paused; it resumes when the backlog
/// has been consumed. The stream ends after the source emits `end`, or after
/// yielding the first error the source emits.
pub struct ChunkStream {
    core: Arc<StreamCore>,
    receiver: UnboundedReceiver<Delivery>,
    backlog: Arc<Backlog>,
    listeners: Vec<(EventKind, ListenerId)>,
    done: bool,
}

impl ChunkStream {
    fn new(core: &Arc<StreamCore>) -> Self {
        let (sender, receiver) = unbounded_channel();
        let snapshot = core.readable_snapshot();
        let done = snapshot.emitted_end;
        let backlog = Arc::new(Backlog {
            queued: AtomicUsize::new(0),
            limit: snapshot.high_water_mark.max(1),
            paused: AtomicBool::new(false),
        });
        let mut listeners = Vec::with_capacity(3);

        if !done {
            listeners.push((
                EventKind::End,
                core.events
                    .on(EventKind::End, forward(&sender, |_| Some(Delivery::End))),
            ));

            listeners.push((
                EventKind::Error,
                core.events.on(
                    EventKind::Error,
                    forward(&sender, |event| match event {
                        Event::Error(err) => Some(Delivery::Error(err.clone())),
                        _ => None,
                    }),
                ),
            ));

            // registered last, since subscribing may start the flow immediately
            listeners.push((
                EventKind::Data,
                core.on(EventKind::Data, {
                    let sender = sender.clone();
                    let backlog = backlog.clone();
                    let source = Arc::downgrade(core);
                    move |event: &Event| {
                        let Event::Data(chunk) = event else {
                            return;
                        };

                        let queued = backlog.queued.fetch_add(1, Ordering::SeqCst) + 1;
                        if sender.send(Delivery::Chunk(chunk.clone())).is_err() {
                            return;
                        }

                        if queued >= backlog.limit && !backlog.paused.swap(true, Ordering::SeqCst) {
                            if let Some(source) = source.upgrade() {
                                log::trace!(target: "runnel", "{source:?} paused by an unpolled chunk stream");
                                source.readable_pause();
                            }
                        }
                    }
                }),
            ));
        }

        Self {
            core: core.clone(),
            receiver,
            backlog,
            listeners,
            done,
        }
    }

    fn consumed_one(&self) {
        let queued = self.backlog.queued.fetch_sub(1, Ordering::SeqCst) - 1;
        if queued == 0 && self.backlog.paused.swap(false, Ordering::SeqCst) {
            self.core.defer(|core| core.readable_resume());
        }
    }
}

fn forward<F>(
    sender: &UnboundedSender<Delivery>,
    map: F,
) -> impl Fn(&Event) + Send + Sync + 'static
where
    F: Fn(&Event) -> Option<Delivery> + Send + Sync + 'static,
{
    let sender = sender.clone();
    move |event| {
        if let Some(delivery) = map(event) {
            // the receiver is gone only once the ChunkStream is dropped
            let _ = sender.send(delivery);
        }
    }
}

impl Stream for ChunkStream {
    type Item = Result<Chunk, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        let delivery = futures::ready!(Pin::new(&mut self.receiver).poll_recv(cx));
        match delivery {
            Some(Delivery::Chunk(chunk)) => {
                self.consumed_one();
                Poll::Ready(Some(Ok(chunk)))
            }

            Some(Delivery::Error(err)) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }

            Some(Delivery::End) | None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        for (kind, id) in self.listeners.drain(..) {
            let _ = self.core.events.remove_listener(kind, id);
        }
    }
}

impl Debug for ChunkStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkStream({:?}, done: {})", self.core, self.done)
    }
}

/// Resolves once the write's completion callback runs
pub struct WriteFuture {
    accepted: bool,
    future: Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send>>,
}

impl WriteFuture {
    /// What the underlying `write` returned: false means the stream is over its
    /// high-water mark
    pub fn accepted(&self) -> bool {
        self.accepted
    }
}

impl Future for WriteFuture {
    type Output = Result<(), StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

/// Resolves with `Ok` on `finish`, or with the first error emitted before it
pub struct FinishFuture {
    core: Arc<StreamCore>,
    listeners: Vec<(EventKind, ListenerId)>,
    future: Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send>>,
}

impl FinishFuture {
    fn new(core: &Arc<StreamCore>) -> Self {
        if core.writable_snapshot().finished {
            return Self {
                core: core.clone(),
                listeners: Vec::new(),
                future: Box::pin(async { Ok(()) }),
            };
        }

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let on_finish = tx.clone();
        let finish = core.events.once(EventKind::Finish, move |_| {
            if let Some(tx) = on_finish.lock().take() {
                let _ = tx.send(Ok(()));
            }
        });

        let error = core.events.once(EventKind::Error, move |event| {
            if let (Event::Error(err), Some(tx)) = (event, tx.lock().take()) {
                let _ = tx.send(Err(err.clone()));
            }
        });

        Self {
            core: core.clone(),
            listeners: vec![(EventKind::Finish, finish), (EventKind::Error, error)],
            future: Box::pin(async move {
                rx.await
                    .unwrap_or_else(
                        |_| Err(StreamError::generic("Stream dropped before finishing")),
                    )
            }),
        }
    }
}

impl Future for FinishFuture {
    type Output = Result<(), StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl Drop for FinishFuture {
    fn drop(&mut self) {
        for (kind, id) in self.listeners.drain(..) {
            let _ = self.core.events.remove_listener(kind, id);
        }
    }
}

pub trait ReadableStreamExt: ReadableStream {
    fn chunk_stream(&self) -> ChunkStream {
        ChunkStream::new(self.core())
    }
}

impl<T: ReadableStream> ReadableStreamExt for T {}

pub trait WritableStreamExt: WritableStream {
    /// Writes `chunk` now and returns a future for its completion
    fn write_async<C: Into<Chunk>>(&self, chunk: C) -> WriteFuture
    where
        Self: Sized,
    {
        let (tx, rx) = oneshot::channel();
        let accepted = self.write_then(chunk, move |result| {
            let _ = tx.send(result);
        });

        WriteFuture {
            accepted,
            future: Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(StreamError::generic("Write callback dropped")))
            }),
        }
    }

    fn finished(&self) -> FinishFuture {
        FinishFuture::new(self.core())
    }
}

impl<T: WritableStream> WritableStreamExt for T {}

#[cfg(test)]
mod tests {
    use crate::bridge::{ReadableStreamExt, WritableStreamExt};
    use crate::error::StreamError;
    use crate::events::{Event, EventKind};
    use crate::options::{ReadableOptions, WritableOptions};
    use crate::readable::Readable;
    use crate::stream::{EventSource, ReadableStream, WritableStream};
    use crate::test_utils::{chunk, chunks, strings, EventLog, RecordingSink, VecSource};
    use crate::writable::Writable;
    use futures::StreamExt;
    use rstest::rstest;
    use runnel_io::Scheduler;
    use std::time::Duration;

    #[tokio::test]
    async fn chunk_stream_yields_everything_then_ends() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let readable = Readable::new(
            &scheduler,
            VecSource::new(chunks("s", 25)),
            ReadableOptions::default(),
        );

        let collected = scheduler
            .run_until(readable.chunk_stream().collect::<Vec<_>>())
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(strings(&collected), strings(&chunks("s", 25)));
        assert_eq!(readable.listener_count(EventKind::Data), 0);
        assert_eq!(readable.listener_count(EventKind::End), 0);
    }

    #[tokio::test]
    async fn unpolled_chunk_stream_pauses_its_source() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let source = VecSource::new(chunks("f", 40));
        let readable = Readable::new(
            &scheduler,
            source.clone(),
            ReadableOptions::default().with_high_water_mark(4),
        );
        let log = EventLog::attach(&readable, &[EventKind::Pause, EventKind::Resume]);
        let stream = readable.chunk_stream();

        let _ = scheduler.run_until_idle();
        assert!(readable.is_paused());
        assert_eq!(log.count(EventKind::Pause), 1);
        assert!(source.reads() < 40);
        assert!(!readable.readable_state().ended);

        let collected = scheduler
            .run_until(stream.collect::<Vec<_>>())
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(strings(&collected), strings(&chunks("f", 40)));
        assert!(log.count(EventKind::Resume) >= 2);
        assert!(readable.readable_state().emitted_end);
    }

    #[tokio::test]
    async fn chunk_stream_stops_at_first_error() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let readable = Readable::manual(&scheduler, ReadableOptions::default());
        let mut stream = readable.chunk_stream();

        let _ = readable.push(Some(chunk("a")));
        let _ = scheduler.run_until_idle();
        let _ = readable.emit(Event::Error(StreamError::generic("source failed")));

        assert_eq!(stream.next().await, Some(Ok(chunk("a"))));
        assert_eq!(stream.next().await, Some(Err(StreamError::generic("source failed"))));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn chunk_stream_of_ended_source_is_empty() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let readable = Readable::manual(&scheduler, ReadableOptions::default());
        let _ = readable.push(None);
        let _ = readable.read(None);
        let _ = scheduler.run_until_idle();

        let mut stream = readable.chunk_stream();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn write_async_and_finished_resolve_in_order() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let sink = RecordingSink::next_tick(&scheduler);
        let writable = Writable::new(
            &scheduler,
            sink.clone(),
            WritableOptions::default().with_high_water_mark(2),
        );

        let first = writable.write_async("a");
        let second = writable.write_async("b");
        assert!(first.accepted());
        assert!(!second.accepted());

        scheduler.run_until(first).await.unwrap();
        scheduler.run_until(second).await.unwrap();

        let finished = writable.finished();
        writable.end();
        scheduler.run_until(finished).await.unwrap();

        assert_eq!(sink.written_strings(), vec!["a", "b"]);
        assert!(writable.writable_state().finished);
        assert_eq!(writable.listener_count(EventKind::Error), 0);
        scheduler.run_until(writable.finished()).await.unwrap();
    }

    #[tokio::test]
    async fn finished_reports_errors() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let sink = RecordingSink::immediate(&scheduler)
            .failing_at(0, StreamError::generic("broken"));
        let writable = Writable::new(&scheduler, sink, WritableOptions::default());

        let finished = writable.finished();
        let write = writable.write_async("a");

        assert_eq!(
            scheduler.run_until(write).await,
            Err(StreamError::generic("broken"))
        );
        assert_eq!(
            scheduler.run_until(finished).await,
            Err(StreamError::generic("broken"))
        );
    }

    #[rstest]
    #[case(4)]
    #[case(64)]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test(flavor = "multi_thread")]
    async fn pushes_scheduled_from_another_task(#[case] count: usize) {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let readable = Readable::manual(&scheduler, ReadableOptions::default());
        let stream = readable.chunk_stream();

        let producer = {
            let scheduler = scheduler.clone();
            let readable = readable.clone();
            tokio::spawn(async move {
                for value in chunks("t", count) {
                    let readable = readable.clone();
                    scheduler.schedule(move || {
                        let _ = readable.push(Some(value));
                    });
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }

                scheduler.schedule(move || {
                    let _ = readable.push(None);
                });
            })
        };

        let collected: Vec<_> = scheduler.run_until(stream.collect()).await;
        producer.await.unwrap();

        let collected = collected.into_iter().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(strings(&collected), strings(&chunks("t", count)));
    }
}
