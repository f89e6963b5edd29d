//! Ready-made transforms: [`pass_through`] forwards chunks unchanged, and
//! [`through`] builds a transform from plain closures.

use crate::options::DuplexOptions;
use crate::readable::Readable;
use crate::stream::{FlushCallback, TransformCallback, Transformer, WriteChunk};
use crate::transform::Transform;
use runnel_io::Scheduler;

/// Emits every written chunk as is
#[derive(Copy, Clone, Debug, Default)]
pub struct PassThrough;

impl Transformer for PassThrough {
    fn transform(&self, chunk: WriteChunk, _output: &Readable, done: TransformCallback) {
        done(Ok(Some(chunk.chunk)))
    }
}

pub fn pass_through(scheduler: &Scheduler) -> Transform {
    pass_through_with(scheduler, DuplexOptions::default())
}

pub fn pass_through_with(scheduler: &Scheduler, options: DuplexOptions) -> Transform {
    Transform::new(scheduler, PassThrough, options)
}

/// A [`Transformer`] assembled from a transform closure and an optional flush
/// closure
pub struct Through<T, F> {
    transform: T,
    flush: Option<F>,
}

impl<T, F> Transformer for Through<T, F>
where
    T: Fn(WriteChunk, &Readable, TransformCallback) + Send + Sync + 'static,
    F: Fn(&Readable, FlushCallback) + Send + Sync + 'static,
{
    fn transform(&self, chunk: WriteChunk, output: &Readable, done: TransformCallback) {
        (self.transform)(chunk, output, done)
    }

    fn flush(&self, output: &Readable, done: FlushCallback) {
        match &self.flush {
            Some(flush) => flush(output, done),
            None => done(Ok(())),
        }
    }
}

/// Builds a transform stream from closures. Without a flush closure the
/// readable side ends as soon as every write has been transformed.
///
/// ```rust
/// use runnel::prelude::*;
/// use runnel::pass_through::{through, FlushFn};
///
/// let scheduler = Scheduler::new();
/// let lengths = through(
///     &scheduler,
///     |chunk: WriteChunk, _: &Readable, done: TransformCallback| {
///         done(Ok(Some(chunk.chunk.len().to_string().into())))
///     },
///     None::<FlushFn>,
/// );
/// lengths.write("four");
/// ```
pub fn through<T, F>(scheduler: &Scheduler, transform: T, flush: Option<F>) -> Transform
where
    T: Fn(WriteChunk, &Readable, TransformCallback) + Send + Sync + 'static,
    F: Fn(&Readable, FlushCallback) + Send + Sync + 'static,
{
    Transform::new(scheduler, Through { transform, flush }, DuplexOptions::default())
}

/// Names the flush closure type when [`through`] is called without one
pub type FlushFn = fn(&Readable, FlushCallback);

#[cfg(test)]
mod tests {
    use crate::error::StreamError;
    use crate::events::EventKind;
    use crate::options::WritableOptions;
    use crate::pass_through::{pass_through, through, FlushFn};
    use crate::readable::Readable;
    use crate::stream::{
        FlushCallback, ReadableStream, TransformCallback, WritableStream, WriteChunk,
    };
    use crate::test_utils::{
        chunk, chunks, strings, DataCollector, ErrorCollector, EventLog, RecordingSink,
    };
    use crate::writable::Writable;
    use bytes::Bytes;
    use runnel_io::Scheduler;

    #[test]
    fn pass_through_forwards_unchanged() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let stream = pass_through(&scheduler);
        let data = DataCollector::attach(&stream);

        for value in chunks("p", 5) {
            let _ = stream.write(value);
            let _ = scheduler.run_until_idle();
        }
        stream.end();
        let _ = scheduler.run_until_idle();

        assert_eq!(data.strings(), strings(&chunks("p", 5)));
        assert!(stream.readable_state().emitted_end);
    }

    #[test]
    fn through_may_drop_chunks() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let evens = through(
            &scheduler,
            |chunk: WriteChunk, _: &Readable, done: TransformCallback| {
                let keep = chunk.chunk.last().map(|b| (b - b'0') % 2 == 0).unwrap_or(false);
                done(Ok(keep.then_some(chunk.chunk)))
            },
            None::<FlushFn>,
        );
        let data = DataCollector::attach(&evens);

        for value in chunks("n", 6) {
            let _ = evens.write(value);
        }
        evens.end();
        let _ = scheduler.run_until_idle();

        assert_eq!(data.strings(), vec!["n0", "n2", "n4"]);
    }

    #[test]
    fn through_flush_runs_before_end() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let stream = through(
            &scheduler,
            |chunk: WriteChunk, _: &Readable, done: TransformCallback| done(Ok(Some(chunk.chunk))),
            Some(|output: &Readable, done: FlushCallback| {
                let _ = output.push(Some(Bytes::from_static(b"done")));
                done(Ok(()))
            }),
        );
        let data = DataCollector::attach(&stream);
        let log = EventLog::attach(&stream, &[EventKind::End]);

        let _ = stream.write(chunk("body"));
        stream.end();
        let _ = scheduler.run_until_idle();

        assert_eq!(data.strings(), vec!["body", "done"]);
        assert_eq!(log.count(EventKind::End), 1);
    }

    #[test]
    fn flush_error_is_emitted() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let stream = through(
            &scheduler,
            |chunk: WriteChunk, _: &Readable, done: TransformCallback| done(Ok(Some(chunk.chunk))),
            Some(|_: &Readable, done: FlushCallback| done(Err(StreamError::generic("truncated")))),
        );
        let errors = ErrorCollector::attach(&stream);
        let log = EventLog::attach(&stream, &[EventKind::End]);
        let _data = DataCollector::attach(&stream);

        stream.end();
        let _ = scheduler.run_until_idle();

        assert_eq!(errors.errors(), vec![StreamError::generic("truncated")]);
        assert_eq!(log.count(EventKind::End), 0);
    }

    #[test]
    fn chained_pass_throughs_deliver_everything() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let sink = RecordingSink::next_tick(&scheduler);
        let first = pass_through(&scheduler);
        let last = Writable::new(
            &scheduler,
            sink.clone(),
            WritableOptions::default().with_high_water_mark(2),
        );

        let _ = first.pipe(&pass_through(&scheduler)).pipe(&last);
        for value in chunks("x", 20) {
            let _ = first.write(value);
            let _ = scheduler.run_until_idle();
        }
        first.end();
        let _ = scheduler.run_until_idle();

        assert_eq!(sink.written_strings(), strings(&chunks("x", 20)));
        assert!(last.writable_state().finished);
    }
}
