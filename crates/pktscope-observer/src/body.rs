//! Body decorators that mirror every chunk into a [`FrameAccumulator`].
//!
//! Observation happens after the inner stream has produced data and before
//! the caller sees it. The bytes, the error and the end-of-stream signal are
//! passed through unchanged. Closing (or dropping) the wrapper flushes the
//! accumulator exactly once.

use http_body::{Body, Frame, SizeHint};
use std::fmt;
use std::io::{self, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::accumulator::FrameAccumulator;
use crate::sink::TraceSink;
use crate::tag::Tag;

/// Per-stream observation state shared by both wrappers.
struct Observer {
    tag: Tag,
    accumulator: FrameAccumulator,
    sink: Arc<dyn TraceSink>,
    closed: bool,
}

impl Observer {
    fn new(tag: Tag, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            tag,
            accumulator: FrameAccumulator::new(),
            sink,
            closed: false,
        }
    }

    fn observe(&self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.accumulator.push(&self.tag, bytes, self.sink.as_ref());
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.accumulator.flush(&self.tag, self.sink.as_ref());
        }
    }
}

/// Observes a blocking [`Read`] stream.
pub struct ObservingReader<R> {
    inner: R,
    observer: Observer,
}

impl<R: Read> ObservingReader<R> {
    /// Wraps `inner`, logging its pkt-lines under `tag`.
    pub fn new(inner: R, tag: Tag, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            inner,
            observer: Observer::new(tag, sink),
        }
    }

    /// Returns the tag this stream is logged under.
    pub fn tag(&self) -> &Tag {
        &self.observer.tag
    }

    /// Flushes the decoder and closes the inner stream.
    pub fn close(mut self) {
        self.observer.close();
    }
}

impl<R: Read> Read for ObservingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.observer.observe(&buf[..n]);
        Ok(n)
    }
}

impl<R> Drop for ObservingReader<R> {
    fn drop(&mut self) {
        self.observer.close();
    }
}

impl<R> fmt::Debug for ObservingReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservingReader")
            .field("tag", &self.observer.tag)
            .field("closed", &self.observer.closed)
            .finish_non_exhaustive()
    }
}

/// Observes an [`http_body::Body`], request or response alike.
///
/// Data frames are decoded as they are polled; trailers pass through
/// untouched. The decoder is flushed when the body is dropped, which is how
/// HTTP clients and servers close a body.
pub struct ObservedBody<B> {
    inner: Pin<Box<B>>,
    observer: Observer,
}

impl<B> ObservedBody<B> {
    /// Wraps `inner`, logging its pkt-lines under `tag`.
    pub fn new(inner: B, tag: Tag, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            inner: Box::pin(inner),
            observer: Observer::new(tag, sink),
        }
    }

    /// Returns the tag this body is logged under.
    pub fn tag(&self) -> &Tag {
        &self.observer.tag
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body,
    B::Data: AsRef<[u8]>,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_frame(cx);

        if let Poll::Ready(Some(Ok(frame))) = &polled {
            if let Some(data) = frame.data_ref() {
                this.observer.observe(data.as_ref());
            }
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for ObservedBody<B> {
    fn drop(&mut self) {
        self.observer.close();
    }
}

impl<B> fmt::Debug for ObservedBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedBody")
            .field("tag", &self.observer.tag)
            .finish_non_exhaustive()
    }
}
