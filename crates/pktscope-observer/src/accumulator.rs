//! Incremental pkt-line decoding for observed byte streams.
//!
//! A [`FrameAccumulator`] is fed whatever chunks happen to cross the wire,
//! in whatever sizes the HTTP client reads them, and reports each complete
//! pkt-line as soon as its last byte arrives. Sideband frames are
//! demultiplexed into child accumulators, one per channel, which decode
//! their channel's bytes as an independent pkt-line stream.
//!
//! Nothing here ever fails: malformed input ends decoding for that stream
//! with a logged diagnostic and the bytes keep flowing to their consumer.

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::pktline::{LengthField, LENGTH_PREFIX, SIDEBAND_DATA, SIDEBAND_PROGRESS};
use crate::sink::{TraceEvent, TraceSink};
use crate::tag::Tag;

/// Deepest sideband nesting that is demultiplexed.
///
/// Real servers multiplex a single level. Frames inside a channel at this
/// depth are logged verbatim rather than routed further, which bounds the
/// recursion a hostile stream can cause.
pub const MAX_SIDEBAND_DEPTH: usize = 2;

/// Stateful pkt-line parser for one logical stream.
///
/// All state sits behind a single lock held for a whole push or flush, so
/// concurrent readers of the same stream observe whole parse passes.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// Unconsumed input. Never holds a complete frame between passes.
    buffer: BytesMut,
    /// Set once `PACK` or a malformed length field is seen.
    finished: bool,
    /// Bytes received after `finished` was set.
    trailing: usize,
    /// Whether anything was pushed since the last flush.
    dirty: bool,
    /// Sideband channel decoders, created on first use.
    children: BTreeMap<u8, FrameAccumulator>,
    /// Number of sideband levels above this stream.
    depth: usize,
}

impl FrameAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    fn nested(depth: usize) -> Self {
        Self {
            state: Mutex::new(State {
                depth,
                ..State::default()
            }),
        }
    }

    /// Feeds observed bytes and decodes every frame they complete.
    pub fn push(&self, tag: &Tag, bytes: &[u8], sink: &dyn TraceSink) {
        let mut state = self.state.lock();
        state.dirty = true;

        if state.finished {
            state.trailing += bytes.len();
            return;
        }

        state.buffer.extend_from_slice(bytes);
        state.drain(tag, sink);
    }

    /// Reports what is left undecoded when the stream closes.
    ///
    /// Emits at most one line for this stream, then flushes each sideband
    /// child under its own tag. Calling it again without new input emits
    /// nothing.
    pub fn flush(&self, tag: &Tag, sink: &dyn TraceSink) {
        let mut state = self.state.lock();

        if state.dirty {
            state.dirty = false;
            if state.finished && state.trailing > 0 {
                sink.emit(
                    tag,
                    &TraceEvent::TrailingBytes {
                        bytes: state.trailing,
                    },
                );
            } else if !state.finished && !state.buffer.is_empty() {
                sink.emit(
                    tag,
                    &TraceEvent::IncompleteFrame {
                        bytes: state.buffer.len(),
                    },
                );
            }
        }

        for (channel, child) in &state.children {
            child.flush(&tag.sideband(*channel), sink);
        }
    }

    /// Returns true once decoding has stopped for this stream.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Number of bytes seen after decoding stopped.
    pub fn trailing(&self) -> usize {
        self.state.lock().trailing
    }

    /// Sideband channels that have carried data, in ascending order.
    pub fn channels(&self) -> Vec<u8> {
        self.state.lock().children.keys().copied().collect()
    }
}

impl State {
    fn drain(&mut self, tag: &Tag, sink: &dyn TraceSink) {
        while self.buffer.len() >= LENGTH_PREFIX {
            let mut field = [0u8; LENGTH_PREFIX];
            field.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);

            let size = match LengthField::parse(field) {
                LengthField::Flush => {
                    sink.emit(tag, &TraceEvent::FlushPacket);
                    self.buffer.advance(LENGTH_PREFIX);
                    continue;
                }
                LengthField::Pack => {
                    sink.emit(tag, &TraceEvent::PackMarker);
                    self.finish(self.buffer.len() - LENGTH_PREFIX);
                    return;
                }
                LengthField::Invalid => {
                    sink.emit(tag, &TraceEvent::InvalidSize { field });
                    self.finish(self.buffer.len());
                    return;
                }
                LengthField::Size(size) => size,
            };

            if size > self.buffer.len() {
                return;
            }

            let mut frame = self.buffer.split_to(size);
            frame.advance(LENGTH_PREFIX);
            let payload = frame.freeze();

            match payload.first().copied() {
                Some(channel @ (SIDEBAND_DATA | SIDEBAND_PROGRESS))
                    if self.depth < MAX_SIDEBAND_DEPTH =>
                {
                    let depth = self.depth + 1;
                    self.children
                        .entry(channel)
                        .or_insert_with(|| FrameAccumulator::nested(depth))
                        .push(&tag.sideband(channel), &payload[1..], sink);
                }
                _ => sink.emit(tag, &TraceEvent::Frame { size, payload }),
            }
        }
    }

    /// Stops decoding, counting `discarded` buffered bytes as trailing.
    fn finish(&mut self, discarded: usize) {
        self.finished = true;
        self.trailing += discarded;
        self.buffer = BytesMut::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::PktLine;
    use crate::sink::MemorySink;
    use bytes::Bytes;

    fn frame(size: usize, payload: &'static [u8]) -> TraceEvent {
        TraceEvent::Frame {
            size,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_single_chunk_scenario() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("1/response");

        acc.push(&tag, b"0006a\n0000PACKxyz", &sink);
        acc.flush(&tag, &sink);

        assert_eq!(
            sink.events_for("1/response"),
            vec![
                frame(6, b"a\n"),
                TraceEvent::FlushPacket,
                TraceEvent::PackMarker,
                TraceEvent::TrailingBytes { bytes: 3 },
            ]
        );
        assert!(acc.is_finished());
        assert_eq!(acc.trailing(), 3);
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_flush_packet_consumes_four_bytes() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"00000", &sink);
        assert_eq!(sink.events(), vec![(tag.clone(), TraceEvent::FlushPacket)]);
        assert_eq!(acc.buffered(), 1);
    }

    #[test]
    fn test_partial_frame_waits_for_more_input() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"000ahel", &sink);
        assert!(sink.is_empty());
        assert_eq!(acc.buffered(), 7);

        acc.push(&tag, b"lo\n", &sink);
        assert_eq!(sink.events_for("t"), vec![frame(10, b"hello\n")]);
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_length_prefix_split_across_pushes() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"00", &sink);
        acc.push(&tag, b"0", &sink);
        acc.push(&tag, b"5x", &sink);
        assert_eq!(sink.events_for("t"), vec![frame(5, b"x")]);
    }

    #[test]
    fn test_pack_marker_logged_once() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"PACK\x00\x00\x00\x02", &sink);
        acc.push(&tag, b"0006a\n", &sink);
        acc.push(&tag, b"PACK0000", &sink);

        assert_eq!(sink.events_for("t"), vec![TraceEvent::PackMarker]);
        assert_eq!(acc.trailing(), 4 + 6 + 8);
    }

    #[test]
    fn test_bytes_after_finish_only_count() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"PACK", &sink);
        let big = vec![b'0'; 64 * 1024];
        for _ in 0..16 {
            acc.push(&tag, &big, &sink);
        }

        assert_eq!(sink.len(), 1);
        assert_eq!(acc.buffered(), 0);
        assert_eq!(acc.trailing(), 16 * 64 * 1024);

        acc.flush(&tag, &sink);
        assert_eq!(
            sink.events_for("t").last(),
            Some(&TraceEvent::TrailingBytes {
                bytes: 16 * 64 * 1024
            })
        );
    }

    #[test]
    fn test_pack_without_trailing_bytes_flushes_silently() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"PACK", &sink);
        acc.flush(&tag, &sink);
        assert_eq!(sink.events_for("t"), vec![TraceEvent::PackMarker]);
    }

    #[test]
    fn test_invalid_size_counts_discarded_bytes() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"0006a\nzz01rest", &sink);
        assert!(acc.is_finished());
        assert_eq!(acc.trailing(), 8);

        acc.push(&tag, b"more", &sink);
        acc.flush(&tag, &sink);

        assert_eq!(
            sink.events_for("t"),
            vec![
                frame(6, b"a\n"),
                TraceEvent::InvalidSize { field: *b"zz01" },
                TraceEvent::TrailingBytes { bytes: 12 },
            ]
        );
    }

    #[test]
    fn test_size_below_prefix_is_invalid() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"0003", &sink);
        assert_eq!(
            sink.events_for("t"),
            vec![TraceEvent::InvalidSize { field: *b"0003" }]
        );
        assert!(acc.is_finished());
        assert_eq!(acc.trailing(), 4);
    }

    #[test]
    fn test_empty_payload_frame() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"0004", &sink);
        assert_eq!(sink.events_for("t"), vec![frame(4, b"")]);
        assert!(!acc.is_finished());
    }

    #[test]
    fn test_sideband_routing() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("1/response");

        acc.push(&tag, b"0007\x01ab", &sink);
        assert!(sink.is_empty());
        assert_eq!(acc.channels(), vec![1]);

        acc.flush(&tag, &sink);
        assert_eq!(
            sink.events(),
            vec![(
                Tag::new("1/response/sideband-1"),
                TraceEvent::IncompleteFrame { bytes: 2 }
            )]
        );
    }

    #[test]
    fn test_interleaved_sidebands_decode_independently() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("r");

        let mut stream = Vec::new();
        stream.extend(PktLine::sideband(1, b"0009").encode());
        stream.extend(PktLine::sideband(2, b"0008one\n").encode());
        stream.extend(PktLine::sideband(1, b"first").encode());
        stream.extend(PktLine::sideband(2, b"0008two\n").encode());
        stream.extend(PktLine::sideband(1, b"0000").encode());

        acc.push(&tag, &stream, &sink);

        assert_eq!(
            sink.events_for("r/sideband-1"),
            vec![frame(9, b"first"), TraceEvent::FlushPacket]
        );
        assert_eq!(
            sink.events_for("r/sideband-2"),
            vec![frame(8, b"one\n"), frame(8, b"two\n")]
        );
        assert!(sink.events_for("r").is_empty());
        assert_eq!(acc.channels(), vec![1, 2]);
    }

    #[test]
    fn test_unrecognized_channel_logged_verbatim() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("r");

        acc.push(&tag, b"0008\x03bad", &sink);
        acc.push(&tag, b"001e# service=git-upload-pack\n", &sink);

        assert_eq!(
            sink.events_for("r"),
            vec![frame(8, b"\x03bad"), frame(30, b"# service=git-upload-pack\n")]
        );
        assert!(acc.channels().is_empty());
    }

    #[test]
    fn test_pack_on_sideband_finishes_only_child() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("r");

        acc.push(&tag, &PktLine::sideband(1, b"PACK\x00\x00").encode(), &sink);
        acc.push(&tag, &PktLine::sideband(2, b"0007hi\n").encode(), &sink);
        acc.push(&tag, b"0000", &sink);
        acc.flush(&tag, &sink);

        assert!(!acc.is_finished());
        assert_eq!(
            sink.events_for("r/sideband-1"),
            vec![TraceEvent::PackMarker, TraceEvent::TrailingBytes { bytes: 2 }]
        );
        assert_eq!(sink.events_for("r/sideband-2"), vec![frame(7, b"hi\n")]);
        assert_eq!(sink.events_for("r"), vec![TraceEvent::FlushPacket]);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"00", &sink);
        acc.flush(&tag, &sink);
        acc.flush(&tag, &sink);

        assert_eq!(
            sink.events_for("t"),
            vec![TraceEvent::IncompleteFrame { bytes: 2 }]
        );
    }

    #[test]
    fn test_flush_reports_again_after_new_input() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        acc.push(&tag, b"00", &sink);
        acc.flush(&tag, &sink);
        acc.push(&tag, b"1", &sink);
        acc.flush(&tag, &sink);

        assert_eq!(
            sink.events_for("t"),
            vec![
                TraceEvent::IncompleteFrame { bytes: 2 },
                TraceEvent::IncompleteFrame { bytes: 3 },
            ]
        );
    }

    #[test]
    fn test_flush_empty_is_silent() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        acc.flush(&Tag::new("t"), &sink);
        acc.push(&Tag::new("t"), b"0000", &sink);
        acc.flush(&Tag::new("t"), &sink);
        assert_eq!(sink.events(), vec![(Tag::new("t"), TraceEvent::FlushPacket)]);
    }

    #[test]
    fn test_concurrent_pushes_keep_frames_whole() {
        use std::sync::Arc;

        let sink = Arc::new(MemorySink::new());
        let acc = Arc::new(FrameAccumulator::new());
        let line = PktLine::from_string("concurrent\n").encode();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sink = Arc::clone(&sink);
                let acc = Arc::clone(&acc);
                let line = line.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        acc.push(&Tag::new("t"), &line, sink.as_ref());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let events = sink.events_for("t");
        assert_eq!(events.len(), 400);
        assert!(events.iter().all(|e| *e == frame(15, b"concurrent\n")));
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_nested_sideband_stops_at_depth_limit() {
        let sink = MemorySink::new();
        let acc = FrameAccumulator::new();
        let tag = Tag::new("t");

        let innermost = PktLine::sideband(2, b"deep").encode();
        let middle = PktLine::sideband(1, &innermost).encode();
        let outer = PktLine::sideband(1, &middle).encode();
        acc.push(&tag, &outer, &sink);

        // Two levels are demultiplexed; the third frame is logged as-is.
        assert_eq!(
            sink.events(),
            vec![(
                Tag::new("t/sideband-1/sideband-1"),
                TraceEvent::Frame {
                    size: innermost.len(),
                    payload: Bytes::copy_from_slice(&innermost[4..]),
                },
            )]
        );
        assert_eq!(acc.channels(), vec![SIDEBAND_DATA]);
    }

    #[test]
    fn test_deeply_nested_sidebands_use_bounded_stack() {
        let mut stream = PktLine::Flush.encode();
        for _ in 0..8_000 {
            stream = PktLine::sideband(1, &stream).encode();
        }
        assert!(stream.len() < 0x10000);

        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                let sink = MemorySink::new();
                let acc = FrameAccumulator::new();
                let tag = Tag::new("t");
                acc.push(&tag, &stream, &sink);
                acc.flush(&tag, &sink);
                sink.events()
            })
            .unwrap();
        let events = handle.join().unwrap();

        assert_eq!(events.len(), 1);
        let (tag, event) = &events[0];
        assert_eq!(tag.as_str(), "t/sideband-1/sideband-1");
        match event {
            TraceEvent::Frame { payload, .. } => assert_eq!(payload[0], SIDEBAND_DATA),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
