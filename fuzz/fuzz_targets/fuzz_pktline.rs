//! Fuzz target for incremental pkt-line observation.
//!
//! Feeds arbitrary input in arbitrary chunk sizes and checks that decoding
//! never panics and that chunking never changes the trace.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pktscope_observer::{FrameAccumulator, MemorySink, Tag};

#[derive(Debug, Arbitrary)]
struct Input {
    data: Vec<u8>,
    chunk_sizes: Vec<u8>,
}

fn decode<'a>(chunks: impl Iterator<Item = &'a [u8]>) -> Vec<String> {
    let sink = MemorySink::new();
    let acc = FrameAccumulator::new();
    let tag = Tag::new("fuzz");
    for chunk in chunks {
        acc.push(&tag, chunk, &sink);
    }
    acc.flush(&tag, &sink);
    sink.lines()
}

fuzz_target!(|input: Input| {
    let whole = decode(std::iter::once(input.data.as_slice()));

    let mut chunks = Vec::new();
    let mut rest = input.data.as_slice();
    for size in input.chunk_sizes.iter().cycle().take(rest.len().max(1)) {
        if rest.is_empty() {
            break;
        }
        let n = (*size as usize).clamp(1, rest.len());
        let (head, tail) = rest.split_at(n);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }

    assert_eq!(decode(chunks.into_iter()), whole);
});
