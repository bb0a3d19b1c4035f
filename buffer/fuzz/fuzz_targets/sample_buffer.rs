#![no_main]

use arbitrary::Arbitrary;
use bytes::BufMut;
use libfuzzer_sys::fuzz_target;
use medialane_buffer::{Block, BlockBuffer, Error, Format, FrozenBuffer, SampleBuffer, Span};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    capacity: u16,
    operations: Vec<BufferOperation>,
}

#[derive(Arbitrary, Debug)]
enum BufferOperation {
    WriteAt { data: Vec<u8>, offset: u16 },
    Append { data: Vec<u8> },
    SetSpan { offset: u16, len: u16 },
    Share,
    NarrowFrozen { offset: u16, len: u16 },
    ReadFrozen,
}

fn fuzz(input: FuzzInput) {
    let capacity = (input.capacity as usize % 2048) + 1;
    let mut buffer =
        BlockBuffer::allocate(Format::new("video/avc"), Block::with_capacity(capacity)).unwrap();

    // Mirror of the writer's window and span. Untracked blocks re-arm with
    // zeroed storage, so the mirror resets to zeros after every share.
    let mut mirror = vec![0u8; capacity];
    let mut span = Span::empty();

    // The most recent snapshot and the bytes it must keep serving.
    let mut frozen: Option<FrozenBuffer> = None;
    let mut frozen_bytes = Vec::new();
    let mut frozen_span = Span::empty();

    for op in input.operations {
        match op {
            BufferOperation::WriteAt { data, offset } => {
                let offset = offset as usize;
                if offset <= capacity && capacity - offset >= data.len() {
                    buffer.window_mut().unwrap()[offset..offset + data.len()]
                        .copy_from_slice(&data);
                    mirror[offset..offset + data.len()].copy_from_slice(&data);
                }
            }

            BufferOperation::Append { data } => {
                if data.len() <= buffer.remaining_mut() {
                    let at = span.end();
                    buffer.put_slice(&data);
                    mirror[at..at + data.len()].copy_from_slice(&data);
                    span.len += data.len();
                    assert_eq!(buffer.span(), span);
                }
            }

            BufferOperation::SetSpan { offset, len } => {
                let offset = offset as usize;
                let len = len as usize;
                let fits = offset
                    .checked_add(len)
                    .is_some_and(|end| end <= capacity);
                match buffer.set_span(Span::new(offset, len)) {
                    Ok(()) => {
                        assert!(fits);
                        span = Span::new(offset, len);
                    }
                    Err(Error::SpanOutOfBounds { .. }) => {
                        assert!(!fits);
                        assert_eq!(buffer.span(), span);
                    }
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }

            BufferOperation::Share => {
                let expected = mirror[span.offset..span.end()].to_vec();
                let snapshot = buffer.share();
                assert_eq!(snapshot.as_ref(), expected.as_slice());
                assert_eq!(buffer.span(), Span::empty());
                assert_eq!(buffer.capacity(), capacity);

                // An empty share publishes nothing and leaves the window
                // (and therefore the mirror) alone; a non-empty share
                // re-arms the window with zeroed storage.
                if !expected.is_empty() {
                    mirror.fill(0);
                }
                span = Span::empty();

                frozen_span = Span::new(0, expected.len());
                frozen_bytes = expected;
                frozen = Some(FrozenBuffer::allocate(Format::new("video/avc"), snapshot));
            }

            BufferOperation::NarrowFrozen { offset, len } => {
                if let Some(ref mut reader) = frozen {
                    let request = Span::new(offset as usize, len as usize);
                    let fits = request
                        .offset
                        .checked_add(request.len)
                        .is_some_and(|end| end <= reader.capacity());
                    let narrows = frozen_span.contains(&request);
                    match reader.set_span(request) {
                        Ok(()) => {
                            assert!(fits && narrows);
                            frozen_span = request;
                        }
                        Err(Error::SpanOutOfBounds { .. }) => assert!(!fits),
                        Err(Error::SpanWiden(..)) => assert!(fits && !narrows),
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
            }

            BufferOperation::ReadFrozen => {
                if let Some(ref mut reader) = frozen {
                    // Later writer activity must never show through
                    assert_eq!(reader.window(), frozen_bytes.as_slice());
                    assert_eq!(
                        reader.payload(),
                        &frozen_bytes[frozen_span.offset..frozen_span.end()]
                    );
                    assert!(matches!(reader.window_mut(), Err(Error::ReadOnly)));
                    assert!(matches!(reader.payload_mut(), Err(Error::ReadOnly)));
                }
            }
        }
    }
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
