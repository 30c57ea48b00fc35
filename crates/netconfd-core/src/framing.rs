// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Buffer pool and NETCONF 1.0/1.1 framing codec (component A).
//!
//! The buffer layout and the in-place chunk-header trick are grounded
//! on OpenYuma's `ses_msg.c`: a buffer reserves `STARTCHUNK_PAD` bytes
//! at its front so that, once a 1.1 chunk's payload has been written,
//! the `\n#<len>\n` header can be written backwards into the reserved
//! region instead of requiring a second buffer and a copy. The
//! chunk/terminator wire shapes reuse `netconfd_protocol`'s constants,
//! generalizing a fixed length-prefixed framing codec's
//! `read_into`/`write_to` shape to the arbitrary decimal-length
//! NETCONF chunk grammar.

use std::collections::VecDeque;

use netconfd_protocol::{ChunkHeader, FramingError, FramingMode, CHUNK_TERMINATOR, EOM_SENTINEL};

use crate::consts;

/// A fixed-size buffer with three cursors:
/// `start` (payload begin, after any reserved chunk-header pad),
/// `pos` (current read/write offset) and `end` (one past the last
/// valid byte).
pub struct Buffer {
    data: Box<[u8]>,
    pub start: usize,
    pub pos: usize,
    pub end: usize,
}

impl Buffer {
    fn new(size: usize) -> Self {
        Buffer { data: vec![0u8; size].into_boxed_slice(), start: 0, pos: 0, end: 0 }
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.pos = 0;
        self.end = 0;
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Space available for the caller to write new payload bytes into,
    /// starting just past `STARTCHUNK_PAD` so a chunk header can later
    /// be backed into the reserved region.
    pub fn write_region(&mut self) -> &mut [u8] {
        let from = consts::STARTCHUNK_PAD.max(self.end);
        &mut self.data[from..]
    }

    /// Records that `n` freshly written payload bytes, starting at
    /// `STARTCHUNK_PAD` (or continuing from wherever `end` already
    /// was), are now valid.
    pub fn advance_write(&mut self, n: usize) {
        if self.end < consts::STARTCHUNK_PAD {
            self.end = consts::STARTCHUNK_PAD;
            self.start = consts::STARTCHUNK_PAD;
        }
        self.end += n;
    }

    /// Appends raw bytes read off the wire (no chunk-header pad
    /// involved; used for inbound assembly).
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        if self.end + bytes.len() > self.data.len() {
            return Err(FramingError::ResourceDenied);
        }
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }

    /// Writes a 1.1 chunk header into the reserved pad, in place,
    /// directly ahead of the payload already written by
    /// `write_region`/`advance_write`. Mirrors `ses_msg.c`'s
    /// `buffstart = STARTCHUNK_PAD - (numlen+3)` computation.
    pub fn finalize_chunk(&mut self) -> Result<(), FramingError> {
        let payload_start = consts::STARTCHUNK_PAD;
        if self.end < payload_start {
            return Err(FramingError::MalformedChunkHeader);
        }
        let len = (self.end - payload_start) as u32;
        let header = ChunkHeader::new(len)?;
        let header_str = format!("\n#{}\n", header.len);
        let header_bytes = header_str.as_bytes();
        if header_bytes.len() > consts::STARTCHUNK_PAD {
            return Err(FramingError::MalformedChunkHeader);
        }
        let buffstart = payload_start - header_bytes.len();
        self.data[buffstart..payload_start].copy_from_slice(header_bytes);
        self.start = buffstart;
        Ok(())
    }
}

/// Per-session pool of recycled buffers. Touched only by the loop
/// thread ("shared resources").
pub struct BufferPool {
    buf_size: usize,
    max_free: usize,
    max_total: usize,
    free: Vec<Buffer>,
    allocated: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_free: usize, max_total: usize) -> Self {
        BufferPool { buf_size, max_free, max_total, free: Vec::new(), allocated: 0 }
    }

    pub fn acquire(&mut self) -> Result<Buffer, FramingError> {
        if let Some(mut buf) = self.free.pop() {
            buf.reset();
            return Ok(buf);
        }
        if self.allocated >= self.max_total {
            return Err(FramingError::ResourceDenied);
        }
        self.allocated += 1;
        Ok(Buffer::new(self.buf_size))
    }

    pub fn release(&mut self, mut buf: Buffer) {
        buf.reset();
        if self.free.len() < self.max_free {
            self.free.push(buf);
        } else {
            self.allocated = self.allocated.saturating_sub(1);
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

/// Assembles raw inbound bytes into complete messages per the active
/// `FramingMode`. One decoder is owned by each session's control
/// block (component B).
pub struct FramingDecoder {
    mode: FramingMode,
    max_chunk_len: u32,
    scratch: Vec<u8>,
    current_message: Vec<u8>,
}

impl FramingDecoder {
    pub fn new(max_chunk_len: u32) -> Self {
        FramingDecoder {
            mode: FramingMode::EndOfMessage,
            max_chunk_len,
            scratch: Vec::new(),
            current_message: Vec::new(),
        }
    }

    pub fn set_mode(&mut self, mode: FramingMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.scratch.extend_from_slice(bytes);
    }

    pub fn has_pending_bytes(&self) -> bool {
        !self.scratch.is_empty() || !self.current_message.is_empty()
    }

    /// Called when the peer closes the connection; a non-empty partial
    /// chunk or dangling scratch buffer is a framing error per
    /// "partial chunk at EOF".
    pub fn finish(&self) -> Result<(), FramingError> {
        if self.has_pending_bytes() {
            return Err(FramingError::PartialChunkAtEof);
        }
        Ok(())
    }

    /// Tries to extract one complete message from whatever has been
    /// pushed so far. Returns `Ok(None)` when more bytes are needed.
    pub fn try_next_message(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        match self.mode {
            FramingMode::EndOfMessage => self.try_next_eom(),
            FramingMode::Chunked => self.try_next_chunked(),
        }
    }

    fn try_next_eom(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        match find_subslice(&self.scratch, EOM_SENTINEL) {
            Some(idx) => {
                let message: Vec<u8> = self.scratch[..idx].to_vec();
                self.scratch.drain(..idx + EOM_SENTINEL.len());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    fn try_next_chunked(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        loop {
            if self.scratch.starts_with(CHUNK_TERMINATOR) {
                self.scratch.drain(..CHUNK_TERMINATOR.len());
                return Ok(Some(std::mem::take(&mut self.current_message)));
            }

            if self.scratch.len() < 2 {
                return Ok(None);
            }
            if &self.scratch[..2] != b"\n#" {
                return Err(FramingError::MalformedChunkHeader);
            }

            let header_digits_end = match self.scratch[2..].iter().position(|&b| b == b'\n') {
                Some(idx) => idx,
                None => {
                    if self.scratch.len() - 2 > 10 {
                        // ten decimal digits covers u32::MAX; more than
                        // that without a newline can never be valid.
                        return Err(FramingError::MalformedChunkHeader);
                    }
                    return Ok(None);
                }
            };
            let digits = &self.scratch[2..2 + header_digits_end];
            if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
                return Err(FramingError::MalformedChunkHeader);
            }
            let len: u32 = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(FramingError::MalformedChunkHeader)?;
            let header = ChunkHeader::new(len)?;
            if header.len > self.max_chunk_len {
                return Err(FramingError::ChunkTooLarge(header.len, self.max_chunk_len));
            }

            let header_total = 2 + header_digits_end + 1;
            let total_needed = header_total + header.len as usize;
            if self.scratch.len() < total_needed {
                return Ok(None);
            }

            let payload = &self.scratch[header_total..total_needed];
            self.current_message.extend_from_slice(payload);
            self.scratch.drain(..total_needed);
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Encodes one outbound message as a 1.0-framed buffer: payload
/// followed by the end-of-message sentinel.
pub fn encode_eom(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + EOM_SENTINEL.len());
    out.extend_from_slice(payload);
    out.extend_from_slice(EOM_SENTINEL);
    out
}

/// Encodes one outbound message as a single 1.1 chunk followed by the
/// terminator chunk. A session with a real buffer pool behind it
/// instead uses `Buffer::finalize_chunk` to avoid the header copy this
/// free function performs; this form exists for callers (tests, the
/// outbound serializer) that only have a `Vec<u8>` payload in hand.
pub fn encode_chunked(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 32);
    out.extend_from_slice(format!("\n#{}\n", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(CHUNK_TERMINATOR);
    out
}

/// An outbound queue of ready-to-send buffers for one session,
/// consumed by the multiplexer's scatter-write step.
#[derive(Default)]
pub struct OutputQueue {
    buffers: VecDeque<Vec<u8>>,
    cap: usize,
}

impl OutputQueue {
    pub fn new(cap: usize) -> Self {
        OutputQueue { buffers: VecDeque::new(), cap }
    }

    /// Enqueues a buffer, or returns `ResourceDenied` if the session's
    /// outbound cap is already reached ("backpressure").
    pub fn enqueue(&mut self, buf: Vec<u8>) -> Result<(), FramingError> {
        if self.buffers.len() >= self.cap {
            return Err(FramingError::ResourceDenied);
        }
        self.buffers.push_back(buf);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.buffers.pop_front()
    }

    pub fn push_front(&mut self, buf: Vec<u8>) {
        self.buffers.push_front(buf);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eom_round_trip() {
        let mut dec = FramingDecoder::new(1 << 20);
        dec.push(&encode_eom(b"<hi/>"));
        let msg = dec.try_next_message().unwrap().unwrap();
        assert_eq!(msg, b"<hi/>");
        assert!(dec.try_next_message().unwrap().is_none());
    }

    #[test]
    fn eom_sees_exact_byte_range() {
        let mut dec = FramingDecoder::new(1 << 20);
        dec.push(b"<a/>]]>]]><b/>]]>]]>");
        let first = dec.try_next_message().unwrap().unwrap();
        assert_eq!(first, b"<a/>");
        let second = dec.try_next_message().unwrap().unwrap();
        assert_eq!(second, b"<b/>");
    }

    #[test]
    fn chunked_round_trip() {
        let mut dec = FramingDecoder::new(1 << 20);
        dec.set_mode(FramingMode::Chunked);
        dec.push(b"\n#5\n<hi/>\n##\n");
        let msg = dec.try_next_message().unwrap().unwrap();
        assert_eq!(msg, b"<hi/>");
    }

    #[test]
    fn chunked_multi_chunk_message() {
        let mut dec = FramingDecoder::new(1 << 20);
        dec.set_mode(FramingMode::Chunked);
        dec.push(b"\n#2\nhe\n#3\nllo\n##\n");
        let msg = dec.try_next_message().unwrap().unwrap();
        assert_eq!(msg, b"hello");
    }

    #[test]
    fn chunked_partial_needs_more() {
        let mut dec = FramingDecoder::new(1 << 20);
        dec.set_mode(FramingMode::Chunked);
        dec.push(b"\n#5\n<h");
        assert!(dec.try_next_message().unwrap().is_none());
        dec.push(b"i/>\n##\n");
        let msg = dec.try_next_message().unwrap().unwrap();
        assert_eq!(msg, b"<hi/>");
    }

    #[test]
    fn chunked_malformed_header_errors() {
        let mut dec = FramingDecoder::new(1 << 20);
        dec.set_mode(FramingMode::Chunked);
        dec.push(b"\n#abc\n");
        assert!(matches!(
            dec.try_next_message(),
            Err(FramingError::MalformedChunkHeader)
        ));
    }

    #[test]
    fn chunked_too_large_errors() {
        let mut dec = FramingDecoder::new(10);
        dec.set_mode(FramingMode::Chunked);
        dec.push(b"\n#20\n");
        assert!(matches!(dec.try_next_message(), Err(FramingError::ChunkTooLarge(20, 10))));
    }

    #[test]
    fn partial_chunk_at_eof_errors() {
        let mut dec = FramingDecoder::new(1 << 20);
        dec.set_mode(FramingMode::Chunked);
        dec.push(b"\n#5\n<h");
        let _ = dec.try_next_message();
        assert!(matches!(dec.finish(), Err(FramingError::PartialChunkAtEof)));
    }

    #[test]
    fn pool_acquire_release_and_cap() {
        let mut pool = BufferPool::new(64, 2, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(FramingError::ResourceDenied)));
        pool.release(a);
        let c = pool.acquire().unwrap();
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn finalize_chunk_writes_header_in_place() {
        let mut buf = Buffer::new(consts::STARTCHUNK_PAD + 32);
        buf.advance_write(0);
        let region_start = buf.end;
        buf.data_mut_for_test()[region_start..region_start + 5].copy_from_slice(b"<hi/>");
        buf.end = region_start + 5;
        buf.finalize_chunk().unwrap();
        assert_eq!(buf.payload(), b"\n#5\n<hi/>");
    }

    impl Buffer {
        fn data_mut_for_test(&mut self) -> &mut [u8] {
            &mut self.data
        }
    }

    #[test]
    fn output_queue_backpressure() {
        let mut q = OutputQueue::new(1);
        q.enqueue(vec![1]).unwrap();
        assert!(matches!(q.enqueue(vec![2]), Err(FramingError::ResourceDenied)));
        q.pop_front();
        q.enqueue(vec![3]).unwrap();
    }
}
