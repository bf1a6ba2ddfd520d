use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};

use crate::error::FramingError;

/// Where a buffer is in its fill/drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Empty, nobody touching it
    Idle,
    /// Being filled from a source
    Filling,
    /// Holds bytes nobody started consuming
    Filled,
    /// Partially consumed
    Draining,
}

/// Outcome of one fill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Read(usize),
    Eof,
    /// No spare capacity left
    Full,
}

/// Fixed-capacity byte buffer sitting between a way and its socket.
///
/// Inbound ways fill it from the socket and drain it through the line
/// builder or an entity decoder. Outbound ways fill it with serialized
/// bytes and drain it into the socket.
#[derive(Debug)]
pub struct Buffer {
    bytes: BytesMut,
    capacity: usize,
    state: BufferState,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(capacity),
            capacity,
            state: BufferState::Idle,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn spare(&self) -> usize {
        self.capacity.saturating_sub(self.bytes.len())
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Unconsumed bytes.
    pub fn chunk(&self) -> &[u8] {
        &self.bytes
    }

    /// Reads once from `src` into the spare capacity.
    pub fn fill_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<Fill> {
        let spare = self.spare();
        if spare == 0 {
            return Ok(Fill::Full);
        }

        self.state = BufferState::Filling;
        let len = self.bytes.len();
        self.bytes.resize(len + spare, 0);
        let result = src.read(&mut self.bytes[len..]);
        let read = *result.as_ref().unwrap_or(&0);
        self.bytes.truncate(len + read);
        self.settle(BufferState::Filled);

        match result {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => Ok(Fill::Read(n)),
            Err(e) => Err(e),
        }
    }

    /// Appends serialized bytes. Capacity is advisory here: a message head
    /// is always written whole.
    pub fn put(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
        self.settle(BufferState::Filled);
    }

    pub fn put_bytes(&mut self, data: BytesMut) {
        if self.bytes.is_empty() {
            self.bytes = data;
        } else {
            self.bytes.unsplit(data);
        }
        self.settle(BufferState::Filled);
    }

    /// Drops the first `n` unconsumed bytes.
    pub fn consume(&mut self, n: usize) {
        self.bytes.advance(n);
        self.settle(BufferState::Draining);
    }

    /// Copies buffered bytes into `out`, returning how many were moved.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.bytes.len());
        out[..n].copy_from_slice(&self.bytes[..n]);
        self.consume(n);
        n
    }

    /// Writes buffered bytes into `dst` until the buffer is empty.
    ///
    /// `WouldBlock` is returned as is; bytes written before it are consumed.
    pub fn flush_to<W: Write + ?Sized>(&mut self, dst: &mut W) -> io::Result<usize> {
        let mut written = 0;
        while !self.bytes.is_empty() {
            self.state = BufferState::Draining;
            match dst.write(&self.bytes) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    self.consume(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Moves bytes into `line` up to and including the next LF.
    ///
    /// Returns `true` once a whole line was accumulated; the terminator is
    /// stripped. Partial lines stay in `line` across calls.
    pub fn fill_line(&mut self, line: &mut LineBuilder) -> Result<bool, FramingError> {
        match self.bytes.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.push(&self.bytes[..pos])?;
                self.consume(pos + 1);
                line.complete();
                Ok(true)
            }
            None => {
                let n = self.bytes.len();
                line.push(&self.bytes[..n])?;
                self.consume(n);
                Ok(false)
            }
        }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.state = BufferState::Idle;
    }

    fn settle(&mut self, busy: BufferState) {
        self.state = if self.bytes.is_empty() {
            self.bytes.clear();
            BufferState::Idle
        } else {
            busy
        };
    }
}

/// Accumulates one textual line of a start line or header section.
#[derive(Debug)]
pub struct LineBuilder {
    line: Vec<u8>,
    max: usize,
    complete: bool,
}

impl LineBuilder {
    pub fn new(max: usize) -> Self {
        Self {
            line: Vec::new(),
            max,
            complete: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        if self.line.len() + bytes.len() > self.max {
            return Err(FramingError::LineTooLong(self.max));
        }
        self.line.extend_from_slice(bytes);
        Ok(())
    }

    fn complete(&mut self) {
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        self.complete = true;
    }

    /// Whether a partial line is pending.
    pub fn is_empty(&self) -> bool {
        self.line.is_empty() && !self.complete
    }

    /// Takes the accumulated line, leaving the builder empty.
    pub fn take(&mut self) -> String {
        self.complete = false;
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        line
    }

    pub fn clear(&mut self) {
        self.line.clear();
        self.complete = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_then_drain_cycles_state() {
        let mut buffer = Buffer::new(8);
        let mut src: &[u8] = b"abcdefghij";

        assert_eq!(buffer.fill_from(&mut src).unwrap(), Fill::Read(8));
        assert_eq!(buffer.state(), BufferState::Filled);
        assert_eq!(buffer.fill_from(&mut src).unwrap(), Fill::Full);

        let mut out = [0u8; 3];
        assert_eq!(buffer.drain_into(&mut out), 3);
        assert_eq!(buffer.state(), BufferState::Draining);

        let mut rest = [0u8; 8];
        assert_eq!(buffer.drain_into(&mut rest), 5);
        assert_eq!(buffer.state(), BufferState::Idle);
    }

    #[test]
    fn line_spans_several_fills() {
        let mut buffer = Buffer::new(4);
        let mut line = LineBuilder::new(64);
        let mut src: &[u8] = b"Host: h\r\nrest";

        let mut done = false;
        while !done {
            buffer.fill_from(&mut src).unwrap();
            done = buffer.fill_line(&mut line).unwrap();
        }
        assert_eq!(line.take(), "Host: h");
        assert!(line.is_empty());
    }

    #[test]
    fn overlong_line_is_a_framing_error() {
        let mut buffer = Buffer::new(16);
        let mut line = LineBuilder::new(4);
        let mut src: &[u8] = b"abcdefgh";
        buffer.fill_from(&mut src).unwrap();
        assert_eq!(buffer.fill_line(&mut line), Err(FramingError::LineTooLong(4)));
    }

    #[test]
    fn bare_lf_terminates_a_line() {
        let mut buffer = Buffer::new(16);
        let mut line = LineBuilder::new(16);
        let mut src: &[u8] = b"GET\nx";
        buffer.fill_from(&mut src).unwrap();
        assert!(buffer.fill_line(&mut line).unwrap());
        assert_eq!(line.take(), "GET");
        assert_eq!(buffer.chunk(), b"x");
    }
}
