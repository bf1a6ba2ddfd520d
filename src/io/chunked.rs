//! `Transfer-Encoding: chunked` coding.

use std::io::{self, Read};

use crate::error::FramingError;
use crate::http::headers::Headers;
use crate::http::parser::{is_continuation, parse_header_line};
use crate::io::buffer::Buffer;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 8 * 1024;

/// Bytes reserved in a segment for the size line and the trailing CRLF.
const CHUNK_OVERHEAD: usize = 16 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Reading `<hex>[;ext]CRLF`
    Size,
    /// Reading chunk bytes, this many left
    Data(u64),
    /// Reading the CRLF closing a chunk
    DataEnd,
    /// Reading trailer fields after the last chunk
    Trailer,
    /// Terminator read; nothing more belongs to this entity
    End,
}

/// Resumable chunked decoder.
///
/// All progress lives in the decoder, so a `WouldBlock` from the source in
/// the middle of a size line or a chunk loses nothing. The decoder reads
/// byte-exactly up to the terminator and never past it.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
    trailers: Headers,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
            trailers: Headers::new(),
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::End
    }

    /// Trailer fields received after the last chunk.
    pub fn take_trailers(&mut self) -> Option<Headers> {
        if self.trailers.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.trailers))
        }
    }

    /// Decodes entity bytes from `src` into `out`; `Ok(0)` is the end of
    /// the entity. Framing problems surface as `InvalidData` errors wrapping
    /// a [`FramingError`].
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ChunkState::Size => {
                    let line = self.read_line(src)?;
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let limit = out.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = src.read(&mut out[..limit])?;
                    if n == 0 {
                        return Err(truncated());
                    }
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    return Ok(n);
                }
                ChunkState::DataEnd => {
                    let line = self.read_line(src)?;
                    if !line.is_empty() {
                        return Err(FramingError::MissingChunkDelimiter.into());
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let line = self.read_line(src)?;
                    if line.is_empty() {
                        self.state = ChunkState::End;
                    } else if is_continuation(&line) {
                        if !self.trailers.continue_last(&line) {
                            return Err(FramingError::InvalidHeader(line).into());
                        }
                    } else {
                        let (name, value) = parse_header_line(&line)?;
                        self.trailers.add(name, value);
                    }
                }
                ChunkState::End => return Ok(0),
            }
        }
    }

    /// Wraps a source in a `Read` that ends with the entity.
    pub fn reader<'a, R: Read + ?Sized>(&'a mut self, src: &'a mut R) -> ChunkedReader<'a, R> {
        ChunkedReader { decoder: self, src }
    }

    /// Reads one line byte by byte so nothing beyond its LF is consumed.
    fn read_line<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<String> {
        let mut byte = [0u8; 1];
        loop {
            match src.read(&mut byte) {
                Ok(0) => return Err(truncated()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            if byte[0] == b'\n' {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                return Ok(line);
            }
            if self.line.len() >= MAX_LINE {
                return Err(FramingError::LineTooLong(MAX_LINE).into());
            }
            self.line.push(byte[0]);
        }
    }
}

/// `Read` adapter returned by [`ChunkedDecoder::reader`].
pub struct ChunkedReader<'a, R: Read + ?Sized> {
    decoder: &'a mut ChunkedDecoder,
    src: &'a mut R,
}

impl<R: Read + ?Sized> Read for ChunkedReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.decoder.read_from(&mut *self.src, out)
    }
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "chunked entity truncated")
}

/// Parses `<hex-digits>[;extension]`, ignoring the extension.
pub fn parse_chunk_size(line: &str) -> Result<u64, FramingError> {
    let digits = line.split(';').next().unwrap_or("").trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FramingError::InvalidChunkSize(line.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| FramingError::InvalidChunkSize(line.to_string()))
}

/// Chunked encoder over an entity of unknown length.
#[derive(Debug, Default)]
pub struct ChunkedEncoder {
    finished: bool,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drains one segment of `src` into `out` as a chunk sized to the
    /// buffer's spare capacity; once `src` is exhausted writes the zero-size
    /// terminator instead.
    ///
    /// Returns `true` once the terminator was written.
    pub fn encode<R: Read + ?Sized>(&mut self, src: &mut R, out: &mut Buffer) -> io::Result<bool> {
        if self.finished {
            return Ok(true);
        }
        let room = out.spare().saturating_sub(CHUNK_OVERHEAD);
        if room == 0 {
            return Ok(false);
        }
        let mut segment = vec![0u8; room];
        let n = loop {
            match src.read(&mut segment) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        if n == 0 {
            out.put(b"0\r\n\r\n");
            self.finished = true;
            return Ok(true);
        }
        out.put(format!("{:X}\r\n", n).as_bytes());
        out.put(&segment[..n]);
        out.put(b"\r\n");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::framing_from_io;

    fn decode_all(wire: &[u8]) -> io::Result<(Vec<u8>, ChunkedDecoder, usize)> {
        let mut src = wire;
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        decoder.reader(&mut src).read_to_end(&mut body)?;
        let left = src.len();
        Ok((body, decoder, left))
    }

    #[test]
    fn decodes_chunks_and_ignores_extensions() {
        let (body, decoder, left) =
            decode_all(b"4;name=value\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"Wikipedia");
        assert!(decoder.is_done());
        assert_eq!(left, 0);
    }

    #[test]
    fn stops_at_the_first_zero_size_chunk() {
        let wire = b"4\r\nabcd\r\n0\r\n\r\n4\r\nefgh\r\n0\r\n\r\n";
        let (body, _, left) = decode_all(wire).unwrap();
        assert_eq!(body, b"abcd");
        assert_eq!(left, b"4\r\nefgh\r\n0\r\n\r\n".len());
    }

    #[test]
    fn non_hex_size_is_a_framing_error() {
        let err = decode_all(b"zz\r\nabcd\r\n").unwrap_err();
        assert!(matches!(
            framing_from_io(&err),
            Some(FramingError::InvalidChunkSize(_))
        ));
        let err = decode_all(b"\r\n").unwrap_err();
        assert!(framing_from_io(&err).is_some());
    }

    #[test]
    fn trailers_are_collected() {
        let (body, mut decoder, _) =
            decode_all(b"3\r\nabc\r\n0\r\nExpires: never\r\nX-Sum: 1\r\n\r\n").unwrap();
        assert_eq!(body, b"abc");
        let trailers = decoder.take_trailers().unwrap();
        assert_eq!(trailers.get("x-sum"), Some("1"));
        assert_eq!(trailers.len(), 2);
    }

    #[test]
    fn resumes_after_would_block() {
        struct Stuttering<'a> {
            parts: Vec<&'a [u8]>,
        }
        impl Read for Stuttering<'_> {
            fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
                if self.parts.first().is_some_and(|part| part.is_empty()) {
                    self.parts.remove(0);
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                match self.parts.first_mut() {
                    None => Ok(0),
                    Some(part) => {
                        let n = out.len().min(part.len());
                        out[..n].copy_from_slice(&part[..n]);
                        *part = &part[n..];
                        Ok(n)
                    }
                }
            }
        }

        let mut src = Stuttering {
            parts: vec![&b"0"[..], &b"A\r\n0123"[..], &b"456789\r"[..], &b"\n0\r\n\r\n"[..]],
        };
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        let mut out = [0u8; 64];
        loop {
            match decoder.read_from(&mut src, &mut out) {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&out[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(body, b"0123456789");
    }

    #[test]
    fn encoder_output_decodes_to_the_source() {
        let source: Vec<u8> = (0..100u8).collect();
        let mut src = &source[..];
        let mut encoder = ChunkedEncoder::new();
        let mut wire = Vec::new();
        loop {
            let mut out = Buffer::new(40);
            let done = encoder.encode(&mut src, &mut out).unwrap();
            wire.extend_from_slice(out.chunk());
            if done {
                break;
            }
        }
        assert!(wire.ends_with(b"0\r\n\r\n"));
        let (body, _, _) = decode_all(&wire).unwrap();
        assert_eq!(body, source);
    }
}
