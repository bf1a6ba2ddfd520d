use std::io::{self, Read};

use crate::io::buffer::Buffer;

/// Bounds reads to a declared `Content-Length`.
///
/// Once the count reaches zero the decoder reports end-of-stream without
/// touching the source again, so bytes of a following message stay where
/// they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedDecoder {
    remaining: u64,
}

impl SizedDecoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Reads at most the remaining count from `src`.
    ///
    /// A source ending before the count is exhausted is an
    /// `UnexpectedEof` error.
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R, out: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || out.is_empty() {
            return Ok(0);
        }
        let limit = out.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = src.read(&mut out[..limit])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entity truncated, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    /// Wraps a source in a `Read` that ends with the entity.
    pub fn reader<'a, R: Read + ?Sized>(&'a mut self, src: &'a mut R) -> SizedReader<'a, R> {
        SizedReader { decoder: self, src }
    }
}

/// `Read` adapter returned by [`SizedDecoder::reader`].
pub struct SizedReader<'a, R: Read + ?Sized> {
    decoder: &'a mut SizedDecoder,
    src: &'a mut R,
}

impl<R: Read + ?Sized> Read for SizedReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.decoder.read_from(&mut *self.src, out)
    }
}

/// Copies an entity of known length into an outbound buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedEncoder {
    remaining: u64,
}

impl SizedEncoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    /// Moves one segment from `src` into `out`, never beyond the declared
    /// length nor the buffer's spare capacity.
    ///
    /// Returns `true` once the declared length was copied. An entity
    /// shorter than declared is an `UnexpectedEof` error.
    pub fn encode<R: Read + ?Sized>(&mut self, src: &mut R, out: &mut Buffer) -> io::Result<bool> {
        if self.remaining == 0 {
            return Ok(true);
        }
        let limit = out
            .spare()
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        if limit == 0 {
            return Ok(false);
        }
        let mut segment = vec![0u8; limit];
        let n = src.read(&mut segment)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entity shorter than declared, {} bytes missing", self.remaining),
            ));
        }
        out.put(&segment[..n]);
        self.remaining -= n as u64;
        Ok(self.remaining == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most `step` bytes per read.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(out.len()).min(self.data.len());
            out[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn yields_exactly_the_declared_length() {
        let mut src = Trickle {
            data: b"0123456789NEXT",
            step: 3,
        };
        let mut decoder = SizedDecoder::new(10);
        let mut body = Vec::new();
        decoder.reader(&mut src).read_to_end(&mut body).unwrap();

        assert_eq!(body, b"0123456789");
        assert!(decoder.is_done());
        assert_eq!(src.data, b"NEXT");
    }

    #[test]
    fn premature_end_is_an_error() {
        let mut src: &[u8] = b"abc";
        let mut decoder = SizedDecoder::new(5);
        let mut body = Vec::new();
        let err = decoder.reader(&mut src).read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn encoder_stops_at_declared_length() {
        let mut src: &[u8] = b"abcdef";
        let mut out = Buffer::new(4);
        let mut encoder = SizedEncoder::new(5);

        assert!(!encoder.encode(&mut src, &mut out).unwrap());
        assert_eq!(out.chunk(), b"abcd");
        out.clear();
        assert!(encoder.encode(&mut src, &mut out).unwrap());
        assert_eq!(out.chunk(), b"e");
    }
}
