//! Byte channels bridging a way's buffer with its socket and with the
//! application threads consuming incoming entities.

use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};
use mio::Waker;

use crate::http::headers::Headers;
use crate::io::buffer::{Buffer, Fill};

/// Reads through a way's buffer: buffered bytes are drained first, and the
/// buffer is refilled from the source only once empty.
///
/// Entity decoders read through this channel so that bytes they do not
/// consume (the next pipelined message) stay in the buffer.
pub struct BufferedChannel<'a, S: Read + ?Sized> {
    buffer: &'a mut Buffer,
    source: &'a mut S,
}

impl<'a, S: Read + ?Sized> BufferedChannel<'a, S> {
    pub fn new(buffer: &'a mut Buffer, source: &'a mut S) -> Self {
        Self { buffer, source }
    }
}

impl<S: Read + ?Sized> Read for BufferedChannel<'_, S> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() {
            match self.buffer.fill_from(&mut *self.source)? {
                Fill::Eof => return Ok(0),
                Fill::Read(_) | Fill::Full => {}
            }
        }
        Ok(self.buffer.drain_into(out))
    }
}

#[derive(Debug)]
struct PipeState {
    data: BytesMut,
    capacity: usize,
    finished: bool,
    error: Option<String>,
    released: bool,
    trailers: Option<Headers>,
    /// Controller consuming the reader without blocking, woken on input
    reader_waker: Option<Arc<Waker>>,
}

impl PipeState {
    fn has_input(&self) -> bool {
        !self.data.is_empty() || self.finished || self.error.is_some()
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
    size: Option<u64>,
    /// Controller feeding the pipe, woken when a full pipe drains
    writer_waker: Option<Arc<Waker>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn wake(waker: Option<&Arc<Waker>>) {
    if let Some(waker) = waker {
        if let Err(e) = waker.wake() {
            tracing::debug!(error = %e, "Unable to wake the controller");
        }
    }
}

/// Creates the two ends of an entity pipe.
///
/// The producer keeps the [`EntityPipe`]: an inbound way offering decoded
/// bytes as the socket delivers them, or a worker thread pulling an
/// application reader. The consumer reads the [`EntityReader`], either
/// blocking (application threads) or with [`EntityReader::try_read`]
/// (an outbound way on a reactor thread). The pipe holds at most
/// `capacity` bytes; `waker` is woken when a full pipe is drained.
pub fn entity_pipe(
    capacity: usize,
    size: Option<u64>,
    waker: Option<Arc<Waker>>,
) -> (EntityPipe, EntityReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState {
            data: BytesMut::with_capacity(capacity),
            capacity,
            finished: false,
            error: None,
            released: false,
            trailers: None,
            reader_waker: None,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
        size,
        writer_waker: waker,
    });
    (
        EntityPipe {
            shared: Arc::clone(&shared),
        },
        EntityReader { shared },
    )
}

/// Producer end of an entity pipe.
#[derive(Debug)]
pub struct EntityPipe {
    shared: Arc<Shared>,
}

impl EntityPipe {
    /// Bytes that can be offered without exceeding capacity. A released
    /// pipe accepts anything (and discards it).
    pub fn free(&self) -> usize {
        let state = self.shared.lock();
        if state.released {
            usize::MAX
        } else {
            state.capacity.saturating_sub(state.data.len())
        }
    }

    pub fn is_released(&self) -> bool {
        self.shared.lock().released
    }

    /// Appends as much of `bytes` as fits; returns how much was taken.
    pub fn offer(&self, bytes: &[u8]) -> usize {
        let mut state = self.shared.lock();
        if state.released {
            return bytes.len();
        }
        let n = bytes.len().min(state.capacity.saturating_sub(state.data.len()));
        state.data.extend_from_slice(&bytes[..n]);
        let waker = state.reader_waker.clone();
        drop(state);
        if n > 0 {
            self.shared.readable.notify_all();
            wake(waker.as_ref());
        }
        n
    }

    /// Appends all of `bytes`, blocking while the pipe is full. Only for
    /// worker threads. Returns `false` once the reader is gone.
    pub fn write_all(&self, mut bytes: &[u8]) -> bool {
        let mut state = self.shared.lock();
        while !bytes.is_empty() {
            if state.released {
                return false;
            }
            let n = bytes.len().min(state.capacity.saturating_sub(state.data.len()));
            if n == 0 {
                state = self
                    .shared
                    .writable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            state.data.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            let waker = state.reader_waker.clone();
            drop(state);
            self.shared.readable.notify_all();
            wake(waker.as_ref());
            state = self.shared.lock();
        }
        !state.released
    }

    /// Marks the end of the entity.
    pub fn finish(&self, trailers: Option<Headers>) {
        let mut state = self.shared.lock();
        state.finished = true;
        state.trailers = trailers;
        let waker = state.reader_waker.clone();
        drop(state);
        self.shared.readable.notify_all();
        wake(waker.as_ref());
    }

    /// Aborts the entity; the reader sees the error once buffered bytes
    /// are consumed.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.shared.lock();
        if !state.finished {
            state.error = Some(reason.into());
        }
        let waker = state.reader_waker.clone();
        drop(state);
        self.shared.readable.notify_all();
        wake(waker.as_ref());
    }
}

/// Consumer end of an entity pipe.
///
/// Reads block until bytes arrive, the entity ends, or the producer
/// fails. Dropping the reader releases the entity: the producer then
/// discards the remaining bytes instead of stalling.
#[derive(Debug)]
pub struct EntityReader {
    shared: Arc<Shared>,
}

impl EntityReader {
    /// Declared length of the entity, if the sender announced one.
    pub fn size(&self) -> Option<u64> {
        self.shared.size
    }

    /// Trailer fields of a chunked entity, available once it was fully
    /// received.
    pub fn trailers(&self) -> Option<Headers> {
        self.shared.lock().trailers.clone()
    }

    pub fn is_finished(&self) -> bool {
        let state = self.shared.lock();
        state.finished && state.data.is_empty()
    }

    /// Whether a [`try_read`](Self::try_read) would not block.
    pub fn has_input(&self) -> bool {
        self.shared.lock().has_input()
    }

    /// Wakes `waker` whenever input arrives, for readers polled from a
    /// reactor thread.
    pub fn watch(&self, waker: Arc<Waker>) {
        self.shared.lock().reader_waker = Some(waker);
    }

    /// Reads without blocking: `WouldBlock` while the pipe is empty and
    /// the entity not finished.
    pub fn try_read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let state = self.shared.lock();
        if out.is_empty() || state.has_input() {
            return self.consume(state, out);
        }
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn consume(&self, mut state: MutexGuard<'_, PipeState>, out: &mut [u8]) -> io::Result<usize> {
        if state.data.is_empty() {
            if let Some(error) = &state.error {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, error.clone()));
            }
            return Ok(0);
        }
        let was_full = state.data.len() >= state.capacity;
        let n = out.len().min(state.data.len());
        out[..n].copy_from_slice(&state.data[..n]);
        state.data.advance(n);
        drop(state);
        self.shared.writable.notify_all();
        if was_full {
            wake(self.shared.writer_waker.as_ref());
        }
        Ok(n)
    }
}

impl Read for EntityReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.lock();
        while !state.has_input() {
            state = self
                .shared
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.consume(state, out)
    }
}

impl Drop for EntityReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let pending = !state.finished && state.error.is_none();
        state.released = true;
        state.data.clear();
        drop(state);
        self.shared.writable.notify_all();
        if pending {
            wake(self.shared.writer_waker.as_ref());
        }
    }
}
