use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use mio::Waker;

use crate::error::ConnectorError;
use crate::http::entity::Entity;
use crate::http::writer::write_headers;
use crate::io::buffer::Buffer;
use crate::io::channel::EntityReader;
use crate::io::chunked::ChunkedEncoder;
use crate::io::sized::SizedEncoder;
use crate::io::transport::Transport;
use crate::reactor::registration::Ops;
use crate::way::{Framing, IoState, MessageState, OutboundMessage, Role, compose_headers, plan_body};

/// What the connection lets the outbound way do on this call.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboundContext<'a> {
    /// Whether the connection is meant to outlive the messages in flight
    pub persistent: bool,
    /// Whether the next queued message may be started
    pub may_start: bool,
    /// Woken when a piped entity has bytes again
    pub waker: Option<&'a Arc<Waker>>,
    /// Log every header section written
    pub trace: bool,
}

/// Outcome of one [`OutboundWay::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStep {
    /// A whole message left the buffer.
    Sent {
        id: u64,
        informational: bool,
        /// The connection must close now
        close: bool,
    },
    /// The socket accepts no more bytes for now.
    Blocked,
    /// Nothing to write, or not allowed to start the next message.
    Stalled,
}

enum BodyEncoder {
    Sized(SizedEncoder),
    Chunked(ChunkedEncoder),
    /// Copied as is, delimited by closing the connection
    Raw,
}

/// Where entity bytes come from. Neither variant ever blocks: a piped
/// entity answers `WouldBlock` until its producer offers more.
enum BodySource {
    Bytes(Bytes),
    Pipe(EntityReader),
}

impl BodySource {
    fn has_input(&self) -> bool {
        match self {
            BodySource::Bytes(_) => true,
            BodySource::Pipe(reader) => reader.has_input(),
        }
    }
}

impl Read for BodySource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            BodySource::Bytes(bytes) => {
                let n = out.len().min(bytes.len());
                out[..n].copy_from_slice(&bytes[..n]);
                bytes.advance(n);
                Ok(n)
            }
            BodySource::Pipe(reader) => reader.try_read(out),
        }
    }
}

/// The message whose header section was serialized.
struct Current {
    id: u64,
    informational: bool,
    close: bool,
    source: Option<BodySource>,
    encoder: Option<BodyEncoder>,
}

enum Flushed {
    Done,
    Blocked,
}

enum Filled {
    /// The whole entity is in the buffer
    Done,
    /// No room left in the buffer
    Full,
    /// The entity source has nothing for now
    Starved,
}

/// Writes messages onto a connection, strictly in queue order.
pub struct OutboundWay {
    io_state: IoState,
    message_state: MessageState,
    buffer: Buffer,
    queue: VecDeque<OutboundMessage>,
    /// Message between its start line and its header section
    pending: Option<OutboundMessage>,
    current: Option<Current>,
    /// The socket reported `WouldBlock` since the last readiness event
    blocked: bool,
    /// The entity source reported `WouldBlock` since it was last polled
    starved: bool,
}

impl OutboundWay {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            io_state: IoState::Idle,
            message_state: MessageState::Idle,
            buffer: Buffer::new(buffer_size),
            queue: VecDeque::new(),
            pending: None,
            current: None,
            blocked: false,
            starved: false,
        }
    }

    pub fn io_state(&self) -> IoState {
        self.io_state
    }

    pub fn message_state(&self) -> MessageState {
        self.message_state
    }

    pub fn enqueue(&mut self, message: OutboundMessage) {
        self.queue.push_back(message);
    }

    /// Next message to be started.
    pub fn next(&self) -> Option<&OutboundMessage> {
        self.queue.front()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Removes every message not started yet.
    pub fn take_queued(&mut self) -> Vec<OutboundMessage> {
        self.queue.drain(..).collect()
    }

    /// A message is partially written.
    pub fn is_busy(&self) -> bool {
        self.message_state != MessageState::Idle || !self.buffer.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        !self.is_busy() && self.queue.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.io_state == IoState::Ready
    }

    /// Records a readiness event: the socket accepts bytes again.
    pub fn on_writable(&mut self) {
        self.blocked = false;
    }

    /// Re-derives the io-state from what the way could do next.
    pub fn refresh(&mut self, may_start: bool) {
        if matches!(self.io_state, IoState::Canceling | IoState::Cancelled) {
            return;
        }
        let waiting_on_source = self.starved
            && self
                .current
                .as_ref()
                .and_then(|c| c.source.as_ref())
                .is_some_and(|source| !source.has_input());
        let has_work = if self.is_busy() {
            !waiting_on_source
        } else {
            may_start && !self.queue.is_empty()
        };
        self.io_state = if !has_work {
            IoState::Idle
        } else if self.blocked {
            IoState::Interest
        } else {
            IoState::Ready
        };
    }

    /// Readiness this way wants from the selector.
    pub fn interest(&self) -> Ops {
        if self.io_state == IoState::Interest {
            Ops::WRITE
        } else {
            Ops::NONE
        }
    }

    /// Writes until the socket blocks, a message was fully written, or
    /// there is nothing left to write.
    pub fn process(
        &mut self,
        transport: &mut dyn Transport,
        role: &dyn Role,
        cx: &OutboundContext<'_>,
    ) -> Result<OutboundStep, ConnectorError> {
        if matches!(self.io_state, IoState::Canceling | IoState::Cancelled) {
            return Ok(OutboundStep::Stalled);
        }
        self.io_state = IoState::Processing;
        let result = self.advance(transport, role, cx);
        self.io_state = match &result {
            Ok(OutboundStep::Blocked) => IoState::Interest,
            Ok(OutboundStep::Stalled) => IoState::Idle,
            Ok(OutboundStep::Sent { .. }) => IoState::Processing,
            Err(_) => IoState::Cancelled,
        };
        result
    }

    fn advance(
        &mut self,
        transport: &mut dyn Transport,
        role: &dyn Role,
        cx: &OutboundContext<'_>,
    ) -> Result<OutboundStep, ConnectorError> {
        loop {
            match self.message_state {
                MessageState::Idle => {
                    if !cx.may_start {
                        return Ok(OutboundStep::Stalled);
                    }
                    let Some(message) = self.queue.pop_front() else {
                        return Ok(OutboundStep::Stalled);
                    };
                    tracing::trace!(id = message.id, "Writing message");
                    self.pending = Some(message);
                    self.message_state = MessageState::Start;
                }
                MessageState::Start => {
                    if let Some(message) = &self.pending {
                        let mut out = BytesMut::new();
                        role.write_start_line(&message.head, &mut out);
                        self.buffer.put_bytes(out);
                    }
                    self.message_state = MessageState::Headers;
                }
                MessageState::Headers => {
                    let Some(message) = self.pending.take() else {
                        self.message_state = MessageState::Idle;
                        continue;
                    };
                    self.start_entity(message, role, cx)?;
                }
                MessageState::Body => match self.fill_entity()? {
                    Filled::Done => self.message_state = MessageState::End,
                    Filled::Full => {
                        if let Flushed::Blocked = self.flush(transport)? {
                            return Ok(OutboundStep::Blocked);
                        }
                    }
                    // What is buffered goes out while the source refills
                    Filled::Starved => {
                        if let Flushed::Blocked = self.flush(transport)? {
                            return Ok(OutboundStep::Blocked);
                        }
                        self.starved = true;
                        return Ok(OutboundStep::Stalled);
                    }
                },
                MessageState::End => {
                    if let Flushed::Blocked = self.flush(transport)? {
                        return Ok(OutboundStep::Blocked);
                    }
                    self.message_state = MessageState::Idle;
                    if let Some(current) = self.current.take() {
                        return Ok(OutboundStep::Sent {
                            id: current.id,
                            informational: current.informational,
                            close: current.close,
                        });
                    }
                }
            }
        }
    }

    /// Serializes the header section and prepares the entity encoder.
    fn start_entity(
        &mut self,
        message: OutboundMessage,
        role: &dyn Role,
        cx: &OutboundContext<'_>,
    ) -> Result<(), ConnectorError> {
        let plan = plan_body(role.side(), &message);
        let headers = compose_headers(role, &message, cx.persistent, &plan);
        let mut out = BytesMut::new();
        write_headers(&headers, &mut out);
        if cx.trace {
            let mut head = BytesMut::from(self.buffer.chunk());
            head.extend_from_slice(&out);
            let text = String::from_utf8_lossy(&head);
            tracing::info!(id = message.id, "Outgoing message\n{}", text.trim_end());
        }
        self.buffer.put_bytes(out);

        let encoder = match plan.framing {
            _ if !plan.send => None,
            Framing::None => None,
            Framing::Sized(n) => Some(BodyEncoder::Sized(SizedEncoder::new(n))),
            Framing::Chunked => Some(BodyEncoder::Chunked(ChunkedEncoder::new())),
            Framing::UntilEof => Some(BodyEncoder::Raw),
        };
        let informational = message.is_informational();
        let close = message.close || !cx.persistent || plan.framing == Framing::UntilEof;
        let source = match encoder {
            Some(_) => Some(body_source(message.entity, cx.waker)?),
            None => None,
        };

        self.message_state = if encoder.is_some() {
            MessageState::Body
        } else {
            MessageState::End
        };
        self.current = Some(Current {
            id: message.id,
            informational,
            close,
            source,
            encoder,
        });
        Ok(())
    }

    /// Pulls entity bytes into the buffer while it has room and the source
    /// has some.
    fn fill_entity(&mut self) -> Result<Filled, ConnectorError> {
        self.starved = false;
        let Some(current) = self.current.as_mut() else {
            return Ok(Filled::Done);
        };
        let (Some(source), Some(encoder)) = (current.source.as_mut(), current.encoder.as_mut())
        else {
            return Ok(Filled::Done);
        };
        loop {
            let before = self.buffer.len();
            let encoded = match encoder {
                BodyEncoder::Sized(e) => e.encode(source, &mut self.buffer),
                BodyEncoder::Chunked(e) => e.encode(source, &mut self.buffer),
                BodyEncoder::Raw => copy_raw(source, &mut self.buffer),
            };
            match encoded {
                Ok(true) => return Ok(Filled::Done),
                Ok(false) if self.buffer.len() == before => return Ok(Filled::Full),
                Ok(false) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Filled::Starved),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flush(&mut self, transport: &mut dyn Transport) -> Result<Flushed, ConnectorError> {
        match self.buffer.flush_to(&mut *transport) {
            Ok(_) => Ok(Flushed::Done),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.blocked = true;
                Ok(Flushed::Blocked)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drops the message in flight and stops writing for good. Queued
    /// messages stay until [`take_queued`](Self::take_queued).
    pub fn cancel(&mut self) {
        self.io_state = IoState::Canceling;
        self.pending = None;
        self.current = None;
        self.buffer.clear();
        self.io_state = IoState::Cancelled;
    }

    /// Back to a pristine way, keeping the buffer allocation.
    pub fn clear(&mut self) {
        self.cancel();
        self.queue.clear();
        self.blocked = false;
        self.starved = false;
        self.message_state = MessageState::Idle;
        self.io_state = IoState::Idle;
    }
}

impl std::fmt::Debug for OutboundWay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundWay")
            .field("io_state", &self.io_state)
            .field("message_state", &self.message_state)
            .field("buffered", &self.buffer.len())
            .field("queued", &self.queue.len())
            .field("blocked", &self.blocked)
            .field("starved", &self.starved)
            .finish()
    }
}

/// Turns an entity into a source the reactor can poll without blocking.
///
/// Application readers must have been moved onto a worker pool (see
/// `helper::detach_stream`) before the message reached the way.
fn body_source(entity: Entity, waker: Option<&Arc<Waker>>) -> Result<BodySource, ConnectorError> {
    match entity {
        Entity::Empty => Ok(BodySource::Bytes(Bytes::new())),
        Entity::Bytes(bytes) => Ok(BodySource::Bytes(bytes)),
        Entity::Inbound(reader) => {
            if let Some(waker) = waker {
                reader.watch(Arc::clone(waker));
            }
            Ok(BodySource::Pipe(reader))
        }
        Entity::Stream { .. } => Err(ConnectorError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "streamed entity reached the reactor without a pipe",
        ))),
    }
}

/// Copies one segment of a close-delimited entity.
fn copy_raw<R: Read + ?Sized>(src: &mut R, out: &mut Buffer) -> io::Result<bool> {
    let spare = out.spare();
    if spare == 0 {
        return Ok(false);
    }
    let mut segment = vec![0u8; spare];
    let n = src.read(&mut segment)?;
    if n == 0 {
        return Ok(true);
    }
    out.put(&segment[..n]);
    Ok(false)
}
