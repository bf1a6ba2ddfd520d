use std::io::{self, Read};
use std::sync::Arc;

use bytes::BytesMut;
use mio::Waker;

use crate::error::{ConnectorError, FramingError, framing_from_io};
use crate::http::message::MessageHead;
use crate::http::parser::{is_continuation, parse_header_line};
use crate::http::request::Method;
use crate::http::writer::{write_headers, write_start_line};
use crate::io::buffer::{Buffer, Fill, LineBuilder};
use crate::io::channel::{BufferedChannel, EntityPipe, EntityReader, entity_pipe};
use crate::io::chunked::ChunkedDecoder;
use crate::io::sized::SizedDecoder;
use crate::io::transport::Transport;
use crate::reactor::registration::Ops;
use crate::way::{Framing, IoState, MessageState, Role};

/// Largest slice of entity moved from the socket to the pipe at once.
const ENTITY_CHUNK: usize = 8 * 1024;

/// What the connection lets the inbound way do on this call.
#[derive(Debug, Default)]
pub struct InboundContext<'a> {
    /// Whether a new message may be started
    pub accept: bool,
    /// Method of the request the next response answers (client side)
    pub request_method: Option<&'a Method>,
    /// Woken when the application drains a full entity pipe
    pub waker: Option<&'a Arc<Waker>>,
    /// Log every header section read
    pub trace: bool,
}

/// Outcome of one [`InboundWay::process`] call.
#[derive(Debug)]
pub enum InboundStep {
    /// A header section was read; the entity, if any, streams through the
    /// reader while the way keeps reading.
    Received {
        head: MessageHead,
        entity: Option<EntityReader>,
    },
    /// The current message, entity included, was fully read.
    Completed,
    /// The socket has nothing more for now.
    Blocked,
    /// Unable to progress until the application or the connection acts.
    Stalled,
    /// The peer closed the connection between two messages.
    Closed,
}

#[derive(Debug)]
enum EntityDecoder {
    Sized(SizedDecoder),
    Chunked(ChunkedDecoder),
    UntilEof,
}

enum Input {
    Ready,
    Blocked,
    Eof,
}

enum LineRead {
    Line(String),
    Blocked,
    Eof,
}

enum EntityProgress {
    Done,
    Blocked,
    Stalled,
}

/// Reads messages off a connection.
///
/// All parsing state lives in the way so that a `WouldBlock` at any byte
/// boundary loses nothing: the call returns and the next readiness event
/// resumes where it stopped.
#[derive(Debug)]
pub struct InboundWay {
    io_state: IoState,
    message_state: MessageState,
    buffer: Buffer,
    line: LineBuilder,
    head: Option<MessageHead>,
    decoder: Option<EntityDecoder>,
    pipe: Option<EntityPipe>,
    pipe_capacity: usize,
    /// The socket reported `WouldBlock` since the last readiness event
    drained: bool,
    #[cfg(test)]
    history: Vec<MessageState>,
}

impl InboundWay {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            io_state: IoState::Idle,
            message_state: MessageState::Idle,
            buffer: Buffer::new(buffer_size),
            line: LineBuilder::new(buffer_size),
            head: None,
            decoder: None,
            pipe: None,
            pipe_capacity: buffer_size,
            drained: false,
            #[cfg(test)]
            history: Vec::new(),
        }
    }

    pub fn io_state(&self) -> IoState {
        self.io_state
    }

    pub fn message_state(&self) -> MessageState {
        self.message_state
    }

    /// No message is partially read.
    pub fn is_idle(&self) -> bool {
        self.message_state == MessageState::Idle && self.line.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.io_state == IoState::Ready
    }

    /// Records a readiness event: the socket may have bytes again.
    pub fn on_readable(&mut self) {
        self.drained = false;
    }

    /// Re-derives the io-state from what the way could do next.
    pub fn refresh(&mut self, accept: bool) {
        if matches!(self.io_state, IoState::Canceling | IoState::Cancelled) {
            return;
        }
        let can_progress = match self.message_state {
            MessageState::Idle => accept,
            MessageState::Body => self.pipe.as_ref().is_none_or(|pipe| pipe.free() > 0),
            _ => true,
        };
        self.io_state = if !can_progress {
            IoState::Idle
        } else if self.drained {
            IoState::Interest
        } else {
            IoState::Ready
        };
    }

    /// Readiness this way wants from the selector.
    pub fn interest(&self) -> Ops {
        match self.io_state {
            IoState::Interest | IoState::Ready => Ops::READ,
            _ => Ops::NONE,
        }
    }

    /// Reads until something noteworthy happens.
    ///
    /// Each call stops at the first header section or message end so the
    /// connection can match it against its exchanges before reading on.
    pub fn process(
        &mut self,
        transport: &mut dyn Transport,
        role: &dyn Role,
        cx: &InboundContext<'_>,
    ) -> Result<InboundStep, ConnectorError> {
        if matches!(self.io_state, IoState::Canceling | IoState::Cancelled) {
            return Ok(InboundStep::Stalled);
        }
        self.io_state = IoState::Processing;
        let result = self.advance(transport, role, cx);
        self.io_state = match &result {
            Ok(InboundStep::Blocked) => IoState::Interest,
            Ok(InboundStep::Stalled) => IoState::Idle,
            Ok(InboundStep::Received { .. } | InboundStep::Completed) => IoState::Processing,
            Ok(InboundStep::Closed) | Err(_) => IoState::Cancelled,
        };
        if let Err(e) = &result {
            if let Some(pipe) = self.pipe.take() {
                pipe.fail(e.to_string());
            }
        }
        result
    }

    fn advance(
        &mut self,
        transport: &mut dyn Transport,
        role: &dyn Role,
        cx: &InboundContext<'_>,
    ) -> Result<InboundStep, ConnectorError> {
        loop {
            match self.message_state {
                MessageState::Idle => {
                    if !cx.accept {
                        return Ok(InboundStep::Stalled);
                    }
                    if self.buffer.is_empty() {
                        match self.fill(transport)? {
                            Input::Ready => {}
                            Input::Blocked => return Ok(InboundStep::Blocked),
                            Input::Eof => return Ok(InboundStep::Closed),
                        }
                    }
                    self.set_state(MessageState::Start);
                }
                MessageState::Start => match self.read_line(transport)? {
                    // Stray CRLF between messages
                    LineRead::Line(line) if line.is_empty() => {}
                    LineRead::Line(line) => {
                        let start = role.read_start_line(&line)?;
                        self.head = Some(MessageHead::new(start));
                        self.set_state(MessageState::Headers);
                    }
                    LineRead::Blocked => return Ok(InboundStep::Blocked),
                    LineRead::Eof if self.line.is_empty() => return Ok(InboundStep::Closed),
                    LineRead::Eof => return Err(truncated("start line").into()),
                },
                MessageState::Headers => match self.read_line(transport)? {
                    LineRead::Line(line) if line.is_empty() => return self.on_received(role, cx),
                    LineRead::Line(line) => self.add_header_line(&line)?,
                    LineRead::Blocked => return Ok(InboundStep::Blocked),
                    LineRead::Eof => return Err(truncated("header section").into()),
                },
                MessageState::Body => match self.read_entity(transport)? {
                    EntityProgress::Done => self.set_state(MessageState::End),
                    EntityProgress::Blocked => return Ok(InboundStep::Blocked),
                    EntityProgress::Stalled => return Ok(InboundStep::Stalled),
                },
                MessageState::End => {
                    self.head = None;
                    self.decoder = None;
                    self.pipe = None;
                    self.set_state(MessageState::Idle);
                    return Ok(InboundStep::Completed);
                }
            }
        }
    }

    /// Header section complete: decides how the entity is framed.
    fn on_received(
        &mut self,
        role: &dyn Role,
        cx: &InboundContext<'_>,
    ) -> Result<InboundStep, ConnectorError> {
        let head = self.head.take().ok_or(FramingError::UnexpectedMessage)?;
        let framing = role.inbound_framing(&head, cx.request_method)?;
        tracing::trace!(?framing, "Header section received");
        if cx.trace {
            let mut text = BytesMut::new();
            write_start_line(&head.start, &mut text);
            write_headers(&head.headers, &mut text);
            tracing::info!("Incoming message\n{}", String::from_utf8_lossy(&text).trim_end());
        }

        let (decoder, size) = match framing {
            Framing::None => (None, Some(0)),
            Framing::Sized(n) => (Some(EntityDecoder::Sized(SizedDecoder::new(n))), Some(n)),
            Framing::Chunked => (Some(EntityDecoder::Chunked(ChunkedDecoder::new())), None),
            Framing::UntilEof => (Some(EntityDecoder::UntilEof), None),
        };
        let entity = match decoder {
            None => {
                self.set_state(MessageState::End);
                None
            }
            Some(decoder) => {
                let (pipe, reader) = entity_pipe(self.pipe_capacity, size, cx.waker.cloned());
                self.decoder = Some(decoder);
                self.pipe = Some(pipe);
                self.set_state(MessageState::Body);
                Some(reader)
            }
        };
        Ok(InboundStep::Received { head, entity })
    }

    fn add_header_line(&mut self, line: &str) -> Result<(), FramingError> {
        let head = self
            .head
            .as_mut()
            .ok_or_else(|| FramingError::InvalidHeader(line.to_string()))?;
        if is_continuation(line) {
            if !head.headers.continue_last(line) {
                return Err(FramingError::InvalidHeader(line.to_string()));
            }
        } else {
            let (name, value) = parse_header_line(line)?;
            head.headers.add(name, value);
        }
        Ok(())
    }

    fn fill(&mut self, transport: &mut dyn Transport) -> io::Result<Input> {
        loop {
            match self.buffer.fill_from(&mut *transport) {
                Ok(Fill::Read(_) | Fill::Full) => return Ok(Input::Ready),
                Ok(Fill::Eof) => return Ok(Input::Eof),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.drained = true;
                    return Ok(Input::Blocked);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn read_line(&mut self, transport: &mut dyn Transport) -> Result<LineRead, ConnectorError> {
        loop {
            if self.buffer.fill_line(&mut self.line)? {
                return Ok(LineRead::Line(self.line.take()));
            }
            match self.fill(transport)? {
                Input::Ready => {}
                Input::Blocked => return Ok(LineRead::Blocked),
                Input::Eof => return Ok(LineRead::Eof),
            }
        }
    }

    /// Moves entity bytes from the socket into the pipe until the entity
    /// ends, the socket runs dry or the pipe is full.
    fn read_entity(&mut self, transport: &mut dyn Transport) -> Result<EntityProgress, ConnectorError> {
        let (Some(decoder), Some(pipe)) = (self.decoder.as_mut(), self.pipe.as_ref()) else {
            return Ok(EntityProgress::Done);
        };
        let mut chunk = [0u8; ENTITY_CHUNK];
        loop {
            let free = pipe.free();
            if free == 0 {
                return Ok(EntityProgress::Stalled);
            }
            let out = &mut chunk[..free.min(ENTITY_CHUNK)];
            let mut channel = BufferedChannel::new(&mut self.buffer, &mut *transport);
            let result = match decoder {
                EntityDecoder::Sized(d) => d.read_from(&mut channel, out),
                EntityDecoder::Chunked(d) => d.read_from(&mut channel, out),
                EntityDecoder::UntilEof => channel.read(out),
            };
            match result {
                Ok(0) => {
                    let trailers = match decoder {
                        EntityDecoder::Chunked(d) => d.take_trailers(),
                        _ => None,
                    };
                    pipe.finish(trailers);
                    return Ok(EntityProgress::Done);
                }
                Ok(n) => {
                    pipe.offer(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.drained = true;
                    return Ok(EntityProgress::Blocked);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(match framing_from_io(&e) {
                        Some(framing) => framing.into(),
                        None => e.into(),
                    });
                }
            }
        }
    }

    /// Fails the entity in flight and stops reading for good.
    pub fn cancel(&mut self, reason: &str) {
        self.io_state = IoState::Canceling;
        if let Some(pipe) = self.pipe.take() {
            pipe.fail(reason);
        }
        self.head = None;
        self.decoder = None;
        self.io_state = IoState::Cancelled;
    }

    /// Back to a pristine way, keeping the buffer allocation.
    pub fn clear(&mut self) {
        self.cancel("connection recycled");
        self.buffer.clear();
        self.line.clear();
        self.drained = false;
        self.message_state = MessageState::Idle;
        self.io_state = IoState::Idle;
        #[cfg(test)]
        self.history.clear();
    }

    fn set_state(&mut self, state: MessageState) {
        self.message_state = state;
        #[cfg(test)]
        self.history.push(state);
    }
}

fn truncated(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("connection closed in the middle of the {what}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::StartLine;
    use crate::http::response::StatusCode;
    use crate::io::transport::mock::MockTransport;
    use crate::way::{ClientRole, ServerRole};

    fn accept() -> InboundContext<'static> {
        InboundContext {
            accept: true,
            ..InboundContext::default()
        }
    }

    #[test]
    fn simple_get_has_no_body_state() {
        let mut transport = MockTransport::with_input(&[b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n"]);
        let mut way = InboundWay::new(1024);
        let role = ServerRole::default();

        let (head, entity) = match way.process(&mut transport, &role, &accept()).unwrap() {
            InboundStep::Received { head, entity } => (head, entity),
            other => panic!("expected a header section, got {other:?}"),
        };
        assert_eq!(head.start.method(), Some(&Method::GET));
        assert_eq!(head.headers.get("host"), Some("h"));
        assert!(entity.is_none());

        assert!(matches!(
            way.process(&mut transport, &role, &accept()).unwrap(),
            InboundStep::Completed
        ));
        assert!(matches!(
            way.process(&mut transport, &role, &accept()).unwrap(),
            InboundStep::Blocked
        ));
        assert_eq!(way.message_state(), MessageState::Idle);
        assert_eq!(
            way.history,
            vec![
                MessageState::Start,
                MessageState::Headers,
                MessageState::End,
                MessageState::Idle
            ]
        );
        assert!(!way.history.contains(&MessageState::Body));
    }

    #[test]
    fn identity_coded_request_is_framed_by_its_length() {
        let mut transport = MockTransport::with_input(&[
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: identity\r\nContent-Length: 5\r\n\r\nhello",
            b"GET /next HTTP/1.1\r\n\r\n",
        ]);
        let mut way = InboundWay::new(1024);
        let role = ServerRole::default();

        let InboundStep::Received { entity, .. } =
            way.process(&mut transport, &role, &accept()).unwrap()
        else {
            panic!("expected a header section");
        };
        let mut reader = entity.unwrap();
        assert_eq!(reader.size(), Some(5));
        assert!(matches!(
            way.process(&mut transport, &role, &accept()).unwrap(),
            InboundStep::Completed
        ));
        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello");

        let InboundStep::Received { head, .. } =
            way.process(&mut transport, &role, &accept()).unwrap()
        else {
            panic!("the entity leaked into the next request");
        };
        assert!(matches!(head.start, StartLine::Request { ref target, .. } if target == "/next"));
    }

    #[test]
    fn sized_entity_resumes_after_would_block() {
        let mut transport = MockTransport::with_input(&[
            b"POST /up HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123",
            b"",
        ]);
        let mut way = InboundWay::new(1024);
        let role = ServerRole::default();

        let InboundStep::Received { entity, .. } =
            way.process(&mut transport, &role, &accept()).unwrap()
        else {
            panic!("expected a header section");
        };
        let mut reader = entity.unwrap();
        assert_eq!(reader.size(), Some(10));
        assert!(matches!(
            way.process(&mut transport, &role, &accept()).unwrap(),
            InboundStep::Blocked
        ));
        assert_eq!(way.io_state(), IoState::Interest);

        transport.push(b"456789GET / HTTP/1.1\r\n\r\n");
        way.on_readable();
        assert!(matches!(
            way.process(&mut transport, &role, &accept()).unwrap(),
            InboundStep::Completed
        ));

        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"0123456789");

        // The pipelined request was left in the buffer
        assert!(matches!(
            way.process(&mut transport, &role, &accept()).unwrap(),
            InboundStep::Received { .. }
        ));
    }

    #[test]
    fn full_pipe_stalls_until_drained() {
        let body = [b'x'; 80];
        let mut wire = b"POST / HTTP/1.1\r\nContent-Length: 80\r\n\r\n".to_vec();
        wire.extend_from_slice(&body);
        let mut transport = MockTransport::with_input(&[&wire]);
        let mut way = InboundWay::new(40);
        let role = ServerRole::default();

        let InboundStep::Received { entity, .. } =
            way.process(&mut transport, &role, &accept()).unwrap()
        else {
            panic!("expected a header section");
        };
        let mut reader = entity.unwrap();
        assert!(matches!(
            way.process(&mut transport, &role, &accept()).unwrap(),
            InboundStep::Stalled
        ));
        way.refresh(true);
        assert_eq!(way.io_state(), IoState::Idle);
        assert_eq!(way.interest(), Ops::NONE);

        let mut part = [0u8; 40];
        reader.read_exact(&mut part).unwrap();
        way.refresh(true);
        assert!(way.is_ready());
    }

    #[test]
    fn chunked_response_exposes_trailers() {
        let mut transport = MockTransport::with_input(&[
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"5\r\nhello\r\n0\r\nX-Checksum: 42\r\n\r\n",
        ]);
        let mut way = InboundWay::new(1024);
        let role = ClientRole::default();
        let cx = InboundContext {
            accept: true,
            request_method: Some(&Method::GET),
            ..InboundContext::default()
        };

        let InboundStep::Received { head, entity } = way.process(&mut transport, &role, &cx).unwrap()
        else {
            panic!("expected a header section");
        };
        assert_eq!(head.start.status(), Some(StatusCode::OK));
        assert!(matches!(
            way.process(&mut transport, &role, &cx).unwrap(),
            InboundStep::Completed
        ));

        let mut reader = entity.unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello");
        assert_eq!(reader.trailers().unwrap().get("x-checksum"), Some("42"));
    }

    #[test]
    fn folded_header_joins_previous_value() {
        let mut transport =
            MockTransport::with_input(&[b"GET / HTTP/1.1\r\nX-Long: first\r\n  second\r\n\r\n"]);
        let mut way = InboundWay::new(1024);
        let InboundStep::Received { head, .. } = way
            .process(&mut transport, &ServerRole::default(), &accept())
            .unwrap()
        else {
            panic!("expected a header section");
        };
        assert_eq!(head.headers.get("x-long"), Some("first second"));
    }

    #[test]
    fn short_request_line_is_a_framing_error() {
        let mut transport = MockTransport::with_input(&[b"GET /x\r\n\r\n"]);
        let mut way = InboundWay::new(1024);
        let err = way
            .process(&mut transport, &ServerRole::default(), &accept())
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Framing(FramingError::ShortStartLine(_))
        ));
        assert_eq!(err.status(), StatusCode::CONNECTOR_ERROR_COMMUNICATION);
    }

    #[test]
    fn eof_between_messages_is_a_clean_close() {
        let mut transport = MockTransport::with_input(&[b"\r\n"]);
        transport.eof = true;
        let mut way = InboundWay::new(1024);
        assert!(matches!(
            way.process(&mut transport, &ServerRole::default(), &accept())
                .unwrap(),
            InboundStep::Closed
        ));
    }

    #[test]
    fn eof_inside_headers_is_an_error() {
        let mut transport = MockTransport::with_input(&[b"GET / HTTP/1.1\r\nHost"]);
        transport.eof = true;
        let mut way = InboundWay::new(1024);
        let err = way
            .process(&mut transport, &ServerRole::default(), &accept())
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Io(_)));
    }

    #[test]
    fn close_delimited_response_ends_at_eof() {
        let mut transport =
            MockTransport::with_input(&[b"HTTP/1.0 200 OK\r\n\r\nuntil the end"]);
        transport.eof = true;
        let mut way = InboundWay::new(1024);
        let role = ClientRole::default();
        let cx = InboundContext {
            accept: true,
            request_method: Some(&Method::GET),
            ..InboundContext::default()
        };

        let InboundStep::Received { entity, .. } = way.process(&mut transport, &role, &cx).unwrap()
        else {
            panic!("expected a header section");
        };
        assert!(matches!(
            way.process(&mut transport, &role, &cx).unwrap(),
            InboundStep::Completed
        ));
        let mut body = String::new();
        entity.unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "until the end");
    }

    #[test]
    fn request_start_line_is_parsed() {
        let mut transport = MockTransport::with_input(&[b"PURGE /cache HTTP/1.0\r\n\r\n"]);
        let mut way = InboundWay::new(1024);
        let InboundStep::Received { head, .. } = way
            .process(&mut transport, &ServerRole::default(), &accept())
            .unwrap()
        else {
            panic!("expected a header section");
        };
        assert!(matches!(
            head.start,
            StartLine::Request { ref method, ref target, .. }
                if *method == Method::Extension("PURGE".into()) && target == "/cache"
        ));
    }
}
