//! One socket conversation: its transport, its two ways and the exchanges
//! in flight on it.
//!
//! A connection only ever moves forward through its states:
//!
//! ```text
//!   OPENING ──► OPEN ──► CLOSING ──► CLOSED
//! ```
//!
//! `CLOSED` is terminal. The pool recycles a closed connection's buffers
//! into a fresh instance, which starts over at `OPENING`.

pub mod pool;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mio::{Registry, Token, Waker};

use crate::error::{ConnectorError, FramingError};
use crate::http::message::{MessageHead, StartLine};
use crate::http::request::{Method, Request, Version, wants_close};
use crate::http::response::{Response, StatusCode};
use crate::io::channel::EntityReader;
use crate::io::transport::Transport;
use crate::reactor::registration::{Applied, Ops, Registration, SelectionListener};
use crate::way::inbound::{InboundContext, InboundStep};
use crate::way::outbound::{OutboundContext, OutboundStep};
use crate::way::{InboundWay, OutboundMessage, OutboundWay, Role, Side};

static NEXT_EXCHANGE: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique exchange id. Tokens are reused across recycled
/// connections; ids never are.
pub fn next_exchange_id() -> u64 {
    NEXT_EXCHANGE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Connect (and handshake) in progress
    Opening,
    Open,
    /// Finishing the exchanges in flight, accepting no new ones
    Closing,
    Closed,
}

/// Per-connection knobs, derived from the connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub inbound_buffer_size: usize,
    pub outbound_buffer_size: usize,
    /// Zero disables the idle timeout
    pub max_io_idle: Duration,
    pub persistent: bool,
    pub pipelining: bool,
    /// Log the header section of every message read or written
    pub trace_messages: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            inbound_buffer_size: 16 * 1024,
            outbound_buffer_size: 32 * 1024,
            max_io_idle: Duration::from_secs(60),
            persistent: true,
            pipelining: false,
            trace_messages: false,
        }
    }
}

/// One request and its response on this connection.
#[derive(Debug)]
pub struct Exchange {
    pub id: u64,
    pub method: Method,
    /// Version of the peer's request (server side)
    pub version: Version,
    /// Client: request fully written. Server: final response queued.
    pub sent: bool,
    /// The connection closes once this exchange completes
    pub close: bool,
    /// Server: final response computed before its turn
    parked: Option<Response>,
}

/// What happened on a connection, for the helper to act on.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A header section arrived. Client: the response to exchange `id`.
    /// Server: a new request, `id` freshly assigned.
    Received {
        id: u64,
        head: MessageHead,
        entity: Option<EntityReader>,
    },
    /// The message of exchange `id` was fully written.
    Sent { id: u64 },
    /// These exchanges will never complete.
    Failed {
        ids: Vec<u64>,
        status: StatusCode,
        description: String,
    },
    /// Requests that were never written, to be sent over another
    /// connection.
    Requeue { messages: Vec<OutboundMessage> },
}

pub struct Connection {
    token: Token,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    peer: Option<SocketAddr>,
    /// `host:port` the client connection talks to, the peer for servers
    address: String,
    role: Arc<dyn Role>,
    settings: ConnectionSettings,
    /// Whether new exchanges may still be assigned (client) or read
    /// (server)
    persistent: bool,
    last_activity: Instant,
    inbound: InboundWay,
    outbound: OutboundWay,
    registration: Registration,
    exchanges: VecDeque<Exchange>,
    events: Vec<ConnectionEvent>,
    waker: Option<Arc<Waker>>,
    /// The response being read is informational
    interim: bool,
    /// The response being read asked to close the connection
    response_close: bool,
}

impl Connection {
    pub fn new(
        token: Token,
        transport: Box<dyn Transport>,
        role: Arc<dyn Role>,
        address: String,
        settings: ConnectionSettings,
        waker: Option<Arc<Waker>>,
    ) -> Self {
        Self {
            token,
            state: ConnectionState::Opening,
            transport: Some(transport),
            peer: None,
            address,
            role,
            inbound: InboundWay::new(settings.inbound_buffer_size),
            outbound: OutboundWay::new(settings.outbound_buffer_size),
            persistent: settings.persistent,
            settings,
            last_activity: Instant::now(),
            registration: Registration::bind(token, Ops::CONNECT),
            exchanges: VecDeque::new(),
            events: Vec::new(),
            waker,
            interim: false,
            response_close: false,
        }
    }

    /// Reinitializes a recycled connection around a fresh transport.
    pub fn reset(
        &mut self,
        token: Token,
        transport: Box<dyn Transport>,
        role: Arc<dyn Role>,
        address: String,
        settings: ConnectionSettings,
        waker: Option<Arc<Waker>>,
    ) {
        self.inbound.clear();
        self.outbound.clear();
        self.token = token;
        self.state = ConnectionState::Opening;
        self.transport = Some(transport);
        self.peer = None;
        self.address = address;
        self.role = role;
        self.persistent = settings.persistent;
        self.settings = settings;
        self.last_activity = Instant::now();
        self.registration.rebind(token, Ops::CONNECT);
        self.exchanges.clear();
        self.events.clear();
        self.waker = waker;
        self.interim = false;
        self.response_close = false;
    }

    /// Drops the transport and clears both ways, keeping their buffers.
    pub(crate) fn recycle(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
        self.transport = None;
        self.exchanges.clear();
        self.events.clear();
        self.waker = None;
        self.state = ConnectionState::Closed;
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn inbound(&self) -> &InboundWay {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundWay {
        &self.outbound
    }

    /// Number of exchanges in flight or queued.
    pub fn load_score(&self) -> usize {
        self.exchanges.len()
    }

    /// Open, reusable and carrying nothing.
    pub fn is_available(&self) -> bool {
        self.state == ConnectionState::Open && self.persistent && self.exchanges.is_empty()
    }

    /// Nothing left to read or write for any exchange.
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.outbound.is_idle()
    }

    /// A way can progress without a new readiness event.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnectionState::Open | ConnectionState::Closing)
            && (self.inbound.is_ready() || self.outbound.is_ready())
    }

    pub fn has_timed_out(&self, now: Instant) -> bool {
        self.state != ConnectionState::Closed
            && !self.settings.max_io_idle.is_zero()
            && now.saturating_duration_since(self.last_activity) >= self.settings.max_io_idle
    }

    /// When the idle timeout fires unless bytes move first.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.state == ConnectionState::Closed || self.settings.max_io_idle.is_zero() {
            return None;
        }
        Some(self.last_activity + self.settings.max_io_idle)
    }

    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    /// The connect completed: bytes may flow.
    pub fn open(&mut self) {
        self.state = ConnectionState::Open;
        self.peer = self.transport.as_ref().and_then(|t| t.peer_addr().ok());
        self.last_activity = Instant::now();
        tracing::debug!(connection = self.token.0, peer = ?self.peer, "Connection open");
    }

    /// Queues a request (client side).
    pub fn enqueue(&mut self, message: OutboundMessage) {
        if message.close {
            self.persistent = false;
        }
        self.exchanges.push_back(Exchange {
            id: message.id,
            method: message.method.clone(),
            version: message.peer_version,
            sent: false,
            close: message.close,
            parked: None,
        });
        self.outbound.enqueue(message);
        self.last_activity = Instant::now();
    }

    /// Whether the response to exchange `id` may be written now: it must
    /// answer the oldest request whose final response is not queued yet.
    /// Informational responses pass the same test without completing the
    /// exchange.
    pub fn can_handle(&self, id: u64) -> bool {
        self.exchanges
            .front()
            .is_some_and(|front| front.id == id && !front.sent)
    }

    /// Hands the response to exchange `id` over (server side).
    ///
    /// A final response computed ahead of its turn is parked until the
    /// responses before it were written. Returns `false` when the exchange
    /// is unknown or already answered.
    pub fn submit_response(&mut self, id: u64, response: Response) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        let informational = response.status.is_informational();
        if self.can_handle(id) {
            if let Some(front) = self.exchanges.front_mut() {
                let message = response_message(front, response);
                if !informational {
                    front.sent = true;
                }
                self.outbound.enqueue(message);
                self.last_activity = Instant::now();
                return true;
            }
        }
        if informational {
            tracing::debug!(connection = self.token.0, id, "Informational response out of turn dropped");
            return false;
        }
        match self.exchanges.iter_mut().find(|e| e.id == id) {
            Some(exchange) if !exchange.sent && exchange.parked.is_none() => {
                tracing::trace!(connection = self.token.0, id, "Response parked until its turn");
                exchange.parked = Some(response);
                true
            }
            _ => false,
        }
    }

    /// Moves both ways as far as they go.
    pub fn drive(&mut self) {
        self.drive_inbound();
        self.drive_outbound();
    }

    /// Re-derives the interest as the union of both ways' interests.
    /// Returns whether it changed.
    pub fn update_state(&mut self) -> bool {
        let interest = match self.state {
            ConnectionState::Opening => Ops::CONNECT,
            ConnectionState::Closed => Ops::NONE,
            ConnectionState::Open | ConnectionState::Closing => {
                let accept = self.inbound_accepts();
                let may_start = self.outbound_may_start();
                self.inbound.refresh(accept);
                self.outbound.refresh(may_start);
                self.inbound.interest() | self.outbound.interest()
            }
        };
        self.registration.update(interest)
    }

    /// Pushes a pending (re-)registration to the selector.
    pub fn apply_registration(&mut self, registry: &Registry) -> io::Result<Applied> {
        match self.transport.as_deref_mut() {
            Some(transport) => self.registration.apply(registry, transport.source()),
            None => Ok(Applied::Done),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if let Some(transport) = self.transport.as_deref_mut() {
            self.registration.cancel(registry, transport.source());
        }
    }

    /// Closes the connection. A graceful close lets the exchanges in
    /// flight finish first; the controller completes it once the
    /// connection is empty.
    pub fn close(&mut self, graceful: bool) {
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Closing if graceful => return,
            ConnectionState::Opening | ConnectionState::Open if graceful => {
                self.state = ConnectionState::Closing;
                tracing::debug!(connection = self.token.0, "Connection closing");
                return;
            }
            _ => {}
        }
        self.inbound.cancel("connection closed");
        self.outbound.cancel();
        if let Some(transport) = self.transport.as_deref_mut() {
            if let Err(e) = transport.shutdown() {
                tracing::debug!(connection = self.token.0, error = %e, "Unable to shut down socket");
            }
        }
        self.state = ConnectionState::Closed;
        tracing::debug!(connection = self.token.0, peer = ?self.peer, "Connection closed");
    }

    /// Reports every exchange on the connection as failed, then closes it
    /// at once.
    pub fn fail(&mut self, err: ConnectorError) {
        let status = err.status();
        let description = err.to_string();
        tracing::warn!(
            connection = self.token.0,
            peer = ?self.peer,
            error = %description,
            "Connection failed"
        );
        let ids: Vec<u64> = self.exchanges.drain(..).map(|e| e.id).collect();
        if !ids.is_empty() {
            self.events.push(ConnectionEvent::Failed {
                ids,
                status,
                description: description.clone(),
            });
        }
        self.inbound.cancel(&description);
        self.close(false);
    }

    fn inbound_accepts(&self) -> bool {
        match self.role.side() {
            Side::Client => matches!(self.state, ConnectionState::Open | ConnectionState::Closing),
            Side::Server => self.state == ConnectionState::Open && self.persistent,
        }
    }

    fn outbound_may_start(&self) -> bool {
        match self.role.side() {
            // Responses are only queued once it is their turn
            Side::Server => matches!(self.state, ConnectionState::Open | ConnectionState::Closing),
            Side::Client => {
                if self.state != ConnectionState::Open {
                    return false;
                }
                let mut outstanding = self.exchanges.iter().filter(|e| e.sent).peekable();
                if outstanding.peek().is_none() {
                    return true;
                }
                if !self.settings.pipelining {
                    return false;
                }
                let next_idempotent = self
                    .outbound
                    .next()
                    .is_none_or(|m| m.method.is_idempotent());
                next_idempotent && outstanding.all(|e| !e.close && e.method.is_idempotent())
            }
        }
    }

    fn drive_inbound(&mut self) {
        let role = Arc::clone(&self.role);
        let waker = self.waker.clone();
        loop {
            if self.state == ConnectionState::Closed {
                return;
            }
            let accept = self.inbound_accepts();
            let method = self.exchanges.front().map(|e| e.method.clone());
            let step = {
                let Some(transport) = self.transport.as_deref_mut() else {
                    return;
                };
                let cx = InboundContext {
                    accept,
                    request_method: method.as_ref(),
                    waker: waker.as_ref(),
                    trace: self.settings.trace_messages,
                };
                self.inbound.process(transport, role.as_ref(), &cx)
            };
            match step {
                Ok(InboundStep::Received { head, entity }) => self.on_received(head, entity),
                Ok(InboundStep::Completed) => self.on_inbound_completed(),
                Ok(InboundStep::Blocked | InboundStep::Stalled) => return,
                Ok(InboundStep::Closed) => {
                    self.on_peer_closed();
                    return;
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn drive_outbound(&mut self) {
        let role = Arc::clone(&self.role);
        let waker = self.waker.clone();
        loop {
            if matches!(self.state, ConnectionState::Opening | ConnectionState::Closed) {
                return;
            }
            let cx = OutboundContext {
                persistent: self.settings.persistent,
                may_start: self.outbound_may_start(),
                waker: waker.as_ref(),
                trace: self.settings.trace_messages,
            };
            let step = {
                let Some(transport) = self.transport.as_deref_mut() else {
                    return;
                };
                self.outbound.process(transport, role.as_ref(), &cx)
            };
            match step {
                Ok(OutboundStep::Sent {
                    id,
                    informational,
                    close,
                }) => self.on_sent(id, informational, close),
                Ok(OutboundStep::Blocked | OutboundStep::Stalled) => return,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn on_received(&mut self, head: MessageHead, entity: Option<EntityReader>) {
        self.last_activity = Instant::now();
        match self.role.side() {
            Side::Client => {
                let Some(id) = self.exchanges.front().map(|e| e.id) else {
                    self.fail(FramingError::UnexpectedMessage.into());
                    return;
                };
                self.interim = head.is_informational();
                if !self.interim && wants_close(head.start.version(), &head.headers) {
                    self.response_close = true;
                }
                self.events.push(ConnectionEvent::Received { id, head, entity });
            }
            Side::Server => {
                let id = next_exchange_id();
                let version = head.start.version();
                let close = !self.settings.persistent || wants_close(version, &head.headers);
                if close {
                    self.persistent = false;
                }
                self.exchanges.push_back(Exchange {
                    id,
                    method: head.start.method().cloned().unwrap_or(Method::GET),
                    version,
                    sent: false,
                    close,
                    parked: None,
                });
                tracing::trace!(connection = self.token.0, id, "Request received");
                self.events.push(ConnectionEvent::Received { id, head, entity });
            }
        }
    }

    fn on_inbound_completed(&mut self) {
        if self.role.side() == Side::Server || std::mem::take(&mut self.interim) {
            return;
        }
        let finished = self.exchanges.pop_front();
        let close = std::mem::take(&mut self.response_close)
            || finished.is_some_and(|e| e.close);
        if close {
            self.persistent = false;
            self.requeue_unsent();
            self.close(true);
        }
    }

    fn on_sent(&mut self, id: u64, informational: bool, close: bool) {
        self.last_activity = Instant::now();
        self.events.push(ConnectionEvent::Sent { id });
        match self.role.side() {
            Side::Client => {
                if let Some(exchange) = self.exchanges.iter_mut().find(|e| e.id == id) {
                    exchange.sent = true;
                }
            }
            Side::Server => {
                if informational {
                    return;
                }
                if self.exchanges.front().is_some_and(|e| e.id == id) {
                    self.exchanges.pop_front();
                }
                if close {
                    self.persistent = false;
                    self.close(true);
                    return;
                }
                self.release_parked();
            }
        }
    }

    /// Queues the parked response of the new head exchange, if any.
    fn release_parked(&mut self) {
        if let Some(front) = self.exchanges.front_mut() {
            if let Some(response) = front.parked.take() {
                let message = response_message(front, response);
                front.sent = true;
                self.outbound.enqueue(message);
            }
        }
    }

    fn on_peer_closed(&mut self) {
        tracing::debug!(connection = self.token.0, peer = ?self.peer, "Peer closed the connection");
        self.persistent = false;
        match self.role.side() {
            Side::Client => {
                self.requeue_unsent();
                if self.exchanges.is_empty() {
                    self.close(false);
                } else {
                    self.fail(ConnectorError::Io(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection closed by peer before the response",
                    )));
                }
            }
            // Half-closed: the responses still owed are written first
            Side::Server if !self.exchanges.is_empty() => self.close(true),
            Side::Server => self.close(false),
        }
    }

    /// Hands requests not written yet back to the helper.
    fn requeue_unsent(&mut self) {
        let messages = self.outbound.take_queued();
        if messages.is_empty() {
            return;
        }
        self.exchanges
            .retain(|e| !messages.iter().any(|m| m.id == e.id));
        tracing::debug!(
            connection = self.token.0,
            count = messages.len(),
            "Requeueing unsent requests"
        );
        self.events.push(ConnectionEvent::Requeue { messages });
    }
}

impl SelectionListener for Connection {
    fn on_selected(&mut self, ready: Ops) {
        self.registration.set_ready(ready);
        self.last_activity = Instant::now();

        if self.state == ConnectionState::Opening {
            let Some(transport) = self.transport.as_deref_mut() else {
                return;
            };
            let opened = transport
                .finish_connect()
                .and_then(|connected| if connected { transport.handshake() } else { Ok(false) });
            match opened {
                Ok(true) => self.open(),
                Ok(false) => return,
                Err(e) => {
                    self.fail(ConnectorError::Connect(e));
                    return;
                }
            }
        }
        if self.state == ConnectionState::Closed {
            return;
        }
        if ready.contains(Ops::READ) {
            self.inbound.on_readable();
        }
        if ready.contains(Ops::WRITE) {
            self.outbound.on_writable();
        }
        self.drive();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token.0)
            .field("state", &self.state)
            .field("address", &self.address)
            .field("persistent", &self.persistent)
            .field("exchanges", &self.exchanges.len())
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// Frames a handler's response for the exchange it answers.
fn response_message(exchange: &Exchange, response: Response) -> OutboundMessage {
    let close = exchange.close || response.headers.has_token("Connection", "close");
    let reason = response.reason_phrase().to_string();
    OutboundMessage {
        id: exchange.id,
        head: MessageHead {
            start: StartLine::Status {
                version: Version::HTTP_11,
                status: response.status,
                reason,
            },
            headers: response.headers,
        },
        entity: response.entity,
        method: exchange.method.clone(),
        peer_version: exchange.version,
        authority: None,
        close,
    }
}

/// Builds the request message a client connection writes.
pub fn request_message(id: u64, request: Request, target: String) -> OutboundMessage {
    let close = request.wants_close();
    let authority = request.url.as_ref().and_then(|url| {
        url.host_str().map(|host| match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    });
    OutboundMessage {
        id,
        head: MessageHead {
            start: StartLine::Request {
                method: request.method.clone(),
                target,
                version: request.version,
            },
            headers: request.headers,
        },
        entity: request.entity,
        method: request.method,
        peer_version: Version::HTTP_11,
        authority,
        close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::mock::SharedMock;
    use crate::way::{ClientRole, ServerRole};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            inbound_buffer_size: 1024,
            outbound_buffer_size: 1024,
            max_io_idle: Duration::from_millis(50),
            persistent: true,
            pipelining: false,
            trace_messages: false,
        }
    }

    fn server(input: &[u8]) -> (Connection, SharedMock) {
        let mock = SharedMock::default();
        mock.lock().push(input);
        let mut connection = Connection::new(
            Token(2),
            Box::new(mock.clone()),
            Arc::new(ServerRole::default()),
            "127.0.0.1:9".into(),
            settings(),
            None,
        );
        connection.open();
        (connection, mock)
    }

    fn client(settings: ConnectionSettings) -> (Connection, SharedMock) {
        let mock = SharedMock::default();
        let connection = Connection::new(
            Token(3),
            Box::new(mock.clone()),
            Arc::new(ClientRole::default()),
            "example.com:80".into(),
            settings,
            None,
        );
        (connection, mock)
    }

    fn get(id: u64, path: &str) -> OutboundMessage {
        let url = url::Url::parse(&format!("http://example.com{path}")).unwrap();
        let request = Request::new(Method::GET, url);
        let target = request.target.clone();
        request_message(id, request, target)
    }

    fn received_ids(events: &[ConnectionEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Received { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unchanged_interest_is_not_reported() {
        let (mut connection, _mock) = server(b"");
        assert!(connection.update_state());
        assert!(!connection.update_state());
    }

    #[test]
    fn selection_is_recorded_on_the_registration() {
        let (mut connection, _mock) = server(b"GET /a HTTP/1.1\r\n\r\n");
        let listener: &mut dyn SelectionListener = &mut connection;
        listener.on_selected(Ops::READ);
        assert_eq!(connection.registration().ready(), Ops::READ);
        assert_eq!(received_ids(&connection.take_events()).len(), 1);
    }

    #[test]
    fn pipelined_responses_keep_request_order() {
        let (mut connection, mock) =
            server(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        connection.on_selected(Ops::READ);
        let ids = received_ids(&connection.take_events());
        assert_eq!(ids.len(), 2);

        // The second response is computed first
        assert!(connection.submit_response(ids[1], Response::ok("second")));
        connection.update_state();
        connection.drive();
        assert!(mock.written().is_empty());

        assert!(connection.submit_response(ids[0], Response::ok("first")));
        connection.update_state();
        connection.drive();

        let wire = mock.written();
        let first = wire.find("first").unwrap();
        let second = wire.find("second").unwrap();
        assert!(first < second);
        assert!(connection.is_empty());
    }

    #[test]
    fn connection_close_request_ends_in_closed() {
        let (mut connection, mock) = server(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        connection.on_selected(Ops::READ);
        let ids = received_ids(&connection.take_events());

        assert!(connection.submit_response(ids[0], Response::ok("bye")));
        connection.update_state();
        connection.drive();
        assert!(mock.written().contains("Connection: close\r\n"));
        assert_eq!(connection.state(), ConnectionState::Closing);

        // What the controller sweep does with an empty closing connection
        assert!(connection.is_empty());
        connection.close(false);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.is_available());
    }

    #[test]
    fn informational_response_precedes_final_one() {
        let (mut connection, mock) = server(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        connection.on_selected(Ops::READ);
        let ids = received_ids(&connection.take_events());

        assert!(connection.submit_response(ids[0], Response::new(StatusCode::CONTINUE)));
        assert!(connection.can_handle(ids[0]));
        assert!(connection.submit_response(ids[0], Response::ok("done")));
        assert!(!connection.can_handle(ids[0]));
        connection.update_state();
        connection.drive();

        let wire = mock.written();
        assert!(wire.starts_with("HTTP/1.1 100 Continue\r\n"));
        assert!(wire.contains("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn client_waits_for_response_without_pipelining() {
        let (mut connection, mock) = client(settings());
        connection.enqueue(get(1, "/one"));
        connection.enqueue(get(2, "/two"));
        connection.on_selected(Ops::CONNECT | Ops::WRITE);
        assert_eq!(connection.state(), ConnectionState::Open);

        let wire = mock.written();
        assert!(wire.starts_with("GET /one HTTP/1.1\r\n"));
        assert!(!wire.contains("/two"));

        mock.lock().push(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        connection.on_selected(Ops::READ);
        let events = connection.take_events();
        assert_eq!(received_ids(&events), vec![1]);
        assert!(mock.written().contains("GET /two HTTP/1.1\r\n"));
        assert_eq!(connection.load_score(), 1);
    }

    #[test]
    fn pipelining_writes_idempotent_requests_back_to_back() {
        let (mut connection, mock) = client(ConnectionSettings {
            pipelining: true,
            ..settings()
        });
        connection.enqueue(get(1, "/one"));
        connection.enqueue(get(2, "/two"));
        connection.on_selected(Ops::CONNECT | Ops::WRITE);

        let wire = mock.written();
        assert!(wire.contains("/one") && wire.contains("/two"));
    }

    #[test]
    fn framing_error_fails_every_exchange() {
        let (mut connection, mock) = client(ConnectionSettings {
            pipelining: true,
            ..settings()
        });
        connection.enqueue(get(1, "/one"));
        connection.enqueue(get(2, "/two"));
        connection.on_selected(Ops::CONNECT | Ops::WRITE);

        mock.lock().push(b"HTTP/1.1 abc OK\r\n\r\n");
        connection.on_selected(Ops::READ);
        let events = connection.take_events();
        let failed = events.iter().find_map(|e| match e {
            ConnectionEvent::Failed { ids, status, .. } => Some((ids.clone(), *status)),
            _ => None,
        });
        assert_eq!(
            failed,
            Some((vec![1, 2], StatusCode::CONNECTOR_ERROR_COMMUNICATION))
        );
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn idle_connection_times_out_with_internal_status() {
        let (mut connection, _mock) = client(settings());
        connection.enqueue(get(5, "/slow"));
        connection.on_selected(Ops::CONNECT | Ops::WRITE);

        let later = Instant::now() + Duration::from_millis(60);
        assert!(connection.has_timed_out(later));
        connection.fail(ConnectorError::Timeout(50));
        let events = connection.take_events();
        assert!(matches!(
            events.as_slice(),
            [.., ConnectionEvent::Failed { ids, status, .. }]
                if ids == &vec![5] && *status == StatusCode::CONNECTOR_ERROR_INTERNAL
        ));
    }

    #[test]
    fn close_response_requeues_unsent_requests() {
        let (mut connection, mock) = client(settings());
        connection.enqueue(get(1, "/one"));
        connection.enqueue(get(2, "/two"));
        connection.on_selected(Ops::CONNECT | Ops::WRITE);

        mock.lock()
            .push(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
        connection.on_selected(Ops::READ);
        let events = connection.take_events();
        let requeued = events.iter().find_map(|e| match e {
            ConnectionEvent::Requeue { messages } => Some(messages.iter().map(|m| m.id).collect::<Vec<_>>()),
            _ => None,
        });
        assert_eq!(requeued, Some(vec![2]));
        assert_eq!(connection.state(), ConnectionState::Closing);
        assert!(connection.is_empty());
    }
}
