use std::collections::HashMap;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use crossbeam_queue::SegQueue;
use mio::{Token, Waker};
use tokio::runtime::Runtime;

use crate::config::Config;
use crate::connection::pool::ConnectionPool;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionSettings, ConnectionState, next_exchange_id,
    request_message,
};
use crate::error::ConnectorError;
use crate::helper::{detach_stream, response_from_head};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::io::transport::TcpTransport;
use crate::reactor::{Context, Controller, Helper, StopHandle};
use crate::way::{ClientRole, OutboundMessage, Role};

type Callback = Box<dyn FnMut(Response) + Send>;

/// How the caller of an exchange learns about its response.
enum Completion {
    /// A blocked `handle` call
    Latch(Sender<Response>),
    Callback(Callback),
}

impl Completion {
    /// Interim responses only reach callbacks.
    fn interim(&mut self, response: Response) {
        if let Completion::Callback(callback) = self {
            callback(response);
        }
    }

    fn complete(self, response: Response) {
        match self {
            // The caller may have given up waiting
            Completion::Latch(latch) => {
                if latch.send(response).is_err() {
                    tracing::debug!("Response discarded, caller no longer waiting");
                }
            }
            Completion::Callback(mut callback) => callback(response),
        }
    }
}

struct Submission {
    id: u64,
    request: Request,
    completion: Completion,
}

struct Pending {
    completion: Completion,
    /// `host:port` of the connection carrying the request
    address: String,
}

/// Outcome of looking for a connection to carry a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    Reuse(Token),
    Open,
    Unavailable,
}

/// What connection selection needs to know about a connection.
#[derive(Debug, Clone)]
pub(crate) struct Candidate<'a> {
    pub token: Token,
    pub address: &'a str,
    /// Open, persistent and carrying nothing
    pub available: bool,
    /// May still take more requests
    pub usable: bool,
    pub load: usize,
}

impl<'a> From<&'a Connection> for Candidate<'a> {
    fn from(connection: &'a Connection) -> Self {
        Candidate {
            token: connection.token(),
            address: connection.address(),
            available: connection.is_available(),
            usable: connection.is_persistent()
                && matches!(
                    connection.state(),
                    ConnectionState::Opening | ConnectionState::Open
                ),
            load: connection.load_score(),
        }
    }
}

/// Picks the connection for a request to `address`: the first available
/// one, else the usable one with the lowest load (first on ties), else a
/// new one when under both caps.
pub(crate) fn select_connection<'a>(
    candidates: impl IntoIterator<Item = Candidate<'a>>,
    address: &str,
    host_cap: Option<usize>,
    total_cap: Option<usize>,
) -> Selection {
    let mut total = 0;
    let mut for_host = 0;
    let mut best: Option<(usize, Token)> = None;
    for candidate in candidates {
        total += 1;
        if candidate.address != address {
            continue;
        }
        for_host += 1;
        if candidate.available {
            return Selection::Reuse(candidate.token);
        }
        if candidate.usable && best.is_none_or(|(load, _)| candidate.load < load) {
            best = Some((candidate.load, candidate.token));
        }
    }
    if let Some((_, token)) = best {
        return Selection::Reuse(token);
    }
    let full = host_cap.is_some_and(|cap| for_host >= cap)
        || total_cap.is_some_and(|cap| total >= cap);
    if full {
        Selection::Unavailable
    } else {
        Selection::Open
    }
}

/// The reactor half of a client connector.
pub struct ClientHelper {
    submissions: Arc<SegQueue<Submission>>,
    pending: HashMap<u64, Pending>,
    role: Arc<dyn Role>,
    settings: ConnectionSettings,
    host_cap: Option<usize>,
    total_cap: Option<usize>,
    /// `host:port` of the HTTP proxy every request goes through
    proxy: Option<String>,
    no_delay: bool,
}

impl ClientHelper {
    fn new(config: &Config, submissions: Arc<SegQueue<Submission>>) -> Self {
        let role = match &config.user_agent {
            Some(agent) => ClientRole::new(agent.clone()),
            None => ClientRole::default(),
        };
        Self {
            submissions,
            pending: HashMap::new(),
            role: Arc::new(role),
            settings: config.connection_settings(),
            host_cap: config.host_cap(),
            total_cap: config.total_cap(),
            proxy: config
                .proxy_host
                .as_ref()
                .map(|host| format!("{host}:{}", config.proxy_port)),
            no_delay: config.socket_no_delay,
        }
    }

    /// Number of exchanges waiting for their response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Where a request goes: the connection address and the request-target
    /// to put on the request line.
    fn route(&self, request: &Request) -> Result<(String, String), ConnectorError> {
        let url = request
            .url
            .as_ref()
            .ok_or_else(|| ConnectorError::InvalidTarget(request.target.clone()))?;
        if url.scheme() != "http" {
            return Err(ConnectorError::InvalidTarget(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConnectorError::InvalidTarget(url.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(match &self.proxy {
            // Proxies get the absolute form
            Some(proxy) => (proxy.clone(), url.to_string()),
            None => (format!("{host}:{port}"), request.target.clone()),
        })
    }

    fn submit(&mut self, submission: Submission, cx: &mut Context<'_>) {
        let Submission {
            id,
            request,
            completion,
        } = submission;
        let (address, target) = match self.route(&request) {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(id, error = %e, "Unable to route request");
                completion.complete(error_response(&e));
                return;
            }
        };
        tracing::debug!(id, method = %request.method, %address, %target, "Submitting request");
        let message = request_message(id, request, target);
        self.pending.insert(
            id,
            Pending {
                completion,
                address: address.clone(),
            },
        );
        if let Err(e) = self.dispatch(message, &address, cx) {
            self.fail(id, &e);
        }
    }

    fn dispatch(
        &mut self,
        message: OutboundMessage,
        address: &str,
        cx: &mut Context<'_>,
    ) -> Result<(), ConnectorError> {
        let selection = select_connection(
            cx.connections.iter().map(Candidate::from),
            address,
            self.host_cap,
            self.total_cap,
        );
        let token = match selection {
            Selection::Reuse(token) => token,
            Selection::Open => self.open(address, cx)?,
            Selection::Unavailable => {
                tracing::warn!(%address, "Maximum number of connections reached");
                return Err(ConnectorError::NoConnectionAvailable);
            }
        };
        let connection = cx
            .connections
            .get_mut(token)
            .ok_or(ConnectorError::NoConnectionAvailable)?;
        connection.enqueue(message);
        Ok(())
    }

    fn open(&self, address: &str, cx: &mut Context<'_>) -> Result<Token, ConnectorError> {
        let addr = address
            .to_socket_addrs()
            .map_err(|e| ConnectorError::InvalidTarget(format!("{address}: {e}")))?
            .next()
            .ok_or_else(|| ConnectorError::InvalidTarget(address.to_string()))?;
        let transport = TcpTransport::connect(addr).map_err(ConnectorError::Connect)?;
        if self.no_delay {
            if let Err(e) = transport.set_nodelay(true) {
                tracing::debug!(error = %e, "Unable to disable Nagle's algorithm");
            }
        }
        let token = cx.connections.next_token();
        let connection = cx.pool.acquire(
            token,
            Box::new(transport),
            Arc::clone(&self.role),
            address.to_string(),
            &self.settings,
            Some(Arc::clone(cx.waker)),
        );
        tracing::debug!(connection = token.0, %address, "Opening connection");
        cx.connections.insert(connection);
        Ok(token)
    }

    fn fail(&mut self, id: u64, err: &ConnectorError) {
        if let Some(pending) = self.pending.remove(&id) {
            pending.completion.complete(error_response(err));
        }
    }
}

impl Helper for ClientHelper {
    fn on_tick(&mut self, cx: &mut Context<'_>) {
        while let Some(submission) = self.submissions.pop() {
            self.submit(submission, cx);
        }
    }

    fn on_event(&mut self, token: Token, event: ConnectionEvent, cx: &mut Context<'_>) {
        match event {
            ConnectionEvent::Received { id, head, entity } => {
                let interim = head.is_informational();
                let response = response_from_head(head, entity);
                tracing::debug!(connection = token.0, id, status = %response.status, "Response received");
                if interim {
                    if let Some(pending) = self.pending.get_mut(&id) {
                        pending.completion.interim(response);
                    }
                } else if let Some(pending) = self.pending.remove(&id) {
                    pending.completion.complete(response);
                } else {
                    tracing::debug!(connection = token.0, id, "Response to an abandoned exchange discarded");
                }
            }
            ConnectionEvent::Sent { id } => {
                tracing::trace!(connection = token.0, id, "Request sent");
            }
            ConnectionEvent::Failed {
                ids,
                status,
                description,
            } => {
                for id in ids {
                    if let Some(pending) = self.pending.remove(&id) {
                        pending
                            .completion
                            .complete(Response::error(status, description.clone()));
                    }
                }
            }
            ConnectionEvent::Requeue { messages } => {
                for message in messages {
                    let id = message.id;
                    let Some(address) = self.pending.get(&id).map(|p| p.address.clone()) else {
                        continue;
                    };
                    if let Err(e) = self.dispatch(message, &address, cx) {
                        self.fail(id, &e);
                    }
                }
            }
        }
    }

    fn has_work(&self) -> bool {
        !self.submissions.is_empty()
    }

    fn on_stop(&mut self) {
        let stopped = ConnectorError::Stopped;
        while let Some(submission) = self.submissions.pop() {
            submission.completion.complete(error_response(&stopped));
        }
        for (_, pending) in self.pending.drain() {
            pending.completion.complete(error_response(&stopped));
        }
    }
}

fn error_response(err: &ConnectorError) -> Response {
    Response::error(err.status(), err.to_string())
}

/// A client connector: sends requests over pooled, persistent connections
/// driven by its own reactor thread.
///
/// ```no_run
/// use nioway::{ClientConnector, Config, Method, Request};
///
/// let client = ClientConnector::start(&Config::default())?;
/// let url = url::Url::parse("http://127.0.0.1:8080/hello")?;
/// let response = client.handle(Request::new(Method::GET, url));
/// println!("{}", response.status);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct ClientConnector {
    submissions: Arc<SegQueue<Submission>>,
    waker: Arc<Waker>,
    stop: StopHandle,
    thread: Option<JoinHandle<io::Result<()>>>,
    /// Longest a synchronous caller waits; zero waits forever
    timeout: Duration,
    /// Pulls streamed request entities off the callers' readers
    pumps: Option<Runtime>,
    stream_capacity: usize,
}

impl ClientConnector {
    pub fn start(config: &Config) -> io::Result<Self> {
        let submissions = Arc::new(SegQueue::new());
        let helper = ClientHelper::new(config, Arc::clone(&submissions));
        let pool = ConnectionPool::new(config.initial_connections, config.pooled_connections);
        let controller = Controller::new(helper, pool, config.controller_settings())?;
        let waker = controller.waker();
        let stop = controller.stop_handle();
        let pumps = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_threads.max(1))
            .thread_name("nioway-pump")
            .build()?;
        let thread = thread::Builder::new()
            .name("nioway-client".into())
            .spawn(move || controller.run())?;
        tracing::info!("Client connector started");
        Ok(Self {
            submissions,
            waker,
            stop,
            thread: Some(thread),
            timeout: config.max_io_idle(),
            pumps: Some(pumps),
            stream_capacity: config.outbound_buffer_size,
        })
    }

    /// Sends `request` and blocks until its response arrives.
    ///
    /// Failures come back as responses carrying a connector status. A
    /// caller that waited longer than the idle timeout gets status 1002;
    /// the exchange itself goes on and its late response is discarded.
    pub fn handle(&self, request: Request) -> Response {
        let (latch, done) = crossbeam_channel::bounded(1);
        self.submit(request, Completion::Latch(latch));
        let received = if self.timeout.is_zero() {
            done.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            done.recv_timeout(self.timeout)
        };
        match received {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::warn!(timeout_ms, "No response in time");
                error_response(&ConnectorError::Timeout(timeout_ms))
            }
            Err(RecvTimeoutError::Disconnected) => error_response(&ConnectorError::Stopped),
        }
    }

    /// Sends `request` and returns at once. `callback` runs on the reactor
    /// thread with every interim response and then the final one, so it
    /// must not block.
    pub fn handle_async<F>(&self, request: Request, callback: F)
    where
        F: FnMut(Response) + Send + 'static,
    {
        self.submit(request, Completion::Callback(Box::new(callback)));
    }

    fn submit(&self, mut request: Request, completion: Completion) {
        let Some(pumps) = self.pumps.as_ref().filter(|_| !self.stop.is_stopped()) else {
            completion.complete(error_response(&ConnectorError::Stopped));
            return;
        };
        request.entity = detach_stream(
            std::mem::take(&mut request.entity),
            pumps.handle(),
            self.stream_capacity,
        );
        self.submissions.push(Submission {
            id: next_exchange_id(),
            request,
            completion,
        });
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "Unable to wake the controller");
        }
    }

    /// Stops the reactor thread. Exchanges still pending complete with
    /// status 1002.
    pub fn stop(&mut self) -> io::Result<()> {
        self.stop.stop();
        if let Some(pumps) = self.pumps.take() {
            pumps.shutdown_background();
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| io::Error::other("client reactor thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for ClientConnector {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "Client connector stopped with an error");
        }
    }
}
