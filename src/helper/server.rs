use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use tokio::runtime::{Handle, Runtime};

use crate::config::Config;
use crate::connection::pool::ConnectionPool;
use crate::connection::{ConnectionEvent, ConnectionSettings};
use crate::helper::{detach_stream, request_from_head};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::io::transport::TcpTransport;
use crate::reactor::{Context, Controller, Helper, LISTENER, Ops, StopHandle};
use crate::way::{Role, ServerRole};

/// Application code answering requests. Runs on the worker pool, so it may
/// block (reading the request entity, for one).
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(Request) -> Response + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Response {
        self(request)
    }
}

/// A computed response on its way back to the reactor.
struct Reply {
    token: Token,
    id: u64,
    response: Response,
}

/// The reactor half of a server connector.
pub struct ServerHelper {
    listener: TcpListener,
    role: Arc<dyn Role>,
    settings: ConnectionSettings,
    handler: Arc<dyn Handler>,
    runtime: Handle,
    replies: Arc<SegQueue<Reply>>,
    in_flight: Arc<AtomicUsize>,
    workers: usize,
    total_cap: Option<usize>,
    no_delay: bool,
}

impl ServerHelper {
    fn accept(&mut self, cx: &mut Context<'_>) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    return;
                }
            };
            if self.total_cap.is_some_and(|cap| cx.connections.len() >= cap) {
                tracing::warn!(%peer, "Maximum number of connections reached, connection refused");
                continue;
            }
            let transport = TcpTransport::new(stream);
            if self.no_delay {
                if let Err(e) = transport.set_nodelay(true) {
                    tracing::debug!(%peer, error = %e, "Unable to disable Nagle's algorithm");
                }
            }
            let token = cx.connections.next_token();
            let mut connection = cx.pool.acquire(
                token,
                Box::new(transport),
                Arc::clone(&self.role),
                peer.to_string(),
                &self.settings,
                Some(Arc::clone(cx.waker)),
            );
            connection.open();
            tracing::info!(connection = token.0, %peer, "Accepted connection");
            cx.connections.insert(connection);
        }
    }

    fn dispatch(&mut self, token: Token, id: u64, request: Request, cx: &mut Context<'_>) {
        let handler = Arc::clone(&self.handler);
        let replies = Arc::clone(&self.replies);
        let in_flight = Arc::clone(&self.in_flight);
        let waker = Arc::clone(cx.waker);
        let runtime = self.runtime.clone();
        let capacity = self.settings.outbound_buffer_size;
        in_flight.fetch_add(1, Ordering::AcqRel);
        self.runtime.spawn_blocking(move || {
            let method = request.method.clone();
            let target = request.target.clone();
            let mut response = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
                Ok(response) => response,
                Err(_) => {
                    tracing::error!(id, %method, %target, "Handler panicked");
                    Response::internal_error()
                }
            };
            tracing::debug!(id, %method, %target, status = %response.status, "Request handled");
            response.entity = detach_stream(std::mem::take(&mut response.entity), &runtime, capacity);
            replies.push(Reply { token, id, response });
            in_flight.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = waker.wake() {
                tracing::warn!(error = %e, "Unable to wake the controller");
            }
        });
    }
}

impl Helper for ServerHelper {
    fn start(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.listener, LISTENER, Interest::READABLE)
    }

    fn on_selected(&mut self, token: Token, _ready: Ops, cx: &mut Context<'_>) {
        if token == LISTENER {
            self.accept(cx);
        }
    }

    fn on_tick(&mut self, cx: &mut Context<'_>) {
        while let Some(Reply { token, id, response }) = self.replies.pop() {
            let submitted = cx
                .connections
                .get_mut(token)
                .is_some_and(|connection| connection.submit_response(id, response));
            if !submitted {
                tracing::debug!(connection = token.0, id, "Response for a gone exchange dropped");
            }
        }
    }

    fn on_event(&mut self, token: Token, event: ConnectionEvent, cx: &mut Context<'_>) {
        match event {
            ConnectionEvent::Received { id, head, entity } => {
                let expects_continue = head.headers.has_token("Expect", "100-continue");
                let request = request_from_head(head, entity);
                tracing::debug!(connection = token.0, id, method = %request.method, target = %request.target, "Request received");
                if expects_continue && !request.entity.is_empty() {
                    if let Some(connection) = cx.connections.get_mut(token) {
                        connection.submit_response(id, Response::new(StatusCode::CONTINUE));
                    }
                }
                self.dispatch(token, id, request, cx);
            }
            ConnectionEvent::Sent { id } => {
                tracing::trace!(connection = token.0, id, "Response sent");
            }
            ConnectionEvent::Failed { ids, description, .. } => {
                tracing::debug!(connection = token.0, count = ids.len(), error = %description, "Exchanges abandoned");
            }
            ConnectionEvent::Requeue { messages } => {
                tracing::debug!(connection = token.0, count = messages.len(), "Unsent responses dropped");
            }
        }
    }

    fn has_work(&self) -> bool {
        !self.replies.is_empty()
    }

    fn is_overloaded(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) >= self.workers
    }
}

/// A server connector: accepts connections on its reactor thread and runs
/// the handler for each request on a bounded worker pool.
///
/// Responses go out in request order on every connection, whatever order
/// the workers finish in.
pub struct Server {
    local_addr: SocketAddr,
    stop: StopHandle,
    thread: Option<JoinHandle<io::Result<()>>>,
    runtime: Option<Runtime>,
}

impl Server {
    pub fn start<H: Handler>(config: &Config, handler: H) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let workers = config.worker_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("nioway-worker")
            .enable_all()
            .build()?;

        let helper = ServerHelper {
            listener,
            role: Arc::new(ServerRole::default()),
            settings: config.connection_settings(),
            handler: Arc::new(handler),
            runtime: runtime.handle().clone(),
            replies: Arc::new(SegQueue::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            workers,
            total_cap: config.total_cap(),
            no_delay: config.socket_no_delay,
        };
        let pool = ConnectionPool::new(config.initial_connections, config.pooled_connections);
        let controller = Controller::new(helper, pool, config.controller_settings())?;
        let stop = controller.stop_handle();
        let thread = thread::Builder::new()
            .name("nioway-server".into())
            .spawn(move || controller.run())?;

        tracing::info!(addr = %local_addr, workers, "Server listening");
        Ok(Self {
            local_addr,
            stop,
            thread: Some(thread),
            runtime: Some(runtime),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every connection and lets running handlers
    /// finish in the background.
    pub fn stop(&mut self) -> io::Result<()> {
        self.stop.stop();
        let result = match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| io::Error::other("server reactor thread panicked"))?,
            None => Ok(()),
        };
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            tracing::info!(addr = %self.local_addr, "Server stopped");
        }
        result
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "Server stopped with an error");
        }
    }
}
