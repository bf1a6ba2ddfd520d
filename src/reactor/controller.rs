use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token, Waker};

use crate::connection::pool::ConnectionPool;
use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::error::ConnectorError;
use crate::reactor::registration::{Applied, Ops, RegistrationState, SelectionListener};
use crate::reactor::{FIRST_CONNECTION, WAKER};

const EVENT_CAPACITY: usize = 1024;

/// The connections of one connector, by token. Iterates in opening order.
#[derive(Debug)]
pub struct Connections {
    map: BTreeMap<Token, Connection>,
    next: usize,
}

impl Default for Connections {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
            next: FIRST_CONNECTION,
        }
    }
}

impl Connections {
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next);
        self.next += 1;
        token
    }

    pub fn insert(&mut self, connection: Connection) {
        self.map.insert(connection.token(), connection);
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.map.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.map.get_mut(&token)
    }

    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        self.map.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.map.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.map.values_mut()
    }

    fn tokens(&self) -> Vec<Token> {
        self.map.keys().copied().collect()
    }
}

/// What a helper gets to touch while the controller calls it.
pub struct Context<'a> {
    pub connections: &'a mut Connections,
    pub pool: &'a mut ConnectionPool,
    pub waker: &'a Arc<Waker>,
}

/// The connector-specific half of the reactor loop.
pub trait Helper {
    /// Registers the helper's own sources before the first turn.
    fn start(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }

    /// Readiness of a token that no connection owns.
    fn on_selected(&mut self, _token: Token, _ready: Ops, _cx: &mut Context<'_>) {}

    /// Once per turn, before the sweep: takes over what the application
    /// queued since the last turn.
    fn on_tick(&mut self, cx: &mut Context<'_>);

    /// Something happened on a connection.
    fn on_event(&mut self, token: Token, event: ConnectionEvent, cx: &mut Context<'_>);

    /// Work is waiting that the next turn should not sleep on.
    fn has_work(&self) -> bool {
        false
    }

    /// Whether the worker pool behind the helper is saturated.
    fn is_overloaded(&self) -> bool {
        false
    }

    /// The loop exited; every connection is already closed.
    fn on_stop(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Longest a turn sleeps in the poll
    pub sleep: Duration,
    /// Connections are checked for idleness at least this often; zero
    /// disables the bound
    pub max_io_idle: Duration,
}

/// Asks a running controller to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "Unable to wake the controller");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The reactor loop of one connector.
///
/// Each turn registers what changed, polls, hands readiness to the
/// connections, lets the helper take over new work, sweeps the connections
/// and finally reports their events to the helper.
pub struct Controller<H> {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    helper: H,
    connections: Connections,
    pool: ConnectionPool,
    settings: ControllerSettings,
    shutdown: Arc<AtomicBool>,
    overloaded: bool,
    pending: Vec<(Token, ConnectionEvent)>,
}

impl<H: Helper> Controller<H> {
    pub fn new(helper: H, pool: ConnectionPool, settings: ControllerSettings) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker,
            helper,
            connections: Connections::default(),
            pool,
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
            overloaded: false,
            pending: Vec::new(),
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn helper(&self) -> &H {
        &self.helper
    }

    pub fn helper_mut(&mut self) -> &mut H {
        &mut self.helper
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Runs turns until stopped, then closes every connection.
    pub fn run(mut self) -> io::Result<()> {
        self.helper.start(self.poll.registry())?;
        tracing::debug!("Controller started");
        let result = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                tracing::error!(error = %e, "Controller failed");
                break Err(e);
            }
        };
        self.stop();
        result
    }

    /// One turn of the loop.
    pub fn run_once(&mut self) -> io::Result<()> {
        self.refresh_registrations();

        let timeout = self.poll_timeout(Instant::now());
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, Ops)> = self
            .events
            .iter()
            .map(|event| (event.token(), Ops::from_event(event)))
            .collect();
        for (token, ops) in ready {
            if token == WAKER {
                continue;
            }
            match self.connections.get_mut(token) {
                Some(connection) => connection.on_selected(ops),
                None => {
                    let mut cx = Context {
                        connections: &mut self.connections,
                        pool: &mut self.pool,
                        waker: &self.waker,
                    };
                    self.helper.on_selected(token, ops, &mut cx);
                }
            }
        }

        {
            let mut cx = Context {
                connections: &mut self.connections,
                pool: &mut self.pool,
                waker: &self.waker,
            };
            self.helper.on_tick(&mut cx);
        }

        self.sweep(Instant::now());
        self.dispatch_events();

        let overloaded = self.helper.is_overloaded();
        if overloaded != self.overloaded {
            if overloaded {
                tracing::info!("Worker pool saturated");
            } else {
                tracing::info!("Worker pool available again");
            }
            self.overloaded = overloaded;
        }
        Ok(())
    }

    /// Re-derives every interest, then pushes new registrations before
    /// updated ones.
    fn refresh_registrations(&mut self) {
        for connection in self.connections.iter_mut() {
            connection.update_state();
        }
        let registry = self.poll.registry();
        for wanted in [RegistrationState::New, RegistrationState::Updated] {
            for connection in self.connections.iter_mut() {
                if connection.registration().state() != wanted {
                    continue;
                }
                match connection.apply_registration(registry) {
                    Ok(Applied::Done) => {}
                    Ok(Applied::Requeued) => {
                        tracing::debug!(connection = connection.token().0, "Registration requeued");
                    }
                    Err(e) => connection.fail(ConnectorError::Io(e)),
                }
            }
        }
    }

    /// Zero while something can progress without the selector, otherwise
    /// the sleep time cut short by the earliest idle deadline.
    fn poll_timeout(&self, now: Instant) -> Duration {
        let busy = self.helper.has_work()
            || self.connections.iter().any(|c| {
                c.is_ready()
                    || c.state() == ConnectionState::Closed
                    || (c.state() == ConnectionState::Closing && c.is_empty())
                    || c.registration().state() == RegistrationState::New
            });
        if busy {
            return Duration::ZERO;
        }
        match self.connections.iter().filter_map(|c| c.idle_deadline()).min() {
            Some(deadline) => self
                .settings
                .sleep
                .min(deadline.saturating_duration_since(now)),
            None => self.settings.sleep,
        }
    }

    /// Recycles closed connections, completes graceful closes, enforces
    /// idle timeouts and drives the ways that can progress on their own.
    fn sweep(&mut self, now: Instant) {
        let registry = self.poll.registry();
        for token in self.connections.tokens() {
            let Some(connection) = self.connections.get_mut(token) else {
                continue;
            };
            match connection.state() {
                ConnectionState::Closed => {}
                ConnectionState::Closing if connection.is_empty() => connection.close(false),
                _ if connection.has_timed_out(now) => {
                    connection.fail(ConnectorError::Timeout(
                        self.settings.max_io_idle.as_millis() as u64,
                    ));
                }
                _ => {
                    connection.update_state();
                    if connection.is_ready() {
                        connection.drive();
                        connection.update_state();
                    }
                }
            }
            for event in connection.take_events() {
                self.pending.push((token, event));
            }
            if connection.state() == ConnectionState::Closed {
                if let Some(mut closed) = self.connections.remove(token) {
                    closed.deregister(registry);
                    self.pool.release(closed);
                }
            }
        }
    }

    fn dispatch_events(&mut self) {
        // Events raised while readiness was dispatched
        for connection in self.connections.iter_mut() {
            let token = connection.token();
            for event in connection.take_events() {
                self.pending.push((token, event));
            }
        }
        let pending = std::mem::take(&mut self.pending);
        let mut cx = Context {
            connections: &mut self.connections,
            pool: &mut self.pool,
            waker: &self.waker,
        };
        for (token, event) in pending {
            self.helper.on_event(token, event, &mut cx);
        }
    }

    fn stop(&mut self) {
        tracing::debug!(connections = self.connections.len(), "Controller stopping");
        let registry = self.poll.registry();
        for token in self.connections.tokens() {
            let Some(mut connection) = self.connections.remove(token) else {
                continue;
            };
            if connection.is_empty() {
                connection.close(false);
            } else {
                connection.fail(ConnectorError::Stopped);
            }
            connection.deregister(registry);
            for event in connection.take_events() {
                self.pending.push((token, event));
            }
            self.pool.release(connection);
        }
        self.dispatch_events();
        self.helper.on_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::http::response::StatusCode;
    use crate::io::transport::mock::SharedMock;
    use crate::way::ServerRole;

    #[derive(Default)]
    struct Recorder {
        failed: Vec<(Vec<u64>, StatusCode)>,
        received: Vec<u64>,
        ticks: usize,
    }

    impl Helper for Recorder {
        fn on_tick(&mut self, _cx: &mut Context<'_>) {
            self.ticks += 1;
        }

        fn on_event(&mut self, _token: Token, event: ConnectionEvent, _cx: &mut Context<'_>) {
            match event {
                ConnectionEvent::Failed { ids, status, .. } => self.failed.push((ids, status)),
                ConnectionEvent::Received { id, .. } => self.received.push(id),
                _ => {}
            }
        }
    }

    fn controller(idle: Duration) -> Controller<Recorder> {
        Controller::new(
            Recorder::default(),
            ConnectionPool::new(4, true),
            ControllerSettings {
                sleep: Duration::from_millis(5),
                max_io_idle: idle,
            },
        )
        .unwrap()
    }

    fn accept(controller: &mut Controller<Recorder>, mock: &SharedMock, idle: Duration) -> Token {
        let token = controller.connections.next_token();
        let settings = ConnectionSettings {
            max_io_idle: idle,
            ..ConnectionSettings::default()
        };
        let waker = controller.waker();
        let mut connection = controller.pool.acquire(
            token,
            Box::new(mock.clone()),
            Arc::new(ServerRole::default()),
            "127.0.0.1:9".into(),
            &settings,
            Some(waker),
        );
        connection.open();
        controller.connections.insert(connection);
        token
    }

    #[test]
    fn ready_connection_is_driven_without_events() {
        let mut controller = controller(Duration::ZERO);
        let mock = SharedMock::default();
        mock.lock().push(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        accept(&mut controller, &mock, Duration::ZERO);

        controller.run_once().unwrap();
        assert_eq!(controller.helper().received.len(), 1);
        assert_eq!(controller.helper().ticks, 1);
    }

    #[test]
    fn idle_connection_is_failed_and_recycled() {
        let idle = Duration::from_millis(20);
        let mut controller = controller(idle);
        let mock = SharedMock::default();
        mock.lock().push(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        accept(&mut controller, &mock, idle);
        controller.run_once().unwrap();
        let id = controller.helper().received[0];

        std::thread::sleep(Duration::from_millis(30));
        controller.run_once().unwrap();
        assert_eq!(
            controller.helper().failed,
            vec![(vec![id], StatusCode::CONNECTOR_ERROR_INTERNAL)]
        );
        assert!(controller.connections().is_empty());
        assert_eq!(controller.pool.len(), 1);
    }

    #[test]
    fn poll_wakes_up_for_the_earliest_idle_deadline() {
        let idle = Duration::from_millis(100);
        let mut controller = Controller::new(
            Recorder::default(),
            ConnectionPool::new(4, true),
            ControllerSettings {
                sleep: Duration::from_secs(30),
                max_io_idle: idle,
            },
        )
        .unwrap();
        let mock = SharedMock::default();
        accept(&mut controller, &mock, idle);
        controller.run_once().unwrap();

        let timeout = controller.poll_timeout(Instant::now());
        assert!(timeout <= idle, "slept past the idle deadline: {timeout:?}");

        let started = Instant::now();
        for _ in 0..3 {
            if controller.connections().is_empty() {
                break;
            }
            controller.run_once().unwrap();
        }
        assert!(controller.connections().is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn peer_close_recycles_connection() {
        let mut controller = controller(Duration::ZERO);
        let mock = SharedMock::default();
        mock.lock().eof = true;
        accept(&mut controller, &mock, Duration::ZERO);

        controller.run_once().unwrap();
        assert!(controller.connections().is_empty());
        assert!(controller.helper().failed.is_empty());
    }
}
