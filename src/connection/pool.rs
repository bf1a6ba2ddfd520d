use std::sync::Arc;

use mio::{Token, Waker};

use crate::connection::{Connection, ConnectionSettings};
use crate::io::transport::Transport;
use crate::way::Role;

/// Keeps closed connections around so their way buffers are reused by the
/// next connection instead of being reallocated.
#[derive(Debug)]
pub struct ConnectionPool {
    idle: Vec<Connection>,
    capacity: usize,
    enabled: bool,
}

impl ConnectionPool {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            idle: Vec::new(),
            capacity,
            enabled,
        }
    }

    /// Recycled connections waiting for reuse.
    pub fn len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }

    /// A connection in `Opening` state around `transport`, recycled when
    /// one is available.
    pub fn acquire(
        &mut self,
        token: Token,
        transport: Box<dyn Transport>,
        role: Arc<dyn Role>,
        address: String,
        settings: &ConnectionSettings,
        waker: Option<Arc<Waker>>,
    ) -> Connection {
        match self.idle.pop() {
            Some(mut connection) => {
                tracing::trace!(connection = token.0, "Reusing pooled connection");
                connection.reset(token, transport, role, address, settings.clone(), waker);
                connection
            }
            None => Connection::new(token, transport, role, address, settings.clone(), waker),
        }
    }

    /// Takes back a closed connection. Dropped when pooling is disabled or
    /// the pool is full.
    pub fn release(&mut self, mut connection: Connection) {
        connection.recycle();
        if self.enabled && self.idle.len() < self.capacity {
            self.idle.push(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::io::transport::mock::MockTransport;
    use crate::way::ServerRole;

    fn acquire(pool: &mut ConnectionPool, token: usize) -> Connection {
        pool.acquire(
            Token(token),
            Box::new(MockTransport::default()),
            Arc::new(ServerRole::default()),
            "127.0.0.1:1".into(),
            &ConnectionSettings::default(),
            None,
        )
    }

    #[test]
    fn released_connection_is_reused_fresh() {
        let mut pool = ConnectionPool::new(4, true);
        let mut connection = acquire(&mut pool, 2);
        connection.open();
        connection.close(false);
        pool.release(connection);
        assert_eq!(pool.len(), 1);

        let reused = acquire(&mut pool, 7);
        assert!(pool.is_empty());
        assert_eq!(reused.token(), Token(7));
        assert_eq!(reused.state(), ConnectionState::Opening);
        assert_eq!(reused.load_score(), 0);
    }

    #[test]
    fn pool_respects_capacity_and_switch() {
        let mut pool = ConnectionPool::new(1, true);
        let a = acquire(&mut pool, 2);
        let b = acquire(&mut pool, 3);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.len(), 1);

        let mut disabled = ConnectionPool::new(8, false);
        let c = acquire(&mut disabled, 4);
        disabled.release(c);
        assert!(disabled.is_empty());
    }
}
