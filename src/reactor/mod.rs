//! The readiness reactor: one thread polling the sockets of a connector and
//! driving its connections.

pub mod controller;
pub mod registration;

use mio::Token;

pub use controller::{Connections, Context, Controller, ControllerSettings, Helper, StopHandle};
pub use registration::{Ops, Registration, SelectionListener};

/// Wakes the poll when the application hands work over.
pub const WAKER: Token = Token(0);
/// The server's listening socket.
pub const LISTENER: Token = Token(1);
/// Connections are numbered from here.
pub const FIRST_CONNECTION: usize = 2;
