use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};

use mio::event::{Event, Source};
use mio::{Interest, Registry, Token};

/// Readiness operations a registration can be interested in.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const READ: Ops = Ops(0b001);
    pub const WRITE: Ops = Ops(0b010);
    /// A pending non-blocking connect; reported through writability.
    pub const CONNECT: Ops = Ops(0b100);

    pub fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The selector interest, or `None` when nothing is wanted.
    pub fn to_interest(self) -> Option<Interest> {
        let read = self.contains(Ops::READ).then_some(Interest::READABLE);
        let write = self
            .intersects(Ops::WRITE | Ops::CONNECT)
            .then_some(Interest::WRITABLE);
        match (read, write) {
            (Some(r), Some(w)) => Some(r | w),
            (r, w) => r.or(w),
        }
    }

    /// Readiness reported by an event. Errors and hang-ups wake both
    /// directions so each way observes the failure on its next call.
    pub fn from_event(event: &Event) -> Ops {
        let mut ops = Ops::NONE;
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            ops |= Ops::READ;
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            ops |= Ops::WRITE | Ops::CONNECT;
        }
        ops
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(Ops::READ, "READ"), (Ops::WRITE, "WRITE"), (Ops::CONNECT, "CONNECT")]
            .into_iter()
            .filter(|(op, _)| self.contains(*op))
            .map(|(_, name)| name)
            .collect();
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Where a registration stands with the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Bound but not yet known to the selector
    New,
    /// Selector has the current interest
    Registered,
    /// Interest changed since the last (re-)registration
    Updated,
    /// Interest is empty and the source is not registered
    Deregistered,
    /// Terminal
    Cancelled,
}

/// Result of pushing a registration into the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    /// The selector lost track of the source; register it afresh on the
    /// next turn.
    Requeued,
}

/// Receives the readiness of a registration. The listener owns its
/// registration and records the readiness there with
/// [`Registration::set_ready`].
pub trait SelectionListener {
    fn on_selected(&mut self, ready: Ops);
}

/// Binding of a selectable source to its interest and listener.
///
/// The listener is whoever owns the token: the controller looks the token
/// up when an event comes in and hands the readiness to it.
#[derive(Debug)]
pub struct Registration {
    token: Token,
    interest: Ops,
    registered: Ops,
    ready: Ops,
    state: RegistrationState,
}

impl Registration {
    pub fn bind(token: Token, interest: Ops) -> Self {
        Self {
            token,
            interest,
            registered: Ops::NONE,
            ready: Ops::NONE,
            state: RegistrationState::New,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn interest(&self) -> Ops {
        self.interest
    }

    /// Readiness of the last selection.
    pub fn ready(&self) -> Ops {
        self.ready
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Changes the interest. Returns `false`, and leaves the selector
    /// alone, when the interest is unchanged.
    pub fn update(&mut self, interest: Ops) -> bool {
        if interest == self.interest || self.state == RegistrationState::Cancelled {
            return false;
        }
        self.interest = interest;
        self.state = match self.state {
            RegistrationState::Registered => RegistrationState::Updated,
            RegistrationState::Deregistered => RegistrationState::New,
            other => other,
        };
        true
    }

    /// Records the readiness of the last selection.
    pub fn set_ready(&mut self, ready: Ops) {
        self.ready = ready;
    }

    /// Pushes the pending registration or interest change to the selector.
    ///
    /// A re-registration rejected because the selector no longer knows the
    /// source (it was closed and reopened, or deregistered concurrently) is
    /// not an error: the registration turns `New` again and is requeued.
    pub fn apply(&mut self, registry: &Registry, source: &mut dyn Source) -> io::Result<Applied> {
        let wanted = self.interest.to_interest();
        match (self.state, wanted) {
            (RegistrationState::New, None) => {
                self.state = RegistrationState::Deregistered;
                Ok(Applied::Done)
            }
            (RegistrationState::New, Some(interest)) => {
                match registry.register(&mut *source, self.token, interest) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        registry.reregister(&mut *source, self.token, interest)?;
                    }
                    Err(e) => return Err(e),
                }
                self.registered = self.interest;
                self.state = RegistrationState::Registered;
                Ok(Applied::Done)
            }
            (RegistrationState::Updated, None) => {
                match registry.deregister(&mut *source) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                    _ => {}
                }
                self.registered = Ops::NONE;
                self.state = RegistrationState::Deregistered;
                Ok(Applied::Done)
            }
            (RegistrationState::Updated, Some(interest)) => {
                if self.registered.to_interest() == Some(interest) {
                    self.state = RegistrationState::Registered;
                    return Ok(Applied::Done);
                }
                match registry.reregister(&mut *source, self.token, interest) {
                    Ok(()) => {
                        self.registered = self.interest;
                        self.state = RegistrationState::Registered;
                        Ok(Applied::Done)
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::debug!(token = self.token.0, "Registration lost, requeued");
                        self.registered = Ops::NONE;
                        self.state = RegistrationState::New;
                        Ok(Applied::Requeued)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(Applied::Done),
        }
    }

    /// Removes the source from the selector for good.
    pub fn cancel(&mut self, registry: &Registry, source: &mut dyn Source) {
        if matches!(
            self.state,
            RegistrationState::Registered | RegistrationState::Updated
        ) {
            if let Err(e) = registry.deregister(&mut *source) {
                tracing::debug!(token = self.token.0, error = %e, "Unable to deregister");
            }
        }
        self.registered = Ops::NONE;
        self.state = RegistrationState::Cancelled;
    }

    /// Back to a fresh binding, for a recycled connection.
    pub fn rebind(&mut self, token: Token, interest: Ops) {
        *self = Registration::bind(token, interest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_interest_is_not_an_update() {
        let mut registration = Registration::bind(Token(7), Ops::READ);
        assert!(!registration.update(Ops::READ));
        assert_eq!(registration.state(), RegistrationState::New);
        assert!(registration.update(Ops::READ | Ops::WRITE));
    }

    #[test]
    fn connect_maps_to_writable() {
        assert_eq!(Ops::CONNECT.to_interest(), Some(Interest::WRITABLE));
        assert_eq!(
            (Ops::READ | Ops::WRITE).to_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert_eq!(Ops::NONE.to_interest(), None);
    }

    #[test]
    fn registers_and_reregisters_with_a_real_selector() {
        let poll = mio::Poll::new().unwrap();
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut listener = mio::net::TcpListener::bind(addr).unwrap();

        let mut registration = Registration::bind(Token(3), Ops::READ);
        assert_eq!(
            registration.apply(poll.registry(), &mut listener).unwrap(),
            Applied::Done
        );
        assert_eq!(registration.state(), RegistrationState::Registered);

        assert!(registration.update(Ops::READ | Ops::WRITE));
        assert_eq!(registration.state(), RegistrationState::Updated);
        registration.apply(poll.registry(), &mut listener).unwrap();
        assert_eq!(registration.state(), RegistrationState::Registered);

        assert!(registration.update(Ops::NONE));
        registration.apply(poll.registry(), &mut listener).unwrap();
        assert_eq!(registration.state(), RegistrationState::Deregistered);
    }

    // epoll reports a lost source as NotFound; kqueue re-adds it silently
    #[cfg(target_os = "linux")]
    #[test]
    fn lost_source_is_requeued_then_registered_afresh() {
        let poll = mio::Poll::new().unwrap();
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut listener = mio::net::TcpListener::bind(addr).unwrap();

        let mut registration = Registration::bind(Token(4), Ops::READ);
        registration.apply(poll.registry(), &mut listener).unwrap();
        assert_eq!(registration.state(), RegistrationState::Registered);

        poll.registry().deregister(&mut listener).unwrap();
        assert!(registration.update(Ops::READ | Ops::WRITE));
        assert_eq!(
            registration.apply(poll.registry(), &mut listener).unwrap(),
            Applied::Requeued
        );
        assert_eq!(registration.state(), RegistrationState::New);

        assert_eq!(
            registration.apply(poll.registry(), &mut listener).unwrap(),
            Applied::Done
        );
        assert_eq!(registration.state(), RegistrationState::Registered);
        assert_eq!(registration.interest(), Ops::READ | Ops::WRITE);
    }
}
