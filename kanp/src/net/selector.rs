use hashbrown::{HashMap, HashSet};
use mio::event::Evented;
use mio::unix::UnixReady;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::time::Duration;

/// Timeout sentinel meaning "block until an event arrives".
pub const INFINITE: u64 = u64::MAX;

/// Readiness-selection facade over non-blocking sockets.
///
/// Each worker turn starts with `begin_turn`, after which channels declare
/// interest with `add_read`/`add_write` and may shrink the wait timeout.
/// `wait` then blocks until readiness or timeout, and the `in_*` predicates
/// answer for the returned event set. A socket added to the read or write
/// set is implicitly observed for errors as well, so connection failures are
/// always reported.
pub struct Selector {
    poll: Poll,
    events: Events,
    ready: HashMap<Token, Ready>,
    interest: HashMap<Token, Ready>,
    registered: HashSet<Token>,
    timeout_us: u64,
}

impl Selector {
    pub fn new(capacity: usize) -> io::Result<Selector> {
        Ok(Selector {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            ready: HashMap::new(),
            interest: HashMap::new(),
            registered: HashSet::new(),
            timeout_us: INFINITE,
        })
    }

    /// Starts a new turn: interest and readiness from the previous turn are
    /// discarded and the timeout resets to infinite.
    pub fn begin_turn(&mut self) {
        self.interest.clear();
        self.ready.clear();
        self.timeout_us = INFINITE;
    }

    /// Registers a handle that stays armed for reads across turns, bypassing
    /// the per-turn interest bookkeeping. Used for the wake-up registration.
    pub fn register_persistent(&mut self, handle: &dyn Evented, token: Token) -> io::Result<()> {
        self.poll
            .register(handle, token, Ready::readable(), PollOpt::level())
    }

    /// Adds the handle to this turn's read set.
    pub fn add_read(&mut self, handle: &dyn Evented, token: Token) -> io::Result<()> {
        self.watch(handle, token, Ready::readable())
    }

    /// Adds the handle to this turn's write set.
    pub fn add_write(&mut self, handle: &dyn Evented, token: Token) -> io::Result<()> {
        self.watch(handle, token, Ready::writable())
    }

    fn watch(&mut self, handle: &dyn Evented, token: Token, bits: Ready) -> io::Result<()> {
        let merged = self.interest.get(&token).copied().unwrap_or_else(Ready::empty) | bits;
        self.interest.insert(token, merged);

        if self.registered.contains(&token) {
            self.poll.reregister(handle, token, merged, PollOpt::level())
        } else {
            self.registered.insert(token);
            self.poll.register(handle, token, merged, PollOpt::level())
        }
    }

    /// Drops a handle from the selector entirely. Must be called before the
    /// socket is closed.
    pub fn forget(&mut self, handle: &dyn Evented, token: Token) {
        if self.registered.remove(&token) {
            drop(self.poll.deregister(handle));
        }

        self.interest.remove(&token);
        self.ready.remove(&token);
    }

    /// Shrinks the stored timeout to at most `ms` milliseconds. The timeout
    /// never grows within a turn.
    pub fn lower_timeout_ms(&mut self, ms: u64) {
        let us = ms.saturating_mul(1_000);

        if us < self.timeout_us {
            self.timeout_us = us;
        }
    }

    #[inline]
    pub fn timeout_us(&self) -> u64 {
        self.timeout_us
    }

    /// Blocks until one or more handles become ready or the timeout elapses.
    pub fn wait(&mut self) -> io::Result<()> {
        let timeout = match self.timeout_us {
            INFINITE => None,
            us => Some(Duration::from_micros(us)),
        };

        self.poll.poll(&mut self.events, timeout)?;

        let events = &self.events;
        let ready = &mut self.ready;

        for event in events {
            let merged =
                ready.get(&event.token()).copied().unwrap_or_else(Ready::empty) | event.readiness();
            ready.insert(event.token(), merged);
        }

        Ok(())
    }

    fn readiness(&self, token: Token) -> Ready {
        self.ready.get(&token).copied().unwrap_or_else(Ready::empty)
    }

    fn carries_error(ready: Ready) -> bool {
        let unix = UnixReady::from(ready);
        unix.is_error() || unix.is_hup()
    }

    /// True if the handle is readable or errored.
    pub fn in_read(&self, token: Token) -> bool {
        let ready = self.readiness(token);
        ready.is_readable() || Self::carries_error(ready)
    }

    /// True if the handle is writable or errored.
    pub fn in_write(&self, token: Token) -> bool {
        let ready = self.readiness(token);
        ready.is_writable() || Self::carries_error(ready)
    }

    /// True if the handle is readable, writable or errored.
    pub fn in_read_or_write(&self, token: Token) -> bool {
        let ready = self.readiness(token);
        ready.is_readable() || ready.is_writable() || Self::carries_error(ready)
    }
}
