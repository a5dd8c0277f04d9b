use crate::anp::Msg;
use crate::error::{Error, NetError, NetResult};
use crate::net::selector::Selector;
use crate::net::transport::Transport;
use keel::logging;
use keel::rendezvous;
use keel::secret::{self, Secret, SECRET_LEN};
use keel::ChannelId;
use mio::net::TcpStream;
use mio::Token;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;

/// Life cycle of a thread channel. Transitions are strictly forward;
/// `Closed` is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Initial,
    Connecting,
    Handshake,
    Open,
    Closed,
}

enum Side {
    /// Connecting side: reads the rendezvous file and writes the secret.
    Client { rendezvous_dir: PathBuf },
    /// Accepting side: reads the peer's secret against a deadline.
    Server { deadline: Instant },
}

/// What a channel produced during one worker turn.
pub struct TurnEvents {
    /// The channel transitioned to `Open` this turn.
    pub opened: bool,
    /// Complete messages received this turn, in arrival order.
    pub received: Vec<Msg>,
}

impl TurnEvents {
    fn none() -> TurnEvents {
        TurnEvents {
            opened: false,
            received: Vec::new(),
        }
    }
}

/// Worker-side end of a single channel: owns the socket, the transport and
/// the handshake sub-state-machine.
pub struct ThreadChannel {
    id: ChannelId,
    token: Token,
    state: ChannelState,
    side: Side,
    sock: Option<TcpStream>,
    transport: Option<Transport>,
    send_queue: VecDeque<Msg>,
    secret: Secret,
    hs_progress: usize,
    hs_buf: [u8; SECRET_LEN],
    log: logging::Logger,
}

impl ThreadChannel {
    /// Creates a client channel. The rendezvous file is read on the
    /// Initial → Connecting transition, freshly on every attempt.
    pub fn client(
        id: ChannelId,
        token: Token,
        rendezvous_dir: PathBuf,
        log: &logging::Logger,
    ) -> ThreadChannel {
        ThreadChannel {
            id,
            token,
            state: ChannelState::Initial,
            side: Side::Client { rendezvous_dir },
            sock: None,
            transport: None,
            send_queue: VecDeque::new(),
            secret: [0; SECRET_LEN],
            hs_progress: 0,
            hs_buf: [0; SECRET_LEN],
            log: log.new(logging::o!("channel_id" => id)),
        }
    }

    /// Creates a server channel around an accepted socket. The handshake
    /// must complete before `deadline`.
    pub fn server(
        id: ChannelId,
        token: Token,
        sock: TcpStream,
        secret: Secret,
        deadline: Instant,
        log: &logging::Logger,
    ) -> ThreadChannel {
        ThreadChannel {
            id,
            token,
            state: ChannelState::Handshake,
            side: Side::Server { deadline },
            sock: Some(sock),
            transport: None,
            send_queue: VecDeque::new(),
            secret,
            hs_progress: 0,
            hs_buf: [0; SECRET_LEN],
            log: log.new(logging::o!("channel_id" => id)),
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Queues an outbound message. Messages drain into the transport's send
    /// slot in order while the channel is open.
    pub fn queue_message(&mut self, msg: Msg) {
        self.send_queue.push_back(msg);
    }

    fn is_client(&self) -> bool {
        matches!(self.side, Side::Client { .. })
    }

    /// Contributes this channel's interest and timeout requirements to the
    /// turn's selector, running state-specific setup first.
    pub fn before_select(&mut self, sel: &mut Selector, now: Instant) -> NetResult<()> {
        match self.state {
            ChannelState::Initial => self.start_connect(sel)?,
            ChannelState::Connecting => {
                let sock = self.sock.as_ref().expect("Connecting channel has no socket");
                sel.add_write(sock, self.token)?;
                // Revisit promptly: connect completion is polled, not edge
                // driven.
                sel.lower_timeout_ms(0);
            }
            ChannelState::Handshake => match &self.side {
                Side::Client { .. } => {
                    let sock = self.sock.as_ref().expect("Handshake channel has no socket");
                    sel.add_write(sock, self.token)?;
                }
                Side::Server { deadline } => {
                    if now >= *deadline {
                        return Err(NetError::Fatal(Error::eanp_conn("handshake timeout")));
                    }

                    let remaining = deadline.duration_since(now);
                    sel.lower_timeout_ms(remaining.as_millis() as u64);

                    let sock = self.sock.as_ref().expect("Handshake channel has no socket");
                    sel.add_read(sock, self.token)?;
                }
            },
            ChannelState::Open => {
                let transport = self.transport.as_mut().expect("Open channel has no transport");

                if !transport.is_receiving() {
                    transport.begin_recv();
                }

                if !transport.is_sending() {
                    if let Some(msg) = self.send_queue.pop_front() {
                        transport.send_message(&msg);
                    }
                }

                let sock = self.sock.as_ref().expect("Open channel has no socket");
                transport.update_selector(sel, sock, self.token)?;
            }
            ChannelState::Closed => {}
        }

        Ok(())
    }

    /// Reacts to the turn's readiness events.
    pub fn after_select(&mut self, sel: &Selector, _now: Instant) -> NetResult<TurnEvents> {
        match self.state {
            ChannelState::Connecting => {
                if sel.in_write(self.token) {
                    self.check_connected()?;
                }

                if self.state == ChannelState::Handshake {
                    // Connection completed this turn: start pushing the
                    // secret without waiting for another readiness pass.
                    return self.client_handshake();
                }

                Ok(TurnEvents::none())
            }
            ChannelState::Handshake => {
                if self.is_client() {
                    self.client_handshake()
                } else {
                    self.server_handshake()
                }
            }
            ChannelState::Open => {
                let received = self.open_turn()?;
                Ok(TurnEvents {
                    opened: false,
                    received,
                })
            }
            ChannelState::Initial | ChannelState::Closed => Ok(TurnEvents::none()),
        }
    }

    /// Closes the socket and marks the channel terminal. Idempotent.
    pub fn close(&mut self, sel: &mut Selector) {
        if self.state == ChannelState::Closed {
            return;
        }

        if let Some(sock) = self.sock.take() {
            sel.forget(&sock, self.token);
            drop(sock.shutdown(Shutdown::Both));
        }

        self.transport = None;
        self.send_queue.clear();
        self.state = ChannelState::Closed;

        logging::debug!(self.log, "thread channel closed");
    }

    /// Initial → Connecting: read the rendezvous file and begin a
    /// non-blocking connect to the published loopback port.
    fn start_connect(&mut self, sel: &mut Selector) -> NetResult<()> {
        let dir = match &self.side {
            Side::Client { rendezvous_dir } => rendezvous_dir.clone(),
            Side::Server { .. } => panic!("Server channel in Initial state"),
        };

        let info = rendezvous::read(&dir).map_err(|err| {
            NetError::Fatal(Error::generic(format!("rendezvous file: {}", err)))
        })?;

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), info.port);
        let sock = TcpStream::connect(&addr)
            .map_err(|err| NetError::Fatal(Error::eanp_conn(format!("connect: {}", err))))?;

        logging::debug!(self.log, "connecting"; "port" => info.port);

        self.secret = info.secret;
        self.sock = Some(sock);
        self.state = ChannelState::Connecting;

        let sock = self.sock.as_ref().expect("Socket just stored");
        sel.add_write(sock, self.token)?;
        sel.lower_timeout_ms(0);

        Ok(())
    }

    /// Connecting → Handshake once the socket reports connected; fatal if
    /// the connect failed.
    fn check_connected(&mut self) -> NetResult<()> {
        let sock = self.sock.as_ref().expect("Connecting channel has no socket");

        if let Some(err) = sock
            .take_error()
            .map_err(|err| NetError::Fatal(Error::eanp_conn(format!("connect: {}", err))))?
        {
            return Err(NetError::Fatal(Error::eanp_conn(format!(
                "could not connect: {}",
                err
            ))));
        }

        match sock.peer_addr() {
            Ok(_) => {
                logging::debug!(self.log, "connected, starting handshake");
                self.state = ChannelState::Handshake;
                Ok(())
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(NetError::Fatal(Error::eanp_conn(format!(
                "could not connect: {}",
                err
            )))),
        }
    }

    /// Handshake → Open: write the remaining secret bytes.
    fn client_handshake(&mut self) -> NetResult<TurnEvents> {
        let sock = self.sock.as_mut().expect("Handshake channel has no socket");

        while self.hs_progress < SECRET_LEN {
            match sock.write(&self.secret[self.hs_progress..]) {
                Ok(0) => {
                    return Err(NetError::Fatal(Error::eanp_conn(
                        "connection closed during handshake",
                    )))
                }
                Ok(count) => self.hs_progress += count,
                Err(err) => match NetError::from(err) {
                    NetError::Wait => return Ok(TurnEvents::none()),
                    fatal => return Err(fatal),
                },
            }
        }

        self.open();

        Ok(TurnEvents {
            opened: true,
            received: Vec::new(),
        })
    }

    /// Reads secret bytes until the expected length, then verifies them in
    /// constant time. A mismatch is fatal.
    fn server_handshake(&mut self) -> NetResult<TurnEvents> {
        let sock = self.sock.as_mut().expect("Handshake channel has no socket");

        while self.hs_progress < SECRET_LEN {
            match sock.read(&mut self.hs_buf[self.hs_progress..]) {
                Ok(0) => {
                    return Err(NetError::Fatal(Error::eanp_conn(
                        "connection closed during handshake",
                    )))
                }
                Ok(count) => self.hs_progress += count,
                Err(err) => match NetError::from(err) {
                    NetError::Wait => return Ok(TurnEvents::none()),
                    fatal => return Err(fatal),
                },
            }
        }

        if !secret::ct_eq(&self.hs_buf, &self.secret) {
            return Err(NetError::Fatal(Error::perm_denied(
                "handshake secret mismatch",
            )));
        }

        self.open();

        Ok(TurnEvents {
            opened: true,
            received: Vec::new(),
        })
    }

    fn open(&mut self) {
        let mut transport = Transport::new();
        transport.begin_recv();

        self.transport = Some(transport);
        self.state = ChannelState::Open;

        logging::debug!(self.log, "channel open");
    }

    /// One open-state turn: run transport I/O, batch completed messages and
    /// keep the send slot fed from the queue.
    fn open_turn(&mut self) -> NetResult<Vec<Msg>> {
        let sock = self.sock.as_mut().expect("Open channel has no socket");
        let transport = self.transport.as_mut().expect("Open channel has no transport");

        let mut received = Vec::new();

        loop {
            transport.do_transfer(sock).map_err(NetError::Fatal)?;

            let mut progressed = false;

            if transport.done_receiving() {
                received.push(transport.take_received());
                transport.begin_recv();
                progressed = true;
            }

            if !transport.is_sending() {
                if let Some(msg) = self.send_queue.pop_front() {
                    transport.send_message(&msg);
                    progressed = true;
                }
            }

            if !progressed {
                return Ok(received);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::time::Duration;

    fn accept_pair(listener: &TcpListener) -> (std::net::TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let mio_stream = TcpStream::connect(&addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (accepted, mio_stream)
    }

    fn server_channel(deadline: Instant) -> (std::net::TcpStream, ThreadChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (peer, sock) = accept_pair(&listener);

        let channel = ThreadChannel::server(
            1,
            Token(3),
            sock,
            [7u8; SECRET_LEN],
            deadline,
            &logging::discard(),
        );

        (peer, channel)
    }

    #[test]
    fn test_server_handshake_success() {
        let (mut peer, mut channel) =
            server_channel(Instant::now() + Duration::from_millis(5_000));
        let mut sel = Selector::new(8).unwrap();

        peer.write_all(&[7u8; SECRET_LEN]).unwrap();

        sel.begin_turn();
        channel.before_select(&mut sel, Instant::now()).unwrap();
        sel.lower_timeout_ms(1_000);
        sel.wait().unwrap();

        let events = channel.after_select(&sel, Instant::now()).unwrap();

        assert!(events.opened);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[test]
    fn test_server_handshake_partial_then_complete() {
        let (mut peer, mut channel) =
            server_channel(Instant::now() + Duration::from_millis(5_000));
        let mut sel = Selector::new(8).unwrap();

        peer.write_all(&[7u8; 6]).unwrap();

        sel.begin_turn();
        channel.before_select(&mut sel, Instant::now()).unwrap();
        sel.lower_timeout_ms(500);
        sel.wait().unwrap();

        let events = channel.after_select(&sel, Instant::now()).unwrap();
        assert!(!events.opened);
        assert_eq!(channel.state(), ChannelState::Handshake);

        peer.write_all(&[7u8; SECRET_LEN - 6]).unwrap();

        sel.begin_turn();
        channel.before_select(&mut sel, Instant::now()).unwrap();
        sel.lower_timeout_ms(500);
        sel.wait().unwrap();

        let events = channel.after_select(&sel, Instant::now()).unwrap();
        assert!(events.opened);
    }

    #[test]
    fn test_server_handshake_mismatch() {
        let (mut peer, mut channel) =
            server_channel(Instant::now() + Duration::from_millis(5_000));
        let mut sel = Selector::new(8).unwrap();

        peer.write_all(&[8u8; SECRET_LEN]).unwrap();

        sel.begin_turn();
        channel.before_select(&mut sel, Instant::now()).unwrap();
        sel.lower_timeout_ms(1_000);
        sel.wait().unwrap();

        match channel.after_select(&sel, Instant::now()) {
            Err(NetError::Fatal(err)) => assert!(err.message.contains("secret mismatch")),
            other => panic!("Expected fatal mismatch, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_server_handshake_deadline() {
        let (_peer, mut channel) = server_channel(Instant::now() - Duration::from_millis(1));
        let mut sel = Selector::new(8).unwrap();

        sel.begin_turn();

        match channel.before_select(&mut sel, Instant::now()) {
            Err(NetError::Fatal(err)) => assert!(err.message.contains("handshake timeout")),
            other => panic!("Expected timeout, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_server_handshake_lowers_timeout() {
        let now = Instant::now();
        let (_peer, mut channel) = server_channel(now + Duration::from_millis(2_000));
        let mut sel = Selector::new(8).unwrap();

        sel.begin_turn();
        channel.before_select(&mut sel, now).unwrap();

        assert!(sel.timeout_us() <= 2_000_000);
    }

    #[test]
    fn test_closed_is_terminal() {
        let (_peer, mut channel) =
            server_channel(Instant::now() + Duration::from_millis(5_000));
        let mut sel = Selector::new(8).unwrap();

        channel.close(&mut sel);
        assert_eq!(channel.state(), ChannelState::Closed);

        channel.close(&mut sel);
        assert_eq!(channel.state(), ChannelState::Closed);

        sel.begin_turn();
        channel.before_select(&mut sel, Instant::now()).unwrap();

        let events = channel.after_select(&sel, Instant::now()).unwrap();
        assert!(!events.opened);
        assert!(events.received.is_empty());
    }

    #[test]
    fn test_client_initial_err_missing_rendezvous() {
        let dir = std::env::temp_dir().join(format!(
            "kanp-chan-missing-{}",
            std::process::id()
        ));
        drop(std::fs::remove_dir_all(&dir));

        let mut channel = ThreadChannel::client(1, Token(3), dir, &logging::discard());
        let mut sel = Selector::new(8).unwrap();

        sel.begin_turn();

        match channel.before_select(&mut sel, Instant::now()) {
            Err(NetError::Fatal(err)) => assert!(err.message.contains("rendezvous")),
            other => panic!("Expected rendezvous failure, got {:?}", other.is_ok()),
        }
    }
}
