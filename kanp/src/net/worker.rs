use crate::anp::Msg;
use crate::config::Config;
use crate::error::{Error, NetError};
use crate::net::channel::ThreadChannel;
use crate::net::mailbox::Mailbox;
use crate::net::selector::Selector;
use indexmap::IndexMap;
use keel::logging;
use keel::rendezvous;
use keel::secret::{self, Secret};
use keel::ChannelId;
use mio::net::TcpListener;
use mio::{Registration, Token};
use net2::TcpBuilder;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAKE_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const TOKEN_BASE: usize = 2;
const EVENTS_CAPACITY: usize = 1024;

/// Which end of the rendezvous this worker drives.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    Server,
    Client,
}

/// A callable posted from the broker thread into the worker loop.
pub type WorkerTask = Box<dyn FnOnce(&mut Worker) + Send + 'static>;

/// Callbacks from the worker to the owner side. Implementations marshal
/// onto the owner thread; the worker calls them from its own thread.
pub trait WorkerSink: Send {
    /// A channel finished its handshake and is ready for traffic.
    fn channel_opened(&self, id: ChannelId);
    /// A channel was torn down. Fires for every channel the worker ever
    /// reported or failed, including during cleanup.
    fn channel_closed(&self, id: ChannelId, err: Error);
    /// A batch of complete messages arrived on an open channel.
    fn messages_received(&self, id: ChannelId, msgs: Vec<Msg>);
    /// The worker loop ended: `None` after cooperative cancellation,
    /// `Some` after a fatal error.
    fn finished(&self, err: Option<Error>);
}

enum Role {
    Server {
        listener: TcpListener,
        secret: Secret,
        _rendezvous: rendezvous::Guard,
    },
    Client {
        connect_requested: bool,
    },
}

/// Owner-side handle to a spawned worker thread.
pub struct WorkerHandle {
    mailbox: Arc<Mailbox<WorkerTask>>,
    cancel: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Posts a callable for the worker's next turn.
    pub fn post(&self, task: WorkerTask) {
        self.mailbox.post(task);
    }

    /// Requests cooperative termination and wakes the loop.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        self.mailbox.wake();
    }

    /// Joins the worker thread. Call only after `finished` was observed.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            drop(handle.join());
        }
    }
}

/// Spawns a worker thread. Server workers bind their listening socket and
/// publish the rendezvous file before entering the loop; a failure there is
/// reported through `finished` without the loop ever starting.
pub fn spawn(
    cfg: Config,
    mode: Mode,
    sink: Box<dyn WorkerSink>,
    log: logging::Logger,
) -> io::Result<WorkerHandle> {
    let (mailbox, registration) = Mailbox::new();
    let mailbox = Arc::new(mailbox);
    let cancel = Arc::new(AtomicBool::new(false));

    let thread = {
        let mailbox = mailbox.clone();
        let cancel = cancel.clone();

        thread::Builder::new().name("kanp-worker".to_string()).spawn(move || {
            match Worker::new(cfg, mode, registration, mailbox, cancel, sink, log) {
                Ok(worker) => worker.run(),
                Err(failure) => failure.sink.finished(Some(failure.error)),
            }
        })?
    };

    Ok(WorkerHandle {
        mailbox,
        cancel,
        thread: Some(thread),
    })
}

struct SpawnFailure {
    sink: Box<dyn WorkerSink>,
    error: Error,
}

/// The worker: a single thread owning all sockets, transports and thread
/// channels, multiplexed through one selector.
pub struct Worker {
    sel: Selector,
    _wake: Registration,
    mailbox: Arc<Mailbox<WorkerTask>>,
    cancel: Arc<AtomicBool>,
    sink: Box<dyn WorkerSink>,
    channels: IndexMap<ChannelId, ThreadChannel>,
    next_id: ChannelId,
    role: Role,
    cfg: Config,
    log: logging::Logger,
}

impl Worker {
    fn new(
        cfg: Config,
        mode: Mode,
        registration: Registration,
        mailbox: Arc<Mailbox<WorkerTask>>,
        cancel: Arc<AtomicBool>,
        sink: Box<dyn WorkerSink>,
        log: logging::Logger,
    ) -> Result<Worker, SpawnFailure> {
        match Self::init(&cfg, mode, &registration, &log) {
            Ok((sel, role)) => Ok(Worker {
                sel,
                _wake: registration,
                mailbox,
                cancel,
                sink,
                channels: IndexMap::new(),
                next_id: 1,
                role,
                cfg,
                log,
            }),
            Err(error) => Err(SpawnFailure { sink, error }),
        }
    }

    fn init(
        cfg: &Config,
        mode: Mode,
        registration: &Registration,
        log: &logging::Logger,
    ) -> Result<(Selector, Role), Error> {
        let mut sel = Selector::new(EVENTS_CAPACITY).map_err(init_err)?;
        sel.register_persistent(registration, WAKE_TOKEN).map_err(init_err)?;

        let role = match mode {
            Mode::Client => Role::Client {
                connect_requested: false,
            },
            Mode::Server => {
                let builder = TcpBuilder::new_v4().map_err(init_err)?;
                builder
                    .bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
                    .map_err(init_err)?;

                let std_listener = builder.listen(cfg.listen_backlog).map_err(init_err)?;
                std_listener.set_nonblocking(true).map_err(init_err)?;

                let addr = std_listener.local_addr().map_err(init_err)?;
                let listener = TcpListener::from_std(std_listener).map_err(init_err)?;

                let secret = secret::generate();
                let guard = rendezvous::publish(&cfg.rendezvous_dir, addr.port(), &secret, log)
                    .map_err(init_err)?;

                logging::info!(log, "server worker listening"; "port" => addr.port());

                Role::Server {
                    listener,
                    secret,
                    _rendezvous: guard,
                }
            }
        };

        Ok((sel, role))
    }

    /// Runs the loop to completion, then tears everything down and reports
    /// the outcome through the sink.
    pub fn run(mut self) {
        logging::debug!(self.log, "worker loop starting");

        let result = loop {
            match self.turn() {
                Ok(false) => {}
                Ok(true) => break None,
                Err(err) => break Some(err),
            }
        };

        match &result {
            Some(err) => logging::error!(self.log, "worker terminated"; "error" => %err),
            None => logging::debug!(self.log, "worker cancelled"),
        }

        self.cleanup();

        // Release the listening socket and the rendezvous file before the
        // owner learns the worker is gone.
        let Worker { sink, role, .. } = self;
        drop(role);

        sink.finished(result);
    }

    /// One turn of the loop. Returns true once cancellation is observed.
    fn turn(&mut self) -> Result<bool, Error> {
        self.sel.begin_turn();

        self.before_select()?;

        self.sel
            .wait()
            .map_err(|err| Error::generic(format!("selector wait failed: {}", err)))?;

        self.mailbox.clear_wake();

        if self.cancel.load(Ordering::Acquire) {
            return Ok(true);
        }

        for task in self.mailbox.drain() {
            task(self);
        }

        self.after_select();
        self.accept_pending()?;

        Ok(false)
    }

    fn before_select(&mut self) -> Result<(), Error> {
        if let Role::Server { listener, .. } = &self.role {
            self.sel
                .add_read(listener, LISTENER_TOKEN)
                .map_err(|err| Error::generic(format!("listener watch failed: {}", err)))?;
        }

        let connect = match &mut self.role {
            Role::Client { connect_requested } => mem::take(connect_requested),
            Role::Server { .. } => false,
        };

        if connect {
            self.spawn_client_channel();
        }

        let now = Instant::now();
        let mut failed = Vec::new();

        for (id, channel) in self.channels.iter_mut() {
            match channel.before_select(&mut self.sel, now) {
                Ok(()) | Err(NetError::Wait) => {}
                Err(NetError::Fatal(err)) => failed.push((*id, err)),
            }
        }

        for (id, err) in failed {
            self.close_channel(id, err);
        }

        Ok(())
    }

    fn after_select(&mut self) {
        let now = Instant::now();

        let mut opened = Vec::new();
        let mut batches = Vec::new();
        let mut failed = Vec::new();

        for (id, channel) in self.channels.iter_mut() {
            match channel.after_select(&self.sel, now) {
                Ok(events) => {
                    if events.opened {
                        opened.push(*id);
                    }

                    if !events.received.is_empty() {
                        batches.push((*id, events.received));
                    }
                }
                Err(NetError::Wait) => {}
                Err(NetError::Fatal(err)) => failed.push((*id, err)),
            }
        }

        // Open notifications precede any message batch from the same turn.
        for id in opened {
            self.sink.channel_opened(id);
        }

        for (id, msgs) in batches {
            self.sink.messages_received(id, msgs);
        }

        for (id, err) in failed {
            self.close_channel(id, err);
        }
    }

    /// Accepts at most one pending connection per turn.
    fn accept_pending(&mut self) -> Result<(), Error> {
        let (sock, peer, secret) = match &self.role {
            Role::Server {
                listener, secret, ..
            } => match listener.accept() {
                Ok((sock, peer)) => (sock, peer, *secret),
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(());
                    }
                    return Err(Error::generic(format!("accept failed: {}", err)));
                }
            },
            Role::Client { .. } => return Ok(()),
        };

        let id = self.next_id;
        self.next_id += 1;

        let token = Token(TOKEN_BASE + id as usize);
        let deadline = Instant::now() + Duration::from_millis(self.cfg.handshake_timeout_ms);
        let channel = ThreadChannel::server(id, token, sock, secret, deadline, &self.log);

        logging::debug!(self.log, "accepted connection"; "peer" => %peer, "channel_id" => id);
        self.channels.insert(id, channel);

        Ok(())
    }

    fn spawn_client_channel(&mut self) {
        // A client worker owns at most one channel at a time.
        if !self.channels.is_empty() {
            logging::debug!(self.log, "connect requested while a channel exists");
            return;
        }

        let id = self.next_id;
        self.next_id += 1;

        let token = Token(TOKEN_BASE + id as usize);
        let channel =
            ThreadChannel::client(id, token, self.cfg.rendezvous_dir.clone(), &self.log);

        logging::debug!(self.log, "starting connection attempt"; "channel_id" => id);
        self.channels.insert(id, channel);
    }

    fn close_channel(&mut self, id: ChannelId, err: Error) {
        if let Some(mut channel) = self.channels.shift_remove(&id) {
            channel.close(&mut self.sel);
            logging::info!(self.log, "closing channel"; "channel_id" => id, "error" => %err);
            self.sink.channel_closed(id, err);
        }
    }

    fn cleanup(&mut self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();

        for id in ids {
            self.close_channel(id, Error::interrupted("worker shutting down"));
        }

        logging::debug!(self.log, "worker cleanup complete");
    }

    /// Queues an outbound message on a channel. Messages for channels the
    /// worker no longer owns are dropped.
    pub fn queue_message(&mut self, id: ChannelId, msg: Msg) {
        match self.channels.get_mut(&id) {
            Some(channel) => channel.queue_message(msg),
            None => {
                logging::debug!(self.log, "dropping message for unknown channel"; "channel_id" => id)
            }
        }
    }

    /// Arms the connect flag; the next turn attempts a new channel. Ignored
    /// on server workers.
    pub fn request_connect(&mut self) {
        if let Role::Client { connect_requested } = &mut self.role {
            *connect_requested = true;
        }
    }

    /// Tears down a channel on behalf of the owner.
    pub fn close_channel_request(&mut self, id: ChannelId) {
        self.close_channel(id, Error::generic("closed by owner"));
    }
}

fn init_err(err: io::Error) -> Error {
    Error::generic(format!("worker init: {}", err))
}
