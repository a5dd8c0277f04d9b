//! Owner-thread facade: the broker, its channels and the query correlation
//! layer. All callbacks fire on the thread pumping the UI dispatcher.

pub mod channel;
pub mod query;

pub use self::channel::{Channel, ChannelListener};
pub use self::query::{IncomingQuery, OutgoingQuery};

use crate::anp::Msg;
use crate::config::Config;
use crate::dispatch::UiDispatcher;
use crate::error::Error;
use crate::net::worker::{self, Mode, WorkerHandle, WorkerSink};
use hashbrown::HashMap;
use keel::logging;
use keel::ChannelId;
use std::mem;
use std::sync::{Arc, Mutex, Weak};

/// Broker-level events. Implementations run on the owner thread.
pub trait BrokerListener: Send {
    /// A channel completed its handshake. Fires before any message event on
    /// that channel.
    fn channel_open(&mut self, channel: &Arc<Channel>);
    /// The worker thread exited: `None` after a cooperative stop, `Some`
    /// after a fatal worker error.
    fn stopped(&mut self, err: Option<Error>);
}

enum Phase {
    Idle,
    Running(WorkerHandle),
    Stopped,
}

struct BrokerState {
    phase: Phase,
    stopping: bool,
    channels: HashMap<ChannelId, Arc<Channel>>,
    listener: Option<Box<dyn BrokerListener>>,
}

pub(crate) struct BrokerCore {
    mode: Mode,
    cfg: Config,
    dispatcher: Arc<dyn UiDispatcher>,
    log: logging::Logger,
    state: Mutex<BrokerState>,
}

/// The user-facing broker object. Owns the worker thread and the set of
/// logical channels; all public operations are non-blocking.
pub struct Broker {
    core: Arc<BrokerCore>,
}

impl Broker {
    pub fn server(cfg: Config, dispatcher: Arc<dyn UiDispatcher>, log: logging::Logger) -> Broker {
        Broker::with_mode(Mode::Server, cfg, dispatcher, log)
    }

    pub fn client(cfg: Config, dispatcher: Arc<dyn UiDispatcher>, log: logging::Logger) -> Broker {
        Broker::with_mode(Mode::Client, cfg, dispatcher, log)
    }

    fn with_mode(
        mode: Mode,
        cfg: Config,
        dispatcher: Arc<dyn UiDispatcher>,
        log: logging::Logger,
    ) -> Broker {
        Broker {
            core: Arc::new(BrokerCore {
                mode,
                cfg,
                dispatcher,
                log,
                state: Mutex::new(BrokerState {
                    phase: Phase::Idle,
                    stopping: false,
                    channels: HashMap::new(),
                    listener: None,
                }),
            }),
        }
    }

    pub fn set_listener(&self, listener: Box<dyn BrokerListener>) {
        self.core.lock_state().listener = Some(listener);
    }

    /// Spawns and starts the worker. Starting twice is an error.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.core.lock_state();

        if !matches!(state.phase, Phase::Idle) {
            return Err(Error::concurrent("broker already started"));
        }

        let sink = DispatcherSink {
            core: Arc::downgrade(&self.core),
            dispatcher: self.core.dispatcher.clone(),
        };

        let handle = worker::spawn(
            self.core.cfg.clone(),
            self.core.mode,
            Box::new(sink),
            self.core.log.new(logging::o!()),
        )
        .map_err(|err| Error::generic(format!("failed to spawn worker: {}", err)))?;

        state.phase = Phase::Running(handle);

        Ok(())
    }

    /// Requests worker termination and synthesizes interrupted closures on
    /// every open channel. Returns true iff the worker has already exited;
    /// callers wanting a synchronous stop wait for the `stopped` event and
    /// invoke this again.
    pub fn try_stop(&self) -> bool {
        let (channels, exited) = {
            let mut state = self.core.lock_state();
            state.stopping = true;

            if let Phase::Running(handle) = &state.phase {
                handle.cancel();
            }

            let channels: Vec<Arc<Channel>> = state.channels.values().cloned().collect();
            let exited = !matches!(state.phase, Phase::Running(_));

            (channels, exited)
        };

        for channel in channels {
            channel.close_with(Some(Error::interrupted("broker stopping")));
        }

        exited
    }

    /// Client brokers: ask the worker to attempt a connection on its next
    /// turn. Reconnection after a closed channel is driven by calling this
    /// again, typically from a rendezvous trigger watcher.
    pub fn request_connect(&self) -> Result<(), Error> {
        if self.core.mode != Mode::Client {
            return Err(Error::generic("connect requests apply to client brokers"));
        }

        let state = self.core.lock_state();

        match &state.phase {
            Phase::Running(handle) => {
                handle.post(Box::new(|worker| worker.request_connect()));
                Ok(())
            }
            _ => Err(Error::generic("broker is not running")),
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let handle = {
            let mut state = self.core.lock_state();

            match mem::replace(&mut state.phase, Phase::Stopped) {
                Phase::Running(handle) => {
                    handle.cancel();
                    Some(handle)
                }
                _ => None,
            }
        };

        if let Some(mut handle) = handle {
            handle.join();
        }
    }
}

impl BrokerCore {
    fn lock_state(&self) -> std::sync::MutexGuard<BrokerState> {
        self.state.lock().expect("Broker state lock poisoned")
    }

    /// Runs the broker listener with no lock held, so handlers may reenter
    /// the broker freely.
    fn with_listener<F: FnOnce(&mut dyn BrokerListener)>(core: &Arc<BrokerCore>, f: F) {
        let taken = core.lock_state().listener.take();

        if let Some(mut listener) = taken {
            f(listener.as_mut());

            let mut state = core.lock_state();
            if state.listener.is_none() {
                state.listener = Some(listener);
            }
        }
    }

    fn on_channel_opened(core: &Arc<BrokerCore>, id: ChannelId) {
        let channel = {
            let mut state = core.lock_state();

            if state.stopping {
                logging::debug!(core.log, "ignoring channel open during shutdown"; "channel_id" => id);
                return;
            }

            let channel = Channel::new(
                id,
                Arc::downgrade(core),
                core.log.new(logging::o!("channel_id" => id)),
            );
            state.channels.insert(id, channel.clone());
            channel
        };

        Self::with_listener(core, |listener| listener.channel_open(&channel));
    }

    fn on_channel_closed(core: &Arc<BrokerCore>, id: ChannelId, err: Error) {
        let channel = core.lock_state().channels.get(&id).cloned();

        if let Some(channel) = channel {
            channel.close_with(Some(err));
        }
    }

    fn on_messages(core: &Arc<BrokerCore>, id: ChannelId, msgs: Vec<Msg>) {
        let channel = core.lock_state().channels.get(&id).cloned();

        match channel {
            Some(channel) => {
                for msg in msgs {
                    channel.dispatch(msg);
                }
            }
            None => {
                logging::debug!(core.log, "dropping batch for unknown channel"; "channel_id" => id)
            }
        }
    }

    fn on_worker_finished(core: &Arc<BrokerCore>, err: Option<Error>) {
        let channels = {
            let mut state = core.lock_state();

            if let Phase::Running(handle) = &mut state.phase {
                handle.join();
            }
            state.phase = Phase::Stopped;

            state.channels.values().cloned().collect::<Vec<_>>()
        };

        // Worker cleanup already reported these; closing again is a no-op.
        let reason = err
            .clone()
            .unwrap_or_else(|| Error::interrupted("worker exited"));
        for channel in channels {
            channel.close_with(Some(reason.clone()));
        }

        Self::with_listener(core, |listener| listener.stopped(err));
    }

    /// Hands an encoded-ready message to the worker for transmission.
    pub(crate) fn forward(&self, id: ChannelId, msg: Msg) {
        let state = self.lock_state();

        if let Phase::Running(handle) = &state.phase {
            handle.post(Box::new(move |worker| worker.queue_message(id, msg)));
        }
    }

    /// Unlinks a closed channel and tears down its thread-side half.
    pub(crate) fn channel_detached(&self, id: ChannelId) {
        let mut state = self.lock_state();

        state.channels.remove(&id);

        if let Phase::Running(handle) = &state.phase {
            handle.post(Box::new(move |worker| worker.close_channel_request(id)));
        }
    }
}

/// Worker-side sink marshalling every callback onto the owner thread
/// through the UI dispatcher.
struct DispatcherSink {
    core: Weak<BrokerCore>,
    dispatcher: Arc<dyn UiDispatcher>,
}

impl DispatcherSink {
    fn submit<F: FnOnce(&Arc<BrokerCore>) + Send + 'static>(&self, f: F) {
        let core = self.core.clone();

        self.dispatcher.submit(Box::new(move || {
            if let Some(core) = core.upgrade() {
                f(&core);
            }
        }));
    }
}

impl WorkerSink for DispatcherSink {
    fn channel_opened(&self, id: ChannelId) {
        self.submit(move |core| BrokerCore::on_channel_opened(core, id));
    }

    fn channel_closed(&self, id: ChannelId, err: Error) {
        self.submit(move |core| BrokerCore::on_channel_closed(core, id, err));
    }

    fn messages_received(&self, id: ChannelId, msgs: Vec<Msg>) {
        self.submit(move |core| BrokerCore::on_messages(core, id, msgs));
    }

    fn finished(&self, err: Option<Error>) {
        self.submit(move |core| BrokerCore::on_worker_finished(core, err));
    }
}
