use crate::anp::Msg;
use crate::broker::channel::Channel;
use crate::error::Error;
use std::sync::{Arc, Mutex, Weak};

/// Fired exactly once when an outgoing query completes with a reply or an
/// error. Cancellation completes the query silently, without firing this.
pub type CompletionHandler = Box<dyn FnOnce(&OutgoingQuery) + Send + 'static>;

/// Fired exactly once if an incoming query is cancelled before it is
/// replied to.
pub type CancelHandler = Box<dyn FnOnce(&IncomingQuery) + Send + 'static>;

struct OutState {
    pending: bool,
    cancelled: bool,
    reply: Option<Msg>,
    error: Option<Error>,
    handler: Option<CompletionHandler>,
}

/// An outgoing command awaiting its reply, correlated by the command id
/// stamped at send time.
pub struct OutgoingQuery {
    id: u64,
    command: Msg,
    channel: Weak<Channel>,
    state: Mutex<OutState>,
}

impl std::fmt::Debug for OutgoingQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingQuery")
            .field("id", &self.id)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl OutgoingQuery {
    pub(crate) fn new(id: u64, command: Msg, channel: Weak<Channel>) -> Arc<OutgoingQuery> {
        Arc::new(OutgoingQuery {
            id,
            command,
            channel,
            state: Mutex::new(OutState {
                pending: true,
                cancelled: false,
                reply: None,
                error: None,
                handler: None,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The command message as sent, id included.
    #[inline]
    pub fn command(&self) -> &Msg {
        &self.command
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    pub fn was_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn reply(&self) -> Option<Msg> {
        self.lock().reply.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.lock().error.clone()
    }

    /// Installs the completion handler. If the query already completed with
    /// a reply or error the handler fires immediately; a cancelled query
    /// swallows it.
    pub fn on_completion(&self, handler: CompletionHandler) {
        let fire = {
            let mut state = self.lock();

            if state.pending {
                state.handler = Some(handler);
                None
            } else if state.cancelled {
                None
            } else {
                Some(handler)
            }
        };

        if let Some(handler) = fire {
            handler(self);
        }
    }

    /// Cancels the query: sends a CancelCmd bearing the command id to the
    /// peer and completes locally without firing the completion handler.
    pub fn cancel(&self) {
        {
            let mut state = self.lock();

            if !state.pending {
                return;
            }

            state.pending = false;
            state.cancelled = true;
            state.error = Some(Error::cancelled("query cancelled"));
            state.handler = None;
        }

        if let Some(channel) = self.channel.upgrade() {
            channel.cancel_outgoing(self.id);
        }
    }

    pub(crate) fn complete_with_reply(&self, reply: Msg) {
        let handler = {
            let mut state = self.lock();

            if !state.pending {
                return;
            }

            state.pending = false;
            state.reply = Some(reply);
            state.handler.take()
        };

        if let Some(handler) = handler {
            handler(self);
        }
    }

    pub(crate) fn complete_with_error(&self, error: Error) {
        let handler = {
            let mut state = self.lock();

            if !state.pending {
                return;
            }

            state.pending = false;
            state.error = Some(error);
            state.handler.take()
        };

        if let Some(handler) = handler {
            handler(self);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<OutState> {
        self.state.lock().expect("Query lock poisoned")
    }
}

struct InState {
    pending: bool,
    cancelled: bool,
    reply: Option<Msg>,
    handler: Option<CancelHandler>,
}

/// A command received from the peer, awaiting a reply. The received
/// message's id is the correlation key the reply is stamped with.
pub struct IncomingQuery {
    id: u64,
    command: Msg,
    channel: Weak<Channel>,
    state: Mutex<InState>,
}

impl IncomingQuery {
    pub(crate) fn new(command: Msg, channel: Weak<Channel>) -> Arc<IncomingQuery> {
        Arc::new(IncomingQuery {
            id: command.id,
            command,
            channel,
            state: Mutex::new(InState {
                pending: true,
                cancelled: false,
                reply: None,
                handler: None,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The received command message.
    #[inline]
    pub fn command(&self) -> &Msg {
        &self.command
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    pub fn was_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Installs the cancellation handler. Fires immediately if the query was
    /// already cancelled; a replied query drops it.
    pub fn on_cancel(&self, handler: CancelHandler) {
        let fire = {
            let mut state = self.lock();

            if state.pending {
                state.handler = Some(handler);
                None
            } else if state.cancelled {
                Some(handler)
            } else {
                None
            }
        };

        if let Some(handler) = fire {
            handler(self);
        }
    }

    /// Stamps the command id into the reply, forwards it and completes the
    /// query. Replying twice or after cancellation is an error.
    pub fn reply(&self, reply: Msg) -> Result<(), Error> {
        {
            let mut state = self.lock();

            if !state.pending {
                return Err(Error::generic("query already completed"));
            }

            state.pending = false;
            state.reply = Some(reply.clone());
            state.handler = None;
        }

        let channel = self
            .channel
            .upgrade()
            .ok_or_else(|| Error::eanp_conn("channel is gone"))?;

        channel.reply_incoming(self.id, reply)
    }

    pub(crate) fn fire_cancel(&self) {
        let handler = {
            let mut state = self.lock();

            if !state.pending {
                return;
            }

            state.pending = false;
            state.cancelled = true;
            state.handler.take()
        };

        if let Some(handler) = handler {
            handler(self);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<InState> {
        self.state.lock().expect("Query lock poisoned")
    }
}
