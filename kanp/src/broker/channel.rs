use crate::anp::{self, Msg};
use crate::broker::query::{IncomingQuery, OutgoingQuery};
use crate::broker::BrokerCore;
use crate::error::Error;
use hashbrown::HashMap;
use keel::logging;
use keel::ChannelId;
use std::sync::{Arc, Mutex, Weak};

/// Channel-level events. Implementations run on the owner thread; handlers
/// may call back into the channel, including closing it.
pub trait ChannelListener: Send {
    /// The peer sent a command; reply through the query object.
    fn incoming_query(&mut self, channel: &Arc<Channel>, query: &Arc<IncomingQuery>);
    /// The peer sent an asynchronous event.
    fn incoming_event(&mut self, channel: &Arc<Channel>, msg: Msg);
    /// The channel closed. `None` means it was closed locally by the owner;
    /// `Some` carries the failure that tore it down.
    fn closed(&mut self, channel: &Arc<Channel>, err: &Option<Error>);
}

enum Pending {
    Query(Arc<IncomingQuery>),
    Event(Msg),
    Closed(Option<Error>),
}

struct ChannelCtl {
    open: bool,
    close_err: Option<Error>,
    next_cmd_id: u64,
    out_queries: HashMap<u64, Arc<OutgoingQuery>>,
    in_queries: HashMap<u64, Arc<IncomingQuery>>,
    listener: Option<Box<dyn ChannelListener>>,
    // Events raised while a handler is running are queued and delivered
    // after it returns, so reentrant closes still produce a clean `closed`.
    dispatching: bool,
    deferred: Vec<Pending>,
}

/// Broker-side end of a logical channel: correlates replies with outgoing
/// queries by message id and tracks incoming queries awaiting a reply.
pub struct Channel {
    id: ChannelId,
    core: Weak<BrokerCore>,
    log: logging::Logger,
    ctl: Mutex<ChannelCtl>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        core: Weak<BrokerCore>,
        log: logging::Logger,
    ) -> Arc<Channel> {
        Arc::new(Channel {
            id,
            core,
            log,
            ctl: Mutex::new(ChannelCtl {
                open: true,
                close_err: None,
                next_cmd_id: 1,
                out_queries: HashMap::new(),
                in_queries: HashMap::new(),
                listener: None,
                dispatching: false,
                deferred: Vec::new(),
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// The error the channel closed with, if it closed abnormally.
    pub fn close_err(&self) -> Option<Error> {
        self.lock().close_err.clone()
    }

    /// Installs the channel listener. Do this inside the broker's
    /// `channel_open` handler; events raised on a channel with no listener
    /// installed are dropped.
    pub fn set_listener(&self, listener: Box<dyn ChannelListener>) {
        self.lock().listener = Some(listener);
    }

    /// Sends a command: assigns the next monotonic command id, records the
    /// query and forwards the message. Returns the query handle immediately;
    /// completion arrives through its handler.
    pub fn send_command(self: &Arc<Self>, mut msg: Msg) -> Result<Arc<OutgoingQuery>, Error> {
        let (query, msg) = {
            let mut ctl = self.lock();

            if !ctl.open {
                return Err(Self::closed_error(&ctl));
            }

            let id = ctl.next_cmd_id;
            ctl.next_cmd_id += 1;
            msg.id = id;

            let query = OutgoingQuery::new(id, msg.clone(), Arc::downgrade(self));
            ctl.out_queries.insert(id, query.clone());

            (query, msg)
        };

        self.forward(msg);

        Ok(query)
    }

    /// Sends an asynchronous event. The caller's id is preserved; id 0
    /// marks a transient event.
    pub fn send_event(&self, msg: Msg) -> Result<(), Error> {
        {
            let ctl = self.lock();

            if !ctl.open {
                return Err(Self::closed_error(&ctl));
            }
        }

        self.forward(msg);

        Ok(())
    }

    /// Closes the channel normally. Pending outgoing queries complete with
    /// an error, pending incoming queries are cancelled, and `closed` fires
    /// with `None`.
    pub fn close(self: &Arc<Self>) {
        self.close_with(None);
    }

    /// One-way open → closed transition with an optional failure reason.
    pub(crate) fn close_with(self: &Arc<Self>, err: Option<Error>) {
        let (out_queries, in_queries) = {
            let mut ctl = self.lock();

            if !ctl.open {
                return;
            }

            ctl.open = false;
            ctl.close_err = err.clone();

            let out_queries: Vec<_> = ctl.out_queries.drain().map(|(_, query)| query).collect();
            let in_queries: Vec<_> = ctl.in_queries.drain().map(|(_, query)| query).collect();

            (out_queries, in_queries)
        };

        if let Some(core) = self.core.upgrade() {
            core.channel_detached(self.id);
        }

        let reason = err
            .clone()
            .unwrap_or_else(|| Error::generic("channel closed"));

        for query in out_queries {
            query.complete_with_error(reason.clone());
        }

        for query in in_queries {
            query.fire_cancel();
        }

        match &err {
            Some(error) => logging::debug!(self.log, "channel closed"; "error" => %error),
            None => logging::debug!(self.log, "channel closed by owner"),
        }

        self.emit(Pending::Closed(err));
    }

    /// Dispatches one received message by the role bits of its type field.
    pub(crate) fn dispatch(self: &Arc<Self>, msg: Msg) {
        if !self.is_open() {
            return;
        }

        if anp::family(msg.ty) != anp::FAMILY_ANP {
            logging::warn!(self.log, "dropping message from foreign protocol family";
                           "family" => anp::family(msg.ty));
            return;
        }

        let role = anp::role(msg.ty);

        if role == anp::ROLE_CMD {
            if msg.namespace() == anp::NS_CANCEL {
                self.handle_cancel_cmd(msg);
            } else {
                self.handle_command(msg);
            }
        } else if role == anp::ROLE_RES {
            self.handle_response(msg);
        } else if role == anp::ROLE_EVT {
            self.emit(Pending::Event(msg));
        } else {
            logging::warn!(self.log, "dropping message with undefined role"; "type" => msg.ty);
        }
    }

    fn handle_command(self: &Arc<Self>, msg: Msg) {
        let query = {
            let mut ctl = self.lock();

            if !ctl.open {
                return;
            }

            let query = IncomingQuery::new(msg, Arc::downgrade(self));
            // A well-behaved peer never reuses ids within a channel; a
            // duplicate replaces the stale entry.
            ctl.in_queries.insert(query.id(), query.clone());
            query
        };

        self.emit(Pending::Query(query));
    }

    fn handle_cancel_cmd(&self, msg: Msg) {
        let query = self.lock().in_queries.remove(&msg.id);

        match query {
            Some(query) => query.fire_cancel(),
            None => {
                logging::debug!(self.log, "cancel for unknown incoming query"; "id" => msg.id)
            }
        }
    }

    fn handle_response(&self, msg: Msg) {
        let query = self.lock().out_queries.remove(&msg.id);

        match query {
            Some(query) => query.complete_with_reply(msg),
            None => {
                // Replies racing a local cancellation land here; dropped.
                logging::debug!(self.log, "response for unknown query"; "id" => msg.id)
            }
        }
    }

    /// Completes an outgoing query cancellation: unlinks it and sends the
    /// CancelCmd bearing the original command id.
    pub(crate) fn cancel_outgoing(&self, id: u64) {
        let send = {
            let mut ctl = self.lock();
            ctl.out_queries.remove(&id);
            ctl.open
        };

        if send {
            let mut cancel = Msg::cmd(anp::NS_CANCEL);
            cancel.id = id;
            self.forward(cancel);
        }
    }

    /// Forwards a reply for an incoming query, stamping the command id.
    pub(crate) fn reply_incoming(&self, id: u64, mut msg: Msg) -> Result<(), Error> {
        {
            let mut ctl = self.lock();

            if !ctl.open {
                return Err(Self::closed_error(&ctl));
            }

            ctl.in_queries.remove(&id);
        }

        msg.id = id;
        self.forward(msg);

        Ok(())
    }

    fn forward(&self, msg: Msg) {
        if let Some(core) = self.core.upgrade() {
            core.forward(self.id, msg);
        }
    }

    /// Delivers an event to the listener, deferring if a handler is already
    /// on the stack so reentrant calls never lose events.
    fn emit(self: &Arc<Self>, event: Pending) {
        let mut listener = {
            let mut ctl = self.lock();

            if ctl.dispatching {
                ctl.deferred.push(event);
                return;
            }

            match ctl.listener.take() {
                Some(listener) => {
                    ctl.dispatching = true;
                    listener
                }
                None => return,
            }
        };

        self.deliver(listener.as_mut(), event);

        loop {
            let next = {
                let mut ctl = self.lock();

                if ctl.deferred.is_empty() {
                    ctl.dispatching = false;

                    if ctl.listener.is_none() {
                        ctl.listener = Some(listener);
                    }

                    return;
                }

                ctl.deferred.remove(0)
            };

            self.deliver(listener.as_mut(), next);
        }
    }

    fn deliver(self: &Arc<Self>, listener: &mut dyn ChannelListener, event: Pending) {
        match event {
            Pending::Query(query) => listener.incoming_query(self, &query),
            Pending::Event(msg) => listener.incoming_event(self, msg),
            Pending::Closed(err) => listener.closed(self, &err),
        }
    }

    fn closed_error(ctl: &ChannelCtl) -> Error {
        ctl.close_err
            .clone()
            .unwrap_or_else(|| Error::generic("channel is closed"))
    }

    fn lock(&self) -> std::sync::MutexGuard<ChannelCtl> {
        self.ctl.lock().expect("Channel lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anp::Element;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct EventLog {
        queries: Vec<Arc<IncomingQuery>>,
        events: Vec<Msg>,
        closes: Vec<Option<Error>>,
    }

    struct Recorder {
        log: Arc<Mutex<EventLog>>,
    }

    impl ChannelListener for Recorder {
        fn incoming_query(&mut self, _channel: &Arc<Channel>, query: &Arc<IncomingQuery>) {
            self.log.lock().unwrap().queries.push(query.clone());
        }

        fn incoming_event(&mut self, _channel: &Arc<Channel>, msg: Msg) {
            self.log.lock().unwrap().events.push(msg);
        }

        fn closed(&mut self, _channel: &Arc<Channel>, err: &Option<Error>) {
            self.log.lock().unwrap().closes.push(err.clone());
        }
    }

    fn detached_channel() -> (Arc<Channel>, Arc<Mutex<EventLog>>) {
        let channel = Channel::new(9, Weak::new(), logging::discard());
        let log = Arc::new(Mutex::new(EventLog::default()));

        channel.set_listener(Box::new(Recorder { log: log.clone() }));

        (channel, log)
    }

    fn response_for(id: u64) -> Msg {
        let mut msg = Msg::res(100).with(Element::text("pong"));
        msg.id = id;
        msg
    }

    fn command(id: u64) -> Msg {
        let mut msg = Msg::cmd(100).with(Element::text("ping"));
        msg.id = id;
        msg
    }

    #[test]
    fn test_command_ids_monotonic_from_one() {
        let (channel, _log) = detached_channel();

        let first = channel.send_command(Msg::cmd(100)).unwrap();
        let second = channel.send_command(Msg::cmd(100)).unwrap();
        let third = channel.send_command(Msg::cmd(100)).unwrap();

        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(third.id(), 3);
        assert_eq!(first.command().id, 1);
    }

    #[test]
    fn test_response_completes_query() {
        let (channel, _log) = detached_channel();
        let query = channel.send_command(Msg::cmd(100)).unwrap();

        channel.dispatch(response_for(query.id()));

        assert!(!query.is_pending());
        assert_eq!(query.reply().unwrap().elements[0], Element::text("pong"));

        // The pending map entry is gone: a duplicate reply is dropped.
        channel.dispatch(response_for(query.id()));
    }

    #[test]
    fn test_unknown_response_dropped() {
        let (channel, log) = detached_channel();

        channel.dispatch(response_for(77));

        assert!(log.lock().unwrap().queries.is_empty());
        assert!(log.lock().unwrap().events.is_empty());
    }

    #[test]
    fn test_incoming_command_raises_query() {
        let (channel, log) = detached_channel();

        channel.dispatch(command(5));

        let log = log.lock().unwrap();
        assert_eq!(log.queries.len(), 1);
        assert_eq!(log.queries[0].id(), 5);
        assert!(log.queries[0].is_pending());
    }

    #[test]
    fn test_cancel_cmd_fires_incoming_cancellation() {
        let (channel, log) = detached_channel();

        channel.dispatch(command(5));

        let query = log.lock().unwrap().queries[0].clone();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        query.on_cancel(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut cancel = Msg::cmd(anp::NS_CANCEL);
        cancel.id = 5;
        channel.dispatch(cancel);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(query.was_cancelled());
    }

    #[test]
    fn test_cancel_cmd_unknown_id_ignored() {
        let (channel, log) = detached_channel();

        let mut cancel = Msg::cmd(anp::NS_CANCEL);
        cancel.id = 123;
        channel.dispatch(cancel);

        assert!(log.lock().unwrap().queries.is_empty());
    }

    #[test]
    fn test_event_dispatch_in_order() {
        let (channel, log) = detached_channel();

        let first = Msg::evt(7).with(Element::U32(1));
        let second = Msg::evt(7).with(Element::U32(2));

        channel.dispatch(first.clone());
        channel.dispatch(second.clone());

        assert_eq!(log.lock().unwrap().events, vec![first, second]);
    }

    #[test]
    fn test_foreign_family_dropped() {
        let (channel, log) = detached_channel();

        let mut msg = Msg::evt(7);
        msg.ty = 0x1000_0001;
        channel.dispatch(msg);

        assert!(log.lock().unwrap().events.is_empty());
    }

    #[test]
    fn test_close_fans_out() {
        let (channel, log) = detached_channel();

        let query = channel.send_command(Msg::cmd(100)).unwrap();
        channel.dispatch(command(5));
        let incoming = log.lock().unwrap().queries[0].clone();

        channel.close_with(Some(Error::eanp_conn("connection lost")));

        assert!(!channel.is_open());
        assert!(!query.is_pending());
        assert_eq!(query.error().unwrap().kind, ErrorKind::EAnpConn);
        assert!(incoming.was_cancelled());

        let log = log.lock().unwrap();
        assert_eq!(log.closes.len(), 1);
        assert_eq!(log.closes[0].as_ref().unwrap().kind, ErrorKind::EAnpConn);
    }

    #[test]
    fn test_close_is_one_way() {
        let (channel, log) = detached_channel();

        channel.close();
        channel.close_with(Some(Error::eanp_conn("late")));

        assert_eq!(log.lock().unwrap().closes.len(), 1);
        assert_eq!(channel.close_err(), None);
    }

    #[test]
    fn test_send_on_closed_channel_fails() {
        let (channel, _log) = detached_channel();

        channel.close_with(Some(Error::eanp_conn("connection lost")));

        let err = channel.send_command(Msg::cmd(100)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EAnpConn);

        let err = channel.send_event(Msg::evt(7)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EAnpConn);
    }

    #[test]
    fn test_dispatch_after_close_ignored() {
        let (channel, log) = detached_channel();

        channel.close();
        channel.dispatch(command(5));
        channel.dispatch(Msg::evt(7));

        let log = log.lock().unwrap();
        assert!(log.queries.is_empty());
        assert!(log.events.is_empty());
    }

    #[test]
    fn test_reentrant_close_still_fires_closed() {
        struct Closer {
            log: Arc<Mutex<EventLog>>,
        }

        impl ChannelListener for Closer {
            fn incoming_query(&mut self, channel: &Arc<Channel>, _query: &Arc<IncomingQuery>) {
                channel.close();
            }

            fn incoming_event(&mut self, _channel: &Arc<Channel>, _msg: Msg) {}

            fn closed(&mut self, _channel: &Arc<Channel>, err: &Option<Error>) {
                self.log.lock().unwrap().closes.push(err.clone());
            }
        }

        let channel = Channel::new(9, Weak::new(), logging::discard());
        let log = Arc::new(Mutex::new(EventLog::default()));
        channel.set_listener(Box::new(Closer { log: log.clone() }));

        channel.dispatch(command(1));

        assert!(!channel.is_open());

        let log = log.lock().unwrap();
        assert_eq!(log.closes.len(), 1);
        assert!(log.closes[0].is_none());
    }
}
