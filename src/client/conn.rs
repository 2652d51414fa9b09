use std::rc::Rc;

use log::*;
use mio::{Interest, Token};

use super::{ChannelCore, TAG_CONN};
use crate::framer::Framer;
use crate::net;
use crate::reactor::{EventSink, TimerHandle};

/// Connection lifecycle of a channel. Exactly one timer is armed at any
/// time, typed by the state holding it: the retry backoff in `Idle`, the
/// connect watchdog in `Connecting`, the probe cadence in `Connected`.
pub(crate) enum ClientConn {
    Idle {
        _retry: TimerHandle,
    },
    Connecting {
        sock: Option<mio::net::TcpStream>,
        token: Token,
        _watch: TimerHandle,
    },
    Connected {
        framer: Framer,
        heartbeat: Option<TimerHandle>,
        local: String,
        remote: String,
    },
}

impl ClientConn {
    /// Drop reactor state held by this connection. Timer handles cancel
    /// themselves when the variant is dropped.
    pub(crate) fn detach(&mut self, reactor: &crate::reactor::Reactor) {
        match self {
            ClientConn::Idle { .. } => {}
            ClientConn::Connecting { sock, token, .. } => {
                if let Some(mut s) = sock.take() {
                    reactor.deregister(&mut s, *token);
                }
            }
            ClientConn::Connected { framer, .. } => {
                framer.detach(reactor);
            }
        }
    }
}

impl ChannelCore {
    /// Resolve, create the socket with the channel options applied and
    /// attempt the connect. Failures arm the retry timer.
    pub(crate) fn connect_cycle(self: Rc<Self>) {
        let addr = match net::resolve_addr(&self.host, self.port) {
            Err(e) => {
                error!("{:?} resolve failed: {:?}", self, e);
                self.new_idle();
                return;
            }
            Ok(addrs) => addrs[0],
        };

        match net::start_connect(&addr, self.opts.rbuf_size, self.opts.sbuf_size) {
            Err(e) => {
                debug!("{:?} connect failed: {:?}", self, e);
                self.new_idle();
            }
            Ok(start) => {
                if !start.in_progress {
                    self.on_connected(start.sock);
                    return;
                }
                let mut sock = start.sock;
                let sink: Rc<dyn EventSink> = self.clone();
                match self.reactor.register(&mut sock, Interest::WRITABLE, sink) {
                    Err(e) => {
                        error!("{:?} register connect event failed: {:?}", self, e);
                        self.new_idle();
                    }
                    Ok(token) => {
                        let sink: Rc<dyn EventSink> = self.clone();
                        let watch =
                            self.reactor.set_timer(self.opts.connect_timeout, &sink, TAG_CONN);
                        *self.conn.borrow_mut() = Some(ClientConn::Connecting {
                            sock: Some(sock),
                            token,
                            _watch: watch,
                        });
                    }
                }
            }
        }
    }

    fn new_idle(self: &Rc<Self>) {
        let sink: Rc<dyn EventSink> = self.clone();
        let retry = self.reactor.set_timer(self.opts.retry_interval, &sink, TAG_CONN);
        *self.conn.borrow_mut() = Some(ClientConn::Idle { _retry: retry });
    }

    fn on_connected(self: &Rc<Self>, sock: mio::net::TcpStream) {
        let sink: Rc<dyn EventSink> = self.clone();
        let framer = match Framer::new(
            sock,
            &self.reactor,
            sink,
            self.opts.min_rbuf_size,
            self.opts.max_rbuf_size,
            self.opts.min_sbuf_size,
            self.opts.max_sbuf_size,
            true,
        ) {
            Err(e) => {
                error!("{:?} register socket failed: {:?}", self, e);
                self.new_idle();
                return;
            }
            Ok(f) => f,
        };

        let local = framer.local_addr();
        let remote = framer.peer_addr();
        debug!("{:?} connected, {} -> {}", self, local, remote);

        let heartbeat = if self.opts.heartbeat_interval > 0 {
            let sink: Rc<dyn EventSink> = self.clone();
            Some(self.reactor.set_timer(self.opts.heartbeat_interval, &sink, TAG_CONN))
        } else {
            None
        };

        *self.conn.borrow_mut() =
            Some(ClientConn::Connected { framer, heartbeat, local, remote });
    }

    /// Writable readiness while connecting: query the socket error to
    /// learn the outcome.
    pub(crate) fn on_connect_ready(self: Rc<Self>) {
        let (sock, token) = {
            let mut conn = self.conn.borrow_mut();
            match conn.as_mut() {
                Some(ClientConn::Connecting { sock, token, .. }) => {
                    (sock.take().expect("connecting socket"), *token)
                }
                _ => return,
            }
        };
        let mut sock = sock;
        self.reactor.deregister(&mut sock, token);

        let failure = match sock.take_error() {
            Ok(Some(e)) => Some(e),
            Err(e) => Some(e),
            Ok(None) => match sock.peer_addr() {
                Ok(_) => None,
                Err(e) => Some(e),
            },
        };
        match failure {
            None => self.on_connected(sock),
            Some(e) => {
                error!("connect to {}:{} failed: {:?}", self.host, self.port, e);
                drop(sock);
                self.new_idle();
            }
        }
    }

    /// The single connection timer fired; its meaning depends on state.
    pub(crate) fn on_conn_timer(self: Rc<Self>) {
        enum Which {
            Retry,
            Watch,
            Heartbeat,
            Stale,
        }
        let which = {
            let conn = self.conn.borrow();
            match conn.as_ref() {
                Some(ClientConn::Idle { .. }) => Which::Retry,
                Some(ClientConn::Connecting { .. }) => Which::Watch,
                Some(ClientConn::Connected { .. }) => Which::Heartbeat,
                None => Which::Stale,
            }
        };
        match which {
            Which::Stale => {}
            Which::Retry => {
                self.connect_cycle();
            }
            Which::Watch => {
                warn!("connect to {}:{} timeout", self.host, self.port);
                {
                    let mut conn = self.conn.borrow_mut();
                    if let Some(c) = conn.as_mut() {
                        c.detach(&self.reactor);
                    }
                    *conn = None;
                }
                self.connect_cycle();
            }
            Which::Heartbeat => {
                {
                    let mut conn = self.conn.borrow_mut();
                    if let Some(ClientConn::Connected { heartbeat, .. }) = conn.as_mut() {
                        let sink: Rc<dyn EventSink> = self.clone();
                        *heartbeat =
                            Some(self.reactor.set_timer(self.opts.heartbeat_interval, &sink, TAG_CONN));
                    }
                }
                self.keepalive();
            }
        }
    }
}
