//! Client side: the thread-pinned [Channel] multiplexer and its
//! connection state machine.

mod conn;

pub(crate) use conn::ClientConn;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::thread::{self, ThreadId};

use log::*;

use crate::body::Body;
use crate::codec::{CodecHandle, CompressKind};
use crate::config::{CallOptions, ChannelOptions};
use crate::controller::ClientController;
use crate::error::Code;
use crate::framer::SendStep;
use crate::net;
use crate::proto::Meta;
use crate::reactor::{EventSink, Reactor};
use crate::reactor::TimerHandle;
use crate::service::{request_meta, BUILTIN_SERVICE, BUILTIN_STATUS};

/// Completion of one call: receives the outcome and the response buffer
/// back.
pub type CallDone = Box<dyn FnOnce(ClientController, Box<dyn Body>)>;

/// Timer tag reserved for the connection state machine; message timeout
/// watchers use their sequence number (sequences start at 1).
pub(crate) const TAG_CONN: u64 = 0;

pub(crate) struct ClientMessage {
    pub(crate) seq: u64,
    pub(crate) meta: Meta,
    pub(crate) compression: CompressKind,
    request: Box<dyn Body>,
    response: Option<Box<dyn Body>>,
    done: Option<CallDone>,
    timer: Option<TimerHandle>,
    pub(crate) finished: bool,
    code: Code,
    error_text: String,
    /// Control message carrying a cancel notification; dropped after the
    /// frame is written.
    pub(crate) is_cancel: bool,
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_cancel {
            write!(f, "cancel seq={}", self.seq)
        } else {
            write!(f, "call seq={} {}.{}", self.seq, self.meta.service, self.meta.method)
        }
    }
}

impl ClientMessage {
    #[inline(always)]
    pub(crate) fn data(&self) -> Option<&dyn Body> {
        if self.is_cancel {
            None
        } else {
            Some(self.request.as_ref())
        }
    }
}

struct Queues {
    sendq: VecDeque<ClientMessage>,
    recvq: VecDeque<ClientMessage>,
    /// Sequence of the send-queue head currently serialized in the framer.
    /// The head is not popped until the frame is fully written.
    cur_send: Option<u64>,
}

pub(crate) struct ChannelCore {
    pub(crate) reactor: Reactor,
    pub(crate) opts: ChannelOptions,
    pub(crate) host: String,
    pub(crate) port: u16,
    /// Local hostname reported before a connection exists.
    endpoint: String,
    tid: ThreadId,
    seq: Cell<u64>,
    queues: RefCell<Queues>,
    pub(crate) conn: RefCell<Option<ClientConn>>,
    pub(crate) codec: CodecHandle,
    has_status: Cell<bool>,
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channel {}:{}", self.host, self.port)
    }
}

/// Client-side multiplexer over a single remote endpoint.
///
/// A channel is pinned to the thread that created it: every operation,
/// including cancellation through [CallHandle], fails with
/// [Code::WrongThread] elsewhere. The creating thread drives I/O by
/// pumping the [Reactor] the channel was built on.
pub struct Channel {
    core: Rc<ChannelCore>,
}

impl Channel {
    /// Create a closed channel for `host:port` on this thread's reactor.
    /// Call [Channel::open] to start connecting.
    pub fn new(options: ChannelOptions, host: &str, port: u16, reactor: &Reactor) -> Channel {
        Channel {
            core: Rc::new(ChannelCore {
                reactor: reactor.clone(),
                opts: options,
                host: host.to_string(),
                port,
                endpoint: net::local_hostname(),
                tid: thread::current().id(),
                seq: Cell::new(0),
                queues: RefCell::new(Queues {
                    sendq: VecDeque::new(),
                    recvq: VecDeque::new(),
                    cur_send: None,
                }),
                conn: RefCell::new(None),
                codec: CodecHandle::acquire(),
                has_status: Cell::new(false),
            }),
        }
    }

    /// Install the client connection and start the connect/retry cycle.
    pub fn open(&self) -> Result<(), Code> {
        self.core.check_thread()?;
        if self.core.conn.borrow().is_some() {
            error!("{:?} has been opened", self.core);
            return Err(Code::Unknown);
        }
        self.core.clone().connect_cycle();
        Ok(())
    }

    /// Cancel all outstanding calls and drop the connection.
    pub fn close(&self) -> Result<(), Code> {
        self.core.check_thread()?;
        self.core.cancel_all(true);
        Ok(())
    }

    /// Cancel all outstanding calls but keep the channel open.
    pub fn cancel(&self) -> Result<(), Code> {
        self.core.check_thread()?;
        self.core.cancel_all(false);
        Ok(())
    }

    /// Enqueue a call of `service`.`method`. The completion runs exactly
    /// once on this thread with the outcome and the response buffer.
    pub fn call_method(
        &self, service: &str, method: &str, opts: CallOptions, request: Box<dyn Body>,
        response: Box<dyn Body>, done: CallDone,
    ) -> Result<CallHandle, Code> {
        self.core.check_thread()?;
        if self.core.conn.borrow().is_none() {
            error!("{:?} is not open", self.core);
            return Err(Code::Unknown);
        }
        let seq = self.core.call_method(service, method, opts, request, response, done);
        Ok(CallHandle { core: Rc::downgrade(&self.core), seq })
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if thread::current().id() == self.core.tid {
            self.core.cancel_all(true);
        }
    }
}

/// Cancellation entry point for one in-flight call.
pub struct CallHandle {
    core: Weak<ChannelCore>,
    seq: u64,
}

impl CallHandle {
    #[inline(always)]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Cancel the call. The completion observes [Code::Canceled]; if the
    /// request already went out, a cancel notification is sent to the
    /// peer best-effort. A no-op once the call has finished.
    pub fn start_cancel(&self) -> Result<(), Code> {
        match self.core.upgrade() {
            None => Ok(()),
            Some(core) => {
                core.check_thread()?;
                core.start_cancel(self.seq);
                Ok(())
            }
        }
    }
}

impl ChannelCore {
    #[inline]
    pub(crate) fn check_thread(&self) -> Result<(), Code> {
        if thread::current().id() != self.tid {
            error!("{:?} used outside its owner thread", self);
            return Err(Code::WrongThread);
        }
        Ok(())
    }

    #[inline]
    fn next_seq(&self) -> u64 {
        let s = self.seq.get() + 1;
        self.seq.set(s);
        s
    }

    fn call_method(
        self: &Rc<Self>, service: &str, method: &str, opts: CallOptions,
        request: Box<dyn Body>, response: Box<dyn Body>, done: CallDone,
    ) -> u64 {
        let seq = self.next_seq();
        let meta = request_meta(seq, service, method, opts.compression as u8);
        let sink: Rc<dyn EventSink> = self.clone();
        let timer = self.reactor.set_timer(opts.rpc_timeout, &sink, seq);

        let msg = ClientMessage {
            seq,
            meta,
            compression: opts.compression,
            request,
            response: Some(response),
            done: Some(done),
            timer: Some(timer),
            finished: false,
            code: Code::Ok,
            error_text: String::new(),
            is_cancel: false,
        };
        trace!("{:?} enqueue {}", self, msg);

        let was_empty = {
            let mut q = self.queues.borrow_mut();
            let was_empty = q.sendq.is_empty();
            q.sendq.push_back(msg);
            was_empty
        };
        if was_empty {
            self.enable_upload();
        }
        seq
    }

    /// Queue a cancel notification frame for `seq`, best-effort.
    fn push_cancel_frame(self: &Rc<Self>, seq: u64) {
        let mut meta = Meta::default();
        meta.seq = seq;
        meta.cancel = true;
        let msg = ClientMessage {
            seq,
            meta,
            compression: CompressKind::None,
            request: Box::new(()),
            response: None,
            done: None,
            timer: None,
            finished: true,
            code: Code::Ok,
            error_text: String::new(),
            is_cancel: true,
        };
        let was_empty = {
            let mut q = self.queues.borrow_mut();
            let was_empty = q.sendq.is_empty();
            q.sendq.push_back(msg);
            was_empty
        };
        if was_empty {
            self.enable_upload();
        }
    }

    /// Consume a detached message and run its completion. The completion
    /// runs at most once per message.
    fn finish_msg(&self, mut msg: ClientMessage) {
        msg.finished = true;
        msg.timer.take();
        let done = match msg.done.take() {
            None => return,
            Some(d) => d,
        };
        let response = msg.response.take().expect("response buffer");
        self.run_done(msg.seq, msg.code, std::mem::take(&mut msg.error_text), done, response);
    }

    fn run_done(
        &self, seq: u64, code: Code, error_text: String, done: CallDone, response: Box<dyn Body>,
    ) {
        let mut ctl = ClientController::new(seq);
        ctl.code = code;
        ctl.error_text = error_text;
        self.assign_endpoints(&mut ctl);
        done(ctl, response);
    }

    fn assign_endpoints(&self, ctl: &mut ClientController) {
        let conn = self.conn.borrow();
        match conn.as_ref() {
            Some(ClientConn::Connected { local, remote, .. }) => {
                ctl.local_addr = local.clone();
                ctl.remote_addr = remote.clone();
            }
            _ => {
                ctl.local_addr = self.endpoint.clone();
                ctl.remote_addr = format!("{}:{}", self.host, self.port);
            }
        }
    }

    /// Locate `seq` in receive queue, current-send slot or send queue and
    /// finish it with `code`. Cancel notifications go out only for
    /// requests the peer may have seen, when `notify_peer`.
    fn detach_and_finish(self: &Rc<Self>, seq: u64, code: Code, notify_peer: bool) {
        let mut q = self.queues.borrow_mut();

        if let Some(pos) = q.recvq.iter().position(|m| m.seq == seq) {
            let mut msg = q.recvq.remove(pos).unwrap();
            drop(q);
            msg.code = code;
            self.finish_msg(msg);
            if notify_peer {
                self.push_cancel_frame(seq);
            }
            return;
        }

        if q.cur_send == Some(seq) {
            // mid-transmission; the frame bytes are already staged, so the
            // user can be notified now. A finished husk stays at the head
            // until the framer is done with it.
            let head = q.sendq.front_mut().expect("cur_send head");
            if head.finished {
                return;
            }
            head.finished = true;
            head.timer.take();
            let done = head.done.take();
            let response = head.response.take();
            drop(q);
            if let Some(done) = done {
                self.run_done(seq, code, String::new(), done, response.expect("response buffer"));
            }
            return;
        }

        if let Some(pos) = q.sendq.iter().position(|m| m.seq == seq && !m.is_cancel && !m.finished) {
            let mut msg = q.sendq.remove(pos).unwrap();
            drop(q);
            msg.code = code;
            self.finish_msg(msg);
            return;
        }

        trace!("{:?} seq={} already finished", self, seq);
    }

    pub(crate) fn start_cancel(self: &Rc<Self>, seq: u64) {
        self.detach_and_finish(seq, Code::Canceled, true);
    }

    fn on_rpc_timeout(self: &Rc<Self>, seq: u64) {
        debug!("{:?} seq={} timed out", self, seq);
        self.detach_and_finish(seq, Code::Timeout, false);
    }

    /// Cancel every outstanding call; `close` also tears the connection
    /// down.
    pub(crate) fn cancel_all(self: &Rc<Self>, close: bool) {
        loop {
            let msg = {
                let mut q = self.queues.borrow_mut();
                match q.recvq.pop_front() {
                    Some(m) => Some(m),
                    None => None,
                }
            };
            match msg {
                None => break,
                Some(mut msg) => {
                    msg.code = Code::Canceled;
                    self.finish_msg(msg);
                }
            }
        }

        let keep_head = !close && self.queues.borrow().cur_send.is_some();
        loop {
            // a partially written frame survives a plain cancel; its
            // finished husk stays at the head until the framer is done
            let msg = {
                let mut q = self.queues.borrow_mut();
                if keep_head {
                    if q.sendq.len() > 1 {
                        q.sendq.remove(1)
                    } else {
                        None
                    }
                } else {
                    q.sendq.pop_front()
                }
            };
            match msg {
                None => break,
                Some(mut msg) => {
                    if msg.finished || msg.is_cancel {
                        continue;
                    }
                    msg.code = Code::Canceled;
                    self.finish_msg(msg);
                }
            }
        }
        if keep_head {
            let (done, response, seq) = {
                let mut q = self.queues.borrow_mut();
                match q.sendq.front_mut() {
                    Some(head) if !head.finished => {
                        head.finished = true;
                        head.timer.take();
                        (head.done.take(), head.response.take(), head.seq)
                    }
                    _ => (None, None, 0),
                }
            };
            if let Some(done) = done {
                self.run_done(
                    seq,
                    Code::Canceled,
                    String::new(),
                    done,
                    response.expect("response buffer"),
                );
            }
        }

        if close {
            let mut q = self.queues.borrow_mut();
            q.sendq.clear();
            q.recvq.clear();
            q.cur_send = None;
            drop(q);
            self.drop_conn();
            self.has_status.set(false);
        }
    }

    /// Heartbeat probe: a builtin status call issued when the channel is
    /// otherwise quiet.
    pub(crate) fn keepalive(self: &Rc<Self>) {
        {
            let q = self.queues.borrow();
            if !q.sendq.is_empty() || !q.recvq.is_empty() {
                return;
            }
        }
        if self.has_status.get() {
            return;
        }
        self.has_status.set(true);

        let weak = Rc::downgrade(self);
        let host = self.host.clone();
        let port = self.port;
        let done: CallDone = Box::new(move |ctl, _resp| {
            if ctl.failed() {
                error!("remote server {}:{} is offline", host, port);
            } else {
                debug!("remote server {}:{} is online", host, port);
            }
            if let Some(core) = weak.upgrade() {
                core.has_status.set(false);
            }
        });
        self.call_method(
            BUILTIN_SERVICE,
            BUILTIN_STATUS,
            CallOptions::default(),
            Box::new(()),
            Box::new(()),
            done,
        );
    }

    /// Framer pull: move the send-queue head into the current-send slot
    /// and stage its frame. The head is not popped here.
    fn load_next_frame(self: &Rc<Self>) -> Result<bool, ()> {
        let mut conn = self.conn.borrow_mut();
        let framer = match conn.as_mut() {
            Some(ClientConn::Connected { framer, .. }) => framer,
            _ => return Ok(false),
        };
        let q = self.queues.borrow();
        debug_assert!(q.cur_send.is_none());
        let msg = match q.sendq.front() {
            None => {
                drop(q);
                framer.disable_write(&self.reactor);
                return Ok(false);
            }
            Some(m) => m,
        };
        let mut codec = self.codec.get();
        match framer.start_frame(&mut codec, msg.compression, &msg.meta, msg.data()) {
            Ok(_) => {}
            Err(_) => {
                warn!("{:?} encoding {} failed", self, msg);
                return Err(());
            }
        }
        let seq = msg.seq;
        drop(q);
        self.queues.borrow_mut().cur_send = Some(seq);
        Ok(true)
    }

    /// Frame fully written: pop the head; finished messages die here,
    /// live ones move to the receive queue to await their response.
    fn send_done(&self) {
        let mut q = self.queues.borrow_mut();
        let msg = q.sendq.pop_front().expect("send queue head");
        debug_assert_eq!(q.cur_send, Some(msg.seq));
        q.cur_send = None;
        if msg.finished || msg.is_cancel {
            return;
        }
        trace!("{:?} sent {}", self, msg);
        q.recvq.push_back(msg);
    }

    /// Write-readiness pump. Returns Err after a transport fault has been
    /// handled (the connection was already replaced).
    pub(crate) fn pump_send(self: &Rc<Self>) -> Result<(), ()> {
        loop {
            let loaded = {
                let conn = self.conn.borrow();
                match conn.as_ref() {
                    Some(ClientConn::Connected { framer, .. }) => framer.loaded(),
                    _ => return Ok(()),
                }
            };
            if !loaded {
                match self.load_next_frame() {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(_) => {
                        self.on_conn_fail("send");
                        return Err(());
                    }
                }
            }
            let step = {
                let mut conn = self.conn.borrow_mut();
                match conn.as_mut() {
                    Some(ClientConn::Connected { framer, .. }) => framer.push_bytes(),
                    _ => return Ok(()),
                }
            };
            match step {
                SendStep::Done => {
                    self.send_done();
                }
                SendStep::Partial => return Ok(()),
                SendStep::Error => {
                    self.on_conn_fail("send");
                    return Err(());
                }
            }
        }
    }

    /// Read-readiness pump: drain frames, match responses, run
    /// completions. Returns Err after a fault has been handled.
    pub(crate) fn pump_recv(self: &Rc<Self>) -> Result<(), ()> {
        let mut finished: Vec<ClientMessage> = Vec::new();
        let res = {
            let mut conn = self.conn.borrow_mut();
            let framer = match conn.as_mut() {
                Some(ClientConn::Connected { framer, .. }) => framer,
                _ => return Ok(()),
            };
            let mut codec = self.codec.get();
            let queues = &self.queues;
            let me: &ChannelCore = self;
            framer.on_readable(&mut codec, |payload, meta_len, data_len| {
                me.recv_done(queues, payload, meta_len, data_len, &mut finished)
            })
        };
        for msg in finished.drain(..) {
            self.finish_msg(msg);
        }
        match res {
            Ok(_) => Ok(()),
            Err(_) => {
                self.on_conn_fail("recv");
                Err(())
            }
        }
    }

    /// One decoded frame: parse meta, pair it with the waiting message.
    /// A missing entry is a late or canceled response, dropped silently.
    fn recv_done(
        &self, queues: &RefCell<Queues>, payload: &[u8], meta_len: usize, data_len: usize,
        finished: &mut Vec<ClientMessage>,
    ) -> bool {
        let meta = match Meta::decode(&payload[..meta_len]) {
            Ok(m) => m,
            Err(_) => {
                error!("{:?} response meta unparseable", self);
                return false;
            }
        };

        let mut q = queues.borrow_mut();
        let pos = match q.recvq.iter().position(|m| m.seq == meta.seq) {
            Some(p) => p,
            None => {
                warn!("{:?} late response for canceled rpc, sequence: {}", self, meta.seq);
                return true;
            }
        };
        let mut msg = q.recvq.remove(pos).unwrap();
        drop(q);
        msg.timer.take();

        if meta.code != 0 {
            msg.code = Code::from_wire(meta.code);
            msg.error_text = meta.error_text;
        } else {
            let data = &payload[meta_len..meta_len + data_len];
            let resp = msg.response.as_mut().expect("response buffer");
            if !resp.decode(data) {
                warn!("{:?} response decode failed for seq={}", self, msg.seq);
                msg.code = Code::ResponseMalformed;
            }
        }
        finished.push(msg);
        true
    }

    /// Transport fault: tear the connection down, move the in-flight
    /// messages back in front of the send queue in their original order,
    /// and start over.
    pub(crate) fn on_conn_fail(self: &Rc<Self>, what: &str) {
        warn!("{:?} {} failed, reconnecting", self, what);
        {
            let mut q = self.queues.borrow_mut();
            if q.cur_send.is_some() {
                let head_finished = q.sendq.front().map(|m| m.finished || m.is_cancel).unwrap_or(false);
                if head_finished {
                    q.sendq.pop_front();
                }
                q.cur_send = None;
            }
            while let Some(msg) = q.recvq.pop_back() {
                q.sendq.push_front(msg);
            }
        }
        self.drop_conn();
        self.clone().connect_cycle();
    }

    pub(crate) fn drop_conn(&self) {
        let mut conn = self.conn.borrow_mut();
        if let Some(c) = conn.as_mut() {
            c.detach(&self.reactor);
        }
        *conn = None;
    }

    pub(crate) fn enable_upload(&self) {
        let mut conn = self.conn.borrow_mut();
        if let Some(ClientConn::Connected { framer, .. }) = conn.as_mut() {
            framer.enable_write(&self.reactor);
        }
    }
}

impl EventSink for ChannelCore {
    fn on_io(self: Rc<Self>, readable: bool, writable: bool) {
        enum Route {
            Dead,
            Connecting,
            Connected,
        }
        let route = {
            let conn = self.conn.borrow();
            match conn.as_ref() {
                Some(ClientConn::Connecting { .. }) => Route::Connecting,
                Some(ClientConn::Connected { .. }) => Route::Connected,
                _ => Route::Dead,
            }
        };
        match route {
            Route::Dead => {}
            Route::Connecting => {
                if writable {
                    self.on_connect_ready();
                }
            }
            Route::Connected => {
                if readable {
                    if self.pump_recv().is_err() {
                        return;
                    }
                }
                if writable {
                    let _ = self.pump_send();
                }
            }
        }
    }

    fn on_timer(self: Rc<Self>, tag: u64) {
        if tag == TAG_CONN {
            self.on_conn_timer();
        } else {
            self.on_rpc_timeout(tag);
        }
    }
}
