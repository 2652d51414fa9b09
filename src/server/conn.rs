use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::*;

use super::worker::WorkerCtx;
use super::ServerShared;
use crate::body::Body;
use crate::codec::CompressKind;
use crate::controller::ServerController;
use crate::error::Code;
use crate::framer::{Framer, SendStep};
use crate::proto::Meta;
use crate::reactor::{EventSink, TimerHandle};
use crate::service::{response_meta, ServerCall, Service};

/// A request handed to the service layer, not yet completed.
struct SvrEntry {
    seq: u64,
    compression: CompressKind,
    canceled: Arc<AtomicBool>,
}

/// A completed response waiting to be written.
struct SvrResponse {
    seq: u64,
    meta: Meta,
    response: Option<Box<dyn Body>>,
    compression: CompressKind,
}

/// One accepted connection, owned by the worker that adopted it.
///
/// Requests flow through the receive queue into the service layer;
/// completions come back over the worker's event queue and drain through
/// the send queue. After close the connection lingers as a tombstone until
/// every in-service request has returned.
pub(crate) struct ServerConn {
    id: u64,
    worker: Rc<WorkerCtx>,
    shared: Arc<ServerShared>,
    framer: RefCell<Option<Framer>>,
    recvq: RefCell<VecDeque<SvrEntry>>,
    sendq: RefCell<VecDeque<SvrResponse>>,
    cur_send: Cell<Option<u64>>,
    keepalive: RefCell<Option<TimerHandle>>,
    connected: Cell<bool>,
    local: String,
    remote: String,
}

impl fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn#{} from {}", self.id, self.remote)
    }
}

impl ServerConn {
    pub(crate) fn link(
        ctx: &Rc<WorkerCtx>, sock: mio::net::TcpStream, local: String, remote: String,
        shared: Arc<ServerShared>,
    ) -> io::Result<Rc<ServerConn>> {
        let conn = Rc::new(ServerConn {
            id: ctx.next_conn_id(),
            worker: ctx.clone(),
            shared,
            framer: RefCell::new(None),
            recvq: RefCell::new(VecDeque::new()),
            sendq: RefCell::new(VecDeque::new()),
            cur_send: Cell::new(None),
            keepalive: RefCell::new(None),
            connected: Cell::new(true),
            local,
            remote,
        });

        let sink: Rc<dyn EventSink> = conn.clone();
        let framer = Framer::new(
            sock,
            &ctx.reactor,
            sink,
            ctx.opts.min_rbuf_size,
            ctx.opts.max_rbuf_size,
            ctx.opts.min_sbuf_size,
            ctx.opts.max_sbuf_size,
            false,
        )?;
        *conn.framer.borrow_mut() = Some(framer);
        conn.upd_keepalive();
        trace!("{:?} linked on worker {}", conn, ctx.index);
        Ok(conn)
    }

    #[inline(always)]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Reset the idle watchdog; runs on every request received and every
    /// response fully written.
    fn upd_keepalive(self: &Rc<Self>) {
        if self.worker.opts.keep_alive_time == 0 {
            return;
        }
        let sink: Rc<dyn EventSink> = self.clone();
        let timer =
            self.worker.reactor.set_timer(self.worker.opts.keep_alive_time * 1000, &sink, 0);
        *self.keepalive.borrow_mut() = Some(timer);
    }

    /// Shut the socket and fail the queued responses. In-service requests
    /// keep the connection in the worker's set as a tombstone.
    pub(crate) fn close(self: &Rc<Self>) {
        if self.connected.get() {
            self.connected.set(false);
            self.keepalive.borrow_mut().take();
            if let Some(mut framer) = self.framer.borrow_mut().take() {
                framer.detach(&self.worker.reactor);
            }
            self.sendq.borrow_mut().clear();
            self.cur_send.set(None);
            // handlers still running observe the cancellation
            for entry in self.recvq.borrow().iter() {
                entry.canceled.store(true, Ordering::Release);
            }
            debug!("{:?} closed", self);
        }
        self.release_if_done();
    }

    fn release_if_done(&self) {
        if self.connected.get() {
            return;
        }
        if !self.recvq.borrow().is_empty() {
            return;
        }
        self.worker.unlink(self.id);
    }

    /// A handler finished: move the call from the receive queue to the
    /// send queue and arm write readiness.
    pub(crate) fn on_reply(self: &Rc<Self>, call: ServerCall) {
        let entry = {
            let mut recvq = self.recvq.borrow_mut();
            match recvq.iter().position(|e| e.seq == call.seq) {
                Some(pos) => recvq.remove(pos).unwrap(),
                None => {
                    error!("{:?} reply for unknown seq {}", self, call.seq);
                    return;
                }
            }
        };

        if !self.connected.get() {
            trace!("{:?} dropping reply seq={} after close", self, call.seq);
            drop(call);
            self.release_if_done();
            return;
        }

        let code = if call.controller.failed() {
            call.controller.code
        } else if entry.canceled.load(Ordering::Acquire) {
            Code::Canceled
        } else {
            Code::Ok
        };
        let meta = response_meta(call.seq, code, &call.controller.error_text);
        let response = if code.is_ok() { Some(call.response) } else { None };

        let was_empty = {
            let mut sendq = self.sendq.borrow_mut();
            let was_empty = sendq.is_empty();
            sendq.push_back(SvrResponse {
                seq: call.seq,
                meta,
                response,
                compression: entry.compression,
            });
            was_empty
        };
        if was_empty {
            let mut fr = self.framer.borrow_mut();
            if let Some(framer) = fr.as_mut() {
                framer.enable_write(&self.worker.reactor);
            }
        }
    }

    /// An inbound cancel notification for `seq`; idempotent.
    fn on_rpc_cancel(&self, seq: u64) {
        if self.cur_send.get() == Some(seq) {
            // mid-encode, too late to suppress
            return;
        }
        {
            let mut sendq = self.sendq.borrow_mut();
            if let Some(resp) = sendq.iter_mut().find(|r| r.seq == seq) {
                resp.meta = response_meta(seq, Code::Canceled, "");
                resp.response = None;
                return;
            }
        }
        {
            let recvq = self.recvq.borrow();
            if let Some(entry) = recvq.iter().find(|e| e.seq == seq) {
                entry.canceled.store(true, Ordering::Release);
                return;
            }
        }
        debug!("{:?} delayed cancel for seq {}", self, seq);
    }

    /// One decoded inbound frame.
    fn recv_done(
        &self, payload: &[u8], meta_len: usize, data_len: usize,
        calls: &mut Vec<(Arc<dyn Service>, String, ServerCall)>, got_request: &mut bool,
    ) -> bool {
        let meta = match Meta::decode(&payload[..meta_len]) {
            Ok(m) => m,
            Err(_) => {
                error!("{:?} request meta unparseable", self);
                return false;
            }
        };

        if meta.cancel {
            if data_len != 0 {
                error!("{:?} cancel frame carries data", self);
                return false;
            }
            self.on_rpc_cancel(meta.seq);
            return true;
        }

        let svc = match self.shared.services.get(&meta.service) {
            Some(s) => s.clone(),
            None => {
                error!("{:?} no such service: {}.{}", self, meta.service, meta.method);
                return false;
            }
        };
        let (request_proto, response_proto) = match svc.find_method(&meta.method) {
            Some(m) => (m.request_proto, m.response_proto),
            None => {
                error!("{:?} no such method: {}.{}", self, meta.service, meta.method);
                return false;
            }
        };

        let mut request = request_proto();
        if !request.decode(&payload[meta_len..meta_len + data_len]) {
            error!("{:?} request decode failed {}", self, meta);
            return false;
        }

        let canceled = Arc::new(AtomicBool::new(false));
        let compression = CompressKind::from_wire(meta.compression).unwrap_or(CompressKind::None);
        self.recvq.borrow_mut().push_back(SvrEntry {
            seq: meta.seq,
            compression,
            canceled: canceled.clone(),
        });

        let controller = ServerController::new(self.local.clone(), self.remote.clone(), canceled);
        let call = ServerCall {
            seq: meta.seq,
            conn_id: self.id,
            request,
            response: response_proto(),
            controller,
            reply: self.worker.queue_tx.clone(),
        };
        calls.push((svc, meta.method, call));
        *got_request = true;
        true
    }

    fn pump_recv(self: &Rc<Self>) -> Result<(), ()> {
        let mut calls: Vec<(Arc<dyn Service>, String, ServerCall)> = Vec::new();
        let mut got_request = false;

        let res = {
            let mut fr = self.framer.borrow_mut();
            let framer = match fr.as_mut() {
                Some(f) => f,
                None => return Ok(()),
            };
            let mut codec = self.worker.codec.get();
            framer.on_readable(&mut codec, |payload, meta_len, data_len| {
                self.recv_done(payload, meta_len, data_len, &mut calls, &mut got_request)
            })
        };

        if got_request {
            self.upd_keepalive();
        }
        // dispatch outside any borrow; inline handlers may finish
        // synchronously, the completion comes back through the queue
        for (svc, method, call) in calls.drain(..) {
            match svc.find_method(&method) {
                Some(m) => svc.dispatch(m, call),
                None => unreachable!(),
            }
        }

        match res {
            Ok(_) => Ok(()),
            Err(_) => {
                self.close();
                Err(())
            }
        }
    }

    fn send_done(self: &Rc<Self>) {
        let mut sendq = self.sendq.borrow_mut();
        let resp = sendq.pop_front().expect("send queue head");
        debug_assert_eq!(self.cur_send.get(), Some(resp.seq));
        self.cur_send.set(None);
        drop(sendq);
        trace!("{:?} response seq={} written", self, resp.seq);
        self.upd_keepalive();
    }

    fn pump_send(self: &Rc<Self>) -> Result<(), ()> {
        loop {
            let loaded = {
                let fr = self.framer.borrow();
                match fr.as_ref() {
                    Some(f) => f.loaded(),
                    None => return Ok(()),
                }
            };
            if !loaded {
                let staged = {
                    let mut fr = self.framer.borrow_mut();
                    let framer = match fr.as_mut() {
                        Some(f) => f,
                        None => return Ok(()),
                    };
                    let sendq = self.sendq.borrow();
                    match sendq.front() {
                        None => {
                            framer.disable_write(&self.worker.reactor);
                            return Ok(());
                        }
                        Some(resp) => {
                            let mut codec = self.worker.codec.get();
                            let data = resp.response.as_deref();
                            match framer.start_frame(&mut codec, resp.compression, &resp.meta, data)
                            {
                                Ok(_) => Some(resp.seq),
                                Err(_) => None,
                            }
                        }
                    }
                };
                match staged {
                    Some(seq) => self.cur_send.set(Some(seq)),
                    None => {
                        warn!("{:?} response encode failed", self);
                        self.close();
                        return Err(());
                    }
                }
            }

            let step = {
                let mut fr = self.framer.borrow_mut();
                match fr.as_mut() {
                    Some(f) => f.push_bytes(),
                    None => return Ok(()),
                }
            };
            match step {
                SendStep::Done => {
                    self.send_done();
                }
                SendStep::Partial => return Ok(()),
                SendStep::Error => {
                    self.close();
                    return Err(());
                }
            }
        }
    }
}

impl EventSink for ServerConn {
    fn on_io(self: Rc<Self>, readable: bool, writable: bool) {
        if !self.connected.get() {
            return;
        }
        if readable {
            if self.pump_recv().is_err() {
                return;
            }
        }
        if writable && self.connected.get() {
            let _ = self.pump_send();
        }
    }

    fn on_timer(self: Rc<Self>, _tag: u64) {
        debug!("{:?} keep-alive expired", self);
        self.close();
    }
}
