use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::*;
use rustc_hash::FxHashMap;

use super::conn::ServerConn;
use super::{ListenerSink, ServerShared};
use crate::codec::CodecHandle;
use crate::config::{ServerOptions, WorkerInfo};
use crate::reactor::{ev_queue, EvReceiver, EvSender, Reactor};
use crate::service::ServerCall;

/// Cross-thread task posted to a worker's event queue.
pub enum WorkerTask {
    /// Adopt an accepted socket; the worker constructs the server
    /// connection on its own thread.
    Link { sock: mio::net::TcpStream, local: String, remote: String, shared: Arc<ServerShared> },
    /// Attach or detach the listening sockets on this worker's reactor.
    Listen(ListenCmd),
    /// A handler finished a call somewhere; route the response back to
    /// the owning connection.
    Reply(ServerCall),
    Quit,
}

pub enum ListenCmd {
    Start {
        listeners: Vec<mio::net::TcpListener>,
        shared: Arc<ServerShared>,
        done: SyncSender<bool>,
    },
    Stop {
        done: SyncSender<bool>,
    },
}

/// Thread-local state of one worker: its reactor, codec, and the server
/// connections living on it.
pub(crate) struct WorkerCtx {
    pub(crate) index: usize,
    pub(crate) opts: ServerOptions,
    pub(crate) reactor: Reactor,
    pub(crate) codec: CodecHandle,
    pub(crate) queue_tx: EvSender<WorkerTask>,
    pub(crate) conns: RefCell<FxHashMap<u64, Rc<ServerConn>>>,
    next_conn_id: Cell<u64>,
    listeners: RefCell<Vec<Rc<ListenerSink>>>,
}

impl WorkerCtx {
    #[inline]
    pub(crate) fn next_conn_id(&self) -> u64 {
        let id = self.next_conn_id.get() + 1;
        self.next_conn_id.set(id);
        id
    }

    /// Drop a released connection from the live set.
    pub(crate) fn unlink(&self, conn_id: u64) {
        if self.conns.borrow_mut().remove(&conn_id).is_none() {
            error!("worker {} unlink of unknown conn {}", self.index, conn_id);
        }
    }
}

pub(crate) struct WorkerHandle {
    pub(crate) tx: EvSender<WorkerTask>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to exit and wait for it.
    pub(crate) fn shutdown(&mut self) {
        self.tx.push(WorkerTask::Quit);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn a worker thread: reactor, event queue, thread codec, then the
/// poll/drain loop until Quit.
pub(crate) fn spawn(index: usize, opts: ServerOptions) -> io::Result<WorkerHandle> {
    let (boot_tx, boot_rx) = std::sync::mpsc::channel::<io::Result<EvSender<WorkerTask>>>();
    let name = format!("rpc/slave{:02}", index);
    let thread_name = name.clone();

    let join = std::thread::Builder::new().name(thread_name).spawn(move || {
        let reactor = match Reactor::new() {
            Ok(r) => r,
            Err(e) => {
                error!("worker {} reactor setup failed: {:?}", index, e);
                let _ = boot_tx.send(Err(e));
                return;
            }
        };
        let (tx, rx) = ev_queue::<WorkerTask>(reactor.waker());
        if boot_tx.send(Ok(tx.clone())).is_err() {
            return;
        }
        run_worker(index, name, opts, reactor, tx, rx);
    })?;

    match boot_rx.recv() {
        Ok(Ok(tx)) => Ok(WorkerHandle { tx, join: Some(join) }),
        Ok(Err(e)) => {
            let _ = join.join();
            Err(e)
        }
        Err(_) => {
            let _ = join.join();
            Err(io::Error::new(io::ErrorKind::Other, "worker died during setup"))
        }
    }
}

fn run_worker(
    index: usize, name: String, opts: ServerOptions, reactor: Reactor,
    tx: EvSender<WorkerTask>, rx: EvReceiver<WorkerTask>,
) {
    let info = WorkerInfo { name, index };
    let init_hook = opts.init_hook.clone();
    let exit_hook = opts.exit_hook.clone();

    let ctx = Rc::new(WorkerCtx {
        index,
        opts,
        reactor: reactor.clone(),
        codec: CodecHandle::acquire(),
        queue_tx: tx,
        conns: RefCell::new(FxHashMap::default()),
        next_conn_id: Cell::new(0),
        listeners: RefCell::new(Vec::new()),
    });

    if let Some(hook) = init_hook.as_ref() {
        hook(&info);
    }
    debug!("worker {} running", index);

    let mut quit = false;
    while !quit {
        if let Err(e) = reactor.poll_once(None) {
            error!("worker {} poll failed: {:?}", index, e);
            break;
        }
        while let Some(task) = rx.try_recv() {
            match task {
                WorkerTask::Link { sock, local, remote, shared } => {
                    handle_link(&ctx, sock, local, remote, shared);
                }
                WorkerTask::Listen(cmd) => {
                    handle_listen(&ctx, cmd);
                }
                WorkerTask::Reply(call) => {
                    let conn = ctx.conns.borrow().get(&call.conn_id).cloned();
                    match conn {
                        Some(conn) => conn.on_reply(call),
                        None => {
                            debug!("worker {} reply for released conn {}", index, call.conn_id);
                        }
                    }
                }
                WorkerTask::Quit => {
                    quit = true;
                }
            }
        }
    }

    if let Some(hook) = exit_hook.as_ref() {
        hook(&info);
    }

    // close all live connections; queued responses are dropped, handlers
    // still out there find the queue gone when they finish
    let conns: Vec<Rc<ServerConn>> = ctx.conns.borrow().values().cloned().collect();
    for conn in conns {
        conn.close();
    }
    ctx.conns.borrow_mut().clear();
    ctx.listeners.borrow_mut().clear();
    debug!("worker {} exited", index);
}

fn handle_link(
    ctx: &Rc<WorkerCtx>, sock: mio::net::TcpStream, local: String, remote: String,
    shared: Arc<ServerShared>,
) {
    match ServerConn::link(ctx, sock, local, remote, shared) {
        Ok(conn) => {
            ctx.conns.borrow_mut().insert(conn.id(), conn);
        }
        Err(e) => {
            error!("worker {} adopting connection failed: {:?}", ctx.index, e);
        }
    }
}

fn handle_listen(ctx: &Rc<WorkerCtx>, cmd: ListenCmd) {
    match cmd {
        ListenCmd::Start { listeners, shared, done } => {
            let mut ok = false;
            for listener in listeners {
                match ListenerSink::attach(&ctx.reactor, listener, shared.clone()) {
                    Ok(sink) => {
                        ctx.listeners.borrow_mut().push(sink);
                        ok = true;
                    }
                    Err(e) => {
                        error!("worker {} listener register failed: {:?}", ctx.index, e);
                    }
                }
            }
            let _ = done.send(ok);
        }
        ListenCmd::Stop { done } => {
            for sink in ctx.listeners.borrow_mut().drain(..) {
                sink.detach(&ctx.reactor);
            }
            let _ = done.send(true);
        }
    }
}
