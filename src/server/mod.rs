//! Server side: endpoint registration, listeners, the worker pool and the
//! service registry.

mod conn;
mod worker;

pub use worker::WorkerTask;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::*;
use mio::{Interest, Token};

use crate::config::ServerOptions;
use crate::error::Code;
use crate::net;
use crate::reactor::{EvSender, EventSink, Reactor};
use crate::service::{BuiltinService, Service, ServiceOwnership, BUILTIN_SERVICE};
use worker::{ListenCmd, WorkerHandle};

/// State shared by listeners and connections across worker threads:
/// options, the service registry snapshot and the dispatch cursor.
pub struct ServerShared {
    pub(crate) opts: ServerOptions,
    pub(crate) services: HashMap<String, Arc<dyn Service>>,
    pub(crate) workers: Vec<EvSender<WorkerTask>>,
    next_worker: AtomicUsize,
}

impl ServerShared {
    /// Round-robin an accepted socket to a worker.
    fn dispatch(self: &Arc<Self>, sock: mio::net::TcpStream, local: String, remote: String) {
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if !self.workers[idx].push(WorkerTask::Link { sock, local, remote, shared: self.clone() }) {
            error!("dispatch to worker {} failed", idx);
        }
    }
}

/// Accept-ready sink for one listening socket.
pub(crate) struct ListenerSink {
    listener: RefCell<mio::net::TcpListener>,
    token: Cell<Token>,
    shared: Arc<ServerShared>,
}

impl ListenerSink {
    pub(crate) fn attach(
        reactor: &Reactor, listener: mio::net::TcpListener, shared: Arc<ServerShared>,
    ) -> io::Result<Rc<ListenerSink>> {
        let sink = Rc::new(ListenerSink {
            listener: RefCell::new(listener),
            token: Cell::new(Token(usize::MAX)),
            shared,
        });
        let dynsink: Rc<dyn EventSink> = sink.clone();
        let token =
            reactor.register(&mut *sink.listener.borrow_mut(), Interest::READABLE, dynsink)?;
        sink.token.set(token);
        Ok(sink)
    }

    pub(crate) fn detach(&self, reactor: &Reactor) {
        reactor.deregister(&mut *self.listener.borrow_mut(), self.token.get());
    }

    fn accept_loop(&self) {
        loop {
            match self.listener.borrow().accept() {
                Ok((sock, peer)) => {
                    if let Err(e) = net::apply_stream_options(
                        &sock,
                        self.shared.opts.rbuf_size,
                        self.shared.opts.sbuf_size,
                    ) {
                        error!("socket options on accepted stream failed: {:?}", e);
                        continue;
                    }
                    let local = match sock.local_addr() {
                        Ok(a) => a.to_string(),
                        Err(_) => String::new(),
                    };
                    self.shared.dispatch(sock, local, peer.to_string());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {:?}", e);
                    break;
                }
            }
        }
    }
}

impl EventSink for ListenerSink {
    fn on_io(self: Rc<Self>, readable: bool, _writable: bool) {
        if readable {
            self.accept_loop();
        }
    }

    fn on_timer(self: Rc<Self>, _tag: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Init,
    Run,
    Exit,
}

/// An RPC server: registered services, one or more listening endpoints,
/// and a pool of worker threads the connections are spread over.
///
/// Built in `Init` state; `start` moves it to `Run`, `stop` to `Exit`.
/// Configuration calls outside the legal state return an error.
pub struct Server {
    opts: ServerOptions,
    state: State,
    tid: ThreadId,
    endpoints: Vec<(String, u16)>,
    bound: Vec<SocketAddr>,
    services: HashMap<String, (Arc<dyn Service>, ServiceOwnership)>,
    workers: Vec<WorkerHandle>,
    user_reactor: Option<Reactor>,
    local_listeners: Vec<Rc<ListenerSink>>,
    remote_listening: bool,
}

impl Server {
    /// Create a server. When `reactor` is given the listening sockets are
    /// driven by it (the caller keeps pumping); otherwise they attach to
    /// the last worker's reactor.
    pub fn new(options: ServerOptions, reactor: Option<&Reactor>) -> Server {
        let mut srv = Server {
            opts: options,
            state: State::Init,
            tid: thread::current().id(),
            endpoints: Vec::new(),
            bound: Vec::new(),
            services: HashMap::new(),
            workers: Vec::new(),
            user_reactor: reactor.cloned(),
            local_listeners: Vec::new(),
            remote_listening: false,
        };
        srv.services.insert(
            BUILTIN_SERVICE.to_string(),
            (Arc::new(BuiltinService), ServiceOwnership::ServerShares),
        );
        srv
    }

    #[inline]
    fn check_thread(&self) -> Result<(), Code> {
        if thread::current().id() != self.tid {
            error!("server used outside its owner thread");
            return Err(Code::WrongThread);
        }
        Ok(())
    }

    /// Add a transport endpoint. Only legal before `start`; duplicates
    /// are rejected. Port 0 binds an ephemeral port.
    pub fn add(&mut self, host: &str, port: u16) -> Result<(), Code> {
        self.check_thread()?;
        if host.is_empty() {
            error!("host address is empty");
            return Err(Code::BadArg);
        }
        if self.state != State::Init {
            error!("the server is in {:?} state", self.state);
            return Err(Code::Unknown);
        }
        let endpoint = (host.to_string(), port);
        if self.endpoints.contains(&endpoint) {
            error!("endpoint exists: {}:{}", host, port);
            return Err(Code::BadArg);
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Register a service under its full name. Only legal before `start`;
    /// duplicate names are rejected.
    pub fn register(
        &mut self, service: Arc<dyn Service>, ownership: ServiceOwnership,
    ) -> Result<(), Code> {
        self.check_thread()?;
        if self.state != State::Init {
            error!("the server is in {:?} state", self.state);
            return Err(Code::Unknown);
        }
        let fname = service.full_name().to_string();
        if self.services.contains_key(&fname) {
            error!("service exists: {}", fname);
            return Err(Code::ServiceExists);
        }
        self.services.insert(fname, (service, ownership));
        Ok(())
    }

    /// Remove a registered service; legal in `Init` and `Exit` only.
    pub fn unregister(&mut self, full_name: &str) -> Result<(), Code> {
        self.check_thread()?;
        if self.state == State::Run {
            error!("the server is in {:?} state", self.state);
            return Err(Code::Unknown);
        }
        if full_name.is_empty() {
            return Err(Code::BadArg);
        }
        match self.services.remove(full_name) {
            Some(_) => Ok(()),
            None => {
                error!("service not registered: {}", full_name);
                Err(Code::ServiceMissing)
            }
        }
    }

    /// The socket addresses actually bound after `start`; useful with
    /// ephemeral ports.
    pub fn bound_addrs(&self) -> &[SocketAddr] {
        &self.bound
    }

    /// Spawn the workers, bind every endpoint and begin accepting.
    pub fn start(&mut self) -> Result<(), Code> {
        self.check_thread()?;
        if self.state != State::Init {
            error!("the server is in {:?} state", self.state);
            return Err(Code::Unknown);
        }
        if self.endpoints.is_empty() {
            error!("no transport endpoint");
            return Err(Code::Unknown);
        }

        let num = self.opts.num_worker_threads.max(1);
        for i in 0..num {
            match worker::spawn(i, self.opts.clone()) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    error!("spawn worker {} failed: {:?}", i, e);
                    self.teardown_workers();
                    return Err(Code::Unknown);
                }
            }
        }

        let shared = Arc::new(ServerShared {
            opts: self.opts.clone(),
            services: self.services.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect(),
            workers: self.workers.iter().map(|w| w.tx.clone()).collect(),
            next_worker: AtomicUsize::new(0),
        });

        let mut listeners = Vec::new();
        for (host, port) in &self.endpoints {
            let addrs = match net::resolve_addr(host, *port) {
                Ok(a) => a,
                Err(e) => {
                    error!("resolve {}:{} failed: {:?}", host, port, e);
                    continue;
                }
            };
            for addr in addrs {
                match net::build_listener(&addr) {
                    Ok(l) => {
                        if let Ok(bound) = l.local_addr() {
                            self.bound.push(bound);
                        }
                        listeners.push(l);
                    }
                    Err(e) => {
                        error!("listen on {} failed: {:?}", addr, e);
                    }
                }
            }
        }
        if listeners.is_empty() {
            error!("no endpoint could be bound");
            self.teardown_workers();
            self.bound.clear();
            return Err(Code::Unknown);
        }

        match self.user_reactor.clone() {
            Some(reactor) => {
                for listener in listeners {
                    match ListenerSink::attach(&reactor, listener, shared.clone()) {
                        Ok(sink) => self.local_listeners.push(sink),
                        Err(e) => {
                            error!("listener register failed: {:?}", e);
                        }
                    }
                }
                if self.local_listeners.is_empty() {
                    self.teardown_workers();
                    self.bound.clear();
                    return Err(Code::Unknown);
                }
            }
            None => {
                // the listeners live on the last worker's reactor; the
                // registration is serialized through its event queue
                let (done_tx, done_rx) = std::sync::mpsc::sync_channel::<bool>(1);
                let cmd = ListenCmd::Start { listeners, shared: shared.clone(), done: done_tx };
                self.workers.last().unwrap().tx.push(WorkerTask::Listen(cmd));
                match done_rx.recv() {
                    Ok(true) => {
                        self.remote_listening = true;
                    }
                    _ => {
                        error!("listener setup on worker failed");
                        self.teardown_workers();
                        self.bound.clear();
                        return Err(Code::Unknown);
                    }
                }
            }
        }

        self.state = State::Run;
        Ok(())
    }

    /// Stop accepting, close all connections and join the workers.
    pub fn stop(&mut self) -> Result<(), Code> {
        self.check_thread()?;

        if let Some(reactor) = self.user_reactor.clone() {
            for sink in self.local_listeners.drain(..) {
                sink.detach(&reactor);
            }
        }
        if self.remote_listening {
            let (done_tx, done_rx) = std::sync::mpsc::sync_channel::<bool>(1);
            if self.workers.last().unwrap().tx.push(WorkerTask::Listen(ListenCmd::Stop {
                done: done_tx,
            })) {
                let _ = done_rx.recv();
            }
            self.remote_listening = false;
        }

        self.teardown_workers();
        self.bound.clear();
        self.state = State::Exit;
        Ok(())
    }

    fn teardown_workers(&mut self) {
        for w in self.workers.iter_mut() {
            w.shutdown();
        }
        self.workers.clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.state == State::Run {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{body_proto, MethodDesc, ServerCall};

    struct NopService;
    static NOP_METHODS: [MethodDesc; 1] = [MethodDesc {
        name: "Nop",
        request_proto: body_proto::<()>,
        response_proto: body_proto::<()>,
    }];

    impl Service for NopService {
        fn full_name(&self) -> &str {
            "test.Nop"
        }
        fn methods(&self) -> &[MethodDesc] {
            &NOP_METHODS
        }
        fn dispatch(&self, _m: &MethodDesc, call: ServerCall) {
            call.finish();
        }
    }

    #[test]
    fn test_state_machine() {
        let mut srv = Server::new(ServerOptions::default(), None);
        assert_eq!(srv.add("", 1), Err(Code::BadArg));
        assert!(srv.add("127.0.0.1", 1).is_ok());
        assert_eq!(srv.add("127.0.0.1", 1), Err(Code::BadArg));

        assert!(srv.register(Arc::new(NopService), ServiceOwnership::ServerOwns).is_ok());
        assert_eq!(
            srv.register(Arc::new(NopService), ServiceOwnership::ServerOwns),
            Err(Code::ServiceExists)
        );
        assert!(srv.unregister("test.Nop").is_ok());
        assert_eq!(srv.unregister("test.Nop"), Err(Code::ServiceMissing));

        // the builtin status service is there from the start
        assert_eq!(
            srv.register(Arc::new(BuiltinService), ServiceOwnership::ServerShares),
            Err(Code::ServiceExists)
        );
    }

    #[test]
    fn test_start_stop() {
        let mut opts = ServerOptions::default();
        opts.num_worker_threads = 2;
        let mut srv = Server::new(opts, None);
        srv.add("127.0.0.1", 0).expect("add");
        srv.register(Arc::new(NopService), ServiceOwnership::ServerOwns).expect("register");
        srv.start().expect("start");
        assert!(!srv.bound_addrs().is_empty());
        assert!(srv.bound_addrs()[0].port() > 0);
        // registration is sealed while running
        assert_eq!(srv.add("127.0.0.1", 1), Err(Code::Unknown));
        assert_eq!(srv.unregister("test.Nop"), Err(Code::Unknown));
        srv.stop().expect("stop");
        // and legal again after exit
        assert!(srv.unregister("test.Nop").is_ok());
    }
}
