//! Single-threaded readiness loop: one [Reactor] per driving thread
//! multiplexes socket readiness, millisecond timers and a cross-thread
//! wake-up over one `mio::Poll`.
//!
//! Connections and listeners register as [EventSink]s; the reactor owns no
//! protocol state. Handles are `Rc`-shared and the whole structure is
//! pinned to the creating thread.

mod queue;
mod timer;

pub use queue::{ev_queue, EvReceiver, EvSender};
pub use timer::TimerHandle;
pub(crate) use timer::TimerQueue;

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::*;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use rustc_hash::FxHashMap;

const WAKER_TOKEN: Token = Token(0);

/// Receiver of readiness and timer callbacks.
///
/// Callbacks take `Rc<Self>` so a sink may drop its own registration while
/// handling an event.
pub trait EventSink {
    fn on_io(self: Rc<Self>, readable: bool, writable: bool);
    fn on_timer(self: Rc<Self>, tag: u64);
}

struct PollSet {
    poll: Poll,
    events: Events,
}

struct ReactorInner {
    registry: mio::Registry,
    pollset: RefCell<PollSet>,
    sinks: RefCell<FxHashMap<Token, Rc<dyn EventSink>>>,
    timers: Rc<RefCell<TimerQueue>>,
    next_token: Cell<usize>,
    waker: Arc<mio::Waker>,
    // scratch reused across poll iterations
    ready: RefCell<Vec<(Token, bool, bool)>>,
    due: RefCell<Vec<(Rc<dyn EventSink>, u64)>>,
}

/// Cheaply cloneable handle to the thread's event loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Reactor {
            inner: Rc::new(ReactorInner {
                registry,
                pollset: RefCell::new(PollSet { poll, events: Events::with_capacity(256) }),
                sinks: RefCell::new(FxHashMap::default()),
                timers: Rc::new(RefCell::new(TimerQueue::new())),
                next_token: Cell::new(1),
                waker,
                ready: RefCell::new(Vec::new()),
                due: RefCell::new(Vec::new()),
            }),
        })
    }

    /// The wake-up primitive used by cross-thread event queues.
    pub fn waker(&self) -> Arc<mio::Waker> {
        self.inner.waker.clone()
    }

    pub fn register<S: Source>(
        &self, source: &mut S, interest: Interest, sink: Rc<dyn EventSink>,
    ) -> io::Result<Token> {
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);
        self.inner.registry.register(source, token, interest)?;
        self.inner.sinks.borrow_mut().insert(token, sink);
        Ok(token)
    }

    /// Replace the interest set of a registered source. The poller does not
    /// mutate interest in place, the whole registration is swapped.
    pub fn rearm<S: Source>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.inner.registry.reregister(source, token, interest)
    }

    pub fn deregister<S: Source>(&self, source: &mut S, token: Token) {
        if let Err(e) = self.inner.registry.deregister(source) {
            debug!("deregister failed: {:?}", e);
        }
        self.inner.sinks.borrow_mut().remove(&token);
    }

    /// Arm a one-shot timer delivering `tag` to `sink` after `delay_ms`.
    /// The returned handle cancels on drop.
    pub fn set_timer(&self, delay_ms: u64, sink: &Rc<dyn EventSink>, tag: u64) -> TimerHandle {
        let id = self.inner.timers.borrow_mut().set(
            Duration::from_millis(delay_ms),
            Rc::downgrade(sink),
            tag,
        );
        TimerHandle::new(Rc::downgrade(&self.inner.timers), id)
    }

    /// One iteration: wait for readiness (bounded by the earliest timer and
    /// `max_wait`), dispatch I/O callbacks, then fire due timers.
    ///
    /// Queue tasks posted from other threads wake the poll; the caller
    /// drains its queue after this returns.
    pub fn poll_once(&self, max_wait: Option<Duration>) -> io::Result<()> {
        let now = Instant::now();
        let timer_wait = self.inner.timers.borrow_mut().next_wait(now);
        let wait = match (timer_wait, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        {
            let mut set = self.inner.pollset.borrow_mut();
            let set = &mut *set;
            match set.poll.poll(&mut set.events, wait) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            let mut ready = self.inner.ready.borrow_mut();
            ready.clear();
            for ev in set.events.iter() {
                if ev.token() == WAKER_TOKEN {
                    continue;
                }
                ready.push((ev.token(), ev.is_readable(), ev.is_writable()));
            }
        }

        let mut idx = 0;
        loop {
            let item = {
                let ready = self.inner.ready.borrow();
                if idx >= ready.len() {
                    break;
                }
                ready[idx]
            };
            idx += 1;
            let sink = self.inner.sinks.borrow().get(&item.0).cloned();
            if let Some(sink) = sink {
                sink.on_io(item.1, item.2);
            }
        }

        let now = Instant::now();
        {
            let mut due = self.inner.due.borrow_mut();
            due.clear();
            self.inner.timers.borrow_mut().collect_due(now, &mut due);
        }
        let mut idx = 0;
        loop {
            let item = {
                let due = self.inner.due.borrow();
                if idx >= due.len() {
                    break;
                }
                (due[idx].0.clone(), due[idx].1)
            };
            idx += 1;
            item.0.on_timer(item.1);
        }

        Ok(())
    }

    /// Pump the loop until `cond` holds or `limit` elapses. Returns whether
    /// the condition was met. Test and simple-client convenience.
    pub fn run_until<F: FnMut() -> bool>(&self, mut cond: F, limit: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + limit;
        loop {
            if cond() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.poll_once(Some((deadline - now).min(Duration::from_millis(50))))?;
        }
    }
}
