use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::EventSink;

struct TimerEntry {
    sink: Weak<dyn EventSink>,
    tag: u64,
}

/// Millisecond one-shot timers for one reactor.
///
/// A binary heap orders deadlines; cancellation removes the live entry and
/// leaves the heap slot to be discarded lazily on pop.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: FxHashMap<u64, TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self { heap: BinaryHeap::new(), live: FxHashMap::default(), next_id: 0 }
    }

    pub(crate) fn set(&mut self, delay: Duration, sink: Weak<dyn EventSink>, tag: u64) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.live.insert(id, TimerEntry { sink, tag });
        self.heap.push(Reverse((Instant::now() + delay, id)));
        id
    }

    pub(crate) fn cancel(&mut self, id: u64) {
        self.live.remove(&id);
    }

    /// Time to the earliest live deadline; `None` when no timer is armed.
    pub(crate) fn next_wait(&mut self, now: Instant) -> Option<Duration> {
        loop {
            match self.heap.peek() {
                None => return None,
                Some(Reverse((deadline, id))) => {
                    if !self.live.contains_key(id) {
                        self.heap.pop();
                        continue;
                    }
                    if *deadline <= now {
                        return Some(Duration::ZERO);
                    }
                    return Some(*deadline - now);
                }
            }
        }
    }

    /// Pop every deadline at or before `now` and resolve it to its sink.
    pub(crate) fn collect_due(&mut self, now: Instant, out: &mut Vec<(Rc<dyn EventSink>, u64)>) {
        while let Some(Reverse((deadline, id))) = self.heap.peek().cloned() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.live.remove(&id) {
                if let Some(sink) = entry.sink.upgrade() {
                    out.push((sink, entry.tag));
                }
            }
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// Owner-side handle of an armed timer. Dropping the handle cancels the
/// timer, so a message going away never leaves a watcher behind.
pub struct TimerHandle {
    queue: Weak<RefCell<TimerQueue>>,
    id: u64,
}

impl TimerHandle {
    pub(crate) fn new(queue: Weak<RefCell<TimerQueue>>, id: u64) -> Self {
        Self { queue, id }
    }

    pub fn cancel(&self) {
        if let Some(q) = self.queue.upgrade() {
            q.borrow_mut().cancel(self.id);
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Probe {
        fired: Cell<u64>,
    }

    impl EventSink for Probe {
        fn on_io(self: Rc<Self>, _readable: bool, _writable: bool) {}
        fn on_timer(self: Rc<Self>, tag: u64) {
            self.fired.set(self.fired.get() + tag);
        }
    }

    #[test]
    fn test_order_and_fire() {
        let mut q = TimerQueue::new();
        let probe = Rc::new(Probe { fired: Cell::new(0) });
        let sink: Rc<dyn EventSink> = probe.clone();

        q.set(Duration::from_millis(50), Rc::downgrade(&sink), 1);
        q.set(Duration::from_millis(5), Rc::downgrade(&sink), 10);

        let now = Instant::now();
        assert!(q.next_wait(now).is_some());

        let mut due = Vec::new();
        q.collect_due(now + Duration::from_millis(10), &mut due);
        assert_eq!(due.len(), 1);
        for (s, tag) in due.drain(..) {
            s.on_timer(tag);
        }
        assert_eq!(probe.fired.get(), 10);

        q.collect_due(now + Duration::from_millis(100), &mut due);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, 1);
    }

    #[test]
    fn test_cancel() {
        let mut q = TimerQueue::new();
        let probe = Rc::new(Probe { fired: Cell::new(0) });
        let sink: Rc<dyn EventSink> = probe.clone();

        let id = q.set(Duration::from_millis(1), Rc::downgrade(&sink), 7);
        q.cancel(id);
        assert_eq!(q.live_count(), 0);

        let mut due = Vec::new();
        q.collect_due(Instant::now() + Duration::from_secs(1), &mut due);
        assert!(due.is_empty());
        assert!(q.next_wait(Instant::now()).is_none());
    }

    #[test]
    fn test_dead_sink_skipped() {
        let mut q = TimerQueue::new();
        {
            let probe = Rc::new(Probe { fired: Cell::new(0) });
            let sink: Rc<dyn EventSink> = probe;
            q.set(Duration::from_millis(1), Rc::downgrade(&sink), 1);
        }
        let mut due = Vec::new();
        q.collect_due(Instant::now() + Duration::from_secs(1), &mut due);
        assert!(due.is_empty());
    }
}
