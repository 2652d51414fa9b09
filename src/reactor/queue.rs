use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::*;

/// Producer half of a cross-thread event queue. Pushing wakes the owning
/// reactor; the consumer drains on the reactor's own thread.
pub struct EvSender<T> {
    tx: Sender<T>,
    waker: Arc<mio::Waker>,
}

impl<T> Clone for EvSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), waker: self.waker.clone() }
    }
}

impl<T: Send> EvSender<T> {
    /// Enqueue and wake. Returns false when the consumer is gone.
    pub fn push(&self, task: T) -> bool {
        if self.tx.send(task).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            error!("reactor wake failed: {:?}", e);
        }
        true
    }
}

/// Consumer half, owned by the reactor thread.
pub struct EvReceiver<T> {
    rx: Receiver<T>,
}

impl<T> EvReceiver<T> {
    #[inline]
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

pub fn ev_queue<T: Send>(waker: Arc<mio::Waker>) -> (EvSender<T>, EvReceiver<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EvSender { tx, waker }, EvReceiver { rx })
}
