use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::*;

use crate::error::Code;

/// Outcome of one client call, handed to the completion callback.
pub struct ClientController {
    pub(crate) code: Code,
    pub(crate) error_text: String,
    pub(crate) local_addr: String,
    pub(crate) remote_addr: String,
    pub(crate) seq: u64,
}

impl ClientController {
    pub(crate) fn new(seq: u64) -> Self {
        Self {
            code: Code::Ok,
            error_text: String::new(),
            local_addr: String::new(),
            remote_addr: String::new(),
            seq,
        }
    }

    #[inline(always)]
    pub fn failed(&self) -> bool {
        !self.code.is_ok()
    }

    #[inline(always)]
    pub fn code(&self) -> Code {
        self.code
    }

    pub fn error_text(&self) -> String {
        match self.code {
            Code::Ok => String::new(),
            Code::UserDefined => self.error_text.clone(),
            c => c.to_string(),
        }
    }

    /// The local address the request went out from, "ip:port".
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// The remote address the request went to, "ip:port".
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    #[inline(always)]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Server-side view of one request, owned by the handler through
/// [crate::service::ServerCall].
pub struct ServerController {
    pub(crate) code: Code,
    pub(crate) error_text: String,
    pub(crate) local_addr: String,
    pub(crate) remote_addr: String,
    canceled: Arc<AtomicBool>,
    cancel_hook: Option<Box<dyn FnOnce() + Send>>,
    hook_seen: bool,
}

impl ServerController {
    pub(crate) fn new(local_addr: String, remote_addr: String, canceled: Arc<AtomicBool>) -> Self {
        Self {
            code: Code::Ok,
            error_text: String::new(),
            local_addr,
            remote_addr,
            canceled,
            cancel_hook: None,
            hook_seen: false,
        }
    }

    /// Make the client-side completion observe a failure. `reason` reaches
    /// the peer as the error text of a user-defined failure. Prefer
    /// encoding machine-readable errors into the response itself.
    pub fn set_failed(&mut self, reason: &str) {
        self.code = Code::UserDefined;
        self.error_text = reason.to_string();
    }

    #[inline(always)]
    pub fn failed(&self) -> bool {
        !self.code.is_ok()
    }

    /// Whether the client has asked to cancel this call. The handler may
    /// give up on the work; it still must finish the call.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Register a hook running exactly once when the call finishes or is
    /// canceled. At most one registration per call.
    pub fn notify_on_cancel(&mut self, hook: Box<dyn FnOnce() + Send>) -> Result<(), Code> {
        if self.hook_seen {
            error!("notify_on_cancel registered twice on one call");
            return Err(Code::BadArg);
        }
        self.hook_seen = true;
        if self.is_canceled() {
            hook();
        } else {
            self.cancel_hook = Some(hook);
        }
        Ok(())
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub(crate) fn run_hook(&mut self) {
        if let Some(hook) = self.cancel_hook.take() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_client_controller_text() {
        let mut ctl = ClientController::new(3);
        assert!(!ctl.failed());
        assert_eq!(ctl.error_text(), "");

        ctl.code = Code::Timeout;
        assert!(ctl.failed());
        assert_eq!(ctl.error_text(), "the RPC timed out");

        ctl.code = Code::UserDefined;
        ctl.error_text = "boom".to_string();
        assert_eq!(ctl.error_text(), "boom");
    }

    #[test]
    fn test_server_controller_cancel_hook() {
        let canceled = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicU32::new(0));

        let mut ctl = ServerController::new(String::new(), String::new(), canceled.clone());
        let h = hits.clone();
        ctl.notify_on_cancel(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("register");
        assert!(ctl.notify_on_cancel(Box::new(|| {})).is_err());

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        ctl.run_hook();
        ctl.run_hook();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_server_controller_hook_after_cancel() {
        let canceled = Arc::new(AtomicBool::new(true));
        let hits = Arc::new(AtomicU32::new(0));
        let mut ctl = ServerController::new(String::new(), String::new(), canceled);
        assert!(ctl.is_canceled());
        let h = hits.clone();
        ctl.notify_on_cancel(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("register");
        // already canceled, ran immediately
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        ctl.run_hook();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
