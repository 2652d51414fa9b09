use log::*;

use crate::body::Body;
use crate::controller::ServerController;
use crate::error::Code;
use crate::proto::Meta;
use crate::reactor::EvSender;
use crate::server::WorkerTask;

pub type BodyProto = fn() -> Box<dyn Body>;

/// Prototype constructor usable in [MethodDesc] tables:
/// `request_proto: body_proto::<EchoRequest>`.
pub fn body_proto<T: Body + Default>() -> Box<dyn Body> {
    Box::new(T::default())
}

/// One method of a service: routing name plus the prototypes the server
/// allocates request/response values from.
pub struct MethodDesc {
    pub name: &'static str,
    pub request_proto: BodyProto,
    pub response_proto: BodyProto,
}

/// A registered RPC service. Implementations come from the schema glue;
/// the runtime routes by `full_name` and the method table.
pub trait Service: Send + Sync + 'static {
    /// Fully qualified name, e.g. "echo.EchoService".
    fn full_name(&self) -> &str;

    fn methods(&self) -> &[MethodDesc];

    /// Handle one decoded request. The implementation fills
    /// `call.response`, optionally stamps `call.controller`, and must
    /// eventually run `call.finish()`; finishing from another thread is
    /// fine, delivery is posted back to the worker that owns the
    /// connection.
    fn dispatch(&self, method: &MethodDesc, call: ServerCall);

    fn find_method(&self, name: &str) -> Option<&MethodDesc> {
        self.methods().iter().find(|m| m.name == name)
    }
}

/// Whether the server drops the service when it is unregistered or
/// stopped, or the caller keeps sharing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOwnership {
    ServerOwns,
    ServerShares,
}

/// One in-flight request on the server, owned by the handler between
/// dispatch and finish.
pub struct ServerCall {
    pub(crate) seq: u64,
    pub(crate) conn_id: u64,
    pub request: Box<dyn Body>,
    pub response: Box<dyn Body>,
    pub controller: ServerController,
    pub(crate) reply: EvSender<WorkerTask>,
}

impl ServerCall {
    /// Complete the call. The response (or the controller's failure) is
    /// routed back to the worker thread owning the connection, which
    /// queues the response frame.
    pub fn finish(mut self) {
        self.controller.run_hook();
        let reply = self.reply.clone();
        if !reply.push(WorkerTask::Reply(self)) {
            debug!("reply dropped, the worker is gone");
        }
    }

    /// Decoded request, downcast to its schema type.
    #[inline]
    pub fn request_as<T: 'static>(&self) -> Option<&T> {
        self.request.as_any().downcast_ref::<T>()
    }

    /// Response value to fill, downcast to its schema type.
    #[inline]
    pub fn response_as<T: 'static>(&mut self) -> Option<&mut T> {
        self.response.as_any_mut().downcast_mut::<T>()
    }
}

/// The builtin status service answering channel heartbeats. Registered on
/// every server as a shared (non-owned) service.
pub(crate) struct BuiltinService;

pub(crate) const BUILTIN_SERVICE: &str = "strand.Builtin";
pub(crate) const BUILTIN_STATUS: &str = "Status";

static BUILTIN_METHODS: [MethodDesc; 1] = [MethodDesc {
    name: BUILTIN_STATUS,
    request_proto: body_proto::<()>,
    response_proto: body_proto::<()>,
}];

impl Service for BuiltinService {
    fn full_name(&self) -> &str {
        BUILTIN_SERVICE
    }

    fn methods(&self) -> &[MethodDesc] {
        &BUILTIN_METHODS
    }

    fn dispatch(&self, _method: &MethodDesc, call: ServerCall) {
        call.finish();
    }
}

/// Fill a request meta for `service`/`method`.
pub(crate) fn request_meta(seq: u64, service: &str, method: &str, compression: u8) -> Meta {
    let mut meta = Meta::default();
    meta.seq = seq;
    meta.service = service.to_string();
    meta.method = method.to_string();
    meta.compression = compression;
    meta
}

/// Fill a response meta echoing `seq`, carrying `code` when not ok.
pub(crate) fn response_meta(seq: u64, code: Code, error_text: &str) -> Meta {
    let mut meta = Meta::default();
    meta.seq = seq;
    meta.code = code as u32;
    if code == Code::UserDefined {
        meta.error_text = error_text.to_string();
    }
    meta
}
