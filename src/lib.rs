//! # strand-rpc
//!
//! A reactor-based request/response RPC runtime over TCP: length-prefixed
//! framing with whole-frame compression, a thread-pinned client channel
//! that multiplexes calls over one connection, and a multi-worker server
//! that spreads accepted connections across per-thread event loops.
//!
//! ## Model
//!
//! - Every driving thread owns a [Reactor]; channels created on a thread
//!   are pumped by that thread ([Reactor::poll_once] / [Reactor::run_until]).
//! - A [Channel] issues calls with [Channel::call_method]; the completion
//!   closure runs exactly once with the outcome, whether the call
//!   succeeded, failed remotely, timed out or was canceled through its
//!   [CallHandle].
//! - A [Server] owns worker threads; each worker runs its own reactor and
//!   exclusively owns the connections dispatched to it. Handlers may
//!   finish a [ServerCall] from any thread, the completion is posted back
//!   to the owning worker.
//! - Transport faults on the client tear the connection down and
//!   retransmit in-flight requests after reconnecting; delivery is
//!   at-least-once and callers needing exactly-once must deduplicate.
//!
//! ## Example
//!
//! ```no_run
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use serde_derive::{Deserialize, Serialize};
//! use strand_rpc::*;
//!
//! #[derive(Serialize, Deserialize, Default)]
//! pub struct EchoRequest {
//!     pub text: String,
//! }
//!
//! #[derive(Serialize, Deserialize, Default)]
//! pub struct EchoResponse {
//!     pub text: String,
//! }
//!
//! pub struct EchoService;
//!
//! static METHODS: [MethodDesc; 1] = [MethodDesc {
//!     name: "Echo",
//!     request_proto: body_proto::<EchoRequest>,
//!     response_proto: body_proto::<EchoResponse>,
//! }];
//!
//! impl Service for EchoService {
//!     fn full_name(&self) -> &str {
//!         "example.Echo"
//!     }
//!     fn methods(&self) -> &[MethodDesc] {
//!         &METHODS
//!     }
//!     fn dispatch(&self, _method: &MethodDesc, mut call: ServerCall) {
//!         let text = call.request_as::<EchoRequest>().unwrap().text.clone();
//!         call.response_as::<EchoResponse>().unwrap().text = text;
//!         call.finish();
//!     }
//! }
//!
//! fn main() -> Result<(), Code> {
//!     let mut server = Server::new(ServerOptions::default(), None);
//!     server.add("127.0.0.1", 8150)?;
//!     server.register(Arc::new(EchoService), ServiceOwnership::ServerShares)?;
//!     server.start()?;
//!
//!     let reactor = Reactor::new().unwrap();
//!     let channel = Channel::new(ChannelOptions::default(), "127.0.0.1", 8150, &reactor);
//!     channel.open()?;
//!
//!     let done = Rc::new(Cell::new(false));
//!     let flag = done.clone();
//!     channel.call_method(
//!         "example.Echo",
//!         "Echo",
//!         CallOptions::default(),
//!         Box::new(EchoRequest { text: "hi".into() }),
//!         Box::new(EchoResponse::default()),
//!         Box::new(move |ctl, response| {
//!             if !ctl.failed() {
//!                 let resp = response.downcast::<EchoResponse>().unwrap();
//!                 println!("echo: {}", resp.text);
//!             }
//!             flag.set(true);
//!         }),
//!     )?;
//!     reactor.run_until(|| done.get(), Duration::from_secs(2)).unwrap();
//!     server.stop()?;
//!     Ok(())
//! }
//! ```

pub mod body;
pub mod client;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod framer;
pub mod net;
pub mod proto;
pub mod reactor;
pub mod server;
pub mod service;

pub use body::Body;
pub use client::{CallDone, CallHandle, Channel};
pub use codec::{CompressKind, SqueezeErr};
pub use config::{CallOptions, ChannelOptions, ServerOptions, WorkerInfo};
pub use controller::{ClientController, ServerController};
pub use error::Code;
pub use reactor::Reactor;
pub use server::Server;
pub use service::{body_proto, MethodDesc, ServerCall, Service, ServiceOwnership};
