#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use captains_log::recipe;
use log::*;
use serde_derive::{Deserialize, Serialize};
use strand_rpc::*;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = recipe::raw_file_logger("/tmp", Level::Trace).test().build();
    });
}

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct EchoRequest {
    pub text: String,
    pub delay_ms: u64,
}

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct EchoResponse {
    pub text: String,
}

fn reversed(s: &str) -> String {
    s.chars().rev().collect()
}

/// Test service:
/// - Echo: reply with the request string reversed
/// - Reject: fail with a user-defined error
/// - Defer: reply like Echo, but from another thread after `delay_ms`
pub struct EchoService;

static ECHO_METHODS: [MethodDesc; 3] = [
    MethodDesc {
        name: "Echo",
        request_proto: body_proto::<EchoRequest>,
        response_proto: body_proto::<EchoResponse>,
    },
    MethodDesc {
        name: "Reject",
        request_proto: body_proto::<EchoRequest>,
        response_proto: body_proto::<EchoResponse>,
    },
    MethodDesc {
        name: "Defer",
        request_proto: body_proto::<EchoRequest>,
        response_proto: body_proto::<EchoResponse>,
    },
];

impl Service for EchoService {
    fn full_name(&self) -> &str {
        "test.Echo"
    }

    fn methods(&self) -> &[MethodDesc] {
        &ECHO_METHODS
    }

    fn dispatch(&self, method: &MethodDesc, mut call: ServerCall) {
        let req = call.request_as::<EchoRequest>().expect("request type");
        let text = reversed(&req.text);
        let delay = req.delay_ms;
        match method.name {
            "Echo" => {
                call.response_as::<EchoResponse>().unwrap().text = text;
                call.finish();
            }
            "Reject" => {
                call.controller.set_failed("refused");
                call.finish();
            }
            "Defer" => {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(delay));
                    call.response_as::<EchoResponse>().unwrap().text = text;
                    call.finish();
                });
            }
            _ => unreachable!(),
        }
    }
}

pub fn start_server(workers: usize, keep_alive: u64) -> Server {
    let mut opts = ServerOptions::default();
    opts.num_worker_threads = workers;
    opts.keep_alive_time = keep_alive;
    let mut srv = Server::new(opts, None);
    srv.add("127.0.0.1", 0).expect("add endpoint");
    srv.register(Arc::new(EchoService), ServiceOwnership::ServerShares).expect("register");
    srv.start().expect("server start");
    info!("test server on {:?}", srv.bound_addrs());
    srv
}

pub fn start_server_on(port: u16, workers: usize) -> Server {
    let mut opts = ServerOptions::default();
    opts.num_worker_threads = workers;
    let mut srv = Server::new(opts, None);
    srv.add("127.0.0.1", port).expect("add endpoint");
    srv.register(Arc::new(EchoService), ServiceOwnership::ServerShares).expect("register");
    srv.start().expect("server start");
    srv
}

pub fn server_port(srv: &Server) -> u16 {
    srv.bound_addrs()[0].port()
}

pub fn quick_channel_options() -> ChannelOptions {
    let mut opts = ChannelOptions::default();
    opts.connect_timeout = 1000;
    opts.retry_interval = 100;
    opts
}

pub fn open_channel(reactor: &Reactor, port: u16, opts: ChannelOptions) -> Channel {
    let channel = Channel::new(opts, "127.0.0.1", port, reactor);
    channel.open().expect("open channel");
    channel
}

pub fn echo_request(text: &str) -> Box<dyn Body> {
    Box::new(EchoRequest { text: text.to_string(), delay_ms: 0 })
}

pub fn defer_request(text: &str, delay_ms: u64) -> Box<dyn Body> {
    Box::new(EchoRequest { text: text.to_string(), delay_ms })
}
