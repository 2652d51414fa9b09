mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use strand_rpc::*;

/// Echo-style service that records the order requests arrive in and
/// replies from another thread after a fixed delay.
struct RecorderService {
    seen: Arc<Mutex<Vec<String>>>,
    reply_delay_ms: u64,
}

static RECORDER_METHODS: [MethodDesc; 1] = [MethodDesc {
    name: "Echo",
    request_proto: body_proto::<EchoRequest>,
    response_proto: body_proto::<EchoResponse>,
}];

impl Service for RecorderService {
    fn full_name(&self) -> &str {
        "test.Recorder"
    }

    fn methods(&self) -> &[MethodDesc] {
        &RECORDER_METHODS
    }

    fn dispatch(&self, _method: &MethodDesc, mut call: ServerCall) {
        let text = call.request_as::<EchoRequest>().unwrap().text.clone();
        self.seen.lock().unwrap().push(text.clone());
        let delay = self.reply_delay_ms;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(delay));
            call.response_as::<EchoResponse>().unwrap().text = text;
            call.finish();
        });
    }
}

fn recorder_server(port: u16, delay_ms: u64) -> (Server, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut opts = ServerOptions::default();
    opts.num_worker_threads = 1;
    let mut srv = Server::new(opts, None);
    srv.add("127.0.0.1", port).expect("add");
    srv.register(
        Arc::new(RecorderService { seen: seen.clone(), reply_delay_ms: delay_ms }),
        ServiceOwnership::ServerOwns,
    )
    .expect("register");
    srv.start().expect("start");
    (srv, seen)
}

// A transport fault with calls in flight: the channel must reconnect after
// the retry interval and retransmit every in-flight request, in the
// original enqueue order, before completing them all.
#[test]
fn test_reconnect_retransmits_in_flight() {
    setup();
    let (mut srv, seen1) = recorder_server(0, 400);
    let port = srv.bound_addrs()[0].port();

    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, port, quick_channel_options());

    const N: usize = 3;
    let done: Rc<RefCell<Vec<Code>>> = Rc::new(RefCell::new(Vec::new()));
    for i in 0..N {
        let slot = done.clone();
        let text = format!("burst-{}", i);
        let expect: String = text.clone();
        channel
            .call_method(
                "test.Recorder",
                "Echo",
                CallOptions { rpc_timeout: 10000, ..Default::default() },
                Box::new(EchoRequest { text, delay_ms: 0 }),
                Box::new(EchoResponse::default()),
                Box::new(move |ctl, response| {
                    if ctl.code() == Code::Ok {
                        let resp = response.downcast::<EchoResponse>().unwrap();
                        assert_eq!(resp.text, expect);
                    }
                    slot.borrow_mut().push(ctl.code());
                }),
            )
            .expect("call");
    }

    // let the requests reach the first server, whose replies are still
    // 400ms away, then kill it under them
    let _ = reactor.run_until(|| false, Duration::from_millis(150));
    assert_eq!(seen1.lock().unwrap().len(), N, "first server saw the burst");
    assert!(done.borrow().is_empty(), "no reply may have arrived yet");
    srv.stop().expect("stop");

    // restart on the same port; the channel retries every 100ms and must
    // resend all three
    let (mut srv2, seen2) = recorder_server(port, 10);

    let ok = reactor
        .run_until(|| done.borrow().len() == N, Duration::from_secs(8))
        .expect("pump");
    assert!(ok, "only {} of {} completed after reconnect", done.borrow().len(), N);
    for code in done.borrow().iter() {
        assert_eq!(*code, Code::Ok);
    }

    // retransmission hit the wire in the original enqueue order
    let order = seen2.lock().unwrap().clone();
    assert_eq!(order, vec!["burst-0", "burst-1", "burst-2"]);

    srv2.stop().expect("stop");
}

// The server closes idle connections via keep-alive; a channel with
// heartbeat probes stays connected through a quiet period.
#[test]
fn test_heartbeat_survives_keep_alive() {
    setup();
    let mut srv = start_server(1, 1);
    let reactor = Reactor::new().expect("reactor");
    let mut opts = quick_channel_options();
    opts.heartbeat_interval = 300;
    let channel = open_channel(&reactor, server_port(&srv), opts);

    // stay quiet past the 1s server keep-alive
    let _ = reactor.run_until(|| false, Duration::from_millis(2500));

    let done: Rc<RefCell<Option<Code>>> = Rc::new(RefCell::new(None));
    let slot = done.clone();
    channel
        .call_method(
            "test.Echo",
            "Echo",
            CallOptions::default(),
            echo_request("ping"),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, _| {
                slot.borrow_mut().replace(ctl.code());
            }),
        )
        .expect("call");
    let ok = reactor
        .run_until(|| done.borrow().is_some(), Duration::from_secs(3))
        .expect("pump");
    assert!(ok);
    assert_eq!(done.borrow_mut().take().unwrap(), Code::Ok);

    srv.stop().expect("stop");
}
