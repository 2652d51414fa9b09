mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use common::*;
use strand_rpc::*;

#[test]
fn test_timeout_when_server_stalls() {
    setup();
    let mut srv = start_server(2, 3600);
    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, server_port(&srv), quick_channel_options());

    // rpc_timeout 50ms, the server replies after 500ms
    let fired: Rc<RefCell<Vec<Code>>> = Rc::new(RefCell::new(Vec::new()));
    let slot = fired.clone();
    let begin = Instant::now();
    channel
        .call_method(
            "test.Echo",
            "Defer",
            CallOptions { rpc_timeout: 50, ..Default::default() },
            defer_request("slow", 500),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, _| {
                slot.borrow_mut().push(ctl.code());
            }),
        )
        .expect("call");

    let ok = reactor
        .run_until(|| !fired.borrow().is_empty(), Duration::from_secs(2))
        .expect("pump");
    assert!(ok);
    let waited = begin.elapsed();
    assert!(waited >= Duration::from_millis(45), "fired after {:?}", waited);
    assert!(waited < Duration::from_millis(400), "fired after {:?}", waited);
    assert_eq!(fired.borrow()[0], Code::Timeout);

    // the late response frame arrives eventually and must be dropped
    // silently without a second completion
    let _ = reactor.run_until(|| false, Duration::from_millis(800));
    assert_eq!(fired.borrow().len(), 1);

    srv.stop().expect("stop");
}

#[test]
fn test_timeout_with_no_server() {
    setup();
    let reactor = Reactor::new().expect("reactor");
    // nothing listens here; the channel keeps retrying while the timeout
    // watcher runs independently
    let channel = open_channel(&reactor, 1, quick_channel_options());

    let fired: Rc<RefCell<Vec<Code>>> = Rc::new(RefCell::new(Vec::new()));
    let slot = fired.clone();
    channel
        .call_method(
            "test.Echo",
            "Echo",
            CallOptions { rpc_timeout: 100, ..Default::default() },
            echo_request("void"),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, _| {
                slot.borrow_mut().push(ctl.code());
            }),
        )
        .expect("call");

    let ok = reactor
        .run_until(|| !fired.borrow().is_empty(), Duration::from_secs(2))
        .expect("pump");
    assert!(ok);
    assert_eq!(fired.borrow().as_slice(), &[Code::Timeout]);
}

#[test]
fn test_cancel_before_reply() {
    setup();
    let mut srv = start_server(2, 3600);
    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, server_port(&srv), quick_channel_options());

    let fired: Rc<RefCell<Vec<Code>>> = Rc::new(RefCell::new(Vec::new()));
    let slot = fired.clone();
    let handle = channel
        .call_method(
            "test.Echo",
            "Defer",
            CallOptions { rpc_timeout: 3000, ..Default::default() },
            defer_request("nope", 300),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, _| {
                slot.borrow_mut().push(ctl.code());
            }),
        )
        .expect("call");

    // let the request go out first, then cancel
    let _ = reactor.run_until(|| false, Duration::from_millis(50));
    handle.start_cancel().expect("cancel");
    assert!(!fired.borrow().is_empty(), "cancel completes synchronously");
    assert_eq!(fired.borrow()[0], Code::Canceled);

    // canceling again is a no-op, and the server's eventual response is
    // dropped without touching the completion again
    handle.start_cancel().expect("cancel twice");
    let _ = reactor.run_until(|| false, Duration::from_millis(600));
    assert_eq!(fired.borrow().len(), 1);

    srv.stop().expect("stop");
}

#[test]
fn test_cancel_queued_before_send() {
    setup();
    let reactor = Reactor::new().expect("reactor");
    // no server: the call never leaves the send queue
    let channel = open_channel(&reactor, 1, quick_channel_options());

    let fired = Rc::new(Cell::new(0u32));
    let slot = fired.clone();
    let handle = channel
        .call_method(
            "test.Echo",
            "Echo",
            CallOptions { rpc_timeout: 5000, ..Default::default() },
            echo_request("q"),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, _| {
                assert_eq!(ctl.code(), Code::Canceled);
                slot.set(slot.get() + 1);
            }),
        )
        .expect("call");

    handle.start_cancel().expect("cancel");
    assert_eq!(fired.get(), 1);
    let _ = reactor.run_until(|| false, Duration::from_millis(100));
    assert_eq!(fired.get(), 1);
}

#[test]
fn test_channel_cancel_all() {
    setup();
    let mut srv = start_server(2, 3600);
    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, server_port(&srv), quick_channel_options());

    let fired = Rc::new(Cell::new(0u32));
    for _ in 0..5 {
        let slot = fired.clone();
        channel
            .call_method(
                "test.Echo",
                "Defer",
                CallOptions { rpc_timeout: 5000, ..Default::default() },
                defer_request("all", 400),
                Box::new(EchoResponse::default()),
                Box::new(move |ctl, _| {
                    assert_eq!(ctl.code(), Code::Canceled);
                    slot.set(slot.get() + 1);
                }),
            )
            .expect("call");
    }
    let _ = reactor.run_until(|| false, Duration::from_millis(50));
    channel.cancel().expect("cancel all");
    assert_eq!(fired.get(), 5);

    // channel is still usable after a bulk cancel
    let done = Rc::new(Cell::new(false));
    let flag = done.clone();
    channel
        .call_method(
            "test.Echo",
            "Echo",
            CallOptions::default(),
            echo_request("still alive"),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, _| {
                assert_eq!(ctl.code(), Code::Ok);
                flag.set(true);
            }),
        )
        .expect("call");
    let ok = reactor.run_until(|| done.get(), Duration::from_secs(3)).expect("pump");
    assert!(ok);

    srv.stop().expect("stop");
}
