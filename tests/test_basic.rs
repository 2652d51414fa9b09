mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use common::*;
use strand_rpc::*;

#[test]
fn test_echo_reversed() {
    setup();
    let mut srv = start_server(2, 3600);
    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, server_port(&srv), quick_channel_options());

    let got: Rc<RefCell<Option<(Code, String)>>> = Rc::new(RefCell::new(None));
    let slot = got.clone();
    channel
        .call_method(
            "test.Echo",
            "Echo",
            CallOptions::default(),
            echo_request("abc"),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, response| {
                let resp = response.downcast::<EchoResponse>().expect("response type");
                slot.borrow_mut().replace((ctl.code(), resp.text));
            }),
        )
        .expect("call");

    let ok = reactor
        .run_until(|| got.borrow().is_some(), Duration::from_secs(3))
        .expect("pump");
    assert!(ok, "completion never fired");
    let (code, text) = got.borrow_mut().take().unwrap();
    assert_eq!(code, Code::Ok);
    assert_eq!(text, "cba");

    srv.stop().expect("stop");
}

#[test]
fn test_fifo_order_and_monotonic_seq() {
    setup();
    let mut srv = start_server(1, 3600);
    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, server_port(&srv), quick_channel_options());

    const N: usize = 100;
    let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let mut last_seq = 0u64;
    for i in 0..N {
        let slot = order.clone();
        let text = format!("msg-{:03}", i);
        let expect = text.chars().rev().collect::<String>();
        let handle = channel
            .call_method(
                "test.Echo",
                "Echo",
                CallOptions { rpc_timeout: 5000, ..Default::default() },
                echo_request(&text),
                Box::new(EchoResponse::default()),
                Box::new(move |ctl, response| {
                    assert_eq!(ctl.code(), Code::Ok);
                    let resp = response.downcast::<EchoResponse>().unwrap();
                    assert_eq!(resp.text, expect);
                    slot.borrow_mut().push(i);
                }),
            )
            .expect("call");
        assert!(handle.seq() > last_seq, "sequence must increase");
        last_seq = handle.seq();
    }

    let ok = reactor
        .run_until(|| order.borrow().len() == N, Duration::from_secs(10))
        .expect("pump");
    assert!(ok, "only {} of {} completions", order.borrow().len(), N);
    // single connection, inline handler: completions come back in call order
    let order = order.borrow();
    for (i, v) in order.iter().enumerate() {
        assert_eq!(*v, i);
    }

    srv.stop().expect("stop");
}

#[test]
fn test_user_defined_failure() {
    setup();
    let mut srv = start_server(2, 3600);
    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, server_port(&srv), quick_channel_options());

    let got: Rc<RefCell<Option<(Code, String)>>> = Rc::new(RefCell::new(None));
    let slot = got.clone();
    channel
        .call_method(
            "test.Echo",
            "Reject",
            CallOptions::default(),
            echo_request("x"),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, _response| {
                slot.borrow_mut().replace((ctl.code(), ctl.error_text()));
            }),
        )
        .expect("call");

    let ok = reactor
        .run_until(|| got.borrow().is_some(), Duration::from_secs(3))
        .expect("pump");
    assert!(ok);
    let (code, text) = got.borrow_mut().take().unwrap();
    assert_eq!(code, Code::UserDefined);
    assert_eq!(text, "refused");

    srv.stop().expect("stop");
}

#[test]
fn test_compressed_echo() {
    setup();
    let mut srv = start_server(2, 3600);
    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, server_port(&srv), quick_channel_options());

    for kind in [CompressKind::Snappy, CompressKind::Lz4, CompressKind::Deflate] {
        let text = "the quick brown fox ".repeat(200);
        let expect = text.chars().rev().collect::<String>();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        channel
            .call_method(
                "test.Echo",
                "Echo",
                CallOptions { compression: kind, rpc_timeout: 3000 },
                echo_request(&text),
                Box::new(EchoResponse::default()),
                Box::new(move |ctl, response| {
                    assert_eq!(ctl.code(), Code::Ok);
                    let resp = response.downcast::<EchoResponse>().unwrap();
                    assert_eq!(resp.text, expect);
                    flag.set(true);
                }),
            )
            .expect("call");
        let ok = reactor.run_until(|| done.get(), Duration::from_secs(3)).expect("pump");
        assert!(ok, "no completion for {:?}", kind);
    }

    srv.stop().expect("stop");
}

#[test]
fn test_controller_addresses() {
    setup();
    let mut srv = start_server(1, 3600);
    let port = server_port(&srv);
    let reactor = Reactor::new().expect("reactor");
    let channel = open_channel(&reactor, port, quick_channel_options());

    let got: Rc<RefCell<Option<(String, String)>>> = Rc::new(RefCell::new(None));
    let slot = got.clone();
    channel
        .call_method(
            "test.Echo",
            "Echo",
            CallOptions::default(),
            echo_request("addr"),
            Box::new(EchoResponse::default()),
            Box::new(move |ctl, _| {
                slot.borrow_mut()
                    .replace((ctl.local_addr().to_string(), ctl.remote_addr().to_string()));
            }),
        )
        .expect("call");

    let ok = reactor
        .run_until(|| got.borrow().is_some(), Duration::from_secs(3))
        .expect("pump");
    assert!(ok);
    let (local, remote) = got.borrow_mut().take().unwrap();
    assert_eq!(remote, format!("127.0.0.1:{}", port));
    assert!(local.starts_with("127.0.0.1:"), "local addr {}", local);

    srv.stop().expect("stop");
}

struct ForceSend<T>(T);
unsafe impl<T> Send for ForceSend<T> {}

#[test]
fn test_wrong_thread_rejected() {
    setup();
    let reactor = Reactor::new().expect("reactor");
    let channel = Channel::new(quick_channel_options(), "127.0.0.1", 1, &reactor);
    channel.open().expect("open");

    let moved = ForceSend(channel);
    let back = std::thread::spawn(move || {
        let wrapped = moved;
        assert_eq!(wrapped.0.cancel(), Err(Code::WrongThread));
        assert_eq!(wrapped.0.close(), Err(Code::WrongThread));
        match wrapped.0.call_method(
            "test.Echo",
            "Echo",
            CallOptions::default(),
            echo_request("x"),
            Box::new(EchoResponse::default()),
            Box::new(|_, _| panic!("must not run")),
        ) {
            Err(Code::WrongThread) => {}
            other => panic!("expected WrongThread, got {:?}", other.err()),
        }
        wrapped
    })
    .join()
    .expect("thread");

    // back home the channel still works
    assert!(back.0.cancel().is_ok());
}
