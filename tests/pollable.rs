use std::cell::RefCell;
use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use evio::{Backend, Direction, EventLoop, IoCallback};

mod util;
use util::{arm_watchdog, init};

fn readiness_smoke(mut evloop: EventLoop) {
    arm_watchdog(&mut evloop, Duration::from_secs(10));

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_nonblocking(true).unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender
        .send_to(b"wake", receiver.local_addr().unwrap())
        .unwrap();

    let id = evloop.pollable_create(receiver.as_raw_fd());
    let delivered: Rc<RefCell<Vec<(Direction, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));

    let log = delivered.clone();
    let receiver = Rc::new(receiver);
    let sock = receiver.clone();
    evloop.set_select(
        id,
        Direction::Read,
        Some(IoCallback::new(move |el, id, dir| {
            let mut buf = [0u8; 16];
            let n = sock.recv(&mut buf).unwrap();
            log.borrow_mut().push((dir, buf[..n].to_vec()));
            // Clearing the callback from inside itself must be safe; the
            // backend drops interest and nothing fires again.
            el.set_select(id, Direction::Read, None);
            el.break_loop();
        })),
    );

    evloop.run();

    let delivered = delivered.borrow();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, Direction::Read);
    assert_eq!(delivered[0].1, b"wake");
}

#[test]
fn default_backend_delivers_readiness() {
    init();
    readiness_smoke(EventLoop::new().unwrap());
}

#[test]
fn poll_backend_delivers_readiness() {
    init();
    readiness_smoke(EventLoop::with_backend(Backend::Poll).unwrap());
}

#[test]
fn select_backend_delivers_readiness() {
    init();
    readiness_smoke(EventLoop::with_backend(Backend::Select).unwrap());
}

#[test]
fn destroyed_pollable_never_fires() {
    init();
    let mut evloop = EventLoop::new().unwrap();

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_nonblocking(true).unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender
        .send_to(b"late", receiver.local_addr().unwrap())
        .unwrap();

    let id = evloop.pollable_create(receiver.as_raw_fd());
    let fired = Rc::new(RefCell::new(false));
    let flag = fired.clone();
    evloop.set_select(
        id,
        Direction::Read,
        Some(IoCallback::new(move |_, _, _| {
            *flag.borrow_mut() = true;
        })),
    );

    // Destroyed before the loop ever runs: the pending datagram must not
    // reach the callback, in this iteration or any later one.
    evloop.pollable_destroy(id);
    for _ in 0..3 {
        evloop.timeout_once(Some(Duration::from_millis(20)));
    }
    assert!(!*fired.borrow());
}
