use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use evio::linebuf::{LineBuf, LineBufFlags, LineBufRef};
use evio::vio::{SockType, Vio, VioErrorKind};
use evio::{Direction, EventLoop, Family, IoCallback, SockAddr};

mod util;
use util::{arm_watchdog, init};

fn listener(evloop: &mut EventLoop) -> (Vio, SockAddr) {
    let mut vio = Vio::new();
    vio.socket(Family::V4, SockType::Stream).unwrap();
    vio.set_reuseaddr().unwrap();
    vio.bind(SockAddr::new(Family::V4, "127.0.0.1", 0).unwrap())
        .unwrap();
    vio.listen(16).unwrap();
    let addr = vio.local_addr().unwrap();
    vio.attach(evloop).unwrap();
    (vio, addr)
}

#[test]
fn echo_server_round_trip() {
    init();
    let mut evloop = EventLoop::new().unwrap();
    arm_watchdog(&mut evloop, Duration::from_secs(10));

    let (listener, addr) = listener(&mut evloop);
    let listener = Rc::new(RefCell::new(listener));
    let conn: Rc<RefCell<Option<LineBufRef>>> = Rc::new(RefCell::new(None));
    let received: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));

    let accept_listener = listener.clone();
    let accept_conn = conn.clone();
    let accept_received = received.clone();
    let accept_cb = IoCallback::new(move |el, _, _| {
        let Ok(Some(client)) = accept_listener.borrow_mut().accept() else {
            return;
        };

        let received = accept_received.clone();
        let lb = LineBuf::new(client, move |el, lb, line| {
            received.borrow_mut().push(line.bytes.to_vec());
            LineBuf::write(lb, el, line.bytes);
            if received.borrow().len() == 2 {
                // Drain what we echoed, then stop the loop.
                lb.borrow_mut().set_shutdown_cb(|el: &mut EventLoop| {
                    el.break_loop();
                });
                LineBuf::shut_down(lb, el);
            }
        });
        LineBuf::attach(&lb, el).unwrap();
        *accept_conn.borrow_mut() = Some(lb);
    });
    let listener_pollable = listener.borrow().pollable().unwrap();
    evloop.set_select(listener_pollable, Direction::Read, Some(accept_cb));

    // "hello" ends in CRLF, "world" in a bare LF; both are single records
    // and both must be echoed back CRLF-terminated.
    let port = addr.port();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"hello\r\n").unwrap();
        stream.write_all(b"world\n").unwrap();

        let mut echoed = Vec::new();
        let mut buf = [0u8; 64];
        while echoed.len() < 14 {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "server closed before echoing everything");
            echoed.extend_from_slice(&buf[..n]);
        }
        echoed
    });

    evloop.run();

    let echoed = client.join().unwrap();
    assert_eq!(&echoed, b"hello\r\nworld\r\n");
    assert_eq!(
        *received.borrow(),
        vec![b"hello".to_vec(), b"world".to_vec()]
    );
}

#[test]
fn read_buffer_overflow_is_fatal() {
    init();
    let mut evloop = EventLoop::new().unwrap();
    arm_watchdog(&mut evloop, Duration::from_secs(10));

    let (listener, addr) = listener(&mut evloop);
    let listener = Rc::new(RefCell::new(listener));
    let conn: Rc<RefCell<Option<LineBufRef>>> = Rc::new(RefCell::new(None));
    let lines_seen = Rc::new(RefCell::new(0u32));
    let shutdowns = Rc::new(RefCell::new(0u32));

    let accept_listener = listener.clone();
    let accept_conn = conn.clone();
    let accept_lines = lines_seen.clone();
    let accept_shutdowns = shutdowns.clone();
    let accept_cb = IoCallback::new(move |el, _, _| {
        let Ok(Some(client)) = accept_listener.borrow_mut().accept() else {
            return;
        };
        let lines = accept_lines.clone();
        let lb = LineBuf::new(client, move |_, _, _| {
            *lines.borrow_mut() += 1;
        });
        let shutdowns = accept_shutdowns.clone();
        lb.borrow_mut().set_read_buffer_len(32);
        lb.borrow_mut().set_shutdown_cb(move |el: &mut EventLoop| {
            *shutdowns.borrow_mut() += 1;
            el.break_loop();
        });
        LineBuf::attach(&lb, el).unwrap();
        *accept_conn.borrow_mut() = Some(lb);
    });
    let listener_pollable = listener.borrow().pollable().unwrap();
    evloop.set_select(listener_pollable, Direction::Read, Some(accept_cb));

    let port = addr.port();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // 64 bytes, not a delimiter among them.
        stream.write_all(&[b'x'; 64]).unwrap();
        // Hold the connection open until the server gives up on us.
        let mut buf = [0u8; 16];
        let _ = stream.read(&mut buf);
    });

    evloop.run();
    client.join().unwrap();

    assert_eq!(*lines_seen.borrow(), 0, "no record should have surfaced");
    assert_eq!(*shutdowns.borrow(), 1, "error path must run exactly once");

    let lb = conn.borrow().clone().unwrap();
    let lb = lb.borrow();
    assert!(lb.flags().contains(LineBufFlags::READBUF_FULL));
    let err = lb.vio().last_error().expect("vio error must be recorded");
    assert!(matches!(err.kind, VioErrorKind::Custom(_)), "{:?}", err);
    assert!(lb.vio().is_closed());
}
