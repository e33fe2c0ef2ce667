use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use evio::helper::Helper;
use evio::EventLoop;

mod util;
use util::{arm_watchdog, init};

/// Spawns a shell that copies its helper input back to its helper output,
/// the pipes having been adopted from the IN_FD/OUT_FD environment.
#[test]
fn helper_echoes_over_inherited_pipes() {
    init();
    let mut evloop = EventLoop::new().unwrap();
    arm_watchdog(&mut evloop, Duration::from_secs(10));

    let helper = Rc::new(
        Helper::spawn(
            &mut evloop,
            "sh",
            &["-c", "eval \"exec cat <&$IN_FD >&$OUT_FD\""],
        )
        .unwrap(),
    );

    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    let reader = helper.clone();
    helper.set_read_cb(&mut evloop, move |el, _| {
        let mut buf = [0u8; 64];
        if let Ok(n) = reader.read(&mut buf) {
            sink.borrow_mut().extend_from_slice(&buf[..n]);
        }
        if sink.borrow().ends_with(b"ping\n") {
            el.break_loop();
        }
    });

    helper.write(b"ping\n").unwrap();
    evloop.run();

    assert_eq!(&*received.borrow(), b"ping\n");

    // Release the callback's clone of the handle before tearing down.
    helper.clear_read_cb(&mut evloop);
    let helper = Rc::try_unwrap(helper).ok().expect("helper still shared");
    helper.destroy(&mut evloop);
}
