// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use evio::EventLoop;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

/// Arms a watchdog that breaks the loop so a broken test fails instead of
/// hanging the suite.
pub fn arm_watchdog(evloop: &mut EventLoop, timeout: Duration) {
    evloop.timer_add_once("test-watchdog", timeout, |el: &mut EventLoop| {
        el.break_loop();
    });
}
