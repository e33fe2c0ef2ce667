use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use evio::EventLoop;

mod util;
use util::init;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fired {
    Tick(u32),
    Oneshot,
}

#[test]
fn periodic_and_oneshot_ordering() {
    init();
    let mut evloop = EventLoop::timers_only();

    let events: Rc<RefCell<Vec<Fired>>> = Rc::new(RefCell::new(Vec::new()));
    let period = Duration::from_millis(25);

    let tick_events = events.clone();
    let count = Rc::new(RefCell::new(0u32));
    evloop.timer_add("tick", period, move |el| {
        let mut count = count.borrow_mut();
        *count += 1;
        tick_events.borrow_mut().push(Fired::Tick(*count));
        if *count == 8 {
            el.break_loop();
        }
    });

    // Lands between the fourth and fifth tick.
    let oneshot_events = events.clone();
    evloop.timer_add_once("oneshot", Duration::from_millis(112), move |_: &mut EventLoop| {
        oneshot_events.borrow_mut().push(Fired::Oneshot);
    });

    evloop.run();

    let events = events.borrow();
    let ticks: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            Fired::Tick(n) => Some(*n),
            Fired::Oneshot => None,
        })
        .collect();
    assert_eq!(ticks, (1..=8).collect::<Vec<u32>>());

    let oneshots: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| **e == Fired::Oneshot)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(oneshots.len(), 1, "one-shot timer fired more than once");

    // The one-shot sits after tick 4 and before tick 5 in delivery order.
    let pos = oneshots[0];
    assert_eq!(events[pos - 1], Fired::Tick(4), "events: {:?}", events);
    assert_eq!(events[pos + 1], Fired::Tick(5), "events: {:?}", events);
}

#[test]
fn periodic_timer_does_not_burst_after_stall() {
    init();
    let mut evloop = EventLoop::timers_only();

    let fired: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
    let log = fired.clone();
    evloop.timer_add("stalled", Duration::from_millis(20), move |el| {
        log.borrow_mut().push(el.now_ms());
        if log.borrow().len() == 1 {
            // Miss a couple of periods; the reschedule is now + period, so
            // skipped ticks collapse instead of bursting.
            std::thread::sleep(Duration::from_millis(70));
        }
        if log.borrow().len() == 3 {
            el.break_loop();
        }
    });

    evloop.run();

    let fired = fired.borrow();
    assert_eq!(fired.len(), 3);
    for pair in fired.windows(2) {
        assert!(
            pair[1] >= pair[0] + 20,
            "tick interval shorter than the period: {:?}",
            fired
        );
    }
}
