use std::cell::RefCell;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use log::{error, trace};

use crate::clock::Clock;
use crate::pollable::{Direction, IoCallback, Pollable, PollableId};
use crate::sys;
use crate::timer::{TimerEntry, TimerId, Timers};
use crate::token::Token;
use crate::util::Slab;

/// Poll budget used when a timer is already due (or none is scheduled): the
/// loop still polls, but with this ceiling so timers are serviced promptly.
const DEFAULT_BUDGET: Duration = Duration::from_millis(250);

/// Which kernel multiplexer a loop should use.
///
/// [`Backend::best`] picks the platform's native queue; `Poll` and `Select`
/// are portable fallbacks, and `Null` does no polling at all (timer-only
/// loops).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll,
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue,
    Poll,
    Select,
    Null,
}

impl Backend {
    /// The preferred backend for the compilation target.
    pub fn best() -> Backend {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            Backend::Epoll
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            Backend::Kqueue
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )))]
        {
            Backend::Poll
        }
    }
}

/// The reactor.
///
/// Owns a poller backend, the registered pollables, and the timer wheel.
/// One thread at a time executes a loop; every callback receives the
/// exclusive `&mut EventLoop`, which serializes all work on the loop and
/// makes reentering `run*` from a callback impossible to express.
pub struct EventLoop {
    selector: sys::Selector,
    pollables: Slab<Pollable>,
    reap_list: Vec<PollableId>,
    timers: Timers,
    clock: Clock,
    currtime_ms: u64,
    death_requested: bool,
    /// Timer currently dispatching, and whether it destroyed itself from
    /// inside its own callback (in which case it must not be rescheduled).
    firing_timer: Option<TimerId>,
    firing_timer_destroyed: bool,
    events_buf: Vec<sys::Event>,
}

impl EventLoop {
    /// Creates a loop on the platform's preferred backend.
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_backend(Backend::best())
    }

    /// Creates a loop on an explicitly chosen backend.
    pub fn with_backend(backend: Backend) -> io::Result<EventLoop> {
        let selector = sys::new_selector(backend)?;
        let clock = Clock::new();
        let currtime_ms = clock.now_ms();
        Ok(EventLoop {
            selector,
            pollables: Slab::new(),
            reap_list: Vec::new(),
            timers: Timers::new(),
            clock,
            currtime_ms,
            death_requested: false,
            firing_timer: None,
            firing_timer_destroyed: false,
            events_buf: Vec::new(),
        })
    }

    /// Convenience constructor for a loop that only services timers.
    pub fn timers_only() -> EventLoop {
        // The null backend has nothing that can fail.
        EventLoop::with_backend(Backend::Null).expect("null backend is infallible")
    }

    /// Monotonic milliseconds, synchronized once per loop iteration.
    pub fn now_ms(&self) -> u64 {
        self.currtime_ms
    }

    /// Wall-clock milliseconds since the Unix epoch, recovered from the
    /// monotonic reading and the loop's calibration bias.
    pub fn wall_time_ms(&self) -> u64 {
        self.clock.epoch_bias_ms() + self.currtime_ms
    }

    fn synchronize(&mut self) {
        self.currtime_ms = self.clock.now_ms();
    }

    // ---- pollables ----

    /// Registers a descriptor with the loop. No interest is installed until
    /// [`set_select`](EventLoop::set_select) installs a callback.
    pub fn pollable_create(&mut self, fd: RawFd) -> PollableId {
        let (index, generation) = self.pollables.insert(Pollable::new(fd));
        PollableId { index, generation }
    }

    /// Installs or clears the callback for one direction.
    ///
    /// The backend registration follows the derived interest mask exactly:
    /// first callback installed → ADD, last callback cleared → DEL,
    /// otherwise MOD. Stale handles are ignored.
    pub fn set_select(&mut self, id: PollableId, dir: Direction, cb: Option<IoCallback>) {
        let (fd, old, new) = match self.pollables.get_mut(id.index, id.generation) {
            Some(p) if !p.dead => {
                let old = p.interest();
                match dir {
                    Direction::Read => p.read_cb = cb,
                    Direction::Write => p.write_cb = cb,
                }
                (p.fd, old, p.interest())
            }
            _ => return,
        };

        let token = Token::from(id);
        let res = match (old, new) {
            (None, Some(interest)) => self.selector.register(fd, token, interest),
            (Some(_), None) => self.selector.deregister(fd),
            (Some(o), Some(n)) if o != n => self.selector.reregister(fd, token, n),
            _ => Ok(()),
        };
        if let Err(err) = res {
            if !sys::ignore_error(&err) {
                error!("set_select: backend update for fd {} failed: {}", fd, err);
            }
        }
    }

    /// Sets or clears `O_NONBLOCK` on the pollable's descriptor.
    pub fn set_nonblocking(&mut self, id: PollableId, nonblocking: bool) -> io::Result<()> {
        match self.pollables.get(id.index, id.generation) {
            Some(p) if !p.dead => sys::unix::set_nonblocking(p.fd, nonblocking),
            _ => Ok(()),
        }
    }

    /// The descriptor behind a pollable, if the handle is still live.
    pub fn pollable_fd(&self, id: PollableId) -> Option<RawFd> {
        self.pollables
            .get(id.index, id.generation)
            .filter(|p| !p.dead)
            .map(|p| p.fd)
    }

    /// Dispatch helper: invokes the callback installed for `dir`, if one is
    /// still present at dispatch time. An earlier callback in the same
    /// iteration may have cleared it or destroyed the pollable; both cases
    /// resolve to a no-op here.
    pub fn trigger(&mut self, id: PollableId, dir: Direction) {
        let cb = self
            .pollables
            .get(id.index, id.generation)
            .and_then(|p| p.callback(dir));
        if let Some(cb) = cb {
            let mut f = cb.0.borrow_mut();
            (&mut *f)(self, id, dir);
        }
    }

    /// Detaches the pollable from the backend and schedules the slot for
    /// release after the current iteration. No callback fires for it again.
    pub fn pollable_destroy(&mut self, id: PollableId) {
        let fd = match self.pollables.get_mut(id.index, id.generation) {
            Some(p) if !p.dead => {
                let registered = p.interest().is_some();
                p.read_cb = None;
                p.write_cb = None;
                p.dead = true;
                registered.then_some(p.fd)
            }
            _ => return,
        };
        if let Some(fd) = fd {
            if let Err(err) = self.selector.deregister(fd) {
                if !sys::ignore_error(&err) {
                    error!("pollable_destroy: backend detach for fd {} failed: {}", fd, err);
                }
            }
        }
        self.reap_list.push(id);
    }

    fn reap_pollables(&mut self) {
        for id in mem::take(&mut self.reap_list) {
            self.pollables.remove(id.index, id.generation);
        }
    }

    // ---- timers ----

    /// Schedules a recurring timer. The first firing happens after one
    /// period; after each firing the timer is re-armed at `now + period`,
    /// so skipped ticks collapse rather than burst.
    pub fn timer_add<F>(&mut self, name: &'static str, period: Duration, cb: F) -> TimerId
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let period_ms = period.as_millis() as u64;
        let deadline = self.currtime_ms + period_ms;
        // A zero period means one-shot, not fire-continuously.
        let period_ms = (period_ms > 0).then_some(period_ms);
        self.timers
            .add(name, deadline, period_ms, Rc::new(RefCell::new(cb)))
    }

    /// Schedules a one-shot timer; it self-destroys after firing.
    pub fn timer_add_once<F>(&mut self, name: &'static str, delay: Duration, cb: F) -> TimerId
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let deadline = self.currtime_ms + delay.as_millis() as u64;
        self.timers
            .add(name, deadline, None, Rc::new(RefCell::new(cb)))
    }

    /// Cancels a timer. Safe to call from inside any callback, including
    /// the cancelled timer's own.
    pub fn timer_destroy(&mut self, id: TimerId) {
        if !self.timers.remove(id) && self.firing_timer == Some(id) {
            self.firing_timer_destroyed = true;
        }
    }

    fn run_timers(&mut self) {
        let now = self.currtime_ms;
        while let Some((id, entry)) = self.timers.pop_due(now) {
            trace!("timer {:?} ({}) firing", id, entry.name);
            self.firing_timer = Some(id);
            self.firing_timer_destroyed = false;
            {
                let mut f = entry.cb.borrow_mut();
                (&mut *f)(self);
            }
            let destroyed = mem::replace(&mut self.firing_timer_destroyed, false);
            self.firing_timer = None;
            if destroyed {
                continue;
            }
            if let Some(period) = entry.period_ms {
                self.timers.reschedule(
                    id,
                    TimerEntry {
                        deadline_ms: now + period,
                        ..entry
                    },
                );
            }
        }
    }

    fn next_timer_due(&mut self) -> bool {
        matches!(self.timers.next_deadline(), Some(d) if d <= self.currtime_ms)
    }

    // ---- running ----

    /// Runs the loop until [`break_loop`](EventLoop::break_loop) is called.
    pub fn run(&mut self) {
        self.death_requested = false;
        while !self.death_requested {
            self.iterate(None);
        }
    }

    /// Runs a single iteration: poll, dispatch, timers, reap.
    pub fn run_once(&mut self) {
        self.iterate(None);
    }

    /// Runs a single iteration with the poll budget additionally capped at
    /// `timeout`. `None` means no cap.
    pub fn timeout_once(&mut self, timeout: Option<Duration>) {
        self.iterate(timeout);
    }

    /// Requests loop termination; `run` returns once the current iteration
    /// finishes.
    pub fn break_loop(&mut self) {
        self.death_requested = true;
    }

    fn iterate(&mut self, cap: Option<Duration>) {
        self.synchronize();

        // Service anything already due before computing the poll budget.
        if self.next_timer_due() {
            self.run_timers();
            self.synchronize();
        }

        let mut budget = match self.timers.next_deadline() {
            Some(deadline) if deadline > self.currtime_ms => {
                Duration::from_millis(deadline - self.currtime_ms)
            }
            _ => DEFAULT_BUDGET,
        };
        if let Some(cap) = cap {
            budget = budget.min(cap);
        }

        let mut events = mem::take(&mut self.events_buf);
        if let Err(err) = self.selector.select(&mut events, Some(budget)) {
            error!("poller wait failed: {}", err);
        }

        // Two passes: all reads first, then all writes. A read callback may
        // destroy its pollable; the write pass observes the dead slot and
        // skips it.
        for event in events.iter().filter(|e| e.readable) {
            self.trigger(PollableId::from(event.token), Direction::Read);
        }
        for event in events.iter().filter(|e| e.writable) {
            self.trigger(PollableId::from(event.token), Direction::Write);
        }
        events.clear();
        self.events_buf = events;

        self.synchronize();
        self.run_timers();
        self.reap_pollables();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("selector", &self.selector)
            .field("timers", &self.timers)
            .field("currtime_ms", &self.currtime_ms)
            .field("death_requested", &self.death_requested)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn one_shot_timer_fires_once() {
        let mut evloop = EventLoop::timers_only();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        evloop.timer_add_once("once", Duration::from_millis(1), move |_| {
            *c.borrow_mut() += 1;
        });
        for _ in 0..4 {
            evloop.timeout_once(Some(Duration::from_millis(5)));
        }
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn periodic_timer_destroyed_from_callback_stops() {
        let mut evloop = EventLoop::timers_only();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let id = Rc::new(RefCell::new(None));
        let id2 = id.clone();
        let timer = evloop.timer_add("tick", Duration::from_millis(1), move |el| {
            *c.borrow_mut() += 1;
            el.timer_destroy(id2.borrow().unwrap());
        });
        *id.borrow_mut() = Some(timer);
        for _ in 0..4 {
            evloop.timeout_once(Some(Duration::from_millis(5)));
        }
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn break_from_timer_stops_run() {
        let mut evloop = EventLoop::timers_only();
        evloop.timer_add_once("stop", Duration::from_millis(1), |el: &mut EventLoop| {
            el.break_loop();
        });
        evloop.run();
    }

    #[test]
    fn destroyed_pollable_handle_goes_stale() {
        let mut evloop = EventLoop::timers_only();
        let id = evloop.pollable_create(0);
        assert_eq!(evloop.pollable_fd(id), Some(0));
        evloop.pollable_destroy(id);
        assert_eq!(evloop.pollable_fd(id), None);
        // Triggering a dead pollable is a no-op rather than a panic.
        evloop.trigger(id, Direction::Read);
        evloop.run_once();
        assert_eq!(evloop.pollable_fd(id), None);
    }
}
