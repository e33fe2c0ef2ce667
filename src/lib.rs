//! Event-driven non-blocking I/O.
//!
//! `evio` is a small reactor library: an [`EventLoop`] multiplexes readiness
//! of registered descriptors over the best available kernel poller and fires
//! per-direction callbacks, interleaved with a monotonic timer wheel.
//! On top of the loop sit three progressively higher-level layers:
//!
//! * [`vio`] — a virtual transport (plain socket or TLS) with uniform
//!   non-blocking semantics and a single error path,
//! * [`linebuf`] — delimiter-framed record streaming with bounded buffers
//!   and backpressure,
//! * [`dns`] — an asynchronous stub resolver speaking the DNS wire protocol
//!   over UDP.
//!
//! [`helper`] spawns worker child processes that run their own loop and talk
//! to the parent over a pair of pipes registered with the parent's loop.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use evio::EventLoop;
//!
//! let mut evloop = EventLoop::timers_only();
//! evloop.timer_add_once("hello", Duration::from_millis(10), |el: &mut EventLoop| {
//!     println!("hello from the loop");
//!     el.break_loop();
//! });
//! evloop.run();
//! ```
//!
//! All callbacks for a given loop run serialized on the thread that calls
//! [`EventLoop::run`]; the exclusive `&mut EventLoop` borrow they receive is
//! the reentrancy guard. Loops on different threads share nothing.
#![warn(missing_debug_implementations)]

#[cfg(not(unix))]
compile_error!("evio only supports Unix targets");

#[macro_use]
mod macros;

mod addr;
mod clock;
mod event_loop;
mod interest;
mod pollable;
mod sys;
mod timer;
mod token;
mod util;

pub mod dns;
pub mod helper;
pub mod linebuf;
pub mod vio;

pub use crate::addr::{AddrError, Family, SockAddr};
pub use crate::event_loop::{Backend, EventLoop};
pub use crate::interest::Interest;
pub use crate::pollable::{Direction, IoCallback, PollableId};
pub use crate::timer::TimerId;

/// Re-exported so TLS configurations can be built against the exact
/// rustls version this crate links.
#[cfg(feature = "tls")]
pub use rustls;
