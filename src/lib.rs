//! Callback-driven cross-platform event engine.
//!
//! A [`Queue`] multiplexes timers, pollable descriptors and cross-thread
//! wakeups onto one OS completion backend (io_uring, epoll, kqueue or IOCP).
//! A [`Looper`] binds a queue to the current thread, adds a worker pool for
//! offloaded work, and a [`Bus`] broadcasts events between loopers.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use evio::{Looper, LooperInfo, TimerInfo};
//!
//! let looper = Looper::acquire(LooperInfo::default()).unwrap();
//! looper
//!     .schedule_timer(TimerInfo::once(Duration::from_millis(50)), |_, value, status| {
//!         println!("tick {value}: {status}");
//!     })
//!     .unwrap();
//! looper.run_default();
//! ```

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

#[doc(no_inline)]
pub use evio_driver::{
    ClockType, Handle, PollFlags, PollHandle, Queue, QueueEngine, QueueFlags, QueueInfo,
    QueueWakeupInfo, QueueWaker, Status, ThreadHandle, ThreadSender, TimerHandle, TimerInfo,
    WakeupFlags,
};
#[doc(no_inline)]
pub use evio_runtime::{
    Bus, BusDelegate, BusEvent, BusEventCategory, DispatchPool, Looper, LooperHandle, LooperInfo,
};
