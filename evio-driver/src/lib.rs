//! Event queue core and platform backends.
//!
//! A [`Queue`] multiplexes timers, pollable descriptors and cross-thread
//! wakeups onto one OS completion mechanism. Each asynchronous operation is
//! a [`Handle`] with a small state machine (`Pending → Ok ⇄ Suspended →
//! terminal`) and a completion callback fired once per delivered event plus
//! exactly once with the terminal status.
//!
//! Backends differ by compilation target: io_uring and epoll on Linux,
//! kqueue on the BSDs and Darwin, IOCP on Windows. They all implement the
//! same externally visible contract; the engine mask in [`QueueInfo`] picks
//! between those available.

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod handle;
mod pollable;
mod queue;
mod status;
pub(crate) mod sys;
mod thread;
mod timer;

pub use handle::Handle;
pub use pollable::{PollFlags, PollHandle};
pub use queue::{
    Queue, QueueEngine, QueueFlags, QueueInfo, QueueWakeupInfo, QueueWaker, WakeupFlags,
};
pub use status::Status;
pub use thread::{ThreadHandle, ThreadSender};
pub use timer::{ClockType, TimerHandle, TimerInfo};

/// Raw OS handle of a pollable source.
#[cfg(unix)]
pub use std::os::fd::RawFd;
/// Raw OS handle of a pollable source.
#[cfg(windows)]
pub type RawFd = std::os::windows::io::RawHandle;
