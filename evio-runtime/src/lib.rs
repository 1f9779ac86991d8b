//! Looper and event bus runtime.
//!
//! A [`Looper`] binds an [`evio_driver::Queue`] to the current thread, adds
//! a cross-thread mailbox and a lazy worker pool, and participates in
//! process-wide event broadcasting through [`Bus`].

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod bus;
mod looper;
mod pool;

pub use bus::{Bus, BusDelegate, BusEvent, BusEventCategory};
pub use looper::{Looper, LooperHandle, LooperInfo};
pub use pool::DispatchPool;
