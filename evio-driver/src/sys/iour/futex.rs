//! Asymmetric futex mutex for the thread-handle fast path.
//!
//! The server (the loop thread) parks inside `IORING_OP_FUTEX_WAIT` and is
//! assumed to be waiting whenever a client touches the word, so every
//! client unlock issues a wake. Three bits:
//!
//! - `LOCK`: somebody owns the queue;
//! - `WAIT`: a client is blocked waiting for the lock;
//! - `SIGNAL`: a client produced work since the server last drained.
//!
//! The kernel-side wait uses a bitset mask so client-targeted wakes do not
//! consume the server's slot.

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

const LOCK: u32 = 0b0001;
const WAIT: u32 = 0b0010;
const SIGNAL: u32 = 0b0100;
const FULL: u32 = LOCK | WAIT | SIGNAL;

pub(crate) const SERVER_MASK: u32 = 0x1;
pub(crate) const CLIENT_MASK: u32 = 0x2;
const FULL_MASK: u32 = SERVER_MASK | CLIENT_MASK;

/// A queue guarded by the futex word. The word doubles as the wakeup
/// signal observed by the ring.
pub(crate) struct FutexQueue<T> {
    word: AtomicU32,
    data: UnsafeCell<T>,
}

// The futex protocol serializes access to `data`.
unsafe impl<T: Send> Send for FutexQueue<T> {}
unsafe impl<T: Send> Sync for FutexQueue<T> {}

impl<T> FutexQueue<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            word: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Address the ring's `FUTEX_WAIT` op points at.
    pub(crate) fn word_ptr(&self) -> *const u32 {
        self.word.as_ptr()
    }

    /// Producer-side lock; blocks while another client owns the queue.
    pub(crate) fn client_lock(&self) -> ClientGuard<'_, T> {
        let mut prev = self.word.fetch_or(LOCK | SIGNAL, Ordering::SeqCst);
        if prev & LOCK != 0 {
            loop {
                if prev & WAIT != 0 || self.word.fetch_or(WAIT, Ordering::SeqCst) & LOCK != 0 {
                    // All three flags are set at this point.
                    futex_wait(&self.word, FULL, CLIENT_MASK);
                }
                prev = self.word.fetch_or(FULL, Ordering::SeqCst);
                if prev & LOCK == 0 {
                    break;
                }
            }
        }
        ClientGuard { queue: self }
    }

    /// Producer-side non-blocking lock, for producers on the loop thread.
    pub(crate) fn client_try_lock(&self) -> Option<ClientGuard<'_, T>> {
        if self.word.fetch_or(LOCK | SIGNAL, Ordering::SeqCst) & LOCK == 0 {
            Some(ClientGuard { queue: self })
        } else {
            None
        }
    }

    /// Consumer-side non-blocking lock; the consumer never waits in
    /// userspace, it parks in the ring instead.
    pub(crate) fn server_try_lock(&self) -> Option<ServerGuard<'_, T>> {
        if self.word.fetch_or(LOCK, Ordering::SeqCst) & LOCK == 0 {
            Some(ServerGuard { queue: self })
        } else {
            None
        }
    }
}

pub(crate) struct ClientGuard<'a, T> {
    queue: &'a FutexQueue<T>,
}

impl<T> Deref for ClientGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.queue.data.get() }
    }
}

impl<T> DerefMut for ClientGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.queue.data.get() }
    }
}

impl<T> Drop for ClientGuard<'_, T> {
    fn drop(&mut self) {
        // Drop LOCK, leave WAIT and SIGNAL in place, then wake the server
        // (or a blocked client).
        self.queue
            .word
            .fetch_and(SIGNAL | WAIT, Ordering::SeqCst);
        futex_wake(&self.queue.word, 1, FULL_MASK);
    }
}

pub(crate) struct ServerGuard<'a, T> {
    queue: &'a FutexQueue<T>,
}

impl<T> Deref for ServerGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.queue.data.get() }
    }
}

impl<T> DerefMut for ServerGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.queue.data.get() }
    }
}

impl<T> Drop for ServerGuard<'_, T> {
    fn drop(&mut self) {
        if self.queue.word.swap(0, Ordering::SeqCst) & WAIT != 0 {
            futex_wake(&self.queue.word, 1, CLIENT_MASK);
        }
    }
}

fn futex_wait(word: &AtomicU32, expected: u32, mask: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT_BITSET | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null_mut::<u32>(),
            mask,
        );
    }
}

fn futex_wake(word: &AtomicU32, nr_wake: i32, mask: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE_BITSET | libc::FUTEX_PRIVATE_FLAG,
            nr_wake,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null_mut::<u32>(),
            mask,
        );
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use super::FutexQueue;

    #[test]
    fn lock_round_trip() {
        let fx = FutexQueue::new(VecDeque::new());
        fx.client_lock().push_back(1);
        fx.client_lock().push_back(2);
        let drained = {
            let mut guard = fx.server_try_lock().expect("server lock");
            std::mem::take(&mut *guard)
        };
        assert_eq!(drained, [1, 2]);
        assert!(fx.server_try_lock().is_some());
    }

    #[test]
    fn contended_producers() {
        use std::sync::Arc;

        let fx = Arc::new(FutexQueue::new(Vec::new()));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let fx = fx.clone();
                std::thread::spawn(move || {
                    for i in 0..256 {
                        fx.client_lock().push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let total = loop {
            if let Some(guard) = fx.server_try_lock() {
                break guard.len();
            }
        };
        assert_eq!(total, 4 * 256);
    }
}
