//! IOCP backend: waitable timers and pollable objects delivered through
//! registered waits, `PostQueuedCompletionStatus` wakeups.

use std::{
    collections::{HashMap, VecDeque},
    ffi::c_void,
    sync::{Arc, Mutex},
    time::Duration,
};

use windows_sys::Win32::{
    Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT},
    System::Threading::{
        CreateWaitableTimerExW, RegisterWaitForSingleObject, SetWaitableTimer, UnregisterWaitEx,
        CREATE_WAITABLE_TIMER_HIGH_RESOLUTION, INFINITE, TIMER_ALL_ACCESS, WT_EXECUTEINWAITTHREAD,
        WT_EXECUTEONLYONCE,
    },
    System::IO::{
        CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
        OVERLAPPED_ENTRY,
    },
};
use slab::Slab;

use crate::{
    handle::{Handle, HandleKind, Source},
    pollable::PollFlags,
    queue::{NotifyData, QueueInfo, RawEvent},
    sys::{drain_packets, pack_cookie, serial_of, unpack_cookie, PacketQueue, ThreadSignal, Waker},
    thread::{Mailbox, ThreadSource},
    Status,
};

pub(crate) const WAKER_KEY: usize = usize::MAX;
/// Thread-handle completion keys start above any packed cookie.
const THREAD_KEY_BASE: usize = 1 << 56;

/// A shareable reference to the completion port.
#[derive(Clone)]
pub(crate) struct PortRef(Arc<OwnedPort>);

struct OwnedPort(HANDLE);

unsafe impl Send for OwnedPort {}
unsafe impl Sync for OwnedPort {}

impl Drop for OwnedPort {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

impl PortRef {
    fn raw(&self) -> HANDLE {
        self.0 .0
    }

    pub(crate) fn post(&self, key: usize) -> Status {
        let ok = unsafe {
            PostQueuedCompletionStatus(self.raw(), 0, key, std::ptr::null_mut())
        };
        if ok == 0 {
            Status::last_os_error()
        } else {
            Status::Ok
        }
    }
}

/// Context handed to a registered-wait callback; it posts the packet key
/// back to the loop's port.
struct WaitContext {
    port: PortRef,
    key: usize,
}

unsafe extern "system" fn wait_callback(context: *mut c_void, _timed_out: u8) {
    let context = &*(context as *const WaitContext);
    context.port.post(context.key);
}

struct Registration {
    handle: Handle,
    serial: u32,
    /// Sub-millisecond interval: the waitable timer runs one-shot and is
    /// reprogrammed after every delivery.
    manual_rearm: bool,
}

pub(crate) struct IocpDriver {
    port: PortRef,
    event_capacity: usize,
    registered: Slab<Registration>,
    /// Thread-handle completion keys to registration slots.
    thread_keys: HashMap<usize, usize>,
    next_thread_key: usize,
    /// Wait-callback contexts per registration slot, freed after the wait
    /// is unregistered.
    wait_contexts: HashMap<usize, Vec<*mut WaitContext>>,
    packets: Arc<PacketQueue>,
}

impl IocpDriver {
    pub(crate) fn create(info: &QueueInfo) -> Result<Self, Status> {
        let raw = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1)
        };
        if raw.is_null() {
            return Err(Status::last_os_error());
        }

        let mut event_capacity = info.complete_queue_size;
        if event_capacity == 0 {
            event_capacity = info.submit_queue_size;
        }

        Ok(Self {
            port: PortRef(Arc::new(OwnedPort(raw))),
            event_capacity: event_capacity.max(1) as usize,
            registered: Slab::new(),
            thread_keys: HashMap::new(),
            next_thread_key: THREAD_KEY_BASE,
            wait_contexts: HashMap::new(),
            packets: Arc::new(PacketQueue::new()),
        })
    }

    pub(crate) fn arm(&mut self, handle: &Handle) -> Status {
        let serial = serial_of(handle);
        let token = match handle.cell.token.get() {
            Some(token) => token,
            None => {
                let token = self.registered.insert(Registration {
                    handle: handle.clone(),
                    serial,
                    manual_rearm: false,
                });
                handle.cell.token.set(Some(token));
                token
            }
        };
        let cookie = pack_cookie(token, serial) as usize;

        let mut source = handle.cell.source.borrow_mut();
        match &mut *source {
            Source::Timer(timer) => {
                if timer.timer.is_null() {
                    let raw = unsafe {
                        CreateWaitableTimerExW(
                            std::ptr::null(),
                            std::ptr::null(),
                            CREATE_WAITABLE_TIMER_HIGH_RESOLUTION,
                            TIMER_ALL_ACCESS,
                        )
                    };
                    let raw = if raw.is_null() {
                        // Pre-1803 systems lack high-resolution timers.
                        unsafe {
                            CreateWaitableTimerExW(
                                std::ptr::null(),
                                std::ptr::null(),
                                0,
                                TIMER_ALL_ACCESS,
                            )
                        }
                    } else {
                        raw
                    };
                    if raw.is_null() {
                        return Status::last_os_error();
                    }
                    timer.timer = raw as _;
                }

                let interval_ms = timer.interval.as_millis() as u32;
                let manual = timer.count != 1 && interval_ms == 0 && !timer.interval.is_zero();
                if let Some(registration) = self.registered.get_mut(token) {
                    registration.manual_rearm = manual;
                }
                // First arm counts down the leading timeout; manual rearms
                // (sub-millisecond intervals) count the interval instead.
                let due = if timer.value == 0 {
                    timer.timeout
                } else {
                    timer.interval
                };
                let due_100ns = -((due.as_nanos() / 100).max(1) as i64);
                let period = if timer.count == 1 || manual {
                    0
                } else {
                    interval_ms as i32
                };
                let ok = unsafe {
                    SetWaitableTimer(
                        timer.timer as HANDLE,
                        &due_100ns,
                        period,
                        None,
                        std::ptr::null(),
                        0,
                    )
                };
                if ok == 0 {
                    return Status::last_os_error();
                }

                let once = timer.count == 1 || manual;
                if once {
                    // A one-shot wait is consumed by its delivery; start
                    // every epoch with a fresh association.
                    self.release_wait(token, &mut timer.wait);
                }
                if timer.wait.is_null() {
                    let flags = if once {
                        WT_EXECUTEINWAITTHREAD | WT_EXECUTEONLYONCE
                    } else {
                        WT_EXECUTEINWAITTHREAD
                    };
                    match self.register_wait(token, timer.timer as HANDLE, cookie, flags) {
                        Ok(wait) => timer.wait = wait,
                        Err(status) => return status,
                    }
                }
                Status::Ok
            }
            Source::Poll(poll) => {
                self.release_wait(token, &mut poll.wait);
                match self.register_wait(
                    token,
                    poll.fd as HANDLE,
                    cookie,
                    WT_EXECUTEINWAITTHREAD | WT_EXECUTEONLYONCE,
                ) {
                    Ok(wait) => poll.wait = wait,
                    Err(status) => return status,
                }
                Status::Ok
            }
            Source::Thread(thread) => {
                self.thread_keys.insert(thread.key, token);
                Status::Ok
            }
        }
    }

    pub(crate) fn disarm(&mut self, handle: &Handle) -> Status {
        let Some(token) = handle.cell.token.take() else {
            return Status::Ok;
        };
        self.registered.try_remove(token);

        let mut source = handle.cell.source.borrow_mut();
        match &mut *source {
            Source::Timer(timer) => unregister_wait(&mut timer.wait),
            Source::Poll(poll) => unregister_wait(&mut poll.wait),
            Source::Thread(thread) => {
                self.thread_keys.remove(&thread.key);
            }
        }
        drop(source);
        if let Some(contexts) = self.wait_contexts.remove(&token) {
            // Safe to free: unregister_wait blocked until callbacks ended.
            for context in contexts {
                drop(unsafe { Box::from_raw(context) });
            }
        }
        Status::Ok
    }

    /// Associate `object` with the port through a registered wait.
    fn register_wait(
        &mut self,
        token: usize,
        object: HANDLE,
        cookie: usize,
        flags: u32,
    ) -> Result<std::os::windows::io::RawHandle, Status> {
        let context = Box::into_raw(Box::new(WaitContext {
            port: self.port.clone(),
            key: cookie,
        }));
        let mut wait: HANDLE = std::ptr::null_mut();
        let ok = unsafe {
            RegisterWaitForSingleObject(
                &mut wait,
                object,
                Some(wait_callback),
                context as *mut c_void,
                INFINITE,
                flags,
            )
        };
        if ok == 0 {
            drop(unsafe { Box::from_raw(context) });
            return Err(Status::last_os_error());
        }
        self.wait_contexts.entry(token).or_default().push(context);
        Ok(wait as _)
    }

    /// Unregister the wait (blocking until callbacks finish) and free its
    /// contexts.
    fn release_wait(&mut self, token: usize, wait: &mut std::os::windows::io::RawHandle) {
        unregister_wait(wait);
        if let Some(contexts) = self.wait_contexts.remove(&token) {
            for context in contexts {
                drop(unsafe { Box::from_raw(context) });
            }
        }
    }

    pub(crate) fn submit(&mut self) -> Status {
        Status::Ok
    }

    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<RawEvent>,
    ) -> Status {
        let timeout_ms = match timeout {
            None => INFINITE,
            Some(d) if d.is_zero() => 0,
            Some(d) => (d.as_millis().min(u32::MAX as u128 - 1) as u32).max(1),
        };

        let mut entries: Vec<OVERLAPPED_ENTRY> =
            vec![unsafe { std::mem::zeroed() }; self.event_capacity];
        let mut received = 0u32;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port.raw(),
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut received,
                timeout_ms,
                0,
            )
        };
        if ok == 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) {
                return Status::Ok;
            }
            return Status::from(err);
        }

        for entry in entries.iter().take(received as usize) {
            let key = entry.lpCompletionKey;
            if key == WAKER_KEY {
                drain_packets(&self.packets, events);
                continue;
            }
            let token = if key >= THREAD_KEY_BASE {
                match self.thread_keys.get(&key) {
                    Some(token) => *token,
                    None => continue,
                }
            } else {
                let (token, serial) = unpack_cookie(key as u64);
                match self.registered.get(token) {
                    Some(registration) if registration.serial == serial => token,
                    _ => continue,
                }
            };
            let Some(registration) = self.registered.get(token) else {
                continue;
            };
            let handle = registration.handle.clone();
            let data = match handle.kind() {
                HandleKind::Timer => NotifyData {
                    result: 1,
                    flags: 0,
                    rearm: registration.manual_rearm,
                },
                HandleKind::Poll => NotifyData {
                    result: 0,
                    flags: PollFlags::IN.bits() as u32,
                    // The registered wait was one-shot; re-associate.
                    rearm: true,
                },
                HandleKind::Thread => NotifyData {
                    result: 0,
                    flags: 0,
                    rearm: false,
                },
            };
            events.push(RawEvent::Event { handle, data });
        }
        Status::Ok
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::Port {
            packets: self.packets.clone(),
            port: self.port.clone(),
        }
    }

    pub(crate) fn create_thread_source(&mut self) -> Result<ThreadSource, Status> {
        let key = self.next_thread_key;
        self.next_thread_key += 1;
        Ok(ThreadSource {
            mailbox: Arc::new(Mailbox::Locked {
                queue: Mutex::new(VecDeque::new()),
                signal: ThreadSignal::Port {
                    port: self.port.clone(),
                    key,
                },
            }),
            local: VecDeque::new(),
            key,
        })
    }

    pub(crate) fn supports_timer_reset(&self, _handle: &Handle, _count: u32) -> bool {
        true
    }
}

fn unregister_wait(wait: &mut std::os::windows::io::RawHandle) {
    if wait.is_null() {
        return;
    }
    unsafe {
        // Block until in-flight callbacks finish so the context can go.
        UnregisterWaitEx(*wait as HANDLE, INVALID_HANDLE_VALUE);
    }
    *wait = std::ptr::null_mut();
}
