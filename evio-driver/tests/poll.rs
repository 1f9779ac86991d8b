#![cfg(unix)]

use std::{cell::RefCell, os::fd::AsRawFd, rc::Rc, time::Duration};

use evio_driver::{PollFlags, Queue, QueueInfo, QueueWakeupInfo, Status, WakeupFlags};

#[test]
fn readable_pipe() {
    let queue = Queue::create(QueueInfo::default()).unwrap();
    let (read_end, write_end) = rustix::pipe::pipe().unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let q = queue.clone();
    let recorded = events.clone();
    let handle = queue
        .listen_pollable(
            read_end.as_raw_fd(),
            PollFlags::IN,
            move |handle, value, status| {
                if status == Status::Ok {
                    recorded.borrow_mut().push((value, status));
                    // The pipe stays readable; pause instead of draining so
                    // exactly one edge is observed.
                    handle.pause();
                    q.wakeup(WakeupFlags::GRACEFUL);
                }
            },
        )
        .unwrap();

    rustix::io::write(&write_end, b"x").unwrap();

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    let (value, status) = events[0];
    assert_eq!(status, Status::Ok);
    assert!(PollFlags::from_bits_truncate(value as u16).contains(PollFlags::IN));
    // Readable is not a terminal condition; the handle is merely paused.
    assert_eq!(handle.status(), Status::Declined);
}

#[test]
fn hangup_terminates_the_handle() {
    let queue = Queue::create(QueueInfo::default()).unwrap();
    let (read_end, write_end) = rustix::pipe::pipe().unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let q = queue.clone();
    let recorded = events.clone();
    let handle = queue
        .listen_pollable(
            read_end.as_raw_fd(),
            PollFlags::IN | PollFlags::HUNG_UP,
            move |_, value, status| {
                recorded.borrow_mut().push((value, status));
                if status != Status::Ok {
                    q.wakeup(WakeupFlags::GRACEFUL);
                }
            },
        )
        .unwrap();

    drop(write_end);

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);

    let events = events.borrow();
    assert_eq!(events.len(), 2);
    let (value, status) = events[0];
    assert_eq!(status, Status::Ok);
    assert!(PollFlags::from_bits_truncate(value as u16).contains(PollFlags::HUNG_UP));
    assert_eq!(events[1].1, Status::Done);
    assert_eq!(handle.status(), Status::Done);

    assert_eq!(handle.cancel(), Status::ErrorAlreadyPerformed);
}

#[test]
fn pause_and_resume() {
    let queue = Queue::create(QueueInfo::default()).unwrap();
    let (read_end, write_end) = rustix::pipe::pipe().unwrap();

    let hits = Rc::new(RefCell::new(0u32));
    let q = queue.clone();
    let counter = hits.clone();
    let handle = queue
        .listen_pollable(
            read_end.as_raw_fd(),
            PollFlags::IN,
            move |handle, _, status| {
                if status == Status::Ok {
                    *counter.borrow_mut() += 1;
                    handle.pause();
                    q.wakeup(WakeupFlags::GRACEFUL);
                }
            },
        )
        .unwrap();

    let timeline = handle.timeline();
    assert_eq!(handle.pause(), Status::Ok);
    assert_eq!(handle.status(), Status::Declined);
    assert!(handle.timeline() > timeline);

    // Paused: data arrives but nothing is delivered.
    rustix::io::write(&write_end, b"x").unwrap();
    queue.run(Some(Duration::from_millis(30)), QueueWakeupInfo::default());
    assert_eq!(*hits.borrow(), 0);

    assert_eq!(handle.resume(), Status::Ok);
    assert_eq!(handle.status(), Status::Ok);
    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);
    assert_eq!(*hits.borrow(), 1);

    assert_eq!(handle.cancel(), Status::Ok);
}

#[test]
fn poll_returns_zero_when_idle() {
    let queue = Queue::create(QueueInfo::default()).unwrap();
    let start = std::time::Instant::now();
    assert_eq!(queue.poll(), 0);
    assert!(start.elapsed() < Duration::from_millis(100));
}
