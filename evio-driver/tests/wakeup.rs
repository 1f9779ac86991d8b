use std::{cell::RefCell, rc::Rc, time::Duration};

use evio_driver::{
    Queue, QueueInfo, QueueWakeupInfo, Status, TimerInfo, WakeupFlags,
};

fn queue() -> Queue {
    Queue::create(QueueInfo::default()).unwrap()
}

#[test]
fn graceful_wakeup_suspends_armed_handles() {
    let queue = queue();

    let timer = queue
        .schedule_timer(
            TimerInfo::repeating(Duration::from_millis(5), TimerInfo::INFINITE),
            |_, _, _| {},
        )
        .unwrap();
    let thread = queue.add_thread_handle().unwrap();

    let waker = queue.waker();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        waker.wakeup(WakeupFlags::GRACEFUL)
    });

    let status = queue.run(None, QueueWakeupInfo::default());
    stopper.join().unwrap();

    assert_eq!(status, Status::Ok);
    assert_eq!(timer.status(), Status::Suspended);
    assert_eq!(thread.status(), Status::Suspended);

    // The next turn rearms everything that was quiesced.
    queue.submit_pending();
    assert_eq!(timer.status(), Status::Ok);
    assert_eq!(thread.status(), Status::Ok);

    timer.cancel();
    thread.cancel();
}

#[test]
fn forced_wakeup_returns_suspended() {
    let queue = queue();
    let waker = queue.waker();

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        waker.wakeup(WakeupFlags::empty())
    });

    let status = queue.run(None, QueueWakeupInfo::default());
    stopper.join().unwrap();
    assert_eq!(status, Status::Suspended);
}

#[test]
fn context_default_uses_run_flags() {
    let queue = queue();
    let waker = queue.waker();

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        waker.wakeup(WakeupFlags::CONTEXT_DEFAULT)
    });

    let status = queue.run(
        None,
        QueueWakeupInfo {
            flags: WakeupFlags::GRACEFUL,
            timeout: None,
        },
    );
    stopper.join().unwrap();
    assert_eq!(status, Status::Ok);
}

#[test]
fn root_wakeup_unwinds_nested_runs() {
    let queue = queue();
    let depths = Rc::new(RefCell::new(Vec::new()));

    let q = queue.clone();
    let observed = depths.clone();
    queue
        .schedule(Duration::from_millis(10), move |_, success| {
            assert!(success);
            let waker = q.waker();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                waker.wakeup_root(WakeupFlags::empty());
            });
            let inner = q.run(None, QueueWakeupInfo::default());
            observed.borrow_mut().push(("inner", inner));
        })
        .unwrap();

    let outer = queue.run(None, QueueWakeupInfo::default());
    depths.borrow_mut().push(("outer", outer));

    let depths = depths.borrow();
    assert_eq!(depths[0], ("inner", Status::Suspended));
    // The outer context is stopped while unwinding, with its own flags.
    assert_eq!(depths[1], ("outer", Status::Done));
}

#[test]
fn perform_next_only_inside_processing() {
    let queue = queue();
    assert!(!queue.is_processing());
    assert_eq!(queue.perform_next(|| {}), Status::Declined);

    let ran = Rc::new(RefCell::new(false));
    let q = queue.clone();
    let flag = ran.clone();
    queue
        .schedule(Duration::from_millis(5), move |_, _| {
            assert!(q.is_processing());
            let flag = flag.clone();
            let status = q.perform_next(move || {
                *flag.borrow_mut() = true;
            });
            assert_eq!(status, Status::Ok);
            q.wakeup(WakeupFlags::GRACEFUL);
        })
        .unwrap();

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);
    assert!(*ran.borrow());
}

#[test]
fn successors_follow_their_origin() {
    let queue = queue();
    let order = Rc::new(RefCell::new(Vec::new()));

    let observed = order.clone();
    let origin = queue
        .schedule_timer(TimerInfo::once(Duration::from_millis(10)), move |_, _, status| {
            if status == Status::Done {
                observed.borrow_mut().push("origin");
            }
        })
        .unwrap();

    let q = queue.clone();
    let observed = order.clone();
    let follower = queue
        .schedule_timer(TimerInfo::once(Duration::from_millis(1)), move |_, _, status| {
            if status == Status::Done {
                observed.borrow_mut().push("follower");
                q.wakeup(WakeupFlags::GRACEFUL);
            }
        })
        .unwrap();

    // Park the follower until the origin completes.
    assert_eq!(follower.pause(), Status::Ok);
    assert_eq!(queue.run_handle_after(&follower, &origin), Status::Suspended);

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);
    assert_eq!(order.borrow().as_slice(), &["origin", "follower"]);
}

#[test]
fn cancel_all_on_queue_teardown() {
    let queue = queue();
    let events = Rc::new(RefCell::new(Vec::new()));

    let recorded = events.clone();
    let timer = queue
        .schedule_timer(TimerInfo::once(Duration::from_secs(60)), move |_, _, status| {
            recorded.borrow_mut().push(status);
        })
        .unwrap();

    queue.cancel();
    assert_eq!(timer.status(), Status::ErrorCancelled);
    assert_eq!(events.borrow().as_slice(), &[Status::ErrorCancelled]);
}
