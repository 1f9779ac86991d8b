use std::{
    cell::RefCell,
    rc::Rc,
    sync::{Arc, Mutex},
    time::Duration,
};

use evio_driver::{Queue, QueueInfo, QueueWakeupInfo, Status, WakeupFlags};

#[test]
fn cross_thread_hand_off_preserves_order() {
    let queue = Queue::create(QueueInfo::default()).unwrap();
    let handle = queue.add_thread_handle().unwrap();
    let sender = handle.sender();
    let waker = queue.waker();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let producer = std::thread::spawn(move || {
        for i in 0..1000u32 {
            let sink = sink.clone();
            let status = sender.perform(move || {
                sink.lock().unwrap().push(i);
            });
            assert_eq!(status, Status::Ok);
        }
        sender.perform(move || {});
        waker.wakeup(WakeupFlags::empty());
    });

    let status = queue.run(None, QueueWakeupInfo::default());
    producer.join().unwrap();
    assert_eq!(status, Status::Suspended);

    // Tasks may still be in flight when the wakeup lands; drain the rest.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while received.lock().unwrap().len() < 1000 && std::time::Instant::now() < deadline {
        queue.wait(Some(Duration::from_millis(10)));
    }

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1000);
    assert!(received.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn same_thread_perform_runs_on_next_turn() {
    let queue = Queue::create(QueueInfo::default()).unwrap();
    let handle = queue.add_thread_handle().unwrap();

    let ran = Rc::new(RefCell::new(false));
    let flag = ran.clone();
    assert_eq!(
        handle.perform(move || {
            *flag.borrow_mut() = true;
        }),
        Status::Ok
    );
    assert!(!*ran.borrow());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !*ran.borrow() && std::time::Instant::now() < deadline {
        queue.wait(Some(Duration::from_millis(10)));
    }
    assert!(*ran.borrow());
}

#[test]
fn producers_on_multiple_threads() {
    let queue = Queue::create(QueueInfo::default()).unwrap();
    let handle = queue.add_thread_handle().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let threads: Vec<_> = (0..4u32)
        .map(|t| {
            let sender = handle.sender();
            let sink = received.clone();
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    let sink = sink.clone();
                    sender.perform(move || {
                        sink.lock().unwrap().push((t, i));
                    });
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while received.lock().unwrap().len() < 400 && std::time::Instant::now() < deadline {
        queue.wait(Some(Duration::from_millis(10)));
    }

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 400);
    // FIFO per submitting thread; no promise across threads.
    for t in 0..4u32 {
        let per_thread: Vec<u32> = received
            .iter()
            .filter(|(thread, _)| *thread == t)
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(per_thread, (0..100).collect::<Vec<_>>());
    }
}

#[test]
fn thread_handle_cancel_is_terminal() {
    let queue = Queue::create(QueueInfo::default()).unwrap();
    let handle = queue.add_thread_handle().unwrap();

    assert_eq!(handle.status(), Status::Ok);
    assert_eq!(handle.cancel(), Status::Ok);
    assert_eq!(handle.status(), Status::ErrorCancelled);
    assert_eq!(handle.cancel(), Status::ErrorAlreadyPerformed);

    // A sender outlives the handle but its signals go nowhere harmful.
    let sender = handle.sender();
    sender.perform(|| {});
    assert_eq!(queue.poll(), 0);
}
