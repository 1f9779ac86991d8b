use std::{
    sync::{mpsc, Arc},
    thread::ThreadId,
    time::Duration,
};

use evio_driver::{Status, WakeupFlags};
use evio_runtime::{Bus, BusDelegate, BusEvent, BusEventCategory, Looper, LooperHandle, LooperInfo};

/// Spin a looper thread with one delegate for `category`; every delivery
/// (with the receiving thread id) is reported through `deliveries`. The
/// returned handle stops the loop with a graceful wakeup.
fn listener_thread(
    bus: Arc<Bus>,
    category: BusEventCategory,
    deliveries: mpsc::Sender<(ThreadId, u32)>,
) -> (std::thread::JoinHandle<()>, LooperHandle) {
    let (handle_tx, handle_rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        let looper = Looper::acquire(LooperInfo::default()).unwrap();
        let delegate = BusDelegate::new(&looper, &[category], move |_, event, delegate| {
            assert!(delegate.looper().is_on_thread());
            let value = *event.payload::<u32>().unwrap_or(&0);
            deliveries
                .send((std::thread::current().id(), value))
                .unwrap();
        });
        bus.add_listener(delegate);
        handle_tx.send(looper.handle()).unwrap();

        // Serve deliveries until stopped from outside.
        while looper.run_default() != Status::Ok {}
        Looper::release();
    });
    let handle = handle_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("listener failed to start");
    (thread, handle)
}

fn wait_for_listeners(bus: &Arc<Bus>, category: BusEventCategory, expected: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while bus.listener_count(category) < expected {
        assert!(
            std::time::Instant::now() < deadline,
            "listeners did not attach in time"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn broadcast_reaches_every_looper_once() {
    let bus = Bus::new();
    let category = bus.allocate_category("test-event");

    let (tx, rx) = mpsc::channel();
    let (l1, h1) = listener_thread(bus.clone(), category, tx.clone());
    let (l2, h2) = listener_thread(bus.clone(), category, tx);
    wait_for_listeners(&bus, category, 2);

    bus.dispatch_event(BusEvent::with_payload(category, 7u32));

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.1, 7);
    assert_eq!(second.1, 7);
    assert_ne!(first.0, second.0, "each delivery on its own looper thread");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    h1.wakeup(WakeupFlags::GRACEFUL);
    h2.wakeup(WakeupFlags::GRACEFUL);
    l1.join().unwrap();
    l2.join().unwrap();
}

#[test]
fn events_arrive_in_dispatch_order() {
    let bus = Bus::new();
    let category = bus.allocate_category("ordered");

    let (tx, rx) = mpsc::channel();
    let (listener, handle) = listener_thread(bus.clone(), category, tx);
    wait_for_listeners(&bus, category, 1);

    for i in 0..100u32 {
        bus.dispatch_event(BusEvent::with_payload(category, i));
    }

    let mut seen = Vec::new();
    while seen.len() < 100 {
        let (_, value) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        seen.push(value);
    }
    assert_eq!(seen, (0..100).collect::<Vec<_>>());

    handle.wakeup(WakeupFlags::GRACEFUL);
    listener.join().unwrap();
}

#[test]
fn invalidated_delegate_receives_nothing() {
    let bus = Bus::new();
    let category = bus.allocate_category("silenced");

    let (tx, rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();
    let bus_for_listener = bus.clone();
    let listener = std::thread::spawn(move || {
        let looper = Looper::acquire(LooperInfo::default()).unwrap();
        let delegate = BusDelegate::new(&looper, &[category], move |_, _, _| {
            tx.send(()).unwrap();
        });
        bus_for_listener.add_listener(delegate.clone());
        delegate.invalidate();
        handle_tx.send(looper.handle()).unwrap();

        while looper.run_default() != Status::Ok {}
        Looper::release();
    });
    let handle = handle_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    bus.dispatch_event(BusEvent::new(category));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    handle.wakeup(WakeupFlags::GRACEFUL);
    listener.join().unwrap();
}

#[test]
fn looper_teardown_detaches_its_delegates() {
    let bus = Bus::new();
    let category = bus.allocate_category("teardown");

    let (tx, _rx) = mpsc::channel();
    let (listener, handle) = listener_thread(bus.clone(), category, tx);
    wait_for_listeners(&bus, category, 1);

    handle.wakeup(WakeupFlags::GRACEFUL);
    listener.join().unwrap();

    // Looper::release ran in the listener thread; its delegates are gone.
    assert_eq!(bus.listener_count(category), 0);
    // Dispatching into the empty category is a no-op.
    bus.dispatch_event(BusEvent::new(category));
}

#[test]
fn category_names_round_trip() {
    let bus = Bus::new();
    let a = bus.allocate_category("alpha");
    let b = bus.allocate_category("beta");
    assert_ne!(a, b);
    assert_eq!(bus.category_name(a).as_deref(), Some("alpha"));
    assert_eq!(bus.category_name(b).as_deref(), Some("beta"));
}
