use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    thread::ThreadId,
};

use crate::looper::{Looper, LooperHandle};

/// An opaque event category tag allocated by [`Bus::allocate_category`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusEventCategory(u32);

impl BusEventCategory {
    /// The raw tag value; 0 is never allocated.
    pub fn get(self) -> u32 {
        self.0
    }
}

/// An event broadcast through a [`Bus`].
pub struct BusEvent {
    category: BusEventCategory,
    payload: Option<Box<dyn Any + Send + Sync>>,
}

impl BusEvent {
    /// An event with no payload.
    pub fn new(category: BusEventCategory) -> Self {
        Self {
            category,
            payload: None,
        }
    }

    /// An event carrying `payload`.
    pub fn with_payload(
        category: BusEventCategory,
        payload: impl Any + Send + Sync,
    ) -> Self {
        Self {
            category,
            payload: Some(Box::new(payload)),
        }
    }

    /// The event's category.
    pub fn category(&self) -> BusEventCategory {
        self.category
    }

    /// The payload, when it has the expected type.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref())
    }
}

type BusEventCallback = Arc<dyn Fn(&Arc<Bus>, &BusEvent, &BusDelegate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelegateState {
    /// Attached, waiting for events.
    Pending,
    /// Inside its callback right now.
    Active,
    /// Invalidated while active; finalized when the callback returns.
    Invalidated,
    /// Detached for good.
    Finalized,
}

/// A listener bound to one looper and a set of categories.
///
/// Events are always delivered on the delegate's looper thread, in the
/// dispatcher's call order.
pub struct BusDelegate {
    looper: LooperHandle,
    categories: Vec<BusEventCategory>,
    callback: Mutex<Option<BusEventCallback>>,
    state: Mutex<DelegateState>,
    bus: Mutex<Weak<Bus>>,
}

impl BusDelegate {
    /// Create a delegate delivering events for `categories` onto `looper`.
    pub fn new(
        looper: &Looper,
        categories: &[BusEventCategory],
        callback: impl Fn(&Arc<Bus>, &BusEvent, &BusDelegate) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            looper: looper.handle(),
            categories: categories.to_vec(),
            callback: Mutex::new(Some(Arc::new(callback))),
            state: Mutex::new(DelegateState::Pending),
            bus: Mutex::new(Weak::new()),
        })
    }

    /// The categories the delegate listens for.
    pub fn categories(&self) -> &[BusEventCategory] {
        &self.categories
    }

    /// The looper the delegate delivers on.
    pub fn looper(&self) -> &LooperHandle {
        &self.looper
    }

    /// The bus the delegate is attached to, if any.
    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.lock().expect("delegate poisoned").upgrade()
    }

    /// Disable the delegate. Must run on the delegate's looper; when called
    /// from elsewhere the invalidation is forwarded there. A delegate that
    /// is currently inside its callback is finalized when it returns.
    pub fn invalidate(self: &Arc<Self>) {
        if self.looper.is_on_thread() {
            self.invalidate_on_thread();
        } else {
            let this = self.clone();
            self.looper.perform(move || this.invalidate_on_thread());
        }
    }

    fn invalidate_on_thread(&self) {
        let mut state = self.state.lock().expect("delegate poisoned");
        match *state {
            DelegateState::Pending => {
                drop(state);
                self.finalize();
            }
            DelegateState::Active => *state = DelegateState::Invalidated,
            _ => {}
        }
    }

    fn finalize(&self) {
        *self.state.lock().expect("delegate poisoned") = DelegateState::Finalized;
        self.callback.lock().expect("delegate poisoned").take();
    }

    pub(crate) fn handle_event(&self, bus: &Arc<Bus>, event: &BusEvent) {
        if !self.looper.is_on_thread() {
            evio_log::error!(
                "bus event '{}' must be handled on the delegate's looper thread; skipped",
                bus.category_name(event.category()).unwrap_or_default()
            );
            return;
        }

        let callback = self.callback.lock().expect("delegate poisoned").clone();
        let Some(callback) = callback else {
            return;
        };

        {
            let mut state = self.state.lock().expect("delegate poisoned");
            if *state != DelegateState::Pending {
                return;
            }
            *state = DelegateState::Active;
        }

        callback(bus, event, self);

        let mut state = self.state.lock().expect("delegate poisoned");
        if *state == DelegateState::Invalidated {
            drop(state);
            self.finalize();
        } else if *state == DelegateState::Active {
            *state = DelegateState::Pending;
        }
    }

    fn handle_added(&self, bus: &Arc<Bus>) {
        *self.bus.lock().expect("delegate poisoned") = Arc::downgrade(bus);
    }

    fn handle_removed(&self) {
        *self.bus.lock().expect("delegate poisoned") = Weak::new();
    }
}

#[derive(Default)]
struct BusInner {
    categories: Vec<String>,
    by_category: HashMap<u32, Vec<Arc<BusDelegate>>>,
    by_looper: HashMap<ThreadId, (LooperHandle, Vec<Arc<BusDelegate>>)>,
}

/// Process-wide categorical pub/sub.
///
/// Delegates are held by strong reference; events fan out per looper under
/// the registry lock and are delivered outside of it, each on the owning
/// looper's thread.
#[derive(Default)]
pub struct Bus {
    inner: Mutex<BusInner>,
}

impl Bus {
    /// Create a bus.
    pub fn new() -> Arc<Bus> {
        Arc::new(Bus::default())
    }

    /// Allocate a category tag for `name`.
    pub fn allocate_category(&self, name: impl Into<String>) -> BusEventCategory {
        let mut inner = self.inner.lock().expect("bus registry poisoned");
        inner.categories.push(name.into());
        BusEventCategory(inner.categories.len() as u32)
    }

    /// Number of delegates currently attached for `category`.
    pub fn listener_count(&self, category: BusEventCategory) -> usize {
        let inner = self.inner.lock().expect("bus registry poisoned");
        inner
            .by_category
            .get(&category.get())
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// The name a category was allocated with.
    pub fn category_name(&self, category: BusEventCategory) -> Option<String> {
        let inner = self.inner.lock().expect("bus registry poisoned");
        if category.0 == 0 {
            return None;
        }
        inner.categories.get(category.0 as usize - 1).cloned()
    }

    /// Attach a delegate under its declared categories. The bus keeps a
    /// strong reference until the delegate is removed.
    pub fn add_listener(self: &Arc<Self>, delegate: Arc<BusDelegate>) {
        if delegate.bus().is_some() {
            evio_log::error!("bus delegate is already attached to a bus");
            return;
        }
        let mut inner = self.inner.lock().expect("bus registry poisoned");
        for category in delegate.categories() {
            inner
                .by_category
                .entry(category.get())
                .or_default()
                .push(delegate.clone());
        }
        let thread = delegate.looper().thread();
        let entry = inner
            .by_looper
            .entry(thread)
            .or_insert_with(|| (delegate.looper().clone(), Vec::new()));
        let fresh_looper = entry.1.is_empty();
        entry.1.push(delegate.clone());
        drop(inner);

        if fresh_looper {
            delegate.looper().attach_bus(self);
        }
        delegate.handle_added(self);
    }

    /// Detach a delegate from every category it was registered under.
    pub fn remove_listener(self: &Arc<Self>, delegate: &Arc<BusDelegate>) {
        match delegate.bus() {
            Some(bus) if Arc::ptr_eq(&bus, self) => {}
            _ => {
                evio_log::error!("bus delegate is not attached to this bus");
                return;
            }
        }
        let mut inner = self.inner.lock().expect("bus registry poisoned");
        self.unlink(&mut inner, delegate);
        drop(inner);
        delegate.handle_removed();
    }

    fn unlink(self: &Arc<Self>, inner: &mut BusInner, delegate: &Arc<BusDelegate>) {
        for category in delegate.categories() {
            if let Some(listeners) = inner.by_category.get_mut(&category.get()) {
                listeners.retain(|d| !Arc::ptr_eq(d, delegate));
                if listeners.is_empty() {
                    inner.by_category.remove(&category.get());
                }
            }
        }
        let thread = delegate.looper().thread();
        let mut detach = false;
        if let Some((_, listeners)) = inner.by_looper.get_mut(&thread) {
            listeners.retain(|d| !Arc::ptr_eq(d, delegate));
            if listeners.is_empty() {
                detach = true;
            }
        }
        if detach {
            if let Some((looper, _)) = inner.by_looper.remove(&thread) {
                looper.detach_bus(self);
            }
        }
    }

    /// Broadcast `event` to every delegate of its category, each on its
    /// own looper thread.
    pub fn dispatch_event(self: &Arc<Self>, event: BusEvent) {
        let event = Arc::new(event);

        let mut fanout: HashMap<ThreadId, (LooperHandle, Vec<Arc<BusDelegate>>)> = HashMap::new();
        {
            let inner = self.inner.lock().expect("bus registry poisoned");
            if let Some(listeners) = inner.by_category.get(&event.category().get()) {
                for delegate in listeners {
                    let entry = fanout
                        .entry(delegate.looper().thread())
                        .or_insert_with(|| (delegate.looper().clone(), Vec::new()));
                    entry.1.push(delegate.clone());
                }
            }
        }

        for (_, (looper, delegates)) in fanout {
            let bus = self.clone();
            let event = event.clone();
            looper.perform(move || {
                for delegate in &delegates {
                    delegate.handle_event(&bus, &event);
                }
            });
        }
    }

    /// Drop every delegate attached for the looper of `thread`. Called on
    /// looper teardown.
    pub(crate) fn invalidate_looper(self: &Arc<Self>, thread: ThreadId) {
        let delegates = {
            let mut inner = self.inner.lock().expect("bus registry poisoned");
            // Remove the looper entry first to stop the recursion through
            // detach_bus.
            match inner.by_looper.remove(&thread) {
                Some((_, delegates)) => {
                    for delegate in &delegates {
                        for category in delegate.categories() {
                            if let Some(listeners) =
                                inner.by_category.get_mut(&category.get())
                            {
                                listeners.retain(|d| !Arc::ptr_eq(d, delegate));
                                if listeners.is_empty() {
                                    inner.by_category.remove(&category.get());
                                }
                            }
                        }
                    }
                    delegates
                }
                None => Vec::new(),
            }
        };
        for delegate in delegates {
            delegate.handle_removed();
        }
    }
}
