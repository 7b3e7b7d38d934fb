// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Listener registry and event fan-out.
//!
//! Each category keeps an ordered set of observers. Dispatch takes a
//! snapshot of the set first, so registrations made while an event is being
//! delivered only apply from the next event on. The lock is never held while
//! a listener runs.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::events::{ConnectEvent, MessageEvent, PrepareEvent};

/// Observer of one event category.
///
/// Listeners run on the connector task and must not block.
pub trait Listener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

pub type PrepareListener = Arc<dyn Listener<PrepareEvent>>;
pub type ConnectListener = Arc<dyn Listener<ConnectEvent>>;
pub type MessageListener = Arc<dyn Listener<MessageEvent>>;

fn same_listener<E>(a: &Arc<dyn Listener<E>>, b: &Arc<dyn Listener<E>>) -> bool {
    // Compare data pointers only; vtable pointers are not unique.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Ordered set of observers for one event type.
pub struct ListenerSet<E> {
    entries: Mutex<Vec<Arc<dyn Listener<E>>>>,
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<E> ListenerSet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Returns false if it was already registered.
    pub fn add(&self, listener: Arc<dyn Listener<E>>) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        entries.push(listener);
        true
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&self, listener: &Arc<dyn Listener<E>>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|l| !same_listener(l, listener));
        entries.len() != before
    }

    pub fn contains(&self, listener: &Arc<dyn Listener<E>>) -> bool {
        self.entries.lock().iter().any(|l| same_listener(l, listener))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener registered when dispatch starts.
    pub fn dispatch(&self, event: &E) {
        let snapshot: Vec<Arc<dyn Listener<E>>> = self.entries.lock().clone();
        trace!("Dispatching to {} listeners", snapshot.len());
        for listener in snapshot {
            listener.on_event(event);
        }
    }
}

/// The three listener categories exposed to the UI layer.
#[derive(Default)]
pub struct ListenerRegistry {
    pub(crate) prepare: ListenerSet<PrepareEvent>,
    pub(crate) connect: ListenerSet<ConnectEvent>,
    pub(crate) message: ListenerSet<MessageEvent>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_prepare_listener(&self, listener: PrepareListener) {
        self.prepare.add(listener);
    }

    pub fn remove_prepare_listener(&self, listener: &PrepareListener) {
        self.prepare.remove(listener);
    }

    pub fn add_connect_listener(&self, listener: ConnectListener) {
        self.connect.add(listener);
    }

    pub fn remove_connect_listener(&self, listener: &ConnectListener) {
        self.connect.remove(listener);
    }

    pub fn add_message_listener(&self, listener: MessageListener) {
        self.message.add(listener);
    }

    pub fn remove_message_listener(&self, listener: &MessageListener) {
        self.message.remove(listener);
    }

    /// Register a prepare listener for the lifetime of the returned guard.
    pub fn subscribe_prepare(self: &Arc<Self>, listener: PrepareListener) -> Subscription {
        self.prepare.add(listener.clone());
        Subscription::new(self, move |registry| registry.prepare.remove(&listener))
    }

    /// Register a connect listener for the lifetime of the returned guard.
    pub fn subscribe_connect(self: &Arc<Self>, listener: ConnectListener) -> Subscription {
        self.connect.add(listener.clone());
        Subscription::new(self, move |registry| registry.connect.remove(&listener))
    }

    /// Register a message listener for the lifetime of the returned guard.
    pub fn subscribe_message(self: &Arc<Self>, listener: MessageListener) -> Subscription {
        self.message.add(listener.clone());
        Subscription::new(self, move |registry| registry.message.remove(&listener))
    }
}

type Release = Box<dyn FnOnce(&ListenerRegistry) -> bool + Send>;

/// Registration held by an observer. Removes the listener on release or drop.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    release: Option<Release>,
}

impl Subscription {
    fn new<F>(registry: &Arc<ListenerRegistry>, release: F) -> Self
    where
        F: FnOnce(&ListenerRegistry) -> bool + Send + 'static,
    {
        Self {
            registry: Arc::downgrade(registry),
            release: Some(Box::new(release)),
        }
    }

    /// Unregister now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let (Some(release), Some(registry)) = (self.release.take(), self.registry.upgrade()) {
            release(&registry);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> ConnectListener {
        let log = log.clone();
        Arc::new(move |event: &ConnectEvent| {
            log.lock().push(format!("{}:{}", tag, event.name()));
        })
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add_connect_listener(recorder(&log, "b"));
        registry.add_connect_listener(recorder(&log, "a"));
        registry.connect.dispatch(&ConnectEvent::Disconnected);

        assert_eq!(*log.lock(), vec!["b:disconnected", "a:disconnected"]);
    }

    #[test]
    fn test_add_twice_and_remove_unknown_are_idempotent() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = recorder(&log, "x");
        let stranger = recorder(&log, "y");

        registry.add_connect_listener(listener.clone());
        registry.add_connect_listener(listener.clone());
        assert_eq!(registry.connect.len(), 1);

        registry.remove_connect_listener(&stranger);
        assert_eq!(registry.connect.len(), 1);
        assert!(registry.connect.contains(&listener));

        registry.connect.dispatch(&ConnectEvent::ConnectionLost);
        assert_eq!(log.lock().len(), 1);

        registry.remove_connect_listener(&listener);
        registry.remove_connect_listener(&listener);
        assert!(registry.connect.is_empty());
    }

    #[test]
    fn test_changes_during_dispatch_apply_to_next_event() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let late = recorder(&log, "late");

        // First listener registers `late` and removes `victim` mid-dispatch.
        let victim = recorder(&log, "victim");
        let reg = Arc::downgrade(&registry);
        let late_clone = late.clone();
        let victim_clone = victim.clone();
        let log_clone = log.clone();
        let mutator: ConnectListener = Arc::new(move |event: &ConnectEvent| {
            log_clone.lock().push(format!("mutator:{}", event.name()));
            if let Some(registry) = reg.upgrade() {
                registry.add_connect_listener(late_clone.clone());
                registry.remove_connect_listener(&victim_clone);
            }
        });

        registry.add_connect_listener(mutator);
        registry.add_connect_listener(victim);

        registry.connect.dispatch(&ConnectEvent::Connecting);
        assert_eq!(
            *log.lock(),
            vec!["mutator:connecting", "victim:connecting"]
        );

        log.lock().clear();
        registry.connect.dispatch(&ConnectEvent::Disconnected);
        assert_eq!(*log.lock(), vec!["mutator:disconnected", "late:disconnected"]);
    }

    #[test]
    fn test_subscription_releases_on_drop() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let listener: MessageListener = Arc::new(move |_: &MessageEvent| *counter.lock() += 1);

        let sub = registry.subscribe_message(listener.clone());
        assert!(registry.message.contains(&listener));
        drop(sub);
        assert!(!registry.message.contains(&listener));

        let sub = registry.subscribe_message(listener.clone());
        sub.release();
        assert!(registry.message.is_empty());
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_categories_are_independent() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        registry.add_prepare_listener(Arc::new(move |e: &PrepareEvent| s.lock().push(e.clone())));

        registry.connect.dispatch(&ConnectEvent::ConnectionFailed);
        registry.prepare.dispatch(&PrepareEvent::Prepared);
        assert_eq!(*seen.lock(), vec![PrepareEvent::Prepared]);
    }
}
