// PanelSync - Offline Chapter Reader for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Progress listener registry
//!
//! Listeners register per chapter or globally and receive a [`DownloadProgress`]
//! snapshot on every state change. Registration returns a [`Subscription`]
//! that unregisters when dropped or when [`Subscription::unsubscribe`] is called.
//!
//! Listeners only observe; nothing they do feeds back into scheduling.

use crate::download::job::ChapterKey;
use crate::download::progress::DownloadProgress;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Callback type for progress updates
pub type ProgressCallback = Arc<dyn Fn(&ChapterKey, &DownloadProgress) + Send + Sync>;

/// What a listener is interested in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerScope {
    Chapter(ChapterKey),
    Global,
}

/// Event delivered to channel listeners
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub key: ChapterKey,
    pub progress: DownloadProgress,
}

#[derive(Clone)]
enum Sink {
    Callback(ProgressCallback),
    Channel(mpsc::UnboundedSender<ProgressEvent>),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<ListenerScope, Vec<(u64, Sink)>>,
}

impl Registry {
    fn insert(&mut self, scope: ListenerScope, sink: Sink) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.listeners.entry(scope).or_default().push((id, sink));
        id
    }

    fn remove(&mut self, scope: &ListenerScope, id: u64) {
        if let Some(sinks) = self.listeners.get_mut(scope) {
            sinks.retain(|(sink_id, _)| *sink_id != id);
            if sinks.is_empty() {
                self.listeners.remove(scope);
            }
        }
    }
}

/// Fan-out registry owned by the emitting component
#[derive(Clone, Default)]
pub struct ProgressHub {
    registry: Arc<Mutex<Registry>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn subscribe(&self, scope: ListenerScope, callback: ProgressCallback) -> Subscription {
        let id = self.registry.lock().insert(scope.clone(), Sink::Callback(callback));
        self.subscription(scope, id)
    }

    /// Register a channel listener
    pub fn subscribe_channel(
        &self,
        scope: ListenerScope,
    ) -> (Subscription, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.lock().insert(scope.clone(), Sink::Channel(tx));
        (self.subscription(scope, id), rx)
    }

    /// Deliver a snapshot to chapter listeners, then global ones
    pub fn emit(&self, key: &ChapterKey, progress: &DownloadProgress) {
        let scopes = [ListenerScope::Chapter(key.clone()), ListenerScope::Global];

        // Callbacks run outside the lock so they may unsubscribe
        let mut sinks: Vec<(ListenerScope, u64, Sink)> = Vec::new();
        {
            let registry = self.registry.lock();
            for scope in &scopes {
                if let Some(registered) = registry.listeners.get(scope) {
                    for (id, sink) in registered {
                        sinks.push((scope.clone(), *id, sink.clone()));
                    }
                }
            }
        }

        let mut closed = Vec::new();
        for (scope, id, sink) in sinks {
            match sink {
                Sink::Callback(callback) => callback(key, progress),
                Sink::Channel(tx) => {
                    let event = ProgressEvent {
                        key: key.clone(),
                        progress: progress.clone(),
                    };
                    if tx.send(event).is_err() {
                        closed.push((scope, id));
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut registry = self.registry.lock();
            for (scope, id) in closed {
                registry.remove(&scope, id);
            }
        }
    }

    /// Number of registered listeners across all scopes
    pub fn listener_count(&self) -> usize {
        self.registry.lock().listeners.values().map(Vec::len).sum()
    }

    fn subscription(&self, scope: ListenerScope, id: u64) -> Subscription {
        Subscription {
            registry: Arc::downgrade(&self.registry),
            scope,
            id,
        }
    }
}

/// Disposer for a registered listener
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    scope: ListenerScope,
    id: u64,
}

impl Subscription {
    /// Unregister now
    pub fn unsubscribe(self) {}

    /// Keep the listener registered for the lifetime of the hub
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.scope, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(chapter: &str) -> ChapterKey {
        ChapterKey::new("m1", chapter).unwrap()
    }

    #[test]
    fn test_scoped_and_global_delivery() {
        let hub = ProgressHub::new();
        let chapter_hits = Arc::new(AtomicUsize::new(0));
        let global_hits = Arc::new(AtomicUsize::new(0));

        let counter = chapter_hits.clone();
        let _chapter = hub.subscribe(
            ListenerScope::Chapter(key("c1")),
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = global_hits.clone();
        let _global = hub.subscribe(
            ListenerScope::Global,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        hub.emit(&key("c1"), &DownloadProgress::new(&key("c1")));
        hub.emit(&key("c2"), &DownloadProgress::new(&key("c2")));

        assert_eq!(chapter_hits.load(Ordering::SeqCst), 1);
        assert_eq!(global_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_and_drop_remove_listener() {
        let hub = ProgressHub::new();
        let first = hub.subscribe(ListenerScope::Global, Arc::new(|_, _| {}));
        let second = hub.subscribe(ListenerScope::Global, Arc::new(|_, _| {}));
        assert_eq!(hub.listener_count(), 2);

        first.unsubscribe();
        assert_eq!(hub.listener_count(), 1);
        drop(second);
        assert_eq!(hub.listener_count(), 0);

        hub.subscribe(ListenerScope::Global, Arc::new(|_, _| {})).detach();
        assert_eq!(hub.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_listener_pruned_when_closed() {
        let hub = ProgressHub::new();
        let (subscription, mut rx) = hub.subscribe_channel(ListenerScope::Chapter(key("c1")));
        subscription.detach();

        hub.emit(&key("c1"), &DownloadProgress::new(&key("c1")));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, key("c1"));

        drop(rx);
        hub.emit(&key("c1"), &DownloadProgress::new(&key("c1")));
        assert_eq!(hub.listener_count(), 0);
    }
}
