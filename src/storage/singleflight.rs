//! Coalescing of concurrent calls that share a key.
//!
//! The first caller for a key starts the work on a detached task. Later
//! callers subscribe to the same result instead of repeating it. The task
//! runs to completion even if every caller stops waiting, so a cancelled
//! request never discards work another request could use.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

type Slot<V> = watch::Receiver<Option<V>>;

#[derive(Debug)]
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
{
    inflight: DashMap<K, Slot<V>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight call for `key`, or starts `work` on a detached
    /// task if there is none. `work` is only invoked when a new call starts.
    pub fn call<F, Fut>(self: &Arc<Self>, key: K, work: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let sender = match self.inflight.entry(key.clone()) {
            Entry::Occupied(slot) => {
                return Flight {
                    receiver: slot.get().clone(),
                    leader: false,
                };
            }
            Entry::Vacant(slot) => {
                let (sender, receiver) = watch::channel(None);
                slot.insert(receiver);
                sender
            }
        };

        let receiver = sender.subscribe();
        let future = work();
        let guard = InflightGuard {
            group: Arc::clone(self),
            key,
        };
        tokio::spawn(async move {
            let _guard = guard;
            let value = future.await;
            // Publish before the key is released so no caller misses it
            sender.send_replace(Some(value));
        });

        Flight {
            receiver,
            leader: true,
        }
    }

    /// Number of calls currently running.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }
}

/// Removes the key once the detached task ends, including by panic.
struct InflightGuard<K, V>
where
    K: Eq + Hash,
{
    group: Arc<SingleFlight<K, V>>,
    key: K,
}

impl<K, V> Drop for InflightGuard<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.group.inflight.remove(&self.key);
    }
}

/// Handle on one shared call.
#[derive(Debug)]
pub struct Flight<V> {
    receiver: Slot<V>,
    leader: bool,
}

impl<V: Clone> Flight<V> {
    /// Whether this handle started the call.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Waits for the shared result. Returns `None` if the task died without
    /// producing one.
    pub async fn wait(mut self) -> Option<V> {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}
