//! Indexed set of acknowledgements the local node owes the peer (spec §4.2).
//!
//! At most one entry per exchange. A standalone-ack timer (200 ms) is
//! started on every `add`; when it fires the entry is not removed — it
//! lingers, flagged `standalone_ack_sent`, so a later outgoing message can
//! still piggyback it cheaply without a second standalone emission.
//!
//! Timer cancellation is generation-based rather than a hard task cancel:
//! each entry is stamped with a generation counter when installed, and the
//! timer callback only acts if the entry under the lock still carries the
//! generation it was spawned for. This is the primitive the spec calls out
//! in §9 as sufficient ("a cancel that returns 'already fired' is
//! permissible provided the fired callback itself revalidates entry
//! identity").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::exchange::ExchangeKey;

struct Entry {
    counter: u32,
    standalone_ack_sent: bool,
    generation: u64,
}

/// A snapshot of an ack-table entry, returned when `add` displaces one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEntry {
    pub counter: u32,
    pub standalone_ack_sent: bool,
}

pub struct AckTable {
    entries: Arc<Mutex<HashMap<ExchangeKey, Entry>>>,
    next_generation: AtomicU64,
    timeout: Duration,
}

impl AckTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            timeout,
        }
    }

    /// Records a new pending ack for `key`, owed for `counter`. If an entry
    /// already exists it is displaced: its timer is stopped, and if it had
    /// not yet fired (`standalone_ack_sent == false`) it is handed back to
    /// the caller, who MUST emit a standalone ack for it immediately. If it
    /// had already fired, it is silently dropped — the peer already has
    /// that ack.
    pub fn add<F>(&self, key: ExchangeKey, counter: u32, on_timeout: F) -> Option<AckEntry>
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let displaced = {
            let mut map = self.entries.lock().unwrap();
            let displaced = map.remove(&key).and_then(|old| {
                if old.standalone_ack_sent {
                    None
                } else {
                    Some(AckEntry {
                        counter: old.counter,
                        standalone_ack_sent: false,
                    })
                }
            });
            map.insert(
                key,
                Entry {
                    counter,
                    standalone_ack_sent: false,
                    generation,
                },
            );
            displaced
        };

        let entries = self.entries.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let fired = {
                let mut map = entries.lock().unwrap();
                match map.get_mut(&key) {
                    Some(entry) if entry.generation == generation => {
                        entry.standalone_ack_sent = true;
                        true
                    }
                    _ => false,
                }
            };
            if fired {
                on_timeout();
            }
        });

        displaced
    }

    /// An outgoing message piggybacked this ack: cancel the timer, remove
    /// the entry, return the acknowledged counter.
    pub fn mark_acked(&self, key: ExchangeKey) -> Option<u32> {
        self.entries.lock().unwrap().remove(&key).map(|e| e.counter)
    }

    /// A standalone ack was emitted synchronously (e.g. during close-flush).
    /// The entry lingers so a later message can still piggyback it.
    pub fn mark_standalone_ack_sent(&self, key: ExchangeKey) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&key) {
            entry.standalone_ack_sent = true;
            entry.generation = entry.generation.wrapping_add(1);
        }
    }

    /// Exchange teardown: cancel timer, drop entry.
    pub fn remove(&self, key: ExchangeKey) {
        self.entries.lock().unwrap().remove(&key);
    }

    pub fn has_pending_ack(&self, key: ExchangeKey) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&key)
            .is_some_and(|e| !e.standalone_ack_sent)
    }

    pub fn pending_counter(&self, key: ExchangeKey) -> Option<u32> {
        self.entries.lock().unwrap().get(&key).map(|e| e.counter)
    }

    /// Drains every entry, for manager shutdown. Stops all timers the soft
    /// way: bumping nothing is needed since the entries are gone, so any
    /// in-flight timer simply finds nothing under its key and no-ops.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Role;
    use std::sync::atomic::AtomicBool;

    fn key(id: u16) -> ExchangeKey {
        ExchangeKey {
            local_session_id: 1,
            exchange_id: id,
            role: Role::Responder,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn add_then_timeout_fires_once() {
        let table = AckTable::new(Duration::from_millis(200));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let displaced = table.add(key(1), 10, move || fired2.store(true, Ordering::SeqCst));
        assert!(displaced.is_none());
        assert!(table.has_pending_ack(key(1)));

        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        assert!(fired.load(Ordering::SeqCst));
        assert!(!table.has_pending_ack(key(1)));
        assert_eq!(table.pending_counter(key(1)), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn second_add_before_timeout_displaces_first() {
        let table = AckTable::new(Duration::from_millis(200));
        let _ = table.add(key(1), 10, || {});
        let displaced = table.add(key(1), 11, || {});
        assert_eq!(
            displaced,
            Some(AckEntry {
                counter: 10,
                standalone_ack_sent: false,
            })
        );
        assert_eq!(table.pending_counter(key(1)), Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn second_add_after_timeout_does_not_displace() {
        let table = AckTable::new(Duration::from_millis(200));
        let _ = table.add(key(1), 10, || {});
        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        let displaced = table.add(key(1), 11, || {});
        assert!(displaced.is_none(), "already-fired entry must not re-displace");
        assert_eq!(table.pending_counter(key(1)), Some(11));
    }

    #[tokio::test]
    async fn mark_acked_removes_entry_and_returns_counter() {
        let table = AckTable::new(Duration::from_secs(1));
        let _ = table.add(key(2), 42, || {});
        assert_eq!(table.mark_acked(key(2)), Some(42));
        assert_eq!(table.mark_acked(key(2)), None);
        assert!(!table.has_pending_ack(key(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_after_mark_acked_is_a_noop() {
        let table = AckTable::new(Duration::from_millis(200));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let _ = table.add(key(3), 1, move || fired2.store(true, Ordering::SeqCst));
        // piggybacked before the timer would have fired
        assert_eq!(table.mark_acked(key(3)), Some(1));

        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        assert!(!fired.load(Ordering::SeqCst), "removed entry must suppress the timer callback");
    }

    #[tokio::test]
    async fn mark_standalone_ack_sent_lingers_entry() {
        let table = AckTable::new(Duration::from_secs(1));
        let _ = table.add(key(4), 7, || {});
        table.mark_standalone_ack_sent(key(4));
        assert!(!table.has_pending_ack(key(4)));
        assert_eq!(table.pending_counter(key(4)), Some(7));
    }
}
