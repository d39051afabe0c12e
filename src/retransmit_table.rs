//! Indexed set of reliable messages awaiting acknowledgement (spec §4.3).
//!
//! Two indices over one entry set: by `counter` (incoming-ack lookup) and by
//! `ExchangeKey` (flow control, teardown). The retransmit timer is owned by
//! the table the same way `AckTable`'s is: a firing timer revalidates the
//! entry's generation under the lock before doing anything, so a firing that
//! races an `ack()` is a guaranteed no-op rather than a spurious resend.
//!
//! Unlike the ack timer, a retransmit timer keeps firing across attempts
//! until the message is acked or `MAX_TRANSMISSIONS` is reached. Each firing
//! re-invokes the same stored callback and, if the attempt budget isn't
//! exhausted, the table schedules the next firing itself from inside
//! `schedule_retransmit` — callers never re-arm a timer by hand.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backoff::{self, RandomSource};
use crate::error::{ExchangeError, Result};
use crate::exchange::ExchangeKey;
use crate::transport::PeerAddress;

type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TimerCallback = Arc<dyn Fn() -> TimerFuture + Send + Sync>;

struct Entry {
    counter: u32,
    encoded: Vec<u8>,
    peer_address: PeerAddress,
    send_count: u8,
    generation: u64,
    on_timeout: TimerCallback,
}

struct Inner {
    by_key: HashMap<ExchangeKey, Entry>,
    by_counter: HashMap<u32, ExchangeKey>,
}

/// A snapshot handed back by `ack`/`remove`: everything the caller needs to
/// know a send has concluded.
pub struct RetransmitEntry {
    pub key: ExchangeKey,
    pub counter: u32,
    pub encoded: Vec<u8>,
    pub peer_address: PeerAddress,
    pub send_count: u8,
}

/// What a firing/forced check of the retransmit timer resolves to.
pub enum RetransmitOutcome {
    /// Attempt budget remains; re-emit `encoded` to `peer_address` verbatim.
    Retransmit { encoded: Vec<u8>, peer_address: PeerAddress },
    /// `MAX_TRANSMISSIONS` reached; the entry has been removed.
    Exhausted,
}

pub struct RetransmitTable {
    inner: Arc<Mutex<Inner>>,
    next_generation: AtomicU64,
    random: Arc<dyn RandomSource>,
    /// Attempt budget per entry, including the initial send. Threaded in
    /// from `ExchangeManagerConfig::max_transmissions` rather than read
    /// from the `backoff::MAX_TRANSMISSIONS` constant directly, so a
    /// configured override actually takes effect.
    max_transmissions: u8,
}

impl RetransmitTable {
    pub fn new(random: Arc<dyn RandomSource>, max_transmissions: u8) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                by_key: HashMap::new(),
                by_counter: HashMap::new(),
            })),
            next_generation: AtomicU64::new(1),
            random,
            max_transmissions,
        }
    }

    /// Installs a new retransmit entry for `key`/`counter`. Refuses if one
    /// already exists for `key` — at most one reliable send may be
    /// outstanding per exchange.
    pub fn add<F, Fut>(
        &self,
        key: ExchangeKey,
        counter: u32,
        encoded: Vec<u8>,
        peer_address: PeerAddress,
        base_interval: Duration,
        on_timeout: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: TimerCallback = Arc::new(move || Box::pin(on_timeout()));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.by_key.contains_key(&key) {
                return Err(ExchangeError::PendingRetransmit);
            }
            inner.by_key.insert(
                key,
                Entry {
                    counter,
                    encoded,
                    peer_address,
                    send_count: 1,
                    generation,
                    on_timeout: callback.clone(),
                },
            );
            inner.by_counter.insert(counter, key);
        }

        self.spawn_timer(key, generation, backoff::calculate(base_interval, 0, self.random.as_ref()), callback);
        Ok(())
    }

    /// Incoming ack for `counter`: stop the timer, remove from both indices,
    /// return the entry. `None` if absent (stray ack — caller ignores it).
    pub fn ack(&self, counter: u32) -> Option<RetransmitEntry> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.by_counter.remove(&counter)?;
        let entry = inner.by_key.remove(&key)?;
        Some(RetransmitEntry {
            key,
            counter: entry.counter,
            encoded: entry.encoded,
            peer_address: entry.peer_address,
            send_count: entry.send_count,
        })
    }

    /// Called when a retransmit timer firing survives revalidation.
    /// Increments `send_count`; at `MAX_TRANSMISSIONS` the entry is removed
    /// and `Exhausted` is returned. Otherwise the next timer is scheduled
    /// (using `base_interval`, which may differ from the interval used for
    /// prior attempts) and `Retransmit` is returned with the bytes to
    /// re-send verbatim.
    pub fn schedule_retransmit(&self, counter: u32, base_interval: Duration) -> Option<RetransmitOutcome> {
        let (key, generation, callback, outcome) = {
            let mut inner = self.inner.lock().unwrap();
            let key = *inner.by_counter.get(&counter)?;
            let entry = inner.by_key.get_mut(&key)?;
            entry.send_count += 1;

            if entry.send_count >= self.max_transmissions {
                let encoded_unused = std::mem::take(&mut entry.encoded);
                drop(encoded_unused);
                inner.by_key.remove(&key);
                inner.by_counter.remove(&counter);
                (key, 0, None, RetransmitOutcome::Exhausted)
            } else {
                entry.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let generation = entry.generation;
                let callback = entry.on_timeout.clone();
                let outcome = RetransmitOutcome::Retransmit {
                    encoded: entry.encoded.clone(),
                    peer_address: entry.peer_address.clone(),
                };
                let attempt_index = entry.send_count - 1;
                (key, generation, Some((callback, attempt_index)), outcome)
            }
        };

        if let Some((callback, attempt_index)) = callback {
            let delay = backoff::calculate(base_interval, attempt_index as u32, self.random.as_ref());
            self.spawn_timer(key, generation, delay, callback);
        }

        Some(outcome)
    }

    /// Teardown by exchange key.
    pub fn remove(&self, key: ExchangeKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.by_key.remove(&key) {
            inner.by_counter.remove(&entry.counter);
        }
    }

    /// Teardown by counter (stray entries from a closed exchange).
    pub fn remove_by_counter(&self, counter: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.by_counter.remove(&counter) {
            inner.by_key.remove(&key);
        }
    }

    pub fn has_pending(&self, key: ExchangeKey) -> bool {
        self.inner.lock().unwrap().by_key.contains_key(&key)
    }

    /// Drains every entry, for manager shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_key.clear();
        inner.by_counter.clear();
    }

    fn spawn_timer(&self, key: ExchangeKey, generation: u64, delay: Duration, callback: TimerCallback) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = {
                let guard = inner.lock().unwrap();
                matches!(guard.by_key.get(&key), Some(e) if e.generation == generation)
            };
            if still_current {
                callback().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::FixedRandom;
    use crate::exchange::Role;
    use std::sync::atomic::AtomicUsize;

    fn key(id: u16) -> ExchangeKey {
        ExchangeKey {
            local_session_id: 1,
            exchange_id: id,
            role: Role::Initiator,
        }
    }

    fn addr() -> PeerAddress {
        PeerAddress::datagram("127.0.0.1:1234")
    }

    #[tokio::test]
    async fn add_refuses_second_entry_for_same_key() {
        let table = RetransmitTable::new(Arc::new(FixedRandom(0.0)), backoff::MAX_TRANSMISSIONS);
        table
            .add(key(1), 100, vec![1], addr(), Duration::from_millis(300), || async {})
            .unwrap();
        let err = table.add(key(1), 101, vec![2], addr(), Duration::from_millis(300), || async {});
        assert!(matches!(err, Err(ExchangeError::PendingRetransmit)));
    }

    #[tokio::test]
    async fn ack_removes_from_both_indices() {
        let table = RetransmitTable::new(Arc::new(FixedRandom(0.0)), backoff::MAX_TRANSMISSIONS);
        table
            .add(key(2), 200, vec![9, 9], addr(), Duration::from_millis(300), || async {})
            .unwrap();
        let entry = table.ack(200).unwrap();
        assert_eq!(entry.counter, 200);
        assert_eq!(entry.encoded, vec![9, 9]);
        assert!(!table.has_pending(key(2)));
        assert!(table.ack(200).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn five_attempts_then_exhausted() {
        let table = Arc::new(RetransmitTable::new(Arc::new(FixedRandom(0.0)), backoff::MAX_TRANSMISSIONS));
        let fire_count = Arc::new(AtomicUsize::new(0));

        let t2 = table.clone();
        let fc = fire_count.clone();
        table
            .add(key(3), 300, vec![1, 2, 3], addr(), Duration::from_millis(300), move || {
                let t2 = t2.clone();
                let fc = fc.clone();
                async move {
                    fc.fetch_add(1, Ordering::SeqCst);
                    t2.schedule_retransmit(300, Duration::from_millis(300));
                }
            })
            .unwrap();

        // Drive enough wall-clock for all 4 remaining attempts (5 total
        // including the initial send) to fire and reschedule.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(fire_count.load(Ordering::SeqCst), 4);
        assert!(!table.has_pending(key(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_race_suppresses_pending_timer() {
        let table = Arc::new(RetransmitTable::new(Arc::new(FixedRandom(0.0)), backoff::MAX_TRANSMISSIONS));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        table
            .add(key(4), 400, vec![0], addr(), Duration::from_millis(300), move || {
                let fired2 = fired2.clone();
                async move {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        assert!(table.ack(400).is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0, "ack must suppress the in-flight timer");
    }
}
