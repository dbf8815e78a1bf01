//! Broadcast hub: one producer, many subscribers
//!
//! Fans units from a capture worker's read loop out to every subscriber with
//! at-most-once delivery. Each subscriber owns a bounded queue; a full queue
//! drops the unit for that subscriber only, so a slow consumer can never
//! stall the read loop or its peers.
//!
//! # Prefill atomicity
//!
//! The GOP cache and the subscriber set live under one lock. `subscribe`
//! snapshots the cache, enqueues the snapshot into the fresh queue, and
//! registers the subscriber before releasing it, so no live unit can ever
//! jump ahead of the prefill. `publish` takes the same lock to update the
//! cache and fan out. Critical sections contain no await points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::media::{GopCache, H264Unit};

/// Identifier handed out per subscriber
pub type SubscriberId = u64;

/// A subscriber registered with the hub
struct Subscriber {
    tx: mpsc::Sender<H264Unit>,
    drop_count: Arc<AtomicU64>,
    joined_at: Instant,
}

/// Per-subscriber counters for metrics
#[derive(Debug, Clone)]
pub struct SubscriberStats {
    pub id: SubscriberId,
    pub drop_count: u64,
    pub joined_at: Instant,
}

/// Aggregate hub counters
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub units_published: u64,
    pub bytes_published: u64,
    pub subscriber_count: usize,
    pub dropped_units: u64,
}

struct HubState {
    cache: GopCache,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

/// Fan-out hub owned by a capture worker
pub struct BroadcastHub {
    state: Mutex<HubState>,
    queue_depth: usize,
    next_id: AtomicU64,
    units_published: AtomicU64,
    bytes_published: AtomicU64,
    dropped_units: AtomicU64,
}

/// Receiving side of one subscription
///
/// Dropping the subscription deregisters it from the hub.
pub struct StreamSubscription {
    pub id: SubscriberId,
    rx: mpsc::Receiver<H264Unit>,
    hub: Arc<BroadcastHub>,
}

impl StreamSubscription {
    /// Receive the next unit; `None` when the hub closed the queue
    pub async fn recv(&mut self) -> Option<H264Unit> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests
    pub fn try_recv(&mut self) -> Option<H264Unit> {
        self.rx.try_recv().ok()
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

impl BroadcastHub {
    pub fn new(gop_cap_bytes: usize, queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                cache: GopCache::with_cap(gop_cap_bytes),
                subscribers: HashMap::new(),
            }),
            queue_depth: queue_depth.max(1),
            next_id: AtomicU64::new(1),
            units_published: AtomicU64::new(0),
            bytes_published: AtomicU64::new(0),
            dropped_units: AtomicU64::new(0),
        })
    }

    /// Register a new subscriber, prefilled with the current GOP
    pub fn subscribe(self: &Arc<Self>) -> StreamSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().expect("hub lock poisoned");
        let prefill = state.cache.snapshot_prefill();

        // A fresh queue always has room for the whole snapshot: the GOP byte
        // cap bounds the snapshot, and capacity grows to fit it.
        let capacity = self.queue_depth.max(prefill.len() + self.queue_depth);
        let (tx, rx) = mpsc::channel(capacity);

        let prefill_len = prefill.len();
        for unit in prefill {
            // Infallible: the channel was sized above.
            let _ = tx.try_send(unit);
        }

        state.subscribers.insert(
            id,
            Subscriber {
                tx,
                drop_count: Arc::new(AtomicU64::new(0)),
                joined_at: Instant::now(),
            },
        );
        let total = state.subscribers.len();
        drop(state);

        tracing::info!(
            subscriber = id,
            prefill_units = prefill_len,
            subscribers = total,
            "Subscriber added"
        );

        StreamSubscription {
            id,
            rx,
            hub: Arc::clone(self),
        }
    }

    /// Remove a subscriber and close its queue; idempotent
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut state = self.state.lock().expect("hub lock poisoned");
        if state.subscribers.remove(&id).is_some() {
            let total = state.subscribers.len();
            drop(state);
            tracing::debug!(subscriber = id, subscribers = total, "Subscriber removed");
        }
    }

    /// Broadcast one unit to every subscriber
    ///
    /// Called from the read loop. Non-blocking: a full queue counts a drop
    /// for that subscriber; a closed queue deregisters it.
    pub fn publish(&self, unit: H264Unit) {
        let mut state = self.state.lock().expect("hub lock poisoned");
        state.cache.observe(&unit);

        self.units_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published
            .fetch_add(unit.len() as u64, Ordering::Relaxed);

        let mut dead: Vec<SubscriberId> = Vec::new();
        for (id, sub) in state.subscribers.iter() {
            match sub.tx.try_send(unit.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.drop_count.fetch_add(1, Ordering::Relaxed);
                    self.dropped_units.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            state.subscribers.remove(&id);
        }
    }

    /// Close every subscriber queue (worker stop)
    pub fn close_all(&self) {
        let mut state = self.state.lock().expect("hub lock poisoned");
        let n = state.subscribers.len();
        state.subscribers.clear();
        if n > 0 {
            tracing::debug!(closed = n, "Closed all subscriber queues");
        }
    }

    /// Forget cached parameter sets and GOP (worker restart)
    pub fn reset_cache(&self) {
        self.state.lock().expect("hub lock poisoned").cache.reset();
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().expect("hub lock poisoned").subscribers.len()
    }

    /// Whether a join prefix is currently available
    pub fn has_prefill(&self) -> bool {
        self.state.lock().expect("hub lock poisoned").cache.has_gop()
    }

    /// How long the cache has lacked a join prefix
    pub fn prefill_empty_for(&self) -> Option<std::time::Duration> {
        self.state.lock().expect("hub lock poisoned").cache.empty_for()
    }

    /// Stamp of the IDR heading the cached GOP
    pub fn last_idr_at(&self) -> Option<Instant> {
        self.state.lock().expect("hub lock poisoned").cache.last_idr_at()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            units_published: self.units_published.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            subscriber_count: self.subscriber_count(),
            dropped_units: self.dropped_units.load(Ordering::Relaxed),
        }
    }

    pub fn subscriber_stats(&self) -> Vec<SubscriberStats> {
        let state = self.state.lock().expect("hub lock poisoned");
        state
            .subscribers
            .iter()
            .map(|(id, sub)| SubscriberStats {
                id: *id,
                drop_count: sub.drop_count.load(Ordering::Relaxed),
                joined_at: sub.joined_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::media::NalUnitKind;

    fn unit(header: u8, payload: &[u8]) -> H264Unit {
        let mut v = vec![0x00, 0x00, 0x00, 0x01, header];
        v.extend_from_slice(payload);
        H264Unit::from_annexb(Bytes::from(v)).unwrap()
    }

    fn publish_gop(hub: &BroadcastHub, tag: u8) {
        hub.publish(unit(0x67, &[tag]));
        hub.publish(unit(0x68, &[tag]));
        hub.publish(unit(0x65, &[tag]));
    }

    fn drain(sub: &mut StreamSubscription) -> Vec<H264Unit> {
        let mut out = Vec::new();
        while let Some(u) = sub.try_recv() {
            out.push(u);
        }
        out
    }

    #[tokio::test]
    async fn test_subscriber_before_idr_gets_nothing() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 256);
        let mut sub = hub.subscribe();

        // No IDR yet: prefill is empty
        assert!(drain(&mut sub).is_empty());

        publish_gop(&hub, 1);
        let got = drain(&mut sub);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].kind, NalUnitKind::Sps);
        assert_eq!(got[1].kind, NalUnitKind::Pps);
        assert_eq!(got[2].kind, NalUnitKind::Idr);
    }

    #[tokio::test]
    async fn test_late_join_receives_cached_gop_then_live() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 256);

        publish_gop(&hub, 0);
        hub.publish(unit(0x41, &[1]));
        hub.publish(unit(0x41, &[2]));
        hub.publish(unit(0x41, &[3]));

        let mut sub = hub.subscribe();
        let prefill = drain(&mut sub);
        assert_eq!(prefill.len(), 6); // SPS PPS IDR P1 P2 P3
        assert_eq!(prefill[0].payload(), &[0x67, 0]);
        assert_eq!(prefill[2].kind, NalUnitKind::Idr);
        assert_eq!(prefill[5].payload(), &[0x41, 3]);

        // Live units follow, nothing out of order
        hub.publish(unit(0x41, &[4]));
        let live = drain(&mut sub);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].payload(), &[0x41, 4]);
    }

    #[tokio::test]
    async fn test_sps_change_resets_join_prefix() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 256);

        publish_gop(&hub, 0);
        hub.publish(unit(0x41, &[1]));
        // New parameter sets and a new GOP
        publish_gop(&hub, 1);
        hub.publish(unit(0x41, &[2]));

        let mut sub = hub.subscribe();
        let prefill = drain(&mut sub);
        assert_eq!(prefill.len(), 4);
        assert_eq!(prefill[0].payload(), &[0x67, 1]);
        assert_eq!(prefill[1].payload(), &[0x68, 1]);
        assert_eq!(prefill[2].payload(), &[0x65, 1]);
        assert_eq!(prefill[3].payload(), &[0x41, 2]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_counted() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 4);

        let mut slow = hub.subscribe();
        let mut healthy = hub.subscribe();

        for i in 0..100u8 {
            hub.publish(unit(0x41, &[i]));
            // The healthy subscriber keeps pace
            let _ = healthy.try_recv();
        }

        let stats = hub.subscriber_stats();
        let slow_stats = stats.iter().find(|s| s.id == slow.id).unwrap();
        assert_eq!(slow_stats.drop_count, 96);

        // The slow subscriber is still registered and holds its 4 units
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(drain(&mut slow).len(), 4);

        let healthy_stats = stats.iter().find(|s| s.id == healthy.id).unwrap();
        assert_eq!(healthy_stats.drop_count, 0);
    }

    #[tokio::test]
    async fn test_publish_never_blocks_on_full_queue() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 2);
        let _sub = hub.subscribe();

        // Publishing far beyond capacity must complete promptly
        let started = Instant::now();
        for i in 0..10_000u32 {
            hub.publish(unit(0x41, &[(i % 256) as u8]));
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_dropped_subscription_deregisters() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 256);
        {
            let _sub = hub.subscribe();
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_idempotent() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 256);
        let sub = hub.subscribe();
        let id = sub.id;
        hub.unsubscribe(id);
        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_wakes_receivers() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 256);
        let mut sub = hub.subscribe();

        let handle = tokio::spawn(async move { sub.recv().await });
        tokio::task::yield_now().await;
        hub.close_all();

        let received = handle.await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_prefill_larger_than_queue_depth_fits() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 4);

        hub.publish(unit(0x67, &[0]));
        hub.publish(unit(0x68, &[0]));
        hub.publish(unit(0x65, &[0]));
        for i in 0..20u8 {
            hub.publish(unit(0x41, &[i]));
        }

        // 23 cached units against a queue depth of 4: the fresh queue is
        // sized to hold the entire snapshot.
        let mut sub = hub.subscribe();
        assert_eq!(drain(&mut sub).len(), 23);
    }

    #[tokio::test]
    async fn test_hub_stats() {
        let hub = BroadcastHub::new(4 * 1024 * 1024, 256);
        publish_gop(&hub, 0);

        let stats = hub.stats();
        assert_eq!(stats.units_published, 3);
        assert!(stats.bytes_published > 0);
        assert!(hub.last_idr_at().is_some());
    }
}
