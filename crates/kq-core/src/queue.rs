//! The per-queue priority engine: a min-heap of visible messages, a lock
//! table for outstanding `PeekLock`s, and an optional dead-letter sibling.
//!
//! Every operation here is non-suspending; callers serialize access through
//! a single `tokio::sync::Mutex` per queue (see [`Queue`]) rather than a
//! dedicated writer task, since none of this work ever awaits.

use crate::error::{QueueError, QueueResult};
use crate::types::{LockId, LockedMessage, QueueConfig, QueueItem};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Entry in the visible-message heap. `Ord` is inverted so that
/// `BinaryHeap`, a max-heap by default, pops the smallest priority first,
/// breaking ties by earliest sequence number (FIFO).
#[derive(Debug, Clone, Eq, PartialEq)]
struct HeapEntry {
    priority: u32,
    seq: u64,
    message_id: Uuid,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    message_id: Uuid,
    priority: u32,
    seq: u64,
    expires_at: Instant,
}

/// One side of the engine: either the main queue or its DLQ sibling.
/// Both sides have identical heap/lock semantics.
#[derive(Default)]
struct Side {
    heap: BinaryHeap<HeapEntry>,
    locks: HashMap<LockId, LockEntry>,
    next_seq: u64,
}

impl Side {
    fn push(&mut self, message_id: Uuid, priority: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            priority,
            seq,
            message_id,
        });
    }

    /// Restore a message at its original priority/seq (used by Nack and
    /// lock expiry, which must not re-order the message to the tail).
    fn restore(&mut self, priority: u32, seq: u64, message_id: Uuid) {
        self.heap.push(HeapEntry {
            priority,
            seq,
            message_id,
        });
    }

    /// Removes every lock past its deadline and hands the entries back to
    /// the caller, which decides whether each one is redelivered or fails
    /// out to the DLQ, the same as an explicit `Nack` would.
    fn drain_expired(&mut self, now: Instant) -> Vec<LockEntry> {
        let expired: Vec<LockId> = self
            .locks
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|lock_id| self.locks.remove(&lock_id))
            .collect()
    }

    fn peek(&self) -> Option<QueueItem> {
        self.heap.peek().map(|e| QueueItem {
            message_id: e.message_id,
            priority: e.priority,
        })
    }

    fn dequeue(&mut self) -> Option<QueueItem> {
        self.heap.pop().map(|e| QueueItem {
            message_id: e.message_id,
            priority: e.priority,
        })
    }

    fn peek_lock(&mut self, now: Instant, ttl: Duration) -> Option<(QueueItem, LockId)> {
        let entry = self.heap.pop()?;
        let lock_id = LockId::new();
        self.locks.insert(
            lock_id,
            LockEntry {
                message_id: entry.message_id,
                priority: entry.priority,
                seq: entry.seq,
                expires_at: now + ttl,
            },
        );
        Some((
            QueueItem {
                message_id: entry.message_id,
                priority: entry.priority,
            },
            lock_id,
        ))
    }

    fn ack(&mut self, lock_id: LockId, now: Instant) -> QueueResult<Uuid> {
        match self.locks.get(&lock_id) {
            None => Err(QueueError::UnknownLock(lock_id.to_string())),
            Some(l) if l.expires_at <= now => {
                self.locks.remove(&lock_id);
                Err(QueueError::UnknownLock(lock_id.to_string()))
            }
            Some(_) => {
                let l = self.locks.remove(&lock_id).unwrap();
                Ok(l.message_id)
            }
        }
    }

    /// Takes a lock by id, failing with `UnknownLock` both when the id is
    /// absent and when it is present but already past its deadline (it is
    /// dropped from the table in that case too, mirroring `ack`).
    fn take_lock(&mut self, lock_id: LockId, now: Instant) -> QueueResult<LockEntry> {
        match self.locks.get(&lock_id) {
            None => Err(QueueError::UnknownLock(lock_id.to_string())),
            Some(l) if l.expires_at <= now => {
                self.locks.remove(&lock_id);
                Err(QueueError::UnknownLock(lock_id.to_string()))
            }
            Some(_) => Ok(self.locks.remove(&lock_id).unwrap()),
        }
    }

    fn extend(&mut self, lock_id: LockId, additional: Duration, now: Instant) -> QueueResult<()> {
        let l = self
            .locks
            .get_mut(&lock_id)
            .ok_or_else(|| QueueError::UnknownLock(lock_id.to_string()))?;
        if l.expires_at <= now {
            return Err(QueueError::Expired(lock_id.to_string()));
        }
        l.expires_at += additional;
        Ok(())
    }

    fn release(&mut self, lock_id: LockId, now: Instant) -> QueueResult<()> {
        let l = self.take_lock(lock_id, now)?;
        self.restore(l.priority, l.seq, l.message_id);
        Ok(())
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn locked_len(&self) -> usize {
        self.locks.len()
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.locks.clear();
    }
}

struct Inner {
    config: QueueConfig,
    visible: Side,
    dlq: Side,
    delivery_counts: HashMap<Uuid, u32>,
}

impl Inner {
    /// Reclaims every lock past its deadline through the exact same
    /// delivery-count/DLQ-threshold path as an explicit `Nack`, so a
    /// message whose lock keeps expiring still reaches the DLQ instead of
    /// being redelivered forever.
    fn reclaim_expired(&mut self, now: Instant) {
        for l in self.visible.drain_expired(now) {
            self.fail_delivery(l);
        }
    }

    /// Shared tail of `Nack` and lock-expiry reclaim: bump the delivery
    /// count, and either restore the message or, past the budget, move it
    /// to the DLQ (if enabled) or drop it.
    fn fail_delivery(&mut self, l: LockEntry) {
        let count = self.delivery_counts.entry(l.message_id).or_insert(0);
        *count += 1;

        if *count > self.config.max_delivery_count {
            self.delivery_counts.remove(&l.message_id);
            if self.config.enable_dlq {
                self.dlq.push(l.message_id, l.priority);
            }
            // DLQ disabled: the message is dropped, counted as a failed delivery.
        } else {
            self.visible.restore(l.priority, l.seq, l.message_id);
        }
    }
}

/// A single queue's priority engine, safe for concurrent RPC handlers: all
/// mutation goes through the one `tokio::sync::Mutex`, giving the
/// single-writer discipline the ordering guarantees in this system depend
/// on.
pub struct Queue {
    inner: Mutex<Inner>,
}

impl Queue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                visible: Side::default(),
                dlq: Side::default(),
                delivery_counts: HashMap::new(),
            }),
        }
    }

    pub async fn enqueue(&self, priority: u32) -> QueueResult<QueueItem> {
        let mut inner = self.inner.lock().await;
        let item = QueueItem::new(priority);
        inner.visible.push(item.message_id, priority);
        Ok(item)
    }

    pub async fn dequeue(&self) -> QueueResult<QueueItem> {
        let mut inner = self.inner.lock().await;
        inner.reclaim_expired(Instant::now());
        inner.visible.dequeue().ok_or(QueueError::Empty)
    }

    pub async fn peek(&self) -> QueueResult<QueueItem> {
        let mut inner = self.inner.lock().await;
        inner.reclaim_expired(Instant::now());
        inner.visible.peek().ok_or(QueueError::Empty)
    }

    pub async fn peek_lock(&self) -> QueueResult<LockedMessage> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.reclaim_expired(now);
        let ttl = inner.config.visibility_timeout;
        let (item, lock_id) = inner.visible.peek_lock(now, ttl).ok_or(QueueError::Empty)?;
        Ok(LockedMessage { item, lock_id })
    }

    pub async fn ack(&self, lock_id: LockId) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let message_id = inner.visible.ack(lock_id, Instant::now())?;
        inner.delivery_counts.remove(&message_id);
        Ok(())
    }

    /// Restores the message unless it has exceeded its delivery budget, in
    /// which case it is moved to the DLQ (if enabled) or dropped. A lock
    /// that has already expired (but not yet reclaimed) is treated the
    /// same as an unknown one, matching `Ack`.
    pub async fn nack(&self, lock_id: LockId) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let l = inner.visible.take_lock(lock_id, Instant::now())?;
        inner.fail_delivery(l);
        Ok(())
    }

    pub async fn extend(&self, lock_id: LockId, additional: Duration) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        inner.visible.extend(lock_id, additional, Instant::now())
    }

    pub async fn set_visibility_timeout(&self, timeout: Duration) {
        let mut inner = self.inner.lock().await;
        inner.config.visibility_timeout = timeout;
    }

    pub async fn refresh_visibility_timeout(&self, lock_id: LockId) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let ttl = inner.config.visibility_timeout;
        inner.visible.extend(lock_id, ttl, Instant::now())
    }

    pub async fn release_lock(&self, lock_id: LockId) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.visible.release(lock_id, now)
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.visible.clear();
        inner.delivery_counts.clear();
    }

    pub async fn peek_dlq(&self) -> QueueResult<QueueItem> {
        let inner = self.inner.lock().await;
        inner.dlq.peek().ok_or(QueueError::Empty)
    }

    pub async fn dequeue_dlq(&self) -> QueueResult<QueueItem> {
        let mut inner = self.inner.lock().await;
        inner.dlq.dequeue().ok_or(QueueError::Empty)
    }

    pub async fn clear_dlq(&self) {
        let mut inner = self.inner.lock().await;
        inner.dlq.clear();
    }

    /// `(visible_count, locked_count)`, used by tests asserting the
    /// conservation invariant in the testable-properties scenarios.
    pub async fn sizes(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.visible.len(), inner.visible.locked_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> QueueConfig {
        QueueConfig::default()
    }

    #[tokio::test]
    async fn priority_ordering_with_fifo_ties() {
        let q = Queue::new(cfg());
        let m1 = q.enqueue(10).await.unwrap();
        let m2 = q.enqueue(5).await.unwrap();
        let m3 = q.enqueue(5).await.unwrap();
        let m4 = q.enqueue(20).await.unwrap();

        assert_eq!(q.dequeue().await.unwrap().message_id, m2.message_id);
        assert_eq!(q.dequeue().await.unwrap().message_id, m3.message_id);
        assert_eq!(q.dequeue().await.unwrap().message_id, m1.message_id);
        assert_eq!(q.dequeue().await.unwrap().message_id, m4.message_id);
        assert_eq!(q.dequeue().await.unwrap_err(), QueueError::Empty);
    }

    #[tokio::test]
    async fn peek_lock_then_nack_restores_message() {
        let q = Queue::new(cfg());
        let m = q.enqueue(1).await.unwrap();
        let locked = q.peek_lock().await.unwrap();
        assert_eq!(locked.item.message_id, m.message_id);

        q.nack(locked.lock_id).await.unwrap();
        let peeked = q.peek().await.unwrap();
        assert_eq!(peeked.message_id, m.message_id);
    }

    #[tokio::test]
    async fn nack_after_lock_expiry_returns_unknown_lock() {
        let mut config = cfg();
        config.visibility_timeout = Duration::from_millis(20);
        let q = Queue::new(config);
        q.enqueue(1).await.unwrap();
        let locked = q.peek_lock().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            q.nack(locked.lock_id).await.unwrap_err(),
            QueueError::UnknownLock(locked.lock_id.to_string())
        );
    }

    #[tokio::test]
    async fn ack_is_not_idempotent_second_call_fails() {
        let q = Queue::new(cfg());
        q.enqueue(1).await.unwrap();
        let locked = q.peek_lock().await.unwrap();
        q.ack(locked.lock_id).await.unwrap();
        assert_eq!(
            q.ack(locked.lock_id).await.unwrap_err(),
            QueueError::UnknownLock(locked.lock_id.to_string())
        );
        assert_eq!(q.dequeue().await.unwrap_err(), QueueError::Empty);
    }

    #[tokio::test]
    async fn lock_expiry_returns_message_to_visible_heap() {
        let mut config = cfg();
        config.visibility_timeout = Duration::from_millis(50);
        let q = Queue::new(config);
        let m = q.enqueue(1).await.unwrap();
        let locked = q.peek_lock().await.unwrap();
        assert_eq!(locked.item.message_id, m.message_id);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let peeked = q.peek().await.unwrap();
        assert_eq!(peeked.message_id, m.message_id);
    }

    #[tokio::test]
    async fn nack_past_delivery_budget_moves_to_dlq() {
        let mut config = cfg();
        config.enable_dlq = true;
        config.max_delivery_count = 2;
        let q = Queue::new(config);
        let m = q.enqueue(1).await.unwrap();

        for _ in 0..2 {
            let locked = q.peek_lock().await.unwrap();
            q.nack(locked.lock_id).await.unwrap();
        }
        let locked = q.peek_lock().await.unwrap();
        q.nack(locked.lock_id).await.unwrap();

        assert_eq!(q.dequeue().await.unwrap_err(), QueueError::Empty);
        assert_eq!(q.dequeue_dlq().await.unwrap().message_id, m.message_id);
    }

    /// Repeated lock expiry must behave identically to repeated explicit
    /// `Nack`: the message still reaches the DLQ once its delivery budget
    /// is exhausted, rather than being redelivered forever.
    #[tokio::test]
    async fn repeated_lock_expiry_moves_to_dlq_like_nack() {
        let mut config = cfg();
        config.enable_dlq = true;
        config.max_delivery_count = 2;
        config.visibility_timeout = Duration::from_millis(20);
        let q = Queue::new(config);
        let m = q.enqueue(1).await.unwrap();

        for _ in 0..3 {
            q.peek_lock().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(q.dequeue().await.unwrap_err(), QueueError::Empty);
        assert_eq!(q.dequeue_dlq().await.unwrap().message_id, m.message_id);
    }

    #[tokio::test]
    async fn clear_drains_but_preserves_queue() {
        let q = Queue::new(cfg());
        q.enqueue(1).await.unwrap();
        q.enqueue(2).await.unwrap();
        q.clear().await;
        assert_eq!(q.dequeue().await.unwrap_err(), QueueError::Empty);
        // still usable afterwards
        q.enqueue(3).await.unwrap();
        assert!(q.dequeue().await.is_ok());
    }
}
