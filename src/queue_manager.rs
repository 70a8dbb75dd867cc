use crate::models::{QueueEntry, Voice};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const PARALLEL_QUEUE_TTL_SECS: u64 = 120;
const SLOT_QUEUE_TTL_SECS: u64 = 60;

/// Two FIFOs that absorb bursts past the parallel-job cap and the avatar-slot
/// cap respectively. Entries older than their queue's TTL are discarded on the
/// next drain attempt rather than proactively, matching how the dispatch path
/// only ever looks at a queue when something upstream frees up.
pub struct QueueManager {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    parallel_queue: VecDeque<QueueEntry>,
    slot_queue: VecDeque<QueueEntry>,
}

pub struct QueueSnapshot {
    pub parallel_queue_len: usize,
    pub slot_queue_len: usize,
}

/// Result of a drain attempt: the next ready entry, if any, plus every entry
/// that was discarded as expired while looking for it.
pub struct DrainResult {
    pub ready: Option<QueueEntry>,
    pub expired: Vec<QueueEntry>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn push_parallel(&self, entry: QueueEntry) {
        self.inner.lock().unwrap().parallel_queue.push_back(entry);
    }

    pub fn push_slot(&self, entry: QueueEntry) {
        self.inner.lock().unwrap().slot_queue.push_back(entry);
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().unwrap();
        QueueSnapshot {
            parallel_queue_len: inner.parallel_queue.len(),
            slot_queue_len: inner.slot_queue.len(),
        }
    }

    /// Pops the oldest non-expired entry from the parallel queue, discarding any
    /// expired entries found ahead of it. `expired` carries every entry dropped
    /// along the way so the caller can reconcile any bookkeeping charged against
    /// them (parallel-queue entries carry none today, but the shape is shared
    /// with `pop_slot_ready`, which does).
    pub fn pop_parallel_ready(&self) -> DrainResult {
        let mut inner = self.inner.lock().unwrap();
        Self::pop_ready_locked(&mut inner.parallel_queue, PARALLEL_QUEUE_TTL_SECS)
    }

    /// Pops the oldest non-expired entry from the slot queue that already carries
    /// a chosen voice (slot-queue entries are always voice-bound by the time they
    /// are enqueued here). `expired` entries here were already charged against
    /// `activeJobCount` at admission time, so the caller must release that charge
    /// for each one returned.
    pub fn pop_slot_ready(&self) -> DrainResult {
        let mut inner = self.inner.lock().unwrap();
        Self::pop_ready_locked(&mut inner.slot_queue, SLOT_QUEUE_TTL_SECS)
    }

    fn pop_ready_locked(queue: &mut VecDeque<QueueEntry>, ttl_secs: u64) -> DrainResult {
        let ttl = Duration::from_secs(ttl_secs);
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(front) = queue.pop_front() {
            if now.duration_since(front.enqueue_wall_time) <= ttl {
                return DrainResult { ready: Some(front), expired };
            }
            log::info!("discarding expired queue entry for user {}", front.user);
            expired.push(front);
        }
        DrainResult { ready: None, expired }
    }

    /// Drops a chat event's pending entries from both queues without touching
    /// the rest of the queue, preserving relative order among survivors. Used on
    /// a moderation cancel. `user` is matched case-insensitively since queue
    /// entries retain their original casing while moderation targets arrive
    /// pre-lowercased.
    pub fn scrub_user(&self, user: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.parallel_queue.len() + inner.slot_queue.len();
        inner.parallel_queue.retain(|e| !e.user.eq_ignore_ascii_case(user));
        inner.slot_queue.retain(|e| !e.user.eq_ignore_ascii_case(user));
        before - (inner.parallel_queue.len() + inner.slot_queue.len())
    }

    pub fn parallel_queue_len(&self) -> usize {
        self.inner.lock().unwrap().parallel_queue.len()
    }

    pub fn slot_queue_len(&self) -> usize {
        self.inner.lock().unwrap().slot_queue.len()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn queue_entry(user: &str, text: &str, event_type: &str, chosen_voice: Option<Voice>) -> QueueEntry {
    QueueEntry {
        user: user.to_string(),
        text: text.to_string(),
        event_type: event_type.to_string(),
        chosen_voice,
        enqueue_wall_time: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let mgr = QueueManager::new();
        mgr.push_parallel(queue_entry("alice", "hi", "chat", None));
        mgr.push_parallel(queue_entry("bob", "yo", "chat", None));
        assert_eq!(mgr.pop_parallel_ready().ready.unwrap().user, "alice");
        assert_eq!(mgr.pop_parallel_ready().ready.unwrap().user, "bob");
    }

    #[test]
    fn empty_queue_returns_none() {
        let mgr = QueueManager::new();
        let result = mgr.pop_parallel_ready();
        assert!(result.ready.is_none());
        assert!(result.expired.is_empty());
    }

    #[test]
    fn expired_entries_are_reported_not_just_dropped() {
        let mgr = QueueManager::new();
        mgr.push_slot(queue_entry("alice", "hi", "chat", None));
        {
            let mut inner = mgr.inner.lock().unwrap();
            inner.slot_queue[0].enqueue_wall_time =
                Instant::now() - Duration::from_secs(SLOT_QUEUE_TTL_SECS + 1);
        }
        mgr.push_slot(queue_entry("bob", "yo", "chat", None));
        let result = mgr.pop_slot_ready();
        assert_eq!(result.ready.unwrap().user, "bob");
        assert_eq!(result.expired.len(), 1);
        assert_eq!(result.expired[0].user, "alice");
    }

    #[test]
    fn scrub_removes_only_matching_user_from_both_queues() {
        let mgr = QueueManager::new();
        mgr.push_parallel(queue_entry("alice", "hi", "chat", None));
        mgr.push_slot(queue_entry("alice", "hi2", "chat", None));
        mgr.push_parallel(queue_entry("bob", "yo", "chat", None));

        let removed = mgr.scrub_user("alice");
        assert_eq!(removed, 2);
        assert_eq!(mgr.parallel_queue_len(), 1);
        assert_eq!(mgr.slot_queue_len(), 0);
    }

    #[test]
    fn scrub_matches_regardless_of_case() {
        let mgr = QueueManager::new();
        mgr.push_parallel(queue_entry("Mallory", "hi", "chat", None));
        let removed = mgr.scrub_user("mallory");
        assert_eq!(removed, 1);
        assert_eq!(mgr.parallel_queue_len(), 0);
    }

    #[test]
    fn snapshot_reports_both_lengths() {
        let mgr = QueueManager::new();
        mgr.push_parallel(queue_entry("alice", "hi", "chat", None));
        mgr.push_slot(queue_entry("bob", "yo", "chat", None));
        let snap = mgr.snapshot();
        assert_eq!(snap.parallel_queue_len, 1);
        assert_eq!(snap.slot_queue_len, 1);
    }
}
