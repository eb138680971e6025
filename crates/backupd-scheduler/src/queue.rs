use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{CancellationScope, InvocationDescriptor};

/// Heap entry. Ordered by `invoke_at`, then insertion order.
#[derive(Debug)]
struct Queued {
    seq: u64,
    invocation: InvocationDescriptor,
}

impl Queued {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.invocation.invoke_at, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// The heap entry currently standing for one `(profile, invoke_at)` pair.
#[derive(Debug)]
struct PendingSlot {
    seq: u64,
    scope: CancellationScope,
}

/// Time-ordered, deduplicating queue of invocations.
///
/// Scheduling a `(profile, invoke_at)` pair that is already pending is a
/// no-op, with one exception: if the pending entry's scope has been revoked
/// and the new invocation's scope is live, the new one replaces it. A
/// reloaded profile therefore keeps the occurrence its old generation had
/// already queued, and at most one deliverable entry exists per pair.
///
/// Single-consumer: the worker schedules and drains from one task. Wrap it in
/// a lock if more than one task needs it.
#[derive(Debug, Default)]
pub struct InvocationScheduler {
    queue: BinaryHeap<Reverse<Queued>>,
    /// profile id → invoke_at → the entry that will be delivered for that pair.
    index: HashMap<String, HashMap<DateTime<Utc>, PendingSlot>>,
    next_seq: u64,
}

impl InvocationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `invocation` unless its `(profile_id, invoke_at)` pair is already
    /// pending. Returns whether it was enqueued.
    ///
    /// A pending pair whose scope has been revoked is superseded by a live
    /// invocation for the same pair; the revoked entry is then discarded when
    /// it comes up.
    pub fn schedule(&mut self, invocation: InvocationDescriptor) -> bool {
        let bucket = self.index.entry(invocation.profile_id.clone()).or_default();
        if let Some(slot) = bucket.get(&invocation.invoke_at) {
            if !slot.scope.is_revoked() || invocation.is_cancelled() {
                return false;
            }
            debug!(
                profile_id = %invocation.profile_id,
                invoke_at = %invocation.invoke_at,
                "superseding revoked pending invocation"
            );
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        bucket.insert(
            invocation.invoke_at,
            PendingSlot {
                seq,
                scope: invocation.scope.clone(),
            },
        );
        self.queue.push(Reverse(Queued { seq, invocation }));
        true
    }

    /// Remove and return every invocation due at or before `now`, in ascending
    /// `invoke_at` order. Revoked invocations are dropped silently.
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<InvocationDescriptor> {
        let mut due = Vec::new();
        while self
            .queue
            .peek()
            .is_some_and(|Reverse(head)| head.invocation.invoke_at <= now)
        {
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            if !self.release(&entry) {
                continue;
            }
            if entry.invocation.is_cancelled() {
                debug!(
                    profile_id = %entry.invocation.profile_id,
                    invoke_at = %entry.invocation.invoke_at,
                    "dropping revoked invocation"
                );
                continue;
            }
            due.push(entry.invocation);
        }
        due
    }

    /// Number of pending `(profile, invoke_at)` pairs.
    pub fn len(&self) -> usize {
        self.index.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Earliest `invoke_at` still in the queue, revoked entries included.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue
            .peek()
            .map(|Reverse(head)| head.invocation.invoke_at)
    }

    /// Erase `entry`'s pair from the index if `entry` is the one standing for
    /// it. Returns false for superseded entries, which leave the index alone.
    fn release(&mut self, entry: &Queued) -> bool {
        let profile_id = &entry.invocation.profile_id;
        let Some(bucket) = self.index.get_mut(profile_id) else {
            return false;
        };
        match bucket.get(&entry.invocation.invoke_at) {
            Some(slot) if slot.seq == entry.seq => {
                bucket.remove(&entry.invocation.invoke_at);
                if bucket.is_empty() {
                    self.index.remove(profile_id);
                }
                true
            }
            _ => false,
        }
    }
}
