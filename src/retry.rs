// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Retry Counters
//!
//! Failed deliveries are counted per delivery tag. A tag is requeued while its counter is
//! below `MAX_REQUEUES` and rejected for good afterwards, which sends it down the queue's
//! dead-letter route. Counters live in process memory only and are dropped whenever the
//! channel that issued the tags goes away.

use std::{collections::HashMap, sync::Mutex};

/// Number of requeues granted to a delivery before it is dead-lettered.
pub const MAX_REQUEUES: u32 = 4;

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reject with requeue. `tries` counts failures so far, this one included.
    Requeue { tries: u32 },
    /// Reject without requeue. `tries` is the number of requeues already granted.
    DeadLetter { tries: u32 },
}

impl RetryDecision {
    pub fn requeue(&self) -> bool {
        matches!(self, RetryDecision::Requeue { .. })
    }
}

/// Retry counters keyed by delivery tag.
///
/// Each read-check-write runs under one lock, so concurrent failures of the same tag can
/// neither double count nor lose a dead-letter decision.
///
/// Entries are removed on ack, on the dead-letter decision and by [`RetryTracker::clear`].
/// RabbitMQ gives a requeued message a new tag, so against a real broker each requeue of
/// a message that keeps failing leaves its old tag behind. The map then grows with the
/// number of requeues until the channel closes and the owning subscription clears it.
#[derive(Debug)]
pub struct RetryTracker {
    max_requeues: u32,
    tries: Mutex<HashMap<u64, u32>>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        RetryTracker::new(MAX_REQUEUES)
    }
}

impl RetryTracker {
    pub fn new(max_requeues: u32) -> Self {
        RetryTracker {
            max_requeues,
            tries: Mutex::new(HashMap::new()),
        }
    }

    /// Records a handler failure for `delivery_tag` and decides its fate.
    pub fn record_failure(&self, delivery_tag: u64) -> RetryDecision {
        let mut tries = self.lock();

        match tries.get(&delivery_tag).copied() {
            Some(count) if count >= self.max_requeues => {
                tries.remove(&delivery_tag);
                RetryDecision::DeadLetter { tries: count }
            }
            Some(count) => {
                tries.insert(delivery_tag, count + 1);
                RetryDecision::Requeue { tries: count + 1 }
            }
            None if self.max_requeues == 0 => RetryDecision::DeadLetter { tries: 0 },
            None => {
                tries.insert(delivery_tag, 1);
                RetryDecision::Requeue { tries: 1 }
            }
        }
    }

    /// Drops the counter of an acknowledged delivery.
    pub fn forget(&self, delivery_tag: u64) {
        self.lock().remove(&delivery_tag);
    }

    /// Drops every counter. Tags are meaningless once their channel is gone.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn tries(&self, delivery_tag: u64) -> Option<u32> {
        self.lock().get(&delivery_tag).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, u32>> {
        // every mutation is a single insert or remove, a poisoned map is still consistent
        self.tries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
