//! Pending queues between the producers and the pipeline stages
//!
//! Plain FIFOs guarded by the caller's lock. Capacity handling follows the
//! configured [`QueuePolicy`]; by default queues grow without bound.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What to do when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new entry
    Reject,
    /// Discard the oldest pending entry
    DropOldest,
}

/// Capacity policy for every pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePolicy {
    #[default]
    Unbounded,
    Bounded {
        capacity: usize,
        overflow: OverflowPolicy,
    },
}

impl QueuePolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            QueuePolicy::Bounded { capacity: 0, .. } => Err(ConfigError::InvalidQueuePolicy(
                "bounded capacity must be non-zero".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Result of pushing into a queue
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Push<T> {
    Queued,
    /// Queued after discarding this older entry
    Displaced(T),
    /// Queue full, entry handed back
    Rejected(T),
}

pub(crate) struct PendingQueue<T> {
    items: VecDeque<T>,
    policy: QueuePolicy,
    overflow_count: usize,
}

impl<T> PendingQueue<T> {
    pub(crate) fn new(policy: QueuePolicy) -> Self {
        Self {
            items: VecDeque::new(),
            policy,
            overflow_count: 0,
        }
    }

    pub(crate) fn push(&mut self, item: T) -> Push<T> {
        let QueuePolicy::Bounded { capacity, overflow } = self.policy else {
            self.items.push_back(item);
            return Push::Queued;
        };
        if self.items.len() < capacity {
            self.items.push_back(item);
            return Push::Queued;
        }

        self.overflow_count += 1;
        match overflow {
            OverflowPolicy::Reject => Push::Rejected(item),
            OverflowPolicy::DropOldest => {
                let oldest = self.items.pop_front();
                self.items.push_back(item);
                match oldest {
                    Some(oldest) => Push::Displaced(oldest),
                    None => Push::Queued,
                }
            }
        }
    }

    /// Return an entry to the head, bypassing the capacity check
    pub(crate) fn push_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn capacity(&self) -> Option<usize> {
        match self.policy {
            QueuePolicy::Unbounded => None,
            QueuePolicy::Bounded { capacity, .. } => Some(capacity),
        }
    }

    pub(crate) fn overflow_count(&self) -> usize {
        self.overflow_count
    }
}
