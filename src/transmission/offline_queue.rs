//! Capacity-bounded, two-tier queue of undelivered batches.
//!
//! Critical batches live in their own tier and always drain first; both
//! tiers are FIFO. When full, the oldest non-critical batch is evicted.

use super::batch::DataPackage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the returned batch to stay within capacity
    Evicted(DataPackage),
    /// Queue is full of critical batches; the non-critical newcomer is refused
    Rejected(DataPackage),
}

/// Persisted form of the queue
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub critical: Vec<DataPackage>,
    pub normal: Vec<DataPackage>,
}

#[derive(Debug)]
pub struct OfflineQueue {
    critical: VecDeque<DataPackage>,
    normal: VecDeque<DataPackage>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        OfflineQueue {
            critical: VecDeque::new(),
            normal: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild from a snapshot, re-applying the capacity rule in case the
    /// configured capacity shrank since it was written
    pub fn restore(capacity: usize, snapshot: QueueSnapshot) -> Self {
        let mut queue = OfflineQueue::new(capacity);
        for batch in snapshot.critical.into_iter().chain(snapshot.normal) {
            if let PushOutcome::Evicted(dropped) | PushOutcome::Rejected(dropped) = queue.push(batch) {
                log::warn!("Dropped persisted batch {} over capacity", dropped.id);
            }
        }
        queue
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            critical: self.critical.iter().cloned().collect(),
            normal: self.normal.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.critical.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn critical_len(&self) -> usize {
        self.critical.len()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn push(&mut self, batch: DataPackage) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;
        if self.len() >= self.capacity {
            if let Some(oldest) = self.normal.pop_front() {
                outcome = PushOutcome::Evicted(oldest);
            } else if batch.is_critical() {
                match self.critical.pop_front() {
                    Some(oldest) => outcome = PushOutcome::Evicted(oldest),
                    None => return PushOutcome::Rejected(batch),
                }
            } else {
                return PushOutcome::Rejected(batch);
            }
        }

        if batch.is_critical() {
            self.critical.push_back(batch);
        } else {
            self.normal.push_back(batch);
        }
        outcome
    }

    /// Batch ids in drain order: critical tier first, FIFO within each tier
    pub fn drain_order(&self) -> Vec<String> {
        self.critical
            .iter()
            .chain(self.normal.iter())
            .map(|b| b.id.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&DataPackage> {
        self.critical
            .iter()
            .chain(self.normal.iter())
            .find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DataPackage> {
        self.critical
            .iter_mut()
            .chain(self.normal.iter_mut())
            .find(|b| b.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<DataPackage> {
        if let Some(pos) = self.critical.iter().position(|b| b.id == id) {
            return self.critical.remove(pos);
        }
        if let Some(pos) = self.normal.iter().position(|b| b.id == id) {
            return self.normal.remove(pos);
        }
        None
    }

    pub fn clear(&mut self) {
        self.critical.clear();
        self.normal.clear();
    }
}
