use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::types::ShareRecord;
use crate::metrics::SHARE_QUEUE_DEPTH;

/// FIFO buffer between share producers and the batch importer.
///
/// All methods take `&self`; producers and the flush cycle may run on
/// different threads. The critical sections never await or call out.
#[derive(Debug, Default)]
pub struct ShareQueue {
    inner: Mutex<VecDeque<ShareRecord>>,
}

impl ShareQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ShareRecord>> {
        // A panicking holder cannot leave the deque half-modified.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, share: ShareRecord) {
        let mut queue = self.lock();
        queue.push_back(share);
        SHARE_QUEUE_DEPTH.set(queue.len() as i64);
    }

    /// Remove at most `max` records from the head, in enqueue order.
    pub fn drain_up_to(&self, max: usize) -> Vec<ShareRecord> {
        let mut queue = self.lock();
        let take = max.min(queue.len());
        let batch: Vec<ShareRecord> = queue.drain(..take).collect();
        SHARE_QUEUE_DEPTH.set(queue.len() as i64);
        batch
    }

    /// Put a drained batch back at the tail.
    ///
    /// The batch keeps its internal order but lands behind anything enqueued
    /// while it was out. Consumers of share order must tolerate this.
    pub fn requeue(&self, batch: Vec<ShareRecord>) {
        let mut queue = self.lock();
        queue.extend(batch);
        SHARE_QUEUE_DEPTH.set(queue.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn share(worker: &str, ts: i64) -> ShareRecord {
        ShareRecord::valid(worker, ts, 1.0)
    }

    #[test]
    fn drain_preserves_order_and_caps() {
        let queue = ShareQueue::new();
        for ts in 0..5 {
            queue.enqueue(share("w1", ts));
        }

        let batch = queue.drain_up_to(3);
        assert_eq!(
            batch.iter().map(|s| s.timestamp).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(queue.len(), 2);

        let rest = queue.drain_up_to(10);
        assert_eq!(rest.len(), 2);
        assert!(queue.drain_up_to(10).is_empty());
    }

    #[test]
    fn requeue_goes_behind_new_arrivals() {
        let queue = ShareQueue::new();
        queue.enqueue(share("w1", 1));
        queue.enqueue(share("w1", 2));
        let batch = queue.drain_up_to(2);

        queue.enqueue(share("w2", 3));
        queue.requeue(batch);

        let order: Vec<i64> = queue.drain_up_to(10).iter().map(|s| s.timestamp).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(ShareQueue::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        queue.enqueue(share(&format!("w{}", t), i));
                    }
                })
            })
            .collect();

        let mut drained = 0;
        while drained < 4000 {
            drained += queue.drain_up_to(64).len();
            if handles.iter().all(|h| h.is_finished()) && queue.is_empty() {
                break;
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        drained += queue.drain_up_to(usize::MAX).len();
        assert_eq!(drained, 4000);
    }
}
