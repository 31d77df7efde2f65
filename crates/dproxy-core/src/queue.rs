//! Bounded hand-off between request handlers and the persistence writer.
//! Producers never block: at capacity the oldest record is dropped and
//! counted, which keeps a stalled writer from ever stalling the data plane.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::record::InteractionRecord;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct RecordQueue {
    inner: Mutex<VecDeque<InteractionRecord>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl RecordQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, record: InteractionRecord) {
        {
            let mut queue = self.inner.lock().expect("record queue poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
        }
        self.notify.notify_one();
    }

    /// Wait until at least one push has happened since the last wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn drain(&self, max: usize) -> Vec<InteractionRecord> {
        let mut queue = self.inner.lock().expect("record queue poisoned");
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("record queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_record;

    #[test]
    fn drains_in_fifo_order() {
        let queue = RecordQueue::new(8);
        queue.push(test_record("m-1"));
        queue.push(test_record("m-2"));
        let drained = queue.drain(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].model, "m-1");
        assert_eq!(drained[1].model, "m-2");
        assert!(queue.is_empty());
    }

    #[test]
    fn saturation_drops_oldest_without_blocking() {
        let queue = RecordQueue::new(3);
        for i in 0..5 {
            queue.push(test_record(&format!("m-{i}")));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        let drained = queue.drain(10);
        assert_eq!(drained[0].model, "m-2");
        assert_eq!(drained[2].model, "m-4");
    }

    #[tokio::test]
    async fn push_wakes_waiter() {
        use std::sync::Arc;
        let queue = Arc::new(RecordQueue::new(8));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.notified().await;
                queue.drain(10).len()
            })
        };
        tokio::task::yield_now().await;
        queue.push(test_record("m"));
        let drained = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert_eq!(drained, 1);
    }
}
