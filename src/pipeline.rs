use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSendError {
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRecvError {
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Completions sent but not yet received.
    pub depth: usize,
    pub peak_depth: usize,
    /// Completions received while waiting for a different key.
    pub parked: usize,
}

#[derive(Debug, Default)]
struct DepthGauge {
    depth: AtomicUsize,
    peak: AtomicUsize,
}

impl DepthGauge {
    fn raise(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(depth, Ordering::Relaxed);
    }

    fn lower(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    }
}

/// Worker side of a completion queue.
#[derive(Debug)]
pub struct CompletionTx<K, T> {
    inner: SyncSender<(K, T)>,
    gauge: Arc<DepthGauge>,
}

impl<K, T> Clone for CompletionTx<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gauge: Arc::clone(&self.gauge),
        }
    }
}

impl<K, T> CompletionTx<K, T> {
    /// Blocks while the queue is full.
    pub fn complete(&self, key: K, value: T) -> Result<(), QueueSendError> {
        self.gauge.raise();
        self.inner.send((key, value)).map_err(|_| {
            self.gauge.lower();
            QueueSendError::Disconnected
        })
    }
}

/// Session side; hands out completions by key, whatever order they arrive in.
#[derive(Debug)]
pub struct CompletionRx<K, T> {
    inner: Receiver<(K, T)>,
    gauge: Arc<DepthGauge>,
    parked: HashMap<K, T>,
}

impl<K: Eq + Hash, T> CompletionRx<K, T> {
    /// Waits up to `timeout` for the completion of `key`.
    ///
    /// `Ok(None)` means it did not arrive in time. Completions for other keys
    /// received meanwhile are kept for later calls.
    pub fn wait_for(&mut self, key: &K, timeout: Duration) -> Result<Option<T>, QueueRecvError> {
        if let Some(value) = self.parked.remove(key) {
            return Ok(Some(value));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inner.recv_timeout(remaining) {
                Ok((received, value)) => {
                    self.gauge.lower();
                    if received == *key {
                        return Ok(Some(value));
                    }
                    self.parked.insert(received, value);
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(QueueRecvError::Disconnected),
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.gauge.depth.load(Ordering::Relaxed),
            peak_depth: self.gauge.peak.load(Ordering::Relaxed),
            parked: self.parked.len(),
        }
    }
}

pub fn completion_queue<K, T>(capacity: usize) -> (CompletionTx<K, T>, CompletionRx<K, T>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let gauge = Arc::new(DepthGauge::default());
    (
        CompletionTx {
            inner: tx,
            gauge: Arc::clone(&gauge),
        },
        CompletionRx {
            inner: rx,
            gauge,
            parked: HashMap::new(),
        },
    )
}

/// Counts submissions that have not been synchronized yet.
#[derive(Debug)]
pub struct InFlightCredits {
    capacity: usize,
    used: AtomicUsize,
}

impl InFlightCredits {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            used: AtomicUsize::new(0),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                (used < self.capacity).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| used.checked_sub(1));
    }

    /// `(used, capacity)`
    pub fn snapshot(&self) -> (usize, usize) {
        (self.used.load(Ordering::Relaxed), self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(5);

    #[test]
    fn out_of_order_completions_are_parked() {
        let (tx, mut rx) = completion_queue::<u64, &str>(4);
        tx.complete(2, "second").unwrap();
        tx.complete(1, "first").unwrap();
        assert_eq!(rx.stats().depth, 2);

        assert_eq!(rx.wait_for(&1, SHORT), Ok(Some("first")));
        let stats = rx.stats();
        assert_eq!((stats.depth, stats.peak_depth, stats.parked), (0, 2, 1));

        assert_eq!(rx.wait_for(&2, SHORT), Ok(Some("second")));
        assert_eq!(rx.stats().parked, 0);
    }

    #[test]
    fn missing_key_times_out_then_disconnects() {
        let (tx, mut rx) = completion_queue::<u64, ()>(1);
        assert_eq!(rx.wait_for(&7, SHORT), Ok(None));
        drop(tx);
        assert_eq!(rx.wait_for(&7, SHORT), Err(QueueRecvError::Disconnected));
    }

    #[test]
    fn parked_completion_survives_worker_exit() {
        let (tx, mut rx) = completion_queue::<u64, u8>(2);
        tx.complete(3, 30).unwrap();
        assert_eq!(rx.wait_for(&4, SHORT), Ok(None));
        drop(tx);
        assert_eq!(rx.wait_for(&3, SHORT), Ok(Some(30)));
        assert_eq!(rx.wait_for(&3, SHORT), Err(QueueRecvError::Disconnected));
    }

    #[test]
    fn credits_are_bounded_and_never_underflow() {
        let credits = InFlightCredits::new(2);
        assert!(credits.try_acquire());
        assert!(credits.try_acquire());
        assert!(!credits.try_acquire());
        assert_eq!(credits.snapshot(), (2, 2));
        credits.release();
        assert!(credits.try_acquire());
        for _ in 0..4 {
            credits.release();
        }
        assert_eq!(credits.snapshot().0, 0);
        assert_eq!(InFlightCredits::new(0).snapshot().1, 1);
    }
}
