use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A sorted set of (fire-time, value) entries with cheap insertion and
/// cheap rescheduling: exactly one internal timer is armed at a time,
/// targeting the earliest entry. Adding an entry earlier than the
/// currently-armed deadline wakes the waiting consumer so it can re-arm;
/// adding anything later leaves the armed timer undisturbed.
pub struct TimeQ<T> {
    heap: Mutex<BinaryHeap<Reverse<Entry<T>>>>,
    /// The deadline the consumer is currently sleeping until, if any.
    armed: Mutex<Option<Instant>>,
    notify: Notify,
    closed: AtomicBool,
    seq: AtomicU64,
}

struct Entry<T> {
    fire_time: Instant,
    seq: u64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_time == other.fire_time && self.seq == other.seq
    }
}
impl<T> Eq for Entry<T> {}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_time
            .cmp(&other.fire_time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Returned by [`TimeQ::add`] when the queue has already been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

impl std::fmt::Display for Closed {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "timeq is closed")
    }
}
impl std::error::Error for Closed {}

impl<T> Default for TimeQ<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeQ<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            armed: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Schedules `value` to become available from [`TimeQ::recv`] at
    /// `fire_time`. Rejected once the queue has been closed.
    pub fn add(&self, fire_time: Instant, value: T) -> Result<(), Closed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Closed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Reverse(Entry {
            fire_time,
            seq,
            value,
        }));

        let needs_wake = match *self.armed.lock() {
            Some(armed) => fire_time < armed,
            None => true,
        };
        if needs_wake {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Marks the queue closed: further [`TimeQ::add`] calls are rejected.
    /// Entries already queued are still yielded by `recv` as they come due.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Pulls the next due entry, waiting until its fire-time if necessary.
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let wait = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(Reverse(entry)) if entry.fire_time <= Instant::now() => {
                        let Reverse(entry) = heap.pop().unwrap();
                        *self.armed.lock() = None;
                        return Some(entry.value);
                    }
                    Some(Reverse(entry)) => {
                        let deadline = entry.fire_time;
                        *self.armed.lock() = Some(deadline);
                        deadline - Instant::now()
                    }
                    None => {
                        if self.closed.load(Ordering::Acquire) {
                            return None;
                        }
                        *self.armed.lock() = None;
                        // Nothing queued; wait indefinitely for add()/close()
                        // to notify us. The duration is never reached in
                        // practice since notify always fires first.
                        Duration::from_secs(3600)
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Drains every entry currently in the queue, regardless of fire-time.
    pub fn drain(&self) -> Vec<T> {
        let mut heap = self.heap.lock();
        let mut out: Vec<Entry<T>> = std::mem::take(&mut *heap).into_sorted_vec().into_iter().map(|Reverse(e)| e).collect();
        out.reverse();
        *self.armed.lock() = None;
        out.into_iter().map(|e| e.value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[tokio::test(start_paused = true)]
    async fn pops_in_fire_time_order() {
        let q: TimeQ<&'static str> = TimeQ::new();
        let now = Instant::now();
        q.add(now + Duration::from_millis(10), "bar").unwrap();
        q.add(now + Duration::from_millis(1), "foo").unwrap();
        q.add(now + Duration::from_millis(5), "baz").unwrap();

        assert_eq!(q.len(), 3);
        assert_eq!(q.recv().await, Some("foo"));
        assert_eq!(q.recv().await, Some("baz"));
        assert_eq!(q.recv().await, Some("bar"));
        assert_eq!(q.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_add_wakes_waiting_consumer() {
        let q = StdArc::new(TimeQ::new());
        let now = Instant::now();
        q.add(now + Duration::from_secs(3600), "late").unwrap();

        let q2 = StdArc::clone(&q);
        let handle = tokio::spawn(async move { q2.recv().await });

        tokio::task::yield_now().await;
        q.add(now + Duration::from_millis(1), "early").unwrap();

        assert_eq!(handle.await.unwrap(), Some("early"));
    }

    #[tokio::test]
    async fn close_rejects_further_adds_but_drains_existing() {
        let q: TimeQ<&'static str> = TimeQ::new();
        q.add(Instant::now(), "one").unwrap();
        q.close();
        assert!(q.add(Instant::now(), "two").is_err());
        assert_eq!(q.recv().await, Some("one"));
        assert_eq!(q.recv().await, None);
    }

    #[test]
    fn drain_empties_the_queue() {
        let q: TimeQ<u32> = TimeQ::new();
        let now = Instant::now();
        q.add(now + Duration::from_millis(5), 2).unwrap();
        q.add(now + Duration::from_millis(1), 1).unwrap();
        let items = q.drain();
        assert_eq!(items, vec![1, 2]);
        assert!(q.is_empty());
    }
}
