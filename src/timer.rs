//! Deadline timers backed by a single worker thread.
//!
//! A [`TimerQueue`] owns one thread that sleeps until the earliest armed
//! deadline and runs that timer's callback. Controllers receive the queue as
//! an explicit dependency; [`TimerQueue::shared`] hands out the process-wide
//! instance, created on first use.
//!
//! Callbacks run on the worker thread and must be short; the port controller
//! only flips a flag from them.

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: Instant,
    seq: u64,
    timer: u64,
    generation: u64,
}

struct Slot {
    generation: u64,
    callback: Callback,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<Entry>>,
    slots: HashMap<u64, Slot>,
    next_id: u64,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
}

/// Scheduler for one-shot deadline callbacks.
pub struct TimerQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static SHARED_QUEUE: OnceCell<Arc<TimerQueue>> = OnceCell::new();

impl TimerQueue {
    /// Start a new queue with its own worker thread.
    pub fn new() -> io::Result<Arc<Self>> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("timer-queue".into())
            .spawn(move || run_worker(&worker_shared))?;
        debug!("timer queue started");
        Ok(Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// The process-wide queue. Created on the first call; later calls return
    /// the same instance.
    pub fn shared() -> io::Result<Arc<Self>> {
        SHARED_QUEUE.get_or_try_init(Self::new).map(Arc::clone)
    }

    /// Create a disarmed timer that runs `callback` when it expires.
    pub fn create_timer<F>(&self, callback: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut st = self.shared.state.lock();
        st.next_id += 1;
        let id = st.next_id;
        st.slots.insert(
            id,
            Slot {
                generation: 0,
                callback: Arc::new(callback),
            },
        );
        Timer {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of entries waiting in the heap, stale ones included.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("TimerQueue")
            .field("timers", &st.slots.len())
            .field("pending", &st.heap.len())
            .finish()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: &Shared) {
    let mut st = shared.state.lock();
    loop {
        if st.shutdown {
            break;
        }
        let Some(&Reverse(next)) = st.heap.peek() else {
            shared.wake.wait(&mut st);
            continue;
        };
        if next.deadline > Instant::now() {
            shared.wake.wait_until(&mut st, next.deadline);
            continue;
        }
        st.heap.pop();

        let callback = match st.slots.get(&next.timer) {
            Some(slot) if slot.generation == next.generation => Arc::clone(&slot.callback),
            _ => continue,
        };
        trace!(timer = next.timer, "timer expired");
        drop(st);
        callback();
        st = shared.state.lock();
    }
    debug!("timer queue stopped");
}

/// One-shot timer owned by a single client.
///
/// Re-arming supersedes the previous deadline; a cancelled or superseded
/// expiry never runs the callback.
pub struct Timer {
    id: u64,
    shared: Arc<Shared>,
}

impl Timer {
    /// Arm the timer to fire once after `delay`.
    pub fn start_delay(&self, delay: Duration) {
        let mut st = self.shared.state.lock();
        st.next_seq += 1;
        let seq = st.next_seq;
        let Some(slot) = st.slots.get_mut(&self.id) else {
            return;
        };
        slot.generation += 1;
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq,
            timer: self.id,
            generation: slot.generation,
        };
        st.heap.push(Reverse(entry));
        drop(st);
        self.shared.wake.notify_all();
    }

    /// Disarm the timer. A callback already running is not interrupted.
    pub fn cancel(&self) {
        let mut st = self.shared.state.lock();
        if let Some(slot) = st.slots.get_mut(&self.id) {
            slot.generation += 1;
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().slots.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_timer(queue: &TimerQueue) -> (Timer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&fired);
        let timer = queue.create_timer(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        (timer, fired)
    }

    #[test]
    fn test_timer_fires_once() {
        let queue = TimerQueue::new().unwrap();
        let (timer, fired) = counter_timer(&queue);
        timer.start_delay(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_prevents_expiry() {
        let queue = TimerQueue::new().unwrap();
        let (timer, fired) = counter_timer(&queue);
        timer.start_delay(Duration::from_millis(30));
        timer.cancel();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rearm_supersedes_previous_deadline() {
        let queue = TimerQueue::new().unwrap();
        let (timer, fired) = counter_timer(&queue);
        timer.start_delay(Duration::from_millis(20));
        timer.start_delay(Duration::from_millis(200));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.cancel();
    }

    #[test]
    fn test_dropped_timer_never_fires() {
        let queue = TimerQueue::new().unwrap();
        let (timer, fired) = counter_timer(&queue);
        timer.start_delay(Duration::from_millis(10));
        drop(timer);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shared_queue_is_created_once() {
        let a = TimerQueue::shared().unwrap();
        let b = TimerQueue::shared().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
