//! A dedicated work pool with cancelable, flushable work items.
//!
//! Work items carry a fixed closure and an idempotent pending flag: queueing
//! an already-pending item is a no-op that reports failure, re-queueing from
//! inside the running closure is allowed. `cancel_sync` and `flush` give the
//! teardown paths the barriers they need to drain workers before freeing
//! what those workers touch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct WorkState {
    pending: bool,
    running: bool,
    /// Bumped on every enqueue so a canceled-and-requeued item cannot be
    /// run off a stale queue entry.
    seq: u64,
}

struct WorkInner {
    func: Box<dyn Fn() + Send + Sync>,
    state: Mutex<WorkState>,
    cv: Condvar,
}

/// A schedulable unit of work. Clones share the same pending state.
#[derive(Clone)]
pub struct Work {
    inner: Arc<WorkInner>,
}

impl Work {
    pub fn new<F: Fn() + Send + Sync + 'static>(func: F) -> Self {
        Work {
            inner: Arc::new(WorkInner {
                func: Box::new(func),
                state: Mutex::new(WorkState {
                    pending: false,
                    running: false,
                    seq: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Whether the item is queued and not yet started.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().unwrap().pending
    }
}

struct QueuedItem {
    due: Instant,
    seq: u64,
    work: Work,
}

struct WqState {
    items: Vec<QueuedItem>,
    shutdown: bool,
}

struct WqInner {
    state: Mutex<WqState>,
    cv: Condvar,
}

/// Single-threaded work queue; items run in due-time order.
pub struct WorkQueue {
    inner: Arc<WqInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
    down: AtomicBool,
}

impl WorkQueue {
    pub fn new(name: &str) -> Arc<WorkQueue> {
        let inner = Arc::new(WqInner {
            state: Mutex::new(WqState {
                items: Vec::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || Self::run(worker))
            .expect("failed to spawn work queue thread");
        Arc::new(WorkQueue {
            inner,
            thread: Mutex::new(Some(thread)),
            down: AtomicBool::new(false),
        })
    }

    /// Queue a work item to run as soon as possible. Returns `false` if it
    /// was already pending.
    pub fn queue(&self, work: &Work) -> bool {
        self.queue_delayed(work, Duration::ZERO)
    }

    /// Queue a work item to run after `delay`. Returns `false` if it was
    /// already pending.
    pub fn queue_delayed(&self, work: &Work, delay: Duration) -> bool {
        let seq = {
            let mut ws = work.inner.state.lock().unwrap();
            if ws.pending {
                return false;
            }
            ws.pending = true;
            ws.seq += 1;
            ws.seq
        };

        let mut qs = self.inner.state.lock().unwrap();
        if qs.shutdown {
            drop(qs);
            work.inner.state.lock().unwrap().pending = false;
            return false;
        }
        qs.items.push(QueuedItem {
            due: Instant::now() + delay,
            seq,
            work: work.clone(),
        });
        self.inner.cv.notify_one();
        true
    }

    /// Cancel a pending instance and wait for a running one to finish.
    pub fn cancel_sync(&self, work: &Work) {
        let mut ws = work.inner.state.lock().unwrap();
        ws.pending = false;
        while ws.running {
            ws = work.inner.cv.wait(ws).unwrap();
        }
    }

    /// Wait until the item is neither pending nor running.
    pub fn flush(&self, work: &Work) {
        let mut ws = work.inner.state.lock().unwrap();
        while ws.pending || ws.running {
            ws = work.inner.cv.wait(ws).unwrap();
        }
    }

    fn run(inner: Arc<WqInner>) {
        loop {
            let item = {
                let mut qs = inner.state.lock().unwrap();
                loop {
                    if qs.shutdown {
                        // Discard whatever is still queued; teardown paths
                        // cancel what they care about before this point.
                        for it in qs.items.drain(..) {
                            let mut ws = it.work.inner.state.lock().unwrap();
                            ws.pending = false;
                            it.work.inner.cv.notify_all();
                        }
                        return;
                    }
                    let now = Instant::now();
                    let next = qs
                        .items
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, it)| it.due)
                        .map(|(i, it)| (i, it.due));
                    match next {
                        Some((i, due)) if due <= now => break qs.items.swap_remove(i),
                        Some((_, due)) => {
                            let (guard, _) = inner
                                .cv
                                .wait_timeout(qs, due.saturating_duration_since(now))
                                .unwrap();
                            qs = guard;
                        }
                        None => qs = inner.cv.wait(qs).unwrap(),
                    }
                }
            };

            let runnable = {
                let mut ws = item.work.inner.state.lock().unwrap();
                if ws.pending && ws.seq == item.seq {
                    ws.pending = false;
                    ws.running = true;
                    true
                } else {
                    false
                }
            };
            if !runnable {
                continue;
            }

            (item.work.inner.func)();

            let mut ws = item.work.inner.state.lock().unwrap();
            ws.running = false;
            item.work.inner.cv.notify_all();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.state.lock().unwrap().shutdown = true;
        self.inner.cv.notify_all();
        if let Some(t) = self.thread.lock().unwrap().take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_queue_and_flush() {
        let wq = WorkQueue::new("wq-test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let work = Work::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wq.queue(&work));
        wq.flush(&work);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(wq.queue(&work));
        wq.flush(&work);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_double_queue_is_noop() {
        let wq = WorkQueue::new("wq-test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let g = gate.clone();
        let work = Work::new(move || {
            let (lock, cv) = &*g;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
            h.fetch_add(1, Ordering::SeqCst);
        });

        // Block the worker on the first instance, then try to double-queue.
        assert!(wq.queue_delayed(&work, Duration::from_millis(50)));
        assert!(!wq.queue(&work));
        {
            let (lock, cv) = &*gate;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        wq.flush(&work);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_pending() {
        let wq = WorkQueue::new("wq-test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let work = Work::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wq.queue_delayed(&work, Duration::from_secs(30)));
        wq.cancel_sync(&work);
        assert!(!work.is_pending());

        // A fresh queue after cancel still runs.
        assert!(wq.queue(&work));
        wq.flush(&work);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
