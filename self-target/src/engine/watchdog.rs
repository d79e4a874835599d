//! Deadline enforcement for requests that carry a timeout.
//!
//! One thread keeps a min-heap of deadlines fed through a crossbeam channel and
//! sleeps until the earliest one. Slots are held weakly; entries whose request
//! already completed are swept out once the table doubles in size, so long
//! timeouts under steady traffic do not accumulate.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::Level;

use super::completion::CompletionSlot;
use crate::selftarget_log;

/// Table size below which no sweep is attempted.
const SWEEP_FLOOR: usize = 256;

struct Deadline {
    at: Instant,
    timeout_ms: u32,
    slot: Weak<CompletionSlot>,
}

pub(crate) struct Watchdog {
    tx: Option<Sender<Deadline>>,
    thread: Option<JoinHandle<()>>,
    tracked: Arc<AtomicUsize>,
}

impl Watchdog {
    pub(crate) fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        let tracked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&tracked);
        let thread = thread::Builder::new()
            .name("self-target-watchdog".into())
            .spawn(move || run(rx, counter))?;
        Ok(Self { tx: Some(tx), thread: Some(thread), tracked })
    }

    /// Deadlines currently held, including ones not yet swept.
    pub(crate) fn tracked(&self) -> usize {
        self.tracked.load(Ordering::Acquire)
    }

    /// Expire `slot` with `Timeout` if it has not completed within `timeout_ms`.
    pub(crate) fn arm(&self, slot: &Arc<CompletionSlot>, timeout_ms: u32) {
        let deadline = Deadline {
            at: Instant::now() + Duration::from_millis(u64::from(timeout_ms)),
            timeout_ms,
            slot: Arc::downgrade(slot),
        };
        if let Some(tx) = &self.tx {
            // thread gone means we are shutting down; the slot settles on drop
            let _ = tx.send(deadline);
        }
    }

    pub(crate) fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<Deadline>, tracked: Arc<AtomicUsize>) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, (u32, Weak<CompletionSlot>)> = HashMap::new();
    let mut seq = 0u64;
    let mut sweep_at = SWEEP_FLOOR;

    selftarget_log!(Level::Debug, "watchdog", "started");
    loop {
        let next = heap.peek().map(|Reverse((at, _))| *at);
        let msg = match next {
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(at) => rx.recv_timeout(at.saturating_duration_since(Instant::now())),
        };

        match msg {
            Ok(d) => {
                seq += 1;
                heap.push(Reverse((d.at, seq)));
                pending.insert(seq, (d.timeout_ms, d.slot));
                if pending.len() >= sweep_at {
                    sweep(&mut heap, &mut pending);
                    sweep_at = (pending.len() * 2).max(SWEEP_FLOOR);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while let Some(Reverse((at, id))) = heap.peek().copied() {
            if at > now {
                break;
            }
            heap.pop();
            if let Some((timeout_ms, weak)) = pending.remove(&id) {
                if let Some(slot) = weak.upgrade() {
                    slot.expire(timeout_ms);
                }
            }
        }
        tracked.store(pending.len(), Ordering::Release);
    }
    selftarget_log!(Level::Debug, "watchdog", "exited with {} deadline(s) pending", pending.len());
}

/// Drop deadlines whose request has completed and been released.
fn sweep(
    heap: &mut BinaryHeap<Reverse<(Instant, u64)>>,
    pending: &mut HashMap<u64, (u32, Weak<CompletionSlot>)>,
) {
    let before = pending.len();
    pending.retain(|_, (_, slot)| slot.strong_count() > 0);
    heap.retain(|Reverse((_, id))| pending.contains_key(id));
    selftarget_log!(Level::Trace, "watchdog", "swept {} finished deadline(s)", before - pending.len());
}
