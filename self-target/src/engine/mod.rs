//! Request engine: queues, issues and completes requests against a bound target.
//!
//! [`RequestEngine`] is the seam the self-target forwards through. The crate's
//! implementation, [`DispatchEngine`], is a fixed pool of worker threads
//! draining a bounded crossbeam queue, plus a watchdog thread for timeouts.
//!
//! Guarantees:
//! - every accepted asynchronous request completes exactly once;
//! - a send that fails synchronously never invokes its callback;
//! - requests still queued when the engine is dropped complete as `Cancelled`.

mod completion;
mod watchdog;

use std::{
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::Level;

use crate::config::EngineConfig;
use crate::error::{IoStatus, Result, SelfTargetError};
use crate::request::{
    AsyncRequest, Completion, CompletionCallback, IoRequest, RequestDescriptor, RequestKind,
};
use crate::selftarget_log;
use crate::target::TargetHandle;
use completion::CompletionSlot;
use watchdog::Watchdog;

pub trait RequestEngine: Send + Sync {
    /// Point all subsequent requests at `target`. Called once per open cycle.
    fn bind_target(&self, target: TargetHandle);

    /// Forget the bound target, returning it.
    fn unbind_target(&self) -> Option<TargetHandle>;

    fn bound_target(&self) -> Option<TargetHandle>;

    /// Queue `request` and return immediately. `callback`, if given, runs
    /// exactly once on an engine thread. An `Err` return means the request was
    /// not accepted and the callback will never run.
    fn send(&self, request: AsyncRequest, callback: Option<CompletionCallback>) -> Result<()>;

    /// Issue `request` and block until it completes or times out. Returns the
    /// bytes transferred; the response is copied into `request.response`.
    fn send_synchronously(&self, request: RequestDescriptor<'_>) -> Result<usize>;
}

struct Job {
    request: IoRequest,
    target: TargetHandle,
    slot: Arc<CompletionSlot>,
}

/// Worker-pool implementation of [`RequestEngine`].
pub struct DispatchEngine {
    target: RwLock<Option<TargetHandle>>,
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    watchdog: Watchdog,
    shutting_down: Arc<AtomicBool>,
}

impl DispatchEngine {
    pub fn new(cfg: &EngineConfig) -> Result<Self> {
        if cfg.worker_threads == 0 || cfg.queue_depth == 0 {
            return Err(SelfTargetError::CreationFailure(IoStatus::InvalidParameter));
        }

        let (tx, rx) = channel::bounded::<Job>(cfg.queue_depth);
        let shutting_down = Arc::new(AtomicBool::new(false));

        // on early return, dropping `tx` lets already-spawned workers exit
        let workers = (0..cfg.worker_threads)
            .map(|i| {
                let rx = rx.clone();
                let stop = Arc::clone(&shutting_down);
                thread::Builder::new()
                    .name(format!("self-target-worker-{i}"))
                    .spawn(move || worker_loop(rx, stop))
            })
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|_| SelfTargetError::CreationFailure(IoStatus::InsufficientResources))?;

        let watchdog = Watchdog::spawn()
            .map_err(|_| SelfTargetError::CreationFailure(IoStatus::InsufficientResources))?;

        selftarget_log!(
            Level::Debug,
            "engine",
            "created: {} worker(s), queue depth {}",
            cfg.worker_threads,
            cfg.queue_depth
        );

        Ok(Self {
            target: RwLock::new(None),
            jobs: Some(tx),
            workers,
            watchdog,
            shutting_down,
        })
    }

    /// Requests currently waiting for a worker.
    pub fn queued(&self) -> usize {
        self.jobs.as_ref().map_or(0, Sender::len)
    }

    /// Deadlines the watchdog still holds for requests sent with a timeout.
    pub fn pending_deadlines(&self) -> usize {
        self.watchdog.tracked()
    }
}

impl RequestEngine for DispatchEngine {
    fn bind_target(&self, target: TargetHandle) {
        selftarget_log!(Level::Debug, "engine", "target {} bound", target.id());
        *self.target.write().unwrap_or_else(PoisonError::into_inner) = Some(target);
    }

    fn unbind_target(&self) -> Option<TargetHandle> {
        let old = self.target.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(t) = &old {
            selftarget_log!(Level::Debug, "engine", "target {} unbound", t.id());
        }
        old
    }

    fn bound_target(&self) -> Option<TargetHandle> {
        self.target.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn send(&self, request: AsyncRequest, callback: Option<CompletionCallback>) -> Result<()> {
        let target = self
            .bound_target()
            .ok_or(SelfTargetError::InvalidState("no target bound to the request engine"))?;
        let jobs = self.jobs.as_ref().ok_or(SelfTargetError::Cancelled)?;

        let kind = request.kind;
        let timeout_ms = request.timeout_ms;
        let request = IoRequest::from_async(request);
        let slot = CompletionSlot::new(kind, callback, request.cancel_flag());

        if let Err(e) = jobs.try_send(Job { request, target, slot: Arc::clone(&slot) }) {
            slot.abandon();
            return Err(match e {
                TrySendError::Full(_) => {
                    selftarget_log!(Level::Warn, "engine", "queue full, {:?} request refused", kind);
                    SelfTargetError::Transport(IoStatus::InsufficientResources)
                }
                TrySendError::Disconnected(_) => SelfTargetError::Cancelled,
            });
        }

        metrics::counter!("self_target_requests_submitted_total", "kind" => kind.as_str())
            .increment(1);
        if timeout_ms > 0 {
            self.watchdog.arm(&slot, timeout_ms);
        }
        Ok(())
    }

    fn send_synchronously(&self, request: RequestDescriptor<'_>) -> Result<usize> {
        let RequestDescriptor { request, response, kind, ioctl, timeout_ms } = request;
        let (tx, rx) = channel::bounded::<Completion>(1);

        let owned = AsyncRequest {
            request: request.to_vec(),
            response_len: response.len(),
            kind,
            ioctl,
            timeout_ms,
        };
        self.send(
            owned,
            Some(Box::new(move |c: Completion| {
                let _ = tx.send(c);
            })),
        )?;

        // the slot always settles: on completion, on timeout, or as Cancelled on drop
        let completion = rx.recv().unwrap_or_else(|_| Completion::failed(SelfTargetError::Cancelled));
        let transferred = completion.result?;
        let n = transferred.min(response.len()).min(completion.response.len());
        response[..n].copy_from_slice(&completion.response[..n]);
        Ok(transferred)
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        drop(self.jobs.take());

        let me = thread::current().id();
        for worker in self.workers.drain(..) {
            // dropped from a completion callback: that worker exits on its own
            if worker.thread().id() != me {
                let _ = worker.join();
            }
        }
        self.watchdog.shutdown();
        selftarget_log!(Level::Debug, "engine", "destroyed");
    }
}

fn worker_loop(rx: Receiver<Job>, shutting_down: Arc<AtomicBool>) {
    while let Ok(Job { mut request, target, slot }) = rx.recv() {
        if shutting_down.load(Ordering::Acquire) {
            slot.cancel();
            continue;
        }
        // timed out while still queued
        if slot.is_done() {
            continue;
        }

        let result = target
            .submit(&mut request)
            .map_err(SelfTargetError::Transport)
            .and_then(|n| check_transfer(&request, n));

        match result {
            Ok(n) => slot.complete(Completion::succeeded(n, request.into_output())),
            Err(e) => {
                selftarget_log!(Level::Debug, "engine", "{:?} request failed: {}", request.kind(), e);
                slot.complete(Completion::failed(e))
            }
        };
    }
}

/// A handler may not claim more bytes than the buffer it worked on holds.
fn check_transfer(request: &IoRequest, reported: usize) -> Result<usize> {
    let capacity = match request.kind() {
        RequestKind::Write => request.input().len(),
        RequestKind::Read | RequestKind::DeviceControl => request.output_len(),
    };
    if reported > capacity {
        return Err(SelfTargetError::Transport(IoStatus::BufferOverflow { reported, capacity }));
    }
    Ok(reported)
}
