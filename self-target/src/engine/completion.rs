//! Single-shot completion slot.
//!
//! Every asynchronous request owns one slot. Whoever settles it first (worker,
//! watchdog, shutdown) delivers the completion; later attempts are no-ops. A
//! slot dropped unsettled reports `Cancelled`, so a callback can never be lost.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use log::Level;

use crate::error::SelfTargetError;
use crate::request::{Completion, CompletionCallback, RequestKind};
use crate::selftarget_log;

pub(crate) struct CompletionSlot {
    kind: RequestKind,
    done: AtomicBool,
    cancelled: Arc<AtomicBool>,
    callback: Mutex<Option<CompletionCallback>>,
}

impl CompletionSlot {
    /// `cancelled` is the flag the in-flight request exposes to its handler.
    pub(crate) fn new(
        kind: RequestKind,
        callback: Option<CompletionCallback>,
        cancelled: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self { kind, done: AtomicBool::new(false), cancelled, callback: Mutex::new(callback) })
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Deliver `completion` unless the slot is already settled.
    /// Returns whether this call settled it.
    pub(crate) fn complete(&self, completion: Completion) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }

        let outcome = match &completion.result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(
            "self_target_requests_completed_total",
            "kind" => self.kind.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        let callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(cb) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(completion))).is_err() {
                selftarget_log!(Level::Error, "engine", "completion callback panicked ({:?})", self.kind);
            }
        }
        true
    }

    /// Settle with `Timeout` and tell the handler to stop.
    pub(crate) fn expire(&self, timeout_ms: u32) {
        self.cancelled.store(true, Ordering::Release);
        if self.complete(Completion::failed(SelfTargetError::Timeout(timeout_ms))) {
            metrics::counter!("self_target_requests_timed_out_total", "kind" => self.kind.as_str())
                .increment(1);
            selftarget_log!(Level::Warn, "engine", "{:?} request timed out after {} ms", self.kind, timeout_ms);
        }
    }

    /// Settle with `Cancelled` and tell the handler to stop.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.complete(Completion::failed(SelfTargetError::Cancelled));
    }

    /// Settle without invoking the callback; the failure was reported to the
    /// caller synchronously instead.
    pub(crate) fn abandon(&self) {
        self.done.store(true, Ordering::Release);
        self.callback.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl Drop for CompletionSlot {
    fn drop(&mut self) {
        if !self.is_done() {
            self.cancel();
        }
    }
}
