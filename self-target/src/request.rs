//! Request model shared by the forwarder, the engine and the device stack.
//!
//! - [`RequestDescriptor`] borrows caller buffers for synchronous sends.
//! - [`AsyncRequest`] owns its buffers so they can travel to an engine thread.
//! - [`IoRequest`] is the in-flight object a device stack handler sees.
//! - [`Completion`] is delivered exactly once per asynchronous request.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use crate::error::{Result, SelfTargetError};

/// What the device stack is asked to do with the buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    Write,
    DeviceControl,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Read => "read",
            RequestKind::Write => "write",
            RequestKind::DeviceControl => "device_control",
        }
    }
}

/// Synchronous request over caller-owned buffers.
///
/// `ioctl` is only meaningful for [`RequestKind::DeviceControl`]. A timeout of
/// zero means "wait forever".
#[derive(Debug)]
pub struct RequestDescriptor<'a> {
    pub request: &'a [u8],
    pub response: &'a mut [u8],
    pub kind: RequestKind,
    pub ioctl: u32,
    pub timeout_ms: u32,
}

impl<'a> RequestDescriptor<'a> {
    pub fn new(kind: RequestKind, request: &'a [u8], response: &'a mut [u8]) -> Self {
        Self { request, response, kind, ioctl: 0, timeout_ms: 0 }
    }

    pub fn ioctl(mut self, code: u32) -> Self {
        self.ioctl = code;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Asynchronous request; buffers are moved into the engine and the response
/// buffer comes back in the [`Completion`].
#[derive(Debug, Clone)]
pub struct AsyncRequest {
    pub request: Vec<u8>,
    pub response_len: usize,
    pub kind: RequestKind,
    pub ioctl: u32,
    pub timeout_ms: u32,
}

impl AsyncRequest {
    pub fn new(kind: RequestKind, request: Vec<u8>, response_len: usize) -> Self {
        Self { request, response_len, kind, ioctl: 0, timeout_ms: 0 }
    }

    pub fn ioctl(mut self, code: u32) -> Self {
        self.ioctl = code;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// In-flight request as seen by a device stack handler.
pub struct IoRequest {
    kind: RequestKind,
    ioctl: u32,
    input: Vec<u8>,
    output: Vec<u8>,
    cancelled: Arc<AtomicBool>,
}

impl IoRequest {
    pub fn new(kind: RequestKind, ioctl: u32, input: Vec<u8>, output_len: usize) -> Self {
        Self {
            kind,
            ioctl,
            input,
            output: vec![0u8; output_len],
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn from_async(req: AsyncRequest) -> Self {
        Self::new(req.kind, req.ioctl, req.request, req.response_len)
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn ioctl(&self) -> u32 {
        self.ioctl
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    pub fn output(&mut self) -> &mut [u8] {
        &mut self.output
    }

    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Set once the request has timed out or the engine is shutting down.
    /// Long-running handlers should poll this and bail out.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub(crate) fn into_output(self) -> Vec<u8> {
        self.output
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("kind", &self.kind)
            .field("ioctl", &format_args!("{:#x}", self.ioctl))
            .field("input_len", &self.input.len())
            .field("output_len", &self.output.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Final outcome of an asynchronous request.
///
/// On success `result` carries the bytes transferred and `response` holds the
/// data the stack wrote. On failure `response` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub result: Result<usize>,
    pub response: Vec<u8>,
}

impl Completion {
    pub fn succeeded(transferred: usize, response: Vec<u8>) -> Self {
        Self { result: Ok(transferred), response }
    }

    pub fn failed(err: SelfTargetError) -> Self {
        Self { result: Err(err), response: Vec::new() }
    }
}

/// Called exactly once when an asynchronous request finishes.
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Future form of an asynchronous send. Resolves once with the completion.
#[derive(Debug)]
pub struct PendingRequest {
    rx: oneshot::Receiver<Completion>,
}

impl PendingRequest {
    /// Returns the request and the callback that settles it.
    pub(crate) fn channel() -> (Self, CompletionCallback) {
        let (tx, rx) = oneshot::channel();
        let callback: CompletionCallback = Box::new(move |completion| {
            // receiver gone means the caller stopped caring
            let _ = tx.send(completion);
        });
        (Self { rx }, callback)
    }

    /// Block the current thread until the request completes.
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Completion {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Completion::failed(SelfTargetError::Cancelled))
    }
}

impl Future for PendingRequest {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Completion::failed(SelfTargetError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_request_allocates_zeroed_output() {
        let mut req = IoRequest::new(RequestKind::Read, 0, Vec::new(), 16);
        assert_eq!(req.output().len(), 16);
        assert!(req.output().iter().all(|b| *b == 0));
        assert!(!req.is_cancelled());
    }

    #[test]
    fn pending_request_resolves_from_callback() {
        let (pending, callback) = PendingRequest::channel();
        callback(Completion::succeeded(3, vec![1, 2, 3]));
        let done = pending.wait();
        assert_eq!(done.result, Ok(3));
        assert_eq!(done.response, vec![1, 2, 3]);
    }

    #[test]
    fn dropped_callback_reads_as_cancelled() {
        let (pending, callback) = PendingRequest::channel();
        drop(callback);
        assert_eq!(pending.wait().result, Err(SelfTargetError::Cancelled));
    }
}
