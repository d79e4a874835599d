//! The self-target module: a loopback I/O target plus the forwarder in front
//! of it.
//!
//! Lifecycle:
//!
//! ```text
//!   create ──► open ──► (send / submit / send_synchronously)* ──► close ──► open ... ──► drop
//!    engine     target                                             target              engine
//!    created    created, opened, bound                             unbound, closed     destroyed
//! ```
//!
//! The target slot is the only shared state. Forwarding calls take a read
//! lock just long enough to see whether it is filled; `open`/`close` are
//! expected to be serialized by the device start/stop sequence.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::Level;

use crate::config::Config;
use crate::device::{Access, Device};
use crate::engine::{DispatchEngine, RequestEngine};
use crate::error::{Result, SelfTargetError};
use crate::module::{Module, ModuleDescriptor, ModuleOptions, OpenOption};
use crate::request::{AsyncRequest, CompletionCallback, PendingRequest, RequestDescriptor};
use crate::selftarget_log;
use crate::target::{IoTarget, LoopbackTarget, OpenParams, TargetHandle};

/// Descriptor shared by every self-target instance.
pub static SELF_TARGET_DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
    name: "SelfTarget",
    options: ModuleOptions::Passive,
    open_option: OpenOption::PrepareHardware,
};

const NOT_OPEN: &str = "self-target is not open";

/// Sends requests to the device stack that owns it.
pub struct SelfTarget<E: RequestEngine = DispatchEngine> {
    device: Device,
    share: Access,
    engine: E,
    target: RwLock<Option<TargetHandle>>,
}

impl SelfTarget<DispatchEngine> {
    /// Create an instance for `device` with its own request engine. The
    /// target is not opened until [`SelfTarget::open`].
    pub fn create(device: &Device, config: &Config) -> Result<Self> {
        let engine = DispatchEngine::new(&config.engine).inspect_err(|e| {
            selftarget_log!(Level::Error, "lifecycle", "request engine creation fails: {}", e);
        })?;
        Ok(Self::with_engine(device, config, engine))
    }
}

impl<E: RequestEngine> SelfTarget<E> {
    /// Create an instance around a caller-supplied engine.
    pub fn with_engine(device: &Device, config: &Config, engine: E) -> Self {
        selftarget_log!(Level::Debug, "lifecycle", "created for {}", device.name());
        Self {
            device: device.clone(),
            share: config.target.share_access(),
            engine,
            target: RwLock::new(None),
        }
    }

    pub fn descriptor(&self) -> &'static ModuleDescriptor {
        &SELF_TARGET_DESCRIPTOR
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn is_open(&self) -> bool {
        self.slot().is_some()
    }

    /// Create a loopback target on the owning device, open it through
    /// `device` and bind it into the engine. `device` must be the owner.
    /// On failure nothing is left behind and the instance stays closed.
    pub fn open(&self, device: &Device) -> Result<()> {
        let mut slot = self.slot_mut();
        if slot.is_some() {
            return Err(SelfTargetError::InvalidState("self-target is already open"));
        }

        let target = LoopbackTarget::create(&self.device).map_err(|st| {
            selftarget_log!(Level::Error, "lifecycle", "loopback target create fails: {}", st);
            SelfTargetError::CreationFailure(st)
        })?;

        let params = OpenParams::existing_device(device).share(self.share);
        // on failure the unopened target is dropped here
        target.open(&params).map_err(|st| {
            selftarget_log!(Level::Error, "lifecycle", "loopback target open fails: {}", st);
            SelfTargetError::OpenFailure(st)
        })?;

        let handle = TargetHandle::new(target);
        self.engine.bind_target(handle.clone());
        selftarget_log!(Level::Info, "lifecycle", "target {} open on {}", handle.id(), device.name());
        *slot = Some(handle);
        Ok(())
    }

    /// Unbind, close and release the target. No-op when not open.
    pub fn close(&self) {
        let Some(handle) = self.slot_mut().take() else {
            return;
        };
        self.engine.unbind_target();
        handle.close();
        selftarget_log!(Level::Info, "lifecycle", "target {} closed on {}", handle.id(), self.device.name());
    }

    /// The open loopback target.
    pub fn get(&self) -> Result<TargetHandle> {
        self.slot().clone().ok_or(SelfTargetError::InvalidState(NOT_OPEN))
    }

    /// Forward an asynchronous request. Returns once it is queued; `callback`
    /// runs exactly once on an engine thread. On `Err` the callback never runs.
    pub fn send(&self, request: AsyncRequest, callback: Option<CompletionCallback>) -> Result<()> {
        self.ensure_open()?;
        selftarget_log!(
            Level::Trace,
            "forwarder",
            "send {:?} ioctl={:#x} len={} timeout={}ms",
            request.kind,
            request.ioctl,
            request.request.len(),
            request.timeout_ms
        );
        self.engine.send(request, callback)
    }

    /// Future-returning form of [`SelfTarget::send`].
    pub fn submit(&self, request: AsyncRequest) -> Result<PendingRequest> {
        let (pending, callback) = PendingRequest::channel();
        self.send(request, Some(callback))?;
        Ok(pending)
    }

    /// Forward a request and block until it completes; returns the bytes
    /// transferred. Must not be called from a completion callback.
    pub fn send_synchronously(&self, request: RequestDescriptor<'_>) -> Result<usize> {
        self.ensure_open()?;
        selftarget_log!(
            Level::Trace,
            "forwarder",
            "send_synchronously {:?} ioctl={:#x} len={} timeout={}ms",
            request.kind,
            request.ioctl,
            request.request.len(),
            request.timeout_ms
        );
        self.engine.send_synchronously(request)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.slot().is_none() {
            return Err(SelfTargetError::InvalidState(NOT_OPEN));
        }
        Ok(())
    }

    fn slot(&self) -> RwLockReadGuard<'_, Option<TargetHandle>> {
        self.target.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_mut(&self) -> RwLockWriteGuard<'_, Option<TargetHandle>> {
        self.target.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: RequestEngine> Module for SelfTarget<E> {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &SELF_TARGET_DESCRIPTOR
    }

    fn open(&self, device: &Device) -> Result<()> {
        SelfTarget::open(self, device)
    }

    fn close(&self) {
        SelfTarget::close(self)
    }
}

impl<E: RequestEngine> Drop for SelfTarget<E> {
    fn drop(&mut self) {
        self.close();
    }
}
