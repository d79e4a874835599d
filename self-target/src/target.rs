//! I/O targets.
//!
//! An [`IoTarget`] is anything requests can be issued against. The crate ships
//! one implementation, [`LoopbackTarget`], which routes requests back into the
//! device stack that created it. Targets are shared through [`TargetHandle`].

use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use log::Level;

use crate::device::{Access, Device, StackHandle};
use crate::error::IoStatus;
use crate::request::IoRequest;
use crate::selftarget_log;

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Created but never opened.
    Created,
    Opened,
    Closed,
}

/// Parameters for opening a target against an existing device stack.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub device: Device,
    pub desired: Access,
    pub share: Access,
}

impl OpenParams {
    /// Read/write access to `device`, shared read/write with other openers.
    pub fn existing_device(device: &Device) -> Self {
        Self { device: device.clone(), desired: Access::READ_WRITE, share: Access::READ_WRITE }
    }

    pub fn share(mut self, share: Access) -> Self {
        self.share = share;
        self
    }
}

pub trait IoTarget: Send + Sync + fmt::Debug {
    /// Open the target for I/O.
    fn open(&self, params: &OpenParams) -> Result<(), IoStatus>;

    /// Close the target for I/O. Closing a target that is not open is a no-op.
    fn close(&self);

    fn state(&self) -> TargetState;

    /// Issue `req` against the target and return the bytes transferred.
    /// Blocks for as long as the stack takes to service the request.
    fn submit(&self, req: &mut IoRequest) -> Result<usize, IoStatus>;
}

/// Shared handle to an [`IoTarget`]. Two handles are equal when they refer to
/// the same target instance.
#[derive(Clone)]
pub struct TargetHandle {
    id: u64,
    target: Arc<dyn IoTarget>,
}

impl TargetHandle {
    pub fn new<T: IoTarget + 'static>(target: T) -> Self {
        Self { id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed), target: Arc::new(target) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Deref for TargetHandle {
    type Target = dyn IoTarget;

    fn deref(&self) -> &Self::Target {
        &*self.target
    }
}

impl PartialEq for TargetHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TargetHandle {}

impl fmt::Debug for TargetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Debug)]
struct LoopbackState {
    state: TargetState,
    handle: Option<StackHandle>,
}

/// Target that sends requests into the stack of the device that owns it.
#[derive(Debug)]
pub struct LoopbackTarget {
    owner: Device,
    inner: Mutex<LoopbackState>,
}

impl LoopbackTarget {
    /// Create an unopened loopback target owned by `device`.
    pub fn create(device: &Device) -> Result<Self, IoStatus> {
        if device.is_removed() {
            return Err(IoStatus::DeviceRemoved);
        }
        Ok(Self {
            owner: device.clone(),
            inner: Mutex::new(LoopbackState { state: TargetState::Created, handle: None }),
        })
    }

    pub fn owner(&self) -> &Device {
        &self.owner
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IoTarget for LoopbackTarget {
    fn open(&self, params: &OpenParams) -> Result<(), IoStatus> {
        // a loopback target only ever points at its own stack
        if !params.device.same_device(&self.owner) {
            return Err(IoStatus::InvalidParameter);
        }

        let mut inner = self.lock();
        if inner.state == TargetState::Opened {
            return Err(IoStatus::InvalidDeviceState);
        }
        let handle = params.device.open_handle(params.desired, params.share)?;
        inner.handle = Some(handle);
        inner.state = TargetState::Opened;
        selftarget_log!(Level::Debug, "target", "loopback target opened on {}", self.owner.name());
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.lock();
        if inner.state != TargetState::Opened {
            return;
        }
        inner.handle = None;
        inner.state = TargetState::Closed;
        selftarget_log!(Level::Debug, "target", "loopback target closed on {}", self.owner.name());
    }

    fn state(&self) -> TargetState {
        self.lock().state
    }

    fn submit(&self, req: &mut IoRequest) -> Result<usize, IoStatus> {
        let device = {
            let inner = self.lock();
            match (&inner.state, &inner.handle) {
                (TargetState::Opened, Some(handle)) => handle.device().clone(),
                _ => return Err(IoStatus::InvalidDeviceState),
            }
        };
        // lock released: a slow handler must not hold up close()
        device.dispatch(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, dispatch_write_sink};
    use crate::request::RequestKind;

    fn device() -> Device {
        let mut d = Dispatcher::new();
        d.register(RequestKind::Write, dispatch_write_sink);
        Device::new("loop", d)
    }

    #[test]
    fn submit_requires_open() {
        let dev = device();
        let target = LoopbackTarget::create(&dev).unwrap();
        let mut req = IoRequest::new(RequestKind::Write, 0, vec![1, 2], 0);
        assert_eq!(target.submit(&mut req), Err(IoStatus::InvalidDeviceState));

        target.open(&OpenParams::existing_device(&dev)).unwrap();
        assert_eq!(target.submit(&mut req), Ok(2));

        target.close();
        assert_eq!(target.state(), TargetState::Closed);
        assert_eq!(target.submit(&mut req), Err(IoStatus::InvalidDeviceState));
    }

    #[test]
    fn close_releases_stack_handle() {
        let dev = device();
        let target = LoopbackTarget::create(&dev).unwrap();
        target.open(&OpenParams::existing_device(&dev)).unwrap();
        assert_eq!(dev.open_handles(), 1);
        target.close();
        assert_eq!(dev.open_handles(), 0);
        // second close is a no-op
        target.close();
        assert_eq!(target.state(), TargetState::Closed);
    }

    #[test]
    fn dropping_open_target_releases_stack_handle() {
        let dev = device();
        {
            let target = LoopbackTarget::create(&dev).unwrap();
            target.open(&OpenParams::existing_device(&dev)).unwrap();
            assert_eq!(dev.open_handles(), 1);
        }
        assert_eq!(dev.open_handles(), 0);
    }

    #[test]
    fn refuses_foreign_device() {
        let dev = device();
        let other = device();
        let target = LoopbackTarget::create(&dev).unwrap();
        assert_eq!(
            target.open(&OpenParams::existing_device(&other)),
            Err(IoStatus::InvalidParameter)
        );
        assert_eq!(target.state(), TargetState::Created);
    }

    #[test]
    fn creation_fails_on_removed_device() {
        let dev = device();
        dev.remove();
        assert_eq!(LoopbackTarget::create(&dev).unwrap_err(), IoStatus::DeviceRemoved);
    }

    #[test]
    fn handles_compare_by_identity() {
        let dev = device();
        let a = TargetHandle::new(LoopbackTarget::create(&dev).unwrap());
        let b = TargetHandle::new(LoopbackTarget::create(&dev).unwrap());
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
