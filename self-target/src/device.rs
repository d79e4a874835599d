//! Simulated device stack.
//!
//!  * A [`Device`] is a cheap, cloneable handle to one named stack and the
//!    [`Dispatcher`] that services requests sent into it.
//!  * Opening the stack yields a [`StackHandle`]; share access is checked the
//!    way the I/O manager checks it, and the handle releases its share on drop.
//!  * `remove()` simulates surprise removal: new opens and every dispatch fail
//!    with `DeviceRemoved` from then on.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use log::Level;

use crate::dispatch::Dispatcher;
use crate::error::IoStatus;
use crate::request::IoRequest;
use crate::selftarget_log;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Read/write flags, used both for desired access and for share access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access {
    pub read: bool,
    pub write: bool,
}

impl Access {
    pub const NONE: Access = Access { read: false, write: false };
    pub const READ: Access = Access { read: true, write: false };
    pub const WRITE: Access = Access { read: false, write: true };
    pub const READ_WRITE: Access = Access { read: true, write: true };
}

#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    desired: Access,
    share: Access,
}

impl OpenEntry {
    /// Both sides must tolerate each other's access.
    fn compatible_with(&self, other: &OpenEntry) -> bool {
        let blocks = |a: &OpenEntry, b: &OpenEntry| {
            (a.desired.read && !b.share.read) || (a.desired.write && !b.share.write)
        };
        !blocks(self, other) && !blocks(other, self)
    }
}

#[derive(Debug, Default)]
struct StackState {
    removed: bool,
    next_handle: u64,
    opens: HashMap<u64, OpenEntry>,
}

struct DeviceStack {
    id: u64,
    name: String,
    dispatcher: Dispatcher,
    state: Mutex<StackState>,
}

/// Handle to a device and its stack.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceStack>,
}

impl Device {
    pub fn new(name: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(DeviceStack {
                id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                dispatcher,
                state: Mutex::new(StackState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Simulate surprise removal.
    pub fn remove(&self) {
        self.state().removed = true;
        selftarget_log!(Level::Warn, "device", "{} removed", self.name());
    }

    pub fn is_removed(&self) -> bool {
        self.state().removed
    }

    /// Number of handles currently open against this stack.
    pub fn open_handles(&self) -> usize {
        self.state().opens.len()
    }

    /// Open the stack with `desired` access, sharing `share` with other openers.
    pub fn open_handle(&self, desired: Access, share: Access) -> Result<StackHandle, IoStatus> {
        let mut state = self.state();
        if state.removed {
            return Err(IoStatus::DeviceRemoved);
        }

        let entry = OpenEntry { desired, share };
        if !state.opens.values().all(|e| e.compatible_with(&entry)) {
            selftarget_log!(
                Level::Debug,
                "device",
                "{}: open refused, {} existing handle(s) do not share",
                self.name(),
                state.opens.len()
            );
            return Err(IoStatus::SharingViolation);
        }

        state.next_handle += 1;
        let id = state.next_handle;
        state.opens.insert(id, entry);
        Ok(StackHandle { device: self.clone(), id })
    }

    /// Deliver a request to the top of this stack.
    pub fn dispatch(&self, req: &mut IoRequest) -> Result<usize, IoStatus> {
        if self.is_removed() {
            return Err(IoStatus::DeviceRemoved);
        }
        self.inner.dispatcher.dispatch(req)
    }

    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> MutexGuard<'_, StackState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// An open handle on a device stack. Releases its share access on drop.
#[derive(Debug)]
pub struct StackHandle {
    device: Device,
    id: u64,
}

impl StackHandle {
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for StackHandle {
    fn drop(&mut self) {
        self.device.state().opens.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("test-dev", Dispatcher::new())
    }

    #[test]
    fn shared_openers_coexist() {
        let dev = device();
        let a = dev.open_handle(Access::READ_WRITE, Access::READ_WRITE).unwrap();
        let b = dev.open_handle(Access::READ_WRITE, Access::READ_WRITE).unwrap();
        assert_eq!(dev.open_handles(), 2);
        drop(a);
        drop(b);
        assert_eq!(dev.open_handles(), 0);
    }

    #[test]
    fn exclusive_opener_blocks_others_until_dropped() {
        let dev = device();
        let exclusive = dev.open_handle(Access::READ_WRITE, Access::NONE).unwrap();
        assert_eq!(
            dev.open_handle(Access::READ, Access::READ_WRITE).unwrap_err(),
            IoStatus::SharingViolation
        );
        drop(exclusive);
        assert!(dev.open_handle(Access::READ, Access::READ_WRITE).is_ok());
    }

    #[test]
    fn new_opener_must_share_existing_access() {
        let dev = device();
        let _writer = dev.open_handle(Access::WRITE, Access::READ_WRITE).unwrap();
        // read-only sharing would lock out the existing writer
        assert_eq!(
            dev.open_handle(Access::READ, Access::READ).unwrap_err(),
            IoStatus::SharingViolation
        );
    }

    #[test]
    fn removed_device_refuses_open_and_dispatch() {
        let dev = device();
        dev.remove();
        assert_eq!(
            dev.open_handle(Access::READ, Access::READ_WRITE).unwrap_err(),
            IoStatus::DeviceRemoved
        );
        let mut req = IoRequest::new(crate::request::RequestKind::Read, 0, Vec::new(), 0);
        assert_eq!(dev.dispatch(&mut req), Err(IoStatus::DeviceRemoved));
    }
}
