//! dispatch.rs
//! An extensible dispatcher for the request kinds a device stack services.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::error::IoStatus;
use crate::request::{IoRequest, RequestKind};

/// Prototype for request handlers. Returns the number of bytes transferred:
/// consumed from the input for writes, produced into the output otherwise.
pub type DispatchFn = Arc<dyn Fn(&mut IoRequest) -> Result<usize, IoStatus> + Send + Sync>;

/// Default handler: completes with `NotImplemented`.
fn default_handler(_req: &mut IoRequest) -> Result<usize, IoStatus> {
    Err(IoStatus::NotImplemented)
}

/// Dispatcher holds one handler per request kind, plus an IOCTL table
/// consulted for `DeviceControl` when no catch-all handler is registered.
#[derive(Clone)]
pub struct Dispatcher {
    read: Option<DispatchFn>,
    write: Option<DispatchFn>,
    device_control: Option<DispatchFn>,
    ioctls: HashMap<u32, DispatchFn>,
}

impl Dispatcher {
    /// All slots start at `default_handler`.
    pub fn new() -> Self {
        Self { read: None, write: None, device_control: None, ioctls: HashMap::new() }
    }

    /// Register a handler for a given request kind.
    pub fn register<F>(&mut self, kind: RequestKind, handler: F) -> &mut Self
    where
        F: Fn(&mut IoRequest) -> Result<usize, IoStatus> + Send + Sync + 'static,
    {
        let slot = match kind {
            RequestKind::Read => &mut self.read,
            RequestKind::Write => &mut self.write,
            RequestKind::DeviceControl => &mut self.device_control,
        };
        *slot = Some(Arc::new(handler));
        self
    }

    /// Register a handler for one IOCTL code.
    pub fn register_ioctl<F>(&mut self, code: u32, handler: F) -> &mut Self
    where
        F: Fn(&mut IoRequest) -> Result<usize, IoStatus> + Send + Sync + 'static,
    {
        self.ioctls.insert(code, Arc::new(handler));
        self
    }

    /// Route `req` to its handler.
    pub fn dispatch(&self, req: &mut IoRequest) -> Result<usize, IoStatus> {
        let handler = match req.kind() {
            RequestKind::Read => self.read.as_ref(),
            RequestKind::Write => self.write.as_ref(),
            RequestKind::DeviceControl => return self.dispatch_device_control(req),
        };
        match handler {
            Some(h) => h(req),
            None => default_handler(req),
        }
    }

    /// DeviceControl: a catch-all handler wins, otherwise route on IOCTL code.
    fn dispatch_device_control(&self, req: &mut IoRequest) -> Result<usize, IoStatus> {
        if let Some(h) = &self.device_control {
            return h(req);
        }
        match self.ioctls.get(&req.ioctl()) {
            Some(h) => h(req),
            None => Err(IoStatus::InvalidDeviceRequest(req.ioctl())),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.ioctls.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("device_control", &self.device_control.is_some())
            .field("ioctls", &codes)
            .finish()
    }
}

// ------------------------------------------------------------
// Standard handlers

/// Write: accept everything.
pub fn dispatch_write_sink(req: &mut IoRequest) -> Result<usize, IoStatus> {
    Ok(req.input().len())
}

/// DeviceControl: copy the input back into the output.
pub fn dispatch_echo(req: &mut IoRequest) -> Result<usize, IoStatus> {
    let n = req.input().len().min(req.output().len());
    let data = req.input()[..n].to_vec();
    req.output()[..n].copy_from_slice(&data);
    Ok(n)
}
