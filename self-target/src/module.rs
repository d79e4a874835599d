//! Module descriptors and the device start/stop sequence that drives them.
//!
//! A [`ModuleDescriptor`] is an immutable value, one per module type, that
//! tells the host when a module's open/close hooks run. [`ModuleHost`] plays
//! the part of the driver framework: it owns the device and calls the hooks
//! in order on start, in reverse on stop, and rolls back a partial start.

use std::sync::Arc;

use log::Level;

use crate::device::Device;
use crate::error::Result;
use crate::selftarget_log;

/// Execution context the module declares for its hooks. Descriptive only:
/// the host records it in its log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOptions {
    Passive,
    Dispatch,
}

/// Which device transition opens (and its counterpart closes) the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOption {
    /// Open on prepare-hardware, close on release-hardware.
    PrepareHardware,
    /// Open on every entry to D0, close on every exit from D0.
    D0Entry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub options: ModuleOptions,
    pub open_option: OpenOption,
}

/// Lifecycle hooks every hosted module exposes.
pub trait Module: Send + Sync {
    fn descriptor(&self) -> &'static ModuleDescriptor;

    /// Device-start hook. Failure fails the device start.
    fn open(&self, device: &Device) -> Result<()>;

    /// Device-stop hook. Never fails; must tolerate being called when not open.
    fn close(&self);
}

/// Drives hosted modules through a device's start/stop transitions.
pub struct ModuleHost {
    device: Device,
    modules: Vec<Arc<dyn Module>>,
}

impl ModuleHost {
    pub fn new(device: Device) -> Self {
        Self { device, modules: Vec::new() }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Modules are opened in the order they are added.
    pub fn add(&mut self, module: Arc<dyn Module>) -> &mut Self {
        self.modules.push(module);
        self
    }

    pub fn prepare_hardware(&self) -> Result<()> {
        self.open_all(OpenOption::PrepareHardware)
    }

    pub fn release_hardware(&self) {
        self.close_all(OpenOption::PrepareHardware);
    }

    pub fn d0_entry(&self) -> Result<()> {
        self.open_all(OpenOption::D0Entry)
    }

    pub fn d0_exit(&self) {
        self.close_all(OpenOption::D0Entry);
    }

    fn open_all(&self, when: OpenOption) -> Result<()> {
        let stage: Vec<_> = self.stage(when).collect();
        for (i, module) in stage.iter().enumerate() {
            let desc = module.descriptor();
            let name = desc.name;
            if let Err(e) = module.open(&self.device) {
                selftarget_log!(
                    Level::Error,
                    "host",
                    "{} failed to open on {}: {}",
                    name,
                    self.device.name(),
                    e
                );
                // undo what this stage already opened, newest first
                for opened in stage[..i].iter().rev() {
                    opened.close();
                }
                return Err(e);
            }
            selftarget_log!(Level::Debug, "host", "{} opened ({:?}, {:?})", name, when, desc.options);
        }
        Ok(())
    }

    fn close_all(&self, when: OpenOption) {
        let stage: Vec<_> = self.stage(when).collect();
        for module in stage.into_iter().rev() {
            module.close();
            selftarget_log!(Level::Debug, "host", "{} closed ({:?})", module.descriptor().name, when);
        }
    }

    fn stage(&self, when: OpenOption) -> impl Iterator<Item = &Arc<dyn Module>> + '_ {
        self.modules.iter().filter(move |m| m.descriptor().open_option == when)
    }
}
