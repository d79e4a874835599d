// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod macros;
pub mod module;
pub mod request;
pub mod self_target;
pub mod target;

pub use device::{Access, Device, StackHandle};
pub use engine::{DispatchEngine, RequestEngine};
pub use error::{IoStatus, Result, SelfTargetError};
pub use module::{Module, ModuleDescriptor, ModuleHost, ModuleOptions, OpenOption};
pub use request::{
    AsyncRequest, Completion, CompletionCallback, IoRequest, PendingRequest, RequestDescriptor,
    RequestKind,
};
pub use self_target::{SELF_TARGET_DESCRIPTOR, SelfTarget};
pub use target::{IoTarget, LoopbackTarget, OpenParams, TargetHandle, TargetState};
