//! Error taxonomy for the self-target channel.
//!
//! Two layers:
//! - [`IoStatus`] is what a device stack reports when it fails a request or an
//!   open. It plays the role NTSTATUS plays in a real driver.
//! - [`SelfTargetError`] is what callers of the channel see. Engine-originated
//!   failures (`Transport`, `Timeout`, `Cancelled`) are passed through without
//!   translation.

use thiserror::Error;

/// Failure status reported by a device stack or I/O target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoStatus {
    #[error("request type not implemented by the device stack")]
    NotImplemented,

    #[error("invalid device request (ioctl {0:#010x})")]
    InvalidDeviceRequest(u32),

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("sharing violation")]
    SharingViolation,

    #[error("device removed")]
    DeviceRemoved,

    #[error("invalid device state")]
    InvalidDeviceState,

    #[error("buffer overflow ({reported} bytes reported, {capacity} available)")]
    BufferOverflow { reported: usize, capacity: usize },

    #[error("insufficient resources")]
    InsufficientResources,

    #[error("unsuccessful (status {0:#x})")]
    Unsuccessful(i32),
}

/// All the ways a self-target operation can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelfTargetError {
    /// The loopback target or the request engine could not be created.
    #[error("creation failure: {0}")]
    CreationFailure(#[source] IoStatus),

    /// The target was created but could not be opened for I/O.
    #[error("open failure: {0}")]
    OpenFailure(#[source] IoStatus),

    /// Call made while the target is not in a state that allows it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("transport failure: {0}")]
    Transport(#[source] IoStatus),

    #[error("request timed out after {0} ms")]
    Timeout(u32),

    #[error("request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SelfTargetError>;

impl SelfTargetError {
    /// Short label used for metrics and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            SelfTargetError::CreationFailure(_) => "creation_failure",
            SelfTargetError::OpenFailure(_) => "open_failure",
            SelfTargetError::InvalidState(_) => "invalid_state",
            SelfTargetError::Transport(_) => "transport",
            SelfTargetError::Timeout(_) => "timeout",
            SelfTargetError::Cancelled => "cancelled",
        }
    }
}
