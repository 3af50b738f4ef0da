//! Error type shared by the whole crate

use thiserror::Error;

use crate::types::ConnectorState;

/// Errors reported by this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A backend call failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// [`Core::new`](crate::core::Core::new) found no device it could open
    #[error("No usable DRM device found")]
    NoDevices,
    /// An argument was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The connector is in a state that doesn't allow the operation
    #[error("Operation not allowed while the connector is {0}")]
    InvalidState(ConnectorState),
    /// The connector with this id has no display plugged in
    #[error("Connector {0} is not connected")]
    Disconnected(u32),
    /// No free CRTC, encoder and primary plane for the connector with this id
    #[error("Could not find a crtc/plane configuration for connector {0}")]
    NoConfiguration(u32),
    /// The device or renderer lacks something the operation needs
    #[error("Missing capability: {0}")]
    Unsupported(&'static str),
    /// Creating or accessing a buffer failed
    #[error("Buffer operation failed: {0}")]
    Buffer(&'static str),
    /// Called from a render thread, where it would deadlock
    #[error("This operation can not be called from a render thread")]
    RenderThread,
    /// The named device is disabled
    #[error("Device {0} is not enabled")]
    DeviceDisabled(String),
    /// The requested mode didn't work, the previous one was restored
    #[error("Mode change was rejected and reverted")]
    ModeReverted,
    /// The render thread failed to set up the CRTC
    #[error("Render thread failed to initialize")]
    InitializationFailed,
    /// The object was removed, or its core dropped
    #[error("The device or connector was removed")]
    Gone,
}

impl From<std::convert::Infallible> for Error {
    fn from(f: std::convert::Infallible) -> Self {
        match f {}
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(e: rustix::io::Errno) -> Self {
        Self::Io(e.into())
    }
}

impl Error {
    /// The raw OS error behind this error, if the backend reported one.
    ///
    /// Page flip and atomic commit fallbacks key off specific errnos, such as
    /// `EINVAL` for rejected async flips.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
