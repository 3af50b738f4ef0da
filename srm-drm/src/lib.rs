//! Linux backends for `srm-core`
//!
//! [`UdevPlatform`] finds GPUs with udev and opens them. Mode setting goes
//! straight to the DRM ioctls through `drm-ffi` ([`DrmKms`]), buffers are
//! allocated with GBM ([`GbmAllocator`]).
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let platform = srm_drm::UdevPlatform::new()?;
//! let core = srm_core::Core::new(Arc::new(platform), srm_core::Config::from_env())?;
//! for device in core.devices() {
//!     println!("{}", device.name().display());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, single_use_lifetimes)]

pub mod allocator;
pub mod kms;
pub mod platform;

pub use self::{allocator::GbmAllocator, kms::DrmKms, platform::UdevPlatform};
