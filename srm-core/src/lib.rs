//! Display management for DRM/KMS devices, across every GPU of a machine.
//!
//! A [`Core`](crate::core::Core) opens all GPUs reported by a
//! [`Platform`](crate::backend::Platform). It picks the device that
//! allocates shared buffers, and assigns each device the renderer that draws
//! its frames. A device either renders its own frames, or displays frames
//! rendered by another GPU through PRIME, dumb buffers or a CPU copy.
//!
//! Displays are [`Connector`](crate::connector::Connector)s. Initializing a
//! connector with a [`ConnectorInterface`](crate::connector::ConnectorInterface)
//! claims a CRTC and planes for it, and starts a render thread that calls
//! back into the interface whenever a frame is due.
//!
//! Nothing in this crate talks to the kernel directly, that is the job of
//! the implementations of the [`backend`] traits. See the `srm-drm` crate
//! for the ones backed by libdrm, GBM and udev.

#![warn(
    missing_debug_implementations,
    missing_copy_implementations,
    missing_docs,
    rust_2018_idioms,
    single_use_lifetimes
)]

pub mod atomic;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod connector;
pub mod core;
pub mod crtc;
pub mod device;
pub mod encoder;
pub mod error;
pub mod events;
pub mod format;
pub mod lease;
pub mod mode;
pub mod plane;
pub mod property;
pub mod types;

pub use crate::{
    buffer::Buffer,
    config::Config,
    connector::{Connector, ConnectorInterface, Frame},
    core::Core,
    device::Device,
    error::{Error, Result},
    mode::ConnectorMode,
};
