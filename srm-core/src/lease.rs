//! DRM leases
//!
//! A lease hands mode setting objects of a device to another DRM client,
//! typically a VR compositor. Leased objects are skipped when looking for
//! connector configurations until the lease is dropped.

use std::{
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::{Arc, Weak},
};

use crate::{
    connector::Connector,
    crtc::Crtc,
    device::Device,
    encoder::Encoder,
    error::{Error, Result},
    plane::Plane,
    types::PlaneType,
};

/// Objects to lease. Every object must belong to the leasing device.
#[derive(Debug, Default, Clone)]
pub struct LeaseResources {
    /// Connectors to lease, all must be uninitialized
    pub connectors: Vec<Arc<Connector>>,
    /// CRTCs to lease
    pub crtcs:      Vec<Arc<Crtc>>,
    /// Encoders are marked as leased, the kernel infers them from the
    /// connectors.
    pub encoders:   Vec<Arc<Encoder>>,
    /// Planes to lease
    pub planes:     Vec<Arc<Plane>>,
}

impl LeaseResources {
    fn set_leased(&self, leased: bool) {
        self.connectors.iter().for_each(|c| c.set_leased(leased));
        self.crtcs.iter().for_each(|c| c.set_leased(leased));
        self.encoders.iter().for_each(|e| e.set_leased(leased));
        self.planes.iter().for_each(|p| p.set_leased(leased));
    }
}

/// An active lease. Dropping it revokes the lease.
#[derive(Debug)]
pub struct Lease {
    device:    Weak<Device>,
    fd:        OwnedFd,
    lessee_id: u32,
    resources: LeaseResources,
}

impl Lease {
    /// DRM file descriptor to pass to the lessee.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Id of the lessee, as known to the kernel.
    pub fn lessee_id(&self) -> u32 {
        self.lessee_id
    }

    /// The leased objects.
    pub fn resources(&self) -> &LeaseResources {
        &self.resources
    }

    /// The leasing device, `None` once it is removed.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(device) = self.device.upgrade() else {
            tracing::error!("Failed to revoke lease {}, device is gone", self.lessee_id);
            return
        };
        if let Err(e) = device.kms().revoke_lease(self.lessee_id) {
            tracing::warn!("[{}] Failed to revoke lease {}: {e}", device.short_name(), self.lessee_id);
        }
        {
            let _claims = device.lock_claims();
            self.resources.set_leased(false);
        }
        tracing::trace!("[{}] Lease {} revoked", device.short_name(), self.lessee_id);
    }
}

fn owned_by<T>(list: &[Arc<T>], item: &Arc<T>) -> bool {
    list.iter().any(|i| Arc::ptr_eq(i, item))
}

impl Device {
    /// Lease mode setting objects to another client. Only available on
    /// atomic devices.
    ///
    /// Connectors must be uninitialized, every other object unused. None of
    /// them may be leased already. Cursor planes are left out when the
    /// legacy cursor API is forced, as they are driven implicitly then.
    pub fn create_lease(self: &Arc<Self>, mut resources: LeaseResources) -> Result<Lease> {
        if !self.is_atomic() {
            return Err(Error::Unsupported("leases require the atomic API"))
        }
        let legacy_cursor = self
            .core()
            .is_some_and(|c| c.config().force_legacy_cursor);
        // Held until everything is marked, so connectors can't claim any of
        // the objects in between.
        let _claims = self.lock_claims();

        let mut ids = Vec::new();
        for c in &resources.connectors {
            if !owned_by(self.connectors(), c) {
                return Err(Error::InvalidArgument("connector belongs to another device"))
            }
            if c.is_initialized() || c.is_leased() {
                return Err(Error::InvalidArgument("connector is initialized or already leased"))
            }
            ids.push(c.id());
        }
        for c in &resources.crtcs {
            if !owned_by(self.crtcs(), c) {
                return Err(Error::InvalidArgument("crtc belongs to another device"))
            }
            if !c.is_free() {
                return Err(Error::InvalidArgument("crtc is in use or already leased"))
            }
            ids.push(c.id());
        }
        for e in &resources.encoders {
            if !owned_by(self.encoders(), e) {
                return Err(Error::InvalidArgument("encoder belongs to another device"))
            }
            if !e.is_free() {
                return Err(Error::InvalidArgument("encoder is in use or already leased"))
            }
        }
        let mut planes = Vec::with_capacity(resources.planes.len());
        for p in resources.planes.drain(..) {
            if !owned_by(self.planes(), &p) {
                return Err(Error::InvalidArgument("plane belongs to another device"))
            }
            if !p.is_free() {
                return Err(Error::InvalidArgument("plane is in use or already leased"))
            }
            if legacy_cursor && p.ty() == PlaneType::Cursor {
                tracing::warn!(
                    "[{}] Cursor plane {} can't be leased while the legacy cursor is forced, skipping",
                    self.short_name(),
                    p.id()
                );
                continue
            }
            ids.push(p.id());
            planes.push(p);
        }
        resources.planes = planes;

        if ids.is_empty() {
            return Err(Error::InvalidArgument("nothing to lease"))
        }
        let (fd, lessee_id) = self.kms().create_lease(&ids)?;
        resources.set_leased(true);
        tracing::debug!("[{}] Lease {lessee_id} created for {ids:?}", self.short_name());
        Ok(Lease {
            device: Arc::downgrade(self),
            fd,
            lessee_id,
            resources,
        })
    }
}
