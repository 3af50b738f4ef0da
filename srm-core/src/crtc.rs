//! CRTCs, the scanout engines of a device

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use crate::{
    backend::{CrtcInfo, Kms, ObjectType},
    connector::Connector,
    error::Result,
    property::{value_of, CrtcProps},
};

/// A CRTC of a device.
#[derive(Debug)]
pub struct Crtc {
    id:         u32,
    index:      usize,
    props:      CrtcProps,
    gamma_size: u32,
    connector:  Mutex<Weak<Connector>>,
    leased:     AtomicBool,
}

impl Crtc {
    /// Query a CRTC. `index` is its position in the device's CRTC list,
    /// which is what the `possible_crtcs` bitmasks refer to.
    pub(crate) fn new(kms: &dyn Kms, id: u32, index: usize, atomic: bool) -> Result<Self> {
        let info: CrtcInfo = kms.crtc(id)?;
        let props = kms.properties(ObjectType::Crtc, id)?;
        let gamma_size = if atomic {
            value_of(&props, "GAMMA_LUT_SIZE").map_or(0, |v| v as u32)
        } else {
            info.gamma_size
        };
        Ok(Self {
            id,
            index,
            props: CrtcProps::resolve(&props),
            gamma_size,
            connector: Mutex::new(Weak::new()),
            leased: AtomicBool::new(false),
        })
    }

    /// Kernel object id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Position in the device's CRTC list, as used by possible-CRTC masks.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Property ids of this CRTC.
    pub fn props(&self) -> &CrtcProps {
        &self.props
    }

    /// Number of entries per channel of the gamma table.
    pub fn gamma_size(&self) -> u32 {
        self.gamma_size
    }

    /// The connector currently driven by this CRTC.
    pub fn current_connector(&self) -> Option<Arc<Connector>> {
        self.connector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    pub(crate) fn set_current_connector(&self, connector: Weak<Connector>) {
        *self.connector.lock().unwrap_or_else(|e| e.into_inner()) = connector;
    }

    /// Whether the CRTC is part of a lease.
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.leased.store(leased, Ordering::Release);
    }

    /// Neither in use by a connector, nor leased.
    pub fn is_free(&self) -> bool {
        !self.is_leased() && self.current_connector().is_none()
    }
}

/// Resolve a `possible_crtcs` bitmask against the device's CRTC list.
pub(crate) fn crtcs_from_mask(mask: u32, crtcs: &[Arc<Crtc>]) -> Vec<Arc<Crtc>> {
    crtcs
        .iter()
        .filter(|c| c.index < 32 && mask & (1 << c.index) != 0)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeKms;

    #[test]
    fn gamma_size_source() {
        let kms = FakeKms::with_connectors(2);
        let atomic = Crtc::new(&kms, 301, 1, true).unwrap();
        assert_eq!(atomic.gamma_size(), 16);
        assert_ne!(atomic.props().mode_id, 0);
        assert_eq!(atomic.props().vrr_enabled, 0);
        let legacy = Crtc::new(&kms, 301, 1, false).unwrap();
        assert_eq!(legacy.gamma_size(), 16);
        assert!(legacy.is_free());
    }

    #[test]
    fn mask_resolution() {
        let kms = FakeKms::with_connectors(3);
        let crtcs: Vec<_> = (0..3)
            .map(|i| Arc::new(Crtc::new(&kms, 300 + i as u32, i, true).unwrap()))
            .collect();
        let picked = crtcs_from_mask(0b101, &crtcs);
        assert_eq!(picked.iter().map(|c| c.id()).collect::<Vec<_>>(), [300, 302]);
        assert!(crtcs_from_mask(0, &crtcs).is_empty());
    }
}
