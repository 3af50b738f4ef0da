//! Encoders

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use crate::{
    backend::Kms,
    connector::Connector,
    crtc::{crtcs_from_mask, Crtc},
    error::Result,
};

/// Routes a CRTC's output to connectors.
#[derive(Debug)]
pub struct Encoder {
    id:        u32,
    crtcs:     Vec<Arc<Crtc>>,
    connector: Mutex<Weak<Connector>>,
    leased:    AtomicBool,
}

impl Encoder {
    pub(crate) fn new(kms: &dyn Kms, id: u32, crtcs: &[Arc<Crtc>]) -> Result<Self> {
        let info = kms.encoder(id)?;
        Ok(Self {
            id,
            crtcs: crtcs_from_mask(info.possible_crtcs, crtcs),
            connector: Mutex::new(Weak::new()),
            leased: AtomicBool::new(false),
        })
    }

    /// Kernel object id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// CRTCs this encoder can be driven by.
    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.crtcs
    }

    /// The initialized connector using this encoder.
    pub fn current_connector(&self) -> Option<Arc<Connector>> {
        self.connector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    pub(crate) fn set_current_connector(&self, connector: Weak<Connector>) {
        *self.connector.lock().unwrap_or_else(|e| e.into_inner()) = connector;
    }

    /// Whether the encoder is part of a lease.
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.leased.store(leased, Ordering::Release);
    }

    /// Neither leased nor in use.
    pub fn is_free(&self) -> bool {
        !self.is_leased() && self.current_connector().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeKms;

    #[test]
    fn encoder_crtcs() {
        let kms = FakeKms::with_connectors(2);
        let crtcs: Vec<_> = (0..2)
            .map(|i| Arc::new(Crtc::new(&kms, 300 + i as u32, i, true).unwrap()))
            .collect();
        let encoder = Encoder::new(&kms, 200, &crtcs).unwrap();
        assert_eq!(encoder.crtcs().len(), 2);
        assert!(encoder.is_free());
        encoder.set_leased(true);
        assert!(!encoder.is_free());
    }
}
