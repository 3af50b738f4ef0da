//! Display modes of a connector

use std::sync::{Arc, Weak};

use crate::{backend::ModeInfo, connector::Connector};

/// A display mode supported by a connector.
#[derive(Debug)]
pub struct ConnectorMode {
    info:      ModeInfo,
    connector: Weak<Connector>,
}

impl ConnectorMode {
    pub(crate) fn new(info: ModeInfo, connector: Weak<Connector>) -> Self {
        Self { info, connector }
    }

    /// Horizontal resolution.
    pub fn width(&self) -> u32 {
        self.info.hdisplay as u32
    }

    /// Vertical resolution.
    pub fn height(&self) -> u32 {
        self.info.vdisplay as u32
    }

    /// Vertical refresh rate in Hz.
    pub fn refresh_rate(&self) -> u32 {
        self.info.vrefresh
    }

    /// Whether the display prefers this mode.
    pub fn is_preferred(&self) -> bool {
        self.info.is_preferred()
    }

    /// The raw kernel mode.
    pub fn info(&self) -> &ModeInfo {
        &self.info
    }

    /// The connector this mode belongs to.
    pub fn connector(&self) -> Option<Arc<Connector>> {
        self.connector.upgrade()
    }

    /// Duration of one refresh cycle in nanoseconds, 0 if unknown.
    pub(crate) fn period_ns(&self) -> u32 {
        if self.info.vrefresh == 0 {
            0
        } else {
            1_000_000_000 / self.info.vrefresh
        }
    }

    pub(crate) fn belongs_to(&self, connector: &Connector) -> bool {
        std::ptr::eq(self.connector.as_ptr(), connector)
    }
}

impl std::fmt::Display for ConnectorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}@{}{}",
            self.width(),
            self.height(),
            self.refresh_rate(),
            if self.is_preferred() { " (preferred)" } else { "" }
        )
    }
}

/// The mode flagged as preferred, otherwise the one with the largest area.
pub(crate) fn preferred_mode(modes: &[Arc<ConnectorMode>]) -> Option<Arc<ConnectorMode>> {
    modes
        .iter()
        .find(|m| m.is_preferred())
        // max_by_key keeps the last maximum, so search backwards.
        .or_else(|| modes.iter().rev().max_by_key(|m| m.width() * m.height()))
        .cloned()
}
