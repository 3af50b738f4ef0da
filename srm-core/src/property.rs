//! Property ids of mode objects, and property blobs

use std::sync::Arc;

use crate::{
    backend::{Kms, PropertyValue},
    error::Result,
};

macro_rules! property_ids {
    ($(#[$meta:meta])* $name:ident { $($field:ident => $prop:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: u32,)*
        }

        impl $name {
            /// Pick out the ids of the properties we know about. A field
            /// stays 0 when the object doesn't have the property.
            pub fn resolve(props: &[PropertyValue]) -> Self {
                let mut ret = Self::default();
                for p in props {
                    match p.name.as_str() {
                        $($prop => ret.$field = p.id,)*
                        _ => (),
                    }
                }
                ret
            }
        }
    };
}

property_ids! {
    /// Connector properties
    ConnectorProps {
        crtc_id => "CRTC_ID",
        dpms => "DPMS",
        edid => "EDID",
        path => "PATH",
        link_status => "link-status",
        non_desktop => "non-desktop",
        content_type => "content type",
        panel_orientation => "panel orientation",
        subconnector => "subconnector",
        vrr_capable => "vrr_capable",
    }
}

property_ids! {
    /// CRTC properties
    CrtcProps {
        active => "ACTIVE",
        gamma_lut => "GAMMA_LUT",
        gamma_lut_size => "GAMMA_LUT_SIZE",
        mode_id => "MODE_ID",
        vrr_enabled => "VRR_ENABLED",
    }
}

property_ids! {
    /// Plane properties
    PlaneProps {
        fb_id => "FB_ID",
        fb_damage_clips => "FB_DAMAGE_CLIPS",
        in_formats => "IN_FORMATS",
        in_fence_fd => "IN_FENCE_FD",
        crtc_id => "CRTC_ID",
        crtc_x => "CRTC_X",
        crtc_y => "CRTC_Y",
        crtc_w => "CRTC_W",
        crtc_h => "CRTC_H",
        src_x => "SRC_X",
        src_y => "SRC_Y",
        src_w => "SRC_W",
        src_h => "SRC_H",
        rotation => "rotation",
        ty => "type",
    }
}

/// Current value of the property called `name`.
pub fn value_of(props: &[PropertyValue], name: &str) -> Option<u64> {
    props.iter().find(|p| p.name == name).map(|p| p.value)
}

/// `DRM_MODE_LINK_STATUS_GOOD`
pub const LINK_STATUS_GOOD: u64 = 0;

/// A kernel property blob, destroyed when dropped.
pub struct PropertyBlob {
    kms: Arc<dyn Kms>,
    id:  u32,
}

impl std::fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyBlob").field("id", &self.id).finish()
    }
}

impl PropertyBlob {
    /// Upload `data` as a new blob.
    pub fn new(kms: &Arc<dyn Kms>, data: &[u8]) -> Result<Self> {
        let id = kms.create_blob(data)?;
        Ok(Self {
            kms: kms.clone(),
            id,
        })
    }

    /// Blob id, as passed to blob properties.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for PropertyBlob {
    fn drop(&mut self) {
        if let Err(e) = self.kms.destroy_blob(self.id) {
            tracing::warn!("Failed to destroy property blob {}: {e}", self.id);
        }
    }
}
