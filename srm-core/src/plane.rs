//! Planes

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use crate::{
    backend::{Kms, ObjectType},
    connector::Connector,
    crtc::{crtcs_from_mask, Crtc},
    error::{Error, Result},
    format::{self, FormatList},
    property::{value_of, PlaneProps},
    types::PlaneType,
};

/// A hardware plane.
#[derive(Debug)]
pub struct Plane {
    id:         u32,
    ty:         PlaneType,
    props:      PlaneProps,
    crtcs:      Vec<Arc<Crtc>>,
    in_formats: FormatList,
    connector:  Mutex<Weak<Connector>>,
    leased:     AtomicBool,
}

fn read_u32(blob: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(blob.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(blob: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_ne_bytes(blob.get(at..at + 8)?.try_into().ok()?))
}

/// Parse an `IN_FORMATS` blob, a `struct drm_format_modifier_blob`.
///
/// Each modifier entry carries a 64 bit mask over the format list, starting
/// at the entry's offset.
pub(crate) fn parse_in_formats(blob: &[u8]) -> Option<FormatList> {
    const MODIFIER_SIZE: usize = 24;
    let count_formats = read_u32(blob, 8)? as usize;
    let formats_offset = read_u32(blob, 12)? as usize;
    let count_modifiers = read_u32(blob, 16)? as usize;
    let modifiers_offset = read_u32(blob, 20)? as usize;

    let formats = (0..count_formats)
        .map(|i| read_u32(blob, formats_offset + 4 * i))
        .collect::<Option<Vec<_>>>()?;
    let mut list = FormatList::new();
    for m in 0..count_modifiers {
        let at = modifiers_offset + m * MODIFIER_SIZE;
        let mask = read_u64(blob, at)?;
        let offset = read_u32(blob, at + 8)? as usize;
        let modifier = read_u64(blob, at + 16)?;
        for bit in 0..64 {
            if mask & (1 << bit) == 0 {
                continue
            }
            if let Some(&f) = formats.get(offset + bit) {
                list.add(f, modifier);
            }
        }
    }
    Some(list)
}

impl Plane {
    pub(crate) fn new(
        kms: &dyn Kms,
        id: u32,
        crtcs: &[Arc<Crtc>],
        with_modifiers: bool,
    ) -> Result<Self> {
        let info = kms.plane(id)?;
        let values = kms.properties(ObjectType::Plane, id)?;
        let ty = value_of(&values, "type")
            .and_then(PlaneType::from_raw)
            .ok_or(Error::Unsupported("plane without a valid type property"))?;
        let props = PlaneProps::resolve(&values);

        let mut in_formats = None;
        if with_modifiers {
            match value_of(&values, "IN_FORMATS").filter(|v| *v != 0) {
                Some(blob) => match kms.blob(blob as u32) {
                    Ok(data) => in_formats = parse_in_formats(&data),
                    Err(e) => tracing::warn!("Failed to read IN_FORMATS of plane {id}: {e}"),
                },
                None => tracing::debug!("Plane {id} has no IN_FORMATS property"),
            }
        }
        let in_formats = in_formats.unwrap_or_else(|| {
            info.formats
                .iter()
                .map(|f| format::Format {
                    format:   *f,
                    modifier: format::MOD_INVALID,
                })
                .collect()
        });

        Ok(Self {
            id,
            ty,
            props,
            crtcs: crtcs_from_mask(info.possible_crtcs, crtcs),
            in_formats,
            connector: Mutex::new(Weak::new()),
            leased: AtomicBool::new(false),
        })
    }

    /// Kernel object id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this is a primary, overlay or cursor plane.
    pub fn ty(&self) -> PlaneType {
        self.ty
    }

    /// Property ids of this plane.
    pub fn props(&self) -> &PlaneProps {
        &self.props
    }

    /// CRTCs this plane can be attached to.
    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.crtcs
    }

    /// Whether this plane can be attached to `crtc`.
    pub fn supports_crtc(&self, crtc: &Crtc) -> bool {
        self.crtcs.iter().any(|c| c.id() == crtc.id())
    }

    /// Formats and modifiers this plane can scan out.
    pub fn in_formats(&self) -> &FormatList {
        &self.in_formats
    }

    /// The initialized connector using this plane.
    pub fn current_connector(&self) -> Option<Arc<Connector>> {
        self.connector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    pub(crate) fn set_current_connector(&self, connector: Weak<Connector>) {
        *self.connector.lock().unwrap_or_else(|e| e.into_inner()) = connector;
    }

    /// Whether the plane is part of a lease.
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

    fn blob(formats: &[u32], modifiers: &[(u64, u32, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        let formats_offset = 24u32;
        let modifiers_offset = formats_offset + 4 * formats.len() as u32;
        for v in [
            1,
            0,
            formats.len() as u32,
            formats_offset,
            modifiers.len() as u32,
            modifiers_offset,
        ] {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        for f in formats {
            out.extend_from_slice(&f.to_ne_bytes());
        }
        for (mask, offset, modifier) in modifiers {
            out.extend_from_slice(&mask.to_ne_bytes());
            out.extend_from_slice(&offset.to_ne_bytes());
            out.extend_from_slice(&0u32.to_ne_bytes());
            out.extend_from_slice(&modifier.to_ne_bytes());
        }
        out
    }

    #[test]
    fn in_formats_blob() {
        let data = blob(
            &[format::XRGB8888, format::ARGB8888, format::RGB565],
            &[(0b111, 0, format::MOD_LINEAR), (0b10, 1, 0x0100_0000_0000_0001)],
        );
        let list = parse_in_formats(&data).unwrap();
        assert_eq!(list.len(), 4);
        assert!(list.contains(format::RGB565, format::MOD_LINEAR));
        assert!(list.contains(format::RGB565, 0x0100_0000_0000_0001));
        assert!(!list.contains(format::XRGB8888, 0x0100_0000_0000_0001));

        assert!(parse_in_formats(&data[..10]).is_none());
    }

    #[test]
    fn plane_from_kms() {
        let kms = FakeKms::with_connectors(2);
        let crtcs: Vec<_> = (0..2)
            .map(|i| Arc::new(Crtc::new(&kms, 300 + i as u32, i, true).unwrap()))
            .collect();
        let primary = Plane::new(&kms, 400, &crtcs, true).unwrap();
        assert_eq!(primary.ty(), PlaneType::Primary);
        assert!(primary.supports_crtc(&crtcs[1]));
        // No IN_FORMATS property, so implicit modifiers
        assert!(primary
            .in_formats()
            .contains(format::XRGB8888, format::MOD_INVALID));
        assert_ne!(primary.props().src_w, 0);

        let cursor = Plane::new(&kms, 401, &crtcs, false).unwrap();
        assert_eq!(cursor.ty(), PlaneType::Cursor);
    }
}
