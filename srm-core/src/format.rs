//! Pixel formats and format/modifier lists
//!
//! Formats are DRM fourcc codes, kept as plain `u32`s so they can be handed to
//! the backends unchanged.

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// `DRM_FORMAT_C8`
pub const C8: u32 = fourcc(b"C8  ");
/// `DRM_FORMAT_RGB332`
pub const RGB332: u32 = fourcc(b"RGB8");
/// `DRM_FORMAT_BGR233`
pub const BGR233: u32 = fourcc(b"BGR8");

/// `DRM_FORMAT_XRGB1555`
pub const XRGB1555: u32 = fourcc(b"XR15");
/// `DRM_FORMAT_XBGR1555`
pub const XBGR1555: u32 = fourcc(b"XB15");
/// `DRM_FORMAT_RGBX5551`
pub const RGBX5551: u32 = fourcc(b"RX15");
/// `DRM_FORMAT_BGRX5551`
pub const BGRX5551: u32 = fourcc(b"BX15");
/// `DRM_FORMAT_ARGB1555`
pub const ARGB1555: u32 = fourcc(b"AR15");
/// `DRM_FORMAT_ABGR1555`
pub const ABGR1555: u32 = fourcc(b"AB15");
/// `DRM_FORMAT_RGBA5551`
pub const RGBA5551: u32 = fourcc(b"RA15");
/// `DRM_FORMAT_BGRA5551`
pub const BGRA5551: u32 = fourcc(b"BA15");

/// `DRM_FORMAT_RGBX4444`
pub const RGBX4444: u32 = fourcc(b"RX12");
/// `DRM_FORMAT_RGBA4444`
pub const RGBA4444: u32 = fourcc(b"RA12");

/// `DRM_FORMAT_RGB565`
pub const RGB565: u32 = fourcc(b"RG16");
/// `DRM_FORMAT_BGR565`
pub const BGR565: u32 = fourcc(b"BG16");

/// `DRM_FORMAT_RGB888`
pub const RGB888: u32 = fourcc(b"RG24");
/// `DRM_FORMAT_BGR888`
pub const BGR888: u32 = fourcc(b"BG24");

/// `DRM_FORMAT_XRGB8888`
pub const XRGB8888: u32 = fourcc(b"XR24");
/// `DRM_FORMAT_XBGR8888`
pub const XBGR8888: u32 = fourcc(b"XB24");
/// `DRM_FORMAT_RGBX8888`
pub const RGBX8888: u32 = fourcc(b"RX24");
/// `DRM_FORMAT_BGRX8888`
pub const BGRX8888: u32 = fourcc(b"BX24");
/// `DRM_FORMAT_ARGB8888`
pub const ARGB8888: u32 = fourcc(b"AR24");
/// `DRM_FORMAT_ABGR8888`
pub const ABGR8888: u32 = fourcc(b"AB24");
/// `DRM_FORMAT_RGBA8888`
pub const RGBA8888: u32 = fourcc(b"RA24");
/// `DRM_FORMAT_BGRA8888`
pub const BGRA8888: u32 = fourcc(b"BA24");

/// `DRM_FORMAT_XRGB2101010`
pub const XRGB2101010: u32 = fourcc(b"XR30");
/// `DRM_FORMAT_XBGR2101010`
pub const XBGR2101010: u32 = fourcc(b"XB30");
/// `DRM_FORMAT_RGBX1010102`
pub const RGBX1010102: u32 = fourcc(b"RX30");
/// `DRM_FORMAT_BGRX1010102`
pub const BGRX1010102: u32 = fourcc(b"BX30");
/// `DRM_FORMAT_ARGB2101010`
pub const ARGB2101010: u32 = fourcc(b"AR30");
/// `DRM_FORMAT_ABGR2101010`
pub const ABGR2101010: u32 = fourcc(b"AB30");
/// `DRM_FORMAT_RGBA1010102`
pub const RGBA1010102: u32 = fourcc(b"RA30");
/// `DRM_FORMAT_BGRA1010102`
pub const BGRA1010102: u32 = fourcc(b"BA30");

/// `DRM_FORMAT_XBGR16161616F`
pub const XBGR16161616F: u32 = fourcc(b"XB4H");
/// `DRM_FORMAT_ABGR16161616F`
pub const ABGR16161616F: u32 = fourcc(b"AB4H");
/// `DRM_FORMAT_XBGR16161616`
pub const XBGR16161616: u32 = fourcc(b"XB48");
/// `DRM_FORMAT_ABGR16161616`
pub const ABGR16161616: u32 = fourcc(b"AB48");

/// Buffer laid out row by row, no tiling
pub const MOD_LINEAR: u64 = 0;
/// The layout is implied by the driver
pub const MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// GL enums used by [`drm_to_gl`]
pub mod gl {
    /// `GL_UNSIGNED_BYTE`
    pub const UNSIGNED_BYTE: u32 = 0x1401;
    /// `GL_UNSIGNED_SHORT`
    pub const UNSIGNED_SHORT: u32 = 0x1403;
    /// `GL_RGB`
    pub const RGB: u32 = 0x1907;
    /// `GL_RGBA`
    pub const RGBA: u32 = 0x1908;
    /// `GL_UNSIGNED_SHORT_4_4_4_4`
    pub const UNSIGNED_SHORT_4_4_4_4: u32 = 0x8033;
    /// `GL_UNSIGNED_SHORT_5_5_5_1`
    pub const UNSIGNED_SHORT_5_5_5_1: u32 = 0x8034;
    /// `GL_UNSIGNED_SHORT_5_6_5`
    pub const UNSIGNED_SHORT_5_6_5: u32 = 0x8363;
    /// `GL_UNSIGNED_INT_2_10_10_10_REV`
    pub const UNSIGNED_INT_2_10_10_10_REV: u32 = 0x8368;
    /// `GL_BGRA_EXT`
    pub const BGRA_EXT: u32 = 0x80E1;
    /// `GL_RGBA16_EXT`
    pub const RGBA16_EXT: u32 = 0x805B;
    /// `GL_HALF_FLOAT_OES`
    pub const HALF_FLOAT_OES: u32 = 0x8D61;
}

/// How a DRM format maps onto a GL texture upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlFormat {
    /// `internalformat` argument of `glTexImage2D`
    pub internal_format: u32,
    /// `format` argument
    pub format:          u32,
    /// `type` argument
    pub ty:              u32,
    /// Whether the alpha channel is meaningful
    pub has_alpha:       bool,
}

const fn glf(internal_format: u32, format: u32, ty: u32, has_alpha: bool) -> GlFormat {
    GlFormat {
        internal_format,
        format,
        ty,
        has_alpha,
    }
}

/// Look up the GL format/type pair used to upload pixels of the given DRM
/// format. Packed 16 bit and wide formats are only mapped on little-endian
/// hosts.
pub fn drm_to_gl(format: u32) -> Option<GlFormat> {
    use gl::*;
    let f = match format {
        ARGB8888 => glf(BGRA_EXT, BGRA_EXT, UNSIGNED_BYTE, true),
        XRGB8888 => glf(BGRA_EXT, BGRA_EXT, UNSIGNED_BYTE, false),
        XBGR8888 => glf(RGBA, RGBA, UNSIGNED_BYTE, false),
        ABGR8888 => glf(RGBA, RGBA, UNSIGNED_BYTE, true),
        BGR888 => glf(RGB, RGB, UNSIGNED_BYTE, false),
        _ if cfg!(target_endian = "little") => match format {
            RGBX4444 => glf(RGBA, RGBA, UNSIGNED_SHORT_4_4_4_4, false),
            RGBA4444 => glf(RGBA, RGBA, UNSIGNED_SHORT_4_4_4_4, true),
            RGBX5551 => glf(RGBA, RGBA, UNSIGNED_SHORT_5_5_5_1, false),
            RGBA5551 => glf(RGBA, RGBA, UNSIGNED_SHORT_5_5_5_1, true),
            RGB565 => glf(RGB, RGB, UNSIGNED_SHORT_5_6_5, false),
            XBGR2101010 => glf(RGBA, RGBA, UNSIGNED_INT_2_10_10_10_REV, false),
            ABGR2101010 => glf(RGBA, RGBA, UNSIGNED_INT_2_10_10_10_REV, true),
            XBGR16161616F => glf(RGBA, RGBA, HALF_FLOAT_OES, false),
            ABGR16161616F => glf(RGBA, RGBA, HALF_FLOAT_OES, true),
            XBGR16161616 => glf(RGBA16_EXT, RGBA, UNSIGNED_SHORT, false),
            ABGR16161616 => glf(RGBA16_EXT, RGBA, UNSIGNED_SHORT, true),
            _ => return None,
        },
        _ => return None,
    };
    Some(f)
}

/// Returns `(depth, bits per pixel)` of single plane RGB formats.
pub fn depth_bpp(format: u32) -> Option<(u32, u32)> {
    Some(match format {
        C8 | RGB332 | BGR233 => (8, 8),
        XRGB1555 | XBGR1555 | RGBX5551 | BGRX5551 | ARGB1555 | ABGR1555 | RGBA5551 |
        BGRA5551 => (15, 16),
        RGB565 | BGR565 => (16, 16),
        RGB888 | BGR888 => (24, 24),
        XRGB8888 | XBGR8888 | RGBX8888 | BGRX8888 => (24, 32),
        XRGB2101010 | XBGR2101010 | RGBX1010102 | BGRX1010102 | ARGB2101010 |
        ABGR2101010 | RGBA1010102 | BGRA1010102 => (30, 32),
        ARGB8888 | ABGR8888 | RGBA8888 | BGRA8888 => (32, 32),
        _ => return None,
    })
}

/// Printable form of a fourcc code, e.g. `XR24`.
pub fn fourcc_name(format: u32) -> String {
    format
        .to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

/// A fourcc plus a layout modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Format {
    /// fourcc
    pub format:   u32,
    /// Layout modifier
    pub modifier: u64,
}

impl Format {
    /// Pair a fourcc with a modifier.
    pub const fn new(format: u32, modifier: u64) -> Self {
        Self { format, modifier }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:0x{:x}", fourcc_name(self.format), self.modifier)
    }
}

/// An ordered set of [`Format`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatList(Vec<Format>);

impl FormatList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the exact format and modifier pair is in the list.
    pub fn contains(&self, format: u32, modifier: u64) -> bool {
        self.0.contains(&Format::new(format, modifier))
    }

    /// Append a format, unless it is already in the list. Returns whether it
    /// was added.
    pub fn add(&mut self, format: u32, modifier: u64) -> bool {
        if self.contains(format, modifier) {
            false
        } else {
            self.0.push(Format::new(format, modifier));
            true
        }
    }

    /// First entry with the given fourcc, regardless of modifier.
    pub fn find_format(&self, format: u32) -> Option<&Format> {
        self.0.iter().find(|f| f.format == format)
    }

    /// First entry of `a` that is also in `b`.
    pub fn first_match<'a>(a: &'a FormatList, b: &FormatList) -> Option<&'a Format> {
        a.0.iter().find(|f| b.contains(f.format, f.modifier))
    }

    /// Entries of `a` that are also in `b`, in the order of `a`.
    pub fn intersect(a: &FormatList, b: &FormatList) -> FormatList {
        FormatList(
            a.0.iter()
                .filter(|f| b.contains(f.format, f.modifier))
                .copied()
                .collect(),
        )
    }

    /// Drop every entry that uses `modifier`. Returns the number removed.
    pub fn remove_modifier(&mut self, modifier: u64) -> usize {
        let before = self.0.len();
        self.0.retain(|f| f.modifier != modifier);
        before - self.0.len()
    }

    /// Distinct fourccs in the list, in order of first appearance.
    pub fn formats(&self) -> Vec<u32> {
        let mut ret = Vec::new();
        for f in &self.0 {
            if !ret.contains(&f.format) {
                ret.push(f.format);
            }
        }
        ret
    }

    /// Modifiers listed for the given fourcc.
    pub fn modifiers(&self, format: u32) -> Vec<u64> {
        self.0
            .iter()
            .filter(|f| f.format == format)
            .map(|f| f.modifier)
            .collect()
    }

    /// Iterate over the entries in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Format> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Format> for FormatList {
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        let mut list = FormatList::new();
        for f in iter {
            list.add(f.format, f.modifier);
        }
        list
    }
}

impl<'a> IntoIterator for &'a FormatList {
    type IntoIter = std::slice::Iter<'a, Format>;
    type Item = &'a Format;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[(u32, u64)]) -> FormatList {
        items.iter().map(|&(f, m)| Format::new(f, m)).collect()
    }

    #[test]
    fn fourcc_codes() {
        assert_eq!(XRGB8888, 0x3432_5258);
        assert_eq!(ARGB8888, 0x3432_5241);
        assert_eq!(fourcc_name(XRGB8888), "XR24");
    }

    #[test]
    fn add_deduplicates() {
        let mut l = FormatList::new();
        assert!(l.add(XRGB8888, MOD_LINEAR));
        assert!(!l.add(XRGB8888, MOD_LINEAR));
        assert!(l.add(XRGB8888, MOD_INVALID));
        assert_eq!(l.len(), 2);
        assert_eq!(l.formats(), vec![XRGB8888]);
    }

    #[test]
    fn intersect_and_first_match() {
        let a = list(&[(ARGB8888, MOD_INVALID), (XRGB8888, MOD_LINEAR), (XBGR8888, 7)]);
        let b = list(&[(XBGR8888, 7), (XRGB8888, MOD_LINEAR)]);
        let i = FormatList::intersect(&a, &b);
        assert_eq!(i, list(&[(XRGB8888, MOD_LINEAR), (XBGR8888, 7)]));
        assert_eq!(
            FormatList::first_match(&a, &b),
            Some(&Format::new(XRGB8888, MOD_LINEAR))
        );
        assert_eq!(FormatList::first_match(&b, &FormatList::new()), None);
    }

    #[test]
    fn remove_invalid_modifier() {
        let mut a = list(&[(ARGB8888, MOD_INVALID), (XRGB8888, MOD_LINEAR), (XRGB8888, MOD_INVALID)]);
        assert_eq!(a.remove_modifier(MOD_INVALID), 2);
        assert_eq!(a, list(&[(XRGB8888, MOD_LINEAR)]));
    }

    #[test]
    fn gl_mapping() {
        assert_eq!(drm_to_gl(ARGB8888).map(|f| f.format), Some(gl::BGRA_EXT));
        assert_eq!(drm_to_gl(XBGR8888).map(|f| f.format), Some(gl::RGBA));
        assert_eq!(drm_to_gl(BGR888).map(|f| f.format), Some(gl::RGB));
        assert_eq!(drm_to_gl(C8), None);
        if cfg!(target_endian = "little") {
            assert_eq!(
                drm_to_gl(ABGR16161616).map(|f| f.internal_format),
                Some(gl::RGBA16_EXT)
            );
        }
    }

    #[test]
    fn depth_and_bpp() {
        assert_eq!(depth_bpp(XRGB8888), Some((24, 32)));
        assert_eq!(depth_bpp(ARGB8888), Some((32, 32)));
        assert_eq!(depth_bpp(RGB565), Some((16, 16)));
        assert_eq!(depth_bpp(ARGB1555), Some((15, 16)));
        assert_eq!(depth_bpp(BGRA1010102), Some((30, 32)));
        assert_eq!(depth_bpp(XBGR16161616F), None);
    }
}
