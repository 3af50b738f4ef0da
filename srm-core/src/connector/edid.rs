//! Monitor identification from EDID blobs

const HEADER: [u8; 8] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];
const BLOCK_SIZE: usize = 128;
const DESCRIPTORS: [usize; 4] = [54, 72, 90, 108];
const TAG_SERIAL: u8 = 0xff;
const TAG_NAME: u8 = 0xfc;

/// Make, model and serial number of a monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Identity {
    pub make:   Option<String>,
    pub model:  Option<String>,
    pub serial: Option<String>,
}

/// The three letter PNP id of the manufacturer, packed as 5 bit letters.
fn pnp_id(edid: &[u8]) -> Option<String> {
    let packed = u16::from_be_bytes([edid[8], edid[9]]);
    let id: String = [10, 5, 0]
        .iter()
        .map(|shift| ((packed >> shift) & 0x1f) as u8)
        .map(|l| (b'@' + l) as char)
        .collect();
    id.chars().all(|c| c.is_ascii_uppercase()).then_some(id)
}

/// Text of the display descriptor tagged `tag`.
fn descriptor_text(edid: &[u8], tag: u8) -> Option<String> {
    DESCRIPTORS.iter().find_map(|&at| {
        let d = &edid[at..at + 18];
        if d[0..3] != [0, 0, 0] || d[3] != tag {
            return None
        }
        let text = &d[5..];
        let end = text.iter().position(|&b| b == b'\n').unwrap_or(text.len());
        let s = String::from_utf8_lossy(&text[..end]).trim().to_owned();
        (!s.is_empty()).then_some(s)
    })
}

/// Parse the base block of an EDID. Returns `None` if it isn't one.
pub(crate) fn parse(edid: &[u8]) -> Option<Identity> {
    if edid.len() < BLOCK_SIZE || edid[..8] != HEADER {
        return None
    }
    let serial = descriptor_text(edid, TAG_SERIAL).or_else(|| {
        let n = u32::from_le_bytes([edid[12], edid[13], edid[14], edid[15]]);
        (n != 0).then(|| n.to_string())
    });
    Some(Identity {
        make: pnp_id(edid),
        model: descriptor_text(edid, TAG_NAME),
        serial,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A minimal EDID for a "DEL" monitor.
    pub(crate) fn sample(model: &str, serial: Option<&str>, numeric_serial: u32) -> Vec<u8> {
        let mut edid = vec![0u8; 128];
        edid[..8].copy_from_slice(&HEADER);
        // D=4 E=5 L=12
        let packed: u16 = (4 << 10) | (5 << 5) | 12;
        edid[8..10].copy_from_slice(&packed.to_be_bytes());
        edid[12..16].copy_from_slice(&numeric_serial.to_le_bytes());
        let mut put = |at: usize, tag: u8, text: &str| {
            edid[at + 3] = tag;
            let mut bytes = [b' '; 13];
            bytes[..text.len()].copy_from_slice(text.as_bytes());
            if text.len() < 13 {
                bytes[text.len()] = b'\n';
            }
            edid[at + 5..at + 18].copy_from_slice(&bytes);
        };
        put(72, TAG_NAME, model);
        if let Some(serial) = serial {
            put(90, TAG_SERIAL, serial);
        }
        edid
    }

    #[test]
    fn full_identity() {
        let id = parse(&sample("U2720Q", Some("ABC123"), 7)).unwrap();
        assert_eq!(id.make.as_deref(), Some("DEL"));
        assert_eq!(id.model.as_deref(), Some("U2720Q"));
        assert_eq!(id.serial.as_deref(), Some("ABC123"));
    }

    #[test]
    fn numeric_serial_fallback() {
        let id = parse(&sample("X", None, 4242)).unwrap();
        assert_eq!(id.serial.as_deref(), Some("4242"));
        assert_eq!(parse(&sample("X", None, 0)).unwrap().serial, None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse(&[0; 128]).is_none());
        assert!(parse(&HEADER).is_none());
    }
}
