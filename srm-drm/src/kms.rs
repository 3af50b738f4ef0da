//! Mode setting through the DRM ioctls

use std::{
    collections::VecDeque,
    ffi::c_char,
    io,
    os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use drm::control::Device as _;
use drm_ffi as ffi;
use hashbrown::HashMap;
use rustix::event::{poll, PollFd, PollFlags};
use srm_core::backend::{
    ClientCap, CommitFlags, ConnectorInfo, CrtcInfo, DriverCap, DumbBuffer, EncoderInfo, FbLayout,
    Kms, ModeInfo, ObjectType, PageFlipEvent, PlaneInfo, PropertyValue, Resources,
};
use tracing::{debug, trace, warn};

const DRM_CAP_ATOMIC_ASYNC_PAGE_FLIP: u64 = 0x15;
const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

/// The card fd, so that the event parser of the `drm` crate can be used on
/// it.
#[derive(Debug)]
struct Card(OwnedFd);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl drm::control::Device for Card {}

/// Flip events read from the fd but not yet claimed by their crtc.
#[derive(Debug, Default)]
struct FlipQueue {
    pending: HashMap<u32, VecDeque<PageFlipEvent>>,
    reading: bool,
}

/// [`Kms`] implementation for a DRM primary node.
///
/// Any render thread may end up reading the event queue of the fd. Events for
/// other crtcs are queued and their threads woken up.
#[derive(Debug)]
pub struct DrmKms {
    card:       Card,
    flips:      Mutex<FlipQueue>,
    flipped:    Condvar,
    prop_names: Mutex<HashMap<u32, String>>,
}

fn c_str(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn mode_from_raw(raw: &ffi::drm_mode_modeinfo) -> ModeInfo {
    ModeInfo {
        clock:       raw.clock,
        hdisplay:    raw.hdisplay,
        hsync_start: raw.hsync_start,
        hsync_end:   raw.hsync_end,
        htotal:      raw.htotal,
        hskew:       raw.hskew,
        vdisplay:    raw.vdisplay,
        vsync_start: raw.vsync_start,
        vsync_end:   raw.vsync_end,
        vtotal:      raw.vtotal,
        vscan:       raw.vscan,
        vrefresh:    raw.vrefresh,
        flags:       raw.flags,
        ty:          raw.type_,
        name:        c_str(&raw.name),
    }
}

fn mode_to_raw(mode: &ModeInfo) -> ffi::drm_mode_modeinfo {
    let mut name = [0 as c_char; 32];
    for (dst, src) in name.iter_mut().zip(mode.name.bytes().take(31)) {
        *dst = src as c_char;
    }
    ffi::drm_mode_modeinfo {
        clock: mode.clock,
        hdisplay: mode.hdisplay,
        hsync_start: mode.hsync_start,
        hsync_end: mode.hsync_end,
        htotal: mode.htotal,
        hskew: mode.hskew,
        vdisplay: mode.vdisplay,
        vsync_start: mode.vsync_start,
        vsync_end: mode.vsync_end,
        vtotal: mode.vtotal,
        vscan: mode.vscan,
        vrefresh: mode.vrefresh,
        flags: mode.flags,
        type_: mode.ty,
        name,
    }
}

fn object_type(ty: ObjectType) -> u32 {
    match ty {
        ObjectType::Connector => ffi::DRM_MODE_OBJECT_CONNECTOR as u32,
        ObjectType::Crtc => ffi::DRM_MODE_OBJECT_CRTC as u32,
        ObjectType::Plane => ffi::DRM_MODE_OBJECT_PLANE as u32,
    }
}

/// Split `(object, property, value)` triples into the arrays of
/// `DRM_IOCTL_MODE_ATOMIC`. Properties of one object have to be adjacent.
fn atomic_arrays(props: &[(u32, u32, u64)]) -> (Vec<u32>, Vec<u32>, Vec<u32>, Vec<u64>) {
    let mut grouped: Vec<(u32, Vec<(u32, u64)>)> = Vec::new();
    for &(obj, prop, value) in props {
        match grouped.iter_mut().find(|(o, _)| *o == obj) {
            Some((_, list)) => list.push((prop, value)),
            None => grouped.push((obj, vec![(prop, value)])),
        }
    }
    let mut objs = Vec::with_capacity(grouped.len());
    let mut counts = Vec::with_capacity(grouped.len());
    let mut ids = Vec::with_capacity(props.len());
    let mut values = Vec::with_capacity(props.len());
    for (obj, list) in grouped {
        objs.push(obj);
        counts.push(list.len() as u32);
        for (prop, value) in list {
            ids.push(prop);
            values.push(value);
        }
    }
    (objs, counts, ids, values)
}

impl DrmKms {
    /// Take over an opened DRM node.
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            card:       Card(fd),
            flips:      Default::default(),
            flipped:    Condvar::new(),
            prop_names: Default::default(),
        }
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }

    fn lock_flips(&self) -> MutexGuard<'_, FlipQueue> {
        self.flips.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn property_name(&self, id: u32) -> io::Result<String> {
        if let Some(name) = self
            .prop_names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            return Ok(name.clone())
        }
        let raw = ffi::mode::get_property(self.fd(), id, None, None)?;
        let name = c_str(&raw.name);
        self.prop_names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, name.clone());
        Ok(name)
    }

    /// Read whatever events are pending on the fd and queue the flips.
    /// Returns false if nothing arrived before `timeout`.
    fn read_events(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [PollFd::new(&self.card, PollFlags::IN)];
        let ms = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
        match poll(&mut fds, ms) {
            Ok(0) | Err(rustix::io::Errno::INTR) => return Ok(false),
            Ok(_) => (),
            Err(e) => return Err(e.into()),
        }
        let events = self.card.receive_events()?;
        let mut flips = self.lock_flips();
        for event in events {
            match event {
                drm::control::Event::PageFlip(e) => {
                    let crtc = u32::from(e.crtc);
                    trace!(crtc, sequence = e.frame, "Page flip event");
                    flips.pending.entry(crtc).or_default().push_back(PageFlipEvent {
                        crtc,
                        sequence: e.frame,
                        time: e.duration,
                    });
                },
                drm::control::Event::Vblank(_) => (),
                drm::control::Event::Unknown(raw) => {
                    trace!(len = raw.len(), "Ignoring unknown DRM event")
                },
            }
        }
        Ok(true)
    }
}

impl Kms for DrmKms {
    fn set_client_cap(&self, cap: ClientCap, enable: bool) -> io::Result<()> {
        let raw = match cap {
            ClientCap::Stereo3D => ffi::DRM_CLIENT_CAP_STEREO_3D,
            ClientCap::UniversalPlanes => ffi::DRM_CLIENT_CAP_UNIVERSAL_PLANES,
            ClientCap::Atomic => ffi::DRM_CLIENT_CAP_ATOMIC,
            ClientCap::AspectRatio => ffi::DRM_CLIENT_CAP_ASPECT_RATIO,
            ClientCap::WritebackConnectors => ffi::DRM_CLIENT_CAP_WRITEBACK_CONNECTORS,
        };
        ffi::set_capability(self.fd(), raw as u64, enable)?;
        Ok(())
    }

    fn driver_cap(&self, cap: DriverCap) -> io::Result<u64> {
        let raw = match cap {
            DriverCap::DumbBuffer => ffi::DRM_CAP_DUMB_BUFFER as u64,
            DriverCap::Prime => ffi::DRM_CAP_PRIME as u64,
            DriverCap::AddFb2Modifiers => ffi::DRM_CAP_ADDFB2_MODIFIERS as u64,
            DriverCap::AsyncPageFlip => ffi::DRM_CAP_ASYNC_PAGE_FLIP as u64,
            DriverCap::AtomicAsyncPageFlip => DRM_CAP_ATOMIC_ASYNC_PAGE_FLIP,
            DriverCap::TimestampMonotonic => ffi::DRM_CAP_TIMESTAMP_MONOTONIC as u64,
        };
        Ok(ffi::get_capability(self.fd(), raw)?.value)
    }

    fn is_master(&self) -> bool {
        // Authenticating magic 0 fails with EACCES for non-masters and EINVAL
        // for masters.
        match ffi::auth::auth_magic_token(self.fd(), 0) {
            Ok(_) => true,
            Err(e) => e.raw_os_error() != Some(libc::EACCES),
        }
    }

    fn resources(&self) -> io::Result<Resources> {
        let mut res = Resources::default();
        ffi::mode::get_resources(
            self.fd(),
            None,
            Some(&mut res.crtcs),
            Some(&mut res.connectors),
            Some(&mut res.encoders),
        )?;
        ffi::mode::get_plane_resources(self.fd(), Some(&mut res.planes))?;
        Ok(res)
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        let mut modes = Vec::new();
        let mut encoders = Vec::new();
        let raw = ffi::mode::get_connector(
            self.fd(),
            id,
            None,
            None,
            Some(&mut modes),
            Some(&mut encoders),
            true,
        )?;
        Ok(ConnectorInfo {
            id,
            kind: raw.connector_type,
            connected: raw.connection == 1,
            mm_width: raw.mm_width,
            mm_height: raw.mm_height,
            subpixel: raw.subpixel,
            modes: modes.iter().map(mode_from_raw).collect(),
            encoders,
            current_encoder: (raw.encoder_id != 0).then_some(raw.encoder_id),
        })
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        let raw = ffi::mode::get_encoder(self.fd(), id)?;
        Ok(EncoderInfo {
            id,
            possible_crtcs: raw.possible_crtcs,
            crtc: (raw.crtc_id != 0).then_some(raw.crtc_id),
        })
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcInfo> {
        let raw = ffi::mode::get_crtc(self.fd(), id)?;
        Ok(CrtcInfo {
            id,
            gamma_size: raw.gamma_size,
        })
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        let mut formats = Vec::new();
        let raw = ffi::mode::get_plane(self.fd(), id, Some(&mut formats))?;
        Ok(PlaneInfo {
            id,
            possible_crtcs: raw.possible_crtcs,
            formats,
        })
    }

    fn properties(&self, ty: ObjectType, id: u32) -> io::Result<Vec<PropertyValue>> {
        let mut ids = Vec::new();
        let mut values = Vec::new();
        ffi::mode::get_properties(
            self.fd(),
            id,
            object_type(ty),
            Some(&mut ids),
            Some(&mut values),
        )?;
        ids.into_iter()
            .zip(values)
            .map(|(id, value)| {
                Ok(PropertyValue {
                    id,
                    name: self.property_name(id)?,
                    value,
                })
            })
            .collect()
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut data = data.to_vec();
        Ok(ffi::mode::create_property_blob(self.fd(), &mut data)?.blob_id)
    }

    fn blob(&self, id: u32) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        ffi::mode::get_property_blob(self.fd(), id, Some(&mut data))?;
        Ok(data)
    }

    fn destroy_blob(&self, id: u32) -> io::Result<()> {
        ffi::mode::destroy_property_blob(self.fd(), id)?;
        Ok(())
    }

    fn atomic_commit(&self, props: &[(u32, u32, u64)], flags: CommitFlags) -> io::Result<()> {
        let (mut objs, mut counts, mut ids, mut values) = atomic_arrays(props);
        ffi::mode::atomic_commit(
            self.fd(),
            flags.bits(),
            &mut objs,
            &mut counts,
            &mut ids,
            &mut values,
        )
        .map_err(|e| {
            if !flags.contains(CommitFlags::TEST_ONLY) {
                debug!(?flags, objects = objs.len(), "Atomic commit failed: {e}");
            }
            e
        })
    }

    fn set_crtc(
        &self,
        crtc: u32,
        fb: Option<u32>,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        ffi::mode::set_crtc(
            self.fd(),
            crtc,
            fb.unwrap_or(0),
            0,
            0,
            connectors,
            mode.map(mode_to_raw),
        )?;
        Ok(())
    }

    fn page_flip(&self, crtc: u32, fb: u32, flags: CommitFlags) -> io::Result<()> {
        let flags = flags | CommitFlags::PAGE_FLIP_EVENT;
        ffi::mode::page_flip(self.fd(), crtc, fb, flags.bits(), 0)
    }

    fn wait_page_flip(&self, crtc: u32, timeout: Duration) -> io::Result<Option<PageFlipEvent>> {
        let deadline = Instant::now() + timeout;
        let mut flips = self.lock_flips();
        loop {
            if let Some(event) = flips.pending.get_mut(&crtc).and_then(|q| q.pop_front()) {
                return Ok(Some(event))
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None)
            }
            let remaining = deadline - now;
            if flips.reading {
                // Another thread is reading the fd, it wakes us up once it
                // queued something.
                flips = self
                    .flipped
                    .wait_timeout(flips, remaining)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
                continue
            }
            flips.reading = true;
            drop(flips);
            let result = self.read_events(remaining);
            flips = self.lock_flips();
            flips.reading = false;
            self.flipped.notify_all();
            if let Err(e) = result {
                warn!(crtc, "Failed to read DRM events: {e}");
                return Err(e)
            }
        }
    }

    fn set_cursor(&self, crtc: u32, buffer: Option<(u32, u32, u32)>) -> io::Result<()> {
        let (handle, width, height) = buffer.unwrap_or((0, 0, 0));
        #[allow(deprecated)]
        ffi::mode::set_cursor(self.fd(), crtc, handle, width, height)?;
        Ok(())
    }

    fn move_cursor(&self, crtc: u32, x: i32, y: i32) -> io::Result<()> {
        #[allow(deprecated)]
        ffi::mode::move_cursor(self.fd(), crtc, x, y)?;
        Ok(())
    }

    fn set_gamma(&self, crtc: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()> {
        if red.len() != green.len() || red.len() != blue.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
        ffi::mode::set_gamma(self.fd(), crtc, red.len(), red, green, blue)?;
        Ok(())
    }

    fn add_fb(&self, layout: &FbLayout) -> io::Result<u32> {
        let mut modifiers = [0u64; 4];
        let mut flags = 0;
        if let Some(modifier) = layout.modifier {
            flags |= DRM_MODE_FB_MODIFIERS;
            modifiers[..layout.planes].fill(modifier);
        }
        let fb = ffi::mode::add_fb2(
            self.fd(),
            layout.width,
            layout.height,
            layout.format,
            &layout.handles,
            &layout.pitches,
            &layout.offsets,
            &modifiers,
            flags,
        )?;
        Ok(fb.fb_id)
    }

    fn remove_fb(&self, fb: u32) -> io::Result<()> {
        ffi::mode::rm_fb(self.fd(), fb)
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer> {
        let raw = ffi::mode::dumbbuffer::create(self.fd(), width, height, bpp, 0)?;
        Ok(DumbBuffer {
            handle: raw.handle,
            width,
            height,
            pitch: raw.pitch,
            size: raw.size,
        })
    }

    fn map_dumb(&self, dumb: &DumbBuffer) -> io::Result<memmap2::MmapMut> {
        let map = ffi::mode::dumbbuffer::map(self.fd(), dumb.handle, 0, 0)?;
        // Safety: the dumb buffer stays alive until the mapping is dropped,
        // the kernel keeps the pages around even if it is destroyed early.
        unsafe {
            memmap2::MmapOptions::new()
                .offset(map.offset)
                .len(dumb.size as usize)
                .map_mut(&self.card.0)
        }
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        ffi::mode::dumbbuffer::destroy(self.fd(), handle)?;
        Ok(())
    }

    fn prime_import(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        Ok(ffi::gem::fd_to_handle(self.fd(), fd)?.handle)
    }

    fn close_handle(&self, handle: u32) -> io::Result<()> {
        ffi::gem::close(self.fd(), handle)?;
        Ok(())
    }

    fn create_lease(&self, objects: &[u32]) -> io::Result<(OwnedFd, u32)> {
        let lease = ffi::mode::create_lease(self.fd(), objects, libc::O_CLOEXEC as u32)?;
        // Safety: the kernel handed us a new fd that nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(lease.fd as RawFd) };
        debug!(lessee = lease.lessee_id, objects = objects.len(), "Created lease");
        Ok((fd, lease.lessee_id))
    }

    fn revoke_lease(&self, lessee_id: u32) -> io::Result<()> {
        ffi::mode::revoke_lease(self.fd(), lessee_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_arrays_group_by_object() {
        let (objs, counts, ids, values) =
            atomic_arrays(&[(10, 1, 100), (20, 2, 200), (10, 3, 300)]);
        assert_eq!(objs, [10, 20]);
        assert_eq!(counts, [2, 1]);
        assert_eq!(ids, [1, 3, 2]);
        assert_eq!(values, [100, 300, 200]);
    }

    #[test]
    fn mode_names_are_truncated() {
        let mode = ModeInfo {
            hdisplay: 1920,
            vdisplay: 1080,
            vrefresh: 60,
            name: "x".repeat(40),
            ..Default::default()
        };
        let raw = mode_to_raw(&mode);
        assert_eq!(raw.name[31], 0);
        let back = mode_from_raw(&raw);
        assert_eq!(back.name.len(), 31);
        assert_eq!((back.hdisplay, back.vdisplay, back.vrefresh), (1920, 1080, 60));
    }
}
