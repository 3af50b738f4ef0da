//! In-memory devices for tests
//!
//! Buffers are backed by memfds, so mapping, exporting and importing work
//! the same way they do with real DMA-BUFs. Every mode setting call is
//! recorded for the tests to inspect.

use std::{
    collections::VecDeque,
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use rustix::io::Errno;

use super::{
    software::SoftwareRenderer, Allocator, BoUsage, BufferObject, ClientCap, CommitFlags,
    ConnectorInfo, CrtcInfo, DeviceNode, DmaData, DriverCap, DumbBuffer, EncoderInfo, FbLayout,
    HotplugEvent, Kms, MapAccess, ModeInfo, ObjectType, OpenedDevice, PageFlipEvent, PlaneInfo,
    Platform, PropertyValue, Renderer, Resources, MODE_TYPE_PREFERRED, PRIME_CAP_EXPORT,
    PRIME_CAP_IMPORT,
};
use crate::{config::Config, core::Core, format, types::Rect};

fn errno(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e.raw_os_error())
}

/// Property names known to the fake kernel, the id of a property is its
/// index plus 1000.
const PROPERTY_NAMES: &[&str] = &[
    "CRTC_ID",
    "DPMS",
    "EDID",
    "PATH",
    "link-status",
    "non-desktop",
    "content type",
    "panel orientation",
    "subconnector",
    "vrr_capable",
    "ACTIVE",
    "GAMMA_LUT",
    "GAMMA_LUT_SIZE",
    "MODE_ID",
    "VRR_ENABLED",
    "FB_ID",
    "FB_DAMAGE_CLIPS",
    "IN_FORMATS",
    "IN_FENCE_FD",
    "CRTC_X",
    "CRTC_Y",
    "CRTC_W",
    "CRTC_H",
    "SRC_X",
    "SRC_Y",
    "SRC_W",
    "SRC_H",
    "rotation",
    "type",
];

pub(crate) fn prop_id(name: &str) -> u32 {
    PROPERTY_NAMES
        .iter()
        .position(|n| *n == name)
        .map(|i| i as u32 + 1000)
        .unwrap_or(0)
}

pub(crate) fn mode(width: u16, height: u16, vrefresh: u32, preferred: bool) -> ModeInfo {
    ModeInfo {
        clock: width as u32 * height as u32 * vrefresh / 1000,
        hdisplay: width,
        hsync_start: width + 8,
        hsync_end: width + 16,
        htotal: width + 32,
        vdisplay: height,
        vsync_start: height + 2,
        vsync_end: height + 4,
        vtotal: height + 8,
        vrefresh,
        ty: if preferred { MODE_TYPE_PREFERRED } else { 0 },
        name: format!("{width}x{height}"),
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeConnector {
    pub kind:      u32,
    pub connected: bool,
    pub modes:     Vec<ModeInfo>,
    pub edid:      Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    SetCrtc { crtc: u32, fb: Option<u32> },
    PageFlip { crtc: u32, fb: u32, flags: CommitFlags },
    SetCursor { crtc: u32, visible: bool },
    MoveCursor { crtc: u32, x: i32, y: i32 },
    SetGamma { crtc: u32, len: usize },
    CreateLease { lessee: u32 },
    RevokeLease { lessee: u32 },
}

#[derive(Default)]
struct KmsState {
    connectors:    Vec<FakeConnector>,
    blobs:         HashMap<u32, Vec<u8>>,
    fbs:           HashSet<u32>,
    dumbs:         HashSet<u32>,
    next_id:       u32,
    /// Successful commits
    commits:       Vec<(Vec<(u32, u32, u64)>, CommitFlags)>,
    attempts:      usize,
    calls:         Vec<Call>,
    flip_events:   HashMap<u32, VecDeque<PageFlipEvent>>,
    sequence:      u32,
    leased:        HashMap<u32, Vec<u32>>,
}

/// A fake KMS device with one encoder, crtc, primary plane and cursor plane
/// per connector. Every encoder and plane can drive every crtc.
pub(crate) struct FakeKms {
    pub crtcs:            usize,
    pub atomic:           AtomicBool,
    pub master:           AtomicBool,
    pub caps:             Mutex<HashMap<DriverCap, u64>>,
    /// Number of upcoming TEST_ONLY commits that fail with EBUSY
    pub busy_tests:       AtomicU32,
    /// Reject async flips with EINVAL
    pub reject_async:     AtomicBool,
    /// Make every mode set fail
    pub fail_modeset:     AtomicBool,
    state:                Mutex<KmsState>,
    flipped:              Condvar,
}

impl FakeKms {
    pub fn new(connectors: Vec<FakeConnector>) -> Self {
        let mut caps = HashMap::new();
        caps.insert(DriverCap::DumbBuffer, 1);
        caps.insert(DriverCap::Prime, PRIME_CAP_IMPORT | PRIME_CAP_EXPORT);
        caps.insert(DriverCap::AddFb2Modifiers, 1);
        caps.insert(DriverCap::AsyncPageFlip, 1);
        caps.insert(DriverCap::AtomicAsyncPageFlip, 1);
        caps.insert(DriverCap::TimestampMonotonic, 1);
        Self {
            crtcs:        connectors.len(),
            atomic:       AtomicBool::new(true),
            master:       AtomicBool::new(true),
            caps:         Mutex::new(caps),
            busy_tests:   AtomicU32::new(0),
            reject_async: AtomicBool::new(false),
            fail_modeset: AtomicBool::new(false),
            state:        Mutex::new(KmsState {
                connectors,
                next_id: 5000,
                ..Default::default()
            }),
            flipped:      Condvar::new(),
        }
    }

    /// A device with `n` connected 64x48 displays.
    pub fn with_connectors(n: usize) -> Self {
        Self::new(
            (0..n)
                .map(|_| FakeConnector {
                    kind:      11,
                    connected: true,
                    modes:     vec![mode(32, 24, 60, false), mode(64, 48, 60, true)],
                    edid:      None,
                })
                .collect(),
        )
    }

    pub fn set_cap(&self, cap: DriverCap, value: u64) {
        self.caps.lock().unwrap().insert(cap, value);
    }

    pub fn set_connected(&self, index: usize, connected: bool) {
        self.state.lock().unwrap().connectors[index].connected = connected;
    }

    pub fn set_edid(&self, index: usize, edid: Option<Vec<u8>>) {
        self.state.lock().unwrap().connectors[index].edid = edid;
    }

    pub fn commits(&self) -> Vec<(Vec<(u32, u32, u64)>, CommitFlags)> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Number of atomic commits tried, including failed ones.
    pub fn commit_attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().unwrap().blobs.len()
    }

    pub fn fb_count(&self) -> usize {
        self.state.lock().unwrap().fbs.len()
    }

    pub fn dumb_count(&self) -> usize {
        self.state.lock().unwrap().dumbs.len()
    }

    pub fn leases(&self) -> HashMap<u32, Vec<u32>> {
        self.state.lock().unwrap().leased.clone()
    }

    /// Value committed last for a property of an object.
    pub fn last_value(&self, object: u32, prop: &str) -> Option<u64> {
        let prop = prop_id(prop);
        let state = self.state.lock().unwrap();
        state
            .commits
            .iter()
            .rev()
            .filter(|(_, flags)| !flags.contains(CommitFlags::TEST_ONLY))
            .flat_map(|(props, _)| props.iter().rev())
            .find(|(o, p, _)| *o == object && *p == prop)
            .map(|(_, _, v)| *v)
    }

    fn queue_flip(&self, state: &mut KmsState, crtc: u32) {
        state.sequence += 1;
        let event = PageFlipEvent {
            crtc,
            sequence: state.sequence,
            time: Duration::from_micros(16_666 * state.sequence as u64),
        };
        state.flip_events.entry(crtc).or_default().push_back(event);
        self.flipped.notify_all();
    }

    fn alloc_id(state: &mut KmsState) -> u32 {
        state.next_id += 1;
        state.next_id
    }
}

impl Kms for FakeKms {
    fn set_client_cap(&self, cap: ClientCap, enable: bool) -> io::Result<()> {
        match cap {
            ClientCap::Atomic if enable && !self.atomic.load(Ordering::Relaxed) =>
                Err(errno(Errno::OPNOTSUPP)),
            ClientCap::Stereo3D | ClientCap::WritebackConnectors => Err(errno(Errno::INVAL)),
            _ => Ok(()),
        }
    }

    fn driver_cap(&self, cap: DriverCap) -> io::Result<u64> {
        Ok(self.caps.lock().unwrap().get(&cap).copied().unwrap_or(0))
    }

    fn is_master(&self) -> bool {
        self.master.load(Ordering::Relaxed)
    }

    fn resources(&self) -> io::Result<Resources> {
        let n = self.state.lock().unwrap().connectors.len() as u32;
        Ok(Resources {
            connectors: (0..n).map(|i| 100 + i).collect(),
            encoders:   (0..n).map(|i| 200 + i).collect(),
            crtcs:      (0..n).map(|i| 300 + i).collect(),
            planes:     (0..n).flat_map(|i| [400 + 2 * i, 401 + 2 * i]).collect(),
        })
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        let state = self.state.lock().unwrap();
        let c = state
            .connectors
            .get((id - 100) as usize)
            .ok_or_else(|| errno(Errno::NOENT))?;
        Ok(ConnectorInfo {
            id,
            kind: c.kind,
            connected: c.connected,
            mm_width: 300,
            mm_height: 200,
            subpixel: 2,
            modes: if c.connected { c.modes.clone() } else { Vec::new() },
            encoders: vec![200 + id - 100],
            current_encoder: None,
        })
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        Ok(EncoderInfo {
            id,
            possible_crtcs: (1u32 << self.crtcs) - 1,
            crtc: None,
        })
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcInfo> {
        Ok(CrtcInfo {
            id,
            gamma_size: 16,
        })
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        Ok(PlaneInfo {
            id,
            possible_crtcs: (1u32 << self.crtcs) - 1,
            formats: vec![format::XRGB8888, format::ARGB8888],
        })
    }

    fn properties(&self, ty: ObjectType, id: u32) -> io::Result<Vec<PropertyValue>> {
        let prop = |name: &str, value: u64| PropertyValue {
            id: prop_id(name),
            name: name.to_owned(),
            value,
        };
        let mut state = self.state.lock().unwrap();
        Ok(match ty {
            ObjectType::Connector => {
                let edid = state
                    .connectors
                    .get((id - 100) as usize)
                    .and_then(|c| c.edid.clone());
                let edid_blob = match edid {
                    Some(edid) => {
                        let blob = Self::alloc_id(&mut state);
                        state.blobs.insert(blob, edid);
                        blob as u64
                    },
                    None => 0,
                };
                vec![
                    prop("CRTC_ID", 0),
                    prop("DPMS", 0),
                    prop("EDID", edid_blob),
                    prop("link-status", 0),
                    prop("non-desktop", 0),
                    prop("content type", 0),
                    prop("some vendor property", 7),
                ]
            },
            ObjectType::Crtc => vec![
                prop("ACTIVE", 0),
                prop("GAMMA_LUT", 0),
                prop("GAMMA_LUT_SIZE", 16),
                prop("MODE_ID", 0),
            ],
            ObjectType::Plane => {
                let kind = if (id - 400) % 2 == 0 { 1 } else { 2 };
                let mut props: Vec<_> = [
                    "FB_ID", "CRTC_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X",
                    "SRC_Y", "SRC_W", "SRC_H",
                ]
                .iter()
                .map(|n| prop(n, 0))
                .collect();
                props.push(prop("type", kind));
                props
            },
        })
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut state = self.state.lock().unwrap();
        let id = Self::alloc_id(&mut state);
        state.blobs.insert(id, data.to_vec());
        Ok(id)
    }

    fn blob(&self, id: u32) -> io::Result<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(&id)
            .cloned()
            .ok_or_else(|| errno(Errno::NOENT))
    }

    fn destroy_blob(&self, id: u32) -> io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| errno(Errno::NOENT))
    }

    fn atomic_commit(&self, props: &[(u32, u32, u64)], flags: CommitFlags) -> io::Result<()> {
        if !self.atomic.load(Ordering::Relaxed) {
            return Err(errno(Errno::OPNOTSUPP))
        }
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if flags.contains(CommitFlags::TEST_ONLY) &&
            self.busy_tests
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(errno(Errno::BUSY))
        }
        if flags.contains(CommitFlags::ALLOW_MODESET) && self.fail_modeset.load(Ordering::Relaxed) {
            return Err(errno(Errno::INVAL))
        }
        if flags.contains(CommitFlags::PAGE_FLIP_ASYNC) && self.reject_async.load(Ordering::Relaxed)
        {
            return Err(errno(Errno::INVAL))
        }
        state.commits.push((props.to_vec(), flags));
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) && !flags.contains(CommitFlags::TEST_ONLY) {
            let crtc_prop = prop_id("CRTC_ID");
            let crtcs: HashSet<u32> = props
                .iter()
                .filter(|(o, p, v)| *p == crtc_prop && *o >= 400 && *v != 0)
                .map(|(_, _, v)| *v as u32)
                .collect();
            for crtc in crtcs {
                self.queue_flip(&mut state, crtc);
            }
        }
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: u32,
        fb: Option<u32>,
        _connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        if mode.is_some() && self.fail_modeset.load(Ordering::Relaxed) {
            return Err(errno(Errno::INVAL))
        }
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::SetCrtc { crtc, fb });
        Ok(())
    }

    fn page_flip(&self, crtc: u32, fb: u32, flags: CommitFlags) -> io::Result<()> {
        if flags.contains(CommitFlags::PAGE_FLIP_ASYNC) && self.reject_async.load(Ordering::Relaxed)
        {
            return Err(errno(Errno::INVAL))
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::PageFlip { crtc, fb, flags });
        self.queue_flip(&mut state, crtc);
        Ok(())
    }

    fn wait_page_flip(&self, crtc: u32, timeout: Duration) -> io::Result<Option<PageFlipEvent>> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .flipped
            .wait_timeout_while(state, timeout, |s| {
                s.flip_events.get(&crtc).map_or(true, |q| q.is_empty())
            })
            .unwrap();
        Ok(state.flip_events.get_mut(&crtc).and_then(|q| q.pop_front()))
    }

    fn set_cursor(&self, crtc: u32, buffer: Option<(u32, u32, u32)>) -> io::Result<()> {
        self.state.lock().unwrap().calls.push(Call::SetCursor {
            crtc,
            visible: buffer.is_some(),
        });
        Ok(())
    }

    fn move_cursor(&self, crtc: u32, x: i32, y: i32) -> io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::MoveCursor { crtc, x, y });
        Ok(())
    }

    fn set_gamma(&self, crtc: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()> {
        if red.len() != green.len() || red.len() != blue.len() {
            return Err(errno(Errno::INVAL))
        }
        self.state.lock().unwrap().calls.push(Call::SetGamma {
            crtc,
            len: red.len(),
        });
        Ok(())
    }

    fn add_fb(&self, layout: &FbLayout) -> io::Result<u32> {
        if layout.width == 0 || layout.height == 0 || layout.planes == 0 {
            return Err(errno(Errno::INVAL))
        }
        let mut state = self.state.lock().unwrap();
        let id = Self::alloc_id(&mut state);
        state.fbs.insert(id);
        Ok(id)
    }

    fn remove_fb(&self, fb: u32) -> io::Result<()> {
        if self.state.lock().unwrap().fbs.remove(&fb) {
            Ok(())
        } else {
            Err(errno(Errno::NOENT))
        }
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_id(&mut state);
        state.dumbs.insert(handle);
        let pitch = width * bpp / 8;
        Ok(DumbBuffer {
            handle,
            width,
            height,
            pitch,
            size: pitch as u64 * height as u64,
        })
    }

    fn map_dumb(&self, dumb: &DumbBuffer) -> io::Result<memmap2::MmapMut> {
        memmap2::MmapOptions::new()
            .len(dumb.size as usize)
            .map_anon()
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        if self.state.lock().unwrap().dumbs.remove(&handle) {
            Ok(())
        } else {
            Err(errno(Errno::NOENT))
        }
    }

    fn prime_import(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::alloc_id(&mut state))
    }

    fn close_handle(&self, _handle: u32) -> io::Result<()> {
        Ok(())
    }

    fn create_lease(&self, objects: &[u32]) -> io::Result<(OwnedFd, u32)> {
        if !self.atomic.load(Ordering::Relaxed) {
            return Err(errno(Errno::OPNOTSUPP))
        }
        let fd = rustix::fs::memfd_create("lease", rustix::fs::MemfdFlags::CLOEXEC)?;
        let mut state = self.state.lock().unwrap();
        let lessee = Self::alloc_id(&mut state);
        state.leased.insert(lessee, objects.to_vec());
        state.calls.push(Call::CreateLease { lessee });
        Ok((fd, lessee))
    }

    fn revoke_lease(&self, lessee_id: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.leased.remove(&lessee_id);
        state.calls.push(Call::RevokeLease { lessee: lessee_id });
        Ok(())
    }
}

/// A buffer object backed by a memfd. Always linear.
pub(crate) struct FakeBo {
    width:  u32,
    height: u32,
    format: u32,
    stride: u32,
    handle: u32,
    fd:     OwnedFd,
    key:    usize,
}

impl FakeBo {
    fn map_all(&self) -> io::Result<memmap2::MmapMut> {
        let len = self.stride as usize * self.height as usize;
        // Safety: the memfd is only shared with other fake mappings.
        unsafe { memmap2::MmapOptions::new().len(len).map_mut(&self.fd) }
    }
}

impl BufferObject for FakeBo {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> u32 {
        self.format
    }

    fn modifier(&self) -> u64 {
        format::MOD_LINEAR
    }

    fn bpp(&self) -> u32 {
        format::depth_bpp(self.format).map_or(32, |(_, bpp)| bpp)
    }

    fn plane_count(&self) -> usize {
        1
    }

    fn handle(&self, _plane: usize) -> u32 {
        self.handle
    }

    fn stride(&self, _plane: usize) -> u32 {
        self.stride
    }

    fn offset(&self, _plane: usize) -> u32 {
        0
    }

    fn export_fd(&self, _plane: usize) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    fn map(
        &self,
        rect: Rect,
        _access: MapAccess,
        f: &mut dyn FnMut(&mut [u8], u32),
    ) -> io::Result<()> {
        let mut map = self.map_all()?;
        let start = rect.y as usize * self.stride as usize + rect.x as usize * (self.bpp() / 8) as usize;
        f(&mut map[start..], self.stride);
        Ok(())
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut map = self.map_all()?;
        let len = data.len().min(map.len());
        map[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn allocator_key(&self) -> usize {
        self.key
    }
}

static NEXT_KEY: AtomicU32 = AtomicU32::new(1);

pub(crate) struct FakeAllocator {
    key:       usize,
    next:      AtomicU32,
    /// Reject allocations that ask for explicit modifiers
    pub no_modifiers: AtomicBool,
    pub allocated: AtomicU32,
}

impl Default for FakeAllocator {
    fn default() -> Self {
        Self {
            key:          NEXT_KEY.fetch_add(1, Ordering::Relaxed) as usize,
            next:         AtomicU32::new(1),
            no_modifiers: AtomicBool::new(false),
            allocated:    AtomicU32::new(0),
        }
    }
}

impl FakeAllocator {
    fn bo(&self, width: u32, height: u32, format: u32, stride: u32, fd: OwnedFd) -> FakeBo {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        FakeBo {
            width,
            height,
            format,
            stride,
            handle: self.next.fetch_add(1, Ordering::Relaxed),
            fd,
            key: self.key,
        }
    }
}

impl Allocator for FakeAllocator {
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[u64],
        _usage: BoUsage,
    ) -> io::Result<Box<dyn BufferObject>> {
        if !modifiers.is_empty() &&
            (self.no_modifiers.load(Ordering::Relaxed) || !modifiers.contains(&format::MOD_LINEAR))
        {
            return Err(errno(Errno::INVAL))
        }
        let (_, bpp) = format::depth_bpp(format).ok_or_else(|| errno(Errno::INVAL))?;
        if width == 0 || height == 0 {
            return Err(errno(Errno::INVAL))
        }
        let stride = (width * bpp / 8 + 63) & !63;
        let fd = rustix::fs::memfd_create("fake-bo", rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, stride as u64 * height as u64)?;
        Ok(Box::new(self.bo(width, height, format, stride, fd)))
    }

    fn import_dma(&self, dma: &DmaData, _usage: BoUsage) -> io::Result<Box<dyn BufferObject>> {
        let [plane] = dma.planes.as_slice() else {
            return Err(errno(Errno::INVAL))
        };
        if plane.offset != 0 {
            return Err(errno(Errno::INVAL))
        }
        let fd = plane.fd.as_fd().try_clone_to_owned()?;
        Ok(Box::new(self.bo(
            dma.width,
            dma.height,
            dma.format,
            plane.stride,
            fd,
        )))
    }

    fn key(&self) -> usize {
        self.key
    }
}

pub(crate) struct FakeGpu {
    pub node:      DeviceNode,
    pub kms:       Arc<FakeKms>,
    pub allocator: Arc<FakeAllocator>,
    pub renderer:  Option<Arc<SoftwareRenderer>>,
    pub fail_open: bool,
}

impl FakeGpu {
    pub fn new(index: u32, connectors: usize) -> Self {
        Self {
            node:      DeviceNode {
                path:     PathBuf::from(format!("/dev/dri/card{index}")),
                boot_vga: index == 0,
            },
            kms:       Arc::new(FakeKms::with_connectors(connectors)),
            allocator: Arc::new(FakeAllocator::default()),
            renderer:  Some(Arc::new(SoftwareRenderer::new())),
            fail_open: false,
        }
    }

    pub fn without_renderer(mut self) -> Self {
        self.renderer = None;
        self
    }
}

#[derive(Default)]
pub(crate) struct FakePlatform {
    pub gpus:   Mutex<Vec<FakeGpu>>,
    pub events: Mutex<VecDeque<HotplugEvent>>,
}

impl FakePlatform {
    pub fn new(gpus: Vec<FakeGpu>) -> Self {
        Self {
            gpus:   Mutex::new(gpus),
            events: Default::default(),
        }
    }

    pub fn kms(&self, index: usize) -> Arc<FakeKms> {
        self.gpus.lock().unwrap()[index].kms.clone()
    }

    pub fn push_event(&self, event: HotplugEvent) {
        self.events.lock().unwrap().push_back(event);
    }
}

impl Platform for FakePlatform {
    fn enumerate(&self) -> io::Result<Vec<DeviceNode>> {
        Ok(self
            .gpus
            .lock()
            .unwrap()
            .iter()
            .map(|g| g.node.clone())
            .collect())
    }

    fn open(&self, node: &DeviceNode) -> io::Result<OpenedDevice> {
        let gpus = self.gpus.lock().unwrap();
        let gpu = gpus
            .iter()
            .find(|g| g.node.path == node.path)
            .ok_or_else(|| errno(Errno::NOENT))?;
        if gpu.fail_open {
            return Err(errno(Errno::ACCESS))
        }
        Ok(OpenedDevice {
            kms:       gpu.kms.clone(),
            allocator: gpu.allocator.clone(),
            renderer:  gpu.renderer.clone().map(|r| r as Arc<dyn Renderer>),
        })
    }

    fn monitor_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn poll_monitor(&self, _timeout: Option<Duration>) -> io::Result<Vec<HotplugEvent>> {
        Ok(self.events.lock().unwrap().drain(..).collect())
    }
}

/// A core over fake GPUs.
pub(crate) fn core(gpus: Vec<FakeGpu>, config: Config) -> (Arc<FakePlatform>, Arc<Core>) {
    let platform = Arc::new(FakePlatform::new(gpus));
    let core = Core::new(platform.clone(), config).unwrap();
    (platform, core)
}
