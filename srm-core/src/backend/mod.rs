//! Interfaces to the kernel and the GPU
//!
//! The display logic in this crate never talks to the kernel directly. It goes
//! through the traits defined here instead:
//!
//!   * [`Platform`] discovers DRM devices and reports hotplug events,
//!   * [`Kms`] is the mode setting interface of one opened device,
//!   * [`Allocator`] allocates [`BufferObject`]s on a device,
//!   * [`Renderer`] is the graphics API used to sample from and draw into
//!     buffers.
//!
//! A real implementation backed by libdrm, GBM and udev lives in the `srm-drm`
//! crate. [`software`] provides a CPU renderer that works with any allocator
//! whose buffers can be mapped.

use std::{
    io,
    os::fd::{BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    format::{FormatList, GlFormat},
    types::Rect,
};

#[cfg(test)]
pub(crate) mod fake;
pub mod software;

/// A DRM device node found by the [`Platform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Path of the primary node, e.g. `/dev/dri/card0`
    pub path:     PathBuf,
    /// Whether the firmware used this GPU to boot
    pub boot_vga: bool,
}

/// Changes reported by the device monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A GPU was added
    Added(DeviceNode),
    /// A GPU was removed
    Removed(PathBuf),
    /// Something about the connectors of a GPU changed
    Changed(PathBuf),
}

impl HotplugEvent {
    /// Path of the device the event is about.
    pub fn path(&self) -> &Path {
        match self {
            Self::Added(node) => &node.path,
            Self::Removed(path) | Self::Changed(path) => path,
        }
    }
}

/// Everything needed to drive one opened device.
#[derive(Clone)]
pub struct OpenedDevice {
    /// Mode setting interface
    pub kms:       Arc<dyn Kms>,
    /// Buffer allocation
    pub allocator: Arc<dyn Allocator>,
    /// Graphics API bound to this device. Devices without one can still scan
    /// out frames rendered by another device.
    pub renderer:  Option<Arc<dyn Renderer>>,
}

impl std::fmt::Debug for OpenedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedDevice")
            .field("has_renderer", &self.renderer.is_some())
            .finish_non_exhaustive()
    }
}

/// Device discovery and hotplug monitoring.
pub trait Platform: Send + Sync {
    /// List the primary nodes of all GPUs currently present.
    fn enumerate(&self) -> io::Result<Vec<DeviceNode>>;
    /// Open a device.
    fn open(&self, node: &DeviceNode) -> io::Result<OpenedDevice>;
    /// A file descriptor that becomes readable when hotplug events are
    /// pending. Embedders can add it to their own event loop.
    fn monitor_fd(&self) -> Option<BorrowedFd<'_>>;
    /// Wait up to `timeout` for hotplug events, `None` waits forever.
    fn poll_monitor(&self, timeout: Option<Duration>) -> io::Result<Vec<HotplugEvent>>;
}

/// `DRM_CLIENT_CAP_*` capabilities a client can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientCap {
    /// Stereoscopic 3D modes
    Stereo3D,
    /// Expose every plane, not only overlays
    UniversalPlanes,
    /// Atomic mode setting, implies universal planes
    Atomic,
    /// Aspect ratio flags in modes
    AspectRatio,
    /// Writeback connectors
    WritebackConnectors,
}

/// `DRM_CAP_*` capabilities reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCap {
    /// Dumb buffers can be created
    DumbBuffer,
    /// Bitmask of [`PRIME_CAP_IMPORT`] and [`PRIME_CAP_EXPORT`]
    Prime,
    /// AddFB2 accepts explicit modifiers
    AddFb2Modifiers,
    /// Legacy page flips can be asynchronous
    AsyncPageFlip,
    /// Atomic commits can flip asynchronously
    AtomicAsyncPageFlip,
    /// Flip timestamps are on the monotonic clock
    TimestampMonotonic,
}

/// The device can import DMA-BUFs.
pub const PRIME_CAP_IMPORT: u64 = 1;
/// The device can export DMA-BUFs.
pub const PRIME_CAP_EXPORT: u64 = 2;

/// Kinds of mode objects that carry properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// A connector
    Connector,
    /// A CRTC
    Crtc,
    /// A plane
    Plane,
}

/// Ids of the mode objects of a device, in kernel order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    /// Connector ids
    pub connectors: Vec<u32>,
    /// Encoder ids
    pub encoders:   Vec<u32>,
    /// CRTC ids
    pub crtcs:      Vec<u32>,
    /// Plane ids
    pub planes:     Vec<u32>,
}

/// A display mode, laid out like the kernel's `drm_mode_modeinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModeInfo {
    /// Pixel clock in kHz
    pub clock:       u32,
    /// Visible width
    pub hdisplay:    u16,
    /// Horizontal sync start
    pub hsync_start: u16,
    /// Horizontal sync end
    pub hsync_end:   u16,
    /// Horizontal total
    pub htotal:      u16,
    /// Horizontal skew
    pub hskew:       u16,
    /// Visible height
    pub vdisplay:    u16,
    /// Vertical sync start
    pub vsync_start: u16,
    /// Vertical sync end
    pub vsync_end:   u16,
    /// Vertical total
    pub vtotal:      u16,
    /// Vertical scan
    pub vscan:       u16,
    /// Refresh rate in Hz
    pub vrefresh:    u32,
    /// `DRM_MODE_FLAG_*`
    pub flags:       u32,
    /// `DRM_MODE_TYPE_*`
    pub ty:          u32,
    /// Mode name, at most 31 bytes reach the kernel
    pub name:        String,
}

/// `DRM_MODE_TYPE_PREFERRED`
pub const MODE_TYPE_PREFERRED: u32 = 1 << 3;

impl ModeInfo {
    /// Whether the driver marked this mode as preferred.
    pub fn is_preferred(&self) -> bool {
        self.ty & MODE_TYPE_PREFERRED != 0
    }

    /// Serialize into the kernel's `drm_mode_modeinfo` layout, as expected
    /// by the `MODE_ID` property blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(68);
        out.extend_from_slice(&self.clock.to_ne_bytes());
        for v in [
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.hskew,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.vscan,
        ] {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        out.extend_from_slice(&self.vrefresh.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.ty.to_ne_bytes());
        let mut name = [0u8; 32];
        let len = self.name.len().min(31);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        out.extend_from_slice(&name);
        out
    }
}

/// State of a connector as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectorInfo {
    /// Object id
    pub id:              u32,
    /// `DRM_MODE_CONNECTOR_*`
    pub kind:            u32,
    /// Whether a display is plugged in
    pub connected:       bool,
    /// Physical width in millimeters
    pub mm_width:        u32,
    /// Physical height in millimeters
    pub mm_height:       u32,
    /// `DRM_MODE_SUBPIXEL_*`
    pub subpixel:        u32,
    /// Supported modes
    pub modes:           Vec<ModeInfo>,
    /// Ids of the encoders that can drive this connector
    pub encoders:        Vec<u32>,
    /// Encoder currently attached
    pub current_encoder: Option<u32>,
}

/// State of an encoder as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncoderInfo {
    /// Object id
    pub id:             u32,
    /// Bitmask over the device's crtcs, in kernel order
    pub possible_crtcs: u32,
    /// CRTC currently attached
    pub crtc:           Option<u32>,
}

/// State of a CRTC as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CrtcInfo {
    /// Object id
    pub id:         u32,
    /// Size of the legacy gamma table
    pub gamma_size: u32,
}

/// State of a plane as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaneInfo {
    /// Object id
    pub id:             u32,
    /// Bitmask over the device's crtcs, in kernel order
    pub possible_crtcs: u32,
    /// Formats supported with implicit modifiers
    pub formats:        Vec<u32>,
}

/// A property of a mode object and its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    /// Property id
    pub id:    u32,
    /// Property name
    pub name:  String,
    /// Current value
    pub value: u64,
}

bitflags::bitflags! {
    /// `DRM_MODE_PAGE_FLIP_*` and `DRM_MODE_ATOMIC_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommitFlags: u32 {
        /// Deliver a page flip event when the commit completes
        const PAGE_FLIP_EVENT = 0x01;
        /// Flip without waiting for vblank
        const PAGE_FLIP_ASYNC = 0x02;
        /// Only check whether the commit would succeed
        const TEST_ONLY = 0x0100;
        /// Return before the commit completes
        const NONBLOCK = 0x0200;
        /// The commit may change modes
        const ALLOW_MODESET = 0x0400;
    }
}

/// A completed page flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlipEvent {
    /// CRTC that flipped
    pub crtc:     u32,
    /// vblank sequence number
    pub sequence: u32,
    /// Flip timestamp
    pub time:     Duration,
}

/// Layout of a framebuffer to be registered with [`Kms::add_fb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FbLayout {
    /// Width in pixels
    pub width:    u32,
    /// Height in pixels
    pub height:   u32,
    /// fourcc
    pub format:   u32,
    /// Explicit modifier, only honored when the device supports
    /// AddFB2 modifiers
    pub modifier: Option<u64>,
    /// Number of planes used
    pub planes:   usize,
    /// GEM handles
    pub handles:  [u32; 4],
    /// Pitches in bytes
    pub pitches:  [u32; 4],
    /// Plane offsets in bytes
    pub offsets:  [u32; 4],
}

/// A dumb buffer, created by the kernel for CPU rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    /// GEM handle
    pub handle: u32,
    /// Width in pixels
    pub width:  u32,
    /// Height in pixels
    pub height: u32,
    /// Row pitch in bytes
    pub pitch:  u32,
    /// Size in bytes
    pub size:   u64,
}

/// Mode setting interface of a single device.
///
/// All methods take `&self`, implementations are called from the render
/// threads of every connector of the device at once.
pub trait Kms: Send + Sync {
    /// Enable or disable a client capability.
    fn set_client_cap(&self, cap: ClientCap, enable: bool) -> io::Result<()>;
    /// Query a driver capability.
    fn driver_cap(&self, cap: DriverCap) -> io::Result<u64>;
    /// Whether we currently hold DRM master on this device.
    fn is_master(&self) -> bool;

    /// Ids of all mode objects.
    fn resources(&self) -> io::Result<Resources>;
    /// Query a connector, probing for displays.
    fn connector(&self, id: u32) -> io::Result<ConnectorInfo>;
    /// Query an encoder.
    fn encoder(&self, id: u32) -> io::Result<EncoderInfo>;
    /// Query a CRTC.
    fn crtc(&self, id: u32) -> io::Result<CrtcInfo>;
    /// Query a plane.
    fn plane(&self, id: u32) -> io::Result<PlaneInfo>;
    /// Current values of the properties of an object.
    fn properties(&self, ty: ObjectType, id: u32) -> io::Result<Vec<PropertyValue>>;

    /// Create a property blob. Returns its id.
    fn create_blob(&self, data: &[u8]) -> io::Result<u32>;
    /// Contents of a property blob.
    fn blob(&self, id: u32) -> io::Result<Vec<u8>>;
    /// Destroy a property blob.
    fn destroy_blob(&self, id: u32) -> io::Result<()>;

    /// Commit `(object, property, value)` triples.
    fn atomic_commit(&self, props: &[(u32, u32, u64)], flags: CommitFlags) -> io::Result<()>;

    /// Legacy mode set. `None` for `fb` and `mode` disables the CRTC.
    fn set_crtc(
        &self,
        crtc: u32,
        fb: Option<u32>,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()>;
    /// Legacy page flip. A flip event is always requested.
    fn page_flip(&self, crtc: u32, fb: u32, flags: CommitFlags) -> io::Result<()>;
    /// Wait for the next page flip event of `crtc`. Returns `None` on
    /// timeout.
    fn wait_page_flip(&self, crtc: u32, timeout: Duration) -> io::Result<Option<PageFlipEvent>>;
    /// Legacy cursor image. `None` hides the cursor.
    fn set_cursor(&self, crtc: u32, buffer: Option<(u32, u32, u32)>) -> io::Result<()>;
    /// Legacy cursor position.
    fn move_cursor(&self, crtc: u32, x: i32, y: i32) -> io::Result<()>;
    /// Legacy gamma ramp.
    fn set_gamma(&self, crtc: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()>;

    /// Register a framebuffer. Returns its id.
    fn add_fb(&self, layout: &FbLayout) -> io::Result<u32>;
    /// Remove a framebuffer.
    fn remove_fb(&self, fb: u32) -> io::Result<()>;

    /// Create a dumb buffer.
    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer>;
    /// Map a dumb buffer for writing.
    fn map_dumb(&self, dumb: &DumbBuffer) -> io::Result<memmap2::MmapMut>;
    /// Destroy a dumb buffer.
    fn destroy_dumb(&self, handle: u32) -> io::Result<()>;

    /// Import a DMA-BUF as a GEM handle.
    fn prime_import(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;
    /// Close a GEM handle.
    fn close_handle(&self, handle: u32) -> io::Result<()>;

    /// Returns the lessee fd and the lessee id.
    fn create_lease(&self, objects: &[u32]) -> io::Result<(OwnedFd, u32)>;
    /// Revoke a lease created with [`Kms::create_lease`].
    fn revoke_lease(&self, lessee_id: u32) -> io::Result<()>;
}

bitflags::bitflags! {
    /// `GBM_BO_USE_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BoUsage: u32 {
        /// Can be scanned out
        const SCANOUT = 1;
        /// Can be used as a cursor image
        const CURSOR = 1 << 1;
        /// Can be rendered to
        const RENDERING = 1 << 2;
        /// Can be written with [`BufferObject::write`]
        const WRITE = 1 << 3;
        /// Linear layout
        const LINEAR = 1 << 4;
    }
}

/// Access mode of a CPU mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    /// Read only
    Read,
    /// Write only
    Write,
    /// Read and write
    ReadWrite,
}

/// One plane of a DMA-BUF.
#[derive(Debug)]
pub struct DmaPlane {
    /// File descriptor of the plane
    pub fd:       OwnedFd,
    /// Offset of the plane in bytes
    pub offset:   u32,
    /// Row stride in bytes
    pub stride:   u32,
    /// Format modifier
    pub modifier: u64,
}

/// A DMA-BUF description, owning its file descriptors.
#[derive(Debug)]
pub struct DmaData {
    /// Width in pixels
    pub width:  u32,
    /// Height in pixels
    pub height: u32,
    /// fourcc
    pub format: u32,
    /// Planes, at most four
    pub planes: Vec<DmaPlane>,
}

impl DmaData {
    /// Duplicate the file descriptors.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            width:  self.width,
            height: self.height,
            format: self.format,
            planes: self
                .planes
                .iter()
                .map(|p| {
                    Ok(DmaPlane {
                        fd:       p.fd.try_clone()?,
                        offset:   p.offset,
                        stride:   p.stride,
                        modifier: p.modifier,
                    })
                })
                .collect::<io::Result<_>>()?,
        })
    }
}

/// A buffer allocated by an [`Allocator`].
pub trait BufferObject: Send + Sync {
    /// Width in pixels
    fn width(&self) -> u32;
    /// Height in pixels
    fn height(&self) -> u32;
    /// fourcc
    fn format(&self) -> u32;
    /// Format modifier
    fn modifier(&self) -> u64;
    /// Bits per pixel
    fn bpp(&self) -> u32;
    /// Number of planes
    fn plane_count(&self) -> usize;
    /// GEM handle of a plane on the allocating device
    fn handle(&self, plane: usize) -> u32;
    /// Row stride of a plane in bytes.
    fn stride(&self, plane: usize) -> u32;
    /// Offset of a plane in bytes.
    fn offset(&self, plane: usize) -> u32;
    /// Export a plane as a DMA-BUF.
    fn export_fd(&self, plane: usize) -> io::Result<OwnedFd>;
    /// Map `rect` for CPU access and run `f` with the mapping and its stride.
    /// The slice starts at the top left pixel of `rect`.
    fn map(
        &self,
        rect: Rect,
        access: MapAccess,
        f: &mut dyn FnMut(&mut [u8], u32),
    ) -> io::Result<()>;
    /// Copy `data` to the start of the buffer, used for cursor images.
    fn write(&self, data: &[u8]) -> io::Result<()>;
    /// Identity of the allocator this buffer came from, see
    /// [`Allocator::key`].
    fn allocator_key(&self) -> usize;
}

/// Buffer allocation on a device.
pub trait Allocator: Send + Sync {
    /// Allocate a buffer object. An empty `modifiers` slice lets the driver
    /// pick the layout.
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[u64],
        usage: BoUsage,
    ) -> io::Result<Box<dyn BufferObject>>;
    /// Import a DMA-BUF as a buffer object.
    fn import_dma(&self, dma: &DmaData, usage: BoUsage) -> io::Result<Box<dyn BufferObject>>;
    /// A value that uniquely identifies this allocator among the opened
    /// devices.
    fn key(&self) -> usize;
}

bitflags::bitflags! {
    /// Optional renderer features.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RendererExtensions: u32 {
        /// DMA-BUFs with explicit modifiers can be imported
        const DMA_IMPORT_MODIFIERS = 1;
        /// Buffer objects of the same device can be imported directly
        const IMAGE_PIXMAP = 1 << 1;
        /// External textures can be sampled
        const IMAGE_EXTERNAL = 1 << 2;
        /// Pixels can be read back in BGRA order
        const READ_FORMAT_BGRA = 1 << 3;
    }
}

/// Kind of texture a buffer is imported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureTarget {
    /// A regular 2D texture
    #[default]
    Texture2D,
    /// An external texture, for YUV and other formats that can only be sampled
    ExternalOes,
}

/// A texture owned by a [`Renderer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Texture {
    /// Renderer specific texture name
    pub id:     u32,
    /// Kind of texture
    pub target: TextureTarget,
    /// Opaque handle of the image the texture was imported from, if any
    pub image:  Option<u64>,
}

/// An opaque `wl_drm` buffer, only meaningful to a renderer that can import
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlDrmBuffer(pub usize);

/// Graphics API of one device.
pub trait Renderer: Send + Sync {
    /// Optional features of this renderer.
    fn extensions(&self) -> RendererExtensions;
    /// Formats that can be imported as textures
    fn texture_formats(&self) -> FormatList;
    /// Formats that can be rendered to
    fn render_formats(&self) -> FormatList;

    /// Import a buffer object as a texture.
    fn import_bo(&self, bo: &dyn BufferObject, target: TextureTarget) -> io::Result<Texture>;
    /// Import a DMA-BUF as a texture.
    fn import_dma(&self, dma: &DmaData, target: TextureTarget) -> io::Result<Texture>;
    /// Returns the texture, its size and format.
    fn import_wl_drm(&self, buffer: WlDrmBuffer) -> io::Result<(Texture, u32, u32, u32)>;

    /// Create a texture from pixels in CPU memory.
    fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: GlFormat,
        stride: u32,
        pixels: &[u8],
    ) -> io::Result<Texture>;
    /// Upload pixels into `rect` of a texture.
    fn upload(
        &self,
        texture: &Texture,
        format: GlFormat,
        stride: u32,
        rect: Rect,
        pixels: &[u8],
    ) -> io::Result<()>;
    /// Free a texture.
    fn destroy_texture(&self, texture: &Texture);

    /// Make a texture renderable. Returns a render target id.
    fn create_target(&self, texture: &Texture) -> io::Result<u32>;
    /// Free a render target.
    fn destroy_target(&self, target: u32);
    /// Read pixels of `rect` from a render target into `dst`, rows
    /// `dst_stride` bytes apart. `bgra` selects BGRA instead of RGBA order.
    fn read_pixels(
        &self,
        target: u32,
        rect: Rect,
        bgra: bool,
        dst_stride: u32,
        dst: &mut [u8],
    ) -> io::Result<()>;
    /// Block until all submitted rendering is done.
    fn finish(&self) -> io::Result<()>;
}
