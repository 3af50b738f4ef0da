//! Small value types shared by the rest of the crate.

use std::{fmt, time::Duration};

/// Life cycle of a connector's render thread.
///
/// The numeric values are stable and match what is reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ConnectorState {
    /// Not rendering
    #[default]
    Uninitialized  = 0,
    /// Rendering, frames are painted on request
    Initialized    = 1,
    /// Shutting down the render thread
    Uninitializing = 2,
    /// Starting the render thread
    Initializing   = 3,
    /// Switching to another mode
    ChangingMode   = 4,
    /// A mode change failed, going back to the previous mode
    RevertingMode  = 5,
    /// Turning the CRTC off for a VT switch
    Suspending     = 6,
    /// The CRTC is off, the render thread is parked
    Suspended      = 7,
    /// Turning the CRTC back on
    Resuming       = 8,
}

impl ConnectorState {
    /// Upper case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Initialized => "INITIALIZED",
            Self::Uninitializing => "UNINITIALIZING",
            Self::Initializing => "INITIALIZING",
            Self::ChangingMode => "CHANGING MODE",
            Self::RevertingMode => "REVERTING MODE",
            Self::Suspending => "SUSPENDING",
            Self::Suspended => "SUSPENDED",
            Self::Resuming => "RESUMING",
        }
    }

    /// States where the render thread is busy carrying out a request and the
    /// caller has to wait for it to settle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Initializing |
                Self::Uninitializing |
                Self::ChangingMode |
                Self::RevertingMode |
                Self::Suspending |
                Self::Resuming
        )
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How frames rendered for a connector reach its device's scanout engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderMode {
    /// The device renders into its own scanout buffers.
    Itself,
    /// Another device renders, the result is shared through a DMA-BUF.
    Prime,
    /// Another device renders, the result is copied into dumb buffers.
    Dumb,
    /// Another device renders, the result is copied through CPU memory into
    /// buffers allocated by the device.
    Cpu,
    /// The device is disabled.
    #[default]
    None,
}

impl RenderMode {
    /// Upper case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Itself => "ITSELF",
            Self::Prime => "PRIME",
            Self::Dumb => "DUMB",
            Self::Cpu => "CPU",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical connector kind, as reported by the kernel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectorType {
    #[default]
    Unknown,
    Vga,
    DviI,
    DviD,
    DviA,
    Composite,
    SVideo,
    Lvds,
    Component,
    Din,
    DisplayPort,
    HdmiA,
    HdmiB,
    Tv,
    Edp,
    Virtual,
    Dsi,
    Dpi,
    Writeback,
}

impl ConnectorType {
    /// Maps a `DRM_MODE_CONNECTOR_*` value, unknown values map to
    /// [`ConnectorType::Unknown`].
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Vga,
            2 => Self::DviI,
            3 => Self::DviD,
            4 => Self::DviA,
            5 => Self::Composite,
            6 => Self::SVideo,
            7 => Self::Lvds,
            8 => Self::Component,
            9 => Self::Din,
            10 => Self::DisplayPort,
            11 => Self::HdmiA,
            12 => Self::HdmiB,
            13 => Self::Tv,
            14 => Self::Edp,
            15 => Self::Virtual,
            16 => Self::Dsi,
            17 => Self::Dpi,
            18 => Self::Writeback,
            _ => Self::Unknown,
        }
    }

    /// Name used for connector names, e.g. `HDMI-A`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Vga => "VGA",
            Self::DviI => "DVI-I",
            Self::DviD => "DVI-D",
            Self::DviA => "DVI-A",
            Self::Composite => "composite",
            Self::SVideo => "S-VIDEO",
            Self::Lvds => "LVDS",
            Self::Component => "component",
            Self::Din => "DIN",
            Self::DisplayPort => "DisplayPort",
            Self::HdmiA => "HDMI-A",
            Self::HdmiB => "HDMI-B",
            Self::Tv => "TV",
            Self::Edp => "eDP",
            Self::Virtual => "virtual",
            Self::Dsi => "DSI",
            Self::Dpi => "DPI",
            Self::Writeback => "writeback",
        }
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-pixel layout of a display.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubPixel {
    #[default]
    Unknown,
    HorizontalRgb,
    HorizontalBgr,
    VerticalRgb,
    VerticalBgr,
    None,
}

impl SubPixel {
    /// Maps a `DRM_MODE_SUBPIXEL_*` value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            2 => Self::HorizontalRgb,
            3 => Self::HorizontalBgr,
            4 => Self::VerticalRgb,
            5 => Self::VerticalBgr,
            6 => Self::None,
            _ => Self::Unknown,
        }
    }

    /// Upper case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::HorizontalRgb => "HORIZONTAL_RGB",
            Self::HorizontalBgr => "HORIZONTAL_BGR",
            Self::VerticalRgb => "VERTICAL_RGB",
            Self::VerticalBgr => "VERTICAL_BGR",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for SubPixel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a hardware plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Composited on top of the primary plane
    Overlay,
    /// Holds the main framebuffer of a CRTC
    Primary,
    /// Holds the cursor image
    Cursor,
}

impl PlaneType {
    /// Maps the value of a plane's `type` property.
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Overlay),
            1 => Some(Self::Primary),
            2 => Some(Self::Cursor),
            _ => None,
        }
    }

    /// Upper case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overlay => "OVERLAY",
            Self::Primary => "PRIMARY",
            Self::Cursor => "CURSOR",
        }
    }
}

impl fmt::Display for PlaneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the connector "content type" property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u64)]
pub enum ContentType {
    /// No particular content, the default
    #[default]
    Graphics = 1,
    /// Still pictures
    Photo    = 2,
    /// Motion pictures
    Video    = 3,
    /// Games, prefers low latency
    Game     = 4,
}

bitflags::bitflags! {
    /// DRM client capabilities that were successfully enabled on a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct ClientCaps: u32 {
        /// Stereoscopic 3D modes
        const STEREO_3D = 1;
        /// Every plane is exposed
        const UNIVERSAL_PLANES = 1 << 1;
        /// Atomic mode setting
        const ATOMIC = 1 << 2;
        /// Aspect ratio flags in modes
        const ASPECT_RATIO = 1 << 3;
        /// Writeback connectors
        const WRITEBACK_CONNECTORS = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Driver capabilities of a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct Caps: u32 {
        /// Dumb buffers can be created
        const DUMB_BUFFER = 1;
        /// DMA-BUFs can be imported
        const PRIME_IMPORT = 1 << 1;
        /// DMA-BUFs can be exported
        const PRIME_EXPORT = 1 << 2;
        /// AddFB2 accepts explicit modifiers
        const ADD_FB2_MODIFIERS = 1 << 3;
        /// Legacy page flips can be asynchronous
        const ASYNC_PAGE_FLIP = 1 << 4;
        /// Atomic commits can flip asynchronously
        const ATOMIC_ASYNC_PAGE_FLIP = 1 << 5;
        /// Flip timestamps are on the monotonic clock
        const TIMESTAMP_MONOTONIC = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Pending state that has to be pushed with the next commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct AtomicChanges: u32 {
        /// Cursor shown or hidden
        const CURSOR_VISIBILITY = 1;
        /// Cursor moved
        const CURSOR_POSITION = 1 << 1;
        /// Cursor image replaced
        const CURSOR_BUFFER = 1 << 2;
        /// Gamma table replaced
        const GAMMA_LUT = 1 << 3;
        /// Content type changed
        const CONTENT_TYPE = 1 << 4;
    }
}

/// A rectangle in buffer pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// Left edge
    pub x:      i32,
    /// Top edge
    pub y:      i32,
    /// Width, non-positive means empty
    pub width:  i32,
    /// Height, non-positive means empty
    pub height: i32,
}

impl Rect {
    /// A rectangle with its top left corner at `(x, y)`.
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Clip the rectangle to `[0, width) x [0, height)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        // Computed in i64, user rects may reach past i32::MAX.
        let max = i64::from(i32::MAX);
        let (w, h) = (i64::from(width).min(max), i64::from(height).min(max));
        let (x, y) = (i64::from(self.x), i64::from(self.y));
        let x1 = x.clamp(0, w);
        let y1 = y.clamp(0, h);
        let x2 = (x + i64::from(self.width)).clamp(x1, w);
        let y2 = (y + i64::from(self.height)).clamp(y1, h);
        // All four are within [0, i32::MAX] now.
        Self::new(x1 as i32, y1 as i32, (x2 - x1) as i32, (y2 - y1) as i32)
    }
}

/// When and how a frame was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresentationTime {
    /// vblank sequence number of the flip
    pub sequence: u64,
    /// flip timestamp, on the clock reported by the device
    pub time:     Duration,
    /// refresh period of the current mode, in nanoseconds
    pub period:   u32,
}
