//! Connectors and their render threads
//!
//! A [`Connector`] is a display port of a [`Device`]. Once initialized with a
//! [`ConnectorInterface`], a dedicated thread owns the connector's CRTC and
//! swapchain. It calls back into the interface to paint frames and presents
//! them.
//!
//! Every request made through the public API is handed to that thread by
//! changing the connector state and waking it up. Requests that have to be
//! carried out before returning (initialization, mode changes, pausing)
//! block until the thread reports back, so they can't be made from a render
//! thread.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Condvar, Mutex, MutexGuard, Weak,
    },
    thread::JoinHandle,
};

use tinyvec::TinyVec;

use crate::{
    backend::{BoUsage, BufferObject, ConnectorInfo, Kms, ObjectType},
    buffer::{fb_layout, Buffer},
    config::Config,
    core::is_render_thread,
    crtc::Crtc,
    device::Device,
    encoder::Encoder,
    error::{Error, Result},
    format,
    mode::{preferred_mode, ConnectorMode},
    plane::Plane,
    property::{value_of, ConnectorProps},
    types::{
        AtomicChanges, Caps, ConnectorState, ConnectorType, ContentType, PlaneType,
        PresentationTime, Rect, RenderMode, SubPixel,
    },
};

mod edid;
mod render;
mod swapchain;

use swapchain::Swapchain;

/// Width and height of hardware cursor images.
pub const CURSOR_SIZE: u32 = 64;

/// Callbacks of an initialized connector, all called from its render thread.
pub trait ConnectorInterface: Send + Sync + 'static {
    /// The render thread is up, called before the first frame.
    fn initialize(&self, _connector: &Arc<Connector>) {}
    /// Draw a frame into `frame.buffer`.
    fn paint(&self, connector: &Arc<Connector>, frame: &Frame);
    /// A frame was presented, see [`Connector::presentation_time`].
    fn page_flipped(&self, _connector: &Arc<Connector>) {}
    /// The swapchain was rebuilt for a new mode.
    fn resize(&self, _connector: &Arc<Connector>) {}
    /// The connector is being uninitialized, called after the last frame.
    fn uninitialize(&self, _connector: &Arc<Connector>) {}
}

/// The swapchain image to paint.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in the swapchain
    pub index:    usize,
    /// Frames since this image was presented, 0 if its contents are
    /// undefined.
    pub age:      u32,
    /// Buffer to paint into
    pub buffer:   Arc<Buffer>,
    /// The device whose renderer draws the frame.
    pub renderer: Arc<Device>,
}

/// Connector state as reported by the kernel.
#[derive(Debug, Clone)]
pub(crate) struct ConnectorSnapshot {
    info:        ConnectorInfo,
    props:       ConnectorProps,
    non_desktop: bool,
    identity:    edid::Identity,
}

impl ConnectorSnapshot {
    pub(crate) fn query(kms: &dyn Kms, id: u32) -> Result<Self> {
        let info = kms.connector(id)?;
        let values = kms.properties(ObjectType::Connector, id)?;
        let identity = match value_of(&values, "EDID").filter(|b| *b != 0) {
            Some(blob) if info.connected => match kms.blob(blob as u32) {
                Ok(data) => edid::parse(&data).unwrap_or_else(|| {
                    tracing::debug!("Connector {id} has an invalid EDID");
                    Default::default()
                }),
                Err(e) => {
                    tracing::warn!("Failed to read the EDID of connector {id}: {e}");
                    Default::default()
                },
            },
            _ => Default::default(),
        };
        Ok(Self {
            props: ConnectorProps::resolve(&values),
            non_desktop: value_of(&values, "non-desktop").is_some_and(|v| v != 0),
            info,
            identity,
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.info.connected
    }
}

struct Info {
    ty:          ConnectorType,
    connected:   bool,
    mm_width:    u32,
    mm_height:   u32,
    subpixel:    SubPixel,
    non_desktop: bool,
    make:        String,
    model:       String,
    serial:      String,
    props:       ConnectorProps,
    encoders:    Vec<Arc<Encoder>>,
    modes:       Vec<Arc<ConnectorMode>>,
    preferred:   Option<Arc<ConnectorMode>>,
}

const UNKNOWN: &str = "Unknown";

impl Info {
    fn new(snapshot: ConnectorSnapshot, me: &Weak<Connector>, encoders: &[Arc<Encoder>]) -> Self {
        let ConnectorSnapshot {
            info,
            props,
            non_desktop,
            identity,
        } = snapshot;
        let modes: Vec<_> = info
            .modes
            .into_iter()
            .map(|m| Arc::new(ConnectorMode::new(m, me.clone())))
            .collect();
        let text = |s: Option<String>| s.unwrap_or_else(|| UNKNOWN.to_owned());
        Self {
            ty: ConnectorType::from_raw(info.kind),
            connected: info.connected,
            mm_width: info.mm_width,
            mm_height: info.mm_height,
            subpixel: SubPixel::from_raw(info.subpixel),
            non_desktop,
            make: text(identity.make),
            model: text(identity.model),
            serial: text(identity.serial),
            props,
            encoders: encoders
                .iter()
                .filter(|e| info.encoders.contains(&e.id()))
                .cloned()
                .collect(),
            preferred: preferred_mode(&modes),
            modes,
        }
    }
}

/// Mode setting objects claimed by an initialized connector.
#[derive(Debug, Clone)]
pub(crate) struct Configuration {
    pub(crate) encoder: Arc<Encoder>,
    pub(crate) crtc:    Arc<Crtc>,
    pub(crate) primary: Arc<Plane>,
    pub(crate) cursor:  Option<Arc<Plane>>,
}

impl Configuration {
    fn claim(&self, connector: &Weak<Connector>) {
        self.encoder.set_current_connector(connector.clone());
        self.crtc.set_current_connector(connector.clone());
        self.primary.set_current_connector(connector.clone());
        if let Some(cursor) = &self.cursor {
            cursor.set_current_connector(connector.clone());
        }
    }

    fn release(&self) {
        self.encoder.set_current_connector(Weak::new());
        self.crtc.set_current_connector(Weak::new());
        self.primary.set_current_connector(Weak::new());
        if let Some(cursor) = &self.cursor {
            cursor.set_current_connector(Weak::new());
        }
    }
}

pub(crate) struct CursorImage {
    pub(crate) bo: Box<dyn BufferObject>,
    /// Framebuffer for the cursor plane, 0 with the legacy cursor
    pub(crate) fb: u32,
}

#[derive(Default)]
pub(crate) struct Cursor {
    /// Front and back image, allocated on first use
    pub(crate) images:  Vec<CursorImage>,
    pub(crate) front:   usize,
    pub(crate) visible: bool,
    pub(crate) x:       i32,
    pub(crate) y:       i32,
}

/// Everything shared between a connector and its render thread, guarded by
/// [`Connector::render`].
pub(crate) struct RenderState {
    pub(crate) state:          ConnectorState,
    pub(crate) repaint:        bool,
    pub(crate) changes:        AtomicChanges,
    pub(crate) interface:      Option<Arc<dyn ConnectorInterface>>,
    pub(crate) config:         Option<Configuration>,
    pub(crate) current_mode:   Option<Arc<ConnectorMode>>,
    /// Mode the thread switches to in [`ConnectorState::ChangingMode`]
    pub(crate) target_mode:    Option<Arc<ConnectorMode>>,
    pub(crate) cursor:         Cursor,
    /// Pending gamma ramps, red then green then blue
    pub(crate) gamma:          Option<Vec<u16>>,
    pub(crate) content_type:   ContentType,
    pub(crate) vsync:          bool,
    pub(crate) damage:         TinyVec<[Rect; 4]>,
    pub(crate) custom_scanout: Option<Arc<Buffer>>,
    pub(crate) presentation:   PresentationTime,
    pub(crate) buffers:        Vec<Arc<Buffer>>,
    pub(crate) swapchain:      Swapchain,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            state:          ConnectorState::Uninitialized,
            repaint:        false,
            changes:        AtomicChanges::empty(),
            interface:      None,
            config:         None,
            current_mode:   None,
            target_mode:    None,
            cursor:         Cursor::default(),
            gamma:          None,
            content_type:   ContentType::default(),
            vsync:          true,
            damage:         TinyVec::new(),
            custom_scanout: None,
            presentation:   PresentationTime::default(),
            buffers:        Vec::new(),
            swapchain:      Swapchain::default(),
        }
    }
}

/// Whether the render thread has something to do in this state.
fn has_work(s: &RenderState) -> bool {
    match s.state {
        ConnectorState::Uninitializing |
        ConnectorState::ChangingMode |
        ConnectorState::Suspending |
        ConnectorState::Resuming => true,
        ConnectorState::Initialized => s.repaint || !s.changes.is_empty(),
        _ => false,
    }
}

fn uses_legacy_cursor(device: &Device, config: &Config) -> bool {
    !device.is_atomic() || config.force_legacy_cursor
}

/// drm_color_lut entries for gamma ramps laid out as red, green, blue.
pub(crate) fn gamma_lut_blob(ramps: &[u16]) -> Vec<u8> {
    let n = ramps.len() / 3;
    let mut out = Vec::with_capacity(n * 8);
    for i in 0..n {
        for v in [ramps[i], ramps[n + i], ramps[2 * n + i], 0] {
            out.extend_from_slice(&v.to_ne_bytes());
        }
    }
    out
}

/// Identity gamma ramps with `n` entries per channel.
pub(crate) fn linear_ramp(n: usize) -> Vec<u16> {
    let channel = (0..n).map(|i| {
        if n < 2 {
            u16::MAX
        } else {
            (u16::MAX as f64 * (i as f64 / (n - 1) as f64)) as u16
        }
    });
    channel.clone().chain(channel.clone()).chain(channel).collect()
}

/// A display port of a device.
pub struct Connector {
    id:       u32,
    device:   Weak<Device>,
    me:       Weak<Connector>,
    name_id:  AtomicU32,
    leased:   AtomicBool,
    info:     Mutex<Info>,
    // Lock order: `render` may be held while locking `info`, never the
    // other way around.
    render:   Mutex<RenderState>,
    cond:     Condvar,
    thread:   Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub(crate) fn new(
        device: Weak<Device>,
        snapshot: ConnectorSnapshot,
        encoders: &[Arc<Encoder>],
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            let id = snapshot.info.id;
            let info = Info::new(snapshot, me, encoders);
            let render = RenderState {
                current_mode: info.preferred.clone(),
                ..Default::default()
            };
            Self {
                id,
                device,
                me: me.clone(),
                name_id: AtomicU32::new(0),
                leased: AtomicBool::new(false),
                info: Mutex::new(info),
                render: Mutex::new(render),
                cond: Condvar::new(),
                thread: Mutex::new(None),
            }
        })
    }

    fn lock_info(&self) -> MutexGuard<'_, Info> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lock_render(&self) -> MutexGuard<'_, RenderState> {
        self.render.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake the render thread, and everyone waiting for a state change.
    pub(crate) fn notify(&self) {
        self.cond.notify_all();
    }

    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, RenderState>,
    ) -> MutexGuard<'a, RenderState> {
        self.cond.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, RenderState>,
        condition: impl FnMut(&mut RenderState) -> bool,
    ) -> MutexGuard<'a, RenderState> {
        self.cond
            .wait_while(guard, condition)
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn wait_for_work<'a>(
        &self,
        guard: MutexGuard<'a, RenderState>,
    ) -> MutexGuard<'a, RenderState> {
        self.wait_while(guard, |s| !has_work(s))
    }

    /// Kernel object id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The device this connector belongs to, `None` once it is removed.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    /// Physical connector kind.
    pub fn ty(&self) -> ConnectorType {
        self.lock_info().ty
    }

    /// Number distinguishing connectors of the same type, starting at 1.
    pub fn name_id(&self) -> u32 {
        self.name_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_name_id(&self, id: u32) {
        self.name_id.store(id, Ordering::Release);
    }

    /// e.g. `HDMI-A-1`
    pub fn name(&self) -> String {
        format!("{}-{}", self.ty().as_str(), self.name_id())
    }

    /// Manufacturer from the EDID.
    pub fn make(&self) -> String {
        self.lock_info().make.clone()
    }

    /// Model name from the EDID.
    pub fn model(&self) -> String {
        self.lock_info().model.clone()
    }

    /// Serial number from the EDID.
    pub fn serial(&self) -> String {
        self.lock_info().serial.clone()
    }

    /// Physical width in millimeters.
    pub fn mm_width(&self) -> u32 {
        self.lock_info().mm_width
    }

    /// Physical height in millimeters.
    pub fn mm_height(&self) -> u32 {
        self.lock_info().mm_height
    }

    /// Sub-pixel layout of the display.
    pub fn subpixel(&self) -> SubPixel {
        self.lock_info().subpixel
    }

    /// Whether the display is meant for something else than a desktop,
    /// e.g. a VR headset.
    pub fn is_non_desktop(&self) -> bool {
        self.lock_info().non_desktop
    }

    /// Whether a display is plugged in.
    pub fn is_connected(&self) -> bool {
        self.lock_info().connected
    }

    /// Encoders that can drive this connector.
    pub fn encoders(&self) -> Vec<Arc<Encoder>> {
        self.lock_info().encoders.clone()
    }

    /// Modes of the plugged display.
    pub fn modes(&self) -> Vec<Arc<ConnectorMode>> {
        self.lock_info().modes.clone()
    }

    /// Mode the display prefers.
    pub fn preferred_mode(&self) -> Option<Arc<ConnectorMode>> {
        self.lock_info().preferred.clone()
    }

    /// Mode used for rendering.
    pub fn current_mode(&self) -> Option<Arc<ConnectorMode>> {
        self.lock_render().current_mode.clone()
    }

    /// Property ids of this connector.
    pub fn props(&self) -> ConnectorProps {
        self.lock_info().props
    }

    /// Refresh from a new kernel snapshot after a hotplug event.
    pub(crate) fn update(&self, snapshot: ConnectorSnapshot, encoders: &[Arc<Encoder>]) {
        let info = Info::new(snapshot, &self.me, encoders);
        let preferred = info.preferred.clone();
        *self.lock_info() = info;
        self.lock_render().current_mode = preferred;
    }

    pub(crate) fn mark_disconnected(&self) {
        self.lock_info().connected = false;
    }

    /// Whether the connector is part of a lease.
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.leased.store(leased, Ordering::Release);
    }

    /// Current render state.
    pub fn state(&self) -> ConnectorState {
        self.lock_render().state
    }

    /// Whether a render thread exists for this connector.
    pub fn is_initialized(&self) -> bool {
        self.state() != ConnectorState::Uninitialized
    }

    fn configuration(&self) -> Option<Configuration> {
        self.lock_render().config.clone()
    }

    /// Encoder in use while initialized.
    pub fn current_encoder(&self) -> Option<Arc<Encoder>> {
        self.configuration().map(|c| c.encoder)
    }

    /// CRTC in use while initialized.
    pub fn current_crtc(&self) -> Option<Arc<Crtc>> {
        self.configuration().map(|c| c.crtc)
    }

    /// Primary plane in use while initialized.
    pub fn current_primary_plane(&self) -> Option<Arc<Plane>> {
        self.configuration().map(|c| c.primary)
    }

    /// Cursor plane in use while initialized, if one was free.
    pub fn current_cursor_plane(&self) -> Option<Arc<Plane>> {
        self.configuration().and_then(|c| c.cursor)
    }

    /// Whether [`Connector::set_cursor`] is available. With the legacy
    /// cursor API every initialized connector has one, on atomic devices
    /// only those that got a cursor plane.
    pub fn has_hardware_cursor(&self) -> bool {
        let Some(device) = self.device() else { return false };
        let Some(core) = device.core() else { return false };
        if core.config().disable_cursor {
            return false
        }
        let legacy = uses_legacy_cursor(&device, core.config());
        match &self.lock_render().config {
            Some(config) => legacy || config.cursor.is_some(),
            None => false,
        }
    }

    /// The best unused encoder, CRTC and planes for this connector.
    pub(crate) fn best_configuration(&self, device: &Device, config: &Config) -> Option<Configuration> {
        let cursor_allowed =
            device.is_atomic() && !config.force_legacy_cursor && !config.disable_cursor;
        let free_plane = |ty: PlaneType, crtc: &Crtc| {
            device
                .planes()
                .iter()
                .find(|p| p.ty() == ty && p.supports_crtc(crtc) && p.is_free())
                .cloned()
        };

        let mut best: Option<(u32, Configuration)> = None;
        for encoder in self.encoders() {
            if encoder.is_leased() {
                continue
            }
            for crtc in encoder.crtcs() {
                if !crtc.is_free() {
                    continue
                }
                let Some(primary) = free_plane(PlaneType::Primary, crtc) else {
                    continue
                };
                let cursor = cursor_allowed
                    .then(|| free_plane(PlaneType::Cursor, crtc))
                    .flatten();
                let score = 100 + if cursor.is_some() { 50 } else { 0 };
                if best.as_ref().map_or(true, |(s, _)| score > *s) {
                    best = Some((score, Configuration {
                        encoder: encoder.clone(),
                        crtc: crtc.clone(),
                        primary,
                        cursor,
                    }));
                }
            }
        }
        best.map(|(_, c)| c)
    }

    /// Start rendering with `interface`. Blocks until the render thread has
    /// set up the CRTC and is about to paint the first frame.
    pub fn initialize(self: &Arc<Self>, interface: Arc<dyn ConnectorInterface>) -> Result<()> {
        if is_render_thread() {
            return Err(Error::RenderThread)
        }
        let device = self.device().ok_or(Error::Gone)?;
        let core = device.core().ok_or(Error::Gone)?;
        if !device.is_enabled() {
            return Err(Error::DeviceDisabled(device.short_name().to_owned()))
        }
        if device.render_mode() == RenderMode::None || device.renderer().is_none() {
            return Err(Error::Unsupported("no renderer is assigned to the device"))
        }
        if self.is_leased() {
            return Err(Error::InvalidArgument("connector is leased"))
        }
        if !self.is_connected() {
            return Err(Error::Disconnected(self.id))
        }

        {
            let _claims = device.lock_claims();
            // A lease may have been created since the check above.
            if self.is_leased() {
                return Err(Error::InvalidArgument("connector is leased"))
            }
            let mut st = self.lock_render();
            if st.state != ConnectorState::Uninitialized {
                return Err(Error::InvalidState(st.state))
            }
            if st.current_mode.is_none() {
                st.current_mode = self.preferred_mode();
            }
            if st.current_mode.is_none() {
                return Err(Error::Disconnected(self.id))
            }
            let config = self
                .best_configuration(&device, core.config())
                .ok_or(Error::NoConfiguration(self.id))?;
            config.claim(&self.me);
            st.config = Some(config);
            st.interface = Some(interface);
            st.state = ConnectorState::Initializing;
            st.repaint = true;
            st.target_mode = None;
        }
        drop(core);

        let handle = match render::spawn(self.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("[{}] Failed to spawn the render thread: {e}", self.name());
                self.lock_render().state = ConnectorState::Uninitialized;
                self.release_resources();
                return Err(e.into())
            },
        };
        *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        let st = self.wait_while(self.lock_render(), |s| {
            s.state == ConnectorState::Initializing
        });
        let state = st.state;
        drop(st);
        if state == ConnectorState::Uninitialized {
            self.join_thread();
            self.release_resources();
            return Err(Error::InitializationFailed)
        }
        tracing::info!("[{}] {} initialized", device.short_name(), self.name());
        Ok(())
    }

    fn thread_finished(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |t| t.is_finished())
    }

    fn join_thread(&self) {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("[{}] Render thread panicked", self.name());
            }
        }
    }

    /// Give back everything claimed by [`Connector::initialize`], and reset
    /// the per session state.
    fn release_resources(&self) {
        let device = self.device();
        let (config, cursor) = {
            let mut st = self.lock_render();
            st.interface = None;
            st.damage.clear();
            st.gamma = None;
            st.changes = AtomicChanges::empty();
            st.custom_scanout = None;
            st.buffers.clear();
            st.swapchain = Swapchain::default();
            st.presentation = PresentationTime::default();
            st.repaint = false;
            (st.config.take(), std::mem::take(&mut st.cursor))
        };
        if let Some(device) = &device {
            for image in cursor.images.iter().filter(|i| i.fb != 0) {
                if let Err(e) = device.kms().remove_fb(image.fb) {
                    tracing::warn!("[{}] Failed to remove cursor framebuffer: {e}", self.name());
                }
            }
        }
        drop(cursor);

        let Some(config) = config else { return };
        config.release();
        if let (Some(plane), Some(device)) = (config.cursor, device) {
            self.hand_over_cursor(&device, plane);
        }
    }

    /// Pass a freed cursor plane on to an initialized connector that has to
    /// do without one.
    fn hand_over_cursor(&self, device: &Device, plane: Arc<Plane>) {
        let _claims = device.lock_claims();
        for other in device.connectors() {
            if other.id == self.id || !plane.is_free() {
                continue
            }
            let mut st = other.lock_render();
            if st.state != ConnectorState::Initialized {
                continue
            }
            let Some(config) = st.config.as_mut() else { continue };
            if config.cursor.is_some() || !plane.supports_crtc(&config.crtc) {
                continue
            }
            plane.set_current_connector(other.me.clone());
            config.cursor = Some(plane.clone());
            st.changes |= AtomicChanges::CURSOR_BUFFER |
                AtomicChanges::CURSOR_POSITION |
                AtomicChanges::CURSOR_VISIBILITY;
            other.notify();
            tracing::debug!(
                "[{}] Cursor plane {} handed over to {}",
                device.short_name(),
                plane.id(),
                other.name()
            );
            return
        }
    }

    /// Stop rendering and give up the CRTC. Blocks until the render thread
    /// is gone.
    pub fn uninitialize(&self) -> Result<()> {
        if is_render_thread() {
            return Err(Error::RenderThread)
        }
        let mut st = self.lock_render();
        loop {
            match st.state {
                ConnectorState::Uninitialized => return Ok(()),
                ConnectorState::Initialized | ConnectorState::Suspended => break,
                _ => st = self.wait(st),
            }
        }
        st.state = ConnectorState::Uninitializing;
        self.notify();
        let st = self.wait_while(st, |s| {
            s.state != ConnectorState::Uninitialized && !self.thread_finished()
        });
        drop(st);

        self.join_thread();
        self.release_resources();
        tracing::info!("[{}] Uninitialized", self.name());
        Ok(())
    }

    /// Schedule a frame.
    pub fn repaint(&self) -> Result<()> {
        let mut st = self.lock_render();
        match st.state {
            ConnectorState::Initializing |
            ConnectorState::Initialized |
            ConnectorState::ChangingMode => {
                st.repaint = true;
                self.notify();
                Ok(())
            },
            state => Err(Error::InvalidState(state)),
        }
    }

    /// Switch to `mode`. If the new mode can't be set, the previous one is
    /// restored and [`Error::ModeReverted`] returned.
    pub fn set_mode(&self, mode: &Arc<ConnectorMode>) -> Result<()> {
        if !mode.belongs_to(self) {
            return Err(Error::InvalidArgument("mode belongs to another connector"))
        }
        let mut st = self.lock_render();
        loop {
            match st.state {
                ConnectorState::Uninitialized => {
                    st.current_mode = Some(mode.clone());
                    return Ok(())
                },
                ConnectorState::Initialized => break,
                ConnectorState::Suspended => return Err(Error::InvalidState(st.state)),
                _ if is_render_thread() => return Err(Error::RenderThread),
                _ => st = self.wait(st),
            }
        }
        if st.current_mode.as_ref().is_some_and(|m| Arc::ptr_eq(m, mode)) {
            return Ok(())
        }
        if is_render_thread() {
            return Err(Error::RenderThread)
        }

        let backup = st.current_mode.replace(mode.clone());
        st.target_mode = Some(mode.clone());
        st.state = ConnectorState::ChangingMode;
        self.notify();
        st = self.wait_while(st, |s| s.state == ConnectorState::ChangingMode);
        if st.state != ConnectorState::RevertingMode {
            tracing::info!("[{}] Mode set to {mode}", self.name());
            return Ok(())
        }

        tracing::warn!("[{}] Mode {mode} was rejected, reverting", self.name());
        st.current_mode = backup.clone();
        st.target_mode = backup;
        st.state = ConnectorState::ChangingMode;
        self.notify();
        st = self.wait_while(st, |s| s.state == ConnectorState::ChangingMode);
        if st.state == ConnectorState::RevertingMode {
            tracing::error!("[{}] Failed to restore the previous mode", self.name());
            st.state = ConnectorState::Initialized;
            st.repaint = true;
            self.notify();
        }
        Err(Error::ModeReverted)
    }

    /// Drive the state from `from` through `transient` to `to`, used by
    /// [`Connector::pause`] and [`Connector::resume`].
    fn transition(
        &self,
        from: ConnectorState,
        transient: ConnectorState,
        to: ConnectorState,
    ) -> Result<()> {
        if is_render_thread() {
            return Err(Error::RenderThread)
        }
        let mut st = self.lock_render();
        loop {
            match st.state {
                s if s == to => return Ok(()),
                s if s == from => break,
                s @ (ConnectorState::Uninitialized | ConnectorState::Uninitializing) =>
                    return Err(Error::InvalidState(s)),
                _ => st = self.wait(st),
            }
        }
        st.state = transient;
        self.notify();
        let _st = self.wait_while(st, |s| s.state == transient);
        Ok(())
    }

    /// Release the CRTC but keep the swapchain, e.g. while another client
    /// uses the display.
    pub fn pause(&self) -> Result<()> {
        self.transition(
            ConnectorState::Initialized,
            ConnectorState::Suspending,
            ConnectorState::Suspended,
        )
    }

    /// Undo [`Connector::pause`].
    pub fn resume(&self) -> Result<()> {
        self.transition(
            ConnectorState::Suspended,
            ConnectorState::Resuming,
            ConnectorState::Initialized,
        )
    }

    fn initialized(&self) -> Result<MutexGuard<'_, RenderState>> {
        let st = self.lock_render();
        if st.state != ConnectorState::Initialized {
            return Err(Error::InvalidState(st.state))
        }
        Ok(st)
    }

    /// Index of the swapchain image painted next.
    pub fn current_buffer_index(&self) -> Result<usize> {
        Ok(self.initialized()?.swapchain.index())
    }

    /// Length of the swapchain.
    pub fn buffers_count(&self) -> Result<usize> {
        Ok(self.initialized()?.swapchain.len())
    }

    /// Render buffer of swapchain image `index`.
    pub fn buffer(&self, index: usize) -> Result<Arc<Buffer>> {
        self.initialized()?
            .buffers
            .get(index)
            .cloned()
            .ok_or(Error::InvalidArgument("buffer index out of range"))
    }

    /// Age of the image about to be painted, 0 if its contents are undefined.
    pub fn buffer_age(&self) -> Result<u32> {
        Ok(self.initialized()?.swapchain.age())
    }

    /// Damage is only taken into account when frames are copied to the
    /// device, i.e. when the connector is not rendered by its own device.
    pub fn has_buffer_damage_support(&self) -> bool {
        self.device()
            .is_some_and(|d| d.render_mode() != RenderMode::Itself)
    }

    /// Regions of the next frame that changed. An empty list clears the
    /// damage, and is reported as an error. Refused when the device renders
    /// into its own scanout buffers.
    pub fn set_buffer_damage(&self, rects: &[Rect]) -> Result<()> {
        if !self.has_buffer_damage_support() {
            return Err(Error::Unsupported("buffer damage needs a render mode other than itself"))
        }
        let mut st = self.lock_render();
        st.damage.clear();
        if rects.is_empty() {
            return Err(Error::InvalidArgument("empty damage list"))
        }
        st.damage.extend(rects.iter().copied().filter(|r| !r.is_empty()));
        Ok(())
    }

    fn cursor_images(device: &Device, with_fb: bool) -> Result<Vec<CursorImage>> {
        let with_modifiers = device.caps().contains(Caps::ADD_FB2_MODIFIERS);
        let mut images: Vec<CursorImage> = Vec::with_capacity(2);
        for _ in 0..2 {
            let bo = device.allocator().create_bo(
                CURSOR_SIZE,
                CURSOR_SIZE,
                format::ARGB8888,
                &[],
                BoUsage::CURSOR | BoUsage::WRITE,
            );
            let added = bo.map_err(Error::from).and_then(|bo| {
                let fb = if with_fb {
                    device.kms().add_fb(&fb_layout(&*bo, with_modifiers))?
                } else {
                    0
                };
                Ok(CursorImage { bo, fb })
            });
            match added {
                Ok(image) => images.push(image),
                Err(e) => {
                    for image in images.iter().filter(|i| i.fb != 0) {
                        let _ = device.kms().remove_fb(image.fb);
                    }
                    return Err(e)
                },
            }
        }
        Ok(images)
    }

    /// Show a 64x64 ARGB8888 cursor image, or hide the cursor with `None`.
    pub fn set_cursor(&self, pixels: Option<&[u8]>) -> Result<()> {
        let device = self.device().ok_or(Error::Gone)?;
        let core = device.core().ok_or(Error::Gone)?;
        if !self.has_hardware_cursor() {
            return Err(Error::Unsupported("hardware cursor"))
        }
        let legacy = uses_legacy_cursor(&device, core.config());
        let mut st = self.lock_render();
        let crtc = st
            .config
            .as_ref()
            .map(|c| c.crtc.id())
            .ok_or(Error::InvalidState(st.state))?;

        let Some(pixels) = pixels else {
            if !st.cursor.visible {
                return Ok(())
            }
            st.cursor.visible = false;
            if legacy {
                device.kms().set_cursor(crtc, None)?;
            } else {
                st.changes |= AtomicChanges::CURSOR_VISIBILITY;
                self.notify();
            }
            return Ok(())
        };

        if pixels.len() != (CURSOR_SIZE * CURSOR_SIZE * 4) as usize {
            return Err(Error::InvalidArgument("cursor images are 64x64 ARGB8888"))
        }
        if st.cursor.images.is_empty() {
            st.cursor.images = Self::cursor_images(&device, !legacy)?;
            st.cursor.front = 1;
        }
        let back = 1 - st.cursor.front;
        let image = &st.cursor.images[back];
        image.bo.write(pixels)?;
        if legacy {
            device
                .kms()
                .set_cursor(crtc, Some((image.bo.handle(0), CURSOR_SIZE, CURSOR_SIZE)))?;
        }
        st.cursor.front = back;
        st.cursor.visible = true;
        if !legacy {
            st.changes |= AtomicChanges::CURSOR_BUFFER | AtomicChanges::CURSOR_VISIBILITY;
            self.notify();
        }
        Ok(())
    }

    /// Move the cursor, coordinates are relative to the top left corner of
    /// the display.
    pub fn set_cursor_pos(&self, x: i32, y: i32) -> Result<()> {
        let device = self.device().ok_or(Error::Gone)?;
        let core = device.core().ok_or(Error::Gone)?;
        if !self.has_hardware_cursor() {
            return Err(Error::Unsupported("hardware cursor"))
        }
        let mut st = self.lock_render();
        if (st.cursor.x, st.cursor.y) == (x, y) {
            return Ok(())
        }
        let crtc = st
            .config
            .as_ref()
            .map(|c| c.crtc.id())
            .ok_or(Error::InvalidState(st.state))?;
        st.cursor.x = x;
        st.cursor.y = y;
        if uses_legacy_cursor(&device, core.config()) {
            device.kms().move_cursor(crtc, x, y)?;
        } else {
            st.changes |= AtomicChanges::CURSOR_POSITION;
            self.notify();
        }
        Ok(())
    }

    /// Entries per channel of the gamma table, 0 when gamma correction is
    /// not available or the connector is not initialized.
    pub fn gamma_size(&self) -> u32 {
        self.lock_render()
            .config
            .as_ref()
            .map_or(0, |c| c.crtc.gamma_size())
    }

    /// Set the gamma ramps. `ramps` holds [`Connector::gamma_size`] red
    /// values, followed by as many green and blue ones.
    pub fn set_gamma(&self, ramps: &[u16]) -> Result<()> {
        let device = self.device().ok_or(Error::Gone)?;
        let mut st = self.lock_render();
        let crtc = st
            .config
            .as_ref()
            .map(|c| c.crtc.clone())
            .ok_or(Error::InvalidState(st.state))?;
        let n = crtc.gamma_size() as usize;
        if n == 0 {
            return Err(Error::Unsupported("gamma correction"))
        }
        if ramps.len() != 3 * n {
            return Err(Error::InvalidArgument("gamma ramps must have 3 * gamma_size entries"))
        }
        if device.is_atomic() {
            if crtc.props().gamma_lut == 0 {
                return Err(Error::Unsupported("GAMMA_LUT property"))
            }
            st.gamma = Some(ramps.to_vec());
            st.changes |= AtomicChanges::GAMMA_LUT;
            self.notify();
        } else {
            device
                .kms()
                .set_gamma(crtc.id(), &ramps[..n], &ramps[n..2 * n], &ramps[2 * n..])?;
        }
        Ok(())
    }

    /// Value of the content type property.
    pub fn content_type(&self) -> ContentType {
        self.lock_render().content_type
    }

    /// Hint the display about the kind of content shown.
    pub fn set_content_type(&self, content_type: ContentType) {
        let mut st = self.lock_render();
        if st.content_type == content_type {
            return
        }
        st.content_type = content_type;
        let atomic = self.device().is_some_and(|d| d.is_atomic());
        if atomic && self.props().content_type != 0 {
            st.changes |= AtomicChanges::CONTENT_TYPE;
            self.notify();
        }
    }

    /// Whether frames can be presented without waiting for vblank.
    pub fn can_disable_vsync(&self) -> bool {
        let Some(device) = self.device() else { return false };
        if device.is_atomic() {
            device.caps().contains(Caps::ATOMIC_ASYNC_PAGE_FLIP)
        } else {
            device.caps().contains(Caps::ASYNC_PAGE_FLIP)
        }
    }

    /// Whether page flips wait for vblank.
    pub fn is_vsync_enabled(&self) -> bool {
        self.lock_render().vsync
    }

    /// Wait for vblank or flip immediately. Disabling needs async page flip
    /// support. A rejected async flip falls back to vsync.
    pub fn enable_vsync(&self, enabled: bool) -> Result<()> {
        if !enabled && !self.can_disable_vsync() {
            return Err(Error::Unsupported("async page flips"))
        }
        self.lock_render().vsync = enabled;
        Ok(())
    }

    /// When the last frame was presented.
    pub fn presentation_time(&self) -> PresentationTime {
        self.lock_render().presentation
    }

    /// Present `buffer` instead of the swapchain image in the next frame.
    /// The buffer must have the size of the current mode, and be backed by
    /// a buffer object of this connector's device.
    pub fn set_custom_scanout_buffer(&self, buffer: Option<Arc<Buffer>>) -> Result<()> {
        let device = self.device().ok_or(Error::Gone)?;
        let core = device.core().ok_or(Error::Gone)?;
        if core.config().disable_direct_scanout {
            return Err(Error::Unsupported("direct scanout is disabled"))
        }
        let mut st = self.lock_render();
        let Some(buffer) = buffer else {
            st.custom_scanout = None;
            return Ok(())
        };
        let mode = st
            .current_mode
            .as_ref()
            .ok_or(Error::InvalidState(st.state))?;
        if buffer.width() != mode.width() || buffer.height() != mode.height() {
            return Err(Error::InvalidArgument("buffer size does not match the current mode"))
        }
        st.custom_scanout = Some(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        backend::{
            fake::{self, Call, FakeGpu},
            CommitFlags, DriverCap, PRIME_CAP_IMPORT,
        },
        core::Core,
    };

    /// Fills every frame with one colour and counts callbacks.
    #[derive(Default)]
    struct Painter {
        initialized: AtomicUsize,
        painted:     AtomicUsize,
        flipped:     AtomicUsize,
        resized:     AtomicUsize,
        finished:    AtomicUsize,
        /// Frame ages seen by paint
        ages:        Mutex<Vec<u32>>,
    }

    impl ConnectorInterface for Painter {
        fn initialize(&self, _connector: &Arc<Connector>) {
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }

        fn paint(&self, _connector: &Arc<Connector>, frame: &Frame) {
            let (w, h) = (frame.buffer.width(), frame.buffer.height());
            let pixels = vec![0x80; (w * h * 4) as usize];
            frame.buffer.write(w * 4, 0, 0, w, h, &pixels).unwrap();
            self.ages.lock().unwrap().push(frame.age);
            self.painted.fetch_add(1, Ordering::SeqCst);
        }

        fn page_flipped(&self, _connector: &Arc<Connector>) {
            self.flipped.fetch_add(1, Ordering::SeqCst);
        }

        fn resize(&self, _connector: &Arc<Connector>) {
            self.resized.fetch_add(1, Ordering::SeqCst);
        }

        fn uninitialize(&self, _connector: &Arc<Connector>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn single(config: Config) -> (Arc<fake::FakePlatform>, Arc<Core>, Arc<Connector>) {
        logging();
        let (platform, core) = fake::core(vec![FakeGpu::new(0, 2)], config);
        let connector = core.devices()[0].connectors()[0].clone();
        (platform, core, connector)
    }

    #[test]
    fn identity() {
        let (platform, core) = fake::core(vec![FakeGpu::new(0, 2)], Config::default());
        let device = core.devices()[0].clone();
        let c = &device.connectors()[0];
        assert_eq!(c.name(), "HDMI-A-1");
        assert_eq!((c.make(), c.model(), c.serial()), (UNKNOWN.into(), UNKNOWN.into(), UNKNOWN.into()));
        assert_eq!((c.mm_width(), c.mm_height()), (300, 200));
        assert!(!c.is_non_desktop());
        assert_eq!(c.modes().len(), 2);
        assert_eq!(c.preferred_mode().unwrap().width(), 64);
        assert!(Arc::ptr_eq(&c.current_mode().unwrap(), &c.preferred_mode().unwrap()));
        assert_eq!(c.encoders()[0].id(), 200);
        assert!(c.current_crtc().is_none());

        let kms = platform.kms(0);
        kms.set_connected(1, false);
        device.dispatch_hotplug_events();
        kms.set_edid(1, Some(edid::tests::sample("U2720Q", Some("ABC123"), 0)));
        kms.set_connected(1, true);
        device.dispatch_hotplug_events();
        let c = &device.connectors()[1];
        assert_eq!(c.make(), "DEL");
        assert_eq!(c.model(), "U2720Q");
        assert_eq!(c.serial(), "ABC123");
        assert_eq!(c.name(), "HDMI-A-2");
    }

    #[test]
    fn initialize_paint_uninitialize() {
        let (platform, core, connector) = single(Config::default());
        let kms = platform.kms(0);
        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        assert_eq!(connector.state(), ConnectorState::Initialized);
        assert_eq!(painter.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(connector.current_crtc().unwrap().id(), 300);
        assert_eq!(connector.current_primary_plane().unwrap().id(), 400);
        assert_eq!(connector.current_cursor_plane().unwrap().id(), 401);
        assert!(connector.has_hardware_cursor());
        assert!(!core.devices()[0].crtcs()[0].is_free());
        assert!(matches!(
            connector.initialize(painter.clone()),
            Err(Error::InvalidState(ConnectorState::Initialized))
        ));

        wait_until("the first frame", || painter.flipped.load(Ordering::SeqCst) >= 1);
        assert_eq!(connector.buffers_count().unwrap(), 2);
        assert_eq!(connector.buffer(0).unwrap().width(), 64);
        assert!(connector.buffer(2).is_err());
        // Mode set with ALLOW_MODESET, then the flip
        let commits = kms.commits();
        assert!(commits[0].1.contains(CommitFlags::ALLOW_MODESET));
        assert_eq!(kms.last_value(100, "CRTC_ID"), Some(300));
        assert_eq!(kms.last_value(300, "ACTIVE"), Some(1));
        assert_eq!(kms.last_value(400, "SRC_W"), Some(64 << 16));
        assert!(commits
            .iter()
            .any(|(_, f)| f.contains(CommitFlags::PAGE_FLIP_EVENT | CommitFlags::NONBLOCK)));
        assert_ne!(connector.presentation_time().sequence, 0);
        assert_eq!(connector.presentation_time().period, 16_666_666);

        connector.repaint().unwrap();
        wait_until("the second frame", || painter.flipped.load(Ordering::SeqCst) >= 2);
        connector.repaint().unwrap();
        wait_until("the third frame", || painter.flipped.load(Ordering::SeqCst) >= 3);
        assert_eq!(painter.ages.lock().unwrap()[..3], [0, 0, 2]);

        connector.uninitialize().unwrap();
        assert_eq!(connector.state(), ConnectorState::Uninitialized);
        assert_eq!(painter.finished.load(Ordering::SeqCst), 1);
        assert_eq!(kms.last_value(300, "ACTIVE"), Some(0));
        assert!(core.devices()[0].crtcs()[0].is_free());
        assert!(connector.current_crtc().is_none());
        assert!(connector.buffers_count().is_err());
        // The swapchain framebuffers are gone.
        assert_eq!(kms.fb_count(), 0);
        connector.uninitialize().unwrap();
        assert!(matches!(connector.repaint(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn disconnected_and_leased_connectors() {
        let (platform, core, connector) = single(Config::default());
        let device = core.devices()[0].clone();
        platform.kms(0).set_connected(0, false);
        device.dispatch_hotplug_events();
        assert!(matches!(
            connector.initialize(Arc::new(Painter::default())),
            Err(Error::Disconnected(100))
        ));

        let other = device.connectors()[1].clone();
        other.set_leased(true);
        assert!(other.initialize(Arc::new(Painter::default())).is_err());
    }

    #[test]
    fn legacy_device() {
        let config = Config {
            force_legacy_api: true,
            ..Default::default()
        };
        let (platform, _core, connector) = single(config);
        let kms = platform.kms(0);
        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        wait_until("a frame", || painter.flipped.load(Ordering::SeqCst) >= 1);
        assert!(kms.commits().is_empty());
        let calls = kms.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, Call::SetCrtc { crtc: 300, fb: Some(_) })));
        assert!(calls.iter().any(|c| matches!(c, Call::PageFlip { crtc: 300, .. })));
        // Initial gamma ramp through the legacy ioctl
        assert!(calls.contains(&Call::SetGamma { crtc: 300, len: 16 }));

        // Every initialized connector has a legacy cursor.
        assert!(connector.current_cursor_plane().is_none());
        assert!(connector.has_hardware_cursor());
        let image = vec![0xff; (CURSOR_SIZE * CURSOR_SIZE * 4) as usize];
        connector.set_cursor(Some(&image)).unwrap();
        connector.set_cursor_pos(10, 20).unwrap();
        connector.set_cursor(None).unwrap();
        let calls = kms.calls();
        assert!(calls.contains(&Call::SetCursor { crtc: 300, visible: true }));
        assert!(calls.contains(&Call::MoveCursor { crtc: 300, x: 10, y: 20 }));
        assert!(calls.contains(&Call::SetCursor { crtc: 300, visible: false }));

        connector.set_gamma(&linear_ramp(16)).unwrap();
        connector.uninitialize().unwrap();
        assert!(kms.calls().contains(&Call::SetCrtc { crtc: 300, fb: None }));
    }

    #[test]
    fn atomic_cursor() {
        let (platform, _core, connector) = single(Config::default());
        let kms = platform.kms(0);
        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        wait_until("a frame", || painter.flipped.load(Ordering::SeqCst) >= 1);

        assert!(connector.set_cursor(Some(&[0; 16])).is_err());
        let image = vec![0xff; (CURSOR_SIZE * CURSOR_SIZE * 4) as usize];
        connector.set_cursor(Some(&image)).unwrap();
        wait_until("the cursor commit", || kms.last_value(401, "CRTC_W") == Some(64));
        assert_eq!(kms.last_value(401, "CRTC_ID"), Some(300));
        // Only atomic changes, nothing repainted
        assert_eq!(painter.painted.load(Ordering::SeqCst), 1);

        connector.set_cursor_pos(5, -3).unwrap();
        wait_until("the position commit", || kms.last_value(401, "CRTC_X") == Some(5));
        assert_eq!(kms.last_value(401, "CRTC_Y"), Some(-3i64 as u64));

        connector.set_cursor(None).unwrap();
        wait_until("the cursor to hide", || kms.last_value(401, "FB_ID") == Some(0));
        assert!(kms.calls().iter().all(|c| !matches!(c, Call::SetCursor { .. })));
        connector.uninitialize().unwrap();
        assert_eq!(kms.fb_count(), 0);
    }

    #[test]
    fn cursor_plane_handed_over() {
        // One cursor plane for two connectors
        let (_platform, core) = fake::core(vec![FakeGpu::new(0, 2)], Config::default());
        let device = core.devices()[0].clone();
        let spare = device.planes()[3].clone();
        spare.set_leased(true);
        let (a, b) = (device.connectors()[0].clone(), device.connectors()[1].clone());
        a.initialize(Arc::new(Painter::default())).unwrap();
        b.initialize(Arc::new(Painter::default())).unwrap();
        assert!(a.current_cursor_plane().is_some());
        assert!(b.current_cursor_plane().is_none());
        assert!(!b.has_hardware_cursor());

        a.uninitialize().unwrap();
        assert_eq!(b.current_cursor_plane().unwrap().id(), 401);
        assert!(b.has_hardware_cursor());
        b.uninitialize().unwrap();
    }

    #[test]
    fn gamma_and_content_type() {
        let (platform, _core, connector) = single(Config::default());
        let kms = platform.kms(0);
        assert_eq!(connector.gamma_size(), 0);
        assert!(connector.set_gamma(&[0; 48]).is_err());

        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        assert_eq!(connector.gamma_size(), 16);
        wait_until("a frame", || painter.flipped.load(Ordering::SeqCst) >= 1);
        // The linear ramp is loaded during the mode set.
        let initial = kms.last_value(300, "GAMMA_LUT").unwrap();
        assert_ne!(initial, 0);

        assert!(matches!(connector.set_gamma(&[0; 10]), Err(Error::InvalidArgument(_))));
        connector.set_gamma(&[0x1000; 48]).unwrap();
        wait_until("the gamma commit", || kms.last_value(300, "GAMMA_LUT") != Some(initial));

        connector.set_content_type(ContentType::Game);
        wait_until("the content type commit", || {
            kms.last_value(100, "content type") == Some(ContentType::Game as u64)
        });
        assert_eq!(connector.content_type(), ContentType::Game);
        connector.uninitialize().unwrap();
        assert!(connector.lock_render().gamma.is_none());
    }

    #[test]
    fn gamma_ramp_layout() {
        let ramp = linear_ramp(3);
        assert_eq!(ramp, [0, 32767, 65535, 0, 32767, 65535, 0, 32767, 65535]);
        let blob = gamma_lut_blob(&ramp);
        assert_eq!(blob.len(), 3 * 8);
        assert_eq!(&blob[8..16], &[32767u16, 32767, 32767, 0]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect::<Vec<_>>()[..]);
    }

    #[test]
    fn mode_change_and_revert() {
        let (platform, _core, connector) = single(Config::default());
        let kms = platform.kms(0);
        let modes = connector.modes();
        let (small, large) = (modes[0].clone(), modes[1].clone());

        // Before initialization the mode is only recorded.
        connector.set_mode(&small).unwrap();
        assert!(Arc::ptr_eq(&connector.current_mode().unwrap(), &small));

        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        assert_eq!(connector.buffer(0).unwrap().width(), 32);
        connector.set_mode(&small).unwrap();
        assert_eq!(painter.resized.load(Ordering::SeqCst), 0);

        connector.set_mode(&large).unwrap();
        assert_eq!(connector.state(), ConnectorState::Initialized);
        assert_eq!(painter.resized.load(Ordering::SeqCst), 1);
        assert_eq!(connector.buffer(0).unwrap().width(), 64);

        kms.fail_modeset.store(true, Ordering::Relaxed);
        assert!(matches!(connector.set_mode(&small), Err(Error::ModeReverted)));
        assert_eq!(connector.state(), ConnectorState::Initialized);
        assert!(Arc::ptr_eq(&connector.current_mode().unwrap(), &large));
        kms.fail_modeset.store(false, Ordering::Relaxed);

        let other = _core.devices()[0].connectors()[1].modes()[0].clone();
        assert!(matches!(connector.set_mode(&other), Err(Error::InvalidArgument(_))));
        connector.uninitialize().unwrap();
    }

    #[test]
    fn failed_initialization_releases_resources() {
        let (platform, core, connector) = single(Config::default());
        platform.kms(0).fail_modeset.store(true, Ordering::Relaxed);
        let painter = Arc::new(Painter::default());
        assert!(matches!(
            connector.initialize(painter.clone()),
            Err(Error::InitializationFailed)
        ));
        assert_eq!(connector.state(), ConnectorState::Uninitialized);
        assert_eq!(painter.initialized.load(Ordering::SeqCst), 0);
        assert!(core.devices()[0].crtcs()[0].is_free());
        assert_eq!(platform.kms(0).fb_count(), 0);
    }

    #[test]
    fn pause_and_resume() {
        let (platform, _core, connector) = single(Config::default());
        let kms = platform.kms(0);
        assert!(matches!(connector.pause(), Err(Error::InvalidState(_))));
        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        wait_until("a frame", || painter.flipped.load(Ordering::SeqCst) >= 1);

        connector.pause().unwrap();
        assert_eq!(connector.state(), ConnectorState::Suspended);
        assert_eq!(kms.last_value(300, "ACTIVE"), Some(0));
        connector.pause().unwrap();
        assert!(matches!(connector.repaint(), Err(Error::InvalidState(_))));

        let painted = painter.painted.load(Ordering::SeqCst);
        connector.resume().unwrap();
        assert_eq!(connector.state(), ConnectorState::Initialized);
        assert_eq!(kms.last_value(300, "ACTIVE"), Some(1));
        wait_until("a frame after resuming", || {
            painter.painted.load(Ordering::SeqCst) > painted
        });
        connector.resume().unwrap();

        // Uninitializing a paused connector works too.
        connector.pause().unwrap();
        connector.uninitialize().unwrap();
        assert_eq!(painter.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn damage() {
        let (_platform, _core, connector) = single(Config::default());
        assert!(!connector.has_buffer_damage_support());
        assert!(matches!(
            connector.set_buffer_damage(&[Rect::new(0, 0, 4, 4)]),
            Err(Error::Unsupported(_))
        ));
        assert!(connector.lock_render().damage.is_empty());

        let (_platform, core) = secondary_gpu(0, true);
        let connector = core.devices()[1].connectors()[0].clone();
        assert!(connector.has_buffer_damage_support());
        connector.set_buffer_damage(&[Rect::new(0, 0, 4, 4)]).unwrap();
        assert_eq!(connector.lock_render().damage.len(), 1);
        assert!(connector.set_buffer_damage(&[]).is_err());
        assert!(connector.lock_render().damage.is_empty());
    }

    #[test]
    fn damage_far_outside_the_frame() {
        let (platform, core) = secondary_gpu(0, true);
        let connector = core.devices()[1].connectors()[0].clone();
        connector
            .set_buffer_damage(&[Rect::new(i32::MAX - 1, 0, 10, 10), Rect::new(0, 0, 8, 8)])
            .unwrap();
        paint_twice(&connector);
        assert_eq!(connector.state(), ConnectorState::Initialized);
        connector.uninitialize().unwrap();
        assert_eq!(platform.kms(1).dumb_count(), 0);
    }

    /// Panics on the first frame.
    struct Panicker;

    impl ConnectorInterface for Panicker {
        fn paint(&self, _connector: &Arc<Connector>, _frame: &Frame) {
            panic!("paint failed");
        }
    }

    #[test]
    fn panicking_painter() {
        let (platform, core, connector) = single(Config::default());
        // The first frame may already have failed when initialize returns.
        let result = connector.initialize(Arc::new(Panicker));
        assert!(matches!(result, Ok(()) | Err(Error::InitializationFailed)));
        wait_until("the render thread to give up", || {
            connector.state() == ConnectorState::Uninitialized
        });
        connector.uninitialize().unwrap();
        assert!(core.devices()[0].crtcs()[0].is_free());
        assert!(connector.current_crtc().is_none());
        assert_eq!(platform.kms(0).fb_count(), 0);

        // The connector is usable again.
        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        wait_until("a frame", || painter.flipped.load(Ordering::SeqCst) >= 1);
        connector.uninitialize().unwrap();
        assert_eq!(connector.state(), ConnectorState::Uninitialized);
    }

    #[test]
    fn vsync_fallback() {
        let (platform, _core, connector) = single(Config::default());
        let kms = platform.kms(0);
        assert!(connector.can_disable_vsync());
        connector.enable_vsync(false).unwrap();
        assert!(!connector.is_vsync_enabled());
        kms.reject_async.store(true, Ordering::Relaxed);

        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        wait_until("a frame", || painter.flipped.load(Ordering::SeqCst) >= 1);
        // The async flip was rejected and retried with vsync.
        assert!(kms.commit_attempts() > kms.commits().len());
        assert!(kms
            .commits()
            .iter()
            .all(|(_, f)| !f.contains(CommitFlags::PAGE_FLIP_ASYNC)));
        connector.uninitialize().unwrap();
    }

    #[test]
    fn vsync_needs_async_flips() {
        let gpu = FakeGpu::new(0, 1);
        gpu.kms.set_cap(DriverCap::AtomicAsyncPageFlip, 0);
        let (_platform, core) = fake::core(vec![gpu], Config::default());
        let connector = core.devices()[0].connectors()[0].clone();
        assert!(!connector.can_disable_vsync());
        assert!(matches!(connector.enable_vsync(false), Err(Error::Unsupported(_))));
        assert!(connector.is_vsync_enabled());
    }

    fn secondary_gpu(prime: u64, dumb: bool) -> (Arc<fake::FakePlatform>, Arc<Core>) {
        logging();
        let gpus = vec![FakeGpu::new(0, 1), FakeGpu::new(1, 1).without_renderer()];
        gpus[1].kms.set_cap(DriverCap::Prime, prime);
        gpus[1].kms.set_cap(DriverCap::DumbBuffer, dumb as u64);
        fake::core(gpus, Config::default())
    }

    fn paint_twice(connector: &Arc<Connector>) -> Arc<Painter> {
        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        wait_until("a frame", || painter.flipped.load(Ordering::SeqCst) >= 1);
        connector.repaint().unwrap();
        wait_until("a second frame", || painter.flipped.load(Ordering::SeqCst) >= 2);
        painter
    }

    #[test]
    fn prime_rendering() {
        let (platform, core) = secondary_gpu(PRIME_CAP_IMPORT, true);
        let device = core.devices()[1].clone();
        assert_eq!(device.render_mode(), RenderMode::Prime);
        let connector = device.connectors()[0].clone();
        paint_twice(&connector);
        // Imported framebuffers live on the display device.
        assert_eq!(platform.kms(1).fb_count(), 2);
        assert!(Arc::ptr_eq(
            &connector.buffer(0).unwrap().allocator_device().unwrap(),
            &core.devices()[0]
        ));
        assert!(connector.has_buffer_damage_support());
        connector.uninitialize().unwrap();
        assert_eq!(platform.kms(1).fb_count(), 0);
    }

    #[test]
    fn dumb_rendering() {
        let (platform, core) = secondary_gpu(0, true);
        let device = core.devices()[1].clone();
        assert_eq!(device.render_mode(), RenderMode::Dumb);
        let connector = device.connectors()[0].clone();
        connector.set_buffer_damage(&[Rect::new(0, 0, 8, 8)]).unwrap();
        paint_twice(&connector);
        assert_eq!(platform.kms(1).dumb_count(), 2);
        connector.uninitialize().unwrap();
        assert_eq!(platform.kms(1).dumb_count(), 0);
        assert_eq!(platform.kms(1).fb_count(), 0);
    }

    #[test]
    fn cpu_rendering() {
        let (platform, core) = secondary_gpu(0, false);
        let device = core.devices()[1].clone();
        assert_eq!(device.render_mode(), RenderMode::Cpu);
        let connector = device.connectors()[0].clone();
        paint_twice(&connector);
        assert_eq!(platform.kms(1).fb_count(), 2);
        connector.uninitialize().unwrap();
        assert_eq!(platform.kms(1).fb_count(), 0);
    }

    #[test]
    fn custom_scanout_buffer() {
        let (platform, core, connector) = single(Config::default());
        let kms = platform.kms(0);
        let device = core.devices()[0].clone();
        let painter = paint_twice(&connector);

        let wrong = Buffer::create_from_cpu(&core, Some(&device), 8, 8, 32, &[], format::XRGB8888)
            .unwrap();
        assert!(connector.set_custom_scanout_buffer(Some(wrong)).is_err());
        let bo = device
            .allocator()
            .create_bo(64, 48, format::XRGB8888, &[], BoUsage::SCANOUT)
            .unwrap();
        let buffer = Buffer::create_from_gbm(&core, Arc::from(bo)).unwrap();
        let fb = buffer.framebuffer(&device).unwrap();
        connector.set_custom_scanout_buffer(Some(buffer)).unwrap();
        connector.repaint().unwrap();
        wait_until("the custom frame", || painter.flipped.load(Ordering::SeqCst) >= 3);
        assert!(kms
            .commits()
            .iter()
            .any(|(props, _)| props.contains(&(400, fake::prop_id("FB_ID"), fb as u64))));
        connector.uninitialize().unwrap();

        let config = Config {
            disable_direct_scanout: true,
            ..Default::default()
        };
        let (_p, _c, connector) = single(config);
        assert!(matches!(
            connector.set_custom_scanout_buffer(None),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn unplug_uninitializes() {
        let (platform, core, connector) = single(Config::default());
        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        platform.kms(0).set_connected(0, false);
        core.devices()[0].dispatch_hotplug_events();
        assert_eq!(connector.state(), ConnectorState::Uninitialized);
        assert_eq!(painter.finished.load(Ordering::SeqCst), 1);
        assert!(connector.modes().is_empty());
    }

    #[test]
    fn dropping_the_core_stops_render_threads() {
        let (_platform, core, connector) = single(Config::default());
        let painter = Arc::new(Painter::default());
        connector.initialize(painter.clone()).unwrap();
        drop(core);
        assert_eq!(connector.state(), ConnectorState::Uninitialized);
        assert_eq!(painter.finished.load(Ordering::SeqCst), 1);
    }
}
