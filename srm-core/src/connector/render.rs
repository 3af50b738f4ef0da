//! The render thread of an initialized connector
//!
//! The thread owns the swapchain and the CRTC. It sleeps on the connector's
//! condition variable until the public API hands it work by changing the
//! connector state, flagging a repaint, or queueing atomic changes.

use std::{
    io,
    os::fd::AsFd,
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use memmap2::MmapMut;
use rustix::io::Errno;

use super::{
    gamma_lut_blob, linear_ramp, uses_legacy_cursor, Configuration, Connector,
    ConnectorInterface, Frame, Swapchain, CURSOR_SIZE,
};
use crate::{
    atomic::AtomicRequest,
    backend::{
        BoUsage, BufferObject, CommitFlags, DumbBuffer, FbLayout, Kms, Renderer,
        RendererExtensions,
    },
    buffer::{fb_layout, Buffer},
    core::{mark_render_thread, Core},
    device::Device,
    error::{Error, Result},
    format,
    mode::ConnectorMode,
    property::{PropertyBlob, LINK_STATUS_GOOD},
    types::{AtomicChanges, Caps, ConnectorState, PresentationTime, Rect, RenderMode},
};

const FLIP_TIMEOUT: Duration = Duration::from_secs(1);

/// Pixel format of the swapchain images.
const IMAGE_FORMAT: u32 = format::XRGB8888;

pub(super) fn spawn(connector: Arc<Connector>) -> io::Result<JoinHandle<()>> {
    let name = connector.name();
    std::thread::Builder::new()
        .name(format!("srm-{name}"))
        .spawn(move || {
            mark_render_thread();
            let span = tracing::info_span!("connector", %name);
            let _enter = span.enter();
            run(connector);
        })
}

/// Gives the connector back if the render thread unwinds, so waiters are
/// not left behind on a state that never changes.
struct UnwindGuard<'a>(&'a Connector);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return
        }
        tracing::error!("Render thread panicked, giving up the connector");
        self.0.release_resources();
        finish(self.0);
    }
}

fn run(connector: Arc<Connector>) {
    let _guard = UnwindGuard(&connector);
    let mut cx = match Context::new(&connector) {
        Ok(cx) => cx,
        Err(e) => {
            tracing::error!("Failed to set up the render thread: {e}");
            finish(&connector);
            return
        },
    };
    if let Err(e) = cx.start() {
        tracing::error!("Failed to initialize: {e}");
        drop(cx);
        finish(&connector);
        return
    }

    cx.interface.initialize(&connector);
    {
        let mut st = connector.lock_render();
        st.state = ConnectorState::Initialized;
        st.repaint = true;
    }
    connector.notify();
    cx.run();
}

fn finish(connector: &Connector) {
    connector.lock_render().state = ConnectorState::Uninitialized;
    connector.notify();
}

/// Where the pixels of a swapchain image end up.
enum Storage {
    /// Rendered by the display device, scanned out as is
    Direct,
    /// Rendered elsewhere, imported into the display device
    Prime { handle: u32 },
    /// Copied into a dumb buffer
    Dumb {
        dumb:   DumbBuffer,
        map:    Option<MmapMut>,
        target: u32,
    },
    /// Copied into a mapped buffer of the display device
    Cpu { scanout: Arc<Buffer>, target: u32 },
}

struct Image {
    /// What the interface paints into
    render:  Arc<Buffer>,
    /// Framebuffer on the display device
    fb:      u32,
    storage: Storage,
    kms:     Arc<dyn Kms>,
    backend: Arc<dyn Renderer>,
}

impl Drop for Image {
    fn drop(&mut self) {
        // Framebuffers of Direct and Cpu images belong to their buffers.
        let owns_fb = matches!(self.storage, Storage::Prime { .. } | Storage::Dumb { .. });
        if owns_fb && self.fb != 0 {
            if let Err(e) = self.kms.remove_fb(self.fb) {
                tracing::warn!("Failed to remove framebuffer {}: {e}", self.fb);
            }
        }
        match &mut self.storage {
            Storage::Direct => (),
            Storage::Prime { handle } =>
                if let Err(e) = self.kms.close_handle(*handle) {
                    tracing::warn!("Failed to close imported handle {handle}: {e}");
                },
            Storage::Dumb { dumb, map, target } => {
                self.backend.destroy_target(*target);
                map.take();
                if let Err(e) = self.kms.destroy_dumb(dumb.handle) {
                    tracing::warn!("Failed to destroy dumb buffer {}: {e}", dumb.handle);
                }
            },
            Storage::Cpu { target, .. } => self.backend.destroy_target(*target),
        }
    }
}

/// Swap the red and blue channel of 32 bit pixels in `rect`.
fn swap_red_blue(data: &mut [u8], stride: usize, width: usize, height: usize) {
    for row in data.chunks_mut(stride).take(height) {
        for px in row[..width * 4].chunks_exact_mut(4) {
            px.swap(0, 2);
        }
    }
}

struct Context {
    connector:      Arc<Connector>,
    device:         Arc<Device>,
    renderer:       Arc<Device>,
    backend:        Arc<dyn Renderer>,
    core:           Weak<Core>,
    kms:            Arc<dyn Kms>,
    interface:      Arc<dyn ConnectorInterface>,
    config:         Configuration,
    mode:           Arc<ConnectorMode>,
    render_mode:    RenderMode,
    legacy_cursor:  bool,
    images:         Vec<Image>,
    mode_blob:      Option<PropertyBlob>,
    gamma_blob:     Option<Arc<PropertyBlob>>,
    /// Framebuffer of the last flip, 0 when the CRTC is off
    last_fb:        u32,
    first_flip:     bool,
    pending_flip:   bool,
    last_flip:      Option<Instant>,
    /// Buffers referenced by the scanned out and the pending framebuffer
    on_screen:      Option<Arc<Buffer>>,
    pending_buffer: Option<Arc<Buffer>>,
    suspended:      bool,
}

impl Context {
    fn new(connector: &Arc<Connector>) -> Result<Self> {
        let device = connector.device().ok_or(Error::Gone)?;
        let core = device.core().ok_or(Error::Gone)?;
        let renderer = device
            .renderer()
            .ok_or(Error::Unsupported("no renderer is assigned to the device"))?;
        let backend = renderer
            .renderer_backend()
            .cloned()
            .ok_or(Error::Unsupported("the rendering device has no renderer"))?;
        let (interface, config, mode) = {
            let st = connector.lock_render();
            (st.interface.clone(), st.config.clone(), st.current_mode.clone())
        };
        let state = ConnectorState::Initializing;
        Ok(Self {
            interface: interface.ok_or(Error::InvalidState(state))?,
            config: config.ok_or(Error::InvalidState(state))?,
            mode: mode.ok_or(Error::InvalidState(state))?,
            render_mode: device.render_mode(),
            legacy_cursor: uses_legacy_cursor(&device, core.config()),
            kms: device.kms().clone(),
            core: Arc::downgrade(&core),
            connector: connector.clone(),
            device,
            renderer,
            backend,
            images: Vec::new(),
            mode_blob: None,
            gamma_blob: None,
            last_fb: 0,
            first_flip: true,
            pending_flip: false,
            last_flip: None,
            on_screen: None,
            pending_buffer: None,
            suspended: false,
        })
    }

    fn start(&mut self) -> Result<()> {
        tracing::debug!(
            "Rendering {} with {} ({}), crtc {}",
            self.mode,
            self.renderer.short_name(),
            self.render_mode,
            self.config.crtc.id()
        );
        self.load_linear_gamma();
        self.create_images()?;
        self.setup_crtc()
    }

    fn load_linear_gamma(&self) {
        let crtc = &self.config.crtc;
        let n = crtc.gamma_size() as usize;
        if n < 2 {
            return
        }
        let ramp = linear_ramp(n);
        if self.device.is_atomic() {
            if crtc.props().gamma_lut != 0 {
                let mut st = self.connector.lock_render();
                st.gamma = Some(ramp);
                st.changes |= AtomicChanges::GAMMA_LUT;
            }
        } else if let Err(e) =
            self.kms
                .set_gamma(crtc.id(), &ramp[..n], &ramp[n..2 * n], &ramp[2 * n..])
        {
            tracing::debug!("Failed to load a linear gamma ramp: {e}");
        }
    }

    fn run(&mut self) {
        loop {
            let mut st = self.connector.wait_for_work(self.connector.lock_render());
            match st.state {
                ConnectorState::Uninitializing => {
                    drop(st);
                    self.teardown();
                    finish(&self.connector);
                    return
                },
                ConnectorState::ChangingMode => {
                    let target = st.target_mode.take();
                    drop(st);
                    let result = match target {
                        Some(mode) => self.change_mode(mode),
                        None => Ok(()),
                    };
                    let state = match result {
                        Ok(()) => {
                            self.interface.resize(&self.connector);
                            ConnectorState::Initialized
                        },
                        Err(e) => {
                            tracing::warn!("Mode change failed: {e}");
                            ConnectorState::RevertingMode
                        },
                    };
                    let mut st = self.connector.lock_render();
                    st.state = state;
                    st.repaint = true;
                    drop(st);
                    self.connector.notify();
                },
                ConnectorState::Suspending => {
                    drop(st);
                    self.disable();
                    self.suspended = true;
                    self.connector.lock_render().state = ConnectorState::Suspended;
                    self.connector.notify();
                },
                ConnectorState::Resuming => {
                    drop(st);
                    if let Err(e) = self.setup_crtc() {
                        tracing::error!("Failed to restore the CRTC: {e}");
                    }
                    let mut st = self.connector.lock_render();
                    st.state = ConnectorState::Initialized;
                    st.repaint = true;
                    st.swapchain.reset();
                    drop(st);
                    self.connector.notify();
                },
                ConnectorState::Initialized => {
                    let repaint = std::mem::take(&mut st.repaint);
                    drop(st);
                    let result = if repaint {
                        self.render_frame()
                    } else {
                        self.recommit()
                    };
                    if let Err(e) = result {
                        tracing::error!("Failed to present a frame: {e}");
                    }
                },
                _ => (),
            }
        }
    }

    fn teardown(&mut self) {
        self.wait_flip();
        self.interface.uninitialize(&self.connector);
        if !self.suspended {
            self.disable();
        }
        self.destroy_images();
        self.gamma_blob = None;
    }

    fn destroy_images(&mut self) {
        self.on_screen = None;
        self.pending_buffer = None;
        self.images.clear();
        let mut st = self.connector.lock_render();
        st.buffers.clear();
        st.swapchain = Swapchain::default();
    }

    fn change_mode(&mut self, mode: Arc<ConnectorMode>) -> Result<()> {
        tracing::info!("Changing mode from {} to {mode}", self.mode);
        self.wait_flip();
        self.destroy_images();
        self.mode = mode;
        self.create_images()?;
        self.setup_crtc()
    }

    fn create_images(&mut self) -> Result<()> {
        let core = self.core.upgrade().ok_or(Error::Gone)?;
        let count = core.config().fb_count(self.render_mode);
        self.images.clear();
        for _ in 0..count {
            let image = self.create_image(&core)?;
            self.images.push(image);
        }
        let buffers = self.images.iter().map(|i| i.render.clone()).collect();
        let mut st = self.connector.lock_render();
        st.buffers = buffers;
        st.swapchain = Swapchain::new(count);
        Ok(())
    }

    fn image(&self, render: Arc<Buffer>, fb: u32, storage: Storage) -> Image {
        Image {
            render,
            fb,
            storage,
            kms: self.kms.clone(),
            backend: self.backend.clone(),
        }
    }

    /// A texture backed buffer of the renderer, and a render target for
    /// reading it back.
    fn readable_buffer(&self, core: &Arc<Core>) -> Result<(Arc<Buffer>, u32)> {
        let (w, h) = (self.mode.width(), self.mode.height());
        let render =
            Buffer::create_from_cpu(core, Some(&self.renderer), w, h, w * 4, &[], IMAGE_FORMAT)?;
        let target = self.backend.create_target(&render.texture(&self.renderer)?)?;
        Ok((render, target))
    }

    fn create_image(&self, core: &Arc<Core>) -> Result<Image> {
        let (w, h) = (self.mode.width(), self.mode.height());
        match self.render_mode {
            RenderMode::Itself => {
                let bo = self.device.allocator().create_bo(
                    w,
                    h,
                    IMAGE_FORMAT,
                    &[],
                    BoUsage::SCANOUT | BoUsage::RENDERING,
                )?;
                let render = Buffer::create_from_gbm(core, Arc::from(bo))?;
                let fb = render.framebuffer(&self.device)?;
                Ok(self.image(render, fb, Storage::Direct))
            },
            RenderMode::Prime => {
                let allocator = self.renderer.allocator();
                let usage = BoUsage::RENDERING | BoUsage::LINEAR;
                let bo = allocator
                    .create_bo(w, h, IMAGE_FORMAT, &[format::MOD_LINEAR], usage)
                    .or_else(|e| {
                        tracing::debug!("Linear allocation with explicit modifier failed: {e}");
                        allocator.create_bo(w, h, IMAGE_FORMAT, &[], usage)
                    })?;
                let bo: Arc<dyn BufferObject> = Arc::from(bo);
                let render = Buffer::create_from_gbm(core, bo.clone())?;
                let fd = bo.export_fd(0)?;
                let handle = self.kms.prime_import(fd.as_fd())?;
                let mut image = self.image(render, 0, Storage::Prime { handle });
                let mut layout =
                    fb_layout(&*bo, self.device.caps().contains(Caps::ADD_FB2_MODIFIERS));
                layout.handles[..layout.planes].fill(handle);
                image.fb = self.kms.add_fb(&layout)?;
                Ok(image)
            },
            RenderMode::Dumb => {
                let (render, target) = self.readable_buffer(core)?;
                let dumb = match self.kms.create_dumb(w, h, 32) {
                    Ok(dumb) => dumb,
                    Err(e) => {
                        self.backend.destroy_target(target);
                        return Err(e.into())
                    },
                };
                let mut image = self.image(render, 0, Storage::Dumb {
                    dumb,
                    map: None,
                    target,
                });
                let mapped = self.kms.map_dumb(&dumb)?;
                if let Storage::Dumb { map, .. } = &mut image.storage {
                    *map = Some(mapped);
                }
                let mut layout = FbLayout {
                    width: w,
                    height: h,
                    format: IMAGE_FORMAT,
                    planes: 1,
                    ..Default::default()
                };
                layout.handles[0] = dumb.handle;
                layout.pitches[0] = dumb.pitch;
                image.fb = self.kms.add_fb(&layout)?;
                Ok(image)
            },
            RenderMode::Cpu => {
                let scanout =
                    Buffer::create_from_cpu(core, Some(&self.device), w, h, w * 4, &[], IMAGE_FORMAT)?;
                let fb = scanout.framebuffer(&self.device)?;
                let (render, target) = self.readable_buffer(core)?;
                Ok(self.image(render, fb, Storage::Cpu { scanout, target }))
            },
            RenderMode::None => Err(Error::Unsupported("no renderer is assigned to the device")),
        }
    }

    /// Make the frame in image `index` available to the display device.
    fn transfer(&mut self, index: usize) -> Result<()> {
        let damage = std::mem::take(&mut self.connector.lock_render().damage);
        let (w, h) = (self.mode.width(), self.mode.height());
        let rects: Vec<Rect> = if damage.is_empty() {
            vec![Rect::new(0, 0, w as i32, h as i32)]
        } else {
            damage
                .iter()
                .map(|r| r.clamp_to(w, h))
                .filter(|r| !r.is_empty())
                .collect()
        };
        let bgra = self
            .renderer
            .renderer_extensions()
            .contains(RendererExtensions::READ_FORMAT_BGRA);
        let backend = &self.backend;

        match &mut self.images[index].storage {
            Storage::Dumb {
                dumb,
                map: Some(map),
                target,
            } => {
                let pitch = dumb.pitch as usize;
                for r in rects {
                    let offset = r.y as usize * pitch + r.x as usize * 4;
                    let dst = &mut map[offset..];
                    backend.read_pixels(*target, r, bgra, dumb.pitch, dst)?;
                    if !bgra {
                        swap_red_blue(dst, pitch, r.width as usize, r.height as usize);
                    }
                }
            },
            Storage::Cpu { scanout, target } => {
                let mut pixels = Vec::new();
                for r in rects {
                    let stride = r.width as usize * 4;
                    pixels.resize(stride * r.height as usize, 0);
                    backend.read_pixels(*target, r, bgra, stride as u32, &mut pixels)?;
                    if !bgra {
                        swap_red_blue(&mut pixels, stride, r.width as usize, r.height as usize);
                    }
                    scanout.write(
                        stride as u32,
                        r.x as u32,
                        r.y as u32,
                        r.width as u32,
                        r.height as u32,
                        &pixels,
                    )?;
                }
            },
            _ => backend.finish()?,
        }
        Ok(())
    }

    fn render_frame(&mut self) -> Result<()> {
        let (index, age) = {
            let st = self.connector.lock_render();
            (st.swapchain.index(), st.swapchain.age())
        };
        let Some(image) = self.images.get(index) else {
            return Ok(())
        };
        let frame = Frame {
            index,
            age,
            buffer: image.render.clone(),
            renderer: self.renderer.clone(),
        };
        self.interface.paint(&self.connector, &frame);
        self.transfer(index)?;

        let custom = self.connector.lock_render().custom_scanout.take();
        let custom = custom.and_then(|buffer| match buffer.framebuffer(&self.device) {
            Ok(fb) => Some((fb, buffer)),
            Err(e) => {
                tracing::debug!("Custom scanout buffer rejected: {e}");
                None
            },
        });
        let (fb, buffer) = custom.unwrap_or_else(|| {
            let image = &self.images[index];
            (image.fb, image.render.clone())
        });

        self.throttle();
        self.flip(fb, Some(buffer))?;
        self.connector.lock_render().swapchain.advance();
        Ok(())
    }

    /// Push pending atomic changes without a new frame.
    fn recommit(&mut self) -> Result<()> {
        let fb = match self.last_fb {
            0 => self.images.first().map_or(0, |i| i.fb),
            fb => fb,
        };
        if !self.device.is_atomic() || fb == 0 {
            self.connector.lock_render().changes = AtomicChanges::empty();
            return Ok(())
        }
        self.flip(fb, None)
    }

    /// Without vsync, frames are still kept at least half a refresh cycle
    /// apart.
    fn throttle(&mut self) {
        if self.connector.lock_render().vsync {
            return
        }
        let min = Duration::from_nanos(self.mode.period_ns() as u64 / 2);
        if let Some(elapsed) = self.last_flip.map(|t| t.elapsed()) {
            if elapsed < min {
                std::thread::sleep(min - elapsed);
            }
        }
        self.last_flip = Some(Instant::now());
    }

    fn add_primary(&self, req: &mut AtomicRequest, fb: u32) {
        let plane = &self.config.primary;
        let p = plane.props();
        let (w, h) = (self.mode.width() as u64, self.mode.height() as u64);
        let id = plane.id();
        req.add(id, p.fb_id, fb as u64);
        req.add(id, p.crtc_id, self.config.crtc.id() as u64);
        req.add(id, p.crtc_x, 0);
        req.add(id, p.crtc_y, 0);
        req.add(id, p.crtc_w, w);
        req.add(id, p.crtc_h, h);
        req.add(id, p.src_x, 0);
        req.add(id, p.src_y, 0);
        req.add(id, p.src_w, w << 16);
        req.add(id, p.src_h, h << 16);
    }

    /// Add the queued atomic changes to `req`, or all of the connector's
    /// state with `full`. Returns the changes that were taken.
    fn apply_changes(&mut self, req: &mut AtomicRequest, full: bool) -> AtomicChanges {
        let (changes, cursor_plane, cursor, gamma, content_type) = {
            let mut st = self.connector.lock_render();
            let changes = std::mem::take(&mut st.changes);
            let fb = st.cursor.images.get(st.cursor.front).map_or(0, |i| i.fb);
            let cursor = (st.cursor.visible && fb != 0, fb, st.cursor.x, st.cursor.y);
            let gamma = (full || changes.contains(AtomicChanges::GAMMA_LUT))
                .then(|| st.gamma.clone())
                .flatten();
            let plane = st.config.as_ref().and_then(|c| c.cursor.clone());
            (changes, plane, cursor, gamma, st.content_type)
        };

        let cursor_changes = AtomicChanges::CURSOR_BUFFER |
            AtomicChanges::CURSOR_POSITION |
            AtomicChanges::CURSOR_VISIBILITY;
        let crtc = self.config.crtc.id();
        if let Some(plane) = cursor_plane.filter(|_| !self.legacy_cursor) {
            if full || changes.intersects(cursor_changes) {
                let (id, p) = (plane.id(), plane.props());
                let (visible, fb, x, y) = cursor;
                if visible {
                    let size = CURSOR_SIZE as u64;
                    req.add(id, p.fb_id, fb as u64);
                    req.add(id, p.crtc_id, crtc as u64);
                    req.add(id, p.crtc_x, x as i64 as u64);
                    req.add(id, p.crtc_y, y as i64 as u64);
                    req.add(id, p.crtc_w, size);
                    req.add(id, p.crtc_h, size);
                    req.add(id, p.src_x, 0);
                    req.add(id, p.src_y, 0);
                    req.add(id, p.src_w, size << 16);
                    req.add(id, p.src_h, size << 16);
                } else {
                    req.add(id, p.fb_id, 0);
                    req.add(id, p.crtc_id, 0);
                }
            }
        }

        let gamma_lut = self.config.crtc.props().gamma_lut;
        if let Some(gamma) = gamma.filter(|_| gamma_lut != 0) {
            match PropertyBlob::new(&self.kms, &gamma_lut_blob(&gamma)) {
                Ok(blob) => {
                    let blob = Arc::new(blob);
                    req.add(crtc, gamma_lut, blob.id() as u64);
                    req.attach_blob(blob.clone());
                    self.gamma_blob = Some(blob);
                },
                Err(e) => tracing::warn!("Failed to create the gamma blob: {e}"),
            }
        }

        let props = self.connector.props();
        if props.content_type != 0 && (full || changes.contains(AtomicChanges::CONTENT_TYPE)) {
            req.add(self.connector.id(), props.content_type, content_type as u64);
        }
        changes
    }

    fn restore_changes(&self, changes: AtomicChanges) {
        self.connector.lock_render().changes |= changes;
    }

    fn flip(&mut self, fb: u32, buffer: Option<Arc<Buffer>>) -> Result<()> {
        self.wait_flip();
        let vsync = self.connector.lock_render().vsync;
        let mut flags = CommitFlags::PAGE_FLIP_EVENT;
        if !vsync {
            flags |= CommitFlags::PAGE_FLIP_ASYNC;
        }
        let rejected_async =
            |e: &Error| e.raw_os_error() == Some(Errno::INVAL.raw_os_error());

        if self.device.is_atomic() {
            let mut req = AtomicRequest::new(&self.kms);
            self.add_primary(&mut req, fb);
            let changes = self.apply_changes(&mut req, false);
            let flags = flags | CommitFlags::NONBLOCK;
            let result = match req.commit(flags, false) {
                Err(e) if !vsync && rejected_async(&e) => {
                    tracing::debug!("Async flip rejected, flipping on vblank");
                    req.commit(flags - CommitFlags::PAGE_FLIP_ASYNC, false)
                },
                r => r,
            };
            if let Err(e) = result {
                self.restore_changes(changes);
                return Err(e)
            }
        } else {
            self.connector.lock_render().changes = AtomicChanges::empty();
            let crtc = self.config.crtc.id();
            match self.kms.page_flip(crtc, fb, flags).map_err(Error::from) {
                Err(e) if !vsync && rejected_async(&e) => {
                    tracing::debug!("Async flip rejected, flipping on vblank");
                    self.kms
                        .page_flip(crtc, fb, flags - CommitFlags::PAGE_FLIP_ASYNC)?;
                },
                r => r?,
            }
        }

        self.last_fb = fb;
        self.pending_flip = true;
        if let Some(buffer) = buffer {
            self.pending_buffer = Some(buffer);
        }
        if self.images.len() == 2 || self.first_flip {
            self.first_flip = false;
            self.wait_flip();
        }
        Ok(())
    }

    fn wait_flip(&mut self) {
        if !std::mem::take(&mut self.pending_flip) {
            return
        }
        match self.kms.wait_page_flip(self.config.crtc.id(), FLIP_TIMEOUT) {
            Ok(Some(event)) => {
                if let Some(buffer) = self.pending_buffer.take() {
                    self.on_screen = Some(buffer);
                }
                self.connector.lock_render().presentation = PresentationTime {
                    sequence: event.sequence as u64,
                    time:     event.time,
                    period:   self.mode.period_ns(),
                };
                self.interface.page_flipped(&self.connector);
            },
            Ok(None) => tracing::warn!("Timed out waiting for a page flip"),
            Err(e) => tracing::warn!("Failed to wait for a page flip: {e}"),
        }
    }

    /// Light up the CRTC with the current mode, showing the first image.
    fn setup_crtc(&mut self) -> Result<()> {
        let fb = self
            .images
            .first()
            .map(|i| i.fb)
            .ok_or(Error::Buffer("no swapchain images"))?;
        let connector = self.connector.id();
        let crtc = self.config.crtc.id();

        let mut done = false;
        if self.device.is_atomic() {
            match self.modeset_atomic(fb) {
                Ok(()) => done = true,
                Err(e) => tracing::warn!("Atomic mode set failed ({e}), trying the legacy API"),
            }
        }
        if !done {
            self.kms
                .set_crtc(crtc, Some(fb), &[connector], Some(self.mode.info()))?;
        }
        self.last_fb = fb;
        self.first_flip = true;
        self.suspended = false;
        Ok(())
    }

    fn modeset_atomic(&mut self, fb: u32) -> Result<()> {
        let blob = PropertyBlob::new(&self.kms, &self.mode.info().to_bytes())?;
        let mut req = AtomicRequest::new(&self.kms);
        let crtc = self.config.crtc.clone();
        req.add(crtc.id(), crtc.props().mode_id, blob.id() as u64);
        req.add(crtc.id(), crtc.props().active, 1);
        let (id, props) = (self.connector.id(), self.connector.props());
        req.add(id, props.crtc_id, crtc.id() as u64);
        if props.link_status != 0 {
            req.add(id, props.link_status, LINK_STATUS_GOOD);
        }
        self.add_primary(&mut req, fb);
        let changes = self.apply_changes(&mut req, true);
        if let Err(e) = req.commit(CommitFlags::ALLOW_MODESET, true) {
            self.restore_changes(changes);
            return Err(e)
        }
        self.mode_blob = Some(blob);
        Ok(())
    }

    /// Turn the CRTC off and detach everything from it.
    fn disable(&mut self) {
        self.wait_flip();
        let crtc = self.config.crtc.id();
        let mut done = false;
        if self.device.is_atomic() {
            let mut req = AtomicRequest::new(&self.kms);
            let cursor = self.connector.lock_render().config.as_ref().and_then(|c| c.cursor.clone());
            for plane in std::iter::once(&self.config.primary).chain(cursor.as_ref()) {
                req.add(plane.id(), plane.props().fb_id, 0);
                req.add(plane.id(), plane.props().crtc_id, 0);
            }
            let props = self.connector.props();
            req.add(self.connector.id(), props.crtc_id, 0);
            req.add(crtc, self.config.crtc.props().active, 0);
            req.add(crtc, self.config.crtc.props().mode_id, 0);
            match req.commit(CommitFlags::ALLOW_MODESET, true) {
                Ok(()) => done = true,
                Err(e) => tracing::warn!("Atomic disable failed ({e}), trying the legacy API"),
            }
        }
        if !done {
            if self.legacy_cursor {
                if let Err(e) = self.kms.set_cursor(crtc, None) {
                    tracing::debug!("Failed to hide the cursor: {e}");
                }
            }
            if let Err(e) = self.kms.set_crtc(crtc, None, &[], None) {
                tracing::warn!("Failed to disable crtc {crtc}: {e}");
            }
        }
        self.mode_blob = None;
        self.last_fb = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn red_blue_swap_respects_stride() {
        let mut data = vec![
            1, 2, 3, 4, 5, 6, 7, 8, 0xaa, 0xaa, //
            9, 10, 11, 12, 13, 14, 15, 16, 0xbb, 0xbb,
        ];
        swap_red_blue(&mut data, 10, 2, 2);
        assert_eq!(&data[..10], &[3, 2, 1, 4, 7, 6, 5, 8, 0xaa, 0xaa]);
        assert_eq!(&data[10..], &[11, 10, 9, 12, 15, 14, 13, 16, 0xbb, 0xbb]);
    }
}
