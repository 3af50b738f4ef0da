//! Buffers shared between devices
//!
//! A [`Buffer`] is a 2D image owned by an allocator device. It can be
//! sampled by the renderer of any device that is able to import it, written
//! to from the CPU if its [`BufferCaps`] allow it, and scanned out directly
//! when it is backed by a buffer object of the presenting device.
//!
//! Buffers are reference counted, dropping the last [`Arc`] releases every
//! texture, framebuffer and mapping created for it.

use std::{
    os::fd::{AsFd, OwnedFd},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use crate::{
    backend::{
        software::copy_rows, BoUsage, BufferObject, DmaData, DmaPlane, FbLayout, Kms, MapAccess,
        Renderer, RendererExtensions, Texture, WlDrmBuffer,
    },
    core::Core,
    device::Device,
    error::{Error, Result},
    format::{self, drm_to_gl},
    types::{Caps, Rect},
};

mod map;

pub use crate::backend::TextureTarget;
use map::{dma_sync, DmaMapping, SyncAccess};

bitflags::bitflags! {
    /// What can be done with a buffer from the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferCaps: u32 {
        /// [`Buffer::read`] is supported
        const READ = 1;
        /// [`Buffer::write`] and [`Buffer::write_begin`] are supported
        const WRITE = 1 << 1;
        /// The buffer is mapped into our address space
        const MAP = 1 << 2;
    }
}

/// Where the storage of a buffer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSource {
    /// Allocated by us from CPU pixels
    Cpu,
    /// Imported DMA-BUF
    Dma,
    /// Imported `wl_drm` buffer
    WlDrm,
    /// Buffer object allocated by the user
    Gbm,
    /// Wrapped renderer texture
    Gl,
}

/// How CPU writes reach the storage of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Through a mapping of the exported DMA-BUF
    Prime,
    /// Through [`BufferObject::map`]
    Gbm,
    /// Through texture uploads
    Gles,
}

#[derive(Debug)]
struct Plane {
    /// Exported lazily from the buffer object when needed
    fd:       Option<OwnedFd>,
    offset:   u32,
    stride:   u32,
    modifier: u64,
}

struct CachedTexture {
    device:   Weak<Device>,
    renderer: Arc<dyn Renderer>,
    texture:  Texture,
    /// Whether the texture is destroyed together with the buffer
    owned:    bool,
}

struct Framebuffer {
    device: Weak<Device>,
    kms:    Arc<dyn Kms>,
    id:     u32,
}

#[derive(Default)]
struct Inner {
    planes:   Vec<Plane>,
    bo:       Option<Arc<dyn BufferObject>>,
    map:      Option<DmaMapping>,
    textures: Vec<CachedTexture>,
    fbs:      Vec<Framebuffer>,
}

impl Inner {
    fn cached_texture(&self, device: &Arc<Device>) -> Option<&CachedTexture> {
        self.textures.iter().find(|t| is_same_device(&t.device, device))
    }
}

fn is_same_device(weak: &Weak<Device>, device: &Arc<Device>) -> bool {
    std::ptr::eq(weak.as_ptr(), Arc::as_ptr(device))
}

/// A 2D image that can be shared between devices.
pub struct Buffer {
    allocator:   Weak<Device>,
    /// Short name of the allocator device, for logging
    device_name: String,
    src:         BufferSource,
    caps:        BufferCaps,
    width:       u32,
    height:      u32,
    format:      u32,
    pixel_size:  u32,
    target:      TextureTarget,
    write_mode:  Option<WriteMode>,
    inner:       Mutex<Inner>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("device", &self.device_name)
            .field("src", &self.src)
            .field("caps", &self.caps)
            .field("size", &(self.width, self.height))
            .field("format", &format::fourcc_name(self.format))
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

fn resolve_allocator(core: &Arc<Core>, allocator: Option<&Arc<Device>>) -> Result<Arc<Device>> {
    match allocator {
        Some(device) => Ok(device.clone()),
        None => core.allocator_device().ok_or(Error::NoDevices),
    }
}

/// Texture target for a buffer of `format` and `modifier` allocated on
/// `device`.
fn target_for(device: &Device, format: u32, modifier: u64) -> TextureTarget {
    if device.dma_render_formats().contains(format, modifier) {
        TextureTarget::Texture2D
    } else {
        TextureTarget::ExternalOes
    }
}

fn planes_of(bo: &dyn BufferObject) -> Vec<Plane> {
    (0..bo.plane_count().clamp(1, 4))
        .map(|i| Plane {
            fd:       None,
            offset:   bo.offset(i),
            stride:   bo.stride(i),
            modifier: bo.modifier(),
        })
        .collect()
}

/// Allocate a linear buffer object, trying less and less demanding
/// allocations until one succeeds.
fn allocate_linear_bo(
    device: &Device,
    width: u32,
    height: u32,
    format: u32,
) -> Result<Arc<dyn BufferObject>> {
    let linear = [format::MOD_LINEAR];
    let attempts: [(&[u64], BoUsage); 5] = [
        (&linear, BoUsage::RENDERING | BoUsage::LINEAR | BoUsage::SCANOUT),
        (&linear, BoUsage::RENDERING | BoUsage::LINEAR),
        (&linear, BoUsage::empty()),
        (&[], BoUsage::RENDERING | BoUsage::LINEAR | BoUsage::SCANOUT),
        (&[], BoUsage::RENDERING | BoUsage::LINEAR),
    ];
    let allocator = device.allocator();
    let mut last = None;
    for (modifiers, usage) in attempts {
        match allocator.create_bo(width, height, format, modifiers, usage) {
            Ok(bo) => return Ok(Arc::from(bo)),
            Err(e) => {
                tracing::trace!(
                    "[{}] Linear bo allocation with modifiers {modifiers:?}, usage {usage:?} \
                     failed: {e}",
                    device.short_name()
                );
                last = Some(e);
            },
        }
    }
    Err(last.map_or(Error::Buffer("failed to allocate a linear buffer object"), Error::from))
}

/// Map a buffer object through its DMA-BUF, falling back to testing
/// [`BufferObject::map`].
fn map_bo(
    bo: &dyn BufferObject,
    planes: &mut [Plane],
    height: u32,
    prefer_prime: bool,
) -> Option<(WriteMode, BufferCaps, Option<DmaMapping>)> {
    if prefer_prime {
        let mapped = bo.export_fd(0).and_then(|fd| {
            let len = planes[0].offset as usize + planes[0].stride as usize * height as usize;
            let map = DmaMapping::new(&fd, len)?;
            Ok((fd, map))
        });
        match mapped {
            Ok((fd, map)) => {
                let mut caps = BufferCaps::WRITE | BufferCaps::MAP;
                if map.is_readable() {
                    caps |= BufferCaps::READ;
                }
                planes[0].fd = Some(fd);
                return Some((WriteMode::Prime, caps, Some(map)))
            },
            Err(e) => tracing::debug!("Mapping the DMA-BUF failed ({e}), trying bo mapping"),
        }
    }

    let full = Rect::new(0, 0, bo.width() as i32, bo.height() as i32);
    if bo.map(full, MapAccess::ReadWrite, &mut |_: &mut [u8], _: u32| ()).is_ok() {
        return Some((
            WriteMode::Gbm,
            BufferCaps::READ | BufferCaps::WRITE | BufferCaps::MAP,
            None,
        ))
    }
    if bo.map(full, MapAccess::Write, &mut |_: &mut [u8], _: u32| ()).is_ok() {
        return Some((WriteMode::Gbm, BufferCaps::WRITE | BufferCaps::MAP, None))
    }
    None
}

impl Buffer {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a buffer from CPU pixels.
    ///
    /// `pixels` holds `height` rows `stride` bytes apart. It may be empty,
    /// in which case the contents are undefined. The buffer is allocated on
    /// `allocator`, or on the core's allocator device if `None`.
    pub fn create_from_cpu(
        core: &Arc<Core>,
        allocator: Option<&Arc<Device>>,
        width: u32,
        height: u32,
        stride: u32,
        pixels: &[u8],
        format: u32,
    ) -> Result<Arc<Self>> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("buffer size must not be zero"))
        }
        let (_, bpp) = format::depth_bpp(format).ok_or(Error::Unsupported("pixel format"))?;
        if bpp % 8 != 0 {
            return Err(Error::InvalidArgument("bits per pixel must be a multiple of 8"))
        }
        let device = resolve_allocator(core, allocator)?;
        let write_mode = device.cpu_write_mode();

        // Devices without a renderer can't fall back to textures, a mapped
        // bo is all they can offer.
        if write_mode != WriteMode::Gles &&
            (device.renderer_backend().is_none() ||
                device
                    .dma_texture_formats()
                    .contains(format, format::MOD_LINEAR))
        {
            match Self::cpu_bo(&device, width, height, format, write_mode == WriteMode::Prime) {
                Ok(buffer) => {
                    if !pixels.is_empty() {
                        buffer.write(stride, 0, 0, width, height, pixels)?;
                    }
                    return Ok(Arc::new(buffer))
                },
                Err(e) => tracing::debug!(
                    "[{}] Could not create a mapped buffer ({e}), using a texture",
                    device.short_name()
                ),
            }
        }
        Self::cpu_texture(&device, width, height, stride, pixels, format).map(Arc::new)
    }

    fn cpu_bo(
        device: &Arc<Device>,
        width: u32,
        height: u32,
        format: u32,
        prefer_prime: bool,
    ) -> Result<Self> {
        let bo = allocate_linear_bo(device, width, height, format)?;
        let mut planes = planes_of(&*bo);
        let (write_mode, caps, map) = map_bo(&*bo, &mut planes, height, prefer_prime)
            .ok_or(Error::Buffer("buffer object can not be mapped"))?;
        tracing::debug!(
            "[{}] CPU buffer {width}x{height} {} created, write mode {write_mode:?}",
            device.short_name(),
            format::fourcc_name(format)
        );
        Ok(Self {
            allocator: Arc::downgrade(device),
            device_name: device.short_name().to_owned(),
            src: BufferSource::Cpu,
            caps,
            width,
            height,
            format,
            pixel_size: bo.bpp() / 8,
            target: target_for(device, format, bo.modifier()),
            write_mode: Some(write_mode),
            inner: Mutex::new(Inner {
                planes,
                bo: Some(bo),
                map,
                ..Default::default()
            }),
        })
    }

    fn cpu_texture(
        device: &Arc<Device>,
        width: u32,
        height: u32,
        stride: u32,
        pixels: &[u8],
        format: u32,
    ) -> Result<Self> {
        let renderer = device
            .renderer_backend()
            .ok_or(Error::Unsupported("allocator device has no renderer"))?
            .clone();
        let gl = drm_to_gl(format).ok_or(Error::Unsupported("pixel format has no GL equivalent"))?;
        let texture = renderer.create_texture(width, height, gl, stride, pixels)?;
        let (_, bpp) = format::depth_bpp(format).unwrap_or((0, 32));
        let pixel_size = bpp / 8;
        Ok(Self {
            allocator: Arc::downgrade(device),
            device_name: device.short_name().to_owned(),
            src: BufferSource::Cpu,
            caps: BufferCaps::WRITE,
            width,
            height,
            format,
            pixel_size,
            target: TextureTarget::Texture2D,
            write_mode: Some(WriteMode::Gles),
            inner: Mutex::new(Inner {
                planes: vec![Plane {
                    fd:       None,
                    offset:   0,
                    stride:   pixel_size * width,
                    modifier: format::MOD_INVALID,
                }],
                textures: vec![CachedTexture {
                    device: Arc::downgrade(device),
                    renderer,
                    texture,
                    owned: true,
                }],
                ..Default::default()
            }),
        })
    }

    /// Import a DMA-BUF. The buffer takes ownership of the file descriptors.
    pub fn create_from_dma(
        core: &Arc<Core>,
        allocator: Option<&Arc<Device>>,
        dma: DmaData,
    ) -> Result<Arc<Self>> {
        if dma.planes.is_empty() || dma.planes.len() > 4 {
            return Err(Error::InvalidArgument("DMA buffers need 1 to 4 planes"))
        }
        if dma.width == 0 || dma.height == 0 {
            return Err(Error::InvalidArgument("buffer size must not be zero"))
        }
        let device = resolve_allocator(core, allocator)?;
        let extensions = device.renderer_extensions();
        if !extensions.contains(RendererExtensions::DMA_IMPORT_MODIFIERS) {
            return Err(Error::Unsupported("DMA-BUF import with modifiers"))
        }
        let target = target_for(&device, dma.format, dma.planes[0].modifier);
        if target == TextureTarget::ExternalOes &&
            !extensions.contains(RendererExtensions::IMAGE_EXTERNAL)
        {
            return Err(Error::Unsupported("external textures"))
        }

        // Only needed for direct scanout, so not being able to import is fine.
        let bo = match device.allocator().import_dma(&dma, BoUsage::SCANOUT) {
            Ok(bo) => Some(Arc::from(bo)),
            Err(e) => {
                tracing::debug!("[{}] DMA-BUF not importable as bo: {e}", device.short_name());
                None
            },
        };

        let DmaData {
            width,
            height,
            format,
            planes,
        } = dma;
        let planes = planes
            .into_iter()
            .map(|p| Plane {
                fd:       Some(p.fd),
                offset:   p.offset,
                stride:   p.stride,
                modifier: p.modifier,
            })
            .collect();
        Ok(Arc::new(Self {
            allocator: Arc::downgrade(&device),
            device_name: device.short_name().to_owned(),
            src: BufferSource::Dma,
            caps: BufferCaps::empty(),
            width,
            height,
            format,
            pixel_size: format::depth_bpp(format).map_or(0, |(_, bpp)| bpp / 8),
            target,
            write_mode: None,
            inner: Mutex::new(Inner {
                planes,
                bo,
                ..Default::default()
            }),
        }))
    }

    /// Wrap a buffer object allocated by the user on one of the core's
    /// devices. The buffer object is kept alive by the buffer, but is
    /// otherwise left alone.
    pub fn create_from_gbm(core: &Arc<Core>, bo: Arc<dyn BufferObject>) -> Result<Arc<Self>> {
        let device = core
            .devices()
            .into_iter()
            .find(|d| d.allocator().key() == bo.allocator_key())
            .ok_or(Error::InvalidArgument("buffer object does not belong to any device"))?;
        if !device
            .renderer_extensions()
            .intersects(RendererExtensions::IMAGE_PIXMAP | RendererExtensions::DMA_IMPORT_MODIFIERS)
        {
            return Err(Error::Unsupported("buffer object import"))
        }

        let mut planes = planes_of(&*bo);
        let (width, height, format, modifier) = (bo.width(), bo.height(), bo.format(), bo.modifier());
        let (write_mode, caps, map) = if modifier == format::MOD_LINEAR && bo.plane_count() == 1 {
            match map_bo(&*bo, &mut planes, height, true) {
                Some((mode, caps, map)) => (Some(mode), caps, map),
                None => {
                    tracing::warn!("[{}] Linear buffer object is not mappable", device.short_name());
                    (None, BufferCaps::empty(), None)
                },
            }
        } else {
            (None, BufferCaps::empty(), None)
        };
        Ok(Arc::new(Self {
            allocator: Arc::downgrade(&device),
            device_name: device.short_name().to_owned(),
            src: BufferSource::Gbm,
            caps,
            width,
            height,
            format,
            pixel_size: bo.bpp() / 8,
            target: target_for(&device, format, modifier),
            write_mode,
            inner: Mutex::new(Inner {
                planes,
                bo: Some(bo),
                map,
                ..Default::default()
            }),
        }))
    }

    /// Import a `wl_drm` buffer through the renderer of the allocator
    /// device. Its texture is only available on that device.
    pub fn create_from_wayland_drm(core: &Arc<Core>, buffer: WlDrmBuffer) -> Result<Arc<Self>> {
        let device = core.allocator_device().ok_or(Error::NoDevices)?;
        let renderer = device
            .renderer_backend()
            .ok_or(Error::Unsupported("allocator device has no renderer"))?
            .clone();
        let (texture, width, height, format) = renderer.import_wl_drm(buffer)?;
        Ok(Arc::new(Self {
            allocator: Arc::downgrade(&device),
            device_name: device.short_name().to_owned(),
            src: BufferSource::WlDrm,
            caps: BufferCaps::empty(),
            width,
            height,
            format,
            pixel_size: format::depth_bpp(format).map_or(0, |(_, bpp)| bpp / 8),
            target: texture.target,
            write_mode: None,
            inner: Mutex::new(Inner {
                textures: vec![CachedTexture {
                    device: Arc::downgrade(&device),
                    renderer,
                    texture,
                    owned: true,
                }],
                ..Default::default()
            }),
        }))
    }

    /// Wrap an existing texture of `device`'s renderer. The texture is
    /// destroyed with the buffer only if `transfer_ownership` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn create_gl_texture_wrapper(
        device: &Arc<Device>,
        texture_id: u32,
        target: TextureTarget,
        format: u32,
        width: u32,
        height: u32,
        transfer_ownership: bool,
    ) -> Result<Arc<Self>> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("buffer size must not be zero"))
        }
        let renderer = device
            .renderer_backend()
            .ok_or(Error::Unsupported("device has no renderer"))?
            .clone();
        Ok(Arc::new(Self {
            allocator: Arc::downgrade(device),
            device_name: device.short_name().to_owned(),
            src: BufferSource::Gl,
            caps: BufferCaps::empty(),
            width,
            height,
            format,
            pixel_size: format::depth_bpp(format).map_or(0, |(_, bpp)| bpp / 8),
            target,
            write_mode: None,
            inner: Mutex::new(Inner {
                textures: vec![CachedTexture {
                    device: Arc::downgrade(device),
                    renderer,
                    texture: Texture {
                        id: texture_id,
                        target,
                        image: None,
                    },
                    owned: transfer_ownership,
                }],
                ..Default::default()
            }),
        }))
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// fourcc of the pixel data.
    pub fn format(&self) -> u32 {
        self.format
    }

    /// What the buffer can be used for.
    pub fn caps(&self) -> BufferCaps {
        self.caps
    }

    /// Where the buffer came from.
    pub fn source(&self) -> BufferSource {
        self.src
    }

    /// Kind of texture the buffer is imported as.
    pub fn texture_target(&self) -> TextureTarget {
        self.target
    }

    /// Modifier of the first plane, [`format::MOD_INVALID`] if unknown.
    pub fn modifier(&self) -> u64 {
        self.lock()
            .planes
            .first()
            .map_or(format::MOD_INVALID, |p| p.modifier)
    }

    /// The device the buffer was allocated on, `None` if it's gone.
    pub fn allocator_device(&self) -> Option<Arc<Device>> {
        self.allocator.upgrade()
    }

    pub(crate) fn bo(&self) -> Option<Arc<dyn BufferObject>> {
        self.lock().bo.clone()
    }

    fn is_allocator(&self, device: &Arc<Device>) -> bool {
        is_same_device(&self.allocator, device)
    }

    /// The texture of this buffer on `device`'s renderer, imported on first
    /// use.
    pub fn texture(&self, device: &Arc<Device>) -> Result<Texture> {
        if self.src == BufferSource::WlDrm && !self.is_allocator(device) {
            return Err(Error::InvalidArgument(
                "wl_drm buffers can only be accessed from the allocator device",
            ))
        }
        let mut inner = self.lock();
        if let Some(cached) = inner.cached_texture(device) {
            return Ok(cached.texture)
        }

        let renderer = device
            .renderer_backend()
            .ok_or(Error::Unsupported("device has no renderer"))?
            .clone();
        let extensions = renderer.extensions();
        if self.target == TextureTarget::ExternalOes &&
            !extensions.contains(RendererExtensions::IMAGE_EXTERNAL)
        {
            return Err(Error::Unsupported("external textures"))
        }

        let mut texture = None;
        if extensions.contains(RendererExtensions::IMAGE_PIXMAP) && self.is_allocator(device) {
            if let Some(bo) = &inner.bo {
                match renderer.import_bo(&**bo, self.target) {
                    Ok(t) => texture = Some(t),
                    Err(e) => tracing::debug!(
                        "[{}] Importing the buffer object failed ({e}), trying DMA import",
                        device.short_name()
                    ),
                }
            }
        }
        let texture = match texture {
            Some(texture) => texture,
            None => {
                if !extensions.contains(RendererExtensions::DMA_IMPORT_MODIFIERS) {
                    return Err(Error::Unsupported("DMA-BUF import with modifiers"))
                }
                let dma = self.dma_data_locked(&mut inner)?;
                renderer.import_dma(&dma, self.target)?
            },
        };
        tracing::debug!(
            "[{}] Imported texture {} from a buffer of {}",
            device.short_name(),
            texture.id,
            self.device_name
        );
        inner.textures.push(CachedTexture {
            device: Arc::downgrade(device),
            renderer,
            texture,
            owned: true,
        });
        Ok(texture)
    }

    /// Texture name of the buffer on `device`, importing it on first use.
    pub fn texture_id(&self, device: &Arc<Device>) -> Result<u32> {
        self.texture(device).map(|t| t.id)
    }

    /// Handle of the image the texture on `device` was created from.
    pub fn image(&self, device: &Arc<Device>) -> Result<Option<u64>> {
        self.texture(device).map(|t| t.image)
    }

    /// Duplicate the DMA-BUF file descriptors of this buffer, exporting them
    /// from the buffer object first if needed.
    pub fn dma_data(&self) -> Result<DmaData> {
        let mut inner = self.lock();
        self.dma_data_locked(&mut inner)
    }

    fn dma_data_locked(&self, inner: &mut Inner) -> Result<DmaData> {
        let Inner { planes, bo, .. } = inner;
        for (i, plane) in planes.iter_mut().enumerate() {
            if plane.fd.is_none() {
                if let Some(bo) = bo {
                    plane.fd = Some(bo.export_fd(i)?);
                }
            }
        }
        let planes = planes
            .iter()
            .map(|p| {
                let fd = p
                    .fd
                    .as_ref()
                    .ok_or(Error::Buffer("buffer has no DMA-BUF"))?
                    .try_clone()?;
                Ok(DmaPlane {
                    fd,
                    offset: p.offset,
                    stride: p.stride,
                    modifier: p.modifier,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if planes.is_empty() {
            return Err(Error::Buffer("buffer has no DMA-BUF"))
        }
        Ok(DmaData {
            width: self.width,
            height: self.height,
            format: self.format,
            planes,
        })
    }

    /// Framebuffer of this buffer on `device`, for direct scanout. Only
    /// buffers backed by a buffer object of `device` can be scanned out.
    pub(crate) fn framebuffer(&self, device: &Arc<Device>) -> Result<u32> {
        let mut inner = self.lock();
        inner.fbs.retain(|fb| fb.device.strong_count() > 0);
        if let Some(fb) = inner.fbs.iter().find(|fb| is_same_device(&fb.device, device)) {
            return Ok(fb.id)
        }
        let bo = inner
            .bo
            .as_ref()
            .filter(|bo| bo.allocator_key() == device.allocator().key())
            .ok_or(Error::Buffer("buffer is not scanout capable on this device"))?;
        let layout = fb_layout(&**bo, device.caps().contains(Caps::ADD_FB2_MODIFIERS));
        let id = device.kms().add_fb(&layout)?;
        inner.fbs.push(Framebuffer {
            device: Arc::downgrade(device),
            kms: device.kms().clone(),
            id,
        });
        Ok(id)
    }

    fn check_region(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Rect> {
        if width == 0 ||
            height == 0 ||
            x.checked_add(width).map_or(true, |r| r > self.width) ||
            y.checked_add(height).map_or(true, |b| b > self.height)
        {
            return Err(Error::InvalidArgument("region is outside of the buffer"))
        }
        Ok(Rect::new(x as i32, y as i32, width as i32, height as i32))
    }

    fn check_writable(&self) -> Result<()> {
        if !self.caps.contains(BufferCaps::WRITE) {
            return Err(Error::Buffer("buffer is not writable"))
        }
        if self.target == TextureTarget::ExternalOes {
            return Err(Error::Buffer("buffers sampled as external textures are immutable"))
        }
        Ok(())
    }

    /// Copy a region of pixels into the buffer.
    ///
    /// `pixels` starts at the first pixel of the region, rows are `stride`
    /// bytes apart.
    pub fn write(
        &self,
        stride: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        let rect = self.check_region(x, y, width, height)?;
        let mut inner = self.lock();
        self.write_locked(&mut inner, stride, rect, pixels, true)
    }

    fn write_locked(
        &self,
        inner: &mut Inner,
        stride: u32,
        rect: Rect,
        pixels: &[u8],
        sync: bool,
    ) -> Result<()> {
        let row = rect.width as usize * self.pixel_size as usize;
        match self.write_mode {
            Some(WriteMode::Prime) => {
                let Inner { planes, map, .. } = inner;
                let (plane, map) = planes
                    .first()
                    .zip(map.as_mut())
                    .ok_or(Error::Buffer("buffer is not mapped"))?;
                let fd = plane.fd.as_ref().ok_or(Error::Buffer("buffer is not mapped"))?;
                let start = plane.offset as usize +
                    rect.y as usize * plane.stride as usize +
                    rect.x as usize * self.pixel_size as usize;
                if sync {
                    dma_sync(fd.as_fd(), SyncAccess::Write, true);
                }
                let ret = copy_rows(
                    pixels,
                    stride as usize,
                    &mut map.as_mut_slice()[start..],
                    plane.stride as usize,
                    row,
                    rect.height as usize,
                );
                if sync {
                    dma_sync(fd.as_fd(), SyncAccess::Write, false);
                }
                Ok(ret?)
            },
            Some(WriteMode::Gbm) => {
                let bo = inner.bo.as_ref().ok_or(Error::Buffer("buffer is not mapped"))?;
                let mut ret = Ok(());
                bo.map(rect, MapAccess::Write, &mut |dst: &mut [u8], dst_stride: u32| {
                    ret = copy_rows(
                        pixels,
                        stride as usize,
                        dst,
                        dst_stride as usize,
                        row,
                        rect.height as usize,
                    );
                })?;
                Ok(ret?)
            },
            Some(WriteMode::Gles) => {
                let cached = inner
                    .textures
                    .iter()
                    .find(|t| std::ptr::eq(t.device.as_ptr(), self.allocator.as_ptr()))
                    .ok_or(Error::Buffer("buffer has no texture"))?;
                let gl = drm_to_gl(self.format).ok_or(Error::Unsupported("pixel format"))?;
                cached
                    .renderer
                    .upload(&cached.texture, gl, stride, rect, pixels)?;
                Ok(())
            },
            None => Err(Error::Buffer("buffer is not writable")),
        }
    }

    /// Start a sequence of writes. The buffer stays locked until the
    /// [`Writer`] is ended or dropped.
    pub fn write_begin(&self) -> Result<Writer<'_>> {
        self.check_writable()?;
        let inner = self.lock();
        if self.write_mode == Some(WriteMode::Prime) {
            if let Some(fd) = inner.planes.first().and_then(|p| p.fd.as_ref()) {
                dma_sync(fd.as_fd(), SyncAccess::Write, true);
            }
        }
        Ok(Writer {
            buffer: self,
            inner:  Some(inner),
        })
    }

    /// Copy the `src` region of the buffer into `dst`, at `(dst_x, dst_y)`
    /// with rows `dst_stride` bytes apart.
    pub fn read(
        &self,
        src: Rect,
        dst_x: u32,
        dst_y: u32,
        dst_stride: u32,
        dst: &mut [u8],
    ) -> Result<()> {
        if !self.caps.contains(BufferCaps::READ) {
            return Err(Error::Buffer("buffer is not readable"))
        }
        if src.x < 0 || src.y < 0 {
            return Err(Error::InvalidArgument("region is outside of the buffer"))
        }
        let rect = self.check_region(
            src.x as u32,
            src.y as u32,
            src.width.max(0) as u32,
            src.height.max(0) as u32,
        )?;
        let inner = self.lock();
        let plane = inner.planes.first().ok_or(Error::Buffer("buffer is not mapped"))?;
        if plane.modifier != format::MOD_LINEAR {
            return Err(Error::Buffer("only linear buffers can be read"))
        }
        let ps = self.pixel_size as usize;
        let row = rect.width as usize * ps;
        let dst_start = dst_y as usize * dst_stride as usize + dst_x as usize * ps;
        let dst = dst
            .get_mut(dst_start..)
            .ok_or(Error::InvalidArgument("destination too small"))?;
        match (self.write_mode, &inner.map) {
            (Some(WriteMode::Prime), Some(map)) if map.is_readable() => {
                let fd = plane.fd.as_ref().ok_or(Error::Buffer("buffer is not mapped"))?;
                let start = plane.offset as usize +
                    rect.y as usize * plane.stride as usize +
                    rect.x as usize * ps;
                dma_sync(fd.as_fd(), SyncAccess::Read, true);
                // Safety: the mapping is readable.
                let src = unsafe { map.as_slice() };
                let ret = copy_rows(
                    &src[start..],
                    plane.stride as usize,
                    dst,
                    dst_stride as usize,
                    row,
                    rect.height as usize,
                );
                dma_sync(fd.as_fd(), SyncAccess::Read, false);
                Ok(ret?)
            },
            (Some(WriteMode::Gbm), _) => {
                let bo = inner.bo.as_ref().ok_or(Error::Buffer("buffer is not mapped"))?;
                let mut ret = Ok(());
                bo.map(rect, MapAccess::Read, &mut |src: &mut [u8], src_stride: u32| {
                    ret = copy_rows(
                        src,
                        src_stride as usize,
                        dst,
                        dst_stride as usize,
                        row,
                        rect.height as usize,
                    );
                })?;
                Ok(ret?)
            },
            _ => Err(Error::Buffer("buffer is not mapped for reading")),
        }
    }
}

pub(crate) fn fb_layout(bo: &dyn BufferObject, with_modifier: bool) -> FbLayout {
    let planes = bo.plane_count().clamp(1, 4);
    let mut layout = FbLayout {
        width: bo.width(),
        height: bo.height(),
        format: bo.format(),
        modifier: (with_modifier && bo.modifier() != format::MOD_INVALID).then(|| bo.modifier()),
        planes,
        ..Default::default()
    };
    for i in 0..planes {
        layout.handles[i] = bo.handle(i);
        layout.pitches[i] = bo.stride(i);
        layout.offsets[i] = bo.offset(i);
    }
    layout
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        for fb in inner.fbs.drain(..) {
            if let Err(e) = fb.kms.remove_fb(fb.id) {
                tracing::warn!("[{}] Failed to remove framebuffer {}: {e}", self.device_name, fb.id);
            }
        }
        for t in inner.textures.drain(..) {
            if t.owned {
                t.renderer.destroy_texture(&t.texture);
            }
        }
    }
}

/// A sequence of writes into a [`Buffer`], see [`Buffer::write_begin`].
pub struct Writer<'a> {
    buffer: &'a Buffer,
    inner:  Option<MutexGuard<'a, Inner>>,
}

impl std::fmt::Debug for Writer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").field("buffer", self.buffer).finish()
    }
}

impl Writer<'_> {
    /// Copy a region of pixels, like [`Buffer::write`].
    pub fn update(
        &mut self,
        stride: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<()> {
        let rect = self.buffer.check_region(x, y, width, height)?;
        let inner = self.inner.as_mut().ok_or(Error::Buffer("writer already ended"))?;
        self.buffer.write_locked(inner, stride, rect, pixels, false)
    }

    /// Finish the sequence and unlock the buffer.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(inner) = self.inner.take() else { return };
        if self.buffer.write_mode == Some(WriteMode::Prime) {
            if let Some(fd) = inner.planes.first().and_then(|p| p.fd.as_ref()) {
                dma_sync(fd.as_fd(), SyncAccess::Write, false);
            }
        }
    }
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
