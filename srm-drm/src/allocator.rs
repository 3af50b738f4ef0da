//! Buffer allocation with GBM

use std::{
    io,
    os::fd::{AsFd, OwnedFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use gbm::{BufferObjectFlags, Format, Modifier};
use srm_core::{
    backend::{Allocator, BoUsage, BufferObject, DmaData, MapAccess},
    format::MOD_INVALID,
    types::Rect,
};
use tracing::{debug, trace};

type GbmDevice = gbm::Device<OwnedFd>;

static NEXT_KEY: AtomicUsize = AtomicUsize::new(1);

fn destroyed(_: gbm::DeviceDestroyedError) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "the GBM device was destroyed")
}

fn fourcc(format: u32) -> io::Result<Format> {
    Format::try_from(format).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn usage_flags(usage: BoUsage) -> BufferObjectFlags {
    BufferObjectFlags::from_bits_truncate(usage.bits())
}

/// [`Allocator`] over a GBM device.
///
/// libgbm objects are not thread safe, the device and every buffer object
/// sit behind a mutex.
pub struct GbmAllocator {
    device:  Arc<Mutex<GbmDevice>>,
    backend: String,
    key:     usize,
}

impl std::fmt::Debug for GbmAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GbmAllocator")
            .field("backend", &self.backend)
            .field("key", &self.key)
            .finish()
    }
}

impl GbmAllocator {
    /// Create a GBM device on an opened DRM node.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let device = GbmDevice::new(fd)?;
        let backend = device.backend_name().to_owned();
        Ok(Self {
            device: Arc::new(Mutex::new(device)),
            backend,
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Name of the GBM backend, e.g. `drm`.
    pub fn backend_name(&self) -> &str {
        &self.backend
    }

    fn lock(&self) -> MutexGuard<'_, GbmDevice> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wrap(&self, bo: gbm::BufferObject<()>, format: u32) -> io::Result<Box<dyn BufferObject>> {
        let count = bo.plane_count().map_err(destroyed)? as usize;
        let mut planes = Vec::with_capacity(count);
        for i in 0..count as i32 {
            // Safety: the u32 member is the GEM handle on DRM backed devices.
            let handle = unsafe { bo.handle_for_plane(i).map_err(destroyed)?.u32_ };
            planes.push(Plane {
                handle,
                stride: bo.stride_for_plane(i).map_err(destroyed)?,
                offset: bo.offset(i).map_err(destroyed)?,
            });
        }
        let bo = GbmBo {
            width: bo.width().map_err(destroyed)?,
            height: bo.height().map_err(destroyed)?,
            format,
            modifier: u64::from(bo.modifier().map_err(destroyed)?),
            bpp: bo.bpp().map_err(destroyed)?,
            planes,
            bo: Mutex::new(bo),
            device: self.device.clone(),
            key: self.key,
        };
        trace!(
            width = bo.width,
            height = bo.height,
            modifier = bo.modifier,
            planes = bo.planes.len(),
            "Allocated GBM buffer"
        );
        Ok(Box::new(bo))
    }
}

impl Allocator for GbmAllocator {
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[u64],
        usage: BoUsage,
    ) -> io::Result<Box<dyn BufferObject>> {
        let fourcc = fourcc(format)?;
        let bo = {
            let device = self.lock();
            if modifiers.is_empty() {
                device.create_buffer_object::<()>(width, height, fourcc, usage_flags(usage))?
            } else {
                device.create_buffer_object_with_modifiers2::<()>(
                    width,
                    height,
                    fourcc,
                    modifiers.iter().map(|&m| Modifier::from(m)),
                    usage_flags(usage),
                )?
            }
        };
        self.wrap(bo, format)
    }

    fn import_dma(&self, dma: &DmaData, usage: BoUsage) -> io::Result<Box<dyn BufferObject>> {
        let Some(first) = dma.planes.first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "DMA-BUF without planes"))
        };
        if dma.planes.len() > 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "too many DMA-BUF planes"))
        }
        let fourcc = fourcc(dma.format)?;
        let bo = {
            let device = self.lock();
            if dma.planes.len() == 1 && first.modifier == MOD_INVALID {
                device.import_buffer_object_from_dma_buf::<()>(
                    first.fd.as_fd(),
                    dma.width,
                    dma.height,
                    first.stride,
                    fourcc,
                    usage_flags(usage),
                )?
            } else {
                let mut fds = [None; 4];
                let mut strides = [0; 4];
                let mut offsets = [0; 4];
                for (i, plane) in dma.planes.iter().enumerate() {
                    fds[i] = Some(plane.fd.as_fd());
                    strides[i] = plane.stride as i32;
                    offsets[i] = plane.offset as i32;
                }
                device.import_buffer_object_from_dma_buf_with_modifiers::<()>(
                    dma.planes.len() as u32,
                    fds,
                    dma.width,
                    dma.height,
                    fourcc,
                    usage_flags(usage),
                    strides,
                    offsets,
                    Modifier::from(first.modifier),
                )?
            }
        };
        debug!(width = dma.width, height = dma.height, "Imported DMA-BUF");
        self.wrap(bo, dma.format)
    }

    fn key(&self) -> usize {
        self.key
    }
}

#[derive(Debug, Clone, Copy)]
struct Plane {
    handle: u32,
    stride: u32,
    offset: u32,
}

/// A GBM buffer object, with its layout read once at creation.
struct GbmBo {
    width:    u32,
    height:   u32,
    format:   u32,
    modifier: u64,
    bpp:      u32,
    planes:   Vec<Plane>,
    bo:       Mutex<gbm::BufferObject<()>>,
    device:   Arc<Mutex<GbmDevice>>,
    key:      usize,
}

impl GbmBo {
    fn plane(&self, plane: usize) -> Plane {
        self.planes.get(plane).copied().unwrap_or(Plane {
            handle: 0,
            stride: 0,
            offset: 0,
        })
    }

    fn lock(&self) -> MutexGuard<'_, gbm::BufferObject<()>> {
        self.bo.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BufferObject for GbmBo {
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
        self.modifier
    }

    fn bpp(&self) -> u32 {
        self.bpp
    }

    fn plane_count(&self) -> usize {
        self.planes.len()
    }

    fn handle(&self, plane: usize) -> u32 {
        self.plane(plane).handle
    }

    fn stride(&self, plane: usize) -> u32 {
        self.plane(plane).stride
    }

    fn offset(&self, plane: usize) -> u32 {
        self.plane(plane).offset
    }

    fn export_fd(&self, plane: usize) -> io::Result<OwnedFd> {
        self.lock()
            .fd_for_plane(plane as i32)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn map(
        &self,
        rect: Rect,
        _access: MapAccess,
        f: &mut dyn FnMut(&mut [u8], u32),
    ) -> io::Result<()> {
        let rect = rect.clamp_to(self.width, self.height);
        if rect.is_empty() {
            return Ok(())
        }
        // Lock order: device, then buffer object.
        let device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        let mut bo = self.lock();
        bo.map_mut(
            &device,
            rect.x as u32,
            rect.y as u32,
            rect.width as u32,
            rect.height as u32,
            |mapping| {
                let stride = mapping.stride();
                f(mapping.buffer_mut(), stride)
            },
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        self.lock().write(data).map_err(destroyed)?
    }

    fn allocator_key(&self) -> usize {
        self.key
    }
}
