//! A [`Renderer`] that keeps textures in CPU memory
//!
//! Imported buffers are mapped, so writes through a buffer's own mapping are
//! immediately visible when sampling or reading back from its texture. Only
//! single plane, linear, 32 bits per pixel formats are supported.

use std::{
    io,
    os::fd::AsFd,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use hashbrown::HashMap;

use super::{
    BufferObject, DmaData, Renderer, RendererExtensions, Texture, TextureTarget, WlDrmBuffer,
};
use crate::{
    format::{self, gl, FormatList, GlFormat},
    types::Rect,
};

const FORMATS: [u32; 4] = [
    format::ARGB8888,
    format::XRGB8888,
    format::ABGR8888,
    format::XBGR8888,
];

/// Whether pixels of a 32 bit format are stored as B, G, R, A bytes.
fn is_bgra_order(format: u32) -> bool {
    matches!(format, format::ARGB8888 | format::XRGB8888)
}

enum Storage {
    Owned(Vec<u8>),
    Mapped { map: memmap2::MmapMut, offset: usize },
}

struct TextureData {
    width:  u32,
    height: u32,
    stride: u32,
    bgra:   bool,
    store:  Storage,
}

impl TextureData {
    fn bytes(&self) -> &[u8] {
        match &self.store {
            Storage::Owned(v) => v,
            Storage::Mapped { map, offset } => &map[*offset..],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.store {
            Storage::Owned(v) => v,
            Storage::Mapped { map, offset } => &mut map[*offset..],
        }
    }
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, what.to_owned())
}

fn check_rect(rect: Rect, width: u32, height: u32) -> io::Result<()> {
    if rect.is_empty() ||
        rect.x < 0 ||
        rect.y < 0 ||
        (rect.x + rect.width) as u32 > width ||
        (rect.y + rect.height) as u32 > height
    {
        return Err(io::Error::from_raw_os_error(rustix::io::Errno::INVAL.raw_os_error()))
    }
    Ok(())
}

/// CPU renderer
pub struct SoftwareRenderer {
    textures: Mutex<HashMap<u32, TextureData>>,
    /// render target id -> texture id
    targets:  Mutex<HashMap<u32, u32>>,
    next_id:  AtomicU32,
    formats:  FormatList,
}

impl std::fmt::Debug for SoftwareRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareRenderer")
            .field("formats", &self.formats)
            .finish_non_exhaustive()
    }
}

impl Default for SoftwareRenderer {
    fn default() -> Self {
        let mut formats = FormatList::new();
        for f in FORMATS {
            formats.add(f, format::MOD_LINEAR);
        }
        Self {
            textures: Default::default(),
            targets: Default::default(),
            next_id: AtomicU32::new(1),
            formats,
        }
    }
}

impl SoftwareRenderer {
    /// A renderer without textures.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, data: TextureData, target: TextureTarget, image: Option<u64>) -> Texture {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.textures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, data);
        Texture { id, target, image }
    }

    fn map_fd(
        &self,
        fd: impl AsFd,
        offset: u32,
        stride: u32,
        height: u32,
    ) -> io::Result<Storage> {
        let len = offset as usize + stride as usize * height as usize;
        let fd = fd.as_fd();
        // Safety: the mapping is shared with whoever else maps the buffer,
        // concurrent writes only produce torn pixels.
        let map = unsafe { memmap2::MmapOptions::new().len(len).map_mut(&fd)? };
        Ok(Storage::Mapped {
            map,
            offset: offset as usize,
        })
    }

    fn texture_of_target(&self, target: u32) -> io::Result<u32> {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&target)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such render target"))
    }

    /// Number of live textures.
    pub fn texture_count(&self) -> usize {
        self.textures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Renderer for SoftwareRenderer {
    fn extensions(&self) -> RendererExtensions {
        RendererExtensions::DMA_IMPORT_MODIFIERS |
            RendererExtensions::IMAGE_PIXMAP |
            RendererExtensions::IMAGE_EXTERNAL |
            RendererExtensions::READ_FORMAT_BGRA
    }

    fn texture_formats(&self) -> FormatList {
        let mut list = self.formats.clone();
        // Implicit modifiers of single plane buffers are assumed to be linear.
        for f in FORMATS {
            list.add(f, format::MOD_INVALID);
        }
        list
    }

    fn render_formats(&self) -> FormatList {
        self.formats.clone()
    }

    fn import_bo(&self, bo: &dyn BufferObject, target: TextureTarget) -> io::Result<Texture> {
        if bo.plane_count() != 1 || bo.bpp() != 32 {
            return Err(unsupported("only single plane 32 bpp buffers can be imported"))
        }
        let fd = bo.export_fd(0)?;
        let store = self.map_fd(&fd, bo.offset(0), bo.stride(0), bo.height())?;
        Ok(self.insert(
            TextureData {
                width: bo.width(),
                height: bo.height(),
                stride: bo.stride(0),
                bgra: is_bgra_order(bo.format()),
                store,
            },
            target,
            None,
        ))
    }

    fn import_dma(&self, dma: &DmaData, target: TextureTarget) -> io::Result<Texture> {
        let [plane] = dma.planes.as_slice() else {
            return Err(unsupported("only single plane buffers can be imported"))
        };
        if !FORMATS.contains(&dma.format) {
            return Err(unsupported("unsupported format"))
        }
        if plane.modifier != format::MOD_LINEAR && plane.modifier != format::MOD_INVALID {
            return Err(unsupported("only linear buffers can be imported"))
        }
        let store = self.map_fd(&plane.fd, plane.offset, plane.stride, dma.height)?;
        Ok(self.insert(
            TextureData {
                width: dma.width,
                height: dma.height,
                stride: plane.stride,
                bgra: is_bgra_order(dma.format),
                store,
            },
            target,
            None,
        ))
    }

    fn import_wl_drm(&self, _buffer: WlDrmBuffer) -> io::Result<(Texture, u32, u32, u32)> {
        Err(unsupported("wl_drm buffers can not be imported"))
    }

    fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: GlFormat,
        stride: u32,
        pixels: &[u8],
    ) -> io::Result<Texture> {
        if format.ty != gl::UNSIGNED_BYTE || (format.format != gl::BGRA_EXT && format.format != gl::RGBA)
        {
            return Err(unsupported("only 8 bit RGBA/BGRA textures are supported"))
        }
        let tex_stride = width * 4;
        let mut data = vec![0u8; tex_stride as usize * height as usize];
        if !pixels.is_empty() {
            copy_rows(
                pixels,
                stride as usize,
                &mut data,
                tex_stride as usize,
                tex_stride as usize,
                height as usize,
            )?;
        }
        Ok(self.insert(
            TextureData {
                width,
                height,
                stride: tex_stride,
                bgra: format.format == gl::BGRA_EXT,
                store: Storage::Owned(data),
            },
            TextureTarget::Texture2D,
            None,
        ))
    }

    fn upload(
        &self,
        texture: &Texture,
        _format: GlFormat,
        stride: u32,
        rect: Rect,
        pixels: &[u8],
    ) -> io::Result<()> {
        let mut textures = self.textures.lock().unwrap_or_else(|e| e.into_inner());
        let data = textures
            .get_mut(&texture.id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such texture"))?;
        check_rect(rect, data.width, data.height)?;
        let tex_stride = data.stride as usize;
        let start = rect.y as usize * tex_stride + rect.x as usize * 4;
        copy_rows(
            pixels,
            stride as usize,
            &mut data.bytes_mut()[start..],
            tex_stride,
            rect.width as usize * 4,
            rect.height as usize,
        )
    }

    fn destroy_texture(&self, texture: &Texture) {
        self.textures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&texture.id);
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, t| *t != texture.id);
    }

    fn create_target(&self, texture: &Texture) -> io::Result<u32> {
        if texture.target != TextureTarget::Texture2D {
            return Err(unsupported("external textures are not renderable"))
        }
        if !self
            .textures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&texture.id)
        {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such texture"))
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, texture.id);
        Ok(id)
    }

    fn destroy_target(&self, target: u32) {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&target);
    }

    fn read_pixels(
        &self,
        target: u32,
        rect: Rect,
        bgra: bool,
        dst_stride: u32,
        dst: &mut [u8],
    ) -> io::Result<()> {
        let texture = self.texture_of_target(target)?;
        let textures = self.textures.lock().unwrap_or_else(|e| e.into_inner());
        let data = textures
            .get(&texture)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such texture"))?;
        check_rect(rect, data.width, data.height)?;
        let src_stride = data.stride as usize;
        let start = rect.y as usize * src_stride + rect.x as usize * 4;
        let row = rect.width as usize * 4;
        copy_rows(
            &data.bytes()[start..],
            src_stride,
            dst,
            dst_stride as usize,
            row,
            rect.height as usize,
        )?;
        if bgra != data.bgra {
            for y in 0..rect.height as usize {
                let line = &mut dst[y * dst_stride as usize..][..row];
                for px in line.chunks_exact_mut(4) {
                    px.swap(0, 2);
                }
            }
        }
        Ok(())
    }

    fn finish(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Copy `rows` rows of `row` bytes between buffers with different strides.
pub(crate) fn copy_rows(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row: usize,
    rows: usize,
) -> io::Result<()> {
    if rows == 0 || row == 0 {
        return Ok(())
    }
    let src_len = src_stride * (rows - 1) + row;
    let dst_len = dst_stride * (rows - 1) + row;
    if src.len() < src_len || dst.len() < dst_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "pixel buffer too small",
        ))
    }
    if src_stride == dst_stride && src_stride == row {
        dst[..row * rows].copy_from_slice(&src[..row * rows]);
    } else {
        for y in 0..rows {
            dst[y * dst_stride..][..row].copy_from_slice(&src[y * src_stride..][..row]);
        }
    }
    Ok(())
}
