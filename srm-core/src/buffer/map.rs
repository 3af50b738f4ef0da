//! CPU mappings of DMA-BUFs

use std::{
    io,
    os::fd::{AsFd, BorrowedFd},
    ptr::NonNull,
};

use rustix::{
    ioctl::{ioctl, Setter, WriteOpcode},
    mm::{MapFlags, ProtFlags},
};

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// `DMA_BUF_IOCTL_SYNC`, `_IOW('b', 0, struct dma_buf_sync)`
type SyncOpcode = WriteOpcode<b'b', 0, u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncAccess {
    Read,
    Write,
}

impl SyncAccess {
    fn flags(self) -> u64 {
        match self {
            Self::Read => DMA_BUF_SYNC_READ,
            Self::Write => DMA_BUF_SYNC_WRITE,
        }
    }
}

/// Bracket CPU access to a DMA-BUF. Not every exporter supports the sync
/// ioctl, memfds for example don't, so failures are only logged.
pub(crate) fn dma_sync(fd: BorrowedFd<'_>, access: SyncAccess, start: bool) {
    let flags = access.flags() | if start { DMA_BUF_SYNC_START } else { DMA_BUF_SYNC_END };
    // Safety: DMA_BUF_IOCTL_SYNC takes a struct dma_buf_sync, which is a
    // single u64.
    let ret = unsafe { ioctl(fd, Setter::<SyncOpcode, u64>::new(flags)) };
    if let Err(e) = ret {
        tracing::trace!("DMA-BUF sync failed: {e}");
    }
}

/// A shared mapping of a DMA-BUF, possibly write-only.
pub(crate) struct DmaMapping {
    ptr:      NonNull<u8>,
    len:      usize,
    readable: bool,
}

// Safety: the mapping is plain shared memory, access is serialized by the
// owning buffer's lock.
unsafe impl Send for DmaMapping {}
unsafe impl Sync for DmaMapping {}

impl std::fmt::Debug for DmaMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaMapping")
            .field("len", &self.len)
            .field("readable", &self.readable)
            .finish()
    }
}

impl DmaMapping {
    /// Map `len` bytes of `fd` for reading and writing, falling back to a
    /// write-only mapping.
    pub(crate) fn new(fd: impl AsFd, len: usize) -> io::Result<Self> {
        let fd = fd.as_fd();
        match Self::map(fd, len, ProtFlags::READ | ProtFlags::WRITE) {
            Ok(ptr) => Ok(Self {
                ptr,
                len,
                readable: true,
            }),
            Err(e) => {
                tracing::debug!("Read/write mapping failed ({e}), trying write only");
                Ok(Self {
                    ptr: Self::map(fd, len, ProtFlags::WRITE)?,
                    len,
                    readable: false,
                })
            },
        }
    }

    fn map(fd: BorrowedFd<'_>, len: usize, prot: ProtFlags) -> io::Result<NonNull<u8>> {
        if len == 0 {
            return Err(io::ErrorKind::InvalidInput.into())
        }
        // Safety: a fresh mapping, not aliasing anything we own.
        let ptr = unsafe { rustix::mm::mmap(std::ptr::null_mut(), len, prot, MapFlags::SHARED, fd, 0)? };
        NonNull::new(ptr.cast()).ok_or_else(|| io::ErrorKind::Other.into())
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.readable
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// Reading is only allowed if the mapping [is readable](Self::is_readable).
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// The mapping as a slice to copy into. Reading from it is undefined for
    /// write-only mappings, callers only ever write.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the pointer is valid for `len` bytes for as long as `self`
        // lives, and `&mut self` makes the slice unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        // Safety: `ptr` and `len` came from a successful mmap.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!("munmap failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_memfd() {
        let fd = rustix::fs::memfd_create("map-test", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, 4096).unwrap();
        let mut map = DmaMapping::new(&fd, 4096).unwrap();
        assert!(map.is_readable());
        dma_sync(fd.as_fd(), SyncAccess::Write, true);
        map.as_mut_slice()[10] = 42;
        dma_sync(fd.as_fd(), SyncAccess::Write, false);

        let other = DmaMapping::new(&fd, 4096).unwrap();
        assert_eq!(unsafe { other.as_slice() }[10], 42);
        assert_eq!(other.len(), 4096);
    }

    #[test]
    fn empty_mapping_rejected() {
        let fd = rustix::fs::memfd_create("map-test", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        assert!(DmaMapping::new(&fd, 0).is_err());
    }
}
