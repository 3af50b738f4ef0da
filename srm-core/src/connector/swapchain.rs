//! Bookkeeping of swapchain images

/// Which image is rendered next, and how old its contents are.
///
/// The age counts frames since the image was last presented, 0 means its
/// contents are undefined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Swapchain {
    index: usize,
    age:   u32,
    frame: u32,
    len:   usize,
}

impl Swapchain {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            len,
            ..Default::default()
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn age(&self) -> u32 {
        self.age
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Move on to the next image after a frame was presented.
    pub(crate) fn advance(&mut self) {
        if self.len == 0 {
            return
        }
        self.index += 1;
        if self.index == self.len {
            self.index = 0;
        }
        let len = self.len as u32;
        if self.frame < len {
            self.frame += 1;
        }
        self.age = if self.frame < len { 0 } else { len };
    }

    /// Forget the contents of every image, e.g. after the CRTC was reset.
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.len);
    }
}
