//! Atomic mode setting requests

use std::{sync::Arc, time::Duration};

use crate::{
    backend::{CommitFlags, Kms},
    error::Result,
    property::PropertyBlob,
};

/// How long to back off when the kernel reports the device as busy.
const BUSY_BACKOFF: Duration = Duration::from_millis(2);
/// Give up retrying a busy test commit after this many attempts.
const BUSY_RETRIES: u32 = 500;

/// A set of property changes, applied together with [`AtomicRequest::commit`].
pub struct AtomicRequest {
    kms:   Arc<dyn Kms>,
    props: Vec<(u32, u32, u64)>,
    blobs: Vec<Arc<PropertyBlob>>,
}

impl std::fmt::Debug for AtomicRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicRequest")
            .field("props", &self.props)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl AtomicRequest {
    /// An empty request on `kms`.
    pub fn new(kms: &Arc<dyn Kms>) -> Self {
        Self {
            kms:   kms.clone(),
            props: Vec::new(),
            blobs: Vec::new(),
        }
    }

    /// Set a property of a mode object. Properties the object doesn't have
    /// (id 0) are skipped.
    pub fn add(&mut self, object: u32, prop: u32, value: u64) {
        if prop == 0 {
            tracing::error!("Object {object} lacks a property, skipped (value {value})");
            return
        }
        self.props.push((object, prop, value));
    }

    /// Keep a blob alive for as long as this request exists.
    pub fn attach_blob(&mut self, blob: Arc<PropertyBlob>) {
        self.blobs.push(blob);
    }

    /// Number of queued properties.
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Commit the request.
    ///
    /// With `force_retry`, the request is first tested with
    /// [`CommitFlags::TEST_ONLY`] until the device is no longer busy. The
    /// outcome of the test does not prevent the real commit.
    pub fn commit(&self, flags: CommitFlags, force_retry: bool) -> Result<()> {
        if force_retry {
            let test = flags | CommitFlags::TEST_ONLY;
            let mut tries = 0;
            loop {
                match self.kms.atomic_commit(&self.props, test) {
                    Err(e) if e.raw_os_error() == Some(rustix::io::Errno::BUSY.raw_os_error()) => {
                        tries += 1;
                        if tries >= BUSY_RETRIES {
                            tracing::warn!("Device still busy after {tries} test commits");
                            break
                        }
                        std::thread::sleep(BUSY_BACKOFF);
                    },
                    Err(e) => {
                        tracing::debug!("Test commit failed: {e}");
                        break
                    },
                    Ok(()) => break,
                }
            }
        }
        self.kms.atomic_commit(&self.props, flags)?;
        Ok(())
    }
}
