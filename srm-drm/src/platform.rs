//! Device discovery through udev

use std::{
    ffi::OsStr,
    fs::OpenOptions,
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use rustix::event::{poll, PollFd, PollFlags};
use srm_core::backend::{
    software::SoftwareRenderer, DeviceNode, HotplugEvent, OpenedDevice, Platform, Renderer,
};
use tracing::{debug, trace, warn};

use crate::{allocator::GbmAllocator, kms::DrmKms};

/// Picks the graphics API of a freshly opened device.
pub type RendererFactory =
    Box<dyn Fn(&DeviceNode, BorrowedFd<'_>) -> Option<Arc<dyn Renderer>> + Send + Sync>;

struct Monitor(udev::MonitorSocket);

// SAFETY: libudev objects are not bound to the thread that created them, the
// socket is only ever touched with the mutex held.
unsafe impl Send for Monitor {}

/// A [`Platform`] that finds GPUs with udev and opens them with libdrm and
/// GBM.
pub struct UdevPlatform {
    monitor:    Option<Mutex<Monitor>>,
    monitor_fd: Option<OwnedFd>,
    renderer:   RendererFactory,
}

impl std::fmt::Debug for UdevPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdevPlatform")
            .field("monitor_fd", &self.monitor_fd)
            .finish_non_exhaustive()
    }
}

fn is_primary_node(device: &udev::Device) -> bool {
    device.devtype() == Some(OsStr::new("drm_minor")) &&
        device.sysname().to_str().map_or(false, |name| {
            name.strip_prefix("card")
                .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
}

fn is_boot_vga(device: &udev::Device) -> bool {
    let Ok(Some(pci)) = device.parent_with_subsystem("pci") else {
        return false
    };
    pci.attribute_value("boot_vga")
        .map_or(false, |v| v == OsStr::new("1"))
}

fn node_path(device: &udev::Device) -> PathBuf {
    match device.devnode() {
        Some(path) => path.to_owned(),
        None => Path::new("/dev/dri").join(device.sysname()),
    }
}

impl UdevPlatform {
    /// Every device gets a [`SoftwareRenderer`].
    pub fn new() -> io::Result<Self> {
        Self::with_renderer(Box::new(|_, _| {
            Some(Arc::new(SoftwareRenderer::new()) as Arc<dyn Renderer>)
        }))
    }

    /// Open devices with renderers chosen by `renderer`. Hotplugging is disabled
    /// when the udev monitor can't be set up.
    pub fn with_renderer(renderer: RendererFactory) -> io::Result<Self> {
        let (monitor, monitor_fd) = match udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem_devtype("drm", "drm_minor"))
            .and_then(|b| b.listen())
        {
            Ok(socket) => {
                let fd = rustix::io::dup(socket.as_fd())?;
                (Some(Mutex::new(Monitor(socket))), Some(fd))
            },
            Err(e) => {
                warn!("Failed to set up the udev monitor, hotplugging is disabled: {e}");
                (None, None)
            },
        };
        Ok(Self {
            monitor,
            monitor_fd,
            renderer,
        })
    }

    fn drain(&self) -> Vec<HotplugEvent> {
        let Some(monitor) = &self.monitor else {
            return Vec::new()
        };
        let monitor = monitor.lock().unwrap_or_else(|e| e.into_inner());
        let mut events = Vec::new();
        for event in monitor.0.iter() {
            if !is_primary_node(&event) {
                continue
            }
            let path = node_path(&event);
            trace!(?path, kind = ?event.event_type(), "udev event");
            events.push(match event.event_type() {
                udev::EventType::Add => HotplugEvent::Added(DeviceNode {
                    boot_vga: is_boot_vga(&event),
                    path,
                }),
                udev::EventType::Remove => HotplugEvent::Removed(path),
                udev::EventType::Change => HotplugEvent::Changed(path),
                _ => continue,
            });
        }
        events
    }
}

impl Platform for UdevPlatform {
    fn enumerate(&self) -> io::Result<Vec<DeviceNode>> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("drm")?;
        enumerator.match_sysname("card[0-9]*")?;
        let nodes: Vec<_> = enumerator
            .scan_devices()?
            .filter(is_primary_node)
            .filter(|d| d.devnode().is_some())
            .map(|d| DeviceNode {
                path:     node_path(&d),
                boot_vga: is_boot_vga(&d),
            })
            .collect();
        debug!(count = nodes.len(), "Enumerated DRM devices");
        Ok(nodes)
    }

    fn open(&self, node: &DeviceNode) -> io::Result<OpenedDevice> {
        let file = OpenOptions::new().read(true).write(true).open(&node.path)?;
        let fd = OwnedFd::from(file);
        let renderer = (self.renderer)(node, fd.as_fd());
        let allocator = GbmAllocator::new(fd.try_clone()?)?;
        let kms = DrmKms::new(fd);
        debug!(path = ?node.path, gbm = allocator.backend_name(), "Opened device");
        Ok(OpenedDevice {
            kms: Arc::new(kms),
            allocator: Arc::new(allocator),
            renderer,
        })
    }

    fn monitor_fd(&self) -> Option<BorrowedFd<'_>> {
        self.monitor_fd.as_ref().map(|fd| fd.as_fd())
    }

    fn poll_monitor(&self, timeout: Option<Duration>) -> io::Result<Vec<HotplugEvent>> {
        let Some(fd) = &self.monitor_fd else {
            if let Some(timeout) = timeout {
                std::thread::sleep(timeout);
            }
            return Ok(Vec::new())
        };
        let timeout = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);
        let mut fds = [PollFd::new(fd, PollFlags::IN)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(Vec::new()),
            Ok(_) => (),
            Err(rustix::io::Errno::INTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        Ok(self.drain())
    }
}
