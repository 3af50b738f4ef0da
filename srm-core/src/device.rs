//! GPUs
//!
//! A [`Device`] is an opened DRM device together with its mode setting
//! objects. Devices are created by the [`Core`], which also decides which
//! device renders the frames shown on each device's connectors, see
//! [`Device::renderer`] and [`Device::render_mode`].

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use crate::{
    backend::{
        Allocator, BoUsage, ClientCap, DeviceNode, DriverCap, Kms, OpenedDevice, Renderer,
        RendererExtensions, PRIME_CAP_EXPORT, PRIME_CAP_IMPORT,
    },
    buffer::WriteMode,
    config::Config,
    connector::{Connector, ConnectorSnapshot},
    core::Core,
    crtc::Crtc,
    encoder::Encoder,
    error::{Error, Result},
    format::{self, FormatList},
    plane::Plane,
    types::{Caps, ClientCaps, RenderMode},
};

#[derive(Debug, Default)]
struct Assignment {
    renderer:    Weak<Device>,
    render_mode: RenderMode,
}

/// An opened GPU.
pub struct Device {
    core:                Weak<Core>,
    name:                PathBuf,
    short_name:          String,
    boot_vga:            bool,
    kms:                 Arc<dyn Kms>,
    allocator:           Arc<dyn Allocator>,
    renderer_backend:    Option<Arc<dyn Renderer>>,
    client_caps:         ClientCaps,
    caps:                Caps,
    crtcs:               Vec<Arc<Crtc>>,
    encoders:            Vec<Arc<Encoder>>,
    planes:              Vec<Arc<Plane>>,
    connectors:          Vec<Arc<Connector>>,
    dma_texture_formats: FormatList,
    dma_render_formats:  FormatList,
    enabled:             AtomicBool,
    rescan_pending:      AtomicBool,
    assignment:          Mutex<Assignment>,
    /// Serializes connectors claiming CRTCs and planes.
    claims:              Mutex<()>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("client_caps", &self.client_caps)
            .field("caps", &self.caps)
            .field("enabled", &self.is_enabled())
            .field("render_mode", &self.render_mode())
            .finish_non_exhaustive()
    }
}

fn init_client_caps(kms: &dyn Kms, config: &Config) -> ClientCaps {
    let mut caps = ClientCaps::empty();
    let mut set = |cap: ClientCap| match kms.set_client_cap(cap, true) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Client capability {cap:?} not available: {e}");
            false
        },
    };

    if config.enable_stereo_3d && set(ClientCap::Stereo3D) {
        caps |= ClientCaps::STEREO_3D;
    }
    if !config.force_legacy_api && set(ClientCap::Atomic) {
        // Implied by atomic
        caps |= ClientCaps::ATOMIC | ClientCaps::ASPECT_RATIO | ClientCaps::UNIVERSAL_PLANES;
        if config.enable_writeback_connectors && set(ClientCap::WritebackConnectors) {
            caps |= ClientCaps::WRITEBACK_CONNECTORS;
        }
    } else {
        if set(ClientCap::AspectRatio) {
            caps |= ClientCaps::ASPECT_RATIO;
        }
        if set(ClientCap::UniversalPlanes) {
            caps |= ClientCaps::UNIVERSAL_PLANES;
        }
    }
    caps
}

fn init_caps(kms: &dyn Kms, allocator: &dyn Allocator) -> Caps {
    let get = |cap: DriverCap| {
        kms.driver_cap(cap).unwrap_or_else(|e| {
            tracing::debug!("Driver capability {cap:?} not available: {e}");
            0
        })
    };
    let mut caps = Caps::empty();
    caps.set(Caps::DUMB_BUFFER, get(DriverCap::DumbBuffer) == 1);
    let prime = get(DriverCap::Prime);
    caps.set(Caps::PRIME_IMPORT, prime & PRIME_CAP_IMPORT != 0);
    caps.set(Caps::PRIME_EXPORT, prime & PRIME_CAP_EXPORT != 0);
    caps.set(Caps::ADD_FB2_MODIFIERS, get(DriverCap::AddFb2Modifiers) == 1);
    caps.set(Caps::ASYNC_PAGE_FLIP, get(DriverCap::AsyncPageFlip) == 1);
    caps.set(Caps::ATOMIC_ASYNC_PAGE_FLIP, get(DriverCap::AtomicAsyncPageFlip) == 1);
    caps.set(Caps::TIMESTAMP_MONOTONIC, get(DriverCap::TimestampMonotonic) == 1);

    // Some drivers advertise export but can't actually export linear
    // buffers, which is all we need it for.
    if caps.contains(Caps::PRIME_EXPORT) {
        let exported = allocator
            .create_bo(
                256,
                256,
                format::ARGB8888,
                &[format::MOD_LINEAR],
                BoUsage::RENDERING | BoUsage::LINEAR,
            )
            .and_then(|bo| bo.export_fd(0));
        if let Err(e) = exported {
            tracing::warn!("PRIME export is advertised but doesn't work: {e}");
            caps.remove(Caps::PRIME_EXPORT);
        }
    }
    caps
}

impl Device {
    pub(crate) fn new(
        core: Weak<Core>,
        node: &DeviceNode,
        opened: OpenedDevice,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let OpenedDevice {
            kms,
            allocator,
            renderer,
        } = opened;
        let short_name = node
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Unknown Device".to_owned());
        let span = tracing::info_span!("device", node = %short_name);
        let _enter = span.enter();
        tracing::info!("Is boot VGA: {}", node.boot_vga);
        tracing::info!("Is DRM master: {}", kms.is_master());

        let client_caps = init_client_caps(&*kms, config);
        let caps = init_caps(&*kms, &*allocator);
        tracing::info!("Client caps: {client_caps:?}");
        tracing::info!("Caps: {caps:?}");
        let atomic = client_caps.contains(ClientCaps::ATOMIC);

        let res = kms.resources()?;
        let crtcs = res
            .crtcs
            .iter()
            .enumerate()
            .map(|(i, &id)| Crtc::new(&*kms, id, i, atomic).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let encoders: Vec<_> = res
            .encoders
            .iter()
            .filter_map(|&id| match Encoder::new(&*kms, id, &crtcs) {
                Ok(e) => Some(Arc::new(e)),
                Err(e) => {
                    tracing::warn!("Skipping encoder {id}: {e}");
                    None
                },
            })
            .collect();
        let with_modifiers = caps.contains(Caps::ADD_FB2_MODIFIERS);
        let planes: Vec<_> = res
            .planes
            .iter()
            .filter_map(|&id| match Plane::new(&*kms, id, &crtcs, with_modifiers) {
                Ok(p) => Some(Arc::new(p)),
                Err(e) => {
                    tracing::warn!("Skipping plane {id}: {e}");
                    None
                },
            })
            .collect();
        let snapshots: Vec<_> = res
            .connectors
            .iter()
            .filter_map(|&id| match ConnectorSnapshot::query(&*kms, id) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!("Skipping connector {id}: {e}");
                    None
                },
            })
            .collect();

        let (dma_texture_formats, dma_render_formats) = renderer
            .as_ref()
            .map(|r| (r.texture_formats(), r.render_formats()))
            .unwrap_or_default();
        if renderer.is_none() {
            tracing::info!("No renderer, this device can only display frames rendered elsewhere");
        }

        Ok(Arc::new_cyclic(|me| {
            let connectors = snapshots
                .into_iter()
                .map(|s| Connector::new(me.clone(), s, &encoders))
                .collect();
            Self {
                core,
                name: node.path.clone(),
                short_name,
                boot_vga: node.boot_vga,
                kms,
                allocator,
                renderer_backend: renderer,
                client_caps,
                caps,
                crtcs,
                encoders,
                planes,
                connectors,
                dma_texture_formats,
                dma_render_formats,
                enabled: AtomicBool::new(true),
                rescan_pending: AtomicBool::new(false),
                assignment: Mutex::new(Assignment::default()),
                claims: Mutex::new(()),
            }
        }))
    }

    /// Path of the device node.
    pub fn name(&self) -> &Path {
        &self.name
    }

    /// File name of the device node, e.g. `card0`.
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// Whether the firmware booted on this GPU.
    pub fn is_boot_vga(&self) -> bool {
        self.boot_vga
    }

    /// The core this device belongs to, `None` once it is dropped.
    pub fn core(&self) -> Option<Arc<Core>> {
        self.core.upgrade()
    }

    /// Client capabilities the kernel accepted.
    pub fn client_caps(&self) -> ClientCaps {
        self.client_caps
    }

    /// Driver capabilities.
    pub fn caps(&self) -> Caps {
        self.caps
    }

    /// Whether atomic mode setting is in use.
    pub fn is_atomic(&self) -> bool {
        self.client_caps.contains(ClientCaps::ATOMIC)
    }

    /// CRTCs in kernel order.
    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.crtcs
    }

    /// Encoders in kernel order.
    pub fn encoders(&self) -> &[Arc<Encoder>] {
        &self.encoders
    }

    /// Planes in kernel order.
    pub fn planes(&self) -> &[Arc<Plane>] {
        &self.planes
    }

    /// Connectors in kernel order.
    pub fn connectors(&self) -> &[Arc<Connector>] {
        &self.connectors
    }

    /// Formats this device's renderer can sample from.
    pub fn dma_texture_formats(&self) -> &FormatList {
        &self.dma_texture_formats
    }

    /// Formats this device's renderer can render into.
    pub fn dma_render_formats(&self) -> &FormatList {
        &self.dma_render_formats
    }

    /// Mode setting interface.
    pub fn kms(&self) -> &Arc<dyn Kms> {
        &self.kms
    }

    /// Buffer allocation on this device.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// The graphics API bound to this device, if any.
    pub fn renderer_backend(&self) -> Option<&Arc<dyn Renderer>> {
        self.renderer_backend.as_ref()
    }

    /// Optional features of the bound renderer, empty without one.
    pub fn renderer_extensions(&self) -> RendererExtensions {
        self.renderer_backend
            .as_ref()
            .map_or(RendererExtensions::empty(), |r| r.extensions())
    }

    fn assignment(&self) -> std::sync::MutexGuard<'_, Assignment> {
        self.assignment.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The device that renders the frames shown on this device.
    pub fn renderer(&self) -> Option<Arc<Device>> {
        self.assignment().renderer.upgrade()
    }

    /// How frames shown on this device are produced.
    pub fn render_mode(&self) -> RenderMode {
        self.assignment().render_mode
    }

    pub(crate) fn set_assignment(&self, renderer: Weak<Device>, render_mode: RenderMode) {
        *self.assignment() = Assignment {
            renderer,
            render_mode,
        };
    }

    /// Whether this device renders its own frames.
    pub fn is_renderer(&self) -> bool {
        std::ptr::eq(self.assignment().renderer.as_ptr(), self)
    }

    /// Whether the device takes part in rendering and display.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable the device. A disabled device is not used for
    /// anything, its connectors and the connectors it renders for are
    /// uninitialized.
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) -> Result<()> {
        let core = self.core().ok_or(Error::Gone)?;
        if crate::core::is_render_thread() {
            return Err(Error::RenderThread)
        }
        if enabled == self.is_enabled() {
            return Ok(())
        }
        if !enabled && core.devices().iter().filter(|d| d.is_enabled()).count() <= 1 {
            return Err(Error::InvalidArgument(
                "there must be at least one enabled device",
            ))
        }
        if !enabled {
            for device in core.devices() {
                let rendered_here = device
                    .renderer()
                    .is_some_and(|r| Arc::ptr_eq(&r, self));
                if Arc::ptr_eq(&device, self) || rendered_here {
                    device.uninitialize_connectors();
                }
            }
        }
        self.enabled.store(enabled, Ordering::Release);
        tracing::info!("[{}] {}", self.short_name, if enabled { "Enabled" } else { "Disabled" });
        core.update_assignments();
        Ok(())
    }

    pub(crate) fn lock_claims(&self) -> std::sync::MutexGuard<'_, ()> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn uninitialize_connectors(&self) {
        for connector in &self.connectors {
            if let Err(e) = connector.uninitialize() {
                tracing::warn!("[{}] Failed to uninitialize {}: {e}", self.short_name, connector.name());
            }
        }
    }

    pub(crate) fn rescan_pending(&self) -> bool {
        self.rescan_pending.load(Ordering::Acquire)
    }

    /// Check every connector for connection changes, emitting plugged and
    /// unplugged events.
    ///
    /// Without DRM master the kernel may report stale connector state, the
    /// rescan is then postponed to the next [`Core::dispatch`]. Returns
    /// whether the connectors were rescanned.
    pub fn dispatch_hotplug_events(&self) -> bool {
        if !self.kms.is_master() {
            self.rescan_pending.store(true, Ordering::Release);
            tracing::warn!("[{}] Hotplug event dispatching delayed, not DRM master", self.short_name);
            return false
        }
        self.rescan_pending.store(false, Ordering::Release);
        let core = self.core();

        for connector in &self.connectors {
            let snapshot = match ConnectorSnapshot::query(&*self.kms, connector.id()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("[{}] Failed to query connector {}: {e}", self.short_name, connector.id());
                    continue
                },
            };
            if snapshot.is_connected() == connector.is_connected() {
                continue
            }
            if snapshot.is_connected() {
                connector.update(snapshot, &self.encoders);
                if let Some(core) = &core {
                    core.assign_connector_name(connector);
                }
                tracing::info!(
                    "[{}] Connector ({}) {}, {}, {} plugged",
                    self.short_name,
                    connector.id(),
                    connector.name(),
                    connector.model(),
                    connector.make()
                );
                if let Some(core) = &core {
                    core.emit(crate::events::CoreEvent::ConnectorPlugged(connector.clone()));
                }
            } else {
                tracing::info!(
                    "[{}] Connector ({}) {}, {}, {} unplugged",
                    self.short_name,
                    connector.id(),
                    connector.name(),
                    connector.model(),
                    connector.make()
                );
                if let Some(core) = &core {
                    core.emit(crate::events::CoreEvent::ConnectorUnplugged(connector.clone()));
                }
                if let Err(e) = connector.uninitialize() {
                    tracing::warn!("[{}] Failed to uninitialize {}: {e}", self.short_name, connector.name());
                }
                connector.update(snapshot, &self.encoders);
            }
        }
        true
    }

    /// How CPU buffers allocated on this device are written to.
    pub(crate) fn cpu_write_mode(&self) -> WriteMode {
        let force_gl = self
            .core()
            .is_some_and(|c| c.config().force_gl_allocation);
        if force_gl {
            WriteMode::Gles
        } else if self.caps.contains(Caps::PRIME_EXPORT) {
            WriteMode::Prime
        } else {
            WriteMode::Gbm
        }
    }
}
