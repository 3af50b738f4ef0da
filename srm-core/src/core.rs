//! The entry point of the crate
//!
//! A [`Core`] owns every opened [`Device`]. It decides which device allocates
//! shared buffers, which device renders for which, and dispatches hotplug
//! events.

use std::{
    cell::Cell,
    os::fd::BorrowedFd,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use crate::{
    backend::{HotplugEvent, Platform},
    config::Config,
    connector::Connector,
    device::Device,
    error::{Error, Result},
    events::{
        broadcast::{Receiver, Ring},
        listeners::{Listener, Listeners},
        CoreEvent, EventSource,
    },
    format::{self, FormatList},
    types::{Caps, ConnectorType, RenderMode},
};

thread_local! {
    static RENDER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the current thread as a connector render thread.
pub(crate) fn mark_render_thread() {
    RENDER_THREAD.with(|r| r.set(true));
}

/// Whether the current thread is a connector render thread. Operations that
/// wait for render threads are refused there.
pub(crate) fn is_render_thread() -> bool {
    RENDER_THREAD.with(|r| r.get())
}

#[derive(Default)]
struct State {
    devices:        Vec<Arc<Device>>,
    allocator:      Option<Arc<Device>>,
    shared_formats: FormatList,
    suspended:      bool,
}

/// Capacity of the event stream handed out by [`Core::subscribe`].
const EVENT_QUEUE: usize = 64;

/// The set of GPUs being managed.
///
/// Dropping the last reference uninitializes every connector and waits for
/// their render threads to exit.
pub struct Core {
    platform:            Arc<dyn Platform>,
    config:              Config,
    state:               Mutex<State>,
    device_created:      Listeners<Arc<Device>>,
    device_removed:      Listeners<Arc<Device>>,
    connector_plugged:   Listeners<Arc<Connector>>,
    connector_unplugged: Listeners<Arc<Connector>>,
    events:              Ring<CoreEvent>,
    me:                  Weak<Core>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Core")
            .field("devices", &state.devices)
            .field("suspended", &state.suspended)
            .finish_non_exhaustive()
    }
}

fn allocator_score(candidate: &Device, devices: &[Arc<Device>]) -> u32 {
    let exports = candidate.caps().contains(Caps::PRIME_EXPORT);
    let mut score = if exports { 100 } else { 10 };
    for other in devices {
        if std::ptr::eq(&**other, candidate) || !other.is_enabled() {
            continue
        }
        let shares_format = FormatList::intersect(
            candidate.dma_texture_formats(),
            other.dma_texture_formats(),
        )
        .iter()
        .any(|f| f.modifier != format::MOD_INVALID);
        score += if exports && other.caps().contains(Caps::PRIME_IMPORT) && shares_format {
            100
        } else if other.caps().contains(Caps::DUMB_BUFFER) {
            20
        } else {
            10
        };
    }
    score
}

fn renderer_score(device: &Device, candidate: &Arc<Device>, allocator: &Device) -> u32 {
    let mut score = 0;
    if std::ptr::eq(&**candidate, device) {
        score += 10;
    }
    if !candidate.caps().contains(Caps::DUMB_BUFFER) {
        score += 20;
    }
    if candidate.caps().contains(Caps::PRIME_IMPORT) &&
        allocator.caps().contains(Caps::PRIME_EXPORT)
    {
        score += 100;
    }
    if std::ptr::eq(&**candidate, allocator) {
        score += 50;
    }
    score
}

/// Pick the highest scoring element, ties go to the first one.
fn best_by<'a, T>(items: impl Iterator<Item = &'a T>, score: impl Fn(&T) -> u32) -> Option<&'a T> {
    let mut best = None;
    let mut best_score = 0;
    for item in items {
        let s = score(item);
        if best.is_none() || s > best_score {
            best = Some(item);
            best_score = s;
        }
    }
    best
}

impl Core {
    /// Open every usable GPU found by `platform`.
    pub fn new(platform: Arc<dyn Platform>, config: Config) -> Result<Arc<Self>> {
        let core = Arc::new_cyclic(|me| Self {
            platform,
            config,
            state: Mutex::new(State::default()),
            device_created: Default::default(),
            device_removed: Default::default(),
            connector_plugged: Default::default(),
            connector_unplugged: Default::default(),
            events: Ring::new(EVENT_QUEUE),
            me: me.clone(),
        });

        let nodes = core.platform.enumerate()?;
        let mut devices = Vec::with_capacity(nodes.len());
        for node in nodes {
            if core.config.is_blacklisted(&node.path) {
                tracing::info!("Device {} is blacklisted, skipping", node.path.display());
                continue
            }
            match core.open_device(&node) {
                Ok(device) => devices.push(device),
                Err(e) => tracing::error!("Failed to open {}: {e}", node.path.display()),
            }
        }
        if devices.is_empty() {
            tracing::error!("No usable DRM device");
            return Err(Error::NoDevices)
        }
        core.lock().devices = devices;
        core.update_assignments();
        for device in core.devices() {
            for connector in device.connectors() {
                core.assign_connector_name(connector);
            }
        }
        Ok(core)
    }

    fn open_device(&self, node: &crate::backend::DeviceNode) -> Result<Arc<Device>> {
        let opened = self.platform.open(node)?;
        Device::new(self.me.clone(), node, opened, &self.config)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Configuration the core was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every opened device, enabled or not.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.lock().devices.clone()
    }

    /// The device buffers shared between GPUs are allocated on.
    pub fn allocator_device(&self) -> Option<Arc<Device>> {
        self.lock().allocator.clone()
    }

    /// Formats every enabled device can sample from buffers allocated by
    /// the allocator device.
    pub fn shared_dma_texture_formats(&self) -> FormatList {
        self.lock().shared_formats.clone()
    }

    /// Whether [`Core::suspend`] is in effect.
    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// Readable when hotplug events are pending, see [`Core::dispatch`].
    pub fn monitor_fd(&self) -> Option<BorrowedFd<'_>> {
        self.platform.monitor_fd()
    }

    /// Pick the allocator, assign renderers and recompute the shared
    /// formats. Run whenever the set of enabled devices changes.
    pub(crate) fn update_assignments(&self) {
        let mut state = self.lock();
        let enabled: Vec<_> = state
            .devices
            .iter()
            .filter(|d| d.is_enabled())
            .cloned()
            .collect();
        let Some(allocator) = best_by(enabled.iter(), |d| allocator_score(d, &enabled)).cloned()
        else {
            state.allocator = None;
            state.shared_formats = FormatList::new();
            return
        };
        tracing::info!("Allocator device: {}", allocator.short_name());

        for device in &state.devices {
            if !device.is_enabled() {
                device.set_assignment(Weak::new(), RenderMode::None);
                continue
            }
            let itself = enabled.len() == 1 ||
                (device.caps().contains(Caps::PRIME_IMPORT) &&
                    allocator.caps().contains(Caps::PRIME_EXPORT));
            let renderer = if itself && device.renderer_backend().is_some() {
                Some(device.clone())
            } else {
                let candidates = enabled.iter().filter(|c| c.renderer_backend().is_some());
                best_by(candidates, |c| renderer_score(device, c, &allocator)).cloned()
            };
            let Some(renderer) = renderer else {
                tracing::error!("[{}] No device can render for it", device.short_name());
                device.set_assignment(Weak::new(), RenderMode::None);
                continue
            };
            let mode = if Arc::ptr_eq(&renderer, device) {
                RenderMode::Itself
            } else if device.caps().contains(Caps::PRIME_IMPORT) &&
                renderer.caps().contains(Caps::PRIME_EXPORT)
            {
                RenderMode::Prime
            } else if device.caps().contains(Caps::DUMB_BUFFER) {
                RenderMode::Dumb
            } else {
                RenderMode::Cpu
            };
            tracing::info!(
                "[{}] Renderer: {}, render mode: {mode}",
                device.short_name(),
                renderer.short_name()
            );
            device.set_assignment(Arc::downgrade(&renderer), mode);
        }

        let mut shared = allocator.dma_texture_formats().clone();
        if enabled.len() > 1 {
            shared.remove_modifier(format::MOD_INVALID);
            for other in &enabled {
                if Arc::ptr_eq(other, &allocator) {
                    continue
                }
                if let Some(renderer) = other.renderer() {
                    shared = FormatList::intersect(&shared, renderer.dma_render_formats());
                }
            }
        }
        state.allocator = Some(allocator);
        state.shared_formats = shared;
    }

    /// Give `connector` a name id, the smallest one not taken by another
    /// connector of the same type. Ids that are already set are kept.
    pub(crate) fn assign_connector_name(&self, connector: &Arc<Connector>) {
        if connector.name_id() != 0 {
            return
        }
        let ty: ConnectorType = connector.ty();
        let taken: Vec<u32> = self
            .devices()
            .iter()
            .flat_map(|d| d.connectors().iter())
            .filter(|c| !Arc::ptr_eq(c, connector) && c.ty() == ty)
            .map(|c| c.name_id())
            .collect();
        let id = (1..).find(|i| !taken.contains(i)).unwrap_or(1);
        connector.set_name_id(id);
    }

    /// Notify listeners, then the event stream.
    pub(crate) fn emit(&self, event: CoreEvent) {
        match &event {
            CoreEvent::DeviceCreated(d) => self.device_created.notify(d),
            CoreEvent::DeviceRemoved(d) => self.device_removed.notify(d),
            CoreEvent::ConnectorPlugged(c) => self.connector_plugged.notify(c),
            CoreEvent::ConnectorUnplugged(c) => self.connector_unplugged.notify(c),
        }
        self.events.broadcast(event);
    }

    /// Call `f` for every device added after this point. Dropping the returned
    /// [`Listener`] unregisters it.
    pub fn on_device_created(&self, f: impl Fn(&Arc<Device>) + Send + Sync + 'static) -> Listener {
        self.device_created.add(f)
    }

    /// Call `f` for every device about to be removed.
    pub fn on_device_removed(&self, f: impl Fn(&Arc<Device>) + Send + Sync + 'static) -> Listener {
        self.device_removed.add(f)
    }

    /// Call `f` for every connector a display gets plugged into.
    pub fn on_connector_plugged(
        &self,
        f: impl Fn(&Arc<Connector>) + Send + Sync + 'static,
    ) -> Listener {
        self.connector_plugged.add(f)
    }

    /// Call `f` for every connector whose display got unplugged. An
    /// initialized connector is uninitialized right after the callbacks
    /// return.
    pub fn on_connector_unplugged(
        &self,
        f: impl Fn(&Arc<Connector>) + Send + Sync + 'static,
    ) -> Listener {
        self.connector_unplugged.add(f)
    }

    /// Handle pending hotplug events, waiting up to `timeout` for some to
    /// arrive. `None` waits forever. Returns the number of events received.
    ///
    /// Callbacks registered through the `on_*` methods run on the calling
    /// thread.
    pub fn dispatch(&self, timeout: Option<Duration>) -> Result<usize> {
        if !self.is_suspended() {
            for device in self.devices() {
                if device.rescan_pending() {
                    device.dispatch_hotplug_events();
                }
            }
        }
        let events = self.platform.poll_monitor(timeout)?;
        let count = events.len();
        for event in events {
            if self.is_suspended() {
                tracing::debug!("Suspended, ignoring {event:?}");
                continue
            }
            self.handle_event(event);
        }
        Ok(count)
    }

    fn find_device(&self, path: &std::path::Path) -> Option<Arc<Device>> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.name() == path)
            .cloned()
    }

    fn handle_event(&self, event: HotplugEvent) {
        match event {
            HotplugEvent::Changed(path) => match self.find_device(&path) {
                Some(device) => {
                    device.dispatch_hotplug_events();
                },
                None => tracing::debug!("Change event for unknown device {}", path.display()),
            },
            HotplugEvent::Added(node) => {
                if self.config.is_blacklisted(&node.path) || self.find_device(&node.path).is_some() {
                    return
                }
                let device = match self.open_device(&node) {
                    Ok(device) => device,
                    Err(e) => {
                        tracing::error!("Failed to open hotplugged {}: {e}", node.path.display());
                        return
                    },
                };
                self.lock().devices.push(device.clone());
                self.update_assignments();
                for connector in device.connectors() {
                    self.assign_connector_name(connector);
                }
                tracing::info!("Device {} added", device.short_name());
                self.emit(CoreEvent::DeviceCreated(device.clone()));
                for connector in device.connectors().iter().filter(|c| c.is_connected()) {
                    self.emit(CoreEvent::ConnectorPlugged(connector.clone()));
                }
            },
            HotplugEvent::Removed(path) => {
                let Some(device) = self.find_device(&path) else {
                    return
                };
                for connector in device.connectors().iter().filter(|c| c.is_connected()) {
                    self.emit(CoreEvent::ConnectorUnplugged(connector.clone()));
                }
                device.uninitialize_connectors();
                // Connectors of other devices may have been rendered by it.
                for other in self.devices() {
                    if other.renderer().is_some_and(|r| Arc::ptr_eq(&r, &device)) {
                        other.uninitialize_connectors();
                    }
                }
                self.lock().devices.retain(|d| !Arc::ptr_eq(d, &device));
                tracing::info!("Device {} removed", device.short_name());
                self.emit(CoreEvent::DeviceRemoved(device));
                self.update_assignments();
            },
        }
    }

    /// Release every CRTC, e.g. before switching to another VT.
    ///
    /// Every initialized connector is uninitialized and reported as
    /// unplugged. Hotplug events are ignored until [`Core::resume`].
    pub fn suspend(&self) -> Result<()> {
        if is_render_thread() {
            return Err(Error::RenderThread)
        }
        if self.is_suspended() {
            return Ok(())
        }
        for device in self.devices() {
            for connector in device.connectors().iter().filter(|c| c.is_connected()) {
                tracing::info!(
                    "[{}] Connector ({}) {} unplugged",
                    device.short_name(),
                    connector.id(),
                    connector.name()
                );
                self.emit(CoreEvent::ConnectorUnplugged(connector.clone()));
                if let Err(e) = connector.uninitialize() {
                    tracing::warn!("Failed to uninitialize {}: {e}", connector.name());
                }
                // Rediscovered as plugged on resume.
                connector.mark_disconnected();
            }
        }
        self.lock().suspended = true;
        Ok(())
    }

    /// Undo [`Core::suspend`]. Connectors that are still connected are
    /// reported as plugged again.
    pub fn resume(&self) -> Result<()> {
        if is_render_thread() {
            return Err(Error::RenderThread)
        }
        {
            let mut state = self.lock();
            if !state.suspended {
                return Ok(())
            }
            state.suspended = false;
        }
        for device in self.devices() {
            device.dispatch_hotplug_events();
        }
        Ok(())
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let devices = std::mem::take(&mut self.lock().devices);
        for device in &devices {
            device.uninitialize_connectors();
        }
    }
}

impl EventSource<CoreEvent> for Core {
    type Source = Receiver<CoreEvent>;

    fn subscribe(&self) -> Self::Source {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use futures_lite::StreamExt;

    use super::*;
    use crate::backend::{
        fake::{self, FakeGpu, FakePlatform},
        DriverCap, PRIME_CAP_IMPORT,
    };

    #[test]
    fn no_devices() {
        let platform = Arc::new(FakePlatform::new(Vec::new()));
        assert!(matches!(Core::new(platform, Config::default()), Err(Error::NoDevices)));

        let mut gpu = FakeGpu::new(0, 1);
        gpu.fail_open = true;
        let platform = Arc::new(FakePlatform::new(vec![gpu]));
        assert!(matches!(Core::new(platform, Config::default()), Err(Error::NoDevices)));
    }

    #[test]
    fn blacklisted_devices_are_skipped() {
        let config = Config {
            device_blacklist: vec!["/dev/dri/card1".into()],
            ..Default::default()
        };
        let (_, core) = fake::core(vec![FakeGpu::new(0, 1), FakeGpu::new(1, 1)], config);
        assert_eq!(core.devices().len(), 1);
        assert_eq!(core.devices()[0].short_name(), "card0");
    }

    #[test]
    fn prime_capable_pair() {
        let (_, core) = fake::core(vec![FakeGpu::new(0, 1), FakeGpu::new(1, 1)], Config::default());
        let devices = core.devices();
        let allocator = core.allocator_device().unwrap();
        assert!(Arc::ptr_eq(&allocator, &devices[0]));
        for d in &devices {
            assert_eq!(d.render_mode(), RenderMode::Itself);
            assert!(d.is_renderer());
        }
        let shared = core.shared_dma_texture_formats();
        assert!(!shared.is_empty());
        assert!(shared.iter().all(|f| f.modifier != format::MOD_INVALID));
    }

    #[test]
    fn display_only_gpu_gets_prime() {
        let gpus = vec![FakeGpu::new(0, 1), FakeGpu::new(1, 1).without_renderer()];
        let (_, core) = fake::core(gpus, Config::default());
        let devices = core.devices();
        assert_eq!(devices[1].render_mode(), RenderMode::Prime);
        assert!(Arc::ptr_eq(&devices[1].renderer().unwrap(), &devices[0]));
    }

    #[test]
    fn dumb_and_cpu_fallbacks() {
        let gpus = vec![FakeGpu::new(0, 1), FakeGpu::new(1, 1).without_renderer()];
        gpus[1].kms.set_cap(DriverCap::Prime, 0);
        let platform = Arc::new(FakePlatform::new(gpus));
        let core = Core::new(platform.clone(), Config::default()).unwrap();
        assert_eq!(core.devices()[1].render_mode(), RenderMode::Dumb);
        drop(core);

        platform.kms(1).set_cap(DriverCap::DumbBuffer, 0);
        let core = Core::new(platform, Config::default()).unwrap();
        assert_eq!(core.devices()[1].render_mode(), RenderMode::Cpu);
    }

    #[test]
    fn renderer_without_dumb_buffers_is_preferred() {
        // card0 allocates but can't render. Neither card1 nor card2 can import,
        // and only card2 lacks dumb buffers.
        let gpus = vec![
            FakeGpu::new(0, 1).without_renderer(),
            FakeGpu::new(1, 1),
            FakeGpu::new(2, 1),
        ];
        gpus[1].kms.set_cap(DriverCap::Prime, 0);
        gpus[2].kms.set_cap(DriverCap::Prime, 0);
        gpus[2].kms.set_cap(DriverCap::DumbBuffer, 0);
        let (_, core) = fake::core(gpus, Config::default());
        let devices = core.devices();
        assert!(Arc::ptr_eq(&core.allocator_device().unwrap(), &devices[0]));
        assert!(Arc::ptr_eq(&devices[1].renderer().unwrap(), &devices[2]));
        assert_eq!(devices[1].render_mode(), RenderMode::Dumb);
        assert_eq!(devices[2].render_mode(), RenderMode::Itself);
    }

    #[test]
    fn allocator_prefers_exporters() {
        let gpus = vec![FakeGpu::new(0, 1), FakeGpu::new(1, 1)];
        gpus[0].kms.set_cap(DriverCap::Prime, PRIME_CAP_IMPORT);
        let (_, core) = fake::core(gpus, Config::default());
        let devices = core.devices();
        assert!(Arc::ptr_eq(&core.allocator_device().unwrap(), &devices[1]));
        // card0 can import from the allocator, so it renders itself.
        assert_eq!(devices[0].render_mode(), RenderMode::Itself);
    }

    #[test]
    fn connector_names() {
        let (_, core) = fake::core(vec![FakeGpu::new(0, 2), FakeGpu::new(1, 1)], Config::default());
        let names: Vec<String> = core
            .devices()
            .iter()
            .flat_map(|d| d.connectors().iter().map(|c| c.name()))
            .collect();
        assert_eq!(names, ["HDMI-A-1", "HDMI-A-2", "HDMI-A-3"]);
    }

    #[test]
    fn gpu_hotplug() {
        let (platform, core) = fake::core(vec![FakeGpu::new(0, 1)], Config::default());
        let created = Arc::new(Mutex::new(Vec::new()));
        let sink = created.clone();
        let _l = core.on_device_created(move |d| sink.lock().unwrap().push(d.short_name().to_owned()));
        let plugged = Arc::new(Mutex::new(0));
        let sink = plugged.clone();
        let _p = core.on_connector_plugged(move |_| *sink.lock().unwrap() += 1);

        let gpu = FakeGpu::new(1, 2);
        let node = gpu.node.clone();
        platform.gpus.lock().unwrap().push(gpu);
        platform.push_event(HotplugEvent::Added(node.clone()));
        assert_eq!(core.dispatch(Some(Duration::ZERO)).unwrap(), 1);
        assert_eq!(*created.lock().unwrap(), ["card1"]);
        assert_eq!(*plugged.lock().unwrap(), 2);
        assert_eq!(core.devices().len(), 2);

        // Adding the same node twice is ignored.
        platform.push_event(HotplugEvent::Added(node.clone()));
        core.dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(core.devices().len(), 2);

        let removed = Arc::new(Mutex::new(0));
        let sink = removed.clone();
        let _r = core.on_device_removed(move |_| *sink.lock().unwrap() += 1);
        platform.push_event(HotplugEvent::Removed(node.path));
        core.dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(*removed.lock().unwrap(), 1);
        assert_eq!(core.devices().len(), 1);
    }

    #[test]
    fn event_stream() {
        let (platform, core) = fake::core(vec![FakeGpu::new(0, 1)], Config::default());
        let mut events = core.subscribe();
        platform.kms(0).set_connected(0, false);
        platform.push_event(HotplugEvent::Changed("/dev/dri/card0".into()));
        core.dispatch(Some(Duration::ZERO)).unwrap();
        let event = futures_executor::block_on(events.next()).unwrap();
        assert!(matches!(event, CoreEvent::ConnectorUnplugged(c) if c.id() == 100));
    }

    #[test]
    fn pending_rescan_runs_on_dispatch() {
        let (platform, core) = fake::core(vec![FakeGpu::new(0, 1)], Config::default());
        let kms = platform.kms(0);
        kms.master.store(false, Ordering::Relaxed);
        kms.set_connected(0, false);
        platform.push_event(HotplugEvent::Changed("/dev/dri/card0".into()));
        core.dispatch(Some(Duration::ZERO)).unwrap();
        assert!(core.devices()[0].connectors()[0].is_connected());

        kms.master.store(true, Ordering::Relaxed);
        core.dispatch(Some(Duration::ZERO)).unwrap();
        assert!(!core.devices()[0].connectors()[0].is_connected());
    }

    #[test]
    fn suspend_and_resume() {
        let (platform, core) = fake::core(vec![FakeGpu::new(0, 2)], Config::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let _u = core.on_connector_unplugged(move |c| sink.lock().unwrap().push((false, c.id())));
        let sink = log.clone();
        let _p = core.on_connector_plugged(move |c| sink.lock().unwrap().push((true, c.id())));

        core.suspend().unwrap();
        assert!(core.is_suspended());
        core.suspend().unwrap();
        assert_eq!(*log.lock().unwrap(), [(false, 100), (false, 101)]);

        // Ignored while suspended
        platform.push_event(HotplugEvent::Changed("/dev/dri/card0".into()));
        assert_eq!(core.dispatch(Some(Duration::ZERO)).unwrap(), 1);
        assert_eq!(log.lock().unwrap().len(), 2);

        platform.kms(0).set_connected(1, false);
        core.resume().unwrap();
        assert!(!core.is_suspended());
        assert_eq!(log.lock().unwrap()[2..], [(true, 100)]);
        core.resume().unwrap();
    }
}
