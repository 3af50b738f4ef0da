use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _, Result};
use srm_core::{
    connector::{ConnectorInterface, Frame},
    format, Config, Connector, Core, Device,
};
use tracing_subscriber::{filter::Targets, prelude::*};

const USAGE: &str = "usage: srm-info [--paint SECONDS]";

fn init_logging(config: &Config) {
    let filter = Targets::new()
        .with_default(config.log_level())
        .with_target("srm_core::backend::software", config.renderer_log_level());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn parse_args() -> Result<Option<Duration>> {
    let mut args = std::env::args().skip(1);
    let mut paint = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--paint" => {
                let secs = args.next().context(USAGE)?;
                let secs: f64 = secs
                    .parse()
                    .with_context(|| format!("invalid number of seconds: {secs}"))?;
                if !secs.is_finite() || secs < 0.0 {
                    bail!("invalid number of seconds: {secs}");
                }
                paint = Some(Duration::from_secs_f64(secs));
            },
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            },
            _ => bail!("unknown argument {arg}\n{USAGE}"),
        }
    }
    Ok(paint)
}

fn print_device(device: &Arc<Device>) {
    println!("{} ({})", device.short_name(), device.name().display());
    println!("  boot vga: {}", device.is_boot_vga());
    println!("  enabled: {}", device.is_enabled());
    let client_caps: Vec<_> = device.client_caps().iter_names().map(|(n, _)| n).collect();
    println!("  client caps: {}", client_caps.join(" "));
    let caps: Vec<_> = device.caps().iter_names().map(|(n, _)| n).collect();
    println!("  caps: {}", caps.join(" "));
    println!("  render mode: {}", device.render_mode());
    match device.renderer() {
        Some(renderer) => println!("  renderer: {}", renderer.short_name()),
        None => println!("  renderer: none"),
    }
    let allocator = device.core().and_then(|c| c.allocator_device());
    println!(
        "  allocator: {}",
        allocator.as_ref().map_or("none", |d| d.short_name())
    );
    println!(
        "  crtcs: {}, encoders: {}, planes: {}",
        device.crtcs().len(),
        device.encoders().len(),
        device.planes().len()
    );
    for connector in device.connectors() {
        print_connector(connector);
    }
}

fn print_connector(connector: &Arc<Connector>) {
    println!("  connector {} [{}]", connector.name(), connector.state());
    if !connector.is_connected() {
        println!("    disconnected");
        return
    }
    println!(
        "    {} {} (serial {})",
        connector.make(),
        connector.model(),
        connector.serial()
    );
    println!(
        "    {}x{} mm, subpixel {}{}{}",
        connector.mm_width(),
        connector.mm_height(),
        connector.subpixel(),
        if connector.is_non_desktop() { ", non-desktop" } else { "" },
        if connector.is_leased() { ", leased" } else { "" },
    );
    for mode in connector.modes() {
        println!(
            "    {}x{}@{}{}",
            mode.width(),
            mode.height(),
            mode.refresh_rate(),
            if mode.is_preferred() { " (preferred)" } else { "" }
        );
    }
}

/// Fills every frame with a slowly cycling colour.
struct Painter {
    start:  Instant,
    pixels: Mutex<Vec<u8>>,
}

impl Painter {
    fn new() -> Self {
        Self {
            start:  Instant::now(),
            pixels: Mutex::new(Vec::new()),
        }
    }

    fn colour(&self) -> [u8; 4] {
        let t = self.start.elapsed().as_secs_f32();
        let channel = |phase: f32| ((t + phase).sin() * 0.5 + 0.5) * 255.0;
        // XRGB8888 is stored as B, G, R, X.
        [channel(4.0) as u8, channel(2.0) as u8, channel(0.0) as u8, 0xff]
    }
}

impl ConnectorInterface for Painter {
    fn initialize(&self, connector: &Arc<Connector>) {
        tracing::info!("[{}] Painting", connector.name());
    }

    fn paint(&self, connector: &Arc<Connector>, frame: &Frame) {
        let buffer = &frame.buffer;
        if format::depth_bpp(buffer.format()).map(|(_, bpp)| bpp) != Some(32) {
            tracing::warn!("[{}] Can't paint into {}", connector.name(), format::fourcc_name(buffer.format()));
            return
        }
        let (width, height) = (buffer.width(), buffer.height());
        let colour = self.colour();
        let mut pixels = self.pixels.lock().unwrap_or_else(|e| e.into_inner());
        let len = width as usize * height as usize * 4;
        pixels.resize(len, 0);
        for px in pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&colour);
        }
        if let Err(e) = buffer.write(width * 4, 0, 0, width, height, &pixels) {
            tracing::error!("[{}] Failed to write the frame: {e}", connector.name());
        }
        drop(pixels);
        if let Err(e) = connector.repaint() {
            tracing::debug!("[{}] Not scheduling another frame: {e}", connector.name());
        }
    }

    fn uninitialize(&self, connector: &Arc<Connector>) {
        tracing::info!("[{}] Done painting", connector.name());
    }
}

fn start_painting(connector: &Arc<Connector>) {
    if !connector.is_connected() || connector.is_leased() || connector.is_non_desktop() {
        return
    }
    if let Err(e) = connector.initialize(Arc::new(Painter::new())) {
        tracing::error!("[{}] Failed to initialize: {e}", connector.name());
    }
}

fn paint(core: &Arc<Core>, duration: Duration) -> Result<()> {
    let _plugged = core.on_connector_plugged(start_painting);
    let _unplugged = core.on_connector_unplugged(|connector| {
        if let Err(e) = connector.uninitialize() {
            tracing::debug!("[{}] {e}", connector.name());
        }
    });
    for device in core.devices() {
        device.connectors().iter().for_each(start_painting);
    }

    let deadline = Instant::now() + duration;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        if remaining.is_zero() {
            break
        }
        core.dispatch(Some(remaining.min(Duration::from_millis(250))))?;
    }

    for device in core.devices() {
        for connector in device.connectors().iter().filter(|c| c.is_initialized()) {
            connector.uninitialize()?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let config = Config::from_env();
    init_logging(&config);
    let paint_for = parse_args()?;

    let platform = srm_drm::UdevPlatform::new().context("failed to set up udev")?;
    let core = Core::new(Arc::new(platform), config)?;
    for device in core.devices() {
        print_device(&device);
    }
    if let Some(duration) = paint_for {
        paint(&core, duration)?;
    }
    Ok(())
}
