//! Runtime configuration
//!
//! Everything here is read from the environment by [`Config::from_env`], but
//! the struct is plain data so it can also be built directly.

use std::path::PathBuf;

use tracing::level_filters::LevelFilter;

use crate::types::RenderMode;

/// Swapchain length used when nothing else is configured.
pub const DEFAULT_FB_COUNT: usize = 2;

/// Runtime configuration of a [`Core`](crate::core::Core).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Never enable the atomic client capability.
    pub force_legacy_api:            bool,
    /// Drive the cursor through the legacy cursor ioctls, even on atomic
    /// devices.
    pub force_legacy_cursor:         bool,
    /// Back CPU buffers with renderer textures instead of mappable buffer
    /// objects.
    pub force_gl_allocation:         bool,
    /// Don't use cursor planes at all.
    pub disable_cursor:              bool,
    /// Ignore custom scanout buffers.
    pub disable_direct_scanout:      bool,
    /// Enable the writeback connectors client capability.
    pub enable_writeback_connectors: bool,
    /// Enable the stereo 3D client capability.
    pub enable_stereo_3d:            bool,
    /// Device nodes that are never opened.
    pub device_blacklist:            Vec<PathBuf>,
    /// Value of `SRM_DEBUG`.
    pub debug:                       Option<i32>,
    /// Value of `SRM_EGL_DEBUG`.
    pub renderer_debug:              Option<i32>,
    /// Swapchain length, indexed by render mode: itself, prime, dumb, cpu.
    pub fb_count:                    [usize; 4],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            force_legacy_api:            false,
            force_legacy_cursor:         false,
            force_gl_allocation:         false,
            disable_cursor:              false,
            disable_direct_scanout:      false,
            enable_writeback_connectors: false,
            enable_stereo_3d:            false,
            device_blacklist:            Vec::new(),
            debug:                       None,
            renderer_debug:              None,
            fb_count:                    [DEFAULT_FB_COUNT; 4],
        }
    }
}

fn fb_count_slot(mode: RenderMode) -> Option<usize> {
    match mode {
        RenderMode::Itself => Some(0),
        RenderMode::Prime => Some(1),
        RenderMode::Dumb => Some(2),
        RenderMode::Cpu => Some(3),
        RenderMode::None => None,
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let int = |name: &str| var(name).and_then(|v| v.trim().parse::<i32>().ok());
        let flag = |name: &str| int(name) == Some(1);

        let mut fb_count = [DEFAULT_FB_COUNT; 4];
        for mode in [RenderMode::Itself, RenderMode::Prime, RenderMode::Dumb, RenderMode::Cpu] {
            let name = format!("SRM_RENDER_MODE_{}_FB_COUNT", mode.as_str());
            let Some(slot) = fb_count_slot(mode) else {
                continue
            };
            match int(&name) {
                Some(n @ 2..=3) => fb_count[slot] = n as usize,
                Some(n) => tracing::warn!("Ignoring {name}={n}, must be 2 or 3"),
                None => (),
            }
        }

        let device_blacklist = var("CZ_SRM_DEVICE_BLACKLIST")
            .map(|list| {
                list.split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            force_legacy_api: flag("CZ_SRM_FORCE_LEGACY_API"),
            force_legacy_cursor: flag("CZ_SRM_FORCE_LEGACY_CURSOR"),
            force_gl_allocation: flag("CZ_SRM_FORCE_GL_ALLOCATION"),
            disable_cursor: flag("CZ_SRM_DISABLE_CURSOR"),
            disable_direct_scanout: flag("CZ_SRM_DISABLE_DIRECT_SCANOUT"),
            enable_writeback_connectors: flag("CZ_SRM_ENABLE_WRITEBACK_CONNECTORS"),
            enable_stereo_3d: flag("CZ_SRM_ENABLE_STEREO_3D"),
            device_blacklist,
            debug: int("SRM_DEBUG"),
            renderer_debug: int("SRM_EGL_DEBUG"),
            fb_count,
        }
    }

    /// Number of swapchain images used for connectors in the given render
    /// mode.
    pub fn fb_count(&self, mode: RenderMode) -> usize {
        fb_count_slot(mode)
            .map(|slot| self.fb_count[slot])
            .unwrap_or(DEFAULT_FB_COUNT)
    }

    /// Whether `node` must not be opened.
    pub fn is_blacklisted(&self, node: &std::path::Path) -> bool {
        self.device_blacklist.iter().any(|p| p == node)
    }

    /// Maximum log level requested through `SRM_DEBUG`.
    pub fn log_level(&self) -> LevelFilter {
        level_for(self.debug)
    }

    /// Maximum log level of the renderer, requested through `SRM_EGL_DEBUG`.
    pub fn renderer_log_level(&self) -> LevelFilter {
        level_for(self.renderer_debug)
    }
}

fn level_for(value: Option<i32>) -> LevelFilter {
    match value {
        Some(0) => LevelFilter::OFF,
        Some(1 | 2) => LevelFilter::ERROR,
        Some(3) => LevelFilter::WARN,
        Some(n) if n >= 4 => LevelFilter::DEBUG,
        _ => LevelFilter::INFO,
    }
}
