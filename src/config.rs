// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::device::{DeviceRequirements, SelectionPolicy};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub device: DeviceConfig,
    pub assets: AssetConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Quad Renderer".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
    pub rotation_degrees_per_second: f32,
    /// Use MAILBOX when the surface offers it, FIFO otherwise
    pub prefer_mailbox: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            rotation_degrees_per_second: 90.0,
            prefer_mailbox: true,
        }
    }
}

/// Physical device eligibility and selection
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub require_discrete_gpu: bool,
    pub require_geometry_shader: bool,
    /// "last" or "first" eligible device in enumeration order
    pub selection: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            require_discrete_gpu: true,
            require_geometry_shader: true,
            selection: "last".to_string(),
        }
    }
}

/// Startup assets, relative to the working directory
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub texture: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            vertex_shader: PathBuf::from("shaders/quad.vert.spv"),
            fragment_shader: PathBuf::from("shaders/quad.frag.spv"),
            texture: PathBuf::from("textures/texture.png"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Device eligibility predicates that are allowed to vary
    pub fn device_requirements(&self) -> DeviceRequirements {
        DeviceRequirements {
            require_discrete_gpu: self.device.require_discrete_gpu,
            require_geometry_shader: self.device.require_geometry_shader,
        }
    }

    /// Get selection policy as enum
    pub fn selection_policy(&self) -> SelectionPolicy {
        match self.device.selection.to_lowercase().as_str() {
            "last" => SelectionPolicy::LastMatch,
            "first" => SelectionPolicy::FirstMatch,
            other => {
                log::warn!("Unknown device selection '{}', defaulting to last match", other);
                SelectionPolicy::LastMatch
            }
        }
    }

    /// Validation layers only ever load in debug builds
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}
