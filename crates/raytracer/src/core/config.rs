//! # Unified Configuration
//!
//! Configuration structures for GPU context bring-up and the renderer.
//! Both implement [`Config`] and load from TOML or RON files.

use ash::vk;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::config::{Config, ConfigError, ConfigFormat};

/// Default location of the compiled path-tracing kernel
pub const DEFAULT_KERNEL_PATH: &str = "shaders/raytracing.comp.spv";

/// Directory the build script compiled the kernels into, if it ran `glslc`
pub const BUILT_KERNEL_DIR: Option<&str> = option_env!("RAYTRACER_KERNEL_DIR");

/// # Context Configuration
///
/// Parameters for Vulkan instance and device creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Whether to enable Vulkan validation layers (`None` follows the build type)
    pub enable_validation: Option<bool>,
    /// Pick a discrete GPU over integrated ones when both are present
    pub prefer_discrete_gpu: bool,
}

impl ContextConfig {
    /// Create a new context configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            enable_validation: None,
            prefer_discrete_gpu: true,
        }
    }

    /// Enable or disable validation layers
    #[must_use]
    pub const fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Resolved validation setting: explicit value, otherwise debug builds only
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new("Raytracer")
    }
}

impl Config for ContextConfig {}

/// Pixel format of the host-readable output image
///
/// Both formats are 4 bytes per pixel, so the readback size does not depend on
/// the choice. `Rgba8` has guaranteed storage-image support on every Vulkan
/// device; `Bgra8` matches most desktop bitmap APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputFormat {
    /// 8-bit RGBA, unsigned normalized
    #[default]
    Rgba8,
    /// 8-bit BGRA, unsigned normalized
    Bgra8,
}

impl OutputFormat {
    /// Matching Vulkan format
    pub const fn vk_format(self) -> vk::Format {
        match self {
            Self::Rgba8 => vk::Format::R8G8B8A8_UNORM,
            Self::Bgra8 => vk::Format::B8G8R8A8_UNORM,
        }
    }

    /// Bytes per pixel
    pub const fn bytes_per_pixel(self) -> u32 {
        4
    }
}

/// # Renderer Configuration
///
/// Kernel location and output surface parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Path to the compiled compute kernel (SPIR-V)
    pub kernel_path: String,
    /// Output image format
    pub output_format: OutputFormat,
    /// Initial viewport width in pixels
    pub width: u32,
    /// Initial viewport height in pixels
    pub height: u32,
}

impl RendererConfig {
    /// Create a renderer configuration for the given kernel
    pub fn new(kernel_path: impl Into<String>) -> Self {
        Self {
            kernel_path: kernel_path.into(),
            output_format: OutputFormat::default(),
            width: 800,
            height: 600,
        }
    }

    /// Set the initial viewport size
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the output format
    #[must_use]
    pub const fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kernel_path.is_empty() {
            return Err(ConfigError::Invalid("kernel path cannot be empty".to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "viewport must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Kernel file to load
    ///
    /// The configured path when it exists; otherwise the file of the same name
    /// in [`BUILT_KERNEL_DIR`], if that exists. Falls back to the configured
    /// path so the load error names what the user asked for.
    pub fn resolved_kernel_path(&self) -> PathBuf {
        let configured = PathBuf::from(&self.kernel_path);
        if configured.exists() {
            return configured;
        }
        BUILT_KERNEL_DIR
            .zip(configured.file_name())
            .map(|(dir, name)| Path::new(dir).join(name))
            .filter(|built| built.exists())
            .unwrap_or(configured)
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new(DEFAULT_KERNEL_PATH)
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renderer_config_toml_round_trip() {
        let config = RendererConfig::new("kernels/test.spv")
            .with_size(320, 200)
            .with_output_format(OutputFormat::Bgra8);

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = RendererConfig::parse(&text, ConfigFormat::Toml).unwrap();

        assert_eq!(parsed.kernel_path, "kernels/test.spv");
        assert_eq!((parsed.width, parsed.height), (320, 200));
        assert_eq!(parsed.output_format, OutputFormat::Bgra8);
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let parsed = RendererConfig::parse("width = 64\n", ConfigFormat::Toml).unwrap();
        assert_eq!(parsed.width, 64);
        assert_eq!(parsed.height, 600);
        assert_eq!(parsed.kernel_path, DEFAULT_KERNEL_PATH);
    }

    #[test]
    fn test_context_config_ron() {
        let parsed = ContextConfig::parse(
            "(application_name: \"bench\", enable_validation: Some(false))",
            ConfigFormat::Ron,
        )
        .unwrap();
        assert_eq!(parsed.application_name, "bench");
        assert!(!parsed.validation_enabled());
        assert!(parsed.prefer_discrete_gpu);
    }

    #[test]
    fn test_unsupported_extension_is_rejected() {
        let result = RendererConfig::load("renderer.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_validation_rejects_empty_viewport() {
        let config = RendererConfig::default().with_size(0, 10);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(RendererConfig::default().validate().is_ok());
    }

    #[test]
    fn test_existing_kernel_path_is_kept() {
        let config = RendererConfig::new("Cargo.toml");
        assert_eq!(config.resolved_kernel_path(), PathBuf::from("Cargo.toml"));
    }

    #[test]
    fn test_missing_kernel_without_build_copy_is_kept() {
        let config = RendererConfig::new("nowhere/not_a_kernel.spv");
        assert_eq!(config.resolved_kernel_path(), PathBuf::from("nowhere/not_a_kernel.spv"));
    }

    #[test]
    fn test_output_formats_are_four_bytes() {
        assert_eq!(OutputFormat::Rgba8.vk_format(), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(OutputFormat::Bgra8.vk_format(), vk::Format::B8G8R8A8_UNORM);
        assert_eq!(OutputFormat::Bgra8.bytes_per_pixel(), 4);
    }
}
