//! Headless progressive render
//!
//! Loads a TOML or RON config (first argument, default `config.toml`),
//! renders the configured number of frames and writes the result to a PNG.

use raytracer::config::{Config, ConfigError};
use raytracer::core::config::{ContextConfig, OutputFormat, RendererConfig};
use raytracer::foundation::logging;
use raytracer::foundation::math::Vec3;
use raytracer::render::{Camera, Renderer};
use raytracer::render::vulkan::{VulkanContext, VulkanError};
use raytracer::scene::{GeometryBuffers, ImportError, MeshImporter, ObjImporter, SceneGeometry, Sphere};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Error, Debug)]
enum AppError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("GPU: {0}")]
    Vulkan(#[from] VulkanError),
    #[error("model import: {0}")]
    Import(#[from] ImportError),
    #[error("writing image: {0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Invalid(String),
}

/// What to put in front of the camera
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct SceneConfig {
    model_path: Option<String>,
    spheres: Vec<Sphere>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct CameraConfig {
    position: [f32; 3],
    rotation_degrees: [f32; 3],
    vertical_fov_degrees: f32,
    near: f32,
    far: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation_degrees: [0.0; 3],
            vertical_fov_degrees: 45.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl CameraConfig {
    fn build(&self, width: u32, height: u32) -> Camera {
        let mut camera = Camera::new(self.vertical_fov_degrees, self.near, self.far);
        camera.position = Vec3::from(self.position);
        camera.rotation = Vec3::from(self.rotation_degrees);
        camera.resize(width, height);
        camera
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    context: ContextConfig,
    renderer: RendererConfig,
    scene: SceneConfig,
    camera: CameraConfig,
    frames: u32,
    output_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            renderer: RendererConfig::default(),
            scene: SceneConfig {
                model_path: None,
                spheres: vec![Sphere::new([0.0, 0.0, 5.0], 1.0)],
            },
            camera: CameraConfig::default(),
            frames: 32,
            output_path: "render.png".to_string(),
        }
    }
}

impl Config for AppConfig {}

impl AppConfig {
    fn validate(&self) -> Result<(), AppError> {
        self.renderer.validate()?;
        if self.frames == 0 {
            return Err(AppError::Invalid("frames must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn load_geometry(scene: &SceneConfig) -> Result<SceneGeometry, AppError> {
    let meshes = match &scene.model_path {
        Some(path) => ObjImporter.import(Path::new(path))?,
        None => Vec::new(),
    };
    Ok(SceneGeometry::from_meshes(&meshes, scene.spheres.clone())?)
}

/// Reorder BGRA pixels to RGBA in place
fn bgra_to_rgba(pixels: &mut [u8]) {
    for pixel in pixels.chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }
}

fn run(config: &AppConfig) -> Result<(), AppError> {
    let geometry = load_geometry(&config.scene)?;

    let context = VulkanContext::new(&config.context)?;
    log::info!("Using {}", context.physical_device().name());

    let buffers = GeometryBuffers::upload(&context, &geometry)?;
    let mut renderer = Renderer::new(&context, &config.renderer, buffers)?;

    let (width, height) = (config.renderer.width, config.renderer.height);
    let camera = config.camera.build(width, height).matrices();
    renderer.resize(width, height)?;

    let started = Instant::now();
    for _ in 0..config.frames {
        renderer.render(&camera)?;
        renderer.prepare_image()?;
    }
    log::info!(
        "Rendered {} frames at {}x{} in {:.2?}",
        config.frames,
        width,
        height,
        started.elapsed()
    );

    let mut pixels = vec![0u8; width as usize * height as usize * 4];
    if !renderer.copy_out(&mut pixels)? {
        return Err(AppError::Invalid("renderer produced no frame".to_string()));
    }
    renderer.dispose()?;

    if renderer_output_is_bgra(config) {
        bgra_to_rgba(&mut pixels);
    }
    let image = image::RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| AppError::Invalid("pixel buffer does not match viewport".to_string()))?;
    image.save(&config.output_path)?;
    log::info!("Wrote {}", config.output_path);
    Ok(())
}

fn renderer_output_is_bgra(config: &AppConfig) -> bool {
    config.renderer.output_format == OutputFormat::Bgra8
}

fn main() {
    logging::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = if Path::new(&config_path).exists() {
        AppConfig::load(&config_path)
    } else {
        log::warn!("{} not found, using defaults", config_path);
        Ok(AppConfig::default())
    };

    let result = config
        .map_err(AppError::from)
        .and_then(|config| config.validate().map(|()| config))
        .and_then(|config| run(&config));

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raytracer::config::ConfigFormat;

    #[test]
    fn test_shipped_config_parses() {
        let text = include_str!("../config.toml");
        let config = AppConfig::parse(text, ConfigFormat::Toml).unwrap();

        assert_eq!(config.frames, 64);
        assert_eq!(config.scene.spheres.len(), 3);
        assert_eq!(config.scene.spheres[2].radius, 100.0);
        assert_eq!((config.renderer.width, config.renderer.height), (640, 480));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = AppConfig::parse("frames = 4\n", ConfigFormat::Toml).unwrap();
        assert_eq!(config.frames, 4);
        assert_eq!(config.scene.spheres.len(), 1);
        assert_eq!(config.camera.vertical_fov_degrees, 45.0);
    }

    #[test]
    fn test_zero_frames_is_invalid() {
        let config = AppConfig {
            frames: 0,
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Invalid(_))));
    }

    #[test]
    fn test_bgra_swizzle() {
        let mut pixels = vec![1, 2, 3, 4, 5, 6, 7, 8];
        bgra_to_rgba(&mut pixels);
        assert_eq!(pixels, vec![3, 2, 1, 4, 7, 6, 5, 8]);
    }

    #[test]
    fn test_scene_without_model_keeps_spheres() {
        let geometry = load_geometry(&SceneConfig {
            model_path: None,
            spheres: vec![Sphere::new([1.0, 2.0, 3.0], 0.25)],
        })
        .unwrap();
        assert!(geometry.triangles.is_empty());
        assert_eq!(geometry.spheres.len(), 1);
    }
}
