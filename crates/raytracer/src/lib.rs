//! # Raytracer
//!
//! Host-side orchestration for a progressive, GPU-compute-driven ray tracer.
//!
//! The crate owns a Vulkan device, allocates and tracks device resources
//! (images, buffers, descriptor sets, a compute pipeline) and drives a
//! per-frame loop that dispatches a ray-tracing compute kernel, accumulates
//! samples across frames and reads the rendered image back to host memory.
//!
//! ## Features
//!
//! - **Explicit GPU memory**: memory-type selection, buffers and images with
//!   RAII release
//! - **Layout state machine**: every image layout transition is checked
//!   against a closed table
//! - **Two command streams**: compute dispatch and image readback each own a
//!   command buffer and fence so they overlap across frames
//! - **Static geometry upload**: triangles and spheres go to device-local
//!   storage buffers through a staging buffer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use raytracer::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = VulkanContext::new(&ContextConfig::default())?;
//!     let geometry = SceneGeometry::new(Vec::new(), vec![Sphere::new([0.0, 0.0, 5.0], 1.0)]);
//!     let buffers = GeometryBuffers::upload(&context, &geometry)?;
//!
//!     let config = RendererConfig::default();
//!     let mut renderer = Renderer::new(&context, &config, buffers)?;
//!     let camera = Camera::new(45.0, 0.1, 100.0);
//!
//!     renderer.resize(640, 480)?;
//!     let mut pixels = vec![0u8; 640 * 480 * 4];
//!     for _ in 0..16 {
//!         renderer.render(&camera.matrices())?;
//!         renderer.prepare_image()?;
//!     }
//!     renderer.copy_out(&mut pixels)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;
pub mod scene;

/// Common imports for crate users
pub mod prelude {
    pub use crate::{
        core::config::{ContextConfig, OutputFormat, RendererConfig},
        config::{Config, ConfigError},
        foundation::math::{Mat4, Vec3},
        render::{
            camera::{Camera, CameraMatrices},
            renderer::Renderer,
            vulkan::{VulkanContext, VulkanError, VulkanResult},
        },
        scene::{
            geometry::{GeometryBuffers, SceneGeometry},
            importer::{MeshImporter, ObjImporter},
            mesh::Mesh,
            primitives::{Sphere, Triangle, Vertex},
        },
    };
}
