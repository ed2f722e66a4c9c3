//! Rendering: Vulkan backend, compute pipeline, camera and the progressive renderer

pub mod camera;
pub mod pipeline;
pub mod renderer;
pub mod scene_parameters;
pub mod vulkan;

pub use camera::{Camera, CameraMatrices};
pub use renderer::{RenderSession, Renderer};
