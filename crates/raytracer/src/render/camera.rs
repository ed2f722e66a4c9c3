//! # Perspective Camera
//!
//! Produces the four matrices the kernel needs to turn a pixel into a world
//! space ray. Orientation is a position plus Euler angles in degrees; the
//! camera looks down its local +Z axis with +Y up.

use crate::foundation::math::{utils, Mat4, Mat4Ext, Vec3};

/// Per-frame camera input to [`crate::render::renderer::Renderer::render`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMatrices {
    /// View space to clip space
    pub projection: Mat4,
    /// Clip space to view space
    pub inverse_projection: Mat4,
    /// World space to view space
    pub view: Mat4,
    /// View space to world space
    pub inverse_view: Mat4,
}

impl Default for CameraMatrices {
    fn default() -> Self {
        Self {
            projection: Mat4::identity(),
            inverse_projection: Mat4::identity(),
            view: Mat4::identity(),
            inverse_view: Mat4::identity(),
        }
    }
}

/// 3D perspective camera
///
/// Matrices are computed on demand from the current position, rotation and
/// viewport, so mutating the public fields takes effect on the next call to
/// [`Camera::matrices`].
#[derive(Debug, Clone)]
pub struct Camera {
    /// Camera position in world space
    pub position: Vec3,

    /// Euler rotation in degrees: pitch about X, yaw about Y, roll about Z
    pub rotation: Vec3,

    vertical_fov: f32,
    near: f32,
    far: f32,
    viewport_width: u32,
    viewport_height: u32,
}

impl Camera {
    /// Create a camera at the origin looking down +Z
    ///
    /// The viewport starts at 1x1; call [`Camera::resize`] with the render size.
    pub fn new(vertical_fov_degrees: f32, near: f32, far: f32) -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Vec3::zeros(),
            vertical_fov: utils::deg_to_rad(vertical_fov_degrees),
            near,
            far,
            viewport_width: 1,
            viewport_height: 1,
        }
    }

    /// Update the viewport used for the aspect ratio
    ///
    /// Zero-sized viewports are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            log::debug!("Ignoring camera resize to {}x{}", width, height);
            return;
        }
        self.viewport_width = width;
        self.viewport_height = height;
    }

    /// Width over height of the viewport
    pub fn aspect_ratio(&self) -> f32 {
        self.viewport_width as f32 / self.viewport_height as f32
    }

    /// Unit vector the camera looks along
    pub fn forward(&self) -> Vec3 {
        utils::rotation_from_degrees(self.rotation) * Vec3::z()
    }

    /// Unit vector pointing up in camera space
    pub fn up(&self) -> Vec3 {
        utils::rotation_from_degrees(self.rotation) * Vec3::y()
    }

    /// Perspective projection for the current viewport
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective(self.vertical_fov, self.aspect_ratio(), self.near, self.far)
    }

    /// World to view transform
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.position, self.position + self.forward(), self.up())
    }

    /// All four matrices for the kernel
    pub fn matrices(&self) -> CameraMatrices {
        let projection = self.projection_matrix();
        let view = self.view_matrix();

        CameraMatrices {
            projection,
            inverse_projection: projection.try_inverse().unwrap_or_else(Mat4::identity),
            view,
            inverse_view: view.try_inverse().unwrap_or_else(Mat4::identity),
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(45.0, 0.1, 100.0)
    }
}
