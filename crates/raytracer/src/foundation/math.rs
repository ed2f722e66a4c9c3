//! Math utilities and types
//!
//! Column-major `nalgebra` types shared by the camera and the GPU records.

pub use nalgebra::{Matrix4, Unit, UnitQuaternion, Vector3};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Quaternion type for rotations
pub type Quat = UnitQuaternion<f32>;

/// Math utility functions
pub mod utils {
    /// Convert degrees to radians
    pub fn deg_to_rad(degrees: f32) -> f32 {
        degrees.to_radians()
    }

    /// Rotation built from Euler angles in degrees (pitch about X, yaw about Y, roll about Z)
    ///
    /// Roll is applied first, then pitch, then yaw.
    pub fn rotation_from_degrees(rotation: super::Vec3) -> super::Quat {
        let radians = rotation.map(deg_to_rad);
        super::Quat::from_axis_angle(&super::Vec3::y_axis(), radians.y)
            * super::Quat::from_axis_angle(&super::Vec3::x_axis(), radians.x)
            * super::Quat::from_axis_angle(&super::Vec3::z_axis(), radians.z)
    }
}

/// Extension trait for Mat4 with projection helpers
pub trait Mat4Ext {
    /// Create a right-handed perspective projection with depth mapped to [0, 1]
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4;

    /// Create a right-handed look-at view matrix
    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4;

    /// Column-major float arrays in the layout GLSL expects for `mat4`
    fn to_cols_array(&self) -> [[f32; 4]; 4];
}

impl Mat4Ext for Mat4 {
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        // P = [1/(a*tan(φ/2))   0            0            0          ]
        //     [0                1/tan(φ/2)   0            0          ]
        //     [0                0            f/(n-f)      nf/(n-f)   ]
        //     [0                0            -1           0          ]
        let tan_half_fovy = (fov_y * 0.5).tan();

        let mut result = Mat4::zeros();
        result[(0, 0)] = 1.0 / (aspect * tan_half_fovy);
        result[(1, 1)] = 1.0 / tan_half_fovy;
        result[(2, 2)] = far / (near - far);
        result[(2, 3)] = (near * far) / (near - far);
        result[(3, 2)] = -1.0;
        result
    }

    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
        let forward = (target - eye).normalize();
        let right = forward.cross(&up).normalize();
        let camera_up = right.cross(&forward);

        let translation = Mat4::new(
            1.0, 0.0, 0.0, -eye.x,
            0.0, 1.0, 0.0, -eye.y,
            0.0, 0.0, 1.0, -eye.z,
            0.0, 0.0, 0.0, 1.0,
        );

        let rotation = Mat4::new(
            right.x, right.y, right.z, 0.0,
            camera_up.x, camera_up.y, camera_up.z, 0.0,
            -forward.x, -forward.y, -forward.z, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        rotation * translation
    }

    fn to_cols_array(&self) -> [[f32; 4]; 4] {
        (*self).into()
    }
}
