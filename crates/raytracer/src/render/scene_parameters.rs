//! Uniform block read by the kernel every dispatch

use bytemuck::{Pod, Zeroable};

use super::camera::CameraMatrices;
use crate::foundation::math::Mat4Ext;

/// std140 `SceneParameters` block at binding 1
///
/// Four column-major `mat4`s followed by two `uint`s; 264 bytes with no
/// padding. Field order must match the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneParameters {
    /// Camera projection
    pub projection: [[f32; 4]; 4],
    /// Inverse camera projection
    pub inverse_projection: [[f32; 4]; 4],
    /// Camera view
    pub view: [[f32; 4]; 4],
    /// Inverse camera view
    pub inverse_view: [[f32; 4]; 4],
    /// Samples accumulated including this one, starting at 1
    pub frame_index: u32,
    /// Milliseconds since the renderer was created, wrapping
    pub time: u32,
}

impl SceneParameters {
    /// Pack camera matrices and frame counters
    pub fn new(camera: &CameraMatrices, frame_index: u32, time: u32) -> Self {
        Self {
            projection: camera.projection.to_cols_array(),
            inverse_projection: camera.inverse_projection.to_cols_array(),
            view: camera.view.to_cols_array(),
            inverse_view: camera.inverse_view.to_cols_array(),
            frame_index,
            time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Mat4, Vec3};

    #[test]
    fn test_block_size_matches_kernel() {
        assert_eq!(std::mem::size_of::<SceneParameters>(), 264);
    }

    #[test]
    fn test_field_offsets() {
        let mut matrices = CameraMatrices::default();
        matrices.view = Mat4::new_translation(&Vec3::new(7.0, 8.0, 9.0));
        let params = SceneParameters::new(&matrices, 0x0102_0304, 0xA0B0_C0D0);
        let bytes = bytemuck::bytes_of(&params);

        let float_at = |offset: usize| f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());
        let uint_at = |offset: usize| u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());

        // view is the third mat4; its translation column starts 48 bytes in
        assert_eq!(float_at(128 + 48), 7.0);
        assert_eq!(float_at(128 + 52), 8.0);
        assert_eq!(float_at(128 + 56), 9.0);
        assert_eq!(uint_at(256), 0x0102_0304);
        assert_eq!(uint_at(260), 0xA0B0_C0D0);
    }

    #[test]
    fn test_identity_projection_is_packed_column_major() {
        let params = SceneParameters::new(&CameraMatrices::default(), 1, 0);
        assert_eq!(params.projection[0], [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(params.projection[3], [0.0, 0.0, 0.0, 1.0]);
    }
}
