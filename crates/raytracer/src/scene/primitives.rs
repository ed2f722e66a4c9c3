//! GPU-visible primitive records
//!
//! Layouts match the std430 `Triangle` and `Sphere` structs in the kernel.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Mesh vertex as produced by an importer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vertex {
    /// Position in model space
    pub position: [f32; 3],
    /// Unit normal, zero when the source has none
    pub normal: [f32; 3],
    /// Texture coordinate
    pub tex_coord: [f32; 2],
}

/// Triangle record, 112 bytes
///
/// Each position and normal occupies a 16-byte slot (`vec4` in the kernel,
/// `w` unused). `has_normals` sits at byte 96.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Triangle {
    /// First corner
    pub v0: [f32; 4],
    /// Second corner
    pub v1: [f32; 4],
    /// Third corner
    pub v2: [f32; 4],
    /// Normal at `v0`
    pub n0: [f32; 4],
    /// Normal at `v1`
    pub n1: [f32; 4],
    /// Normal at `v2`
    pub n2: [f32; 4],
    /// Non-zero when the normals are meaningful
    pub has_normals: u32,
    padding: [u32; 3],
}

const fn slot(v: [f32; 3]) -> [f32; 4] {
    [v[0], v[1], v[2], 0.0]
}

impl Triangle {
    /// Triangle without normals; the kernel derives a face normal
    pub const fn new(v0: [f32; 3], v1: [f32; 3], v2: [f32; 3]) -> Self {
        Self {
            v0: slot(v0),
            v1: slot(v1),
            v2: slot(v2),
            n0: [0.0; 4],
            n1: [0.0; 4],
            n2: [0.0; 4],
            has_normals: 0,
            padding: [0; 3],
        }
    }

    /// Triangle with per-vertex normals
    pub const fn with_normals(
        v0: [f32; 3],
        v1: [f32; 3],
        v2: [f32; 3],
        n0: [f32; 3],
        n1: [f32; 3],
        n2: [f32; 3],
    ) -> Self {
        Self {
            n0: slot(n0),
            n1: slot(n1),
            n2: slot(n2),
            has_normals: 1,
            ..Self::new(v0, v1, v2)
        }
    }
}

/// Sphere record, 16 bytes: center then radius
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Sphere {
    /// Center in world space
    pub center: [f32; 3],
    /// Radius; zero or negative spheres are never hit
    pub radius: f32,
}

impl Sphere {
    /// Create a sphere
    pub const fn new(center: [f32; 3], radius: f32) -> Self {
        Self { center, radius }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<Triangle>(), 112);
        assert_eq!(std::mem::size_of::<Sphere>(), 16);
    }

    #[test]
    fn test_triangle_slots() {
        let triangle = Triangle::with_normals(
            [1.0, 2.0, 3.0],
            [4.0, 5.0, 6.0],
            [7.0, 8.0, 9.0],
            [0.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        );
        let bytes = bytemuck::bytes_of(&triangle);
        let float_at = |offset: usize| f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());

        assert_eq!(float_at(16), 4.0);
        assert_eq!(float_at(32 + 8), 9.0);
        assert_eq!(float_at(80 + 8), 1.0);
        assert_eq!(u32::from_ne_bytes(bytes[96..100].try_into().unwrap()), 1);
    }

    #[test]
    fn test_triangle_without_normals_flags_zero() {
        let triangle = Triangle::new([0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        assert_eq!(triangle.has_normals, 0);
        assert_eq!(triangle.n0, [0.0; 4]);
    }

    #[test]
    fn test_sphere_layout() {
        let sphere = Sphere::new([1.0, 2.0, 3.0], 0.5);
        let bytes = bytemuck::bytes_of(&sphere);
        assert_eq!(f32::from_ne_bytes(bytes[12..16].try_into().unwrap()), 0.5);
    }
}
