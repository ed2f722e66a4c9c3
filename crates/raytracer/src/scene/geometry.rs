//! Scene geometry and its device-local upload
//!
//! Geometry is uploaded once when the renderer is built and never changes
//! afterwards.

use ash::vk;

use super::importer::ImportError;
use super::mesh::Mesh;
use super::primitives::{Sphere, Triangle};
use crate::render::vulkan::{Buffer, VulkanContext, VulkanResult};

/// Host-side triangle and sphere lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneGeometry {
    /// Triangle records
    pub triangles: Vec<Triangle>,
    /// Sphere records
    pub spheres: Vec<Sphere>,
}

impl SceneGeometry {
    /// Create geometry from prepared records
    pub fn new(triangles: Vec<Triangle>, spheres: Vec<Sphere>) -> Self {
        Self { triangles, spheres }
    }

    /// Flatten meshes into triangles alongside the given spheres
    pub fn from_meshes(meshes: &[Mesh], spheres: Vec<Sphere>) -> Result<Self, ImportError> {
        let mut triangles = Vec::with_capacity(meshes.iter().map(Mesh::triangle_count).sum());
        for mesh in meshes {
            triangles.extend(mesh.to_triangles()?);
        }
        Ok(Self { triangles, spheres })
    }

    /// Triangle bytes for upload
    ///
    /// An empty list yields one zeroed record so the storage buffer is never
    /// zero-sized. A zeroed triangle is degenerate and never hit.
    pub fn triangle_bytes(&self) -> Vec<u8> {
        records_or_placeholder(&self.triangles)
    }

    /// Sphere bytes for upload
    ///
    /// An empty list yields one zero-radius record, which the kernel skips.
    pub fn sphere_bytes(&self) -> Vec<u8> {
        records_or_placeholder(&self.spheres)
    }
}

fn records_or_placeholder<T: bytemuck::Pod>(records: &[T]) -> Vec<u8> {
    if records.is_empty() {
        bytemuck::bytes_of(&<T as bytemuck::Zeroable>::zeroed()).to_vec()
    } else {
        bytemuck::cast_slice(records).to_vec()
    }
}

/// Device-local storage buffers holding the scene
pub struct GeometryBuffers<'ctx> {
    triangles: Buffer<'ctx>,
    spheres: Buffer<'ctx>,
    triangle_count: usize,
    sphere_count: usize,
}

impl<'ctx> GeometryBuffers<'ctx> {
    /// Upload both lists through staging buffers
    pub fn upload(context: &'ctx VulkanContext, geometry: &SceneGeometry) -> VulkanResult<Self> {
        let triangles = device_local_with(context, &geometry.triangle_bytes())?;
        let spheres = device_local_with(context, &geometry.sphere_bytes())?;

        log::info!(
            "Uploaded {} triangles and {} spheres",
            geometry.triangles.len(),
            geometry.spheres.len()
        );

        Ok(Self {
            triangles,
            spheres,
            triangle_count: geometry.triangles.len(),
            sphere_count: geometry.spheres.len(),
        })
    }

    /// Triangle storage buffer
    pub const fn triangles(&self) -> &Buffer<'ctx> {
        &self.triangles
    }

    /// Sphere storage buffer
    pub const fn spheres(&self) -> &Buffer<'ctx> {
        &self.spheres
    }

    /// Number of real triangles, excluding any placeholder
    pub const fn triangle_count(&self) -> usize {
        self.triangle_count
    }

    /// Number of real spheres, excluding any placeholder
    pub const fn sphere_count(&self) -> usize {
        self.sphere_count
    }
}

fn device_local_with<'ctx>(context: &'ctx VulkanContext, data: &[u8]) -> VulkanResult<Buffer<'ctx>> {
    let buffer = Buffer::new(
        context,
        data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    buffer.create_staging_and_upload(data)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::primitives::Vertex;

    #[test]
    fn test_empty_lists_upload_one_placeholder() {
        let geometry = SceneGeometry::default();
        assert_eq!(geometry.triangle_bytes().len(), 112);
        assert_eq!(geometry.sphere_bytes().len(), 16);
        assert!(geometry.sphere_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bytes_cover_every_record() {
        let geometry = SceneGeometry::new(
            vec![Triangle::new([0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]); 3],
            vec![Sphere::new([0.0, 0.0, 5.0], 1.0), Sphere::new([2.0, 0.0, 5.0], 0.5)],
        );
        assert_eq!(geometry.triangle_bytes().len(), 3 * 112);
        assert_eq!(geometry.sphere_bytes().len(), 2 * 16);
    }

    #[test]
    fn test_from_meshes_concatenates() {
        let vertex = |x: f32| Vertex {
            position: [x, 0.0, 0.0],
            ..Vertex::default()
        };
        let mesh = Mesh::new(vec![vertex(0.0), vertex(1.0), vertex(2.0)], vec![0, 1, 2], false);

        let geometry = SceneGeometry::from_meshes(&[mesh.clone(), mesh], Vec::new()).unwrap();
        assert_eq!(geometry.triangles.len(), 2);
        assert_eq!(geometry.triangles[1].v2, [2.0, 0.0, 0.0, 0.0]);
        assert!(geometry.spheres.is_empty());
    }
}
