//! Indexed triangle meshes

use super::importer::ImportError;
use super::primitives::{Triangle, Vertex};

/// Indexed triangle list
///
/// Every consecutive group of three indices names one triangle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Optional object or group name from the source file
    pub name: Option<String>,
    /// Vertex data
    pub vertices: Vec<Vertex>,
    /// Triangle indices into `vertices`
    pub indices: Vec<u32>,
    /// Whether every vertex carries an authored normal
    pub has_normals: bool,
}

impl Mesh {
    /// Create a mesh from vertices and indices
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>, has_normals: bool) -> Self {
        Self {
            name: None,
            vertices,
            indices,
            has_normals,
        }
    }

    /// Number of complete triangles
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Whether the mesh has no triangles
    pub fn is_empty(&self) -> bool {
        self.triangle_count() == 0
    }

    /// Expand the index list into kernel triangle records
    ///
    /// A trailing group of fewer than three indices is ignored. An index past
    /// the end of the vertex list is an error.
    pub fn to_triangles(&self) -> Result<Vec<Triangle>, ImportError> {
        let vertex = |index: u32| {
            self.vertices.get(index as usize).ok_or_else(|| {
                ImportError::InvalidFormat(format!(
                    "index {} out of range for {} vertices",
                    index,
                    self.vertices.len()
                ))
            })
        };

        self.indices
            .chunks_exact(3)
            .map(|corners| {
                let a = vertex(corners[0])?;
                let b = vertex(corners[1])?;
                let c = vertex(corners[2])?;
                Ok(if self.has_normals {
                    Triangle::with_normals(a.position, b.position, c.position, a.normal, b.normal, c.normal)
                } else {
                    Triangle::new(a.position, b.position, c.position)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(position: [f32; 3]) -> Vertex {
        Vertex {
            position,
            normal: [0.0, 0.0, 1.0],
            tex_coord: [0.0, 0.0],
        }
    }

    fn quad(has_normals: bool) -> Mesh {
        Mesh::new(
            vec![
                vertex([0.0, 0.0, 0.0]),
                vertex([1.0, 0.0, 0.0]),
                vertex([1.0, 1.0, 0.0]),
                vertex([0.0, 1.0, 0.0]),
            ],
            vec![0, 1, 2, 0, 2, 3],
            has_normals,
        )
    }

    #[test]
    fn test_quad_expands_to_two_triangles() {
        let triangles = quad(true).to_triangles().unwrap();
        assert_eq!(triangles.len(), 2);
        assert_eq!(triangles[1].v2, [0.0, 1.0, 0.0, 0.0]);
        assert_eq!(triangles[0].n1, [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(triangles[0].has_normals, 1);
    }

    #[test]
    fn test_missing_normals_are_not_uploaded() {
        let triangles = quad(false).to_triangles().unwrap();
        assert!(triangles.iter().all(|t| t.has_normals == 0 && t.n0 == [0.0; 4]));
    }

    #[test]
    fn test_trailing_partial_group_is_ignored() {
        let mut mesh = quad(false);
        mesh.indices.extend([1, 2]);
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.to_triangles().unwrap().len(), 2);
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let mut mesh = quad(false);
        mesh.indices[4] = 9;
        assert!(matches!(mesh.to_triangles(), Err(ImportError::InvalidFormat(_))));
    }

    #[test]
    fn test_empty_mesh() {
        let mesh = Mesh::default();
        assert!(mesh.is_empty());
        assert!(mesh.to_triangles().unwrap().is_empty());
    }
}
