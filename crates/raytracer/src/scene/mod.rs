//! Scene geometry
//!
//! Records the kernel consumes (triangles and spheres), indexed meshes as
//! importers produce them, and the one-time upload of both to device-local
//! storage buffers.

pub mod geometry;
pub mod importer;
pub mod mesh;
pub mod primitives;

pub use geometry::{GeometryBuffers, SceneGeometry};
pub use importer::{ImportError, MeshImporter, ObjImporter};
pub use mesh::Mesh;
pub use primitives::{Sphere, Triangle, Vertex};
