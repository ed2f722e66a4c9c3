//! Mesh importers
//!
//! [`MeshImporter`] is the seam between file formats and the scene. The only
//! format shipped is Wavefront OBJ.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

use super::mesh::Mesh;
use super::primitives::Vertex;

/// Mesh import errors
#[derive(Error, Debug)]
pub enum ImportError {
    /// Reading the source failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A line could not be parsed
    #[error("Parse error on line {line}: {message}")]
    Parse {
        /// One-based line number
        line: usize,
        /// What was wrong with it
        message: String,
    },
    /// The file parsed but does not describe usable geometry
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Loads meshes from a file
pub trait MeshImporter {
    /// Import every mesh in the file at `path`
    fn import(&self, path: &Path) -> Result<Vec<Mesh>, ImportError>;
}

/// Wavefront OBJ importer
///
/// Reads `v`, `vn`, `vt` and `f` records; `o` and `g` start a new mesh.
/// Polygons are fan-triangulated and indices may be negative (relative to the
/// end of the list so far). Materials and other records are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjImporter;

impl MeshImporter for ObjImporter {
    fn import(&self, path: &Path) -> Result<Vec<Mesh>, ImportError> {
        let file = File::open(path)?;
        let meshes = Self::parse(BufReader::new(file))?;
        log::info!(
            "Imported {} mesh(es) with {} triangles from {:?}",
            meshes.len(),
            meshes.iter().map(Mesh::triangle_count).sum::<usize>(),
            path
        );
        Ok(meshes)
    }
}

impl ObjImporter {
    /// Parse OBJ text from any buffered reader
    ///
    /// Meshes without faces are dropped; a source with no faces at all is an error.
    pub fn parse<R: BufRead>(reader: R) -> Result<Vec<Mesh>, ImportError> {
        let mut state = ObjState::default();

        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            state.line = number + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let Some(keyword) = parts.next() else {
                continue;
            };
            let args: Vec<&str> = parts.collect();

            match keyword {
                "v" => {
                    let position = state.floats::<3>(&args, "vertex")?;
                    state.positions.push(position);
                }
                "vn" => {
                    let normal = state.floats::<3>(&args, "normal")?;
                    state.normals.push(normal);
                }
                "vt" => {
                    let tex_coord = state.floats::<2>(&args, "texture coordinate")?;
                    state.tex_coords.push(tex_coord);
                }
                "f" => state.face(&args)?,
                "o" | "g" => state.start_mesh(args.first().map(|name| (*name).to_string())),
                _ => {}
            }
        }

        let meshes = state.finish();
        if meshes.is_empty() {
            return Err(ImportError::InvalidFormat("no faces found in OBJ source".to_string()));
        }
        Ok(meshes)
    }
}

/// Parser state: shared attribute pools plus the mesh being filled
#[derive(Default)]
struct ObjState {
    line: usize,
    positions: Vec<[f32; 3]>,
    normals: Vec<[f32; 3]>,
    tex_coords: Vec<[f32; 2]>,
    current: Mesh,
    current_missing_normals: bool,
    finished: Vec<Mesh>,
}

impl ObjState {
    fn error(&self, message: impl Into<String>) -> ImportError {
        ImportError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn floats<const N: usize>(&self, args: &[&str], what: &str) -> Result<[f32; N], ImportError> {
        if args.len() < N {
            return Err(self.error(format!("{} needs {} components, found {}", what, N, args.len())));
        }
        let mut out = [0.0; N];
        for (slot, text) in out.iter_mut().zip(args) {
            *slot = text
                .parse()
                .map_err(|_| self.error(format!("invalid {} component {:?}", what, text)))?;
        }
        Ok(out)
    }

    /// Resolve a one-based or negative OBJ index against a pool of `len` items
    fn resolve(&self, text: &str, len: usize, what: &str) -> Result<usize, ImportError> {
        let raw: i64 = text
            .parse()
            .map_err(|_| self.error(format!("invalid {} index {:?}", what, text)))?;
        let resolved = match raw {
            0 => None,
            n if n > 0 => usize::try_from(n - 1).ok(),
            n => usize::try_from(-n).ok().and_then(|back| len.checked_sub(back)),
        };
        resolved
            .filter(|&index| index < len)
            .ok_or_else(|| self.error(format!("{} index {} out of range for {} entries", what, raw, len)))
    }

    fn corner(&mut self, spec: &str) -> Result<u32, ImportError> {
        let mut fields = spec.split('/');
        let position = fields.next().unwrap_or_default();
        let tex_coord = fields.next().filter(|s| !s.is_empty());
        let normal = fields.next().filter(|s| !s.is_empty());

        let position = self.positions[self.resolve(position, self.positions.len(), "position")?];
        let tex_coord = match tex_coord {
            Some(text) => self.tex_coords[self.resolve(text, self.tex_coords.len(), "texture coordinate")?],
            None => [0.0, 0.0],
        };
        let normal = match normal {
            Some(text) => self.normals[self.resolve(text, self.normals.len(), "normal")?],
            None => {
                self.current_missing_normals = true;
                [0.0; 3]
            }
        };

        let index = u32::try_from(self.current.vertices.len())
            .map_err(|_| self.error("mesh exceeds u32 vertex indices"))?;
        self.current.vertices.push(Vertex {
            position,
            normal,
            tex_coord,
        });
        Ok(index)
    }

    fn face(&mut self, args: &[&str]) -> Result<(), ImportError> {
        if args.len() < 3 {
            return Err(self.error(format!("face needs at least 3 corners, found {}", args.len())));
        }

        let corners = args
            .iter()
            .map(|spec| self.corner(spec))
            .collect::<Result<Vec<_>, _>>()?;

        for pair in corners[1..].windows(2) {
            self.current.indices.extend([corners[0], pair[0], pair[1]]);
        }
        Ok(())
    }

    fn start_mesh(&mut self, name: Option<String>) {
        let previous = std::mem::take(&mut self.current);
        self.push_finished(previous);
        self.current.name = name;
    }

    fn push_finished(&mut self, mut mesh: Mesh) {
        if mesh.is_empty() {
            return;
        }
        mesh.has_normals = !self.current_missing_normals;
        self.current_missing_normals = false;
        self.finished.push(mesh);
    }

    fn finish(mut self) -> Vec<Mesh> {
        let last = std::mem::take(&mut self.current);
        self.push_finished(last);
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(source: &str) -> Result<Vec<Mesh>, ImportError> {
        ObjImporter::parse(Cursor::new(source))
    }

    #[test]
    fn test_single_triangle_with_normals() {
        let meshes = parse(
            "# triangle\n\
             v 0 0 0\nv 1 0 0\nv 0 1 0\n\
             vn 0 0 1\n\
             f 1//1 2//1 3//1\n",
        )
        .unwrap();

        assert_eq!(meshes.len(), 1);
        let mesh = &meshes[0];
        assert!(mesh.has_normals);
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.vertices[1].position, [1.0, 0.0, 0.0]);
        assert_eq!(mesh.vertices[2].normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_quad_is_fan_triangulated() {
        let meshes = parse("v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3 4\n").unwrap();
        assert_eq!(meshes[0].indices, vec![0, 1, 2, 0, 2, 3]);
        assert!(!meshes[0].has_normals);
    }

    #[test]
    fn test_negative_indices_are_relative() {
        let meshes = parse("v 0 0 0\nv 1 0 0\nv 0 1 0\nvt 0.5 0.25\nf -3/-1 -2/-1 -1/-1\n").unwrap();
        let mesh = &meshes[0];
        assert_eq!(mesh.vertices[0].position, [0.0, 0.0, 0.0]);
        assert_eq!(mesh.vertices[2].position, [0.0, 1.0, 0.0]);
        assert_eq!(mesh.vertices[1].tex_coord, [0.5, 0.25]);
    }

    #[test]
    fn test_objects_split_meshes() {
        let meshes = parse(
            "v 0 0 0\nv 1 0 0\nv 0 1 0\nv 0 0 1\n\
             o first\nf 1 2 3\n\
             o empty\n\
             g second\nf 1 3 4\nf 2 3 4\n",
        )
        .unwrap();

        assert_eq!(meshes.len(), 2);
        assert_eq!(meshes[0].name.as_deref(), Some("first"));
        assert_eq!(meshes[1].name.as_deref(), Some("second"));
        assert_eq!(meshes[1].triangle_count(), 2);
        assert_eq!(meshes[1].indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_partial_normals_disable_normals() {
        let meshes = parse("v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 1\nf 1//1 2 3//1\n").unwrap();
        assert!(!meshes[0].has_normals);
    }

    #[test]
    fn test_out_of_range_index_reports_line() {
        let err = parse("v 0 0 0\nv 1 0 0\nf 1 2 3\n").unwrap_err();
        assert!(matches!(err, ImportError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_bad_number_reports_line() {
        let err = parse("v 0 zero 0\n").unwrap_err();
        assert!(matches!(err, ImportError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_zero_index_is_rejected() {
        assert!(parse("v 0 0 0\nv 1 0 0\nv 0 1 0\nf 0 1 2\n").is_err());
    }

    #[test]
    fn test_no_faces_is_invalid() {
        let err = parse("v 0 0 0\nusemtl red\n").unwrap_err();
        assert!(matches!(err, ImportError::InvalidFormat(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ObjImporter.import(Path::new("does/not/exist.obj")).unwrap_err();
        assert!(matches!(err, ImportError::Io(_)));
    }
}
