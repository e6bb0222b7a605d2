//! Triangle meshes: BrainNet `.nv` templates and stimulation balls

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{FcError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceMesh {
    /// World coordinates in mm
    pub vertices: Vec<[f64; 3]>,
    /// 0-based vertex indices
    pub faces: Vec<[usize; 3]>,
}

/// Hemisphere of the ICBM152 template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    Left,
    Right,
    Both,
}

impl FromStr for Hemisphere {
    type Err = FcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(Hemisphere::Left),
            "right" | "r" => Ok(Hemisphere::Right),
            "both" => Ok(Hemisphere::Both),
            other => Err(FcError::Config(format!("unknown hemisphere '{}'", other))),
        }
    }
}

/// File name of the BrainNet ICBM152 mesh
pub fn icbm_mesh_name(hemi: Hemisphere, smoothed: bool) -> String {
    let side = match hemi {
        Hemisphere::Left => "Left",
        Hemisphere::Right => "Right",
        Hemisphere::Both => "",
    };
    let smooth = if smoothed { "_smoothed" } else { "" };
    format!("BrainMesh_ICBM152{}{}.nv", side, smooth)
}

fn parse_numbers<T: FromStr>(line: &str, n: usize, what: &str) -> Result<Vec<T>> {
    let values: Vec<T> = line
        .split_whitespace()
        .map(|t| t.parse::<T>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| FcError::Shape(format!("invalid {} line '{}'", what, line)))?;
    if values.len() != n {
        return Err(FcError::Shape(format!("{} line '{}' has {} values, expected {}", what, line, values.len(), n)));
    }
    Ok(values)
}

/// Parse BrainNet Viewer `.nv` text: vertex count, vertex rows, face count,
/// then 1-based face rows
pub fn parse_nv(text: &str) -> Result<SurfaceMesh> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let n_vertices: usize = lines
        .next()
        .ok_or_else(|| FcError::Shape("missing vertex count".to_string()))?
        .parse()
        .map_err(|_| FcError::Shape("invalid vertex count".to_string()))?;
    let mut vertices = Vec::with_capacity(n_vertices);
    for _ in 0..n_vertices {
        let line = lines
            .next()
            .ok_or_else(|| FcError::Shape(format!("expected {} vertices, found {}", n_vertices, vertices.len())))?;
        let v = parse_numbers::<f64>(line, 3, "vertex")?;
        vertices.push([v[0], v[1], v[2]]);
    }

    let n_faces: usize = lines
        .next()
        .ok_or_else(|| FcError::Shape("missing face count".to_string()))?
        .parse()
        .map_err(|_| FcError::Shape("invalid face count".to_string()))?;
    let mut faces = Vec::with_capacity(n_faces);
    for _ in 0..n_faces {
        let line = lines
            .next()
            .ok_or_else(|| FcError::Shape(format!("expected {} faces, found {}", n_faces, faces.len())))?;
        let f = parse_numbers::<usize>(line, 3, "face")?;
        if f.iter().any(|&i| i == 0 || i > n_vertices) {
            return Err(FcError::Shape(format!("face '{}' references a missing vertex", line)));
        }
        faces.push([f[0] - 1, f[1] - 1, f[2] - 1]);
    }
    Ok(SurfaceMesh { vertices, faces })
}

pub fn read_nv(path: &Path) -> Result<SurfaceMesh> {
    if !path.exists() {
        return Err(FcError::MissingInput(path.to_path_buf()));
    }
    parse_nv(&fs::read_to_string(path)?)
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub(crate) fn normalize(v: [f64; 3]) -> [f64; 3] {
    let norm = dot(v, v).sqrt();
    if norm > 1e-10 {
        [v[0] / norm, v[1] / norm, v[2] / norm]
    } else {
        [0.0, 0.0, 0.0]
    }
}

impl SurfaceMesh {
    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Unit normal of a face, following the vertex winding
    pub fn face_normal(&self, face: usize) -> [f64; 3] {
        let [i0, i1, i2] = self.faces[face];
        let v0 = self.vertices[i0];
        normalize(cross(sub(self.vertices[i1], v0), sub(self.vertices[i2], v0)))
    }

    /// Area-independent average of the adjacent face normals
    pub fn vertex_normals(&self) -> Vec<[f64; 3]> {
        let mut normals = vec![[0.0; 3]; self.vertices.len()];
        for f in 0..self.faces.len() {
            let n = self.face_normal(f);
            for &idx in &self.faces[f] {
                for d in 0..3 {
                    normals[idx][d] += n[d];
                }
            }
        }
        normals.into_iter().map(normalize).collect()
    }

    pub fn centroid(&self) -> [f64; 3] {
        let n = self.vertices.len().max(1) as f64;
        let mut c = [0.0; 3];
        for v in &self.vertices {
            for d in 0..3 {
                c[d] += v[d] / n;
            }
        }
        c
    }

    /// Icosphere of `radius` mm around `center`, subdivided `level` times
    pub fn sphere(center: [f64; 3], radius: f64, level: usize) -> Self {
        let t = (1.0 + 5f64.sqrt()) / 2.0;
        let mut vertices: Vec<[f64; 3]> = [
            [-1.0, t, 0.0],
            [1.0, t, 0.0],
            [-1.0, -t, 0.0],
            [1.0, -t, 0.0],
            [0.0, -1.0, t],
            [0.0, 1.0, t],
            [0.0, -1.0, -t],
            [0.0, 1.0, -t],
            [t, 0.0, -1.0],
            [t, 0.0, 1.0],
            [-t, 0.0, -1.0],
            [-t, 0.0, 1.0],
        ]
        .into_iter()
        .map(normalize)
        .collect();
        let mut faces: Vec<[usize; 3]> = vec![
            [0, 11, 5], [0, 5, 1], [0, 1, 7], [0, 7, 10], [0, 10, 11],
            [1, 5, 9], [5, 11, 4], [11, 10, 2], [10, 7, 6], [7, 1, 8],
            [3, 9, 4], [3, 4, 2], [3, 2, 6], [3, 6, 8], [3, 8, 9],
            [4, 9, 5], [2, 4, 11], [6, 2, 10], [8, 6, 7], [9, 8, 1],
        ];

        for _ in 0..level {
            let mut midpoints: HashMap<(usize, usize), usize> = HashMap::new();
            let mut midpoint = |a: usize, b: usize, vertices: &mut Vec<[f64; 3]>| -> usize {
                let key = (a.min(b), a.max(b));
                *midpoints.entry(key).or_insert_with(|| {
                    let (va, vb) = (vertices[a], vertices[b]);
                    vertices.push(normalize([
                        (va[0] + vb[0]) / 2.0,
                        (va[1] + vb[1]) / 2.0,
                        (va[2] + vb[2]) / 2.0,
                    ]));
                    vertices.len() - 1
                })
            };
            let mut next = Vec::with_capacity(faces.len() * 4);
            for &[a, b, c] in &faces {
                let ab = midpoint(a, b, &mut vertices);
                let bc = midpoint(b, c, &mut vertices);
                let ca = midpoint(c, a, &mut vertices);
                next.extend([[a, ab, ca], [b, bc, ab], [c, ca, bc], [ab, bc, ca]]);
            }
            faces = next;
        }

        let vertices = vertices
            .into_iter()
            .map(|v| [center[0] + radius * v[0], center[1] + radius * v[1], center[2] + radius * v[2]])
            .collect();
        Self { vertices, faces }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TETRA: &str = "4\n0 0 0\n1 0 0\n0 1 0\n0 0 1\n4\n1 3 2\n1 2 4\n1 4 3\n2 3 4\n";

    #[test]
    fn test_parse_nv() {
        let mesh = parse_nv(TETRA).unwrap();
        assert_eq!(mesh.n_vertices(), 4);
        assert_eq!(mesh.faces.len(), 4);
        assert_eq!(mesh.faces[0], [0, 2, 1]);
        assert_eq!(mesh.vertices[3], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_parse_nv_rejects_bad_faces() {
        assert!(parse_nv("3\n0 0 0\n1 0 0\n0 1 0\n1\n1 2 4\n").is_err());
        assert!(parse_nv("3\n0 0 0\n1 0 0\n").is_err());
        assert!(parse_nv("2\n0 0\n1 0 0\n0\n").is_err());
    }

    #[test]
    fn test_icbm_mesh_name() {
        assert_eq!(icbm_mesh_name(Hemisphere::Right, false), "BrainMesh_ICBM152Right.nv");
        assert_eq!(icbm_mesh_name(Hemisphere::Both, true), "BrainMesh_ICBM152_smoothed.nv");
        assert_eq!("l".parse::<Hemisphere>().unwrap(), Hemisphere::Left);
    }

    #[test]
    fn test_sphere_geometry() {
        let s = SurfaceMesh::sphere([10.0, -5.0, 2.0], 2.0, 2);
        assert_eq!(s.faces.len(), 20 * 16);
        assert_eq!(s.n_vertices(), 162);
        for v in &s.vertices {
            let r = dot(sub(*v, [10.0, -5.0, 2.0]), sub(*v, [10.0, -5.0, 2.0])).sqrt();
            assert!((r - 2.0).abs() < 1e-9);
        }
        let c = s.centroid();
        assert!((c[0] - 10.0).abs() < 1e-9 && (c[1] + 5.0).abs() < 1e-9 && (c[2] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_vertex_normals_point_outward() {
        let s = SurfaceMesh::sphere([0.0; 3], 1.0, 1);
        for (v, n) in s.vertices.iter().zip(s.vertex_normals()) {
            assert!((dot(n, n).sqrt() - 1.0).abs() < 1e-9);
            assert!(dot(*v, n) > 0.9);
        }
    }
}
