//! Orthographic rendering of textured surface meshes
//!
//! Faces are projected onto the camera plane, sorted far to near and
//! painted as flat polygons. Each face colour is the alpha blend of the
//! texture layers, starting from white, then shaded by the angle between
//! its normal and the view direction.

use std::str::FromStr;

use plotters::coord::Shift;
use plotters::prelude::*;

use crate::error::{FcError, Result};
use crate::plot::{Colormap, Figure};
use crate::surface::mesh::{cross, dot, normalize, SurfaceMesh};

/// Camera position relative to the mesh centroid; only its direction matters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: [f64; 3],
}

impl Camera {
    pub const FRONT: Camera = Camera { position: [-3.0, 2.0, -1.0] };
    pub const MEDIAL: Camera = Camera { position: [1.0, 1.0, -0.3] };

    /// (screen right, screen up, towards the camera)
    pub fn basis(&self) -> ([f64; 3], [f64; 3], [f64; 3]) {
        let toward = normalize(self.position);
        let world_up = if dot(toward, [0.0, 0.0, 1.0]).abs() > 0.99 { [0.0, 1.0, 0.0] } else { [0.0, 0.0, 1.0] };
        let right = normalize(cross(world_up, toward));
        let up = cross(toward, right);
        (right, up, toward)
    }
}

impl FromStr for Camera {
    type Err = FcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "front" => Ok(Camera::FRONT),
            "medial" => Ok(Camera::MEDIAL),
            other => Err(FcError::Config(format!("unknown camera preset '{}'", other))),
        }
    }
}

/// Per-vertex texture drawn with a colour map
#[derive(Debug, Clone, PartialEq)]
pub struct TextureLayer {
    pub name: String,
    pub values: Vec<f64>,
    pub cmap: Colormap,
    pub clim: [f64; 2],
    pub opacity: f64,
    /// Opacity of white where the texture is NaN
    pub nan_opacity: f64,
}

fn blend(base: [f64; 3], top: RGBColor, alpha: f64) -> [f64; 3] {
    let a = alpha.clamp(0.0, 1.0);
    let top = [top.0 as f64, top.1 as f64, top.2 as f64];
    [
        base[0] * (1.0 - a) + top[0] * a,
        base[1] * (1.0 - a) + top[1] * a,
        base[2] * (1.0 - a) + top[2] * a,
    ]
}

/// Unshaded colour of a face from the textures of its vertices
pub fn face_color(layers: &[TextureLayer], face: [usize; 3]) -> [f64; 3] {
    let mut color = [255.0; 3];
    for layer in layers {
        let v = face.iter().map(|&i| layer.values.get(i).copied().unwrap_or(f64::NAN)).sum::<f64>() / 3.0;
        color = if v.is_finite() {
            blend(color, layer.cmap.map_range(v, layer.clim[0], layer.clim[1]), layer.opacity)
        } else {
            blend(color, WHITE, layer.nan_opacity)
        };
    }
    color
}

fn shade(color: [f64; 3], normal: [f64; 3], toward: [f64; 3]) -> RGBColor {
    let k = 0.35 + 0.65 * dot(normal, toward).abs();
    let c = |v: f64| (v * k).round().clamp(0.0, 255.0) as u8;
    RGBColor(c(color[0]), c(color[1]), c(color[2]))
}

/// A face in camera coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedFace {
    pub points: [(f64, f64); 3],
    /// Larger is closer to the camera
    pub depth: f64,
    pub color: RGBColor,
}

fn project_mesh(
    mesh: &SurfaceMesh,
    colors: impl Fn(usize) -> [f64; 3],
    camera: &Camera,
    origin: [f64; 3],
    out: &mut Vec<ProjectedFace>,
) {
    let (right, up, toward) = camera.basis();
    let project = |p: [f64; 3]| {
        let d = [p[0] - origin[0], p[1] - origin[1], p[2] - origin[2]];
        ((dot(d, right), dot(d, up)), dot(d, toward))
    };
    for (f, &face) in mesh.faces.iter().enumerate() {
        let mut points = [(0.0, 0.0); 3];
        let mut depth = 0.0;
        for (slot, &idx) in points.iter_mut().zip(&face) {
            let (xy, z) = project(mesh.vertices[idx]);
            *slot = xy;
            depth += z / 3.0;
        }
        out.push(ProjectedFace { points, depth, color: shade(colors(f), mesh.face_normal(f), toward) });
    }
}

/// Surface with textures and coloured balls seen from one camera
#[derive(Debug, Clone)]
pub struct SurfaceFigure {
    pub mesh: SurfaceMesh,
    pub layers: Vec<TextureLayer>,
    pub balls: Vec<(SurfaceMesh, RGBColor)>,
    pub camera: Camera,
    pub size: (u32, u32),
}

impl SurfaceFigure {
    pub fn new(mesh: SurfaceMesh, layers: Vec<TextureLayer>, camera: Camera) -> Self {
        Self { mesh, layers, balls: Vec::new(), camera, size: (800, 600) }
    }

    /// All faces, far to near
    pub fn projected_faces(&self) -> Vec<ProjectedFace> {
        let origin = self.mesh.centroid();
        let mut faces = Vec::with_capacity(self.mesh.faces.len());
        project_mesh(&self.mesh, |f| face_color(&self.layers, self.mesh.faces[f]), &self.camera, origin, &mut faces);
        for (ball, color) in &self.balls {
            let c = [color.0 as f64, color.1 as f64, color.2 as f64];
            project_mesh(ball, |_| c, &self.camera, origin, &mut faces);
        }
        faces.sort_by(|a, b| a.depth.total_cmp(&b.depth));
        faces
    }
}

impl Figure for SurfaceFigure {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn draw<DB: DrawingBackend>(&self, root: &DrawingArea<DB, Shift>) -> Result<()> {
        let faces = self.projected_faces();
        if faces.is_empty() {
            return Ok(());
        }
        let (mut x0, mut x1, mut y0, mut y1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for p in faces.iter().flat_map(|f| f.points.iter()) {
            x0 = x0.min(p.0);
            x1 = x1.max(p.0);
            y0 = y0.min(p.1);
            y1 = y1.max(p.1);
        }
        let (w, h) = root.dim_in_pixel();
        let margin = 10.0;
        let scale = ((w as f64 - 2.0 * margin) / (x1 - x0).max(1e-9)).min((h as f64 - 2.0 * margin) / (y1 - y0).max(1e-9));
        let cx = (w as f64 - scale * (x1 - x0)) / 2.0;
        let cy = (h as f64 - scale * (y1 - y0)) / 2.0;
        let to_px = |p: (f64, f64)| ((cx + (p.0 - x0) * scale).round() as i32, (h as f64 - cy - (p.1 - y0) * scale).round() as i32);

        for face in &faces {
            let pts: Vec<(i32, i32)> = face.points.iter().map(|&p| to_px(p)).collect();
            root.draw(&Polygon::new(pts, face.color.filled())).map_err(FcError::plot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::save_figure;

    fn layer(values: Vec<f64>, opacity: f64, nan_opacity: f64) -> TextureLayer {
        TextureLayer {
            name: "t".to_string(),
            values,
            cmap: Colormap::Binary,
            clim: [0.0, 1.0],
            opacity,
            nan_opacity,
        }
    }

    #[test]
    fn test_camera_basis_is_orthonormal() {
        for cam in [Camera::FRONT, Camera::MEDIAL] {
            let (r, u, t) = cam.basis();
            assert!(dot(r, u).abs() < 1e-12 && dot(r, t).abs() < 1e-12 && dot(u, t).abs() < 1e-12);
            assert!((dot(r, r) - 1.0).abs() < 1e-12 && (dot(u, u) - 1.0).abs() < 1e-12);
        }
        assert_eq!("Medial".parse::<Camera>().unwrap(), Camera::MEDIAL);
        assert!("top".parse::<Camera>().is_err());
    }

    #[test]
    fn test_face_color_blending() {
        // binary: 1 is black
        let black = layer(vec![1.0; 3], 1.0, 0.0);
        assert_eq!(face_color(&[black.clone()], [0, 1, 2]), [0.0; 3]);
        let half = layer(vec![1.0; 3], 0.5, 0.0);
        assert_eq!(face_color(&[half], [0, 1, 2]), [127.5; 3]);
        // a NaN texture with zero nan opacity leaves the layer below visible
        let hidden = layer(vec![f64::NAN; 3], 1.0, 0.0);
        assert_eq!(face_color(&[black, hidden], [0, 1, 2]), [0.0; 3]);
    }

    #[test]
    fn test_faces_sorted_far_to_near() {
        let mesh = SurfaceMesh::sphere([0.0; 3], 10.0, 1);
        let fig = SurfaceFigure::new(mesh, vec![], Camera::FRONT);
        let faces = fig.projected_faces();
        assert_eq!(faces.len(), 80);
        assert!(faces.windows(2).all(|w| w[0].depth <= w[1].depth));
        // the nearest face looks roughly at the camera
        assert!(faces[faces.len() - 1].color.0 > 200);
        assert!(faces[0].depth < 0.0);
    }

    #[test]
    fn test_render_svg() {
        let dir = tempfile::tempdir().unwrap();
        let mut fig = SurfaceFigure::new(SurfaceMesh::sphere([0.0; 3], 50.0, 2), vec![], Camera::MEDIAL);
        fig.balls.push((SurfaceMesh::sphere([0.0, -55.0, 0.0], 2.0, 1), RGBColor(255, 165, 0)));
        fig.size = (200, 150);
        let path = dir.path().join("surface.svg");
        save_figure(&fig, &path).unwrap();
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("polygon"));
    }
}
