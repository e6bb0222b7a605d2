//! Cortical surface figures
//!
//! - `mesh`: BrainNet `.nv` meshes and icospheres
//! - `project`: volume to surface sampling
//! - `render`: orthographic SVG rendering of textured meshes
//! - `visuals`: the `visuals` subcommand stages

pub mod mesh;
pub mod project;
pub mod render;
pub mod visuals;

pub use mesh::{read_nv, Hemisphere, SurfaceMesh};
pub use project::vol_to_surf;
pub use render::{Camera, SurfaceFigure, TextureLayer};
pub use visuals::{run_visuals, VisualsOptions};
