//! Figures: stat-map slices, categorical charts and colour maps
//!
//! Every figure implements [`Figure`] and is written with [`save_figure`],
//! which picks a bitmap backend for `.png` paths and SVG otherwise.

pub mod charts;
pub mod colormap;
pub mod stat_map;

use std::fs;
use std::path::Path;

use log::info;
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::error::{FcError, Result};

pub use charts::{ChartGrid, ChartOptions, ChartPanel, Observation, PanelKind};
pub use colormap::{named_color, Colormap};
pub use stat_map::{find_cut_coords, plot_stat_map, StatMapFigure, StatMapOptions};

/// Something that can be drawn on a plotters drawing area
pub trait Figure {
    /// Canvas size in pixels
    fn size(&self) -> (u32, u32);

    fn draw<DB: DrawingBackend>(&self, root: &DrawingArea<DB, Shift>) -> Result<()>;
}

/// Render `fig` to `path`, creating the parent directory
pub fn save_figure<F: Figure>(fig: &F, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let size = fig.size();
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => {
            let root = BitMapBackend::new(path, size).into_drawing_area();
            root.fill(&WHITE).map_err(FcError::plot)?;
            fig.draw(&root)?;
            root.present().map_err(FcError::plot)?;
        }
        _ => {
            let root = SVGBackend::new(path, size).into_drawing_area();
            root.fill(&WHITE).map_err(FcError::plot)?;
            fig.draw(&root)?;
            root.present().map_err(FcError::plot)?;
        }
    }
    info!("Saved figure {}", path.display());
    Ok(())
}
