//! Orthogonal slices of statistical maps
//!
//! Each panel shows a sagittal, a coronal and an axial slice through the cut
//! coordinates, sampled in world space so that images on different grids line
//! up. Voxels below the threshold are drawn grey inside the image support and
//! white outside it.

use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;

use crate::error::{FcError, Result};
use crate::plot::colormap::{named_color, Colormap};
use crate::plot::{save_figure, Figure};
use crate::volume::Volume;

#[derive(Debug, Clone, PartialEq)]
pub struct StatMapOptions {
    pub title: Option<String>,
    /// Absolute values below this are not coloured
    pub threshold: f64,
    /// World coordinates of the cuts, the peak when `None`
    pub cut_coords: Option<[f64; 3]>,
    pub cmap: Colormap,
    pub colorbar: bool,
    /// Top of the colour scale, the largest absolute value when `None`
    pub vmax: Option<f64>,
    /// Scale from `-vmax` to `vmax` instead of `0` to `vmax`
    pub symmetric: bool,
}

impl Default for StatMapOptions {
    fn default() -> Self {
        Self {
            title: None,
            threshold: 0.0,
            cut_coords: None,
            cmap: Colormap::ColdHot,
            colorbar: true,
            vmax: None,
            symmetric: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceAxis {
    Sagittal,
    Coronal,
    Axial,
}

/// A 2D world-space section, row 0 at the top
#[derive(Debug, Clone)]
pub struct Slice {
    pub width: usize,
    pub height: usize,
    pub values: Vec<f64>,
}

/// World bounding box of the grid: (min, max) per axis
fn world_bounds(vol: &Volume) -> [(f64, f64); 3] {
    let (nx, ny, nz) = vol.dims;
    let mut bounds = [(f64::INFINITY, f64::NEG_INFINITY); 3];
    for &i in &[0.0, (nx.max(1) - 1) as f64] {
        for &j in &[0.0, (ny.max(1) - 1) as f64] {
            for &k in &[0.0, (nz.max(1) - 1) as f64] {
                let w = vol.voxel_to_world(i, j, k);
                for a in 0..3 {
                    bounds[a].0 = bounds[a].0.min(w[a]);
                    bounds[a].1 = bounds[a].1.max(w[a]);
                }
            }
        }
    }
    bounds
}

/// World coordinate of the largest absolute value, the grid centre for an empty map
pub fn find_cut_coords(vol: &Volume) -> [f64; 3] {
    let peak = vol
        .data
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite() && **v != 0.0)
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| i);
    match peak {
        Some(idx) => {
            let (i, j, k) = vol.coords(idx);
            vol.voxel_to_world(i as f64, j as f64, k as f64)
        }
        None => {
            let b = world_bounds(vol);
            [(b[0].0 + b[0].1) / 2.0, (b[1].0 + b[1].1) / 2.0, (b[2].0 + b[2].1) / 2.0]
        }
    }
}

/// Sample the plane through `coord` perpendicular to `axis` every `step` mm
pub fn world_slice(vol: &Volume, axis: SliceAxis, coord: f64, step: f64) -> Result<Slice> {
    if step <= 0.0 {
        return Err(FcError::Plot("slice step must be positive".to_string()));
    }
    let b = world_bounds(vol);
    let (h_axis, v_axis) = match axis {
        SliceAxis::Sagittal => (1, 2),
        SliceAxis::Coronal => (0, 2),
        SliceAxis::Axial => (0, 1),
    };
    let fixed = match axis {
        SliceAxis::Sagittal => 0,
        SliceAxis::Coronal => 1,
        SliceAxis::Axial => 2,
    };
    let width = ((b[h_axis].1 - b[h_axis].0) / step).floor() as usize + 1;
    let height = ((b[v_axis].1 - b[v_axis].0) / step).floor() as usize + 1;
    let mut values = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            let mut w = [0.0; 3];
            w[fixed] = coord;
            w[h_axis] = b[h_axis].0 + col as f64 * step;
            w[v_axis] = b[v_axis].1 - row as f64 * step;
            values.push(vol.sample_world(w[0], w[1], w[2])?);
        }
    }
    Ok(Slice { width, height, values })
}

/// Colour scale limits for a map
fn color_limits(vol: &Volume, opts: &StatMapOptions) -> (f64, f64) {
    let vmax = opts.vmax.unwrap_or_else(|| {
        vol.data
            .iter()
            .filter(|v| v.is_finite())
            .fold(0.0_f64, |m, v| m.max(v.abs()))
    });
    let vmax = if vmax > 0.0 { vmax } else { 1.0 };
    if opts.symmetric { (-vmax, vmax) } else { (0.0, vmax) }
}

fn voxel_color(v: f64, threshold: f64, limits: (f64, f64), cmap: Colormap) -> RGBColor {
    if !v.is_finite() || v == 0.0 {
        WHITE
    } else if v.abs() < threshold {
        named_color("lightgrey").unwrap_or(WHITE)
    } else {
        cmap.map_range(v, limits.0, limits.1)
    }
}

fn draw_slice<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    slice: &Slice,
    threshold: f64,
    limits: (f64, f64),
    cmap: Colormap,
) -> Result<()> {
    let (w, h) = area.dim_in_pixel();
    if slice.width == 0 || slice.height == 0 {
        return Ok(());
    }
    let px = (w as f64 / slice.width as f64).min(h as f64 / slice.height as f64);
    let x_off = (w as f64 - px * slice.width as f64) / 2.0;
    let y_off = (h as f64 - px * slice.height as f64) / 2.0;
    for row in 0..slice.height {
        for col in 0..slice.width {
            let v = slice.values[row * slice.width + col];
            let color = voxel_color(v, threshold, limits, cmap);
            if color == WHITE {
                continue;
            }
            let x0 = (x_off + col as f64 * px).floor() as i32;
            let y0 = (y_off + row as f64 * px).floor() as i32;
            let x1 = (x_off + (col + 1) as f64 * px).ceil() as i32;
            let y1 = (y_off + (row + 1) as f64 * px).ceil() as i32;
            area.draw(&Rectangle::new([(x0, y0), (x1, y1)], color.filled()))
                .map_err(FcError::plot)?;
        }
    }
    Ok(())
}

fn draw_colorbar<DB: DrawingBackend>(area: &DrawingArea<DB, Shift>, limits: (f64, f64), cmap: Colormap) -> Result<()> {
    let (w, h) = area.dim_in_pixel();
    let steps = 64;
    let top = 20;
    let bottom = h as i32 - 20;
    let bar_w = (w as i32 / 3).max(4);
    let span = (bottom - top).max(1) as f64;
    for s in 0..steps {
        let t = s as f64 / (steps - 1) as f64;
        let y1 = bottom - (t * span) as i32;
        let y0 = bottom - ((s + 1) as f64 / steps as f64 * span) as i32;
        area.draw(&Rectangle::new([(0, y0), (bar_w, y1)], cmap.map(t).filled()))
            .map_err(FcError::plot)?;
    }
    let font = ("sans-serif", 12).into_font();
    area.draw(&Text::new(format!("{:.2}", limits.1), (bar_w + 2, top - 6), font.clone()))
        .map_err(FcError::plot)?;
    area.draw(&Text::new(format!("{:.2}", limits.0), (bar_w + 2, bottom - 6), font))
        .map_err(FcError::plot)?;
    Ok(())
}

/// Draw one stat-map panel (three slices and an optional colour bar) on `area`
pub fn draw_stat_map<DB: DrawingBackend>(area: &DrawingArea<DB, Shift>, vol: &Volume, opts: &StatMapOptions) -> Result<()> {
    let area = match &opts.title {
        Some(title) => area.titled(title, ("sans-serif", 18)).map_err(FcError::plot)?,
        None => area.clone(),
    };
    let (w, _) = area.dim_in_pixel();
    let (slices_area, bar_area) = if opts.colorbar {
        let (l, r) = area.split_horizontally((w as i32 - 60).max(1));
        (l, Some(r))
    } else {
        (area.clone(), None)
    };

    let cut = opts.cut_coords.unwrap_or_else(|| find_cut_coords(vol));
    let limits = color_limits(vol, opts);
    let step = vol.voxel_size.0.abs().min(vol.voxel_size.1.abs()).min(vol.voxel_size.2.abs()).max(0.5);
    let panels = slices_area.split_evenly((1, 3));
    let axes = [(SliceAxis::Sagittal, cut[0]), (SliceAxis::Coronal, cut[1]), (SliceAxis::Axial, cut[2])];
    for (panel, (axis, coord)) in panels.iter().zip(axes) {
        let slice = world_slice(vol, axis, coord, step)?;
        draw_slice(panel, &slice, opts.threshold, limits, opts.cmap)?;
    }
    if let Some(bar) = bar_area {
        draw_colorbar(&bar, limits, opts.cmap)?;
    }
    Ok(())
}

/// Stat-map panels stacked vertically
pub struct StatMapFigure<'a> {
    pub panels: Vec<(&'a Volume, StatMapOptions)>,
    pub panel_size: (u32, u32),
}

impl<'a> StatMapFigure<'a> {
    pub fn new(panels: Vec<(&'a Volume, StatMapOptions)>) -> Self {
        Self { panels, panel_size: (900, 280) }
    }
}

impl Figure for StatMapFigure<'_> {
    fn size(&self) -> (u32, u32) {
        (self.panel_size.0, self.panel_size.1 * self.panels.len().max(1) as u32)
    }

    fn draw<DB: DrawingBackend>(&self, root: &DrawingArea<DB, Shift>) -> Result<()> {
        let areas = root.split_evenly((self.panels.len().max(1), 1));
        for (area, (vol, opts)) in areas.iter().zip(&self.panels) {
            draw_stat_map(area, vol, opts)?;
        }
        Ok(())
    }
}

/// Single-panel stat map figure
pub fn plot_stat_map(vol: &Volume, opts: &StatMapOptions, path: &Path) -> Result<()> {
    save_figure(&StatMapFigure::new(vec![(vol, opts.clone())]), path)
}
