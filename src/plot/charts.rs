//! Categorical charts: bars with 95% CI, box plots, strip plots and
//! per-subject longitudinal lines
//!
//! Data comes in long format ([`Observation`]): one value per row with an x
//! category and a hue. Categories keep their order of first appearance.

use plotters::coord::types::RangedCoordf64;
use plotters::coord::Shift;
use plotters::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{FcError, Result};
use crate::plot::colormap::named_color;
use crate::plot::Figure;

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub x: String,
    pub hue: String,
    pub value: f64,
}

impl Observation {
    pub fn new(x: &str, hue: &str, value: f64) -> Self {
        Self { x: x.to_string(), hue: hue.to_string(), value }
    }
}

/// Mean and standard error of one (x, hue) cell
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub x: String,
    pub hue: String,
    pub n: usize,
    pub mean: f64,
    pub sem: f64,
}

impl Summary {
    /// Normal-approximation 95% interval
    pub fn ci95(&self) -> (f64, f64) {
        (self.mean - 1.96 * self.sem, self.mean + 1.96 * self.sem)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxStats {
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub whisker_lo: f64,
    pub whisker_hi: f64,
}

fn push_unique(list: &mut Vec<String>, s: &str) {
    if !list.iter().any(|v| v == s) {
        list.push(s.to_string());
    }
}

/// Distinct x and hue categories in order of first appearance
pub fn categories(obs: &[Observation]) -> (Vec<String>, Vec<String>) {
    let mut xs = Vec::new();
    let mut hues = Vec::new();
    for o in obs {
        push_unique(&mut xs, &o.x);
        push_unique(&mut hues, &o.hue);
    }
    (xs, hues)
}

fn cell_values<'a>(obs: &'a [Observation], x: &'a str, hue: &'a str) -> impl Iterator<Item = f64> + 'a {
    obs.iter()
        .filter(move |o| o.x == x && o.hue == hue && o.value.is_finite())
        .map(|o| o.value)
}

/// One summary per non-empty (x, hue) cell
pub fn summarize(obs: &[Observation]) -> Vec<Summary> {
    let (xs, hues) = categories(obs);
    let mut out = Vec::new();
    for x in &xs {
        for hue in &hues {
            let values: Vec<f64> = cell_values(obs, x, hue).collect();
            if values.is_empty() {
                continue;
            }
            let n = values.len();
            let mean = values.iter().sum::<f64>() / n as f64;
            let sem = if n > 1 {
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
                (var / n as f64).sqrt()
            } else {
                0.0
            };
            out.push(Summary { x: x.clone(), hue: hue.clone(), n, mean, sem });
        }
    }
    out
}

/// Linear-interpolation percentile of sorted values
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Quartiles and 1.5 IQR whiskers clipped to the data
pub fn box_stats(values: &[f64]) -> Option<BoxStats> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = percentile(&sorted, 0.25);
    let median = percentile(&sorted, 0.5);
    let q3 = percentile(&sorted, 0.75);
    let iqr = q3 - q1;
    let whisker_lo = sorted
        .iter()
        .copied()
        .find(|&v| v >= q1 - 1.5 * iqr)
        .unwrap_or(q1);
    let whisker_hi = sorted
        .iter()
        .rev()
        .copied()
        .find(|&v| v <= q3 + 1.5 * iqr)
        .unwrap_or(q3);
    Some(BoxStats { q1, median, q3, whisker_lo, whisker_hi })
}

/// Data range padded by 10%, optionally forced to include zero
pub fn auto_ylim(values: impl IntoIterator<Item = f64>, include_zero: bool) -> (f64, f64) {
    let (mut lo, mut hi) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    if include_zero {
        lo = lo.min(0.0);
        hi = hi.max(0.0);
    }
    let pad = if hi > lo { 0.1 * (hi - lo) } else { 1.0 };
    (lo - pad, hi + pad)
}

/// Label of an integer tick, empty between categories
fn category_label(names: &[String], v: f64) -> String {
    let i = v.round();
    if (v - i).abs() > 1e-6 || i < 0.0 {
        return String::new();
    }
    names.get(i as usize).cloned().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChartOptions {
    pub title: Option<String>,
    pub x_label: Option<String>,
    pub y_label: Option<String>,
    pub ylim: Option<(f64, f64)>,
    /// Colours by hue, cycled; a default palette when empty
    pub palette: Vec<RGBColor>,
    /// Replaces the x category names on the axis
    pub x_tick_labels: Option<Vec<String>>,
}

impl ChartOptions {
    fn color(&self, i: usize) -> RGBColor {
        if self.palette.is_empty() {
            let default = [
                named_color("orange").unwrap_or(RED),
                named_color("lightslategray").unwrap_or(BLUE),
                named_color("darkgrey").unwrap_or(BLACK),
            ];
            default[i % default.len()]
        } else {
            self.palette[i % self.palette.len()]
        }
    }
}

type CategoryChart<'a, DB> = ChartContext<'a, DB, Cartesian2d<RangedCoordf64, RangedCoordf64>>;

fn category_chart<'a, DB: DrawingBackend>(
    area: &'a DrawingArea<DB, Shift>,
    names: &[String],
    ylim: (f64, f64),
    opts: &ChartOptions,
) -> Result<CategoryChart<'a, DB>> {
    let mut builder = ChartBuilder::on(area);
    builder.margin(10).x_label_area_size(40).y_label_area_size(60);
    if let Some(title) = &opts.title {
        builder.caption(title, ("sans-serif", 20));
    }
    let n = names.len().max(1) as f64;
    let mut chart = builder
        .build_cartesian_2d(-0.5..n - 0.5, ylim.0..ylim.1)
        .map_err(FcError::plot)?;

    let labels = opts.x_tick_labels.clone().unwrap_or_else(|| names.to_vec());
    let formatter = |v: &f64| category_label(&labels, *v);
    {
        let mut mesh = chart.configure_mesh();
        mesh.disable_x_mesh()
            .x_labels(names.len().max(1))
            .x_label_formatter(&formatter);
        if let Some(y) = &opts.y_label {
            mesh.y_desc(y.as_str());
        }
        if let Some(x) = &opts.x_label {
            mesh.x_desc(x.as_str());
        }
        mesh.draw().map_err(FcError::plot)?;
    }
    Ok(chart)
}

/// Horizontal offset and width of a hue within its category slot
fn hue_slot(h: usize, n_hues: usize) -> (f64, f64) {
    let width = 0.8 / n_hues.max(1) as f64;
    (-0.4 + (h as f64 + 0.5) * width, width)
}

fn draw_bar<DB: DrawingBackend>(area: &DrawingArea<DB, Shift>, obs: &[Observation], opts: &ChartOptions) -> Result<()> {
    let (xs, hues) = categories(obs);
    let summaries = summarize(obs);
    let ylim = opts.ylim.unwrap_or_else(|| {
        auto_ylim(summaries.iter().flat_map(|s| {
            let (lo, hi) = s.ci95();
            [lo, hi]
        }), true)
    });
    let mut chart = category_chart(area, &xs, ylim, opts)?;
    for s in &summaries {
        let i = xs.iter().position(|x| *x == s.x).unwrap_or(0) as f64;
        let h = hues.iter().position(|x| *x == s.hue).unwrap_or(0);
        let (offset, width) = hue_slot(h, hues.len());
        let centre = i + offset;
        let color = opts.color(h);
        chart
            .draw_series(std::iter::once(Rectangle::new(
                [(centre - width / 2.0, 0.0), (centre + width / 2.0, s.mean)],
                color.filled(),
            )))
            .map_err(FcError::plot)?;
        let (lo, hi) = s.ci95();
        chart
            .draw_series(std::iter::once(PathElement::new(vec![(centre, lo), (centre, hi)], BLACK.stroke_width(1))))
            .map_err(FcError::plot)?;
    }
    Ok(())
}

fn draw_box<DB: DrawingBackend>(area: &DrawingArea<DB, Shift>, obs: &[Observation], opts: &ChartOptions) -> Result<()> {
    let (xs, hues) = categories(obs);
    let ylim = opts.ylim.unwrap_or_else(|| auto_ylim(obs.iter().map(|o| o.value), false));
    let mut chart = category_chart(area, &xs, ylim, opts)?;
    for (i, x) in xs.iter().enumerate() {
        for (h, hue) in hues.iter().enumerate() {
            let values: Vec<f64> = cell_values(obs, x, hue).collect();
            let Some(b) = box_stats(&values) else { continue };
            let (offset, width) = hue_slot(h, hues.len());
            let centre = i as f64 + offset;
            let half = width * 0.4;
            let color = opts.color(h);
            chart
                .draw_series([
                    Rectangle::new([(centre - half, b.q1), (centre + half, b.q3)], color.mix(0.7).filled()),
                    Rectangle::new([(centre - half, b.q1), (centre + half, b.q3)], BLACK.stroke_width(1)),
                ])
                .map_err(FcError::plot)?;
            chart
                .draw_series([
                    PathElement::new(vec![(centre - half, b.median), (centre + half, b.median)], BLACK.stroke_width(2)),
                    PathElement::new(vec![(centre, b.q3), (centre, b.whisker_hi)], BLACK.stroke_width(1)),
                    PathElement::new(vec![(centre, b.q1), (centre, b.whisker_lo)], BLACK.stroke_width(1)),
                ])
                .map_err(FcError::plot)?;
            let outliers = values.iter().filter(|&&v| v < b.whisker_lo || v > b.whisker_hi);
            chart
                .draw_series(outliers.map(|&v| Circle::new((centre, v), 2, BLACK.filled())))
                .map_err(FcError::plot)?;
        }
    }
    Ok(())
}

fn draw_strip<DB: DrawingBackend>(area: &DrawingArea<DB, Shift>, obs: &[Observation], opts: &ChartOptions) -> Result<()> {
    let (xs, hues) = categories(obs);
    let ylim = opts.ylim.unwrap_or_else(|| auto_ylim(obs.iter().map(|o| o.value), false));
    let mut chart = category_chart(area, &xs, ylim, opts)?;
    let mut rng = StdRng::seed_from_u64(0);
    for o in obs.iter().filter(|o| o.value.is_finite()) {
        let i = xs.iter().position(|x| *x == o.x).unwrap_or(0) as f64;
        let h = hues.iter().position(|x| *x == o.hue).unwrap_or(0);
        let (offset, width) = hue_slot(h, hues.len());
        let jitter = rng.gen_range(-0.25..0.25) * width;
        chart
            .draw_series(std::iter::once(Circle::new((i + offset + jitter, o.value), 3, opts.color(h).mix(0.6).filled())))
            .map_err(FcError::plot)?;
    }
    // mean and 95% CI on top of the points
    for s in summarize(obs) {
        let i = xs.iter().position(|x| *x == s.x).unwrap_or(0) as f64;
        let h = hues.iter().position(|x| *x == s.hue).unwrap_or(0);
        let (offset, _) = hue_slot(h, hues.len());
        let (lo, hi) = s.ci95();
        chart
            .draw_series([
                PathElement::new(vec![(i + offset, lo), (i + offset, hi)], BLACK.stroke_width(2)),
            ])
            .map_err(FcError::plot)?;
        chart
            .draw_series(std::iter::once(Circle::new((i + offset, s.mean), 4, BLACK.filled())))
            .map_err(FcError::plot)?;
    }
    Ok(())
}

fn draw_lines<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    x_labels: &[String],
    lines: &[(RGBColor, Vec<f64>)],
    opts: &ChartOptions,
) -> Result<()> {
    let ylim = opts
        .ylim
        .unwrap_or_else(|| auto_ylim(lines.iter().flat_map(|(_, v)| v.iter().copied()), false));
    let mut chart = category_chart(area, x_labels, ylim, opts)?;
    for (color, values) in lines {
        let points: Vec<(f64, f64)> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, &v)| (i as f64, v))
            .collect();
        chart
            .draw_series(LineSeries::new(points.iter().copied(), color.mix(0.5).stroke_width(1)))
            .map_err(FcError::plot)?;
        chart
            .draw_series(points.iter().map(|&p| Circle::new(p, 3, color.mix(0.5).filled())))
            .map_err(FcError::plot)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum PanelKind {
    Bar(Vec<Observation>),
    Box(Vec<Observation>),
    Strip(Vec<Observation>),
    /// One line per subject across the x categories
    Lines {
        x_labels: Vec<String>,
        lines: Vec<(RGBColor, Vec<f64>)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartPanel {
    pub kind: PanelKind,
    pub opts: ChartOptions,
}

/// Chart panels laid out row by row
#[derive(Debug, Clone, PartialEq)]
pub struct ChartGrid {
    pub rows: usize,
    pub cols: usize,
    pub panel_size: (u32, u32),
    pub panels: Vec<ChartPanel>,
}

impl ChartGrid {
    pub fn new(rows: usize, cols: usize, panels: Vec<ChartPanel>) -> Self {
        Self { rows, cols, panel_size: (400, 400), panels }
    }
}

impl Figure for ChartGrid {
    fn size(&self) -> (u32, u32) {
        (self.panel_size.0 * self.cols.max(1) as u32, self.panel_size.1 * self.rows.max(1) as u32)
    }

    fn draw<DB: DrawingBackend>(&self, root: &DrawingArea<DB, Shift>) -> Result<()> {
        let areas = root.split_evenly((self.rows.max(1), self.cols.max(1)));
        for (area, panel) in areas.iter().zip(&self.panels) {
            match &panel.kind {
                PanelKind::Bar(obs) => draw_bar(area, obs, &panel.opts)?,
                PanelKind::Box(obs) => draw_box(area, obs, &panel.opts)?,
                PanelKind::Strip(obs) => draw_strip(area, obs, &panel.opts)?,
                PanelKind::Lines { x_labels, lines } => draw_lines(area, x_labels, lines, &panel.opts)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs() -> Vec<Observation> {
        vec![
            Observation::new("ses-pre", "group1", 1.0),
            Observation::new("ses-pre", "group1", 3.0),
            Observation::new("ses-pre", "group2", 2.0),
            Observation::new("ses-post", "group1", 5.0),
            Observation::new("ses-post", "group2", f64::NAN),
        ]
    }

    #[test]
    fn test_categories_keep_first_appearance() {
        let (xs, hues) = categories(&obs());
        assert_eq!(xs, vec!["ses-pre", "ses-post"]);
        assert_eq!(hues, vec!["group1", "group2"]);
    }

    #[test]
    fn test_summaries() {
        let s = summarize(&obs());
        assert_eq!(s.len(), 3);
        assert_eq!(s[0].n, 2);
        assert_eq!(s[0].mean, 2.0);
        assert!((s[0].sem - 1.0).abs() < 1e-12);
        let (lo, hi) = s[0].ci95();
        assert!((lo - 0.04).abs() < 1e-12 && (hi - 3.96).abs() < 1e-12);
        assert_eq!(s[1].sem, 0.0);
        assert_eq!(s[2].x, "ses-post");
    }

    #[test]
    fn test_box_stats() {
        let b = box_stats(&[1.0, 2.0, 3.0, 4.0, 100.0]).unwrap();
        assert_eq!(b.q1, 2.0);
        assert_eq!(b.median, 3.0);
        assert_eq!(b.q3, 4.0);
        assert_eq!(b.whisker_lo, 1.0);
        assert_eq!(b.whisker_hi, 4.0);
        assert!(box_stats(&[f64::NAN]).is_none());
    }

    #[test]
    fn test_ylim_and_labels() {
        let (lo, hi) = auto_ylim([1.0, 3.0], true);
        assert!((lo + 0.3).abs() < 1e-12 && (hi - 3.3).abs() < 1e-12);
        assert_eq!(auto_ylim(Vec::<f64>::new(), false), (0.0, 1.0));
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(category_label(&names, 1.0), "b");
        assert_eq!(category_label(&names, 0.5), "");
        assert_eq!(category_label(&names, 4.0), "");
    }
}
