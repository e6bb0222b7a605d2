//! Trial figures: stimulation VOI, surface rendering, longitudinal point
//! plots and the pre/post report

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Local;
use log::{debug, info, warn};
use plotters::style::RGBColor;

use crate::analysis::voi::{pathway_name, read_voi_corr};
use crate::config::StudyConfig;
use crate::connectivity::alff::read_alff_table;
use crate::connectivity::AlffRecord;
use crate::error::{FcError, Result};
use crate::plot::{named_color, save_figure, ChartGrid, ChartOptions, ChartPanel, Colormap, PanelKind};
use crate::stats::anova::{format_anova, format_pairwise, mixed_anova, pairwise_ttests, LongRecord};
use crate::stats::univariate::{pearsonr, ttest_ind};
use crate::study::{load_clinical, load_stim_coords, ClinicalRecord, GroupTable, Layout, StimCoord, GROUP1, GROUP2};
use crate::surface::mesh::{icbm_mesh_name, read_nv, Hemisphere, SurfaceMesh};
use crate::surface::project::{vol_to_surf, zeros_to_nan};
use crate::surface::render::{Camera, SurfaceFigure, TextureLayer};
use crate::utils::mask::create_sphere_mask;
use crate::volume::{mean_volumes, Volume};

/// Sampling radius of the volume to surface projection (mm)
pub const PROJECTION_RADIUS: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct VisualsOptions {
    pub create_stim_voi: bool,
    pub stim_radius: f64,
    pub plot_surface: bool,
    pub smoothed_surface: bool,
    pub camera: Camera,
    pub show_stim_balls: bool,
    pub stim_balls_radius: f64,
    /// Scales the stimulation coordinates towards the mesh
    pub stim_balls_scaling: f64,
    pub plot_pointplot: bool,
    pub print_stats: bool,
    /// Seed whose VOI connectivity goes into the summary
    pub seed: String,
    pub save_outputs: bool,
    pub save_figs: bool,
    pub plot_figs: bool,
}

impl Default for VisualsOptions {
    fn default() -> Self {
        Self {
            create_stim_voi: false,
            stim_radius: 5.0,
            plot_surface: false,
            smoothed_surface: false,
            camera: Camera::FRONT,
            show_stim_balls: false,
            stim_balls_radius: 2.0,
            stim_balls_scaling: 1.0,
            plot_pointplot: false,
            print_stats: false,
            seed: "Acc".to_string(),
            save_outputs: false,
            save_figs: false,
            plot_figs: false,
        }
    }
}

impl VisualsOptions {
    pub fn figures(&self) -> bool {
        self.plot_figs || self.save_figs
    }
}

/// Mean of `radius` mm spheres at every stimulation site, on the grid of `reference`
pub fn stim_site_voi(reference: &Volume, coords: &[StimCoord], radius: f64) -> Result<Volume> {
    let spheres = coords
        .iter()
        .map(|c| create_sphere_mask(reference, c.coord(), radius))
        .collect::<Result<Vec<_>>>()?;
    mean_volumes(&spheres)
}

pub fn stim_voi_path(cfg: &StudyConfig, radius: f64) -> PathBuf {
    cfg.proj_dir.join("utils").join(format!("stim_VOI_{}mm.nii.gz", radius))
}

/// Stimulation site VOI on the grey matter template grid
pub fn create_stim_site_voi(cfg: &StudyConfig, coords: &[StimCoord], radius: f64, save: bool) -> Result<Volume> {
    let reference = Volume::load(&cfg.proj_path(&cfg.template_masks.gm))?;
    let voi = stim_site_voi(&reference, coords, radius)?;
    if save {
        let path = stim_voi_path(cfg, radius);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        voi.save(&path)?;
        info!("Saved stimulation VOI to {}", path.display());
    }
    Ok(voi)
}

/// Small sphere at one subject's stimulation site
#[derive(Debug, Clone)]
pub struct StimBall {
    pub subj: String,
    pub group: String,
    pub mesh: SurfaceMesh,
    pub color: RGBColor,
}

pub fn group_color(cfg: &StudyConfig, group: &str) -> Result<RGBColor> {
    let name = cfg
        .surface
        .group_colors
        .get(group)
        .ok_or_else(|| FcError::Config(format!("no colour for group '{}'", group)))?;
    named_color(name).ok_or_else(|| FcError::Config(format!("unknown colour '{}'", name)))
}

/// One ball per stimulated subject with a known group
pub fn stim_balls(
    cfg: &StudyConfig,
    coords: &[StimCoord],
    groups: &GroupTable,
    radius: f64,
    scaling: f64,
) -> Result<Vec<StimBall>> {
    let mut balls = Vec::new();
    for c in coords {
        let Some(group) = groups.group_of(&c.subj) else {
            debug!("{} has no group, no stimulation ball", c.subj);
            continue;
        };
        let [x, y, z] = c.coord();
        balls.push(StimBall {
            subj: c.subj.clone(),
            group: group.to_string(),
            mesh: SurfaceMesh::sphere([x * scaling, y * scaling, z * scaling], radius, 2),
            color: group_color(cfg, group)?,
        });
    }
    Ok(balls)
}

pub fn load_icbm_surface(cfg: &StudyConfig, hemi: Hemisphere, smoothed: bool) -> Result<SurfaceMesh> {
    read_nv(&cfg.proj_path(&cfg.surface.template_dir).join(icbm_mesh_name(hemi, smoothed)))
}

/// Project each named layer image onto `mesh`
pub fn texture_layers(cfg: &StudyConfig, mesh: &SurfaceMesh, names: &[String]) -> Result<Vec<TextureLayer>> {
    names
        .iter()
        .map(|name| {
            let layer = cfg
                .surface_layer(name)
                .ok_or_else(|| FcError::Config(format!("unknown surface layer '{}'", name)))?;
            let vol = Volume::load(&cfg.proj_path(&layer.path))?;
            let mut values = vol_to_surf(&vol, mesh, PROJECTION_RADIUS)?;
            zeros_to_nan(&mut values);
            Ok(TextureLayer {
                name: name.clone(),
                values,
                cmap: layer.cmap.parse::<Colormap>()?,
                clim: layer.clim,
                opacity: layer.opacity,
                nan_opacity: layer.nan_opacity,
            })
        })
        .collect()
}

/// Right hemisphere with the configured layers, and stimulation balls on request
pub fn plot_surface(layout: &Layout, opts: &VisualsOptions, coords: &[StimCoord], groups: &GroupTable) -> Result<PathBuf> {
    let cfg = layout.cfg;
    let start = Instant::now();
    let mesh = load_icbm_surface(cfg, Hemisphere::Right, opts.smoothed_surface)?;
    let layers = texture_layers(cfg, &mesh, &cfg.surface.show)?;
    let mut fig = SurfaceFigure::new(mesh, layers, opts.camera);
    if opts.show_stim_balls {
        fig.balls = stim_balls(cfg, coords, groups, opts.stim_balls_radius, opts.stim_balls_scaling)?
            .into_iter()
            .map(|b| (b.mesh, b.color))
            .collect();
    }
    let fname = format!("{}_{}.svg", cfg.surface.show.join("_"), Local::now().format("%d%m%Y"));
    let path = layout.figure_dir().join(fname);
    save_figure(&fig, &path)?;
    info!("Surface rendered in {:.2?}", start.elapsed());
    Ok(path)
}

/// One subject and session with its connectivity, fALFF and symptom score
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub subj: String,
    pub ses: String,
    pub group: String,
    pub corr: f64,
    pub falff: f64,
    pub ybocs: Option<f64>,
}

impl SummaryRow {
    fn value(&self, var: &str) -> f64 {
        match var {
            "corr" => self.corr,
            _ => self.falff,
        }
    }

    fn complete(&self) -> bool {
        self.corr.is_finite() && self.falff.is_finite() && self.ybocs.is_some_and(f64::is_finite)
    }
}

/// Join ALFF, seed to VOI connectivity and clinical scores on subject and session
///
/// `corr` maps (subject, session) to the connectivity of the chosen pathway.
pub fn merge_summary(
    alff: &[AlffRecord],
    corr: &BTreeMap<(String, String), f64>,
    clinical: &[ClinicalRecord],
    groups: &GroupTable,
) -> Vec<SummaryRow> {
    alff.iter()
        .filter_map(|a| {
            let group = groups.group_of(&a.subj)?;
            let corr = *corr.get(&(a.subj.clone(), a.ses.clone()))?;
            let ybocs = clinical
                .iter()
                .find(|c| c.subj == a.subj && c.ses == a.ses)
                .and_then(|c| c.ybocs_total);
            Some(SummaryRow {
                subj: a.subj.clone(),
                ses: a.ses.clone(),
                group: group.to_string(),
                corr,
                falff: a.falff,
                ybocs,
            })
        })
        .collect()
}

/// Load the saved tables and merge them for `opts.seed`
pub fn load_summary(layout: &Layout, opts: &VisualsOptions, groups: &GroupTable) -> Result<Vec<SummaryRow>> {
    let cfg = layout.cfg;
    let alff = read_alff_table(&layout.alff_table())?;
    let (metric, atlas) = cfg
        .metrics
        .first()
        .zip(cfg.atlases.first())
        .ok_or_else(|| FcError::Config("no metric or atlas configured".to_string()))?;
    let pathway = pathway_name(&opts.seed);
    let corr: BTreeMap<(String, String), f64> = read_voi_corr(&layout.voi_corr_table())?
        .into_iter()
        .filter(|r| &r.metric == metric && &r.atlas == atlas && r.pathway == pathway)
        .map(|r| ((r.subj, r.ses), r.corr))
        .collect();
    let clinical = load_clinical(&cfg.proj_path(&cfg.clinical_file))?;
    let summary = merge_summary(&alff, &corr, &clinical, groups);
    info!("{} summary rows for {}", summary.len(), pathway);
    Ok(summary)
}

fn session_labels(sessions: &[String]) -> Vec<String> {
    if sessions.len() == 2 {
        vec!["Baseline".to_string(), "post-cTBS".to_string()]
    } else {
        sessions.to_vec()
    }
}

/// Individual pre/post trajectories, active group left and sham right
pub fn pointplot_chart(cfg: &StudyConfig, summary: &[SummaryRow], var: &str) -> Result<ChartGrid> {
    let ylim = match var {
        "corr" => (-1.0, 1.0),
        _ => (0.003, 0.02),
    };
    let mut panels = Vec::new();
    for (group, title) in [(GROUP1, "Active"), (GROUP2, "Sham")] {
        let color = group_color(cfg, group)?;
        let mut subjects: Vec<&str> = Vec::new();
        for r in summary.iter().filter(|r| r.group == group) {
            if !subjects.contains(&r.subj.as_str()) {
                subjects.push(&r.subj);
            }
        }
        let lines = subjects
            .into_iter()
            .map(|subj| {
                let values = cfg
                    .sessions
                    .iter()
                    .map(|ses| {
                        summary
                            .iter()
                            .find(|r| r.subj == subj && &r.ses == ses)
                            .map_or(f64::NAN, |r| r.value(var))
                    })
                    .collect();
                (color, values)
            })
            .collect();
        panels.push(ChartPanel {
            kind: PanelKind::Lines { x_labels: session_labels(&cfg.sessions), lines },
            opts: ChartOptions {
                title: Some(title.to_string()),
                y_label: Some(var.to_string()),
                ylim: Some(ylim),
                ..Default::default()
            },
        });
    }
    Ok(ChartGrid::new(1, 2, panels))
}

pub fn plot_pointplot(layout: &Layout, summary: &[SummaryRow]) -> Result<()> {
    let date = Local::now().format("%d%m%Y");
    for var in ["corr", "fALFF"] {
        let chart = pointplot_chart(layout.cfg, summary, var)?;
        save_figure(&chart, &layout.figure_dir().join(format!("point_plot_{}_indStim_{}.svg", var, date)))?;
    }
    Ok(())
}

/// Pre vs post tests per group, symptom change correlations and the mixed ANOVA
pub fn print_stats(summary: &[SummaryRow], sessions: &[String]) -> String {
    let mut out = String::new();
    let rows: Vec<&SummaryRow> = summary.iter().filter(|r| r.complete()).collect();
    let [pre_ses, post_ses] = match sessions {
        [a, b, ..] => [a, b],
        _ => {
            warn!("pre/post statistics need two sessions");
            return out;
        }
    };
    let mut group_names: Vec<&str> = Vec::new();
    for r in &rows {
        if !group_names.contains(&r.group.as_str()) {
            group_names.push(&r.group);
        }
    }

    for var in ["corr", "fALFF"] {
        for group in &group_names {
            let session = |ses: &String| -> Vec<&SummaryRow> {
                rows.iter().copied().filter(|r| r.group == *group && &r.ses == ses).collect()
            };
            let (pre, post) = (session(pre_ses), session(post_ses));
            let values = |rs: &[&SummaryRow]| -> Vec<f64> { rs.iter().map(|r| r.value(var)).collect() };
            match ttest_ind(&values(&pre[..]), &values(&post[..])) {
                Ok(t) => {
                    let _ = writeln!(out, "{} pre-post {}  t={:.2}  p={:.3}", var, group, t.statistic, t.p_value);
                }
                Err(e) => warn!("{} pre-post {}: {}", var, group, e),
            }

            // changes of subjects seen at both sessions
            let mut d_corr = Vec::new();
            let mut d_falff = Vec::new();
            let mut d_ybocs = Vec::new();
            for p in &pre {
                if let Some(q) = post.iter().find(|q| q.subj == p.subj) {
                    d_corr.push(p.corr - q.corr);
                    d_falff.push(p.falff - q.falff);
                    d_ybocs.push(p.ybocs.unwrap_or(f64::NAN) - q.ybocs.unwrap_or(f64::NAN));
                }
            }
            for (label, delta) in [("FC", &d_corr), ("fALFF", &d_falff)] {
                match pearsonr(delta, &d_ybocs) {
                    Ok((r, p)) => {
                        let _ = writeln!(out, "Delta {}-YBOCS correlation in {}: r={:.2}, p={:.3}", label, group, r, p);
                    }
                    Err(e) => warn!("Delta {}-YBOCS in {}: {}", label, group, e),
                }
            }

            let ybocs = |rs: &[&SummaryRow]| -> Vec<f64> { rs.iter().filter_map(|r| r.ybocs).collect() };
            match ttest_ind(&ybocs(&pre[..]), &ybocs(&post[..])) {
                Ok(t) => {
                    let _ = writeln!(out, "YBOCS pre-post stats in {}: t={:.2}, p={:.3}", group, t.statistic, t.p_value);
                }
                Err(e) => warn!("YBOCS pre-post in {}: {}", group, e),
            }
        }

        let long: Vec<LongRecord> = rows
            .iter()
            .map(|r| LongRecord {
                subject: r.subj.clone(),
                between: r.group.clone(),
                within: r.ses.clone(),
                value: r.value(var),
            })
            .collect();
        let _ = writeln!(out, "{}", var);
        match mixed_anova(&long, "group", "ses") {
            Ok(table) => out.push_str(&format_anova(&table)),
            Err(e) => warn!("mixed ANOVA on {}: {}", var, e),
        }
        match pairwise_ttests(&long, "group", "ses") {
            Ok(table) => out.push_str(&format_pairwise(&table)),
            Err(e) => warn!("pairwise tests on {}: {}", var, e),
        }
    }
    info!("{}", out);
    out
}

/// Run the requested figure stages in order
pub fn run_visuals(layout: &Layout, opts: &VisualsOptions) -> Result<()> {
    let cfg = layout.cfg;
    let groups = GroupTable::load(&cfg.proj_path(&cfg.groups_file))?;

    if opts.create_stim_voi || opts.plot_surface {
        let coords = load_stim_coords(&cfg.proj_path(&cfg.stim_coords_file))?;
        if opts.create_stim_voi {
            create_stim_site_voi(cfg, &coords, opts.stim_radius, opts.save_outputs)?;
        }
        if opts.plot_surface {
            plot_surface(layout, opts, &coords, &groups)?;
        }
    }

    if opts.plot_pointplot || opts.print_stats {
        let summary = load_summary(layout, opts, &groups)?;
        if opts.print_stats {
            print_stats(&summary, &cfg.sessions);
        }
        if opts.plot_pointplot && opts.figures() {
            plot_pointplot(layout, &summary)?;
        }
    }
    Ok(())
}
