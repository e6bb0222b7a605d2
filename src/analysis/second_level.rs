//! Parametric second-level analysis of the seed-to-voxel maps
//!
//! Maps are optionally restricted by template masks, fitted with an OLS GLM
//! and the between-group contrast is thresholded at an uncorrected (FPR) and
//! an FDR-corrected level. With within-group masking a second pass repeats
//! the fit inside the intersection of the two within-group maps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::info;
use serde::Serialize;

use crate::analysis::{write_json_gz, AnalysisContext, MaskFlags};
use crate::config::StudyConfig;
use crate::error::{FcError, Result};
use crate::plot::{save_figure, Colormap, StatMapFigure, StatMapOptions};
use crate::stats::clusters::{format_clusters_table, get_clusters_table, ClusterRow};
use crate::stats::design::{group_by_session_design, two_group_design, DesignMatrix};
use crate::stats::glm::{ContrastMaps, SecondLevelModel};
use crate::stats::threshold::{threshold_stats_img, HeightControl};
use crate::utils::mask::{apply_mask, binarize, intersect_masks, resample_masks};
use crate::volume::Volume;

const CLUSTER_THRESHOLD: usize = 10;
const WITHIN_GROUP_CLUSTER_THRESHOLD: usize = 100;
const MIN_PEAK_DISTANCE: f64 = 5.0;

/// Binarized template masks selected by `flags`
pub fn template_masks(cfg: &StudyConfig, flags: &MaskFlags, seed: &str) -> Result<Vec<Volume>> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let t = &cfg.template_masks;
    if flags.gm {
        paths.push(cfg.baseline_path(&t.gm));
    }
    if flags.fspt {
        paths.push(cfg.baseline_path(&t.fspt));
    }
    if flags.cortical {
        paths.push(cfg.baseline_path(&t.cortical));
    }
    if flags.frontal {
        paths.push(cfg.baseline_path(&t.frontal));
    }
    if flags.seed_specific {
        let p = cfg
            .pathway_masks
            .get(seed)
            .ok_or_else(|| FcError::Config(format!("no pathway mask configured for {}", seed)))?;
        paths.push(cfg.baseline_path(p));
    }
    paths
        .iter()
        .map(|p| Volume::load(p).map(|v| binarize(&v, 0.0)))
        .collect()
}

/// Images restricted to the analysis mask
#[derive(Debug, Clone)]
pub struct MaskedImages {
    pub imgs: Vec<Volume>,
    /// Intersection of the given and template masks, `None` when there were none
    pub mask: Option<Volume>,
}

/// Load `files` and zero them outside the intersection of `masks` and the
/// template masks selected by `flags`
pub fn mask_imgs(
    cfg: &StudyConfig,
    files: &[PathBuf],
    masks: &[Volume],
    seed: &str,
    flags: &MaskFlags,
) -> Result<MaskedImages> {
    let t0 = Instant::now();
    let mut all_masks = masks.to_vec();
    all_masks.extend(template_masks(cfg, flags, seed)?);

    let imgs: Vec<Volume> = files.iter().map(|f| Volume::load(f)).collect::<Result<_>>()?;
    let out = if all_masks.is_empty() {
        MaskedImages { imgs, mask: None }
    } else {
        let mask = intersect_masks(&resample_masks(&all_masks)?, 1.0)?;
        let imgs = imgs.iter().map(|img| apply_mask(img, &mask)).collect::<Result<_>>()?;
        MaskedImages { imgs, mask: Some(mask) }
    };
    info!("Masking took {:.2?}", t0.elapsed());
    Ok(out)
}

/// Design matrix and named contrasts for the group maps
///
/// Two indicator columns without sessions; with sessions one column per
/// group and session, the between contrast summing both sessions and an
/// extra group-by-session interaction.
pub fn glm_design(n1: usize, n2: usize, by_session: bool) -> (DesignMatrix, Vec<(String, Vec<f64>)>) {
    let named = |pairs: &[(&str, &[f64])]| -> Vec<(String, Vec<f64>)> {
        pairs.iter().map(|(n, c)| (n.to_string(), c.to_vec())).collect()
    };
    if by_session {
        (
            group_by_session_design(n1, n2),
            named(&[
                ("within_group1", &[1.0, 1.0, 0.0, 0.0]),
                ("within_group2", &[0.0, 0.0, 1.0, 1.0]),
                ("between", &[1.0, 1.0, -1.0, -1.0]),
                ("interaction", &[1.0, -1.0, -1.0, 1.0]),
            ]),
        )
    } else {
        (
            two_group_design(n1, n2),
            named(&[
                ("within_group1", &[1.0, 0.0]),
                ("within_group2", &[0.0, 1.0]),
                ("between", &[1.0, -1.0]),
            ]),
        )
    }
}

/// Subject of a map named `{subj}_{ses}_...`
fn map_subject(path: &Path, ses: &str) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    let tag = format!("_{}_", ses);
    name.find(&tag).map(|at| name[..at].to_string())
}

/// Number of subjects in a session-ordered map list
///
/// Every subject must have one map per session and the sessions must list
/// the subjects in the same order, since rows of the group-by-session design
/// and the exchangeability blocks pair maps by position.
pub fn paired_subjects(files: &[PathBuf], sessions: &[String]) -> Result<usize> {
    if sessions.len() != 2 {
        return Err(FcError::Shape(format!(
            "group-by-session design needs exactly two sessions, got {}",
            sessions.len()
        )));
    }
    let per_session: Vec<Vec<String>> = sessions
        .iter()
        .map(|ses| files.iter().filter_map(|f| map_subject(f, ses)).collect())
        .collect();
    let (pre, post) = (&per_session[0], &per_session[1]);
    if pre.len() + post.len() != files.len() {
        return Err(FcError::Shape(format!(
            "every map should belong to exactly one of {} and {}",
            sessions[0], sessions[1]
        )));
    }
    if pre != post {
        let unpaired: Vec<&str> = pre
            .iter()
            .filter(|s| !post.contains(s))
            .chain(post.iter().filter(|s| !pre.contains(s)))
            .map(String::as_str)
            .collect();
        return Err(FcError::Shape(if unpaired.is_empty() {
            format!("{} and {} list the subjects in a different order", sessions[0], sessions[1])
        } else {
            format!("subjects without a map in both sessions: {}", unpaired.join(", "))
        }));
    }
    Ok(pre.len())
}

/// Subjects per group given the maps of each group
///
/// With the group-by-session design every subject contributes a pre and a
/// post map, paired by position.
pub fn subjects_per_group(ctx: &AnalysisContext, maps1: &[PathBuf], maps2: &[PathBuf]) -> Result<(usize, usize)> {
    if !ctx.opts.design.group_by_session {
        return Ok((maps1.len(), maps2.len()));
    }
    let sessions = &ctx.layout.cfg.sessions;
    Ok((paired_subjects(maps1, sessions)?, paired_subjects(maps2, sessions)?))
}

/// One GLM fit with its contrasts
#[derive(Debug, Clone)]
pub struct GlmPass {
    pub contrasts: BTreeMap<String, ContrastMaps>,
    pub n_voxels: usize,
    pub dof: f64,
    pub rank: usize,
}

impl GlmPass {
    pub fn contrast(&self, name: &str) -> Result<&ContrastMaps> {
        self.contrasts
            .get(name)
            .ok_or_else(|| FcError::Stats(format!("contrast {} was not computed", name)))
    }
}

/// Fit the group maps of one seed and compute every contrast of the design
pub fn perform_second_level_analysis(
    ctx: &AnalysisContext,
    seed: &str,
    metric: &str,
    masks: &[Volume],
) -> Result<GlmPass> {
    let by_session = ctx.opts.design.group_by_session;
    let (g1, g2, all) = ctx.layout.file_lists(metric, seed, by_session, &ctx.revoked)?;
    let (n1, n2) = subjects_per_group(ctx, &g1, &g2)?;
    let (design, contrasts) = glm_design(n1, n2, by_session);

    let masked = mask_imgs(ctx.layout.cfg, &all, masks, seed, &ctx.opts.masks)?;
    let model = SecondLevelModel::fit(&masked.imgs, &design, masked.mask.as_ref())?;

    let t0 = Instant::now();
    let mut maps = BTreeMap::new();
    for (name, c) in contrasts {
        maps.insert(name, model.compute_contrast(&[c])?);
    }
    info!("{} contrasts of {} took {:.2?}", maps.len(), seed, t0.elapsed());
    Ok(GlmPass { contrasts: maps, n_voxels: model.n_voxels(), dof: model.dof, rank: model.rank })
}

/// Thresholded z map, its threshold and the cluster table
#[derive(Debug, Clone)]
pub struct ThresholdedContrast {
    pub img: Volume,
    pub thresh: f64,
    pub table: Vec<ClusterRow>,
}

pub fn threshold_contrast(
    z_map: &Volume,
    height_control: HeightControl,
    alpha: f64,
    cluster_threshold: usize,
) -> Result<ThresholdedContrast> {
    let (img, thresh) = threshold_stats_img(z_map, None, alpha, height_control, cluster_threshold, true)?;
    let table = get_clusters_table(z_map, thresh, cluster_threshold, true, MIN_PEAK_DISTANCE);
    Ok(ThresholdedContrast { img, thresh, table })
}

#[derive(Debug, Clone)]
pub struct WithinGroupMasks {
    pub group1: Volume,
    pub group2: Volume,
    /// Intersection of both
    pub mask: Volume,
}

/// Masks of the significant within-group effects of a first pass
pub fn create_within_group_mask(first_pass: &GlmPass, alpha: f64) -> Result<WithinGroupMasks> {
    let mask_of = |name: &str| -> Result<Volume> {
        let z = &first_pass.contrast(name)?.z_score;
        let t = threshold_contrast(z, HeightControl::Fpr, alpha, WITHIN_GROUP_CLUSTER_THRESHOLD)?;
        Ok(binarize(&t.img, t.thresh))
    };
    let group1 = mask_of("within_group1")?;
    let group2 = mask_of("within_group2")?;
    let mask = intersect_masks(&[group1.clone(), group2.clone()], 1.0)?;
    Ok(WithinGroupMasks { group1, group2, mask })
}

/// Between-group results of one pass
#[derive(Debug, Clone)]
pub struct PassResult {
    pub name: String,
    pub glm: GlmPass,
    pub fpr: ThresholdedContrast,
    pub fdr: ThresholdedContrast,
}

/// Second-level results of one seed and metric
#[derive(Debug, Clone)]
pub struct SecondLevelOutput {
    pub seed: String,
    pub metric: String,
    pub passes: Vec<PassResult>,
    pub within_group: Option<WithinGroupMasks>,
}

#[derive(Debug, Serialize)]
struct PassSummary<'a> {
    pass: &'a str,
    n_voxels: usize,
    dof: f64,
    fpr_alpha: f64,
    fpr_z_threshold: Option<f64>,
    fpr_clusters: &'a [ClusterRow],
    fdr_alpha: f64,
    fdr_z_threshold: Option<f64>,
    fdr_clusters: &'a [ClusterRow],
}

#[derive(Debug, Serialize)]
struct SeedSummary<'a> {
    seed: &'a str,
    metric: &'a str,
    passes: Vec<PassSummary<'a>>,
}

/// `_{metric}[_minLength{10 min}][_fsptMask][_corticalMask]_{YYYYMMDD}`
pub fn results_suffix(metric: &str, min_time: Option<f64>, flags: &MaskFlags, date: &str) -> String {
    let mut suffix = format!("_{}", metric);
    if let Some(m) = min_time {
        suffix.push_str(&format!("_minLength{}", (m * 10.0) as i64));
    }
    if flags.fspt {
        suffix.push_str("_fsptMask");
    }
    if flags.cortical {
        suffix.push_str("_corticalMask");
    }
    suffix.push('_');
    suffix.push_str(date);
    suffix
}

fn log_pass(seed: &str, pass: &PassResult, fpr_alpha: f64, fdr_alpha: f64) {
    info!(
        "{} {} clusters at p<{:.3} uncorrected:\n{}",
        seed,
        pass.name,
        fpr_alpha,
        format_clusters_table(&pass.fpr.table)
    );
    info!(
        "{} {} clusters at p<{:.2} FDR corrected:\n{}",
        seed,
        pass.name,
        fdr_alpha,
        format_clusters_table(&pass.fdr.table)
    );
}

fn plot_pass(ctx: &AnalysisContext, seed: &str, pass: &PassResult) -> Result<()> {
    let stat = &pass.glm.contrast("between")?.stat;
    let fpr = ctx.opts.fpr_threshold;
    let fdr = ctx.opts.fdr_threshold;
    let panel = |thresh: f64, label: String| StatMapOptions {
        title: Some(format!("{}_{}_{}", pass.name, seed, label)),
        threshold: if thresh.is_finite() { thresh } else { f64::MAX },
        ..Default::default()
    };
    let fig = StatMapFigure::new(vec![
        (stat, panel(pass.fpr.thresh, format!("contrast_fpr{}", fpr))),
        (stat, panel(pass.fdr.thresh, format!("contrast_fdr{}", fdr))),
    ]);
    save_figure(&fig, &ctx.figure_path(&format!("{}_{}_contrast_fpr{:.3}.svg", seed, pass.name, fpr)))
}

fn save_outputs(ctx: &AnalysisContext, out: &SecondLevelOutput, suffix: &str) -> Result<()> {
    let dir = ctx.layout.glm_dir();
    for pass in &out.passes {
        let between = pass.glm.contrast("between")?;
        between
            .stat
            .save(&dir.join(format!("{}_{}_between_stat{}.nii.gz", out.seed, pass.name, suffix)))?;
        between
            .z_score
            .save(&dir.join(format!("{}_{}_between_z{}.nii.gz", out.seed, pass.name, suffix)))?;
        pass.fpr
            .img
            .save(&dir.join(format!("{}_{}_between_fpr{}.nii.gz", out.seed, pass.name, suffix)))?;
    }
    if let Some(w) = &out.within_group {
        w.mask
            .save(&dir.join(format!("{}_within_group_mask{}.nii.gz", out.seed, suffix)))?;
    }
    Ok(())
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// First pass, optional within-group second pass, thresholds and reports
/// for every metric and merged seed
pub fn run_second_level(ctx: &AnalysisContext) -> Result<Vec<SecondLevelOutput>> {
    let cfg = ctx.layout.cfg;
    let opts = &ctx.opts;
    let mut outputs = Vec::new();

    for metric in &cfg.metrics {
        for seed in cfg.merged_seeds() {
            info!("Starting 2nd level analysis for {} subroi", seed);
            let t0 = Instant::now();

            let first = perform_second_level_analysis(ctx, &seed, metric, &[])?;
            info!("{} first pass in {:.2?}", seed, t0.elapsed());
            let mut glm_passes = vec![("first_pass".to_string(), first)];

            let within_group = if opts.use_within_group_mask {
                let masks = create_within_group_mask(&glm_passes[0].1, opts.within_group_threshold)?;
                let t_sp = Instant::now();
                let second = perform_second_level_analysis(ctx, &seed, metric, std::slice::from_ref(&masks.mask))?;
                info!("{} second pass in {:.2?}", seed, t_sp.elapsed());
                glm_passes.push(("second_pass".to_string(), second));
                Some(masks)
            } else {
                None
            };

            let t_thr = Instant::now();
            let mut passes = Vec::new();
            for (name, glm) in glm_passes {
                let z = &glm.contrast("between")?.z_score;
                let fpr = threshold_contrast(z, HeightControl::Fpr, opts.fpr_threshold, CLUSTER_THRESHOLD)?;
                let fdr = threshold_contrast(z, HeightControl::Fdr, opts.fdr_threshold, CLUSTER_THRESHOLD)?;
                let pass = PassResult { name, glm, fpr, fdr };
                log_pass(&seed, &pass, opts.fpr_threshold, opts.fdr_threshold);
                passes.push(pass);
            }
            info!("Thresholding and clustering took {:.2?}", t_thr.elapsed());

            if opts.figures() {
                for pass in &passes {
                    plot_pass(ctx, &seed, pass)?;
                }
            }
            info!("Finished 2nd level analysis for {} ROI in {:.2?}", seed, t0.elapsed());

            outputs.push(SecondLevelOutput { seed: seed.clone(), metric: metric.clone(), passes, within_group });
        }
    }

    if opts.save_outputs {
        let today = chrono::Local::now().format("%Y%m%d").to_string();
        for metric in &cfg.metrics {
            let outs: Vec<&SecondLevelOutput> = outputs.iter().filter(|o| &o.metric == metric).collect();
            let suffix = results_suffix(metric, opts.min_time_after_scrubbing, &opts.masks, &today);
            let summary: Vec<SeedSummary> = outs
                .iter()
                .map(|o| SeedSummary {
                    seed: &o.seed,
                    metric: &o.metric,
                    passes: o
                        .passes
                        .iter()
                        .map(|p| PassSummary {
                            pass: &p.name,
                            n_voxels: p.glm.n_voxels,
                            dof: p.glm.dof,
                            fpr_alpha: opts.fpr_threshold,
                            fpr_z_threshold: finite(p.fpr.thresh),
                            fpr_clusters: &p.fpr.table,
                            fdr_alpha: opts.fdr_threshold,
                            fdr_z_threshold: finite(p.fdr.thresh),
                            fdr_clusters: &p.fdr.table,
                        })
                        .collect(),
                })
                .collect();
            for o in &outs {
                save_outputs(ctx, o, &suffix)?;
            }
            let path = ctx.layout.glm_dir().join(format!("glm_results{}.json.gz", suffix));
            write_json_gz(&path, &summary)?;
            info!("Saved {}", path.display());
        }
    }
    Ok(outputs)
}

/// Within-group masks of the second pass, one figure per seed
pub fn plot_within_group_masks(ctx: &AnalysisContext, outputs: &[SecondLevelOutput]) -> Result<()> {
    let cfg = ctx.layout.cfg;
    let fpr = ctx.opts.within_group_threshold;
    for out in outputs {
        let Some(w) = &out.within_group else {
            continue;
        };
        let panel = |label: &str| StatMapOptions {
            title: Some(format!("{} {} p<{}", out.seed, label, fpr)),
            cut_coords: cfg.cut_coords.get(&out.seed).copied(),
            cmap: Colormap::Oranges,
            colorbar: false,
            symmetric: false,
            ..Default::default()
        };
        let fig = StatMapFigure::new(vec![
            (&w.group1, panel("within_group1")),
            (&w.group2, panel("within_group2")),
            (&w.mask, panel("within-group mask")),
        ]);
        save_figure(&fig, &ctx.figure_path(&format!("{}_{}_within_group_masks.svg", out.seed, out.metric)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(values: Vec<f64>) -> Volume {
        let n = values.len();
        let affine = [2.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        Volume::new(values, (n, 1, 1), (2.0, 2.0, 2.0), affine).unwrap()
    }

    #[test]
    fn test_glm_design_contrasts() {
        let (dm, contrasts) = glm_design(3, 2, false);
        assert_eq!(dm.n_rows(), 5);
        assert_eq!(contrasts[2], ("between".to_string(), vec![1.0, -1.0]));

        let (dm, contrasts) = glm_design(3, 2, true);
        assert_eq!((dm.n_rows(), dm.n_cols()), (10, 4));
        assert_eq!(contrasts.len(), 4);
        assert!(contrasts.iter().all(|(_, c)| c.len() == 4));
        assert_eq!(contrasts[3].0, "interaction");
    }

    #[test]
    fn test_paired_subjects() {
        let sessions = vec!["ses-pre".to_string(), "ses-post".to_string()];
        let maps = |names: &[&str]| -> Vec<PathBuf> {
            names.iter().map(|n| PathBuf::from(format!("/g/{}_gsr_corr.nii", n))).collect()
        };
        let balanced = maps(&["sub-01_ses-pre", "sub-02_ses-pre", "sub-01_ses-post", "sub-02_ses-post"]);
        assert_eq!(paired_subjects(&balanced, &sessions).unwrap(), 2);

        // an even count is not enough: sub-03 pre would be modelled as sub-01 post
        let unbalanced = maps(&["sub-01_ses-pre", "sub-02_ses-pre", "sub-03_ses-pre", "sub-01_ses-post"]);
        match paired_subjects(&unbalanced, &sessions) {
            Err(FcError::Shape(msg)) => assert!(msg.contains("sub-02") && msg.contains("sub-03")),
            other => panic!("expected a shape error, got {:?}", other),
        }

        let reordered = maps(&["sub-01_ses-pre", "sub-02_ses-pre", "sub-02_ses-post", "sub-01_ses-post"]);
        assert!(paired_subjects(&reordered, &sessions).is_err());
        assert!(paired_subjects(&balanced, &sessions[..1]).is_err());
    }

    #[test]
    fn test_results_suffix() {
        let flags = MaskFlags { fspt: true, ..Default::default() };
        assert_eq!(
            results_suffix("gsr", Some(5.5), &flags, "20240101"),
            "_gsr_minLength55_fsptMask_20240101"
        );
        assert_eq!(results_suffix("gsr", None, &MaskFlags::default(), "20240101"), "_gsr_20240101");
    }

    #[test]
    fn test_within_group_mask_is_intersection() {
        // one big positive cluster per group, overlapping on voxels 30..120
        let mut z1 = vec![0.0; 200];
        let mut z2 = vec![0.0; 200];
        z1[..120].iter_mut().for_each(|v| *v = 5.0);
        z2[30..160].iter_mut().for_each(|v| *v = 5.0);
        let maps = |z: Vec<f64>| ContrastMaps {
            kind: crate::stats::glm::ContrastKind::T,
            stat: grid(z.clone()),
            z_score: grid(z.clone()),
            p_value: grid(vec![0.0; z.len()]),
            effect_size: grid(z.clone()),
            effect_variance: grid(vec![1.0; z.len()]),
        };
        let pass = GlmPass {
            contrasts: BTreeMap::from([
                ("within_group1".to_string(), maps(z1)),
                ("within_group2".to_string(), maps(z2)),
            ]),
            n_voxels: 200,
            dof: 10.0,
            rank: 2,
        };
        let masks = create_within_group_mask(&pass, 0.005).unwrap();
        assert_eq!(masks.group1.data.iter().sum::<f64>(), 120.0);
        assert_eq!(masks.group2.data.iter().sum::<f64>(), 130.0);
        assert_eq!(masks.mask.data.iter().sum::<f64>(), 90.0);
        assert_eq!(masks.mask.data[30], 1.0);
        assert_eq!(masks.mask.data[10], 0.0);
    }

    #[test]
    fn test_threshold_contrast_tables() {
        let mut z = vec![0.0; 40];
        z[5..20].iter_mut().for_each(|v| *v = 4.0);
        z[25..27].iter_mut().for_each(|v| *v = -6.0);
        let t = threshold_contrast(&grid(z), HeightControl::Fpr, 0.001, CLUSTER_THRESHOLD).unwrap();
        // the two-voxel negative cluster is below the extent threshold
        assert_eq!(t.img.data.iter().filter(|&&v| v != 0.0).count(), 15);
        assert_eq!(t.table.iter().filter(|r| r.size_mm3.is_some()).count(), 1);
        assert_eq!(t.table[0].size_mm3, Some(15.0 * 8.0));
    }

    #[test]
    fn test_missing_contrast_is_an_error() {
        let pass = GlmPass { contrasts: BTreeMap::new(), n_voxels: 0, dof: 1.0, rank: 1 };
        assert!(pass.contrast("between").is_err());
    }
}
