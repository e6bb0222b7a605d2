//! Permutation-based group inference
//!
//! Within-group masks come from one-sample sign-flip tests of each group;
//! the between-group test permutes the group labels inside the chosen mask.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::second_level::mask_imgs;
use crate::analysis::{write_csv, AnalysisContext};
use crate::error::{FcError, Result};
use crate::plot::{save_figure, ChartGrid, ChartOptions, ChartPanel, Observation, PanelKind, StatMapFigure, StatMapOptions};
use crate::plot::named_color;
use crate::stats::permutation::{non_parametric_inference, PermutationOptions};
use crate::study::{GROUP1, GROUP2};
use crate::utils::mask::{binarize, intersect_masks, resample_masks};
use crate::volume::Volume;

/// `-log10 p` map of the between-group test and the mask it ran in
#[derive(Debug, Clone)]
pub struct NonParametricResult {
    pub seed: String,
    pub metric: String,
    pub neg_log_pvals: Volume,
    pub mask: Option<Volume>,
}

/// `(metric, seed)` -> result
pub type NonParametricResults = BTreeMap<(String, String), NonParametricResult>;

/// `non_parametric[_within2tailed][_between2tailed]`
pub fn results_suffix(two_sided_within: bool, two_sided_between: bool) -> String {
    let mut suffix = "non_parametric".to_string();
    if two_sided_within {
        suffix.push_str("_within2tailed");
    }
    if two_sided_between {
        suffix.push_str("_between2tailed");
    }
    suffix
}

fn permutation_options(ctx: &AnalysisContext, two_sided: bool) -> PermutationOptions {
    PermutationOptions {
        n_perm: ctx.opts.n_perm,
        two_sided,
        model_intercept: true,
        random_state: ctx.layout.cfg.random_state,
        n_jobs: ctx.opts.n_jobs.max(1),
    }
}

/// Group label column: +1 for the first group, -1 for the second
pub fn group_difference_column(n1: usize, n2: usize) -> Vec<f64> {
    std::iter::repeat(1.0).take(n1).chain(std::iter::repeat(-1.0).take(n2)).collect()
}

/// Union of the voxels with any within-group effect in either group
pub fn compute_non_parametric_within_groups_mask(
    ctx: &AnalysisContext,
    group1_files: &[PathBuf],
    group2_files: &[PathBuf],
    seed: &str,
) -> Result<Volume> {
    let opts = permutation_options(ctx, ctx.opts.two_sided_within_group);
    let mut masks = Vec::with_capacity(2);
    for files in [group1_files, group2_files] {
        let masked = mask_imgs(ctx.layout.cfg, files, &[], seed, &ctx.opts.masks)?;
        let ones = vec![1.0; masked.imgs.len()];
        let neg_log_pvals = non_parametric_inference(&masked.imgs, &ones, masked.mask.as_ref(), &opts)?;
        masks.push(binarize(&neg_log_pvals, 0.0));
    }
    intersect_masks(&resample_masks(&masks)?, 0.0)
}

/// Between-group permutation test of one seed and metric
pub fn non_parametric_analysis(ctx: &AnalysisContext, seed: &str, metric: &str) -> Result<NonParametricResult> {
    let (g1, g2, all) = ctx.layout.file_lists(metric, seed, false, &ctx.revoked)?;
    if g1.is_empty() || g2.is_empty() {
        return Err(FcError::Stats(format!(
            "{} {}: permutation test needs maps in both groups ({} and {})",
            seed,
            metric,
            g1.len(),
            g2.len()
        )));
    }

    let (imgs, mask) = if ctx.opts.use_spm_mask {
        let path = ctx.layout.spm_mask_file(metric, seed);
        let mask = Volume::load(&path)?;
        let imgs = all.iter().map(|f| Volume::load(f)).collect::<Result<Vec<_>>>()?;
        (imgs, Some(mask))
    } else if ctx.opts.use_within_group_mask {
        let mask = compute_non_parametric_within_groups_mask(ctx, &g1, &g2, seed)?;
        let imgs = all.iter().map(|f| Volume::load(f)).collect::<Result<Vec<_>>>()?;
        (imgs, Some(mask))
    } else {
        let masked = mask_imgs(ctx.layout.cfg, &all, &[], seed, &ctx.opts.masks)?;
        (masked.imgs, masked.mask)
    };

    let column = group_difference_column(g1.len(), g2.len());
    let opts = permutation_options(ctx, ctx.opts.two_sided_between_group);
    info!("{} {}: {} permutations over {} maps", seed, metric, opts.n_perm, imgs.len());
    let neg_log_pvals = non_parametric_inference(&imgs, &column, mask.as_ref(), &opts)?;
    Ok(NonParametricResult { seed: seed.to_string(), metric: metric.to_string(), neg_log_pvals, mask })
}

/// Between-group tests for every metric and merged seed, with figures and
/// saved maps as requested
pub fn run_non_parametric(ctx: &AnalysisContext) -> Result<NonParametricResults> {
    let suffix = results_suffix(ctx.opts.two_sided_within_group, ctx.opts.two_sided_between_group);
    let mut results = NonParametricResults::new();
    for metric in &ctx.layout.cfg.metrics {
        for seed in ctx.layout.cfg.merged_seeds() {
            let res = non_parametric_analysis(ctx, &seed, metric)?;
            if ctx.opts.figures() {
                plot_non_param_maps(ctx, &res, &suffix)?;
            }
            if ctx.opts.save_outputs {
                save_outputs(ctx, &res, &suffix)?;
            }
            results.insert((metric.clone(), seed), res);
        }
    }
    Ok(results)
}

pub fn plot_non_param_maps(ctx: &AnalysisContext, res: &NonParametricResult, suffix: &str) -> Result<()> {
    let opts = StatMapOptions {
        title: Some(format!("{} {}", res.seed, suffix)),
        threshold: 0.2,
        ..Default::default()
    };
    let fig = StatMapFigure::new(vec![(&res.neg_log_pvals, opts)]);
    save_figure(&fig, &ctx.figure_path(&format!("{}_{}.svg", res.seed, suffix)))
}

fn save_outputs(ctx: &AnalysisContext, res: &NonParametricResult, suffix: &str) -> Result<()> {
    let dir = ctx.layout.non_parametric_dir().join(&res.metric);
    res.neg_log_pvals
        .save(&dir.join(format!("{}_{}_neg_log_pvals.nii.gz", res.seed, suffix)))?;
    if let Some(mask) = &res.mask {
        mask.save(&dir.join(format!("{}_{}_mask.nii.gz", res.seed, suffix)))?;
    }
    Ok(())
}

/// One voxel of a subject map inside the between-group mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskCorrRecord {
    pub subj: String,
    pub ses: String,
    pub metric: String,
    pub atlas: String,
    pub fwhm: String,
    pub group: String,
    pub seed: String,
    pub corr: f64,
}

/// Every non-zero FC value inside the mask each between-group test ran in
pub fn compute_fc_within_masks(ctx: &AnalysisContext, results: &NonParametricResults) -> Result<Vec<MaskCorrRecord>> {
    let cfg = ctx.layout.cfg;
    let fwhm = ctx.layout.fwhm_tag();
    let mut records = Vec::new();
    for atlas in &cfg.atlases {
        for metric in &cfg.metrics {
            for subj in &ctx.subjs {
                let Some(group) = ctx.groups.group_of(subj) else {
                    warn!("{} has no group, skipped", subj);
                    continue;
                };
                for seed in cfg.merged_seeds() {
                    let Some(mask) = results
                        .get(&(metric.clone(), seed.clone()))
                        .and_then(|r| r.mask.as_ref())
                    else {
                        continue;
                    };
                    for ses in &cfg.sessions {
                        let path = ctx.layout.group_map_file(subj, ses, metric, atlas, &seed, group);
                        if !path.exists() {
                            warn!("missing {}", path.display());
                            continue;
                        }
                        let corr = Volume::load(&path)?;
                        let mask = mask.resample_nearest(&corr)?;
                        for (&c, &m) in corr.data.iter().zip(&mask.data) {
                            let v = c * m;
                            if v != 0.0 && v.is_finite() {
                                records.push(MaskCorrRecord {
                                    subj: subj.clone(),
                                    ses: ses.clone(),
                                    metric: metric.clone(),
                                    atlas: atlas.clone(),
                                    fwhm: fwhm.clone(),
                                    group: group.to_string(),
                                    seed: seed.clone(),
                                    corr: v,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
    if ctx.opts.save_outputs {
        write_csv(&ctx.layout.mask_within_corr_table(), &records)?;
    }
    Ok(records)
}

/// Box plots of the within-mask FC by group, one panel per seed
pub fn within_mask_corr_chart(records: &[MaskCorrRecord], seeds: &[String]) -> ChartGrid {
    let palette = ["lightgrey", "darkgrey"].iter().filter_map(|c| named_color(c)).collect::<Vec<_>>();
    let panels = seeds
        .iter()
        .map(|seed| {
            let mut obs: Vec<Observation> = records
                .iter()
                .filter(|r| &r.seed == seed)
                .map(|r| Observation::new(&r.seed, &r.group, r.corr.clamp(-1.0, 1.0)))
                .collect();
            // group1 first whatever the record order
            obs.sort_by_key(|o| if o.hue == GROUP1 { 0 } else if o.hue == GROUP2 { 1 } else { 2 });
            ChartPanel {
                kind: PanelKind::Box(obs),
                opts: ChartOptions {
                    title: Some(seed.clone()),
                    y_label: Some("corr".to_string()),
                    palette: palette.clone(),
                    ..Default::default()
                },
            }
        })
        .collect();
    ChartGrid { panel_size: (300, 400), ..ChartGrid::new(1, seeds.len(), panels) }
}

pub fn plot_within_mask_corr(ctx: &AnalysisContext, records: &[MaskCorrRecord]) -> Result<()> {
    let fig = within_mask_corr_chart(records, &ctx.layout.cfg.merged_seeds());
    save_figure(&fig, &ctx.figure_path("seed_to_mask_corr_3seeds.svg"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_suffix() {
        assert_eq!(results_suffix(false, false), "non_parametric");
        assert_eq!(results_suffix(true, false), "non_parametric_within2tailed");
        assert_eq!(results_suffix(true, true), "non_parametric_within2tailed_between2tailed");
    }

    #[test]
    fn test_group_difference_column() {
        assert_eq!(group_difference_column(2, 3), vec![1.0, 1.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_within_mask_corr_chart_layout() {
        let rec = |seed: &str, group: &str, corr: f64| MaskCorrRecord {
            subj: "sub-01".into(),
            ses: "ses-pre".into(),
            metric: "gsr".into(),
            atlas: "Harrison2009".into(),
            fwhm: "brainFWHM8mm".into(),
            group: group.into(),
            seed: seed.into(),
            corr,
        };
        let records = vec![rec("Acc", "group2", 0.2), rec("Acc", "group1", 3.0), rec("dPut", "group1", -0.1)];
        let grid = within_mask_corr_chart(&records, &["Acc".to_string(), "dPut".to_string()]);
        assert_eq!((grid.rows, grid.cols), (1, 2));
        match &grid.panels[0].kind {
            PanelKind::Box(obs) => {
                assert_eq!(obs.len(), 2);
                assert_eq!(obs[0].hue, "group1");
                // clipped to the correlation range
                assert_eq!(obs[0].value, 1.0);
            }
            other => panic!("unexpected panel {:?}", other),
        }
    }
}
