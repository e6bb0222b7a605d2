//! The `analyze` stages, run in a fixed order

use std::time::Instant;

use chrono::Local;
use log::{info, warn};

use crate::analysis::non_parametric::{plot_within_mask_corr, run_non_parametric, NonParametricResults};
use crate::analysis::randomise::{plot_randomise_outputs, prep_fsl_randomise, use_randomise};
use crate::analysis::second_level::{plot_within_group_masks, run_second_level};
use crate::analysis::voi::{plot_alff, plot_voi_corr, summarize_alff};
use crate::analysis::{compute_fc_within_masks, compute_voi_corr, print_alff_stats, print_voi_stats};
use crate::analysis::{AnalysisContext, AnalysisOptions};
use crate::connectivity::alff::write_alff_table;
use crate::connectivity::{compute_alff, compute_seed_corr, create_local_sphere_within_cluster, merge_lr_hemis, unzip_correlation_maps};
use crate::error::{FcError, Result};
use crate::study::{load_stim_coords, load_subject_list, subjects_after_scrubbing, GroupTable, Layout};

/// Radius of the local spheres drawn at each subject's cluster peak (mm)
pub const LOCAL_SPHERE_RADIUS: f64 = 3.5;

/// Stage switches of `analyze`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stages {
    pub compute_seed_corr: bool,
    pub unzip_corr_maps: bool,
    pub merge_lr_hemis: bool,
    pub prep_fsl_randomise: bool,
    pub use_randomise: bool,
    pub run_second_level: bool,
    pub plot_within_group_masks: bool,
    pub compute_voi_corr: bool,
    pub non_parametric_analysis: bool,
    pub within_mask_corr: bool,
    pub compute_alff: bool,
    pub create_sphere_within_cluster: bool,
}

/// Subjects to process and the ones revoked by the scrubbing filter
pub fn select_subjects(layout: &Layout, subj: Option<&str>, min_time: Option<f64>) -> Result<(Vec<String>, Vec<String>)> {
    let cfg = layout.cfg;
    let subjs = match subj {
        Some(s) => vec![s.to_string()],
        None => load_subject_list(&cfg.proj_path(&cfg.subjects_file))?,
    };
    match min_time {
        Some(min) => subjects_after_scrubbing(&subjs, &cfg.sessions, &cfg.metrics, min, |s, ses, m| {
            layout.scrub_params_file(s, ses, m)
        }),
        None => Ok((subjs, Vec::new())),
    }
}

fn first_atlas(layout: &Layout) -> Result<String> {
    layout
        .cfg
        .atlases
        .first()
        .cloned()
        .ok_or_else(|| FcError::Config("no atlas configured".to_string()))
}

/// Run the selected stages for `subj`, or for every subject of the list
pub fn run_analysis(layout: Layout, opts: AnalysisOptions, stages: &Stages, subj: Option<&str>) -> Result<()> {
    let total = Instant::now();
    let cfg = layout.cfg;
    let groups = GroupTable::load(&cfg.proj_path(&cfg.groups_file))?;
    let (subjs, revoked) = select_subjects(&layout, subj, opts.min_time_after_scrubbing)?;
    info!("{} subjects selected, {} revoked", subjs.len(), revoked.len());
    let mut ctx = AnalysisContext { layout, opts, groups, subjs, revoked };
    let seeds = cfg.merged_seeds();
    let figures = ctx.opts.figures();

    if stages.compute_seed_corr {
        let start = Instant::now();
        compute_seed_corr(&ctx.layout, &ctx.subjs)?;
        info!("Seed correlation maps computed in {:.2?}", start.elapsed());
    }

    if stages.unzip_corr_maps {
        let hemi_seeds: Vec<String> = cfg.seeds.iter().map(|s| s.name.clone()).collect();
        let n = unzip_correlation_maps(
            &ctx.layout,
            &ctx.subjs,
            &ctx.groups,
            &hemi_seeds,
            &cfg.sessions,
            &cfg.metrics,
            &cfg.atlases,
        )?;
        info!("{} correlation maps unzipped", n);
    }

    if stages.merge_lr_hemis {
        let atlas = first_atlas(&ctx.layout)?;
        let merged = merge_lr_hemis(&ctx.layout, &mut ctx.subjs, &ctx.groups, &seeds, &cfg.sessions, &cfg.metrics, &atlas)?;
        if stages.prep_fsl_randomise {
            prep_fsl_randomise(&ctx, &merged)?;
        }
    } else if stages.prep_fsl_randomise {
        warn!("FSL randomise inputs are prepared from merged hemispheres only, add --merge-lr-hemis");
    }

    if stages.use_randomise {
        let date = Local::now().format("%d%m%Y").to_string();
        for seed in &seeds {
            for metric in &cfg.metrics {
                let stem = use_randomise(&ctx, seed, metric, &date)?;
                if figures {
                    plot_randomise_outputs(&ctx, seed, &stem)?;
                }
            }
        }
    }

    if stages.run_second_level {
        let outputs = run_second_level(&ctx)?;
        if stages.plot_within_group_masks {
            plot_within_group_masks(&ctx, &outputs)?;
        }
    }

    if stages.compute_voi_corr {
        let records = compute_voi_corr(&ctx)?;
        print_voi_stats(&ctx, &records);
        if figures {
            plot_voi_corr(&ctx, &records)?;
        }
    }

    let mut np_results: Option<NonParametricResults> = None;
    if stages.non_parametric_analysis {
        np_results = Some(run_non_parametric(&ctx)?);
    }

    if stages.within_mask_corr {
        let results = np_results.as_ref().ok_or_else(|| {
            FcError::Config("--within-mask-corr needs the masks of --non-parametric-analysis".to_string())
        })?;
        let records = compute_fc_within_masks(&ctx, results)?;
        if figures {
            plot_within_mask_corr(&ctx, &records)?;
        }
    }

    if stages.compute_alff {
        let start = Instant::now();
        let coords = load_stim_coords(&cfg.proj_path(&cfg.stim_coords_file))?;
        let records = compute_alff(&ctx.layout, &ctx.subjs, &coords, ctx.opts.stim_radius)?;
        let summary = summarize_alff(&records, &ctx.groups);
        print_alff_stats(&summary, &cfg.sessions);
        if figures {
            plot_alff(&ctx, &summary)?;
        }
        if ctx.opts.save_outputs {
            write_alff_table(&ctx.layout.alff_table(), &records)?;
        }
        info!("ALFF computed in {:.2?}", start.elapsed());
    }

    if stages.create_sphere_within_cluster {
        let pairs: Vec<(String, String)> = cfg.cluster_vois.iter().map(|(s, v)| (s.clone(), v.clone())).collect();
        if pairs.is_empty() {
            warn!("no cluster VOIs configured, no local spheres created");
        } else {
            let atlas = first_atlas(&ctx.layout)?;
            let written = create_local_sphere_within_cluster(
                &ctx.layout,
                &ctx.subjs,
                &ctx.groups,
                &pairs,
                &cfg.metrics,
                &atlas,
                LOCAL_SPHERE_RADIUS,
            )?;
            info!("{} local sphere masks written", written.len());
        }
    }

    info!("Analysis finished in {:.2?}", total.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StudyConfig;

    #[test]
    fn test_select_single_subject() {
        let cfg = StudyConfig::default();
        let layout = Layout::new(&cfg, Some(8.0), "Harrison2009");
        let (subjs, revoked) = select_subjects(&layout, Some("sub-patient01"), None).unwrap();
        assert_eq!(subjs, vec!["sub-patient01".to_string()]);
        assert!(revoked.is_empty());
    }

    #[test]
    fn test_scrubbing_revokes_missing_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StudyConfig { proj_dir: dir.path().to_path_buf(), ..Default::default() };
        let layout = Layout::new(&cfg, Some(8.0), "Harrison2009");
        let (subjs, revoked) = select_subjects(&layout, Some("sub-patient01"), Some(5.0)).unwrap();
        assert!(subjs.is_empty());
        assert_eq!(revoked, vec!["sub-patient01".to_string()]);
    }

    #[test]
    fn test_within_mask_corr_requires_non_parametric() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/groups.txt"), "subj group\nsub-01 group1\n").unwrap();
        let cfg = StudyConfig { proj_dir: dir.path().to_path_buf(), ..Default::default() };
        let layout = Layout::new(&cfg, Some(8.0), "Harrison2009");
        let stages = Stages { within_mask_corr: true, ..Default::default() };
        let err = run_analysis(layout, AnalysisOptions::default(), &stages, Some("sub-01")).unwrap_err();
        assert!(matches!(err, FcError::Config(_)));
    }
}
