//! Command line: `seedfc analyze` and `seedfc visuals`

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use crate::analysis::{run_analysis, AnalysisOptions, MaskFlags, Stages};
use crate::config::StudyConfig;
use crate::error::{FcError, Result};
use crate::stats::DesignOptions;
use crate::study::Layout;
use crate::surface::{run_visuals, Camera, VisualsOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Study configuration (JSON); built-in defaults when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Overrides the project directory of the configuration
    #[arg(long, global = true)]
    pub proj_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seed-to-voxel connectivity and group-level inference
    Analyze(AnalyzeArgs),
    /// Stimulation VOI, surface rendering, point plots and pre/post statistics
    Visuals(VisualsArgs),
}

/// Brain smoothing FWHM in mm; `None` disables smoothing
pub fn parse_fwhm(s: &str) -> std::result::Result<Fwhm, String> {
    if s.eq_ignore_ascii_case("none") {
        return Ok(Fwhm(None));
    }
    s.parse::<f64>()
        .map(|f| Fwhm(Some(f)))
        .map_err(|_| format!("'{}' is neither a number nor None", s))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fwhm(pub Option<f64>);

/// Error rate strictly between 0 and 1
pub fn parse_alpha(s: &str) -> std::result::Result<f64, String> {
    let alpha: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if alpha > 0.0 && alpha < 1.0 {
        Ok(alpha)
    } else {
        Err(format!("{} is not between 0 and 1", alpha))
    }
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Save figures
    #[arg(long)]
    pub save_figs: bool,
    /// Save tables and maps
    #[arg(long)]
    pub save_outputs: bool,
    /// Plot figures
    #[arg(long)]
    pub plot_figs: bool,
    /// Seed definition family (Harrison2009, TianS4, ...)
    #[arg(long, default_value = "Harrison2009")]
    pub seed_type: String,
    /// Process a single subject instead of the subject list
    #[arg(long)]
    pub subj: Option<String>,
    /// Number of parallel workers
    #[arg(long, default_value_t = 10)]
    pub n_jobs: usize,
    /// Minimum minutes of data left after scrubbing (keep everyone when omitted)
    #[arg(long)]
    pub min_time_after_scrubbing: Option<f64>,
    #[arg(long, default_value = "8", value_parser = parse_fwhm)]
    pub brain_smoothing_fwhm: Fwhm,

    /// (Re)compute seed to voxel correlations
    #[arg(long)]
    pub compute_seed_corr: bool,
    /// Unzip correlation maps for SPM
    #[arg(long)]
    pub unzip_corr_maps: bool,
    /// Merge the hemispheres' correlation maps
    #[arg(long = "merge-lr-hemis")]
    pub merge_lr_hemis: bool,
    /// Prepare 4D images for FSL randomise (needs --merge-lr-hemis)
    #[arg(long)]
    pub prep_fsl_randomise: bool,
    /// Run FSL randomise
    #[arg(long)]
    pub use_randomise: bool,
    /// Run the second-level GLM
    #[arg(long)]
    pub run_second_level: bool,
    /// Plot the within-group masks of the second pass
    #[arg(long)]
    pub plot_within_group_masks: bool,
    /// Seed to stimulation VOI correlation and statistics
    #[arg(long)]
    pub compute_voi_corr: bool,
    /// Between-group analysis with permutation inference
    #[arg(long)]
    pub non_parametric_analysis: bool,
    /// FC within the non-parametric group masks (needs --non-parametric-analysis)
    #[arg(long)]
    pub within_mask_corr: bool,
    /// ALFF and fALFF at the stimulation sites
    #[arg(long = "compute-alff")]
    pub compute_alff: bool,
    /// Local spheres at the FC peak within cluster VOIs
    #[arg(long)]
    pub create_sphere_within_cluster: bool,

    /// Grey matter mask for the second level
    #[arg(long)]
    pub use_gm_mask: bool,
    /// Fronto-striato-pallido-thalamic mask for the second level
    #[arg(long)]
    pub use_fspt_mask: bool,
    #[arg(long)]
    pub use_cortical_mask: bool,
    #[arg(long)]
    pub use_frontal_mask: bool,
    /// Seed-specific frontal pathway mask
    #[arg(long)]
    pub use_seed_specific_mask: bool,
    /// Restrict the between-group test to the union of within-group masks
    #[arg(long)]
    pub use_within_group_mask: bool,
    /// Within-group masks produced with SPM
    #[arg(long = "use-spm-mask")]
    pub use_spm_mask: bool,

    #[arg(long, default_value_t = 0.05, value_parser = parse_alpha)]
    pub fdr_threshold: f64,
    #[arg(long, default_value_t = 0.001, value_parser = parse_alpha)]
    pub fpr_threshold: f64,
    /// FPR threshold of the within-group masks
    #[arg(long, default_value_t = 0.005, value_parser = parse_alpha)]
    pub within_group_threshold: f64,
    #[arg(long)]
    pub two_sided_within_group: bool,
    #[arg(long)]
    pub two_sided_between_group: bool,
    #[arg(long, default_value_t = 5000)]
    pub n_perm: usize,
    /// T threshold of randomise cluster mode
    #[arg(long, default_value_t = 4.0)]
    pub cluster_thresh: f64,
    /// Threshold-free cluster enhancement in randomise
    #[arg(long = "use-tfce")]
    pub use_tfce: bool,
    /// t-test direction group1 > group2 in randomise
    #[arg(long = "ocd-minus-hc", conflicts_with = "hc_minus_ocd")]
    pub ocd_minus_hc: bool,
    /// t-test direction group2 > group1 in randomise (default direction)
    #[arg(long = "hc-minus-ocd")]
    pub hc_minus_ocd: bool,
    /// Four-column design with group by session interaction
    #[arg(long)]
    pub group_by_session: bool,
    #[arg(long)]
    pub paired_design: bool,
    /// Stimulation site radius (mm)
    #[arg(long, default_value_t = 5.0)]
    pub stim_radius: f64,
    /// Log external commands instead of running them
    #[arg(long)]
    pub dry_run: bool,
}

impl AnalyzeArgs {
    pub fn options(&self) -> AnalysisOptions {
        AnalysisOptions {
            masks: MaskFlags {
                gm: self.use_gm_mask,
                fspt: self.use_fspt_mask,
                cortical: self.use_cortical_mask,
                frontal: self.use_frontal_mask,
                seed_specific: self.use_seed_specific_mask,
            },
            design: DesignOptions {
                group_by_session: self.group_by_session,
                paired: self.paired_design,
                ocd_minus_hc: self.ocd_minus_hc,
            },
            fdr_threshold: self.fdr_threshold,
            fpr_threshold: self.fpr_threshold,
            within_group_threshold: self.within_group_threshold,
            use_within_group_mask: self.use_within_group_mask,
            use_spm_mask: self.use_spm_mask,
            two_sided_within_group: self.two_sided_within_group,
            two_sided_between_group: self.two_sided_between_group,
            n_perm: self.n_perm,
            n_jobs: self.n_jobs,
            cluster_thresh: self.cluster_thresh,
            use_tfce: self.use_tfce,
            min_time_after_scrubbing: self.min_time_after_scrubbing,
            stim_radius: self.stim_radius,
            save_outputs: self.save_outputs,
            save_figs: self.save_figs,
            plot_figs: self.plot_figs,
            dry_run: self.dry_run,
        }
    }

    pub fn stages(&self) -> Stages {
        Stages {
            compute_seed_corr: self.compute_seed_corr,
            unzip_corr_maps: self.unzip_corr_maps,
            merge_lr_hemis: self.merge_lr_hemis,
            prep_fsl_randomise: self.prep_fsl_randomise,
            use_randomise: self.use_randomise,
            run_second_level: self.run_second_level,
            plot_within_group_masks: self.plot_within_group_masks,
            compute_voi_corr: self.compute_voi_corr,
            non_parametric_analysis: self.non_parametric_analysis,
            within_mask_corr: self.within_mask_corr,
            compute_alff: self.compute_alff,
            create_sphere_within_cluster: self.create_sphere_within_cluster,
        }
    }
}

#[derive(Args, Debug)]
pub struct VisualsArgs {
    #[arg(long)]
    pub plot_figs: bool,
    #[arg(long)]
    pub save_figs: bool,
    #[arg(long)]
    pub save_outputs: bool,
    /// Surface template; only the ICBM152 BrainNet meshes are available
    #[arg(long, default_value = "icbm")]
    pub surface_template: String,
    /// Create the stimulation site VOI (mean of spheres at every site)
    #[arg(long)]
    pub create_stim_voi: bool,
    #[arg(long, default_value_t = 5.0)]
    pub stim_radius: f64,
    /// Render the surface mesh with the configured layers
    #[arg(long)]
    pub plot_surface: bool,
    #[arg(long)]
    pub smoothed_surface: bool,
    /// Camera preset: front or medial
    #[arg(long, default_value = "front")]
    pub camera: String,
    /// Small balls at the stimulation sites
    #[arg(long)]
    pub show_stim_balls: bool,
    #[arg(long, default_value_t = 2.0)]
    pub stim_balls_radius: f64,
    /// Scaling of the ball coordinates towards the mesh
    #[arg(long, default_value_t = 1.0)]
    pub stim_balls_scaling: f64,
    /// Longitudinal point plots of seed to stimulation FC and fALFF
    #[arg(long)]
    pub plot_pointplot: bool,
    /// Pre vs post statistics of FC, fALFF and YBOCS
    #[arg(long)]
    pub print_stats: bool,
    /// Seed of the summarised connectivity
    #[arg(long, default_value = "Acc")]
    pub seed: String,
    #[arg(long, default_value = "Harrison2009")]
    pub seed_type: String,
    #[arg(long, default_value = "8", value_parser = parse_fwhm)]
    pub brain_smoothing_fwhm: Fwhm,
}

impl VisualsArgs {
    pub fn options(&self) -> Result<VisualsOptions> {
        if self.surface_template != "icbm" {
            return Err(FcError::Config(format!("unsupported surface template '{}'", self.surface_template)));
        }
        Ok(VisualsOptions {
            create_stim_voi: self.create_stim_voi,
            stim_radius: self.stim_radius,
            plot_surface: self.plot_surface,
            smoothed_surface: self.smoothed_surface,
            camera: self.camera.parse::<Camera>()?,
            show_stim_balls: self.show_stim_balls,
            stim_balls_radius: self.stim_balls_radius,
            stim_balls_scaling: self.stim_balls_scaling,
            plot_pointplot: self.plot_pointplot,
            print_stats: self.print_stats,
            seed: self.seed.clone(),
            save_outputs: self.save_outputs,
            save_figs: self.save_figs,
            plot_figs: self.plot_figs,
        })
    }
}

fn init_thread_pool(n_jobs: usize) {
    if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(n_jobs.max(1)).build_global() {
        warn!("could not size the thread pool to {}: {}", n_jobs, e);
    }
}

/// Load the configuration and dispatch the subcommand
pub fn run(cli: Cli) -> Result<()> {
    let mut cfg = StudyConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.proj_dir {
        cfg.proj_dir = dir;
    }
    info!("Project directory {}", cfg.proj_dir.display());

    match cli.command {
        Commands::Analyze(args) => {
            init_thread_pool(args.n_jobs);
            let layout = Layout::new(&cfg, args.brain_smoothing_fwhm.0, &args.seed_type);
            run_analysis(layout, args.options(), &args.stages(), args.subj.as_deref())
        }
        Commands::Visuals(args) => {
            let opts = args.options()?;
            let layout = Layout::new(&cfg, args.brain_smoothing_fwhm.0, &args.seed_type);
            run_visuals(&layout, &opts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(args: &[&str]) -> AnalyzeArgs {
        let cli = Cli::try_parse_from([&["seedfc", "analyze"][..], args].concat()).unwrap();
        match cli.command {
            Commands::Analyze(a) => a,
            Commands::Visuals(_) => panic!("expected analyze"),
        }
    }

    #[test]
    fn test_analyze_defaults() {
        let a = analyze(&[]);
        assert_eq!(a.n_perm, 5000);
        assert_eq!(a.brain_smoothing_fwhm, Fwhm(Some(8.0)));
        assert_eq!(a.options(), AnalysisOptions::default());
        assert_eq!(a.stages(), Stages::default());
    }

    #[test]
    fn test_analyze_flags() {
        let a = analyze(&[
            "--run-second-level",
            "--use-gm-mask",
            "--group-by-session",
            "--brain-smoothing-fwhm",
            "None",
            "--n-perm",
            "100",
            "--use-tfce",
            "--compute-alff",
        ]);
        assert_eq!(a.brain_smoothing_fwhm, Fwhm(None));
        let opts = a.options();
        assert!(opts.masks.gm && opts.design.group_by_session && opts.use_tfce);
        assert_eq!(opts.n_perm, 100);
        let stages = a.stages();
        assert!(stages.run_second_level && stages.compute_alff && !stages.use_randomise);
    }

    #[test]
    fn test_direction_flags_conflict() {
        assert!(Cli::try_parse_from(["seedfc", "analyze", "--ocd-minus-hc", "--hc-minus-ocd"]).is_err());
        assert!(Cli::try_parse_from(["seedfc", "analyze", "--brain-smoothing-fwhm", "wide"]).is_err());
    }

    #[test]
    fn test_alphas_are_range_checked() {
        for flag in ["--fdr-threshold", "--fpr-threshold", "--within-group-threshold"] {
            for bad in ["-0.01", "0", "1", "1.5", "p"] {
                assert!(Cli::try_parse_from(["seedfc", "analyze", flag, bad]).is_err(), "{} {}", flag, bad);
            }
        }
        let a = analyze(&["--fpr-threshold", "0.01"]);
        assert_eq!(a.options().fpr_threshold, 0.01);
    }

    #[test]
    fn test_visuals_options() {
        let cli = Cli::try_parse_from(["seedfc", "--proj-dir", "/data", "visuals", "--camera", "medial", "--plot-surface"]).unwrap();
        assert_eq!(cli.proj_dir, Some(PathBuf::from("/data")));
        let Commands::Visuals(v) = cli.command else { panic!("expected visuals") };
        let opts = v.options().unwrap();
        assert_eq!(opts.camera, Camera::MEDIAL);
        assert!(opts.plot_surface);
        assert_eq!(opts.stim_balls_radius, 2.0);

        let cli = Cli::try_parse_from(["seedfc", "visuals", "--surface-template", "fsaverage"]).unwrap();
        let Commands::Visuals(v) = cli.command else { panic!("expected visuals") };
        assert!(v.options().is_err());
    }
}
