//! FSL randomise: input preparation, command line and output figures
//!
//! The `randomise` binary is not bundled. It is called through
//! [`std::process::Command`] and `--dry-run` only logs the command.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::{error, info, warn};

use crate::analysis::second_level::{mask_imgs, subjects_per_group};
use crate::analysis::AnalysisContext;
use crate::connectivity::MergedFiles;
use crate::error::{FcError, Result};
use crate::plot::{save_figure, Colormap, StatMapFigure, StatMapOptions};
use crate::stats::design::{
    column_rows, create_contrast_vector, create_design_matrix, write_text_matrix, write_vest, ContrastSet,
};
use crate::stats::multitest::fdr_bh;
use crate::utils::mask::{apply_mask, binarize};
use crate::volume::{Series, Volume};

/// 4-D GM-masked stack of the merged maps of every seed and metric, plus
/// the two-group design matrix and contrast
pub fn prep_fsl_randomise(ctx: &AnalysisContext, merged: &MergedFiles) -> Result<()> {
    let cfg = ctx.layout.cfg;
    let gm = binarize(&Volume::load(&cfg.baseline_path(&cfg.template_masks.gm))?, 0.0);

    for ((seed, metric), files) in merged {
        let vols: Vec<Volume> = files
            .iter()
            .map(|f| Volume::load(f).and_then(|v| apply_mask(&v, &gm)))
            .collect::<Result<_>>()?;
        let stack = Series::from_volumes(&vols)?;
        let out = ctx
            .layout
            .metric_dir(metric)
            .join(format!("masked_resampled_pairedT4D_{}.nii.gz", seed));
        stack.save(&out)?;
        info!("Saved {} ({} volumes)", out.display(), stack.n_vols);

        let (g1, g2, _) = ctx.layout.file_lists(metric, seed, false, &ctx.revoked)?;
        let dm = create_design_matrix(g1.len(), g2.len(), &Default::default());
        let dir = ctx.layout.metric_dir(metric);
        write_text_matrix(&dir.join("design_mat"), &dm.to_int_rows())?;
        write_text_matrix(&dir.join("design_con"), &[vec![1, -1]])?;
    }
    Ok(())
}

/// Contrast suffix plus `_permuteBlocks_{ddmmYYYY}`
pub fn randomise_suffix(contrasts: &ContrastSet, date: &str) -> String {
    format!("{}_permuteBlocks_{}", contrasts.suffix, date)
}

/// Output basename handed to `randomise -o`
pub fn output_stem(seed: &str, n_perm: usize, use_tfce: bool, cluster_thresh: f64, suffix: &str) -> String {
    if use_tfce {
        format!("{}_outputs_n{}_TFCE{}", seed, n_perm, suffix)
    } else {
        format!("{}_outputs_n{}_c{}{}", seed, n_perm, (cluster_thresh * 10.0) as i64, suffix)
    }
}

/// Input and design files of one randomise run
#[derive(Debug, Clone, PartialEq)]
pub struct RandomiseFiles {
    pub input: PathBuf,
    pub output: PathBuf,
    pub mask: PathBuf,
    pub design_mat: PathBuf,
    pub design_con: PathBuf,
    pub design_fts: PathBuf,
    pub design_grp: PathBuf,
}

impl RandomiseFiles {
    pub fn new(dir: &Path, seed: &str, stem: &str, suffix: &str) -> Self {
        Self {
            input: dir.join(format!("{}_imgs_4D.nii.gz", seed)),
            output: dir.join(stem),
            mask: dir.join(format!("{}_pathway_mask{}.nii.gz", seed, suffix)),
            design_mat: dir.join("design.mat"),
            design_con: dir.join("design.con"),
            design_fts: dir.join("design.fts"),
            design_grp: dir.join("design.grp"),
        }
    }
}

/// Arguments of the randomise call
///
/// TFCE runs F-tests with exchangeability blocks; cluster mode thresholds
/// the t statistics at `cluster_thresh`.
pub fn randomise_args(files: &RandomiseFiles, n_perm: usize, use_tfce: bool, cluster_thresh: f64) -> Vec<String> {
    let path = |p: &Path| p.to_string_lossy().into_owned();
    let mut args = vec![
        "-i".to_string(),
        path(&files.input),
        "-o".to_string(),
        path(&files.output),
        "-d".to_string(),
        path(&files.design_mat),
        "-t".to_string(),
        path(&files.design_con),
    ];
    if use_tfce {
        args.extend([
            "-f".to_string(),
            path(&files.design_fts),
            "-e".to_string(),
            path(&files.design_grp),
        ]);
    }
    args.extend(["-m".to_string(), path(&files.mask), "-n".to_string(), n_perm.to_string()]);
    if use_tfce {
        args.extend(["-T", "--uncorrp", "--permuteBlocks"].map(String::from));
    } else {
        args.extend(["-c".to_string(), cluster_thresh.to_string(), "--uncorrp".to_string()]);
    }
    args
}

fn run_command(program: &str, args: &[String], dry_run: bool) -> Result<()> {
    let line = format!("{} {}", program, args.join(" "));
    if dry_run {
        info!("dry run: {}", line);
        return Ok(());
    }
    info!("Running {}", line);
    let status = Command::new(program).args(args).status().map_err(|e| {
        error!("could not start {}: {}", program, e);
        FcError::Command(format!("{}: {}", program, e))
    })?;
    if !status.success() {
        error!("{} exited with {}", program, status);
        return Err(FcError::Command(format!("{} exited with {}", line, status)));
    }
    Ok(())
}

/// Write the randomise inputs of one seed and run it
///
/// # Returns
/// The output basename, from which randomise derives its result files
pub fn use_randomise(ctx: &AnalysisContext, seed: &str, metric: &str, date: &str) -> Result<PathBuf> {
    let opts = &ctx.opts;
    let (g1, g2, all) = ctx
        .layout
        .file_lists(metric, seed, opts.design.group_by_session, &ctx.revoked)?;
    let (n1, n2) = subjects_per_group(ctx, &g1, &g2)?;
    let imgs: Vec<Volume> = all.iter().map(|f| Volume::load(f)).collect::<Result<_>>()?;
    let stack = Series::from_volumes(&imgs)?;

    let out_dir = ctx.layout.randomise_dir(metric, seed);
    std::fs::create_dir_all(&out_dir)?;

    let dm = create_design_matrix(n1, n2, &opts.design).to_int_rows();
    let contrasts = create_contrast_vector(n1, n2, &opts.design);
    let blocks = column_rows(&contrasts.blocks);
    write_text_matrix(&out_dir.join("design_mat"), &dm)?;
    write_text_matrix(&out_dir.join("design_con"), &contrasts.t_contrasts)?;
    write_text_matrix(&out_dir.join("design_fts"), &contrasts.f_tests)?;
    write_text_matrix(&out_dir.join("design_grp"), &blocks)?;

    let suffix = randomise_suffix(&contrasts, date);
    let stem = output_stem(seed, opts.n_perm, opts.use_tfce, opts.cluster_thresh, &suffix);
    let files = RandomiseFiles::new(&out_dir, seed, &stem, &suffix);
    write_vest(&files.design_mat, &dm)?;
    write_vest(&files.design_con, &contrasts.t_contrasts)?;
    write_vest(&files.design_fts, &contrasts.f_tests)?;
    write_vest(&files.design_grp, &blocks)?;

    stack.save(&files.input)?;
    let mask = match mask_imgs(ctx.layout.cfg, &all, &[], seed, &opts.masks)?.mask {
        Some(m) => m.resample_nearest(&stack.volume(0))?,
        None => binarize(&stack.mean_volume(), 0.0),
    };
    mask.save(&files.mask)?;

    let args = randomise_args(&files, opts.n_perm, opts.use_tfce, opts.cluster_thresh);
    run_command("randomise", &args, opts.dry_run)?;
    Ok(files.output)
}

/// Result maps of contrast `i` derived from the output basename:
/// (corrected p, statistic, uncorrected p)
///
/// TFCE runs get the F-tests (`-f`), cluster runs only the t-contrasts.
pub fn output_maps(stem: &Path, i: usize, use_tfce: bool) -> (PathBuf, PathBuf, PathBuf) {
    let with = |tail: String| {
        let mut name = stem.as_os_str().to_os_string();
        name.push(tail);
        PathBuf::from(name)
    };
    if use_tfce {
        (
            with(format!("_tfce_corrp_fstat{}.nii.gz", i)),
            with(format!("_fstat{}.nii.gz", i)),
            with(format!("_tfce_p_fstat{}.nii.gz", i)),
        )
    } else {
        (
            with(format!("_clustere_corrp_tstat{}.nii.gz", i)),
            with(format!("_tstat{}.nii.gz", i)),
            with(format!("_p_tstat{}.nii.gz", i)),
        )
    }
}

/// `1 - p_FDR` from a `1 - p` map: Benjamini-Hochberg over the non-zero voxels
pub fn fdr_map(one_minus_p: &Volume) -> Result<Volume> {
    let idx: Vec<usize> = one_minus_p
        .data
        .iter()
        .enumerate()
        .filter(|(_, v)| **v != 0.0 && v.is_finite())
        .map(|(i, _)| i)
        .collect();
    let pvals: Vec<f64> = idx.iter().map(|&i| 1.0 - one_minus_p.data[i]).collect();
    let mut out = one_minus_p.zeros_like();
    for (&i, q) in idx.iter().zip(fdr_bh(&pvals)) {
        out.data[i] = 1.0 - q;
    }
    Ok(out)
}

/// Corrected p, statistic, uncorrected p and FDR panels for contrasts 1..3
pub fn plot_randomise_outputs(ctx: &AnalysisContext, seed: &str, stem: &Path) -> Result<()> {
    let opts = &ctx.opts;
    let cut_coords = ctx.layout.cfg.cut_coords.get(seed).copied();
    let name = stem.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

    for i in 1..=3 {
        let (corrp, stat, p_unc) = output_maps(stem, i, opts.use_tfce);
        if [&corrp, &stat, &p_unc].iter().any(|p| !p.exists()) {
            warn!("randomise outputs of contrast {} for {} not found, skipped", i, seed);
            continue;
        }
        let corrp = Volume::load(&corrp)?;
        let stat = Volume::load(&stat)?;
        let p_unc = Volume::load(&p_unc)?;
        let fdr = fdr_map(&p_unc)?;

        let panel = |title: String, threshold: f64| StatMapOptions {
            title: Some(title),
            threshold,
            cut_coords,
            cmap: Colormap::Oranges,
            symmetric: false,
            ..Default::default()
        };
        let fig = StatMapFigure::new(vec![
            (&corrp, panel(format!("{} corrp fstat{}>0.95 (p<0.05)", seed, i), 0.95)),
            (&stat, panel(format!("{} fstat{}>{:.1}", seed, i, opts.cluster_thresh), opts.cluster_thresh)),
            (&p_unc, panel(format!("{} p_unc<0.001 fstat{}", seed, i), 0.999)),
            (&fdr, panel(format!("{} p_fdr<0.1 fstat{}", seed, i), 0.9)),
        ]);
        save_figure(&fig, &ctx.figure_path(&format!("{}_fstat{}.svg", name, i)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::design::DesignOptions;

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem("Acc", 5000, true, 4.0, "_x"), "Acc_outputs_n5000_TFCE_x");
        assert_eq!(output_stem("Acc", 100, false, 3.1, "_x"), "Acc_outputs_n100_c31_x");
    }

    #[test]
    fn test_randomise_suffix() {
        let opts = DesignOptions { group_by_session: true, paired: true, ocd_minus_hc: false };
        let c = create_contrast_vector(2, 2, &opts);
        assert_eq!(
            randomise_suffix(&c, "01022024"),
            "_HC_minus_OCD_paired_Ftest_group_by_session_permuteBlocks_01022024"
        );
    }

    #[test]
    fn test_tfce_command_line() {
        let files = RandomiseFiles::new(Path::new("/out"), "Acc", "stem", "_s");
        let args = randomise_args(&files, 10, true, 4.0);
        assert_eq!(args[..2], ["-i".to_string(), "/out/Acc_imgs_4D.nii.gz".to_string()]);
        assert!(args.windows(2).any(|w| w[0] == "-e" && w[1] == "/out/design.grp"));
        assert!(args.windows(2).any(|w| w[0] == "-m" && w[1] == "/out/Acc_pathway_mask_s.nii.gz"));
        assert_eq!(args[args.len() - 3..], ["-T", "--uncorrp", "--permuteBlocks"]);
    }

    #[test]
    fn test_cluster_command_line() {
        let files = RandomiseFiles::new(Path::new("/out"), "Acc", "stem", "");
        let args = randomise_args(&files, 10, false, 3.5);
        assert!(!args.contains(&"-f".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "3.5"));
        assert_eq!(args.last().map(String::as_str), Some("--uncorrp"));
    }

    #[test]
    fn test_dry_run_does_not_execute() {
        assert!(run_command("definitely-not-an-fsl-binary", &[], true).is_ok());
        assert!(matches!(
            run_command("definitely-not-an-fsl-binary", &[], false),
            Err(FcError::Command(_))
        ));
    }

    #[test]
    fn test_output_maps() {
        let (corrp, stat, p) = output_maps(Path::new("/o/Acc_TFCE"), 2, true);
        assert_eq!(corrp, PathBuf::from("/o/Acc_TFCE_tfce_corrp_fstat2.nii.gz"));
        assert_eq!(stat, PathBuf::from("/o/Acc_TFCE_fstat2.nii.gz"));
        assert_eq!(p, PathBuf::from("/o/Acc_TFCE_tfce_p_fstat2.nii.gz"));

        // cluster mode runs without -f, so only t-statistic maps exist
        let (corrp, stat, p) = output_maps(Path::new("/o/Acc_c4"), 1, false);
        assert_eq!(corrp, PathBuf::from("/o/Acc_c4_clustere_corrp_tstat1.nii.gz"));
        assert_eq!(stat, PathBuf::from("/o/Acc_c4_tstat1.nii.gz"));
        assert_eq!(p, PathBuf::from("/o/Acc_c4_p_tstat1.nii.gz"));
        let files = RandomiseFiles::new(Path::new("/o"), "Acc", "Acc_c4", "");
        assert!(!randomise_args(&files, 10, false, 4.0).contains(&"-f".to_string()));
    }

    #[test]
    fn test_fdr_map_keeps_zeros() {
        let affine = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let v = Volume::new(vec![0.0, 0.999, 0.5, 0.99], (4, 1, 1), (1.0, 1.0, 1.0), affine).unwrap();
        let fdr = fdr_map(&v).unwrap();
        assert_eq!(fdr.data[0], 0.0);
        // p = 0.001, 0.5, 0.01 -> adjusted 0.003, 0.5, 0.015
        assert!((fdr.data[1] - 0.997).abs() < 1e-9);
        assert!((fdr.data[2] - 0.5).abs() < 1e-9);
        assert!((fdr.data[3] - 0.985).abs() < 1e-9);
    }
}
