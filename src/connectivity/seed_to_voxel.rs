//! Seed-to-voxel correlation maps and their group-level arrangement

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::config::{AtlasSeed, BoldSettings, SphereSeed};
use crate::connectivity::masker::{BrainMasker, LabelsMasker, MaskerOptions, SphereMasker};
use crate::error::{FcError, Result};
use crate::nifti_io::gunzip_file;
use crate::progress;
use crate::signal::CleanOptions;
use crate::study::{GroupTable, Layout};
use crate::utils::mask::create_sphere_mask;
use crate::volume::{mean_volumes, Series, Volume};

/// Pearson correlation of standardised signals: `voxels . seed / n_t`
pub fn correlate(voxels_ts: &[Vec<f64>], seed_ts: &[f64]) -> Result<Vec<f64>> {
    let n_t = seed_ts.len();
    if n_t == 0 {
        return Err(FcError::Shape("empty seed time series".to_string()));
    }
    voxels_ts
        .par_iter()
        .map(|v| {
            if v.len() != n_t {
                return Err(FcError::Shape(format!("voxel has {} time points, seed {}", v.len(), n_t)));
            }
            Ok(v.iter().zip(seed_ts).map(|(a, b)| a * b).sum::<f64>() / n_t as f64)
        })
        .collect()
}

/// Band-passed, standardised extraction used for both brain and seed signals
fn bold_options(bold: &BoldSettings, smoothing_fwhm: Option<f64>) -> MaskerOptions {
    MaskerOptions {
        smoothing_fwhm,
        clean: CleanOptions {
            detrend: false,
            standardize: true,
            high_pass: Some(bold.high_pass),
            low_pass: Some(bold.low_pass),
            t_r: Some(bold.t_r),
        },
    }
}

fn write_seed_ts(path: &Path, names: &[String], signals: &[Vec<f64>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(names)?;
    let n_t = signals.first().map_or(0, Vec::len);
    for t in 0..n_t {
        writer.write_record(signals.iter().map(|s| format!("{:.6}", s[t])))?;
    }
    writer.flush()?;
    Ok(())
}

/// Correlate each seed signal with every brain voxel and save the maps
fn correlate_and_save(
    layout: &Layout,
    bold: &Series,
    brain: &BrainMasker,
    names: &[String],
    seed_signals: &[Vec<f64>],
    (subj, ses, metric, atlas): (&str, &str, &str, &str),
) -> Result<Vec<PathBuf>> {
    let voxels_ts = brain.transform(bold)?;
    let mut written = Vec::with_capacity(names.len());
    for (name, seed_ts) in names.iter().zip(seed_signals) {
        let corr = correlate(&voxels_ts, seed_ts)?;
        let path = layout.corr_map_file(subj, ses, metric, atlas, name);
        brain.inverse_transform(&corr)?.save(&path)?;
        debug!("saved {}", path.display());
        written.push(path);
    }
    write_seed_ts(&layout.seed_ts_file(subj, ses, metric, atlas), names, seed_signals)?;
    Ok(written)
}

/// Sphere seeds: correlation maps of one subject and session
pub fn sphere_seed_to_voxel(
    layout: &Layout,
    subj: &str,
    ses: &str,
    seeds: &[SphereSeed],
    metrics: &[String],
    atlases: &[String],
) -> Result<Vec<PathBuf>> {
    let t0 = Instant::now();
    let bold_cfg = layout.cfg.bold;
    let mut written = Vec::new();
    for atlas in atlases {
        for metric in metrics {
            let bold = Series::load(&layout.bold_file(subj, ses, metric))?;
            let brain = BrainMasker::fit(&bold, bold_options(&bold_cfg, layout.fwhm))?;
            let mut signals = Vec::with_capacity(seeds.len());
            for seed in seeds {
                let masker = SphereMasker::new(vec![seed.center], seed.radius, bold_options(&bold_cfg, None));
                signals.extend(masker.transform(&bold)?);
            }
            let names: Vec<String> = seeds.iter().map(|s| s.name.clone()).collect();
            written.extend(correlate_and_save(layout, &bold, &brain, &names, &signals, (subj, ses, metric, atlas))?);
        }
    }
    info!("{} {} seed-to-voxel correlation in {:.2?}", subj, ses, t0.elapsed());
    Ok(written)
}

/// Atlas seeds: correlation maps of one subject and session
pub fn seed_to_voxel(
    layout: &Layout,
    subj: &str,
    ses: &str,
    seeds: &[AtlasSeed],
    metrics: &[String],
    atlases: &[String],
) -> Result<Vec<PathBuf>> {
    let t0 = Instant::now();
    let bold_cfg = layout.cfg.bold;
    let mut written = Vec::new();
    for atlas in atlases {
        for metric in metrics {
            let bold = Series::load(&layout.bold_file(subj, ses, metric))?;
            let brain = BrainMasker::fit(&bold, bold_options(&bold_cfg, layout.fwhm))?;
            let mut signals = Vec::with_capacity(seeds.len());
            for seed in seeds {
                let atlas_img = Volume::load(&layout.cfg.baseline_path(&seed.atlas))?;
                let masker = LabelsMasker::new(atlas_img, vec![seed.labels.clone()], bold_options(&bold_cfg, None));
                signals.extend(masker.transform(&bold)?);
            }
            let names: Vec<String> = seeds.iter().map(|s| s.name.clone()).collect();
            written.extend(correlate_and_save(layout, &bold, &brain, &names, &signals, (subj, ses, metric, atlas))?);
        }
    }
    info!("{} {} atlas seed-to-voxel correlation in {:.2?}", subj, ses, t0.elapsed());
    Ok(written)
}

/// Correlation maps for every subject and session, in parallel over subjects
pub fn compute_seed_corr(layout: &Layout, subjs: &[String]) -> Result<()> {
    let cfg = layout.cfg;
    let pb = progress::bar(subjs.len(), "seed correlation");
    subjs.par_iter().try_for_each(|subj| -> Result<()> {
        for ses in &cfg.sessions {
            if !cfg.seeds.is_empty() {
                sphere_seed_to_voxel(layout, subj, ses, &cfg.seeds, &cfg.metrics, &cfg.atlases)?;
            }
            if !cfg.atlas_seeds.is_empty() {
                seed_to_voxel(layout, subj, ses, &cfg.atlas_seeds, &cfg.metrics, &cfg.atlases)?;
            }
        }
        pb.inc(1);
        Ok(())
    })?;
    pb.finish_and_clear();
    Ok(())
}

/// Merged maps per (seed, metric)
pub type MergedFiles = BTreeMap<(String, String), Vec<PathBuf>>;

/// Average the left and right hemisphere maps of every merged seed
///
/// Subjects without a group are dropped from `subjs` with a warning.
pub fn merge_lr_hemis(
    layout: &Layout,
    subjs: &mut Vec<String>,
    groups: &GroupTable,
    seeds: &[String],
    sessions: &[String],
    metrics: &[String],
    atlas: &str,
) -> Result<MergedFiles> {
    subjs.retain(|s| {
        let known = groups.group_of(s).is_some();
        if !known {
            warn!("{} removed because it does not belong to any group", s);
        }
        known
    });

    let mut merged: MergedFiles = BTreeMap::new();
    for metric in metrics {
        for ses in sessions {
            for seed in seeds {
                for subj in subjs.iter() {
                    let group = groups.group_of(subj).unwrap_or_default();
                    let hemis: Vec<Volume> = ["L", "R"]
                        .iter()
                        .map(|h| Volume::load(&layout.corr_map_file(subj, ses, metric, atlas, &format!("{}{}", seed, h))))
                        .collect::<Result<_>>()?;
                    let out = layout.group_map_file(subj, ses, metric, atlas, seed, group);
                    mean_volumes(&hemis)?.save(&out)?;
                    merged.entry((seed.clone(), metric.clone())).or_default().push(out);
                }
            }
        }
    }
    info!("Merged L-R hemispheres");
    Ok(merged)
}

/// Decompress per-subject maps into the group folders (SPM reads plain `.nii`)
pub fn unzip_correlation_maps(
    layout: &Layout,
    subjs: &[String],
    groups: &GroupTable,
    seeds: &[String],
    sessions: &[String],
    metrics: &[String],
    atlases: &[String],
) -> Result<usize> {
    info!("Unzipping seed-based correlation maps for use in SPM");
    let mut n = 0;
    for subj in subjs {
        let Some(group) = groups.group_of(subj) else {
            warn!("{} has no group, its maps are not unzipped", subj);
            continue;
        };
        for ses in sessions {
            for metric in metrics {
                for atlas in atlases {
                    for seed in seeds {
                        let src = layout.corr_map_file(subj, ses, metric, atlas, seed);
                        let dst = layout.group_map_file(subj, ses, metric, atlas, seed, group);
                        gunzip_file(&src, &dst)?;
                        n += 1;
                    }
                }
            }
        }
    }
    Ok(n)
}

/// Sphere around the peak |FC| of a map inside a VOI
pub fn local_sphere_at_peak(corr: &Volume, voi: &Volume, radius: f64) -> Result<Volume> {
    let voi = voi.resample_nearest(corr)?;
    let (best, _) = corr
        .data
        .iter()
        .zip(&voi.data)
        .enumerate()
        .filter(|(_, (_, &m))| m != 0.0)
        .map(|(i, (&c, _))| (i, c.abs()))
        .fold((None, f64::NEG_INFINITY), |(bi, bv), (i, v)| if v > bv { (Some(i), v) } else { (bi, bv) });
    let idx = best.ok_or_else(|| FcError::Stats("VOI does not overlap the correlation map".to_string()))?;
    let (i, j, k) = corr.coords(idx);
    let center = corr.voxel_to_world(i as f64, j as f64, k as f64);
    create_sphere_mask(corr, center, radius)
}

/// Local spheres at each subject's FC peak inside cluster VOIs (baseline session)
///
/// `pairs` maps a merged seed to the VOI cluster name.
pub fn create_local_sphere_within_cluster(
    layout: &Layout,
    subjs: &[String],
    groups: &GroupTable,
    pairs: &[(String, String)],
    metrics: &[String],
    atlas: &str,
    radius: f64,
) -> Result<Vec<PathBuf>> {
    let ses = layout
        .cfg
        .sessions
        .first()
        .ok_or_else(|| FcError::Config("no session configured".to_string()))?;
    let mut written = Vec::new();
    for metric in metrics {
        for (seed, voi) in pairs {
            let voi_img = Volume::load(&layout.voi_file(voi))?;
            for subj in subjs {
                let Some(group) = groups.group_of(subj) else {
                    warn!("{} has no group, skipped", subj);
                    continue;
                };
                let corr = Volume::load(&layout.group_map_file(subj, ses, metric, atlas, seed, group))?;
                let sphere = local_sphere_at_peak(&corr, &voi_img, radius)?;
                let out = layout.local_mask_dir(subj).join(format!("local_{}_{}.nii", voi, metric));
                sphere.save(&out)?;
                written.push(out);
            }
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(values: Vec<f64>) -> Volume {
        let n = values.len();
        let affine = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        Volume::new(values, (n, 1, 1), (1.0, 1.0, 1.0), affine).unwrap()
    }

    #[test]
    fn test_correlate_standardised() {
        let seed = vec![1.0, -1.0, 1.0, -1.0];
        let voxels = vec![vec![1.0, -1.0, 1.0, -1.0], vec![-1.0, 1.0, -1.0, 1.0], vec![1.0, 1.0, -1.0, -1.0]];
        assert_eq!(correlate(&voxels, &seed).unwrap(), vec![1.0, -1.0, 0.0]);
        assert!(correlate(&[vec![1.0]], &seed).is_err());
        assert!(correlate(&voxels, &[]).is_err());
    }

    #[test]
    fn test_local_sphere_at_peak() {
        let corr = line(vec![0.9, 0.1, -0.6, 0.2, 0.3]);
        let voi = line(vec![0.0, 1.0, 1.0, 1.0, 0.0]);
        let sphere = local_sphere_at_peak(&corr, &voi, 1.0).unwrap();
        // peak |FC| inside the VOI is at index 2
        assert_eq!(sphere.data, vec![0.0, 1.0, 1.0, 1.0, 0.0]);
        assert!(local_sphere_at_peak(&corr, &line(vec![0.0; 5]), 1.0).is_err());
    }
}
