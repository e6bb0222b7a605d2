//! File naming conventions and directory layout of the trial
//!
//! ```text
//! {proj}/postprocessing/{subj}/{subj}_{ses}_{metric}_brainFWHM{f}mm_{atlas}_{seed}_ns_sphere_seed_to_voxel_corr.nii.gz
//! {proj}/postprocessing/SPM/input_imgs/{seed_type}/{pre_metric}/{metric}/brainFWHM{f}mm/{seed}/{group}/...nii
//! ```

use std::path::{Path, PathBuf};

use glob::glob;

use crate::config::StudyConfig;
use crate::error::Result;
use crate::study::subjects::{GROUP1, GROUP2};

pub const CORR_SUFFIX: &str = "ns_sphere_seed_to_voxel_corr";

/// Resolves every path used by the pipeline
#[derive(Debug, Clone)]
pub struct Layout<'a> {
    pub cfg: &'a StudyConfig,
    /// Brain smoothing FWHM in mm, `None` when smoothing is disabled
    pub fwhm: Option<f64>,
    pub seed_type: String,
}

impl<'a> Layout<'a> {
    pub fn new(cfg: &'a StudyConfig, fwhm: Option<f64>, seed_type: &str) -> Self {
        Self { cfg, fwhm, seed_type: seed_type.to_string() }
    }

    /// `brainFWHM8mm`; disabled smoothing is tagged as 0 mm
    pub fn fwhm_tag(&self) -> String {
        format!("brainFWHM{}mm", self.fwhm.map_or(0, |f| f as i64))
    }

    pub fn proj_dir(&self) -> &Path {
        &self.cfg.proj_dir
    }

    /// Denoised BOLD series used for seed-to-voxel correlation
    pub fn bold_file(&self, subj: &str, ses: &str, metric: &str) -> PathBuf {
        self.cfg
            .deriv_dir()
            .join("post-fmriprep-fix")
            .join(subj)
            .join(ses)
            .join("func")
            .join(format!(
                "{}_{}_task-rest_space-{}_desc-{}.nii.gz",
                subj, ses, self.cfg.img_space, metric
            ))
    }

    /// Minimally preprocessed BOLD series used for ALFF
    pub fn preproc_bold_file(&self, subj: &str, ses: &str) -> PathBuf {
        self.cfg
            .deriv_dir()
            .join("fmriprep-fix")
            .join(subj)
            .join(ses)
            .join("func")
            .join(format!(
                "{}_{}_task-rest_space-{}_desc-preproc_bold.nii.gz",
                subj, ses, self.cfg.img_space
            ))
    }

    /// Denoising parameters holding `scrubbed_length_min`
    pub fn scrub_params_file(&self, subj: &str, ses: &str, metric: &str) -> PathBuf {
        self.cfg
            .deriv_dir()
            .join("post-fmriprep-fix")
            .join(subj)
            .join(ses)
            .join("func")
            .join(format!("fmripop_{}_parameters.json", metric))
    }

    pub fn subject_dir(&self, subj: &str) -> PathBuf {
        self.cfg.proj_dir.join("postprocessing").join(subj)
    }

    /// File name of a correlation map without extension
    pub fn corr_map_stem(&self, subj: &str, ses: &str, metric: &str, atlas: &str, seed: &str) -> String {
        [subj, ses, metric, &self.fwhm_tag(), atlas, seed, CORR_SUFFIX].join("_")
    }

    /// Per-subject correlation map (`.nii.gz`)
    pub fn corr_map_file(&self, subj: &str, ses: &str, metric: &str, atlas: &str, seed: &str) -> PathBuf {
        self.subject_dir(subj)
            .join(format!("{}.nii.gz", self.corr_map_stem(subj, ses, metric, atlas, seed)))
    }

    /// Seed time series table written next to the correlation maps
    pub fn seed_ts_file(&self, subj: &str, ses: &str, metric: &str, atlas: &str) -> PathBuf {
        self.subject_dir(subj)
            .join(format!("{}_{}_task-rest_{}_desc-{}_seeds_ts.csv", subj, ses, atlas, metric))
    }

    /// Root of the group-level inputs
    pub fn in_dir(&self) -> PathBuf {
        self.cfg
            .proj_dir
            .join("postprocessing")
            .join("SPM")
            .join("input_imgs")
            .join(&self.seed_type)
            .join(&self.cfg.pre_metric)
    }

    pub fn metric_dir(&self, metric: &str) -> PathBuf {
        self.in_dir().join(metric).join(self.fwhm_tag())
    }

    pub fn group_dir(&self, metric: &str, seed: &str, group: &str) -> PathBuf {
        self.metric_dir(metric).join(seed).join(group)
    }

    /// Merged (L+R) or unzipped map, uncompressed for SPM
    pub fn group_map_file(&self, subj: &str, ses: &str, metric: &str, atlas: &str, seed: &str, group: &str) -> PathBuf {
        self.group_dir(metric, seed, group)
            .join(format!("{}.nii", self.corr_map_stem(subj, ses, metric, atlas, seed)))
    }

    pub fn randomise_dir(&self, metric: &str, seed: &str) -> PathBuf {
        self.cfg
            .proj_dir
            .join("postprocessing")
            .join("SPM")
            .join("outputs")
            .join(&self.seed_type)
            .join("smoothed_but_sphere_seed_based")
            .join(metric)
            .join(self.fwhm_tag())
            .join(seed)
            .join("randomise")
    }

    pub fn glm_dir(&self) -> PathBuf {
        self.cfg.proj_dir.join("postprocessing").join("glm").join(&self.cfg.pre_metric)
    }

    pub fn non_parametric_dir(&self) -> PathBuf {
        self.cfg.proj_dir.join("postprocessing").join("non_parametric")
    }

    pub fn figure_dir(&self) -> PathBuf {
        self.cfg.proj_dir.join("img")
    }

    pub fn local_mask_dir(&self, subj: &str) -> PathBuf {
        self.subject_dir(subj).join("spm").join("masks")
    }

    pub fn voi_corr_table(&self) -> PathBuf {
        self.cfg.proj_dir.join("postprocessing").join("df_voi_corr.csv")
    }

    pub fn alff_table(&self) -> PathBuf {
        self.cfg.proj_dir.join("postprocessing").join("df_alff.csv")
    }

    pub fn mask_within_corr_table(&self) -> PathBuf {
        self.cfg.proj_dir.join("postprocessing").join("df_mask_corr.csv")
    }

    /// Cluster VOI drawn in the baseline study
    pub fn voi_file(&self, voi: &str) -> PathBuf {
        self.cfg
            .baseline_path(Path::new("postprocessing/SPM/rois_and_rois"))
            .join(format!("{}.nii", voi))
    }

    /// SPM within-group mask for a seed
    pub fn spm_mask_file(&self, metric: &str, seed: &str) -> PathBuf {
        let rel = self
            .cfg
            .spm_mask_pattern
            .replace("{metric}", metric)
            .replace("{seed}", seed);
        self.cfg.baseline_path(Path::new(&rel))
    }

    /// Group-level input maps for one seed: (group1, group2, group1 ++ group2)
    ///
    /// Each group is sorted within session; with `by_session` the sessions
    /// are concatenated in configuration order (pre then post). Files of
    /// revoked subjects are dropped.
    pub fn file_lists(
        &self,
        metric: &str,
        seed: &str,
        by_session: bool,
        revoked: &[String],
    ) -> Result<(Vec<PathBuf>, Vec<PathBuf>, Vec<PathBuf>)> {
        let list = |group: &str| -> Result<Vec<PathBuf>> {
            let dir = self.group_dir(metric, seed, group);
            let patterns: Vec<String> = if by_session {
                self.cfg.sessions.iter().map(|ses| format!("*{}*", ses)).collect()
            } else {
                vec!["*".to_string()]
            };
            let mut files = Vec::new();
            for pattern in patterns {
                let full = dir.join(pattern);
                let mut found: Vec<PathBuf> = glob(&full.to_string_lossy())?
                    .filter_map(|p| p.ok())
                    .collect();
                found.sort();
                files.extend(found);
            }
            Ok(files
                .into_iter()
                .filter(|f| !is_revoked(f, revoked))
                .collect())
        };

        let group1 = list(GROUP1)?;
        let group2 = list(GROUP2)?;
        let all = group1.iter().chain(group2.iter()).cloned().collect();
        Ok((group1, group2, all))
    }
}

fn is_revoked(path: &Path, revoked: &[String]) -> bool {
    let name = path.to_string_lossy();
    revoked.iter().any(|s| name.contains(s.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_names() {
        let cfg = StudyConfig { proj_dir: PathBuf::from("/p"), ..StudyConfig::default() };
        let layout = Layout::new(&cfg, Some(8.0), "Harrison2009");
        assert_eq!(layout.fwhm_tag(), "brainFWHM8mm");
        assert_eq!(
            layout.corr_map_file("sub-01", "ses-pre", "m", "Harrison2009", "AccL"),
            PathBuf::from("/p/postprocessing/sub-01/sub-01_ses-pre_m_brainFWHM8mm_Harrison2009_AccL_ns_sphere_seed_to_voxel_corr.nii.gz")
        );
        assert_eq!(
            layout.group_dir("m", "Acc", "group1"),
            PathBuf::from("/p/postprocessing/SPM/input_imgs/Harrison2009/seed_not_smoothed/m/brainFWHM8mm/Acc/group1")
        );
        assert_eq!(
            layout.scrub_params_file("sub-01", "ses-post", "m"),
            PathBuf::from("/p/data/derivatives/post-fmriprep-fix/sub-01/ses-post/func/fmripop_m_parameters.json")
        );
        assert_eq!(Layout::new(&cfg, None, "x").fwhm_tag(), "brainFWHM0mm");
    }

    #[test]
    fn test_file_lists_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StudyConfig { proj_dir: dir.path().to_path_buf(), ..StudyConfig::default() };
        let layout = Layout::new(&cfg, Some(8.0), "Harrison2009");
        for (group, subjs) in [("group1", ["sub-02", "sub-01"]), ("group2", ["sub-04", "sub-03"])] {
            let gdir = layout.group_dir("m", "Acc", group);
            fs::create_dir_all(&gdir).unwrap();
            for subj in subjs {
                for ses in ["ses-pre", "ses-post"] {
                    fs::write(gdir.join(format!("{}_{}_map.nii", subj, ses)), b"").unwrap();
                }
            }
        }

        let (g1, g2, all) = layout.file_lists("m", "Acc", true, &["sub-03".to_string()]).unwrap();
        let names = |v: &[PathBuf]| -> Vec<String> {
            v.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect()
        };
        assert_eq!(
            names(&g1),
            vec!["sub-01_ses-pre_map.nii", "sub-02_ses-pre_map.nii", "sub-01_ses-post_map.nii", "sub-02_ses-post_map.nii"]
        );
        assert_eq!(names(&g2), vec!["sub-04_ses-pre_map.nii", "sub-04_ses-post_map.nii"]);
        assert_eq!(all.len(), 6);
    }
}
