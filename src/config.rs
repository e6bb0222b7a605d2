//! Study configuration
//!
//! Every setting has a default matching the trial's layout, so a run without
//! a configuration file works on the standard project tree. Relative paths are
//! resolved against `proj_dir` (or `baseline_dir` for baseline resources).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FcError, Result};

/// Spherical seed defined by an MNI coordinate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SphereSeed {
    pub name: String,
    pub center: [f64; 3],
    #[serde(default = "default_seed_radius")]
    pub radius: f64,
}

fn default_seed_radius() -> f64 {
    3.5
}

/// Seed made of atlas labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtlasSeed {
    pub name: String,
    pub atlas: PathBuf,
    pub labels: Vec<u32>,
}

/// Temporal filtering of BOLD data before correlation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoldSettings {
    pub t_r: f64,
    pub high_pass: f64,
    pub low_pass: f64,
}

impl Default for BoldSettings {
    fn default() -> Self {
        Self { t_r: 0.81, high_pass: 0.01, low_pass: 0.1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlffSettings {
    pub t_r: f64,
    pub low_pass: f64,
    pub band: (f64, f64),
}

impl Default for AlffSettings {
    fn default() -> Self {
        Self { t_r: 0.83, low_pass: 0.25, band: (0.01, 0.08) }
    }
}

/// Template masks that can restrict the second-level search space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateMasks {
    pub gm: PathBuf,
    pub fspt: PathBuf,
    pub cortical: PathBuf,
    pub frontal: PathBuf,
}

impl Default for TemplateMasks {
    fn default() -> Self {
        Self {
            gm: PathBuf::from("utils/mni152_gm_mask.nii.gz"),
            fspt: PathBuf::from("utils/Larger_FrStrPalThal_schaefer400_tianS4MNI_lps_mni.nii"),
            cortical: PathBuf::from("utils/schaefer_cortical.nii"),
            frontal: PathBuf::from("utils/schaefer400_tianS4_frontal.nii.gz"),
        }
    }
}

/// One image layer of the surface figure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceLayer {
    pub name: String,
    pub path: PathBuf,
    pub cmap: String,
    pub clim: [f64; 2],
    pub opacity: f64,
    pub nan_opacity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceSettings {
    /// Directory holding BrainNet `.nv` meshes
    pub template_dir: PathBuf,
    pub layers: Vec<SurfaceLayer>,
    /// Layers drawn, in order
    pub show: Vec<String>,
    pub group_colors: BTreeMap<String, String>,
}

impl Default for SurfaceSettings {
    fn default() -> Self {
        let layer = |name: &str, path: &str, cmap: &str, clim: [f64; 2], opacity: f64, nan_opacity: f64| SurfaceLayer {
            name: name.to_string(),
            path: PathBuf::from(path),
            cmap: cmap.to_string(),
            clim,
            opacity,
            nan_opacity,
        };
        Self {
            template_dir: PathBuf::from("utils/SurfTemplate"),
            layers: vec![
                layer("base", "utils/empty.nii.gz", "binary", [0.0, 1.0], 1.0, 1.0),
                layer("stim_5mm", "utils/stim_VOI_5mm.nii.gz", "Reds", [0.0, 0.5], 1.0, 0.0),
                layer("acc_seed", "utils/Acc.nii.gz", "Reds", [0.0, 0.5], 1.0, 0.0),
                layer("stim_10mm", "utils/stim_VOI_10mm.nii.gz", "Reds", [0.0, 0.5], 1.0, 0.0),
                layer("acc_pathway", "utils/frontal_Acc_mapping.nii.gz", "binary", [0.0, 999999.0], 0.8, 0.0),
                layer("tian_acc", "utils/hcp_masks/Acc_pathway_mask.nii.gz", "Oranges", [0.0, 0.6], 1.0, 0.0),
                layer("group_diff", "postprocessing/randomise/Acc_group_by_session_tstat1.nii.gz", "RdBu", [-4.0, 4.0], 1.0, 0.0),
            ],
            show: vec!["base".to_string(), "tian_acc".to_string()],
            group_colors: BTreeMap::from([
                ("group1".to_string(), "orange".to_string()),
                ("group2".to_string(), "lightslategray".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub proj_dir: PathBuf,
    pub baseline_dir: PathBuf,
    pub deriv_dir: PathBuf,
    pub groups_file: PathBuf,
    pub subjects_file: PathBuf,
    pub stim_coords_file: PathBuf,
    pub clinical_file: PathBuf,
    pub seeds: Vec<SphereSeed>,
    pub atlas_seeds: Vec<AtlasSeed>,
    /// Seed-specific (pathway) masks by merged seed name
    pub pathway_masks: BTreeMap<String, PathBuf>,
    pub cut_coords: BTreeMap<String, [f64; 3]>,
    pub metrics: Vec<String>,
    pub sessions: Vec<String>,
    pub atlases: Vec<String>,
    pub pre_metric: String,
    pub img_space: String,
    pub bold: BoldSettings,
    pub alff: AlffSettings,
    pub template_masks: TemplateMasks,
    pub stim_voi_mask: PathBuf,
    /// Within-group masks produced with SPM, `{metric}` and `{seed}` are substituted
    pub spm_mask_pattern: String,
    /// Baseline cluster VOI by merged seed, for the local peak spheres
    pub cluster_vois: BTreeMap<String, String>,
    pub surface: SurfaceSettings,
    pub random_state: u64,
}

impl Default for StudyConfig {
    fn default() -> Self {
        let working = PathBuf::from("/working/lab_lucac/sebastiN/projects");
        Self {
            proj_dir: working.join("OCD_clinical_trial"),
            baseline_dir: working.join("OCDbaseline"),
            deriv_dir: PathBuf::from("data/derivatives"),
            groups_file: PathBuf::from("data/groups.txt"),
            subjects_file: PathBuf::from("code/patients_list.txt"),
            stim_coords_file: PathBuf::from("data/MNI_coordinates_FINAL.csv"),
            clinical_file: PathBuf::from("data/clinical.csv"),
            seeds: vec![
                SphereSeed { name: "AccL".to_string(), center: [-9.0, 9.0, -8.0], radius: 3.5 },
                SphereSeed { name: "AccR".to_string(), center: [9.0, 9.0, -8.0], radius: 3.5 },
            ],
            atlas_seeds: Vec::new(),
            pathway_masks: BTreeMap::from([
                ("Acc".to_string(), PathBuf::from("utils/frontal_Acc_mapping.nii.gz")),
                ("dCaud".to_string(), PathBuf::from("utils/frontal_dCaud_mapping.nii.gz")),
                ("dPut".to_string(), PathBuf::from("utils/frontal_dPut_mapping.nii.gz")),
                ("vPut".to_string(), PathBuf::from("utils/frontal_vPut_mapping.nii.gz")),
            ]),
            cut_coords: BTreeMap::from([
                ("Acc".to_string(), [25.0, 57.0, -6.0]),
                ("dPut".to_string(), [50.0, 11.0, 19.0]),
                ("vPut".to_string(), [-25.0, 56.0, 35.0]),
            ]),
            metrics: vec!["detrend_gsr_filtered_scrubFD05".to_string()],
            sessions: vec!["ses-pre".to_string(), "ses-post".to_string()],
            atlases: vec!["Harrison2009".to_string()],
            pre_metric: "seed_not_smoothed".to_string(),
            img_space: "MNI152NLin2009cAsym".to_string(),
            bold: BoldSettings::default(),
            alff: AlffSettings::default(),
            template_masks: TemplateMasks::default(),
            stim_voi_mask: PathBuf::from("utils/mask_stim_VOI_5mm.nii.gz"),
            spm_mask_pattern: "postprocessing/SPM/outputs/{metric}/{seed}/scrub_out_1/{seed}_fl_0001unc_005fwe.nii.gz"
                .to_string(),
            cluster_vois: BTreeMap::new(),
            surface: SurfaceSettings::default(),
            random_state: 0,
        }
    }
}

impl StudyConfig {
    /// Defaults when `path` is `None`, otherwise the JSON file merged over defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                if !p.exists() {
                    return Err(FcError::MissingInput(p.to_path_buf()));
                }
                let text = fs::read_to_string(p)?;
                let cfg: StudyConfig = serde_json::from_str(&text)?;
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sessions.is_empty() {
            return Err(FcError::Config("at least one session is required".to_string()));
        }
        if self.metrics.is_empty() {
            return Err(FcError::Config("at least one metric is required".to_string()));
        }
        for seed in &self.seeds {
            if seed.radius <= 0.0 {
                return Err(FcError::Config(format!("seed {} has a non-positive radius", seed.name)));
            }
        }
        if self.bold.t_r <= 0.0 || self.alff.t_r <= 0.0 {
            return Err(FcError::Config("repetition time must be positive".to_string()));
        }
        Ok(())
    }

    /// Resolve a path against the project directory
    pub fn proj_path(&self, p: &Path) -> PathBuf {
        if p.is_absolute() { p.to_path_buf() } else { self.proj_dir.join(p) }
    }

    /// Resolve a path against the baseline study directory
    pub fn baseline_path(&self, p: &Path) -> PathBuf {
        if p.is_absolute() { p.to_path_buf() } else { self.baseline_dir.join(p) }
    }

    pub fn deriv_dir(&self) -> PathBuf {
        self.proj_path(&self.deriv_dir)
    }

    /// Seeds merged across hemispheres: `AccL`, `AccR` -> `Acc`
    pub fn merged_seeds(&self) -> Vec<String> {
        let mut subrois: Vec<String> = self
            .seeds
            .iter()
            .map(|s| hemisphere_stem(&s.name).to_string())
            .collect();
        subrois.sort();
        subrois.dedup();
        subrois
    }

    pub fn seed(&self, name: &str) -> Option<&SphereSeed> {
        self.seeds.iter().find(|s| s.name == name)
    }

    pub fn surface_layer(&self, name: &str) -> Option<&SurfaceLayer> {
        self.surface.layers.iter().find(|l| l.name == name)
    }
}

/// Seed name without its trailing hemisphere letter
pub fn hemisphere_stem(name: &str) -> &str {
    name.strip_suffix('L')
        .or_else(|| name.strip_suffix('R'))
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = StudyConfig::load(None).unwrap();
        assert_eq!(cfg.seeds.len(), 2);
        assert_eq!(cfg.seeds[0].center, [-9.0, 9.0, -8.0]);
        assert_eq!(cfg.bold.t_r, 0.81);
        assert_eq!(cfg.alff.t_r, 0.83);
        assert_eq!(cfg.merged_seeds(), vec!["Acc".to_string()]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"proj_dir": "/data/trial", "sessions": ["ses-pre"], "random_state": 7}}"#).unwrap();
        let cfg = StudyConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.proj_dir, PathBuf::from("/data/trial"));
        assert_eq!(cfg.sessions, vec!["ses-pre".to_string()]);
        assert_eq!(cfg.random_state, 7);
        assert_eq!(cfg.metrics, StudyConfig::default().metrics);
        assert_eq!(cfg.deriv_dir(), PathBuf::from("/data/trial/data/derivatives"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sessions": []}}"#).unwrap();
        assert!(matches!(StudyConfig::load(Some(file.path())), Err(FcError::Config(_))));
        assert!(matches!(
            StudyConfig::load(Some(Path::new("/nonexistent/cfg.json"))),
            Err(FcError::MissingInput(_))
        ));
    }

    #[test]
    fn test_hemisphere_stem() {
        assert_eq!(hemisphere_stem("AccL"), "Acc");
        assert_eq!(hemisphere_stem("dPutR"), "dPut");
        assert_eq!(hemisphere_stem("Acc"), "Acc");
    }
}
