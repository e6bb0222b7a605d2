//! Synthetic study on disk for the integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use seedfc::config::StudyConfig;
use seedfc::study::{Layout, GROUP1, GROUP2};
use seedfc::volume::Volume;

pub const DIMS: (usize, usize, usize) = (12, 12, 12);
pub const VOXEL: f64 = 2.0;
/// Voxel range of the group difference, inclusive
pub const BLOB: std::ops::RangeInclusive<usize> = 4..=6;
pub const N_PER_GROUP: usize = 6;
pub const SEED: &str = "Acc";
pub const SES: &str = "ses-pre";

/// 2 mm isotropic grid with the origin at voxel (0, 0, 0)
pub fn affine() -> [f64; 16] {
    [
        VOXEL, 0.0, 0.0, 0.0,
        0.0, VOXEL, 0.0, 0.0,
        0.0, 0.0, VOXEL, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ]
}

pub fn volume(data: Vec<f64>) -> Volume {
    Volume::new(data, DIMS, (VOXEL, VOXEL, VOXEL), affine()).unwrap()
}

pub fn in_blob(i: usize, j: usize, k: usize) -> bool {
    BLOB.contains(&i) && BLOB.contains(&j) && BLOB.contains(&k)
}

/// Zero border of two voxels around noisy brain values at `baseline`, plus
/// `effect` in the blob
pub fn synthetic_map(rng: &mut StdRng, baseline: f64, effect: f64) -> Volume {
    let (nx, ny, nz) = DIMS;
    let mut data = vec![0.0; nx * ny * nz];
    for k in 2..nz - 2 {
        for j in 2..ny - 2 {
            for i in 2..nx - 2 {
                let mut v = baseline + rng.gen_range(-0.5..0.5);
                if in_blob(i, j, k) {
                    v += effect;
                }
                data[i + j * nx + k * nx * ny] = v;
            }
        }
    }
    volume(data)
}

pub fn subjects(group: &str) -> Vec<String> {
    let tag = if group == GROUP1 { "patient" } else { "control" };
    (1..=N_PER_GROUP).map(|n| format!("sub-{}{:02}", tag, n)).collect()
}

pub fn all_subjects() -> Vec<String> {
    let mut subjs = subjects(GROUP1);
    subjs.extend(subjects(GROUP2));
    subjs
}

pub fn write_groups(proj: &Path) {
    let mut text = String::from("subj group\n");
    for group in [GROUP1, GROUP2] {
        for subj in subjects(group) {
            text.push_str(&format!("{} {}\n", subj, group));
        }
    }
    fs::create_dir_all(proj.join("data")).unwrap();
    fs::write(proj.join("data/groups.txt"), text).unwrap();
}

/// Project rooted in a temporary directory, single session and metric
pub fn study_config(proj: &Path) -> StudyConfig {
    StudyConfig {
        proj_dir: proj.to_path_buf(),
        baseline_dir: proj.to_path_buf(),
        sessions: vec![SES.to_string()],
        ..Default::default()
    }
}

/// Group maps where the first group is higher than the second in the blob
pub fn write_group_maps(layout: &Layout, effect: f64) {
    write_session_maps(layout, &[SES], 0.3, effect);
}

/// One map per subject and session, every map centred on `baseline`
pub fn write_session_maps(layout: &Layout, sessions: &[&str], baseline: f64, effect: f64) {
    let mut rng = StdRng::seed_from_u64(42);
    for group in [GROUP1, GROUP2] {
        let shift = if group == GROUP1 { effect } else { 0.0 };
        for subj in subjects(group) {
            for ses in sessions {
                let path = group_map(layout, &subj, ses, group);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                synthetic_map(&mut rng, baseline, shift).save(&path).unwrap();
            }
        }
    }
}

pub fn group_map(layout: &Layout, subj: &str, ses: &str, group: &str) -> PathBuf {
    let cfg = layout.cfg;
    layout.group_map_file(subj, ses, &cfg.metrics[0], &cfg.atlases[0], SEED, group)
}

/// Stimulation VOI covering the blob
pub fn write_blob_voi(path: &Path) {
    let (nx, ny, nz) = DIMS;
    let mut data = vec![0.0; nx * ny * nz];
    for k in BLOB {
        for j in BLOB {
            for i in BLOB {
                data[i + j * nx + k * nx * ny] = 1.0;
            }
        }
    }
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    volume(data).save(path).unwrap();
}

pub struct Study {
    pub dir: TempDir,
    pub cfg: StudyConfig,
}

impl Study {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_groups(dir.path());
        let cfg = study_config(dir.path());
        Self { dir, cfg }
    }

    pub fn layout(&self) -> Layout<'_> {
        Layout::new(&self.cfg, Some(8.0), "Harrison2009")
    }
}
