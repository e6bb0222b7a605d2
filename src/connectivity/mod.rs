//! Subject-level connectivity: maskers, seed-to-voxel maps and ALFF

pub mod alff;
pub mod masker;
pub mod seed_to_voxel;

pub use alff::{compute_alff, AlffRecord};
pub use masker::{BrainMasker, LabelsMasker, MaskerOptions, SphereMasker};
pub use seed_to_voxel::{
    compute_seed_corr, create_local_sphere_within_cluster, merge_lr_hemis, seed_to_voxel, sphere_seed_to_voxel,
    unzip_correlation_maps, MergedFiles,
};
