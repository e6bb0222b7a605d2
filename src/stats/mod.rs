//! Group-level statistics
//!
//! Design matrices and contrasts, the parametric second-level GLM,
//! thresholding and cluster tables, permutation inference and the small
//! univariate tests behind the printed reports.

pub mod anova;
pub mod clusters;
pub mod design;
pub mod dist;
pub mod glm;
pub mod multitest;
pub mod permutation;
pub mod threshold;
pub mod univariate;

pub use clusters::{get_clusters_table, ClusterRow};
pub use design::{create_contrast_vector, create_design_matrix, ContrastSet, DesignMatrix, DesignOptions};
pub use glm::{ContrastKind, ContrastMaps, SecondLevelModel};
pub use permutation::{non_parametric_inference, PermutationOptions};
pub use threshold::{fdr_threshold, threshold_stats_img, HeightControl};
pub use univariate::{cohen_d, pearsonr, ttest_ind, ttest_rel, TestResult};
