//! Study metadata and file layout

pub mod layout;
pub mod subjects;

pub use layout::Layout;
pub use subjects::{
    load_clinical, load_stim_coords, load_subject_list, subjects_after_scrubbing, ClinicalRecord, GroupTable,
    StimCoord, GROUP1, GROUP2, GROUPS,
};
