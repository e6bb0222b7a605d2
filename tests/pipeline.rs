//! `analyze` stages run end to end over a synthetic study

mod common;

use common::{write_blob_voi, write_group_maps, Study, N_PER_GROUP};
use seedfc::analysis::voi::read_voi_corr;
use seedfc::analysis::{compute_voi_corr, run_analysis, AnalysisContext, AnalysisOptions, Stages};
use seedfc::study::{GroupTable, GROUP1, GROUP2};

fn write_subject_list(study: &Study) {
    let path = study.cfg.proj_path(&study.cfg.subjects_file);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, common::all_subjects().join("\n")).unwrap();
}

#[test]
fn test_voi_corr_separates_groups() {
    let mut study = Study::new();
    let voi = study.dir.path().join("utils/stim_voi.nii.gz");
    write_blob_voi(&voi);
    study.cfg.stim_voi_mask = voi;
    write_group_maps(&study.layout(), 1.0);

    let ctx = AnalysisContext {
        layout: study.layout(),
        opts: AnalysisOptions::default(),
        groups: GroupTable::load(&study.dir.path().join("data/groups.txt")).unwrap(),
        subjs: common::all_subjects(),
        revoked: Vec::new(),
    };
    let records = compute_voi_corr(&ctx).unwrap();
    // one session, so no pre-post rows
    assert_eq!(records.len(), 2 * N_PER_GROUP);
    assert!(records.iter().all(|r| r.pathway == "Acc_to_stim" && r.ses == common::SES));

    let mean = |group: &str| {
        let v: Vec<f64> = records.iter().filter(|r| r.group == group).map(|r| r.corr).collect();
        v.iter().sum::<f64>() / v.len() as f64
    };
    assert!(mean(GROUP1) - mean(GROUP2) > 0.7);
}

#[test]
fn test_run_analysis_writes_tables() {
    let mut study = Study::new();
    write_subject_list(&study);
    let voi = study.dir.path().join("utils/stim_voi.nii.gz");
    write_blob_voi(&voi);
    study.cfg.stim_voi_mask = voi;
    write_group_maps(&study.layout(), 2.0);

    let stages = Stages { run_second_level: true, compute_voi_corr: true, ..Default::default() };
    let opts = AnalysisOptions { save_outputs: true, ..Default::default() };
    run_analysis(study.layout(), opts, &stages, None).unwrap();

    let layout = study.layout();
    let records = read_voi_corr(&layout.voi_corr_table()).unwrap();
    assert_eq!(records.len(), 2 * N_PER_GROUP);
    let glm_files = std::fs::read_dir(layout.glm_dir()).unwrap().count();
    // summary, plus stat, z and FPR maps of the first pass
    assert_eq!(glm_files, 4);
}

#[test]
fn test_missing_group_maps_fail_second_level() {
    let study = Study::new();
    write_subject_list(&study);
    let stages = Stages { run_second_level: true, ..Default::default() };
    assert!(run_analysis(study.layout(), AnalysisOptions::default(), &stages, None).is_err());
}
