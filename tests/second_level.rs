//! Group-level stages on a synthetic two-group study

mod common;

use common::{group_map, in_blob, write_group_maps, write_session_maps, Study, BLOB, DIMS, SEED, VOXEL};
use seedfc::analysis::{
    non_parametric_analysis, read_json_gz, run_second_level, AnalysisContext, AnalysisOptions,
};
use seedfc::stats::DesignOptions;
use seedfc::study::{GroupTable, GROUP1};
use seedfc::volume::Volume;
use seedfc::FcError;

const SESSIONS: [&str; 2] = ["ses-pre", "ses-post"];

fn on_border(v: &Volume, idx: usize) -> bool {
    let (i, j, k) = v.coords(idx);
    let edge = |x: usize, n: usize| x < 2 || x + 2 >= n;
    edge(i, DIMS.0) || edge(j, DIMS.1) || edge(k, DIMS.2)
}

fn context<'a>(study: &'a Study, opts: AnalysisOptions) -> AnalysisContext<'a> {
    let groups = GroupTable::load(&study.dir.path().join("data/groups.txt")).unwrap();
    AnalysisContext {
        layout: study.layout(),
        opts,
        groups,
        subjs: common::all_subjects(),
        revoked: Vec::new(),
    }
}

#[test]
fn test_second_level_finds_group_difference() {
    let study = Study::new();
    write_group_maps(&study.layout(), 2.0);
    let ctx = context(&study, AnalysisOptions::default());

    let outputs = run_second_level(&ctx).unwrap();
    assert_eq!(outputs.len(), 1);
    let out = &outputs[0];
    assert_eq!(out.seed, SEED);
    assert_eq!(out.passes.len(), 1);
    assert!(out.within_group.is_none());

    let pass = &out.passes[0];
    assert_eq!(pass.glm.dof, 10.0);
    let z = &pass.glm.contrast("between").unwrap().z_score;
    let centre = z.index(5, 5, 5);
    assert!(z.data[centre] > 3.0);

    // the blob is the strongest cluster
    let top = &pass.fpr.table[0];
    assert_eq!(top.id, "1");
    let lo = *BLOB.start() as f64 * VOXEL;
    let hi = *BLOB.end() as f64 * VOXEL;
    for c in [top.x, top.y, top.z] {
        assert!(c >= lo && c <= hi, "peak coordinate {} outside the blob", c);
    }
    assert!(top.peak_stat > 3.0);

    // suprathreshold voxels of the FPR map stay inside the blob
    let img = &pass.fpr.img;
    for (idx, &v) in img.data.iter().enumerate() {
        if v > 0.0 {
            let (i, j, k) = img.coords(idx);
            assert!(in_blob(i, j, k));
        }
    }
}

#[test]
fn test_second_level_saves_summary() {
    let study = Study::new();
    write_group_maps(&study.layout(), 2.0);
    let opts = AnalysisOptions { save_outputs: true, ..Default::default() };
    let ctx = context(&study, opts);
    run_second_level(&ctx).unwrap();

    let dir = ctx.layout.glm_dir();
    let summaries: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with(".json.gz"))
        .collect();
    assert_eq!(summaries.len(), 1);
    let name = summaries[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("glm_results_detrend_gsr_filtered_scrubFD05_"));

    let json = read_json_gz(&summaries[0]).unwrap();
    assert_eq!(json[0]["seed"], SEED);
    assert_eq!(json[0]["passes"][0]["pass"], "first_pass");
    assert!(json[0]["passes"][0]["fpr_clusters"].as_array().unwrap().len() >= 1);

    let z_map = dir.join(name.replace("glm_results", &format!("{}_first_pass_between_z", SEED)).replace(".json.gz", ".nii.gz"));
    assert!(z_map.exists());
}

#[test]
fn test_permutation_test_in_blob() {
    let study = Study::new();
    write_group_maps(&study.layout(), 2.0);
    let opts = AnalysisOptions { n_perm: 199, n_jobs: 2, ..Default::default() };
    let ctx = context(&study, opts);
    let metric = ctx.layout.cfg.metrics[0].clone();

    let res = non_parametric_analysis(&ctx, SEED, &metric).unwrap();
    let p = &res.neg_log_pvals;
    assert!(p.data[p.index(5, 5, 5)] > 1.3);
    // -log10 p is bounded by the number of permutations
    let bound = (200f64).log10() + 1e-9;
    assert!(p.data.iter().all(|&v| v <= bound));
}

#[test]
fn test_two_pass_restricts_second_fit_to_within_group_mask() {
    let study = Study::new();
    // both groups well above zero everywhere in the brain
    write_session_maps(&study.layout(), &[common::SES], 1.0, 2.0);
    let opts = AnalysisOptions { use_within_group_mask: true, save_outputs: true, ..Default::default() };
    let ctx = context(&study, opts);

    let outputs = run_second_level(&ctx).unwrap();
    let out = &outputs[0];
    let names: Vec<&str> = out.passes.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["first_pass", "second_pass"]);

    let within = out.within_group.as_ref().unwrap();
    let mask = &within.mask;
    let n_mask = mask.data.iter().filter(|&&v| v != 0.0).count();
    assert!(n_mask > 400, "within-group mask has {} voxels", n_mask);
    assert!(mask.data.iter().enumerate().all(|(idx, &v)| v == 0.0 || !on_border(mask, idx)));
    assert_eq!(mask.data[mask.index(5, 5, 5)], 1.0);

    // the second fit only sees the masked voxels
    let (first, second) = (&out.passes[0], &out.passes[1]);
    assert_eq!(second.glm.n_voxels, n_mask);
    assert!(second.glm.n_voxels <= first.glm.n_voxels);
    let z = &second.glm.contrast("between").unwrap().z_score;
    assert!(z.data[z.index(5, 5, 5)] > 3.0);
    assert!(z.data.iter().zip(&mask.data).all(|(&z, &m)| m != 0.0 || z == 0.0));

    let summary = std::fs::read_dir(ctx.layout.glm_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.to_string_lossy().ends_with(".json.gz"))
        .unwrap();
    let json = read_json_gz(&summary).unwrap();
    assert_eq!(json[0]["passes"][1]["pass"], "second_pass");
    assert_eq!(json[0]["passes"][1]["n_voxels"], n_mask);
}

#[test]
fn test_group_by_session_glm() {
    let mut study = Study::new();
    study.cfg.sessions = SESSIONS.iter().map(|s| s.to_string()).collect();
    write_session_maps(&study.layout(), &SESSIONS, 0.3, 2.0);
    let mut opts = AnalysisOptions::default();
    opts.design = DesignOptions { group_by_session: true, ..Default::default() };
    let ctx = context(&study, opts);

    let outputs = run_second_level(&ctx).unwrap();
    let pass = &outputs[0].passes[0];
    // 24 maps, 4 group-by-session columns
    assert_eq!(pass.glm.dof, 20.0);
    assert!(pass.glm.contrast("interaction").is_ok());
    let z = &pass.glm.contrast("between").unwrap().z_score;
    assert!(z.data[z.index(5, 5, 5)] > 3.0);
    assert!(!pass.fpr.table.is_empty());
}

#[test]
fn test_group_by_session_rejects_unpaired_maps() {
    let mut study = Study::new();
    study.cfg.sessions = SESSIONS.iter().map(|s| s.to_string()).collect();
    write_session_maps(&study.layout(), &SESSIONS, 0.3, 2.0);
    // sub-patient03 keeps its pre map only: the group still has an even count
    // once sub-patient04 loses its pre map
    let layout = study.layout();
    std::fs::remove_file(group_map(&layout, "sub-patient03", "ses-post", GROUP1)).unwrap();
    std::fs::remove_file(group_map(&layout, "sub-patient04", "ses-pre", GROUP1)).unwrap();

    let mut opts = AnalysisOptions::default();
    opts.design = DesignOptions { group_by_session: true, ..Default::default() };
    let ctx = context(&study, opts);
    match run_second_level(&ctx) {
        Err(FcError::Shape(msg)) => assert!(msg.contains("sub-patient03") && msg.contains("sub-patient04")),
        other => panic!("expected a shape error, got {:?}", other.map(|o| o.len())),
    }
}

#[test]
fn test_permutation_within_group_mask_is_union() {
    let study = Study::new();
    write_session_maps(&study.layout(), &[common::SES], 1.0, 2.0);
    let opts = AnalysisOptions { n_perm: 99, n_jobs: 2, use_within_group_mask: true, ..Default::default() };
    let ctx = context(&study, opts);
    let metric = ctx.layout.cfg.metrics[0].clone();

    let res = non_parametric_analysis(&ctx, SEED, &metric).unwrap();
    let mask = res.mask.as_ref().unwrap();
    assert!(mask.data.iter().all(|&v| v == 0.0 || v == 1.0));
    assert_eq!(mask.data[mask.index(5, 5, 5)], 1.0);
    assert!(mask.data.iter().enumerate().all(|(idx, &v)| v == 0.0 || !on_border(mask, idx)));

    // between-group test ran inside that mask
    let p = &res.neg_log_pvals;
    assert!(p.data[p.index(5, 5, 5)] > 1.3);
    assert!(p.data.iter().zip(&mask.data).all(|(&p, &m)| m != 0.0 || p == 0.0));
}
