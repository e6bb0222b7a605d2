//! Connectivity in the stimulation VOI and the ALFF reports

use std::fmt::Write as _;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::{write_csv, AnalysisContext};
use crate::connectivity::AlffRecord;
use crate::error::{FcError, Result};
use crate::plot::{named_color, save_figure, ChartGrid, ChartOptions, ChartPanel, Observation, PanelKind};
use crate::stats::univariate::{cohen_d, ttest_ind};
use crate::study::{GroupTable, GROUP1, GROUP2};
use crate::volume::Volume;

/// Session label of the difference rows
pub const PRE_POST: &str = "pre-post";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiCorrRecord {
    pub subj: String,
    pub ses: String,
    pub metric: String,
    pub atlas: String,
    pub fwhm: String,
    pub group: String,
    pub pathway: String,
    pub corr: f64,
}

pub fn pathway_name(seed: &str) -> String {
    format!("{}_to_stim", seed)
}

/// Mean of the non-zero values of `corr` inside `mask`, NaN if there are none
pub fn voi_mean(corr: &Volume, mask: &Volume) -> Result<f64> {
    let mask = mask.resample_nearest(corr)?;
    let (sum, n) = corr
        .data
        .iter()
        .zip(&mask.data)
        .map(|(c, m)| c * m)
        .filter(|v| *v != 0.0 && v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    Ok(if n == 0 { f64::NAN } else { sum / n as f64 })
}

/// Mean FC in the stimulation VOI for every subject, session and seed,
/// followed by a pre minus post row per subject and seed
pub fn compute_voi_corr(ctx: &AnalysisContext) -> Result<Vec<VoiCorrRecord>> {
    let cfg = ctx.layout.cfg;
    let fwhm = ctx.layout.fwhm_tag();
    let voi_mask = Volume::load(&cfg.proj_path(&cfg.stim_voi_mask))?;
    let pre_ses = cfg
        .sessions
        .first()
        .ok_or_else(|| FcError::Config("no sessions configured".to_string()))?;

    let mut records = Vec::new();
    for atlas in &cfg.atlases {
        for metric in &cfg.metrics {
            for subj in &ctx.subjs {
                let Some(group) = ctx.groups.group_of(subj) else {
                    warn!("{} not in group list, removed it", subj);
                    continue;
                };
                for seed in cfg.merged_seeds() {
                    let row = |ses: &str, corr: f64| VoiCorrRecord {
                        subj: subj.clone(),
                        ses: ses.to_string(),
                        metric: metric.clone(),
                        atlas: atlas.clone(),
                        fwhm: fwhm.clone(),
                        group: group.to_string(),
                        pathway: pathway_name(&seed),
                        corr,
                    };
                    let (mut pre, mut post) = (None, None);
                    for ses in &cfg.sessions {
                        let path = ctx.layout.group_map_file(subj, ses, metric, atlas, &seed, group);
                        if !path.exists() {
                            warn!("missing {}", path.display());
                            continue;
                        }
                        let corr = voi_mean(&Volume::load(&path)?, &voi_mask)?;
                        records.push(row(ses, corr));
                        if ses == pre_ses {
                            pre = Some(corr);
                        } else {
                            post = Some(corr);
                        }
                    }
                    if let (Some(pre), Some(post)) = (pre, post) {
                        records.push(row(PRE_POST, pre - post));
                    }
                }
            }
        }
    }
    info!("{} seed to VOI values", records.len());
    if ctx.opts.save_outputs {
        write_csv(&ctx.layout.voi_corr_table(), &records)?;
    }
    Ok(records)
}

pub fn read_voi_corr(path: &Path) -> Result<Vec<VoiCorrRecord>> {
    if !path.exists() {
        return Err(FcError::MissingInput(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    reader.deserialize().map(|r| r.map_err(FcError::from)).collect()
}

/// Group comparison of the pre minus post VOI connectivity
pub fn print_voi_stats(ctx: &AnalysisContext, records: &[VoiCorrRecord]) -> String {
    let cfg = ctx.layout.cfg;
    let fwhm = ctx.layout.fwhm_tag();
    let mut out = String::from("Seed to VOI statistics:\n-------------------------\n");
    for atlas in &cfg.atlases {
        for metric in &cfg.metrics {
            for seed in cfg.merged_seeds() {
                let key = pathway_name(&seed);
                let values = |group: &str| -> Vec<f64> {
                    records
                        .iter()
                        .filter(|r| {
                            r.group == group
                                && &r.atlas == atlas
                                && &r.metric == metric
                                && r.pathway == key
                                && r.ses == PRE_POST
                        })
                        .map(|r| r.corr)
                        .collect()
                };
                let (g1, g2) = (values(GROUP1), values(GROUP2));
                match ttest_ind(&g1, &g2).and_then(|t| Ok((t, cohen_d(&g1, &g2)?))) {
                    Ok((t, d)) => {
                        let _ = writeln!(
                            out,
                            "{} {} {} {}   T={:.3}   p={:.3}   cohen's d={:.2}",
                            atlas, metric, fwhm, key, t.statistic, t.p_value, d
                        );
                    }
                    Err(e) => warn!("{} {} {}: {}", atlas, metric, key, e),
                }
            }
        }
    }
    info!("{}", out);
    out
}

fn grey_palette() -> Vec<plotters::style::RGBColor> {
    ["lightgrey", "darkgrey"].iter().filter_map(|c| named_color(c)).collect()
}

/// Group difference, pre-post difference and session-by-group bars, one row per seed
pub fn voi_corr_chart(records: &[VoiCorrRecord], seeds: &[String]) -> ChartGrid {
    let mut panels = Vec::new();
    for seed in seeds {
        let key = &pathway_name(seed);
        let of_seed = || records.iter().filter(move |r| &r.pathway == key);
        let sessions: Vec<Observation> = of_seed()
            .filter(|r| r.ses != PRE_POST)
            .map(|r| Observation::new(&r.pathway, &r.group, r.corr))
            .collect();
        let diff: Vec<Observation> = of_seed()
            .filter(|r| r.ses == PRE_POST)
            .map(|r| Observation::new(&r.pathway, &r.group, r.corr))
            .collect();
        let by_group: Vec<Observation> = of_seed()
            .filter(|r| r.ses != PRE_POST)
            .map(|r| Observation::new(&r.group, &r.ses, r.corr))
            .collect();
        let opts = |title: Option<String>| ChartOptions {
            title,
            y_label: Some("corr".to_string()),
            palette: grey_palette(),
            ..Default::default()
        };
        panels.push(ChartPanel { kind: PanelKind::Bar(sessions), opts: opts(Some(format!("{} - group difference", seed))) });
        panels.push(ChartPanel { kind: PanelKind::Bar(diff), opts: opts(Some(format!("{} - pre-post difference", seed))) });
        panels.push(ChartPanel { kind: PanelKind::Bar(by_group), opts: opts(None) });
    }
    ChartGrid::new(seeds.len(), 3, panels)
}

pub fn plot_voi_corr(ctx: &AnalysisContext, records: &[VoiCorrRecord]) -> Result<()> {
    let fig = voi_corr_chart(records, &ctx.layout.cfg.merged_seeds());
    save_figure(&fig, &ctx.figure_path("seed_to_stim_VOI_5mm_group_by_session.svg"))
}

/// ALFF record joined with the subject's group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlffSummary {
    pub subj: String,
    pub ses: String,
    pub group: String,
    #[serde(rename = "ALFF")]
    pub alff: f64,
    #[serde(rename = "fALFF")]
    pub falff: f64,
}

/// Inner join of the ALFF records with the group table
pub fn summarize_alff(records: &[AlffRecord], groups: &GroupTable) -> Vec<AlffSummary> {
    records
        .iter()
        .filter_map(|r| {
            groups.group_of(&r.subj).map(|g| AlffSummary {
                subj: r.subj.clone(),
                ses: r.ses.clone(),
                group: g.to_string(),
                alff: r.alff,
                falff: r.falff,
            })
        })
        .collect()
}

/// Group comparison of ALFF and fALFF in each session
pub fn print_alff_stats(summary: &[AlffSummary], sessions: &[String]) -> String {
    let mut out = String::from("Stimulation site ALFF statistics:\n---------------------------------\n");
    let metrics: [(&str, fn(&AlffSummary) -> f64); 2] = [("ALFF", |s: &AlffSummary| s.alff), ("fALFF", |s: &AlffSummary| s.falff)];
    for (name, get) in metrics {
        for ses in sessions {
            let values = |group: &str| -> Vec<f64> {
                summary
                    .iter()
                    .filter(|s| s.group == group && &s.ses == ses)
                    .map(get)
                    .collect()
            };
            let (g1, g2) = (values(GROUP1), values(GROUP2));
            match ttest_ind(&g1, &g2) {
                Ok(t) => {
                    let _ = writeln!(out, "{} {}   T={:.3}   p={:.3}", name, ses, t.statistic, t.p_value);
                }
                Err(e) => warn!("{} {}: {}", name, ses, e),
            }
        }
    }
    info!("{}", out);
    out
}

/// fALFF and ALFF by group and by session
pub fn alff_chart(summary: &[AlffSummary]) -> ChartGrid {
    let mut panels = Vec::new();
    let metrics: [(&str, fn(&AlffSummary) -> f64); 2] = [("fALFF", |s: &AlffSummary| s.falff), ("ALFF", |s: &AlffSummary| s.alff)];
    for (name, get) in metrics {
        let by_group = summary.iter().map(|s| Observation::new(&s.group, &s.ses, get(s))).collect();
        let by_ses = summary.iter().map(|s| Observation::new(&s.ses, &s.group, get(s))).collect();
        let opts = ChartOptions { y_label: Some(name.to_string()), ..Default::default() };
        panels.push(ChartPanel { kind: PanelKind::Strip(by_group), opts: opts.clone() });
        panels.push(ChartPanel { kind: PanelKind::Strip(by_ses), opts });
    }
    ChartGrid { panel_size: (500, 400), ..ChartGrid::new(2, 2, panels) }
}

pub fn plot_alff(ctx: &AnalysisContext, summary: &[AlffSummary]) -> Result<()> {
    save_figure(&alff_chart(summary), &ctx.figure_path("stim_site_ALFF.svg"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(data: Vec<f64>) -> Volume {
        let affine = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        Volume::new(data, (4, 1, 1), (1.0, 1.0, 1.0), affine).unwrap()
    }

    #[test]
    fn test_voi_mean_ignores_zeros() {
        let corr = vol(vec![0.2, 0.0, 0.4, 0.9]);
        let mask = vol(vec![1.0, 1.0, 1.0, 0.0]);
        assert!((voi_mean(&corr, &mask).unwrap() - 0.3).abs() < 1e-12);
        assert!(voi_mean(&corr, &vol(vec![0.0; 4])).unwrap().is_nan());
    }

    #[test]
    fn test_summarize_alff_drops_unknown_subjects() {
        let rec = |subj: &str| AlffRecord {
            subj: subj.into(),
            ses: "ses-pre".into(),
            stim_x: 0.0,
            stim_y: 0.0,
            stim_z: 0.0,
            alff: 1.0,
            falff: 0.01,
        };
        let groups = GroupTable::from_pairs(&[("sub-01", "group1")]);
        let summary = summarize_alff(&[rec("sub-01"), rec("sub-02")], &groups);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].group, "group1");
    }

    #[test]
    fn test_alff_stats_lines() {
        let s = |subj: &str, group: &str, alff: f64| AlffSummary {
            subj: subj.into(),
            ses: "ses-pre".into(),
            group: group.into(),
            alff,
            falff: alff / 100.0,
        };
        let summary = vec![
            s("a", "group1", 1.0),
            s("b", "group1", 1.2),
            s("c", "group1", 1.1),
            s("d", "group2", 2.0),
            s("e", "group2", 2.2),
            s("f", "group2", 2.1),
        ];
        let out = print_alff_stats(&summary, &["ses-pre".to_string(), "ses-post".to_string()]);
        assert!(out.contains("ALFF ses-pre   T=-"));
        assert!(out.contains("fALFF ses-pre"));
        // no post data, no line
        assert!(!out.contains("ses-post"));
    }

    #[test]
    fn test_voi_chart_panels() {
        let rec = |ses: &str, group: &str, corr: f64| VoiCorrRecord {
            subj: "sub-01".into(),
            ses: ses.into(),
            metric: "gsr".into(),
            atlas: "Harrison2009".into(),
            fwhm: "brainFWHM8mm".into(),
            group: group.into(),
            pathway: pathway_name("Acc"),
            corr,
        };
        let records = vec![rec("ses-pre", "group1", 0.3), rec("ses-post", "group1", 0.1), rec(PRE_POST, "group1", 0.2)];
        let grid = voi_corr_chart(&records, &["Acc".to_string()]);
        assert_eq!(grid.panels.len(), 3);
        match (&grid.panels[0].kind, &grid.panels[1].kind, &grid.panels[2].kind) {
            (PanelKind::Bar(a), PanelKind::Bar(b), PanelKind::Bar(c)) => {
                assert_eq!(a.len(), 2);
                assert_eq!(b.len(), 1);
                assert_eq!(c[0].x, "group1");
                assert_eq!(c[0].hue, "ses-pre");
            }
            _ => panic!("expected bar panels"),
        }
    }
}
