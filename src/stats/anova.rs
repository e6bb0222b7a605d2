//! Mixed-design ANOVA (one between-subject and one within-subject factor)
//! and the matching pairwise t-tests

use std::collections::BTreeMap;
use std::fmt::Write as _;

use log::warn;

use crate::error::{FcError, Result};
use crate::stats::dist::f_sf_pair;
use crate::stats::univariate::{mean, ttest_ind, ttest_rel};

/// One observation in long format
#[derive(Debug, Clone, PartialEq)]
pub struct LongRecord {
    pub subject: String,
    pub between: String,
    pub within: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnovaRow {
    pub source: String,
    pub ss: f64,
    pub df1: f64,
    pub df2: f64,
    pub ms: f64,
    pub f: f64,
    pub p_unc: f64,
    /// Partial eta squared
    pub np2: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseRow {
    pub contrast: String,
    /// Within level for interaction rows
    pub level: Option<String>,
    pub a: String,
    pub b: String,
    pub paired: bool,
    pub t: f64,
    pub dof: f64,
    pub p_unc: f64,
}

fn levels<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in values {
        if !out.iter().any(|l| l == v) {
            out.push(v.to_string());
        }
    }
    out
}

/// Subjects with a value at every within level: subject -> (between, values by within level)
struct Balanced {
    within: Vec<String>,
    between: Vec<String>,
    subjects: BTreeMap<String, (String, Vec<f64>)>,
}

fn balance(data: &[LongRecord]) -> Result<Balanced> {
    let within = levels(data.iter().map(|r| r.within.as_str()));
    let between = levels(data.iter().map(|r| r.between.as_str()));
    let mut cells: BTreeMap<String, (String, Vec<Option<f64>>)> = BTreeMap::new();
    for r in data.iter().filter(|r| !r.value.is_nan()) {
        let w = within.iter().position(|l| *l == r.within).unwrap_or(0);
        let entry = cells
            .entry(r.subject.clone())
            .or_insert_with(|| (r.between.clone(), vec![None; within.len()]));
        entry.1[w] = Some(r.value);
    }
    let n_before = cells.len();
    let subjects: BTreeMap<String, (String, Vec<f64>)> = cells
        .into_iter()
        .filter_map(|(s, (g, vals))| {
            let complete: Option<Vec<f64>> = vals.into_iter().collect();
            complete.map(|v| (s, (g, v)))
        })
        .collect();
    if subjects.len() < n_before {
        warn!("{} subjects with missing sessions left out of the mixed ANOVA", n_before - subjects.len());
    }
    if within.len() < 2 || between.len() < 2 {
        return Err(FcError::Stats("mixed ANOVA needs two levels of each factor".to_string()));
    }
    Ok(Balanced { within, between, subjects })
}

/// Split-plot ANOVA table: between factor, within factor, interaction
pub fn mixed_anova(data: &[LongRecord], between_name: &str, within_name: &str) -> Result<Vec<AnovaRow>> {
    let b = balance(data)?;
    let k = b.within.len();
    let n_subj = b.subjects.len();
    let n_groups = b.between.len();
    if n_subj <= n_groups {
        return Err(FcError::Stats("not enough complete subjects for a mixed ANOVA".to_string()));
    }

    let all: Vec<f64> = b.subjects.values().flat_map(|(_, v)| v.iter().copied()).collect();
    let grand = mean(&all);
    let ss_total: f64 = all.iter().map(|v| (v - grand).powi(2)).sum();

    let group_members = |g: &str| -> Vec<&Vec<f64>> {
        b.subjects.values().filter(|(sg, _)| sg == g).map(|(_, v)| v).collect()
    };

    let mut ss_between = 0.0;
    let mut ss_subjects_in_groups = 0.0;
    let mut ss_cells = 0.0;
    for g in &b.between {
        let members = group_members(g);
        if members.is_empty() {
            continue;
        }
        let n_g = members.len() as f64;
        let group_mean = members.iter().map(|v| mean(v)).sum::<f64>() / n_g;
        ss_between += n_g * k as f64 * (group_mean - grand).powi(2);
        ss_subjects_in_groups += members.iter().map(|v| k as f64 * (mean(v) - group_mean).powi(2)).sum::<f64>();
        for w in 0..k {
            let cell = members.iter().map(|v| v[w]).sum::<f64>() / n_g;
            ss_cells += n_g * (cell - grand).powi(2);
        }
    }
    let ss_within: f64 = (0..k)
        .map(|w| {
            let level_mean = b.subjects.values().map(|(_, v)| v[w]).sum::<f64>() / n_subj as f64;
            n_subj as f64 * (level_mean - grand).powi(2)
        })
        .sum();
    let ss_interaction = ss_cells - ss_between - ss_within;
    let ss_error_within = ss_total - ss_between - ss_subjects_in_groups - ss_within - ss_interaction;

    let df_between = (n_groups - 1) as f64;
    let df_error_between = (n_subj - n_groups) as f64;
    let df_within = (k - 1) as f64;
    let df_interaction = df_between * df_within;
    let df_error_within = df_error_between * df_within;

    let row = |source: &str, ss: f64, df1: f64, ss_err: f64, df2: f64| -> Result<AnovaRow> {
        let ms = ss / df1;
        let ms_err = ss_err / df2;
        let f = if ms_err > 0.0 { ms / ms_err } else { f64::INFINITY };
        let (p_unc, _) = f_sf_pair(f, df1, df2)?;
        Ok(AnovaRow {
            source: source.to_string(),
            ss,
            df1,
            df2,
            ms,
            f,
            p_unc,
            np2: ss / (ss + ss_err),
        })
    };
    Ok(vec![
        row(between_name, ss_between, df_between, ss_subjects_in_groups, df_error_between)?,
        row(within_name, ss_within, df_within, ss_error_within, df_error_within)?,
        row("Interaction", ss_interaction, df_interaction, ss_error_within, df_error_within)?,
    ])
}

/// Post-hoc tests: within main effect (paired), between main effect on
/// subject means (independent) and between groups at each within level
pub fn pairwise_ttests(data: &[LongRecord], between_name: &str, within_name: &str) -> Result<Vec<PairwiseRow>> {
    let b = balance(data)?;
    let mut rows = Vec::new();

    for i in 0..b.within.len() {
        for j in i + 1..b.within.len() {
            let a: Vec<f64> = b.subjects.values().map(|(_, v)| v[i]).collect();
            let c: Vec<f64> = b.subjects.values().map(|(_, v)| v[j]).collect();
            let r = ttest_rel(&a, &c)?;
            rows.push(PairwiseRow {
                contrast: within_name.to_string(),
                level: None,
                a: b.within[i].clone(),
                b: b.within[j].clone(),
                paired: true,
                t: r.statistic,
                dof: r.dof,
                p_unc: r.p_value,
            });
        }
    }

    let by_group = |g: &str, pick: &dyn Fn(&Vec<f64>) -> f64| -> Vec<f64> {
        b.subjects.values().filter(|(sg, _)| sg == g).map(|(_, v)| pick(v)).collect()
    };
    let mut between_pair = |contrast: String, level: Option<String>, pick: &dyn Fn(&Vec<f64>) -> f64| -> Result<()> {
        for i in 0..b.between.len() {
            for j in i + 1..b.between.len() {
                let r = ttest_ind(&by_group(&b.between[i], pick), &by_group(&b.between[j], pick))?;
                rows.push(PairwiseRow {
                    contrast: contrast.clone(),
                    level: level.clone(),
                    a: b.between[i].clone(),
                    b: b.between[j].clone(),
                    paired: false,
                    t: r.statistic,
                    dof: r.dof,
                    p_unc: r.p_value,
                });
            }
        }
        Ok(())
    };
    between_pair(between_name.to_string(), None, &|v: &Vec<f64>| mean(v))?;
    for (w, level) in b.within.iter().enumerate() {
        between_pair(
            format!("{} * {}", within_name, between_name),
            Some(level.clone()),
            &move |v: &Vec<f64>| v[w],
        )?;
    }
    Ok(rows)
}

/// Plain-text table with right-aligned columns
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }
    let mut out = String::new();
    let line = |cells: Vec<&str>, out: &mut String| {
        let padded: Vec<String> = cells.iter().zip(&widths).map(|(c, w)| format!("{:>w$}", c, w = w)).collect();
        let _ = writeln!(out, "{}", padded.join("  "));
    };
    line(headers.to_vec(), &mut out);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let _ = writeln!(out, "{}", rule.join("  "));
    for row in rows {
        line(row.iter().map(String::as_str).collect(), &mut out);
    }
    out
}

pub fn format_anova(rows: &[AnovaRow]) -> String {
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.source.clone(),
                format!("{:.3}", r.ss),
                format!("{}", r.df1),
                format!("{}", r.df2),
                format!("{:.3}", r.ms),
                format!("{:.3}", r.f),
                format!("{:.3}", r.p_unc),
                format!("{:.3}", r.np2),
            ]
        })
        .collect();
    format_table(&["Source", "SS", "DF1", "DF2", "MS", "F", "p-unc", "np2"], &body)
}

pub fn format_pairwise(rows: &[PairwiseRow]) -> String {
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.contrast.clone(),
                r.level.clone().unwrap_or_else(|| "-".to_string()),
                r.a.clone(),
                r.b.clone(),
                r.paired.to_string(),
                format!("{:.3}", r.t),
                format!("{}", r.dof),
                format!("{:.3}", r.p_unc),
            ]
        })
        .collect();
    format_table(&["Contrast", "Level", "A", "B", "Paired", "T", "dof", "p-unc"], &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subject: &str, between: &str, within: &str, value: f64) -> LongRecord {
        LongRecord {
            subject: subject.to_string(),
            between: between.to_string(),
            within: within.to_string(),
            value,
        }
    }

    fn dataset() -> Vec<LongRecord> {
        let mut data = Vec::new();
        // group1 drops from pre to post, group2 stays
        for (s, pre, post) in [("s1", 10.0, 6.0), ("s2", 12.0, 7.0), ("s3", 11.0, 7.5)] {
            data.push(record(s, "group1", "ses-pre", pre));
            data.push(record(s, "group1", "ses-post", post));
        }
        for (s, pre, post) in [("s4", 11.0, 10.5), ("s5", 10.0, 10.0), ("s6", 12.0, 11.0)] {
            data.push(record(s, "group2", "ses-pre", pre));
            data.push(record(s, "group2", "ses-post", post));
        }
        data
    }

    #[test]
    fn test_mixed_anova_partition() {
        let data = dataset();
        let table = mixed_anova(&data, "group", "ses").unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].df1, 1.0);
        assert_eq!(table[0].df2, 4.0);
        assert_eq!(table[2].df2, 4.0);

        // sums of squares add up to the total
        let values: Vec<f64> = data.iter().map(|r| r.value).collect();
        let grand = mean(&values);
        let ss_total: f64 = values.iter().map(|v| (v - grand).powi(2)).sum();
        let explained: f64 = table.iter().map(|r| r.ss).sum();
        let ss_err_b = table[0].ss * (1.0 / table[0].np2 - 1.0);
        let ss_err_w = table[1].ss * (1.0 / table[1].np2 - 1.0);
        assert!((explained + ss_err_b + ss_err_w - ss_total).abs() < 1e-9);

        assert!(table[1].p_unc < 0.05);
        assert!(table[2].p_unc < 0.05);
    }

    #[test]
    fn test_incomplete_subject_dropped() {
        let mut data = dataset();
        data.push(record("s7", "group2", "ses-pre", 30.0));
        let with_extra = mixed_anova(&data, "group", "ses").unwrap();
        let without = mixed_anova(&dataset(), "group", "ses").unwrap();
        assert_eq!(with_extra, without);
    }

    #[test]
    fn test_pairwise_rows() {
        let rows = pairwise_ttests(&dataset(), "group", "ses").unwrap();
        // within, between, between at each of two sessions
        assert_eq!(rows.len(), 4);
        assert!(rows[0].paired);
        assert_eq!(rows[0].a, "ses-pre");
        assert_eq!(rows[2].level.as_deref(), Some("ses-pre"));
        assert_eq!(rows[3].contrast, "ses * group");
        let text = format_pairwise(&rows);
        assert!(text.lines().count() == 6);
        assert!(format_anova(&mixed_anova(&dataset(), "group", "ses").unwrap()).contains("Interaction"));
    }

    #[test]
    fn test_single_level_rejected() {
        let data = vec![record("s1", "g", "pre", 1.0), record("s2", "g", "pre", 2.0)];
        assert!(mixed_anova(&data, "group", "ses").is_err());
    }
}
