//! Design matrices, contrasts and FSL VEST files for group comparisons
//!
//! Row order is always group1 then group2; with sessions it is
//! group1-pre, group1-post, group2-pre, group2-post.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use nalgebra::DMatrix;

use crate::error::{FcError, Result};

/// A design matrix with named columns
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    pub columns: Vec<String>,
    pub data: DMatrix<f64>,
}

impl DesignMatrix {
    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let c = self.columns.iter().position(|n| n == name)?;
        Some(self.data.column(c).iter().copied().collect())
    }

    /// Rows as integers (designs are 0/1 indicator matrices)
    pub fn to_int_rows(&self) -> Vec<Vec<i64>> {
        (0..self.n_rows())
            .map(|r| self.data.row(r).iter().map(|&v| v.round() as i64).collect())
            .collect()
    }
}

/// Switches of the group-level model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesignOptions {
    pub group_by_session: bool,
    pub paired: bool,
    pub ocd_minus_hc: bool,
}

/// Two indicator columns `group1`, `group2`
pub fn two_group_design(n1: usize, n2: usize) -> DesignMatrix {
    let mut data = DMatrix::zeros(n1 + n2, 2);
    for r in 0..n1 {
        data[(r, 0)] = 1.0;
    }
    for r in n1..n1 + n2 {
        data[(r, 1)] = 1.0;
    }
    DesignMatrix { columns: vec!["group1".to_string(), "group2".to_string()], data }
}

/// Four indicator columns, one per group and session
pub fn group_by_session_design(n1: usize, n2: usize) -> DesignMatrix {
    let n = 2 * (n1 + n2);
    let mut data = DMatrix::zeros(n, 4);
    let blocks = [(0, n1), (n1, 2 * n1), (2 * n1, 2 * n1 + n2), (2 * n1 + n2, n)];
    for (c, &(start, end)) in blocks.iter().enumerate() {
        for r in start..end {
            data[(r, c)] = 1.0;
        }
    }
    DesignMatrix {
        columns: ["group1_pre", "group1_post", "group2_pre", "group2_post"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        data,
    }
}

/// One column per map (identity), for FSL's paired analysis
pub fn paired_design(n1: usize, n2: usize) -> DesignMatrix {
    let n = 2 * (n1 + n2);
    DesignMatrix {
        columns: (0..n).map(|i| i.to_string()).collect(),
        data: DMatrix::identity(n, n),
    }
}

/// Design matrix for `n1` group1 and `n2` group2 subjects
pub fn create_design_matrix(n1: usize, n2: usize, opts: &DesignOptions) -> DesignMatrix {
    if opts.group_by_session {
        if opts.paired {
            paired_design(n1, n2)
        } else {
            group_by_session_design(n1, n2)
        }
    } else {
        two_group_design(n1, n2)
    }
}

/// Contrasts, F-tests and exchangeability blocks for FSL randomise
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastSet {
    pub t_contrasts: Vec<Vec<i64>>,
    pub f_tests: Vec<Vec<i64>>,
    /// 1-based exchangeability block per map; pre and post of a subject share one
    pub blocks: Vec<i64>,
    pub suffix: String,
}

fn ones(n: usize, v: i64) -> impl Iterator<Item = i64> {
    std::iter::repeat(v).take(n)
}

pub fn create_contrast_vector(n1: usize, n2: usize, opts: &DesignOptions) -> ContrastSet {
    let mut suffix = String::new();
    let direction = if opts.ocd_minus_hc { "_OCD_minus_HC" } else { "_HC_minus_OCD" };

    if opts.group_by_session {
        suffix.push_str(direction);
        let (t_contrasts, f_tests): (Vec<Vec<i64>>, Vec<Vec<i64>>) = if opts.paired {
            suffix.push_str("_paired");
            let group: Vec<i64> = ones(2 * n1, 1).chain(ones(2 * n2, -1)).collect();
            let session: Vec<i64> = ones(n1, 1)
                .chain(ones(n1, -1))
                .chain(ones(n2, 1))
                .chain(ones(n2, -1))
                .collect();
            let interaction: Vec<i64> = ones(n1, 1)
                .chain(ones(n1, -1))
                .chain(ones(n2, -1))
                .chain(ones(n2, 1))
                .collect();
            // one F-test per t-contrast
            let f_tests: Vec<Vec<i64>> = (0..3)
                .map(|i| (0..3).map(|j| i64::from(i == j)).collect())
                .collect();
            (vec![group, session, interaction], f_tests)
        } else {
            (
                vec![
                    vec![1, 1, -1, -1],
                    vec![1, -1, 1, -1],
                    vec![1, -1, -1, 1],
                    vec![1, -1, 0, 0],
                    vec![0, 0, 1, -1],
                ],
                vec![
                    vec![1, 0, 0, 0, 0],
                    vec![0, 1, 0, 0, 0],
                    vec![0, 0, 1, 0, 0],
                    vec![0, 0, 0, 1, -1],
                ],
            )
        };
        let subj_ids = |start: usize, n: usize| (start..start + n).map(|i| i as i64 + 1);
        let blocks: Vec<i64> = subj_ids(0, n1)
            .chain(subj_ids(0, n1))
            .chain(subj_ids(n1, n2))
            .chain(subj_ids(n1, n2))
            .collect();
        suffix.push_str("_Ftest_group_by_session");
        ContrastSet { t_contrasts, f_tests, blocks, suffix }
    } else {
        let t = if opts.ocd_minus_hc { vec![-1, 1] } else { vec![1, -1] };
        suffix.push_str(direction);
        suffix.push_str("_Ftest");
        ContrastSet {
            t_contrasts: vec![t],
            f_tests: vec![vec![1]],
            blocks: (1..=(n1 + n2) as i64).collect(),
            suffix,
        }
    }
}

/// Whitespace separated integer matrix, one row per line
pub fn format_text_matrix(rows: &[Vec<i64>]) -> String {
    let mut out = String::new();
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        let _ = writeln!(out, "{}", line.join(" "));
    }
    out
}

/// FSL VEST format (`/NumWaves`, `/NumPoints`, `/Matrix`)
pub fn format_vest(rows: &[Vec<i64>]) -> Result<String> {
    let n_waves = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != n_waves) {
        return Err(FcError::Shape("ragged matrix cannot be written as VEST".to_string()));
    }
    let mut out = String::new();
    let _ = writeln!(out, "/NumWaves\t{}", n_waves);
    let _ = writeln!(out, "/NumPoints\t{}", rows.len());
    out.push_str("/Matrix\n");
    out.push_str(&format_text_matrix(rows));
    Ok(out)
}

pub fn write_text_matrix(path: &Path, rows: &[Vec<i64>]) -> Result<()> {
    fs::write(path, format_text_matrix(rows))?;
    Ok(())
}

pub fn write_vest(path: &Path, rows: &[Vec<i64>]) -> Result<()> {
    fs::write(path, format_vest(rows)?)?;
    Ok(())
}

/// Column vector as VEST rows
pub fn column_rows(values: &[i64]) -> Vec<Vec<i64>> {
    values.iter().map(|&v| vec![v]).collect()
}
